// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Retries
//!
//! How often and how fast a silo tries its seeds again while joining.
//! A `RetryPolicy` comes from the configuration and builds a fresh
//! `Retries` counter for every join attempt.
//!

use serde::{Deserialize, Serialize};

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Duration,
};

use backoff::backoff::Backoff as InnerBackoff;

/// Pace of a retry loop.
pub trait RetryStrategy: Debug + Send + Sync {
    /// Retries allowed after the first attempt.
    fn max_retries(&self) -> usize;
    /// Pause before the next retry. `None` retries at once.
    fn next_backoff(&mut self) -> Option<Duration>;
}

/// Counts the retries of one loop against its strategy.
#[derive(Debug)]
pub struct Retries {
    strategy: Box<dyn RetryStrategy>,
    attempts: usize,
}

impl Retries {
    pub fn new(strategy: Box<dyn RetryStrategy>) -> Self {
        Self {
            strategy,
            attempts: 0,
        }
    }

    /// Retries consumed so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Waits for the next retry. Returns false, without waiting, once
    /// `max_retries` retries were consumed.
    pub async fn wait(&mut self) -> bool {
        if self.attempts >= self.strategy.max_retries() {
            return false;
        }
        self.attempts += 1;
        if let Some(delay) = self.strategy.next_backoff() {
            tokio::time::sleep(delay).await;
        }
        true
    }
}

/// Serializable choice of retry strategy, as found in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Retry immediately.
    NoInterval { max_retries: usize },
    /// Wait a fixed period between attempts.
    FixedInterval {
        max_retries: usize,
        interval: Duration,
    },
    /// Wait an exponentially growing period between attempts.
    ExponentialBackoff { max_retries: usize },
}

impl RetryPolicy {
    /// Retry counter for one loop.
    pub fn retries(&self) -> Retries {
        Retries::new(self.strategy())
    }

    pub fn strategy(&self) -> Box<dyn RetryStrategy> {
        match self {
            RetryPolicy::NoInterval { max_retries } => {
                Box::new(NoIntervalStrategy::new(*max_retries))
            }
            RetryPolicy::FixedInterval {
                max_retries,
                interval,
            } => Box::new(FixedIntervalStrategy::new(*max_retries, *interval)),
            RetryPolicy::ExponentialBackoff { max_retries } => {
                Box::new(ExponentialBackoffStrategy::new(*max_retries))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::ExponentialBackoff { max_retries: 10 }
    }
}

/// Retries at once.
#[derive(Debug, Default)]
pub struct NoIntervalStrategy {
    max_retries: usize,
}

impl NoIntervalStrategy {
    pub fn new(max_retries: usize) -> Self {
        NoIntervalStrategy { max_retries }
    }
}

impl RetryStrategy for NoIntervalStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }
}

/// Waits the same period before every retry.
#[derive(Debug, Default)]
pub struct FixedIntervalStrategy {
    max_retries: usize,
    duration: Duration,
}

impl FixedIntervalStrategy {
    pub fn new(max_retries: usize, duration: Duration) -> Self {
        FixedIntervalStrategy {
            max_retries,
            duration,
        }
    }
}

impl RetryStrategy for FixedIntervalStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.duration)
    }
}

/// Doubles the pause, with jitter, from 100 ms up to 5 s.
#[derive(Debug, Default)]
pub struct ExponentialBackoffStrategy {
    max_retries: usize,
    inner: Arc<Mutex<backoff::ExponentialBackoff>>,
}

impl ExponentialBackoffStrategy {
    pub fn new(max_retries: usize) -> Self {
        let inner = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: None,
            ..Default::default()
        };
        ExponentialBackoffStrategy {
            max_retries,
            inner: Arc::new(Mutex::new(inner)),
        }
    }
}

impl RetryStrategy for ExponentialBackoffStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.inner.lock().ok().and_then(|mut eb| eb.next_backoff())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_no_interval_strategy() {
        let mut strategy = NoIntervalStrategy::new(3);
        assert_eq!(strategy.max_retries(), 3);
        assert_eq!(strategy.next_backoff(), None);
    }

    #[test]
    fn test_fixed_interval_strategy() {
        let mut strategy =
            FixedIntervalStrategy::new(3, Duration::from_secs(1));
        assert_eq!(strategy.max_retries(), 3);
        assert_eq!(strategy.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_exponential_backoff_strategy() {
        let mut strategy = ExponentialBackoffStrategy::new(3);
        assert_eq!(strategy.max_retries(), 3);
        let first = strategy.next_backoff().unwrap();
        assert!(first <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retries_stop_at_max() {
        let mut retries = RetryPolicy::NoInterval { max_retries: 2 }.retries();
        assert!(retries.wait().await);
        assert!(retries.wait().await);
        assert!(!retries.wait().await);
        assert_eq!(retries.attempts(), 2);

        let mut retries = RetryPolicy::FixedInterval {
            max_retries: 1,
            interval: Duration::from_millis(20),
        }
        .retries();
        let started = tokio::time::Instant::now();
        assert!(retries.wait().await);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(!retries.wait().await);
    }

    #[tokio::test]
    async fn test_zero_retries_never_waits() {
        let mut retries = RetryPolicy::ExponentialBackoff { max_retries: 0 }.retries();
        assert!(!retries.wait().await);
        assert_eq!(retries.attempts(), 0);
    }

    #[test]
    fn test_policy_builds_strategy() {
        let policy = RetryPolicy::FixedInterval {
            max_retries: 4,
            interval: Duration::from_millis(10),
        };
        let mut strategy = policy.strategy();
        assert_eq!(strategy.max_retries(), 4);
        assert_eq!(strategy.next_backoff(), Some(Duration::from_millis(10)));
        assert_eq!(RetryPolicy::default().strategy().max_retries(), 10);
    }
}
