// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Membership event sink
//!
//! Runs a subscriber in its own task and feeds it the membership events of
//! a silo. Events missed by a lagging sink are skipped; the subscriber can
//! always read the latest view from the silo.
//!

use crate::membership::MembershipEvent;

use async_trait::async_trait;
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Receives membership events.
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    async fn notify(&self, event: MembershipEvent);
}

/// Delivers membership events to a subscriber.
pub struct Sink {
    subscriber: Box<dyn Subscriber>,
    events: Receiver<MembershipEvent>,
}

impl Sink {
    pub fn new(events: Receiver<MembershipEvent>, subscriber: impl Subscriber) -> Self {
        Sink {
            subscriber: Box::new(subscriber),
            events,
        }
    }

    /// Processes events until the channel closes or `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = self.events.recv() => event,
            };
            match event {
                Ok(event) => {
                    debug!("Membership event {:?}.", event);
                    self.subscriber.notify(event).await;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Membership sink lagged, {} events skipped.", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{identity::SiloAddress, membership::SiloStatus};

    use tokio::sync::{broadcast, mpsc};

    struct Forward(mpsc::UnboundedSender<MembershipEvent>);

    #[async_trait]
    impl Subscriber for Forward {
        async fn notify(&self, event: MembershipEvent) {
            let _ = self.0.send(event);
        }
    }

    #[tokio::test]
    async fn test_sink_forwards_events() {
        let (sender, receiver) = broadcast::channel(8);
        let (forward, mut forwarded) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let sink = Sink::new(receiver, Forward(forward));
        let task = tokio::spawn(sink.run(token.clone()));

        let event = MembershipEvent {
            silo: SiloAddress::new("127.0.0.1", 1000, 1),
            status: SiloStatus::Active,
            previous: Some(SiloStatus::Joining),
            version: 2,
        };
        sender.send(event.clone()).unwrap();
        assert_eq!(forwarded.recv().await, Some(event));

        token.cancel();
        task.await.unwrap();
    }
}
