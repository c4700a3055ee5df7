// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Failure detector
//!
//! Probes the silos this silo watches and turns consecutive missed probes
//! into a suspicion. Unreachable silos reported by the router count as a
//! missed probe and are probed again right away.
//!

use crate::{
    identity::SiloAddress,
    membership_service::{MembershipService, Suspicion},
    message::{SiloRequest, SiloResponse},
    messenger::Messenger,
};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Alive,
    Missed,
    /// The missed probe crossed the limit and the silo was suspected.
    Suspected(Suspicion),
}

pub struct FailureDetector {
    membership: Arc<MembershipService>,
    messenger: Arc<Messenger>,
    missed: Mutex<HashMap<SiloAddress, u32>>,
}

impl FailureDetector {
    pub fn new(membership: Arc<MembershipService>, messenger: Arc<Messenger>) -> Self {
        Self {
            membership,
            messenger,
            missed: Mutex::new(HashMap::new()),
        }
    }

    /// Probes every watched silo once, then expires old suspicions and
    /// tombstones.
    ///
    /// When none of several watched silos answers, the local silo is the
    /// likely one cut off and nobody is suspected.
    pub async fn probe_round(&self) {
        let targets = self.membership.probe_targets();
        self.missed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|silo, _| targets.contains(silo));
        let answers = join_all(targets.iter().map(|target| self.ping(target))).await;
        if targets.len() > 1 && answers.iter().all(|alive| !alive) {
            warn!(
                "None of the {} watched silos answered, suspecting nobody.",
                targets.len()
            );
            return;
        }
        for (target, alive) in targets.iter().zip(answers) {
            if alive {
                self.clear_misses(target);
            } else {
                self.record_miss(target);
            }
        }
        self.membership.expire_suspects();
        self.membership.collect_tombstones();
    }

    /// Probes one silo.
    pub async fn probe(&self, target: SiloAddress) -> Probe {
        if self.ping(&target).await {
            self.clear_misses(&target);
            Probe::Alive
        } else {
            self.record_miss(&target)
        }
    }

    async fn ping(&self, target: &SiloAddress) -> bool {
        let timeout = self.membership.config().probe_timeout;
        match self
            .messenger
            .request_with_timeout(target, SiloRequest::Ping, timeout)
            .await
        {
            Ok(SiloResponse::Pong) => true,
            Ok(other) => {
                debug!("Unexpected probe response from {}: {:?}", target, other);
                false
            }
            Err(e) => {
                debug!("Probe of {} failed: {}", target, e);
                false
            }
        }
    }

    fn clear_misses(&self, target: &SiloAddress) {
        self.missed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target);
    }

    /// Router evidence that a silo did not answer.
    ///
    /// Probes the silo until it answers or gets suspected, at most
    /// `num_missed_probes_limit` times.
    pub async fn report_unreachable(&self, target: &SiloAddress) -> Probe {
        if *target == self.membership.myself()
            || self.membership.view().is_dead(target)
        {
            return Probe::Missed;
        }
        let mut outcome = self.record_miss(target);
        let limit = self.membership.config().num_missed_probes_limit;
        for _ in 0..limit {
            if outcome != Probe::Missed {
                break;
            }
            outcome = self.probe(target.clone()).await;
        }
        outcome
    }

    fn record_miss(&self, target: &SiloAddress) -> Probe {
        let limit = self.membership.config().num_missed_probes_limit.max(1);
        let count = {
            let mut missed =
                self.missed.lock().unwrap_or_else(PoisonError::into_inner);
            let count = missed.entry(target.clone()).or_insert(0);
            *count += 1;
            let value = *count;
            if value >= limit {
                missed.remove(target);
            }
            value
        };
        if count >= limit {
            Probe::Suspected(self.membership.suspect(target))
        } else {
            debug!("{} missed {} of {} probes.", target, count, limit);
            Probe::Missed
        }
    }

    /// Probes every `probe_interval`.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut interval =
            tokio::time::interval(self.membership.config().probe_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.probe_round().await,
            }
        }
        debug!("Failure detector stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MembershipConfig,
        error::Error,
        membership::{MembershipEntry, SiloStatus},
        memory_transport::InMemoryNetwork,
        transport::{RequestHandler, Transport},
    };

    use async_trait::async_trait;

    use std::{sync::Weak, time::Duration};

    struct Pong;

    #[async_trait]
    impl RequestHandler for Pong {
        async fn handle(&self, _from: SiloAddress, _request: SiloRequest) -> SiloResponse {
            SiloResponse::Pong
        }
    }

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new("127.0.0.1", port, 1)
    }

    fn detector(network: &InMemoryNetwork, peers: &[u16]) -> FailureDetector {
        let config = MembershipConfig {
            num_missed_probes_limit: 2,
            probe_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let membership = Arc::new(MembershipService::new(silo(1), config, 30));
        membership.start_joining(0);
        membership.set_own_status(SiloStatus::Active);
        membership.apply(
            peers
                .iter()
                .map(|port| {
                    MembershipEntry::joining(silo(*port), 0, 0)
                        .with_status(SiloStatus::Active, 0)
                })
                .collect(),
        );
        let local: Weak<dyn RequestHandler> = Weak::<Pong>::new();
        let messenger = Arc::new(Messenger::new(
            membership.clone(),
            Arc::new(network.clone()),
            local,
            Duration::from_secs(1),
        ));
        FailureDetector::new(membership, messenger)
    }

    async fn bind(network: &InMemoryNetwork, port: u16) -> Result<(), Error> {
        network.bind(silo(port), Arc::new(Pong)).await
    }

    #[tokio::test]
    async fn test_missed_probes_lead_to_suspicion() {
        let network = InMemoryNetwork::new();
        bind(&network, 2).await.unwrap();
        bind(&network, 3).await.unwrap();
        let detector = detector(&network, &[2, 3, 4]);

        detector.probe_round().await;
        let view = detector.membership.view();
        assert_eq!(view.status_of(&silo(4)), Some(SiloStatus::Active));

        detector.probe_round().await;
        let view = detector.membership.view();
        assert_eq!(view.status_of(&silo(4)), Some(SiloStatus::Suspect));
        assert_eq!(view.status_of(&silo(2)), Some(SiloStatus::Active));
        assert_eq!(view.status_of(&silo(3)), Some(SiloStatus::Active));
    }

    #[tokio::test]
    async fn test_isolated_silo_suspects_nobody() {
        let network = InMemoryNetwork::new();
        let detector = detector(&network, &[2, 3, 4]);
        for _ in 0..3 {
            detector.probe_round().await;
        }
        assert_eq!(detector.membership.view().active_silos().len(), 4);
    }

    #[tokio::test]
    async fn test_answering_silo_is_alive() {
        let network = InMemoryNetwork::new();
        bind(&network, 2).await.unwrap();
        let detector = detector(&network, &[2]);
        assert_eq!(detector.probe(silo(2)).await, Probe::Alive);
        assert_eq!(detector.report_unreachable(&silo(2)).await, Probe::Alive);
    }
}
