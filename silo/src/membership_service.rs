// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Membership service
//!
//! Owns the local replica of the membership table. Every accepted change
//! publishes a new [`ClusterView`] (table snapshot plus the consistent ring
//! derived from it) that readers use without taking the table lock, and a
//! [`MembershipEvent`] per status change.
//!

use crate::{
    config::MembershipConfig,
    identity::{GrainId, SiloAddress, now_millis},
    membership::{
        EntryDigest, MembershipEntry, MembershipEvent, MembershipTable,
        MergeOutcome, SiloStatus, SuspectVote,
    },
    ring::ConsistentRing,
};

use tokio::sync::{Notify, broadcast, watch};
use tracing::{debug, info, warn};

use std::sync::{
    Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

/// Immutable snapshot of the membership table and its ring.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    version: u64,
    entries: Arc<Vec<MembershipEntry>>,
    ring: Arc<ConsistentRing>,
}

impl ClusterView {
    fn from_table(table: &MembershipTable, buckets_per_silo: u32) -> Self {
        let entries: Vec<MembershipEntry> = table.entries().cloned().collect();
        let ring = ConsistentRing::new(
            table.with_status(SiloStatus::Active),
            buckets_per_silo,
        );
        Self {
            version: table.version(),
            entries: Arc::new(entries),
            ring: Arc::new(ring),
        }
    }

    /// Local table version of the snapshot.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entries(&self) -> &[MembershipEntry] {
        &self.entries
    }

    pub fn ring(&self) -> &ConsistentRing {
        &self.ring
    }

    pub fn status_of(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.entries
            .iter()
            .find(|entry| entry.silo == *silo)
            .map(|entry| entry.status)
    }

    pub fn is_dead(&self, silo: &SiloAddress) -> bool {
        self.status_of(silo).is_some_and(|status| status.is_dead())
    }

    pub fn is_active(&self, silo: &SiloAddress) -> bool {
        self.ring.contains(silo)
    }

    pub fn active_silos(&self) -> &[SiloAddress] {
        self.ring.members()
    }

    /// Silos that are not dead.
    pub fn live_silos(&self) -> Vec<SiloAddress> {
        self.entries
            .iter()
            .filter(|entry| !entry.status.is_dead())
            .map(|entry| entry.silo.clone())
            .collect()
    }

    pub fn dead_silos(&self) -> Vec<SiloAddress> {
        self.entries
            .iter()
            .filter(|entry| entry.status.is_dead())
            .map(|entry| entry.silo.clone())
            .collect()
    }

    /// Directory owner of a grain in this view.
    pub fn owner(&self, grain: &GrainId) -> Option<SiloAddress> {
        self.ring.owner(grain).cloned()
    }
}

/// Result of a local suspicion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspicion {
    /// The silo is not in the table.
    Unknown,
    /// The silo is already dead.
    AlreadyDead,
    /// Our vote was recorded, not enough votes to declare it dead.
    Suspected,
    /// Our vote declared the silo dead.
    DeclaredDead,
}

/// Result of applying remote entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// The local table changed.
    pub changed: bool,
    /// The local silo found itself suspected and re-asserted itself.
    pub refuted: bool,
    /// The local silo found itself dead.
    pub self_dead: bool,
}

/// The membership oracle of one silo.
pub struct MembershipService {
    config: MembershipConfig,
    buckets_per_silo: u32,
    myself: RwLock<SiloAddress>,
    table: RwLock<MembershipTable>,
    view: watch::Sender<ClusterView>,
    events: broadcast::Sender<MembershipEvent>,
    gossip_now: Notify,
}

impl MembershipService {
    pub fn new(
        myself: SiloAddress,
        config: MembershipConfig,
        buckets_per_silo: u32,
    ) -> Self {
        let (view, _) = watch::channel(ClusterView::default());
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            buckets_per_silo,
            myself: RwLock::new(myself),
            table: RwLock::new(MembershipTable::new()),
            view,
            events,
            gossip_now: Notify::new(),
        }
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Current identity of the local silo.
    pub fn myself(&self) -> SiloAddress {
        self.myself
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest snapshot.
    pub fn view(&self) -> ClusterView {
        self.view.borrow().clone()
    }

    /// Receiver notified of every new snapshot.
    pub fn watch(&self) -> watch::Receiver<ClusterView> {
        self.view.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Resolves when a change worth gossiping immediately was made.
    pub async fn gossip_requested(&self) {
        self.gossip_now.notified().await
    }

    pub fn own_entry(&self) -> Option<MembershipEntry> {
        let myself = self.myself();
        self.read_table().get(&myself).cloned()
    }

    pub fn own_status(&self) -> Option<SiloStatus> {
        self.own_entry().map(|entry| entry.status)
    }

    /// Full table, as sent to a joining silo.
    pub fn entries(&self) -> Vec<MembershipEntry> {
        self.read_table().entries().cloned().collect()
    }

    pub fn changes_since(&self, version: u64) -> Vec<MembershipEntry> {
        self.read_table().changes_since(version)
    }

    pub fn digest(&self) -> Vec<EntryDigest> {
        self.read_table().digest()
    }

    pub fn newer_than(&self, digest: &[EntryDigest]) -> Vec<MembershipEntry> {
        self.read_table().newer_than(digest)
    }

    pub fn version(&self) -> u64 {
        self.read_table().version()
    }

    /// Adds the local silo as joining.
    pub fn start_joining(&self, incarnation: u64) -> MembershipEntry {
        let entry =
            MembershipEntry::joining(self.myself(), incarnation, now_millis());
        self.commit(vec![entry.clone()]);
        entry
    }

    /// Writes a new status for the local silo.
    pub fn set_own_status(&self, status: SiloStatus) -> Option<MembershipEntry> {
        let current = self.own_entry()?;
        if current.status.is_dead() {
            return None;
        }
        let next = current.with_status(status, now_millis());
        self.commit(vec![next.clone()]);
        self.gossip_now.notify_one();
        Some(next)
    }

    /// Merges entries received from other silos.
    pub fn apply(&self, entries: Vec<MembershipEntry>) -> ApplyOutcome {
        let myself = self.myself();
        let mut outcome = ApplyOutcome::default();
        let mut refutation = None;
        let mut events = Vec::new();
        {
            let now = now_millis();
            let mut table = self.write_table();
            for entry in entries {
                let status = entry.status;
                let silo = entry.silo.clone();
                if let MergeOutcome::Accepted { previous } = table.merge(entry, now)
                {
                    outcome.changed = true;
                    if silo == myself {
                        match status {
                            SiloStatus::Dead => outcome.self_dead = true,
                            SiloStatus::Suspect => {
                                refutation = table.get(&myself).cloned()
                            }
                            _ => {}
                        }
                    }
                    if previous != Some(status) {
                        events.push(MembershipEvent {
                            silo,
                            status,
                            previous,
                            version: table.version(),
                        });
                    }
                }
            }
            if let Some(suspected) = refutation.take() {
                if !outcome.self_dead && suspected.status == SiloStatus::Suspect {
                    let refuted = suspected.with_status(SiloStatus::Active, now);
                    info!("Refuting suspicion of {}.", myself);
                    if let MergeOutcome::Accepted { previous } = table.merge(refuted, now) {
                        outcome.refuted = true;
                        events.push(MembershipEvent {
                            silo: myself.clone(),
                            status: SiloStatus::Active,
                            previous,
                            version: table.version(),
                        });
                    }
                }
            }
            if outcome.changed {
                self.publish(&table);
            }
        }
        self.emit(events);
        if outcome.self_dead {
            warn!("Silo {} found itself declared dead.", myself);
        }
        if outcome.refuted {
            self.gossip_now.notify_one();
        }
        outcome
    }

    /// Records a local suspicion of `target`, declaring it dead when enough
    /// fresh votes agree.
    pub fn suspect(&self, target: &SiloAddress) -> Suspicion {
        let myself = self.myself();
        if *target == myself {
            return Suspicion::Unknown;
        }
        let now = now_millis();
        let next = {
            let table = self.read_table();
            let Some(entry) = table.get(target) else {
                return Suspicion::Unknown;
            };
            if entry.status.is_dead() {
                return Suspicion::AlreadyDead;
            }
            let mut votes: Vec<SuspectVote> = entry
                .fresh_votes(now, self.config.death_vote_expiration)
                .filter(|vote| vote.voter != myself)
                .cloned()
                .collect();
            votes.push(SuspectVote {
                voter: myself.clone(),
                at_ms: now,
            });

            let active = table
                .entries()
                .filter(|e| {
                    matches!(e.status, SiloStatus::Active | SiloStatus::Suspect)
                })
                .count();
            let by_fraction = ((self.config.death_vote_fraction * active as f64)
                .ceil() as usize)
                .max(1);
            let declare = votes.len() >= self.config.num_votes_for_death_declaration
                || votes.len() >= by_fraction;

            let status = if declare {
                SiloStatus::Dead
            } else {
                SiloStatus::Suspect
            };
            let mut next = entry.with_status(status, now);
            if entry.status == SiloStatus::Suspect && !declare {
                next.status_since_ms = entry.status_since_ms;
            }
            next.suspect_votes = votes;
            next
        };

        let declared = next.status.is_dead();
        if declared {
            warn!("Declaring {} dead with {} votes.", target, next.suspect_votes.len());
        } else {
            info!(
                "Suspecting {} ({} votes).",
                target,
                next.suspect_votes.len()
            );
        }
        self.commit(vec![next]);
        self.gossip_now.notify_one();
        if declared {
            Suspicion::DeclaredDead
        } else {
            Suspicion::Suspected
        }
    }

    /// Declares dead the suspects this silo voted for that stayed suspect
    /// longer than the suspect timeout.
    pub fn expire_suspects(&self) -> Vec<SiloAddress> {
        let myself = self.myself();
        let now = now_millis();
        let timeout = self.config.suspect_timeout.as_millis() as u64;
        let expired: Vec<MembershipEntry> = self
            .read_table()
            .entries()
            .filter(|entry| {
                entry.status == SiloStatus::Suspect
                    && entry.silo != myself
                    && entry.suspect_votes.iter().any(|v| v.voter == myself)
                    && entry.status_since_ms.saturating_add(timeout) <= now
            })
            .map(|entry| entry.with_status(SiloStatus::Dead, now))
            .collect();
        let silos: Vec<SiloAddress> =
            expired.iter().map(|entry| entry.silo.clone()).collect();
        if !expired.is_empty() {
            for silo in &silos {
                warn!("Declaring {} dead after the suspect timeout.", silo);
            }
            self.commit(expired);
            self.gossip_now.notify_one();
        }
        silos
    }

    /// Removes old tombstones.
    pub fn collect_tombstones(&self) -> Vec<SiloAddress> {
        let mut table = self.write_table();
        let collected = table
            .collect_tombstones(now_millis(), self.config.dead_entry_retention);
        if !collected.is_empty() {
            self.publish(&table);
        }
        collected
    }

    /// Silos the local silo probes: its successors on the silo hash ring,
    /// among silos that are not dead.
    pub fn probe_targets(&self) -> Vec<SiloAddress> {
        let myself = self.myself();
        let mut ring: Vec<(u32, SiloAddress)> = self
            .read_table()
            .entries()
            .filter(|entry| !entry.status.is_dead() && entry.silo != myself)
            .map(|entry| (entry.silo.consistent_hash(), entry.silo.clone()))
            .collect();
        ring.sort();
        let own_hash = myself.consistent_hash();
        let start = ring.partition_point(|(hash, _)| *hash <= own_hash);
        let count = self.config.num_probed_silos.min(ring.len());
        (0..count)
            .map(|i| ring[(start + i) % ring.len()].1.clone())
            .collect()
    }

    /// Declares dead the older generations of `silo`'s endpoint. A silo
    /// joining on an endpoint proves the previous process there is gone.
    pub fn retire_older_generations(&self, silo: &SiloAddress) -> Vec<SiloAddress> {
        let now = now_millis();
        let retired: Vec<MembershipEntry> = self
            .read_table()
            .entries()
            .filter(|entry| {
                entry.silo.same_endpoint(silo)
                    && entry.silo.generation() < silo.generation()
                    && !entry.status.is_dead()
            })
            .map(|entry| entry.with_status(SiloStatus::Dead, now))
            .collect();
        let silos: Vec<SiloAddress> =
            retired.iter().map(|entry| entry.silo.clone()).collect();
        if !retired.is_empty() {
            for old in &silos {
                info!("{} replaced {} on its endpoint.", silo, old);
            }
            self.commit(retired);
            self.gossip_now.notify_one();
        }
        silos
    }

    /// Takes a new identity after being declared dead.
    pub fn rejoin(&self) -> SiloAddress {
        let previous = self.own_entry();
        let next = {
            let mut myself =
                self.myself.write().unwrap_or_else(PoisonError::into_inner);
            *myself = myself.next_generation();
            myself.clone()
        };
        let incarnation = previous.map(|entry| entry.incarnation + 1).unwrap_or(0);
        info!("Rejoining as {} (incarnation {}).", next, incarnation);
        self.start_joining(incarnation);
        next
    }

    /// Writes locally produced entries.
    fn commit(&self, entries: Vec<MembershipEntry>) {
        let mut events = Vec::new();
        {
            let now = now_millis();
            let mut table = self.write_table();
            let mut changed = false;
            for entry in entries {
                let status = entry.status;
                let silo = entry.silo.clone();
                if let MergeOutcome::Accepted { previous } = table.merge(entry, now)
                {
                    changed = true;
                    if previous != Some(status) {
                        events.push(MembershipEvent {
                            silo,
                            status,
                            previous,
                            version: table.version(),
                        });
                    }
                }
            }
            if changed {
                self.publish(&table);
            }
        }
        self.emit(events);
    }

    fn publish(&self, table: &MembershipTable) {
        let view = ClusterView::from_table(table, self.buckets_per_silo);
        self.view.send_replace(view);
    }

    fn emit(&self, events: Vec<MembershipEvent>) {
        for event in events {
            debug!(
                "Membership: {} is {} (was {:?}).",
                event.silo, event.status, event.previous
            );
            let _ = self.events.send(event);
        }
    }

    fn read_table(&self) -> RwLockReadGuard<'_, MembershipTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, MembershipTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    use std::time::Duration;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new("127.0.0.1", port, 1)
    }

    fn active(port: u16) -> MembershipEntry {
        MembershipEntry::joining(silo(port), 0, now_millis())
            .with_status(SiloStatus::Active, now_millis())
    }

    fn service(port: u16, config: MembershipConfig) -> MembershipService {
        let service = MembershipService::new(silo(port), config, 30);
        service.start_joining(0);
        service.set_own_status(SiloStatus::Active);
        service
    }

    fn cluster(ports: &[u16], config: MembershipConfig) -> MembershipService {
        let service = service(ports[0], config);
        service.apply(ports[1..].iter().map(|p| active(*p)).collect());
        service
    }

    #[test]
    fn test_view_follows_table() {
        let service = cluster(&[1, 2, 3], MembershipConfig::default());
        let view = service.view();
        assert_eq!(view.active_silos().len(), 3);
        assert_eq!(view.version(), service.version());
        let grain = GrainId::new("counter", "a");
        assert!(view.owner(&grain).is_some());
    }

    #[test]
    fn test_events_are_published() {
        let service = service(1, MembershipConfig::default());
        let mut events = service.subscribe();
        service.apply(vec![MembershipEntry::joining(silo(2), 0, 0)]);
        let event = events.try_recv().unwrap();
        assert_eq!(event.silo, silo(2));
        assert_eq!(event.status, SiloStatus::Joining);
        assert_eq!(event.previous, None);
    }

    #[test]
    fn test_single_vote_suspects_in_large_cluster() {
        let service = cluster(&[1, 2, 3, 4, 5], MembershipConfig::default());
        assert_eq!(service.suspect(&silo(2)), Suspicion::Suspected);
        let view = service.view();
        assert_eq!(view.status_of(&silo(2)), Some(SiloStatus::Suspect));
        // Suspects leave the ring.
        assert!(!view.is_active(&silo(2)));
    }

    #[test]
    fn test_second_vote_declares_dead() {
        let service = cluster(&[1, 2, 3, 4, 5], MembershipConfig::default());
        let now = now_millis();
        let mut suspected = active(2).with_status(SiloStatus::Suspect, now);
        suspected.suspect_votes.push(SuspectVote {
            voter: silo(3),
            at_ms: now,
        });
        service.apply(vec![suspected]);
        assert_eq!(service.suspect(&silo(2)), Suspicion::DeclaredDead);
        assert!(service.view().is_dead(&silo(2)));
        assert_eq!(service.suspect(&silo(2)), Suspicion::AlreadyDead);
    }

    #[test]
    fn test_expired_votes_do_not_count() {
        let service = cluster(&[1, 2, 3, 4, 5], MembershipConfig::default());
        let now = now_millis();
        let mut suspected = active(2).with_status(SiloStatus::Suspect, now);
        suspected.suspect_votes.push(SuspectVote {
            voter: silo(3),
            at_ms: now - 1_000_000,
        });
        service.apply(vec![suspected]);
        assert_eq!(service.suspect(&silo(2)), Suspicion::Suspected);
    }

    #[test]
    fn test_single_vote_is_enough_in_two_silo_cluster() {
        let config = MembershipConfig {
            num_votes_for_death_declaration: 3,
            ..Default::default()
        };
        let service = cluster(&[1, 2], config);
        assert_eq!(service.suspect(&silo(2)), Suspicion::DeclaredDead);
    }

    #[test]
    fn test_suspect_timeout_declares_dead() {
        let config = MembershipConfig {
            suspect_timeout: Duration::ZERO,
            ..Default::default()
        };
        let service = cluster(&[1, 2, 3, 4, 5], config);
        service.suspect(&silo(2));
        assert_eq!(service.expire_suspects(), vec![silo(2)]);
        assert!(service.view().is_dead(&silo(2)));
    }

    #[traced_test]
    #[test]
    fn test_refutes_own_suspicion() {
        let service = cluster(&[1, 2, 3], MembershipConfig::default());
        let own = service.own_entry().unwrap();
        let mut suspected = own.with_status(SiloStatus::Suspect, now_millis());
        suspected.suspect_votes.push(SuspectVote {
            voter: silo(2),
            at_ms: now_millis(),
        });
        let outcome = service.apply(vec![suspected.clone()]);
        assert!(outcome.refuted);
        assert!(!outcome.self_dead);
        let own = service.own_entry().unwrap();
        assert_eq!(own.status, SiloStatus::Active);
        assert!(own.supersedes(&suspected));
        assert!(own.suspect_votes.is_empty());
        assert!(logs_contain("Refuting suspicion"));
    }

    #[traced_test]
    #[test]
    fn test_detects_own_death() {
        let service = cluster(&[1, 2, 3], MembershipConfig::default());
        let dead = service
            .own_entry()
            .unwrap()
            .with_status(SiloStatus::Dead, now_millis());
        let outcome = service.apply(vec![dead]);
        assert!(outcome.self_dead);
        assert!(!outcome.refuted);
        // Stale self information cannot override it.
        assert_eq!(service.set_own_status(SiloStatus::Active), None);
        assert_eq!(service.own_status(), Some(SiloStatus::Dead));
        assert!(logs_contain("found itself declared dead"));

        let next = service.rejoin();
        assert!(next.same_endpoint(&silo(1)));
        assert_ne!(next, silo(1));
        let own = service.own_entry().unwrap();
        assert_eq!(own.status, SiloStatus::Joining);
        assert_eq!(own.incarnation, 1);
    }

    #[test]
    fn test_probe_targets_are_ring_successors() {
        let ports = [1, 2, 3, 4, 5, 6];
        let config = MembershipConfig {
            num_probed_silos: 2,
            ..Default::default()
        };
        let services: Vec<MembershipService> = ports
            .iter()
            .map(|port| {
                let service = service(*port, config.clone());
                service.apply(ports.iter().map(|p| active(*p)).collect());
                service
            })
            .collect();
        let mut probed = std::collections::HashMap::new();
        for service in &services {
            let targets = service.probe_targets();
            assert_eq!(targets.len(), 2);
            assert!(!targets.contains(&service.myself()));
            for target in targets {
                *probed.entry(target).or_insert(0) += 1;
            }
        }
        // Every silo is watched by exactly two others.
        assert_eq!(probed.len(), 6);
        assert!(probed.values().all(|count| *count == 2));
    }

    #[test]
    fn test_dead_silos_are_not_probed() {
        let service = cluster(&[1, 2, 3], MembershipConfig::default());
        let now = now_millis();
        service.apply(vec![active(2).with_status(SiloStatus::Dead, now)]);
        assert_eq!(service.probe_targets(), vec![silo(3)]);
    }

    #[test]
    fn test_new_generation_retires_the_old_one() {
        let service = cluster(&[1, 2, 3], MembershipConfig::default());
        let restarted = SiloAddress::new("127.0.0.1", 2, 7);
        assert_eq!(service.retire_older_generations(&restarted), vec![silo(2)]);
        assert!(service.view().is_dead(&silo(2)));
        assert!(service.retire_older_generations(&restarted).is_empty());
    }
}
