// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Membership table
//!
//! The replicated record of every silo and its status. Any silo may propose
//! a status for any other silo; replicas converge by merging entries with a
//! last-writer-wins rule keyed by `(incarnation, sequence)`. A dead entry is
//! a tombstone: nothing but another dead entry can replace it.
//!

use crate::identity::SiloAddress;

use serde::{Deserialize, Serialize};
use tracing::debug;

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    time::Duration,
};

/// Status of a silo.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum SiloStatus {
    Joining,
    Active,
    Suspect,
    Dead,
}

impl SiloStatus {
    /// Precedence between two entries with the same version.
    fn rank(&self) -> u8 {
        match self {
            SiloStatus::Joining => 0,
            SiloStatus::Active => 1,
            SiloStatus::Suspect => 2,
            SiloStatus::Dead => 3,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, SiloStatus::Dead)
    }
}

impl Display for SiloStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            SiloStatus::Joining => "Joining",
            SiloStatus::Active => "Active",
            SiloStatus::Suspect => "Suspect",
            SiloStatus::Dead => "Dead",
        };
        write!(f, "{}", name)
    }
}

/// A vote to declare a silo dead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspectVote {
    pub voter: SiloAddress,
    pub at_ms: u64,
}

/// Merge order of membership entries. The greater key wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct VersionKey {
    dead: bool,
    incarnation: u64,
    sequence: u64,
    rank: u8,
}

/// One row of the membership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub silo: SiloAddress,
    pub status: SiloStatus,
    /// Bumped each time the process rejoins.
    pub incarnation: u64,
    /// Bumped on every status write for this incarnation.
    pub sequence: u64,
    pub suspect_votes: Vec<SuspectVote>,
    /// Writer's clock when `status` was entered.
    pub status_since_ms: u64,
}

impl MembershipEntry {
    /// The entry a silo announces when it starts joining.
    pub fn joining(silo: SiloAddress, incarnation: u64, now_ms: u64) -> Self {
        Self {
            silo,
            status: SiloStatus::Joining,
            incarnation,
            sequence: 0,
            suspect_votes: Vec::new(),
            status_since_ms: now_ms,
        }
    }

    pub fn version_key(&self) -> VersionKey {
        VersionKey {
            dead: self.status.is_dead(),
            incarnation: self.incarnation,
            sequence: self.sequence,
            rank: self.status.rank(),
        }
    }

    /// True when this entry replaces `other` on merge.
    pub fn supersedes(&self, other: &MembershipEntry) -> bool {
        self.version_key() > other.version_key()
    }

    /// The next write of this entry with a new status.
    pub fn with_status(&self, status: SiloStatus, now_ms: u64) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.sequence += 1;
        next.status_since_ms = now_ms;
        if !matches!(status, SiloStatus::Suspect | SiloStatus::Dead) {
            next.suspect_votes.clear();
        }
        next
    }

    /// Votes cast within the expiration window.
    pub fn fresh_votes(
        &self,
        now_ms: u64,
        expiration: Duration,
    ) -> impl Iterator<Item = &SuspectVote> {
        let horizon = now_ms.saturating_sub(expiration.as_millis() as u64);
        self.suspect_votes.iter().filter(move |v| v.at_ms >= horizon)
    }

    pub fn digest(&self) -> EntryDigest {
        EntryDigest {
            silo: self.silo.clone(),
            key: self.version_key(),
        }
    }

    /// Adds the votes of `other` missing here. Returns true if any was added.
    fn union_votes(&mut self, other: &MembershipEntry) -> bool {
        let mut added = false;
        for vote in &other.suspect_votes {
            if !self.suspect_votes.iter().any(|v| v.voter == vote.voter) {
                self.suspect_votes.push(vote.clone());
                added = true;
            }
        }
        added
    }
}

/// What a silo knows about one entry, sent in gossip so the peer can answer
/// with what it knows better.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDigest {
    pub silo: SiloAddress,
    pub key: VersionKey,
}

/// Result of merging one entry into the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The table did not change.
    Ignored,
    /// The table changed. `previous` is the status before the merge.
    Accepted { previous: Option<SiloStatus> },
}

#[derive(Debug, Clone)]
struct TableRow {
    entry: MembershipEntry,
    /// Table version of the last change of this row.
    modified_at: u64,
    /// Local clock when the row was first seen dead.
    dead_since_ms: Option<u64>,
}

/// Membership status change, published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub silo: SiloAddress,
    pub status: SiloStatus,
    pub previous: Option<SiloStatus>,
    /// Local table version at which the change was accepted.
    pub version: u64,
}

/// The local replica of the membership table.
#[derive(Debug, Clone, Default)]
pub struct MembershipTable {
    version: u64,
    rows: BTreeMap<SiloAddress, TableRow>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strictly increases on every accepted mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, silo: &SiloAddress) -> Option<&MembershipEntry> {
        self.rows.get(silo).map(|row| &row.entry)
    }

    pub fn status_of(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.get(silo).map(|entry| entry.status)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MembershipEntry> {
        self.rows.values().map(|row| &row.entry)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Silos with the given status, in address order.
    pub fn with_status(&self, status: SiloStatus) -> Vec<SiloAddress> {
        self.entries()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.silo.clone())
            .collect()
    }

    /// Merges an entry into the table.
    pub fn merge(&mut self, entry: MembershipEntry, now_ms: u64) -> MergeOutcome {
        match self.rows.get_mut(&entry.silo) {
            None => {
                self.version += 1;
                let dead_since_ms = entry.status.is_dead().then_some(now_ms);
                self.rows.insert(
                    entry.silo.clone(),
                    TableRow {
                        entry,
                        modified_at: self.version,
                        dead_since_ms,
                    },
                );
                MergeOutcome::Accepted { previous: None }
            }
            Some(row) => {
                if entry.supersedes(&row.entry) {
                    let previous = row.entry.status;
                    if entry.status.is_dead() && row.dead_since_ms.is_none() {
                        row.dead_since_ms = Some(now_ms);
                    }
                    row.entry = entry;
                    self.version += 1;
                    row.modified_at = self.version;
                    MergeOutcome::Accepted {
                        previous: Some(previous),
                    }
                } else if entry.version_key() == row.entry.version_key()
                    && row.entry.union_votes(&entry)
                {
                    self.version += 1;
                    row.modified_at = self.version;
                    MergeOutcome::Accepted {
                        previous: Some(row.entry.status),
                    }
                } else {
                    MergeOutcome::Ignored
                }
            }
        }
    }

    /// Entries changed after a table version.
    pub fn changes_since(&self, version: u64) -> Vec<MembershipEntry> {
        self.rows
            .values()
            .filter(|row| row.modified_at > version)
            .map(|row| row.entry.clone())
            .collect()
    }

    pub fn digest(&self) -> Vec<EntryDigest> {
        self.entries().map(MembershipEntry::digest).collect()
    }

    /// Entries the owner of `digest` lacks or holds an older version of.
    pub fn newer_than(&self, digest: &[EntryDigest]) -> Vec<MembershipEntry> {
        let known: BTreeMap<&SiloAddress, VersionKey> =
            digest.iter().map(|d| (&d.silo, d.key)).collect();
        self.entries()
            .filter(|entry| match known.get(&entry.silo) {
                None => true,
                Some(key) => entry.version_key() > *key,
            })
            .cloned()
            .collect()
    }

    /// Removes dead entries observed dead for longer than `retention`.
    pub fn collect_tombstones(
        &mut self,
        now_ms: u64,
        retention: Duration,
    ) -> Vec<SiloAddress> {
        let retention = retention.as_millis() as u64;
        let expired: Vec<SiloAddress> = self
            .rows
            .iter()
            .filter(|(_, row)| {
                row.dead_since_ms
                    .is_some_and(|since| since.saturating_add(retention) <= now_ms)
            })
            .map(|(silo, _)| silo.clone())
            .collect();
        if !expired.is_empty() {
            for silo in &expired {
                self.rows.remove(silo);
            }
            self.version += 1;
            debug!("Collected {} membership tombstones.", expired.len());
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new("127.0.0.1", port, 1)
    }

    #[test]
    fn test_merge_inserts_and_bumps_version() {
        let mut table = MembershipTable::new();
        let entry = MembershipEntry::joining(silo(1), 0, 10);
        assert_eq!(
            table.merge(entry.clone(), 10),
            MergeOutcome::Accepted { previous: None }
        );
        assert_eq!(table.version(), 1);
        // Same entry again changes nothing.
        assert_eq!(table.merge(entry, 10), MergeOutcome::Ignored);
        assert_eq!(table.version(), 1);
    }

    #[test]
    fn test_higher_sequence_wins() {
        let mut table = MembershipTable::new();
        let joining = MembershipEntry::joining(silo(1), 0, 10);
        let active = joining.with_status(SiloStatus::Active, 20);
        table.merge(active.clone(), 20);
        // The older write arrives late and is ignored.
        assert_eq!(table.merge(joining, 30), MergeOutcome::Ignored);
        assert_eq!(table.status_of(&silo(1)), Some(SiloStatus::Active));

        let suspect = active.with_status(SiloStatus::Suspect, 40);
        assert_eq!(
            table.merge(suspect, 40),
            MergeOutcome::Accepted {
                previous: Some(SiloStatus::Active)
            }
        );
    }

    #[test]
    fn test_dead_is_sticky() {
        let mut table = MembershipTable::new();
        let active = MembershipEntry::joining(silo(1), 0, 10)
            .with_status(SiloStatus::Active, 10);
        let dead = active.with_status(SiloStatus::Dead, 20);
        table.merge(dead, 20);

        // A refutation with a much higher sequence cannot resurrect it.
        let mut refuted = active.clone();
        refuted.sequence = 100;
        assert_eq!(table.merge(refuted, 30), MergeOutcome::Ignored);
        // Neither can a newer incarnation of the same identity.
        let mut reborn = active;
        reborn.incarnation = 5;
        assert_eq!(table.merge(reborn, 30), MergeOutcome::Ignored);
        assert_eq!(table.status_of(&silo(1)), Some(SiloStatus::Dead));
    }

    #[test]
    fn test_equal_version_resolved_by_status() {
        let mut table = MembershipTable::new();
        let base = MembershipEntry::joining(silo(1), 0, 10)
            .with_status(SiloStatus::Active, 10);
        let mut suspect = base.clone();
        suspect.status = SiloStatus::Suspect;
        table.merge(base, 10);
        assert!(matches!(
            table.merge(suspect, 10),
            MergeOutcome::Accepted { .. }
        ));
        assert_eq!(table.status_of(&silo(1)), Some(SiloStatus::Suspect));
    }

    #[test]
    fn test_equal_version_unions_votes() {
        let mut table = MembershipTable::new();
        let suspect = MembershipEntry::joining(silo(1), 0, 10)
            .with_status(SiloStatus::Suspect, 10);
        let mut from_a = suspect.clone();
        from_a.suspect_votes.push(SuspectVote {
            voter: silo(2),
            at_ms: 10,
        });
        let mut from_b = suspect;
        from_b.suspect_votes.push(SuspectVote {
            voter: silo(3),
            at_ms: 11,
        });
        table.merge(from_a, 10);
        let version = table.version();
        assert!(matches!(
            table.merge(from_b.clone(), 11),
            MergeOutcome::Accepted { .. }
        ));
        assert!(table.version() > version);
        assert_eq!(table.get(&silo(1)).unwrap().suspect_votes.len(), 2);
        assert_eq!(table.merge(from_b, 12), MergeOutcome::Ignored);
    }

    #[test]
    fn test_fresh_votes_expire() {
        let mut entry = MembershipEntry::joining(silo(1), 0, 0)
            .with_status(SiloStatus::Suspect, 0);
        entry.suspect_votes.push(SuspectVote {
            voter: silo(2),
            at_ms: 1_000,
        });
        entry.suspect_votes.push(SuspectVote {
            voter: silo(3),
            at_ms: 9_000,
        });
        let fresh: Vec<_> = entry
            .fresh_votes(10_000, Duration::from_secs(5))
            .map(|v| v.voter.clone())
            .collect();
        assert_eq!(fresh, vec![silo(3)]);
    }

    #[test]
    fn test_deltas_and_digests() {
        let mut table = MembershipTable::new();
        table.merge(MembershipEntry::joining(silo(1), 0, 0), 0);
        let mark = table.version();
        table.merge(MembershipEntry::joining(silo(2), 0, 0), 0);
        let delta = table.changes_since(mark);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].silo, silo(2));

        let mut peer = MembershipTable::new();
        peer.merge(MembershipEntry::joining(silo(1), 0, 0), 0);
        let newer = table.newer_than(&peer.digest());
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].silo, silo(2));

        let behind = peer.newer_than(&table.digest());
        assert!(behind.is_empty());
    }

    #[test]
    fn test_collect_tombstones() {
        let mut table = MembershipTable::new();
        let dead = MembershipEntry::joining(silo(1), 0, 0)
            .with_status(SiloStatus::Dead, 0);
        table.merge(dead, 1_000);
        table.merge(MembershipEntry::joining(silo(2), 0, 0), 1_000);

        assert!(
            table
                .collect_tombstones(5_000, Duration::from_secs(10))
                .is_empty()
        );
        let version = table.version();
        let collected =
            table.collect_tombstones(11_000, Duration::from_secs(10));
        assert_eq!(collected, vec![silo(1)]);
        assert!(table.version() > version);
        assert_eq!(table.len(), 1);
    }
}
