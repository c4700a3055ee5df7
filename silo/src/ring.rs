// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Consistent ring
//!
//! Maps grains to their directory owner. Each active silo places a fixed
//! number of virtual buckets on a 32-bit ring; a grain belongs to the silo
//! of the first bucket at or after its hash, wrapping around. The ring is a
//! pure function of the set of active silos, so every silo with the same
//! view computes the same owner without talking to anyone.
//!

use crate::identity::{GrainId, SiloAddress};

use std::collections::BTreeSet;

/// Ring built from one membership snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistentRing {
    /// `(bucket hash, silo)` sorted by hash then silo.
    buckets: Vec<(u32, SiloAddress)>,
    members: Vec<SiloAddress>,
}

impl ConsistentRing {
    /// Builds the ring for a set of active silos.
    pub fn new<I>(active: I, buckets_per_silo: u32) -> Self
    where
        I: IntoIterator<Item = SiloAddress>,
    {
        let members: BTreeSet<SiloAddress> = active.into_iter().collect();
        let mut buckets = Vec::with_capacity(
            members.len() * buckets_per_silo.max(1) as usize,
        );
        for silo in &members {
            for bucket in 0..buckets_per_silo.max(1) {
                buckets.push((silo.bucket_hash(bucket), silo.clone()));
            }
        }
        buckets.sort();
        Self {
            buckets,
            members: members.into_iter().collect(),
        }
    }

    /// Owner of a grain, `None` when no silo is active.
    pub fn owner(&self, grain: &GrainId) -> Option<&SiloAddress> {
        self.owner_of_hash(grain.uniform_hash())
    }

    /// Owner of a point of the ring.
    pub fn owner_of_hash(&self, hash: u32) -> Option<&SiloAddress> {
        if self.buckets.is_empty() {
            return None;
        }
        let index = self.buckets.partition_point(|(h, _)| *h < hash);
        let (_, silo) = &self.buckets[index % self.buckets.len()];
        Some(silo)
    }

    /// Active silos, in address order.
    pub fn members(&self) -> &[SiloAddress] {
        &self.members
    }

    pub fn contains(&self, silo: &SiloAddress) -> bool {
        self.members.binary_search(silo).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silos(ports: &[u16]) -> Vec<SiloAddress> {
        ports
            .iter()
            .map(|port| SiloAddress::new("127.0.0.1", *port, 1))
            .collect()
    }

    fn grains(count: usize) -> Vec<GrainId> {
        (0..count)
            .map(|i| GrainId::new("counter", &i.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = ConsistentRing::new(Vec::new(), 30);
        assert!(ring.is_empty());
        assert_eq!(ring.owner(&GrainId::new("counter", "a")), None);
    }

    #[test]
    fn test_ring_is_deterministic() {
        let members = silos(&[1000, 1001, 1002]);
        let mut reversed = members.clone();
        reversed.reverse();
        let ring = ConsistentRing::new(members, 30);
        let other = ConsistentRing::new(reversed, 30);
        assert_eq!(ring, other);
        for grain in grains(500) {
            assert_eq!(ring.owner(&grain), other.owner(&grain));
        }
    }

    #[test]
    fn test_every_member_owns_something() {
        let ring = ConsistentRing::new(silos(&[1000, 1001, 1002, 1003]), 30);
        let owners: BTreeSet<SiloAddress> = grains(2000)
            .iter()
            .filter_map(|grain| ring.owner(grain).cloned())
            .collect();
        assert_eq!(owners.len(), 4);
    }

    #[test]
    fn test_removing_a_member_only_moves_its_grains() {
        let all = silos(&[1000, 1001, 1002, 1003]);
        let gone = all[1].clone();
        let before = ConsistentRing::new(all.clone(), 30);
        let after = ConsistentRing::new(
            all.into_iter().filter(|silo| *silo != gone),
            30,
        );
        assert!(!after.contains(&gone));
        for grain in grains(1000) {
            let old = before.owner(&grain).cloned();
            let new = after.owner(&grain).cloned();
            if old.as_ref() == Some(&gone) {
                assert_ne!(new.as_ref(), Some(&gone));
            } else {
                assert_eq!(old, new);
            }
        }
    }

    #[test]
    fn test_hash_past_last_bucket_wraps() {
        let ring = ConsistentRing::new(silos(&[1000, 1001]), 1);
        let first = ring.owner_of_hash(0).cloned();
        assert!(ring.owner_of_hash(u32::MAX).is_some());
        // Either the last bucket sits at u32::MAX or the walk wraps to the
        // first bucket.
        let last_bucket = ring.buckets.last().map(|(h, _)| *h);
        if last_bucket != Some(u32::MAX) {
            assert_eq!(ring.owner_of_hash(u32::MAX).cloned(), first);
        }
    }
}
