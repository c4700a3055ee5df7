// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Directory cache
//!
//! Router-side copies of directory lookups. Entries are provisional: a stale
//! activation signal invalidates them, and they expire after a time to live
//! that doubles every time a lookup confirms the cached address.
//!

use crate::identity::{ActivationAddress, GrainId, SiloAddress};

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
struct CachedAddress {
    address: ActivationAddress,
    ttl: Duration,
    expires_at: Instant,
}

/// Cache of resolved grain addresses.
#[derive(Debug)]
pub struct DirectoryCache {
    entries: HashMap<GrainId, CachedAddress>,
    max_entries: usize,
    initial_ttl: Duration,
    max_ttl: Duration,
}

impl DirectoryCache {
    pub fn new(max_entries: usize, initial_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            initial_ttl,
            max_ttl: max_ttl.max(initial_ttl),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The cached address of a grain, unless expired.
    pub fn get(&mut self, grain: &GrainId, now: Instant) -> Option<ActivationAddress> {
        match self.entries.get(grain) {
            Some(cached) if cached.expires_at > now => Some(cached.address.clone()),
            Some(_) => {
                self.entries.remove(grain);
                None
            }
            None => None,
        }
    }

    /// Caches an address. Confirming the cached address doubles its ttl.
    pub fn put(&mut self, address: ActivationAddress, now: Instant) {
        let ttl = match self.entries.get(&address.grain) {
            Some(cached) if cached.address == address => {
                (cached.ttl * 2).min(self.max_ttl)
            }
            _ => self.initial_ttl,
        };
        if !self.entries.contains_key(&address.grain)
            && self.entries.len() >= self.max_entries
        {
            self.evict(now);
        }
        self.entries.insert(
            address.grain.clone(),
            CachedAddress {
                address,
                ttl,
                expires_at: now + ttl,
            },
        );
    }

    /// Ttl currently granted to a grain's entry.
    pub fn ttl(&self, grain: &GrainId) -> Option<Duration> {
        self.entries.get(grain).map(|cached| cached.ttl)
    }

    pub fn invalidate(&mut self, grain: &GrainId) -> bool {
        self.entries.remove(grain).is_some()
    }

    /// Invalidates the entry of a grain only if it still holds `address`.
    pub fn invalidate_address(&mut self, address: &ActivationAddress) -> bool {
        if self
            .entries
            .get(&address.grain)
            .is_some_and(|cached| cached.address == *address)
        {
            self.entries.remove(&address.grain);
            true
        } else {
            false
        }
    }

    /// Drops every entry pointing at a silo. Returns how many were dropped.
    pub fn invalidate_silo(&mut self, silo: &SiloAddress) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, cached| cached.address.silo != *silo);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Makes room: drops expired entries, or the one closest to expiring.
    fn evict(&mut self, now: Instant) {
        self.entries.retain(|_, cached| cached.expires_at > now);
        if self.entries.len() < self.max_entries {
            return;
        }
        if let Some(grain) = self
            .entries
            .iter()
            .min_by_key(|(_, cached)| cached.expires_at)
            .map(|(grain, _)| grain.clone())
        {
            self.entries.remove(&grain);
        }
    }
}
