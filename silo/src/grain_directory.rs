// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Grain directory
//!
//! The distributed grain directory as seen from one silo. The server side
//! serves the local partition and refuses operations on grains the local
//! silo does not own in its current view. The client side sends each
//! operation to the owner of the grain, catching up on membership when an
//! owner refuses, up to `max_forward_count` times.
//!
//! Ring changes move entries to their new owner with handoff requests.
//! Duplicate activations met during a handoff are resolved by the partition
//! merge and the loser is deactivated.
//!

use crate::{
    config::DirectoryConfig,
    directory::{DirectoryEntry, GrainDirectoryPartition, RecordStatus},
    directory_cache::DirectoryCache,
    error::Error,
    gossip::Gossiper,
    identity::{ActivationAddress, GrainId, SiloAddress},
    membership_service::{ClusterView, MembershipService},
    message::{SiloRequest, SiloResponse},
    messenger::Messenger,
};

use futures::future::join_all;
use tracing::{debug, info, warn};

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

pub struct GrainDirectory {
    membership: Arc<MembershipService>,
    messenger: Arc<Messenger>,
    gossiper: Arc<Gossiper>,
    partition: Mutex<GrainDirectoryPartition>,
    cache: Mutex<DirectoryCache>,
    max_forward_count: u32,
}

impl GrainDirectory {
    pub fn new(
        membership: Arc<MembershipService>,
        messenger: Arc<Messenger>,
        gossiper: Arc<Gossiper>,
        config: &DirectoryConfig,
        max_forward_count: u32,
    ) -> Self {
        Self {
            membership,
            messenger,
            gossiper,
            partition: Mutex::new(GrainDirectoryPartition::new()),
            cache: Mutex::new(DirectoryCache::new(
                config.cache_max_entries,
                config.cache_initial_ttl,
                config.cache_max_ttl,
            )),
            max_forward_count,
        }
    }

    fn partition(&self) -> MutexGuard<'_, GrainDirectoryPartition> {
        self.partition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self) -> MutexGuard<'_, DirectoryCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of grains in the local partition.
    pub fn partition_len(&self) -> usize {
        self.partition().len()
    }

    /// Valid record of a grain in the local partition.
    pub fn local_lookup(
        &self,
        grain: &GrainId,
    ) -> Result<Option<ActivationAddress>, Error> {
        self.partition().lookup(grain)
    }

    fn check_owner(&self, grain: &GrainId, view: &ClusterView) -> Result<(), Error> {
        let myself = self.membership.myself();
        let owner = view.owner(grain);
        if owner.as_ref() == Some(&myself) {
            Ok(())
        } else {
            Err(Error::NotOwner {
                grain: grain.clone(),
                silo: myself,
                owner_hint: owner,
            })
        }
    }

    // Server side.

    pub fn handle_lookup(
        &self,
        grain: &GrainId,
    ) -> Result<Option<ActivationAddress>, Error> {
        let view = self.membership.view();
        self.check_owner(grain, &view)?;
        self.partition().lookup(grain)
    }

    pub fn handle_register(
        &self,
        address: ActivationAddress,
    ) -> Result<ActivationAddress, Error> {
        let view = self.membership.view();
        self.check_owner(&address.grain, &view)?;
        self.partition()
            .register(address, |silo| view.is_dead(silo))
    }

    pub fn handle_unregister(&self, address: &ActivationAddress) -> Result<(), Error> {
        let view = self.membership.view();
        self.check_owner(&address.grain, &view)?;
        self.partition().unregister(address);
        Ok(())
    }

    /// Merges entries handed over by another silo.
    ///
    /// Entries this silo does not own are forwarded to their owner while
    /// `hops` allows it. Losing duplicates are told to deactivate.
    pub async fn handle_handoff(&self, entries: Vec<DirectoryEntry>, hops: u32) {
        let view = self.membership.view();
        let myself = self.membership.myself();
        let mut losers = Vec::new();
        let mut forward: BTreeMap<SiloAddress, Vec<DirectoryEntry>> = BTreeMap::new();
        {
            let mut partition = self.partition();
            for entry in entries {
                match view.owner(&entry.grain) {
                    Some(owner) if owner == myself => {
                        for record in entry.records {
                            if record.status != RecordStatus::Valid
                                || view.is_dead(&record.address.silo)
                            {
                                continue;
                            }
                            if let Some(loser) = partition.merge(record.address) {
                                losers.push(loser);
                            }
                        }
                    }
                    Some(owner) => forward.entry(owner).or_default().push(entry),
                    None => debug!("No owner for handed over {}.", entry.grain),
                }
            }
        }

        for loser in &losers {
            self.invalidate_address(loser);
        }
        join_all(losers.into_iter().map(|loser| self.deactivate_loser(loser))).await;

        if forward.is_empty() {
            return;
        }
        if hops >= self.max_forward_count {
            warn!(
                "Dropping {} handed over entries after {} hops.",
                forward.values().map(Vec::len).sum::<usize>(),
                hops
            );
            return;
        }
        join_all(
            forward
                .into_iter()
                .map(|(owner, entries)| self.send_handoff(owner, entries, hops + 1)),
        )
        .await;
    }

    async fn deactivate_loser(&self, loser: ActivationAddress) {
        info!("Deactivating duplicate activation {}.", loser);
        let request = SiloRequest::Deactivate {
            grain: loser.grain.clone(),
            activation: Some(loser.activation.clone()),
        };
        if let Err(e) = self.messenger.request(&loser.silo, request).await {
            debug!("Can not deactivate {}: {}", loser, e);
        }
    }

    // Client side.

    /// Runs a request at the owner of `grain`, following refusals.
    async fn at_owner<T, R, E>(
        &self,
        grain: &GrainId,
        request: R,
        expect: E,
    ) -> Result<T, Error>
    where
        R: Fn() -> SiloRequest,
        E: Fn(SiloResponse) -> Result<T, Error>,
    {
        for _ in 0..=self.max_forward_count {
            let Some(owner) = self.membership.view().owner(grain) else {
                return Err(Error::NotOwner {
                    grain: grain.clone(),
                    silo: self.membership.myself(),
                    owner_hint: None,
                });
            };
            match self.messenger.request(&owner, request()).await {
                Ok(response) => return expect(response),
                Err(Error::NotOwner {
                    silo, owner_hint, ..
                }) => {
                    debug!(
                        "{} does not own {}, owner hint {:?}.",
                        silo, grain, owner_hint
                    );
                    // Whoever is behind catches up with the other.
                    if let Err(e) = self.gossiper.exchange(&silo).await {
                        debug!("Can not gossip with {}: {}", silo, e);
                    }
                    if let Some(hint) = owner_hint.filter(|hint| *hint != silo) {
                        if let Err(e) = self.gossiper.exchange(&hint).await {
                            debug!("Can not gossip with {}: {}", hint, e);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::ForwardingLimitExceeded {
            grain: grain.clone(),
            limit: self.max_forward_count,
        })
    }

    /// Looks up the registered activation of a grain at its owner.
    pub async fn lookup(
        &self,
        grain: &GrainId,
    ) -> Result<Option<ActivationAddress>, Error> {
        let result = self
            .at_owner(
                grain,
                || SiloRequest::Lookup {
                    grain: grain.clone(),
                },
                |response| match response {
                    SiloResponse::Lookup(address) => Ok(address),
                    other => Err(other.unexpected("lookup")),
                },
            )
            .await?;
        if let Some(address) = &result {
            self.cache_put(address.clone());
        }
        Ok(result)
    }

    /// Registers an activation at the owner of its grain.
    ///
    /// Fails with `AlreadyRegistered` when another activation won.
    pub async fn register(
        &self,
        address: &ActivationAddress,
    ) -> Result<ActivationAddress, Error> {
        let result = self
            .at_owner(
                &address.grain,
                || SiloRequest::Register {
                    address: address.clone(),
                },
                |response| match response {
                    SiloResponse::Registered(address) => Ok(address),
                    other => Err(other.unexpected("register")),
                },
            )
            .await;
        match &result {
            Ok(registered) => self.cache_put(registered.clone()),
            Err(Error::AlreadyRegistered { existing }) => {
                self.cache_put(existing.clone())
            }
            Err(_) => {}
        }
        result
    }

    /// Removes an activation at the owner of its grain.
    pub async fn unregister(&self, address: &ActivationAddress) -> Result<(), Error> {
        self.invalidate_address(address);
        self.at_owner(
            &address.grain,
            || SiloRequest::Unregister {
                address: address.clone(),
            },
            |response| match response {
                SiloResponse::Ack => Ok(()),
                other => Err(other.unexpected("unregister")),
            },
        )
        .await
    }

    /// Pushes the local membership view to the owner of `grain`.
    pub async fn sync_owner(&self, grain: &GrainId) {
        let Some(owner) = self.membership.view().owner(grain) else {
            return;
        };
        if owner != self.membership.myself() {
            if let Err(e) = self.gossiper.exchange(&owner).await {
                debug!("Can not gossip with {}: {}", owner, e);
            }
        }
    }

    /// Hands entries over to `owner`.
    pub async fn send_handoff(
        &self,
        owner: SiloAddress,
        entries: Vec<DirectoryEntry>,
        hops: u32,
    ) {
        let count = entries.len();
        debug!("Handing {} entries over to {}.", count, owner);
        if let Err(e) = self
            .messenger
            .request(&owner, SiloRequest::Handoff { entries, hops })
            .await
        {
            warn!("Handoff of {} entries to {} failed: {}", count, owner, e);
        }
    }

    /// Hands entries over to the owner of each grain in the current view.
    pub async fn hand_over(&self, entries: Vec<DirectoryEntry>) {
        let view = self.membership.view();
        let mut by_owner: BTreeMap<SiloAddress, Vec<DirectoryEntry>> = BTreeMap::new();
        for entry in entries {
            if let Some(owner) = view.owner(&entry.grain) {
                by_owner.entry(owner).or_default().push(entry);
            }
        }
        join_all(
            by_owner
                .into_iter()
                .map(|(owner, entries)| self.send_handoff(owner, entries, 0)),
        )
        .await;
    }

    /// Hands the whole local partition over to the other active silos.
    /// Used on graceful shutdown, after the local silo left the ring.
    pub async fn hand_over_all(&self) {
        let myself = self.membership.myself();
        let entries = self.partition().split_off(|_| true);
        let entries: Vec<DirectoryEntry> = entries
            .into_iter()
            .map(|mut entry| {
                entry.records.retain(|record| record.address.silo != myself);
                entry
            })
            .filter(|entry| !entry.records.is_empty())
            .collect();
        if !entries.is_empty() {
            self.hand_over(entries).await;
        }
    }

    /// Reacts to a membership change.
    ///
    /// Records hosted on dead silos are dropped, and entries whose owner
    /// changed are handed over to the new owner.
    pub async fn on_view_change(&self, previous: &ClusterView, current: &ClusterView) {
        for dead in current.dead_silos() {
            if previous.is_dead(&dead) {
                continue;
            }
            let removed = self.partition().remove_silo(&dead);
            let invalidated = self.invalidate_silo(&dead);
            if removed > 0 || invalidated > 0 {
                info!(
                    "Dropped {} directory records and {} cached addresses of dead silo {}.",
                    removed, invalidated, dead
                );
            }
        }

        if previous.active_silos() == current.active_silos() {
            return;
        }
        let myself = self.membership.myself();
        if !current.is_active(&myself) {
            return;
        }
        let moved = self
            .partition()
            .split_off(|grain| current.owner(grain).is_some_and(|owner| owner != myself));
        if !moved.is_empty() {
            info!("Ring changed, handing over {} directory entries.", moved.len());
            self.hand_over(moved).await;
        }
    }

    /// Forgets every directory record and cached address.
    pub fn clear(&self) {
        self.partition().clear();
        self.cache().clear();
    }

    // Cache.

    pub fn cached(&self, grain: &GrainId) -> Option<ActivationAddress> {
        self.cache().get(grain, Instant::now())
    }

    pub fn cache_put(&self, address: ActivationAddress) {
        self.cache().put(address, Instant::now());
    }

    pub fn invalidate(&self, grain: &GrainId) -> bool {
        self.cache().invalidate(grain)
    }

    pub fn invalidate_address(&self, address: &ActivationAddress) -> bool {
        self.cache().invalidate_address(address)
    }

    pub fn invalidate_silo(&self, silo: &SiloAddress) -> usize {
        self.cache().invalidate_silo(silo)
    }
}
