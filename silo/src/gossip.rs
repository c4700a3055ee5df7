// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Membership gossip
//!
//! Push-pull exchanges with random peers. The initiator pushes the entries
//! changed since its last successful exchange with that peer together with
//! a digest of its whole table; the peer merges the push and answers with
//! every entry it holds newer than the digest.
//!

use crate::{
    error::Error,
    identity::SiloAddress,
    membership_service::MembershipService,
    message::{GossipMessage, SiloRequest, SiloResponse},
    messenger::Messenger,
};

use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

pub struct Gossiper {
    membership: Arc<MembershipService>,
    messenger: Arc<Messenger>,
    /// Local table version last pushed to each peer.
    watermarks: Mutex<HashMap<SiloAddress, u64>>,
}

impl Gossiper {
    pub fn new(membership: Arc<MembershipService>, messenger: Arc<Messenger>) -> Self {
        Self {
            membership,
            messenger,
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    /// Silos worth gossiping with: everyone not dead but us.
    fn peers(&self) -> Vec<SiloAddress> {
        let myself = self.membership.myself();
        self.membership
            .view()
            .live_silos()
            .into_iter()
            .filter(|silo| *silo != myself)
            .collect()
    }

    /// One gossip round with `gossip_fanout` random peers.
    pub async fn round(&self) {
        let peers = self.peers();
        self.watermarks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|silo, _| peers.contains(silo));
        let chosen: Vec<SiloAddress> = peers
            .choose_multiple(
                &mut rand::thread_rng(),
                self.membership.config().gossip_fanout,
            )
            .cloned()
            .collect();
        join_all(chosen.iter().map(|peer| self.exchange(peer))).await;
    }

    /// Gossips with every live peer.
    pub async fn broadcast(&self) {
        let peers = self.peers();
        join_all(peers.iter().map(|peer| self.exchange(peer))).await;
    }

    /// One push-pull exchange with a peer.
    pub async fn exchange(&self, peer: &SiloAddress) -> Result<(), Error> {
        let since = self
            .watermarks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
            .unwrap_or(0);
        let version = self.membership.version();
        let message = GossipMessage {
            entries: self.membership.changes_since(since),
            digest: self.membership.digest(),
        };
        let timeout = self.membership.config().probe_timeout;
        let result = self
            .messenger
            .request_with_timeout(peer, SiloRequest::Gossip(message), timeout)
            .await
            .and_then(|response| match response {
                SiloResponse::Membership(entries) => Ok(entries),
                other => Err(other.unexpected("gossip")),
            });
        let mut watermarks =
            self.watermarks.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(entries) => {
                watermarks.insert(peer.clone(), version);
                drop(watermarks);
                if !entries.is_empty() {
                    self.membership.apply(entries);
                }
                Ok(())
            }
            Err(e) => {
                watermarks.remove(peer);
                debug!("Gossip with {} failed: {}", peer, e);
                Err(e)
            }
        }
    }

    /// Serves a gossip exchange started by a peer.
    pub fn handle(&self, message: GossipMessage) -> SiloResponse {
        if !message.entries.is_empty() {
            self.membership.apply(message.entries);
        }
        SiloResponse::Membership(self.membership.newer_than(&message.digest))
    }

    /// Gossips every `gossip_interval`, and right away when the membership
    /// service asks for it.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut interval =
            tokio::time::interval(self.membership.config().gossip_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.round().await,
                _ = self.membership.gossip_requested() => self.round().await,
            }
        }
        debug!("Gossip stopped.");
    }
}
