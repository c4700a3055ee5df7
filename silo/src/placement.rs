// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Placement
//!
//! Picks the silo that hosts a new activation. Only active silos are
//! candidates. Strategies are pluggable; the built-in ones are random,
//! least-loaded (power of two choices) and prefer-local.
//!

use crate::{
    config::{PlacementConfig, PlacementKind},
    error::Error,
    identity::{ActivationAddress, GrainId, SiloAddress},
    membership_service::MembershipService,
    message::{SiloRequest, SiloResponse},
    messenger::Messenger,
};

use futures::future::join_all;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

/// What a strategy gets to decide with.
#[derive(Debug, Clone)]
pub struct PlacementContext<'a> {
    pub grain: &'a GrainId,
    /// The deciding silo.
    pub local: &'a SiloAddress,
    /// Active silos, never empty.
    pub candidates: &'a [SiloAddress],
    /// Last reported activation count per silo.
    pub loads: &'a HashMap<SiloAddress, usize>,
}

/// A placement strategy.
pub trait PlacementStrategy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Picks one of `ctx.candidates`.
    fn select(&self, ctx: &PlacementContext<'_>) -> SiloAddress;
}

/// Uniformly random among active silos.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPlacement;

impl PlacementStrategy for RandomPlacement {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, ctx: &PlacementContext<'_>) -> SiloAddress {
        ctx.candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| ctx.local.clone())
    }
}

/// Samples `choose_out_of` silos and takes the least loaded one.
#[derive(Debug, Clone, Copy)]
pub struct LeastLoadedPlacement {
    choose_out_of: usize,
}

impl LeastLoadedPlacement {
    pub fn new(choose_out_of: usize) -> Self {
        Self {
            choose_out_of: choose_out_of.max(1),
        }
    }
}

impl Default for LeastLoadedPlacement {
    fn default() -> Self {
        Self::new(2)
    }
}

impl PlacementStrategy for LeastLoadedPlacement {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn select(&self, ctx: &PlacementContext<'_>) -> SiloAddress {
        // Silos that never reported count as empty.
        ctx.candidates
            .choose_multiple(&mut rand::thread_rng(), self.choose_out_of)
            .min_by(|a, b| {
                let load_a = ctx.loads.get(*a).copied().unwrap_or(0);
                let load_b = ctx.loads.get(*b).copied().unwrap_or(0);
                load_a.cmp(&load_b).then_with(|| a.cmp(b))
            })
            .cloned()
            .unwrap_or_else(|| ctx.local.clone())
    }
}

/// The deciding silo when it is active, random otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreferLocalPlacement;

impl PlacementStrategy for PreferLocalPlacement {
    fn name(&self) -> &'static str {
        "prefer-local"
    }

    fn select(&self, ctx: &PlacementContext<'_>) -> SiloAddress {
        if ctx.candidates.contains(ctx.local) {
            ctx.local.clone()
        } else {
            RandomPlacement.select(ctx)
        }
    }
}

/// Strategy configured by a [`PlacementConfig`].
pub fn strategy_for(config: &PlacementConfig) -> Arc<dyn PlacementStrategy> {
    match config.strategy {
        PlacementKind::Random => Arc::new(RandomPlacement),
        PlacementKind::LeastLoaded => {
            Arc::new(LeastLoadedPlacement::new(config.choose_out_of))
        }
        PlacementKind::PreferLocal => Arc::new(PreferLocalPlacement),
    }
}

/// Places new activations and tracks the load of other silos.
pub struct PlacementEngine {
    strategy: Arc<dyn PlacementStrategy>,
    membership: Arc<MembershipService>,
    messenger: Arc<Messenger>,
    loads: Mutex<HashMap<SiloAddress, usize>>,
}

impl PlacementEngine {
    pub fn new(
        strategy: Arc<dyn PlacementStrategy>,
        membership: Arc<MembershipService>,
        messenger: Arc<Messenger>,
    ) -> Self {
        Self {
            strategy,
            membership,
            messenger,
            loads: Mutex::new(HashMap::new()),
        }
    }

    /// Picks the silo for a new activation of `grain`.
    pub fn select(&self, grain: &GrainId) -> Result<SiloAddress, Error> {
        let view = self.membership.view();
        let candidates = view.active_silos();
        if candidates.is_empty() {
            return Err(Error::ActivationFailed(
                grain.clone(),
                "no active silo".to_owned(),
            ));
        }
        let local = self.membership.myself();
        let loads = self.loads.lock().unwrap_or_else(PoisonError::into_inner);
        let ctx = PlacementContext {
            grain,
            local: &local,
            candidates,
            loads: &loads,
        };
        let chosen = self.strategy.select(&ctx);
        trace!("{} placement chose {} for {}.", self.strategy.name(), chosen, grain);
        Ok(chosen)
    }

    /// Places `grain` and asks the chosen silo to activate it.
    ///
    /// Returns the activation that ended up registered, which may have been
    /// created elsewhere if another silo won the registration.
    pub async fn place(&self, grain: &GrainId) -> Result<ActivationAddress, Error> {
        let target = self.select(grain)?;
        debug!("Placing {} on {}.", grain, target);
        match self
            .messenger
            .request(
                &target,
                SiloRequest::Activate {
                    grain: grain.clone(),
                },
            )
            .await?
        {
            SiloResponse::Activated(address) => Ok(address),
            other => Err(other.unexpected("activate")),
        }
    }

    pub fn record_load(&self, silo: SiloAddress, activations: usize) {
        self.loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(silo, activations);
    }

    pub fn forget(&self, silo: &SiloAddress) {
        self.loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(silo);
    }

    /// Sends the local activation count to every other active silo.
    pub async fn publish_load(&self, activations: usize) {
        let myself = self.membership.myself();
        self.record_load(myself.clone(), activations);
        let peers: Vec<SiloAddress> = self
            .membership
            .view()
            .active_silos()
            .iter()
            .filter(|silo| **silo != myself)
            .cloned()
            .collect();
        let timeout = self.membership.config().probe_timeout;
        join_all(peers.iter().map(|peer| {
            self.messenger.request_with_timeout(
                peer,
                SiloRequest::LoadReport {
                    silo: myself.clone(),
                    activations,
                },
                timeout,
            )
        }))
        .await;
    }
}
