// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Activation catalog
//!
//! The activations hosted by one silo. Creating an activation is serialized
//! per grain on the local silo; across silos the directory decides. An
//! activation that loses its registration is stopped and the caller is
//! redirected to the winner.
//!

use crate::{
    activation::{ActivationHandle, ActivationRunner},
    config::CollectionConfig,
    directory::DirectoryEntry,
    error::Error,
    grain::{GrainContext, GrainRegistry},
    grain_directory::GrainDirectory,
    identity::{ActivationAddress, ActivationId, GrainId},
    membership_service::{ClusterView, MembershipService},
    message::{RequestEnvelope, ResponseEnvelope},
    router::Router,
};

use store::GrainStorage;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Instant,
};

pub struct Catalog {
    membership: Arc<MembershipService>,
    directory: Arc<GrainDirectory>,
    router: Arc<Router>,
    registry: GrainRegistry,
    storage: Option<Arc<dyn GrainStorage>>,
    collection: CollectionConfig,
    activations: RwLock<HashMap<GrainId, ActivationHandle>>,
    /// Per grain creation locks.
    creating: Mutex<HashMap<GrainId, Arc<tokio::sync::Mutex<()>>>>,
    idle_sender: mpsc::UnboundedSender<ActivationAddress>,
}

impl Catalog {
    /// Creates the catalog and the receiver of deactivation requests made
    /// by grains.
    pub fn new(
        membership: Arc<MembershipService>,
        directory: Arc<GrainDirectory>,
        router: Arc<Router>,
        registry: GrainRegistry,
        storage: Option<Arc<dyn GrainStorage>>,
        collection: CollectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ActivationAddress>) {
        let (idle_sender, idle_receiver) = mpsc::unbounded_channel();
        let catalog = Self {
            membership,
            directory,
            router,
            registry,
            storage,
            collection,
            activations: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
            idle_sender,
        };
        (catalog, idle_receiver)
    }

    pub fn get(&self, grain: &GrainId) -> Option<ActivationHandle> {
        self.activations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(grain)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.activations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn local_addresses(&self) -> Vec<ActivationAddress> {
        self.activations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|handle| handle.address().clone())
            .collect()
    }

    /// Removes the handle of `grain` if it matches `activation`.
    fn take(
        &self,
        grain: &GrainId,
        activation: Option<&ActivationId>,
    ) -> Option<ActivationHandle> {
        let mut activations = self
            .activations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let matches = activations.get(grain).is_some_and(|handle| {
            activation.is_none_or(|id| handle.address().activation == *id)
        });
        if matches {
            activations.remove(grain)
        } else {
            None
        }
    }

    fn creation_lock(&self, grain: &GrainId) -> Arc<tokio::sync::Mutex<()>> {
        self.creating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(grain.clone())
            .or_default()
            .clone()
    }

    fn release_creation_lock(&self, grain: &GrainId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        // Held by the map and by us only.
        if Arc::strong_count(&lock) <= 2 {
            creating.remove(grain);
        }
    }

    /// Returns the activation of `grain`, creating and registering a local
    /// one if needed.
    ///
    /// When another silo registered first the local activation is stopped
    /// and the winner is returned.
    pub async fn activate(&self, grain: &GrainId) -> Result<ActivationAddress, Error> {
        if let Some(handle) = self.get(grain) {
            return Ok(handle.address().clone());
        }
        let lock = self.creation_lock(grain);
        let result = {
            let _guard = lock.lock().await;
            match self.get(grain) {
                Some(handle) => Ok(handle.address().clone()),
                None => self.create(grain).await,
            }
        };
        self.release_creation_lock(grain, lock);
        result
    }

    async fn create(&self, grain: &GrainId) -> Result<ActivationAddress, Error> {
        let (created, options) = self.registry.create(grain)?;
        let address = ActivationAddress::new(
            self.membership.myself(),
            grain.clone(),
            ActivationId::new(),
        );
        let (runner, handle) = ActivationRunner::create(
            address.clone(),
            created,
            options,
            self.storage.clone(),
            self.idle_sender.clone(),
        );
        let ctx = GrainContext::new(
            address.clone(),
            self.router.clone(),
            handle.stats().clone(),
        );
        let (started_sender, started) = oneshot::channel();
        tokio::spawn(runner.init(ctx, started_sender));
        match started.await {
            Ok(Ok(())) => {}
            Ok(Err(Error::ActivationFailed(grain, reason))) => {
                return Err(Error::ActivationFailed(grain, reason));
            }
            Ok(Err(e)) => return Err(Error::ActivationFailed(grain.clone(), e.to_string())),
            Err(_) => {
                return Err(Error::ActivationFailed(
                    grain.clone(),
                    "activation ended before starting".to_owned(),
                ));
            }
        }

        // Visible before registration so calls routed by the directory find it.
        self.activations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(grain.clone(), handle.clone());

        match self.directory.register(&address).await {
            Ok(_) => {
                debug!("Activated {}.", address);
                Ok(address)
            }
            Err(Error::AlreadyRegistered { existing }) => {
                info!(
                    "{} lost the registration race to {}, redirecting.",
                    address, existing
                );
                self.take(grain, Some(&address.activation));
                handle.stop(false).await;
                Ok(existing)
            }
            Err(e) => {
                warn!("Can not register {}: {}", address, e);
                self.take(grain, Some(&address.activation));
                handle.stop(false).await;
                Err(e)
            }
        }
    }

    /// Runs a call on a local activation.
    pub async fn deliver(
        &self,
        target: &ActivationAddress,
        envelope: RequestEnvelope,
    ) -> Result<ResponseEnvelope, Error> {
        let handle = self
            .get(&target.grain)
            .filter(|handle| handle.address().activation == target.activation)
            .ok_or_else(|| Error::StaleActivation(target.clone()))?;
        if !handle.is_reentrant() && envelope.call_chain.contains(&target.activation) {
            warn!("Call cycle through {} rejected.", target);
            return Err(Error::Deadlock(target.clone()));
        }
        handle.request(envelope).await
    }

    /// Deactivates the local activation of `grain`, only if it is
    /// `activation` when given. Returns false when there was none.
    pub async fn deactivate(
        &self,
        grain: &GrainId,
        activation: Option<&ActivationId>,
        persist: bool,
    ) -> bool {
        let Some(handle) = self.take(grain, activation) else {
            return false;
        };
        if let Err(e) = self.directory.unregister(handle.address()).await {
            debug!("Can not unregister {}: {}", handle.address(), e);
        }
        handle.stop(persist).await;
        true
    }

    /// Deactivates every activation idle for longer than its collection
    /// age. Returns how many were collected.
    pub async fn collect_idle(&self, now: Instant) -> usize {
        let idle: Vec<ActivationAddress> = self
            .activations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| {
                let age = handle.options().collection_age.unwrap_or_else(|| {
                    self.collection.age_for(handle.address().grain.grain_type())
                });
                handle.stats().is_collectable(now, age)
            })
            .map(|handle| handle.address().clone())
            .collect();
        let mut collected = 0;
        for address in idle {
            if self
                .deactivate(&address.grain, Some(&address.activation), true)
                .await
            {
                collected += 1;
            }
        }
        if collected > 0 {
            debug!("Collected {} idle activations.", collected);
        }
        collected
    }

    /// Gracefully deactivates every activation.
    pub async fn deactivate_all(&self) {
        let addresses = self.local_addresses();
        join_all(addresses.iter().map(|address| {
            self.deactivate(&address.grain, Some(&address.activation), true)
        }))
        .await;
    }

    /// Stops every activation without touching the directory or storage.
    /// Used once the silo was declared dead.
    pub async fn drop_all(&self) {
        let handles: Vec<ActivationHandle> = self
            .activations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        if !handles.is_empty() {
            warn!("Dropping {} activations.", handles.len());
        }
        join_all(handles.iter().map(|handle| handle.stop(false))).await;
    }

    /// Registers local activations again with owners that changed, so
    /// records lost with a dead owner come back.
    pub async fn reregister(&self, previous: &ClusterView, current: &ClusterView) {
        let moved: Vec<DirectoryEntry> = self
            .local_addresses()
            .into_iter()
            .filter(|address| previous.owner(&address.grain) != current.owner(&address.grain))
            .map(DirectoryEntry::valid)
            .collect();
        if !moved.is_empty() {
            debug!("Registering {} activations with new owners.", moved.len());
            self.directory.hand_over(moved).await;
        }
    }
}
