// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Silo
//!
//! The `silo` module wires the cluster services of one node together and
//! drives them. A silo is built with a `SiloBuilder`, joins the cluster
//! through its seeds, and runs its background tasks until it is shut down
//! or killed.
//!
//! A silo that finds itself declared dead drops its activations and its
//! directory partition, then rejoins with a new generation when
//! `auto_rejoin` is set.
//!

use crate::{
    catalog::Catalog,
    collector::Collector,
    config::SiloConfig,
    error::Error,
    failure_detector::FailureDetector,
    gossip::Gossiper,
    grain::{Grain, GrainFactory, GrainRegistry, GrainTypeOptions, ReentrantGrain},
    grain_directory::GrainDirectory,
    identity::{ActivationAddress, GrainId, SiloAddress},
    membership::{MembershipEvent, SiloStatus},
    membership_service::{ClusterView, MembershipService},
    message::{RequestEnvelope, ResponseEnvelope, SiloRequest, SiloResponse},
    messenger::Messenger,
    placement::{PlacementEngine, PlacementStrategy, strategy_for},
    router::Router,
    tcp_transport::TcpTransport,
    transport::{RequestHandler, Transport, unreachable},
};

use store::GrainStorage;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

/// Builds and starts a silo.
pub struct SiloBuilder {
    config: SiloConfig,
    registry: GrainRegistry,
    storage: Option<Arc<dyn GrainStorage>>,
    placement: Option<Arc<dyn PlacementStrategy>>,
    transport: Option<Arc<dyn Transport>>,
}

impl SiloBuilder {
    pub fn new(config: SiloConfig) -> Self {
        Self {
            config,
            registry: GrainRegistry::default(),
            storage: None,
            placement: None,
            transport: None,
        }
    }

    /// Registers a grain type created by a closure.
    pub fn register_grain<F>(
        self,
        grain_type: &str,
        factory: F,
        options: GrainTypeOptions,
    ) -> Self
    where
        F: Fn(&GrainId) -> Result<Box<dyn Grain>, Error> + Send + Sync + 'static,
    {
        self.register_factory(grain_type, Arc::new(factory), options)
    }

    /// Registers a grain type created by a factory.
    pub fn register_factory(
        mut self,
        grain_type: &str,
        factory: Arc<dyn GrainFactory>,
        options: GrainTypeOptions,
    ) -> Self {
        self.registry.register(grain_type, factory, options);
        self
    }

    /// Registers a reentrant grain type created by a closure.
    pub fn register_reentrant_grain<F>(
        mut self,
        grain_type: &str,
        factory: F,
        options: GrainTypeOptions,
    ) -> Self
    where
        F: Fn(&GrainId) -> Result<Arc<dyn ReentrantGrain>, Error> + Send + Sync + 'static,
    {
        self.registry
            .register_reentrant(grain_type, Arc::new(factory), options);
        self
    }

    /// Storage for grain state. Without it grains are never loaded nor saved.
    pub fn with_storage(mut self, storage: Arc<dyn GrainStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Overrides the configured placement strategy.
    pub fn with_placement(mut self, strategy: Arc<dyn PlacementStrategy>) -> Self {
        self.placement = Some(strategy);
        self
    }

    /// Transport to reach other silos. Defaults to TCP.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Starts the silo and joins the cluster.
    pub async fn start(self) -> Result<Silo, Error> {
        let SiloBuilder {
            config,
            registry,
            storage,
            placement,
            transport,
        } = self;
        let transport = transport.unwrap_or_else(|| Arc::new(TcpTransport::new()));
        let strategy = placement.unwrap_or_else(|| strategy_for(&config.placement));
        let myself = match config.generation {
            Some(generation) => SiloAddress::new(&config.host, config.port, generation),
            None => SiloAddress::with_current_generation(&config.host, config.port),
        };
        let membership = Arc::new(MembershipService::new(
            myself.clone(),
            config.membership.clone(),
            config.directory.virtual_buckets_per_silo,
        ));

        let mut idle = None;
        let core = Arc::new_cyclic(|weak: &Weak<SiloCore>| {
            let local: Weak<dyn RequestHandler> = weak.clone();
            let messenger = Arc::new(Messenger::new(
                membership.clone(),
                transport.clone(),
                local,
                config.messaging.response_timeout,
            ));
            let gossiper = Arc::new(Gossiper::new(membership.clone(), messenger.clone()));
            let failure_detector = Arc::new(FailureDetector::new(
                membership.clone(),
                messenger.clone(),
            ));
            let directory = Arc::new(GrainDirectory::new(
                membership.clone(),
                messenger.clone(),
                gossiper.clone(),
                &config.directory,
                config.messaging.max_forward_count,
            ));
            let placement = Arc::new(PlacementEngine::new(
                strategy,
                membership.clone(),
                messenger.clone(),
            ));
            let router = Arc::new(Router::new(
                membership.clone(),
                directory.clone(),
                placement.clone(),
                messenger.clone(),
                failure_detector.clone(),
                config.messaging.clone(),
            ));
            let (catalog, idle_receiver) = Catalog::new(
                membership.clone(),
                directory.clone(),
                router.clone(),
                registry,
                storage,
                config.collection.clone(),
            );
            idle = Some(idle_receiver);
            SiloCore {
                config,
                membership: membership.clone(),
                transport: transport.clone(),
                messenger,
                gossiper,
                failure_detector,
                directory,
                placement,
                router,
                catalog: Arc::new(catalog),
                stopping: AtomicBool::new(false),
                token: CancellationToken::new(),
            }
        });

        transport.bind(myself.clone(), core.clone()).await?;
        membership.start_joining(0);
        if let Err(e) = core.join().await {
            error!("{} could not join the cluster: {}", myself, e);
            transport.unbind(&myself).await;
            return Err(e);
        }

        let idle = idle.unwrap_or_else(|| mpsc::unbounded_channel().1);
        core.spawn_tasks(idle);
        info!("Silo {} started.", myself);
        Ok(Silo { core })
    }
}

/// Services of one silo, shared by its tasks and its inbound handler.
struct SiloCore {
    config: SiloConfig,
    membership: Arc<MembershipService>,
    transport: Arc<dyn Transport>,
    messenger: Arc<Messenger>,
    gossiper: Arc<Gossiper>,
    failure_detector: Arc<FailureDetector>,
    directory: Arc<GrainDirectory>,
    placement: Arc<PlacementEngine>,
    router: Arc<Router>,
    catalog: Arc<Catalog>,
    stopping: AtomicBool,
    token: CancellationToken,
}

impl SiloCore {
    /// Joins through the seeds, or bootstraps a new cluster without them.
    ///
    /// Expects the local Joining entry to be in the table.
    async fn join(&self) -> Result<(), Error> {
        let myself = self.membership.myself();
        let entry = self
            .membership
            .own_entry()
            .ok_or_else(|| Error::Join(format!("{} has no membership entry", myself)))?;
        let mut seeds: Vec<SiloAddress> = self
            .config
            .seeds
            .iter()
            .filter(|seed| !seed.same_endpoint(&myself))
            .cloned()
            .collect();
        if seeds.is_empty() {
            // A rejoining seed-less silo goes through the silos it knew.
            seeds = self
                .membership
                .view()
                .live_silos()
                .into_iter()
                .filter(|silo| !silo.same_endpoint(&myself))
                .collect();
        }

        if seeds.is_empty() {
            info!("{} bootstraps a new cluster.", myself);
            self.membership.set_own_status(SiloStatus::Active);
            return Ok(());
        }

        let mut retries = self.config.join_retry.retries();
        loop {
            for seed in &seeds {
                let request = SiloRequest::Join {
                    entry: entry.clone(),
                };
                match self.messenger.request(seed, request).await {
                    Ok(SiloResponse::Membership(entries)) => {
                        debug!("{} joined through {}.", myself, seed);
                        self.membership.apply(entries);
                        self.membership.set_own_status(SiloStatus::Active);
                        self.gossiper.broadcast().await;
                        return Ok(());
                    }
                    Ok(other) => {
                        debug!("Seed {} answered the join with {:?}.", seed, other)
                    }
                    Err(e) => debug!("Seed {} did not accept the join: {}", seed, e),
                }
            }
            if !retries.wait().await {
                return Err(Error::Join(format!(
                    "no seed answered after {} retries",
                    retries.attempts()
                )));
            }
            debug!("{} retries its seeds ({}).", myself, retries.attempts());
        }
    }

    fn spawn_tasks(self: &Arc<Self>, idle: mpsc::UnboundedReceiver<ActivationAddress>) {
        tokio::spawn(self.failure_detector.clone().run(self.token.clone()));
        tokio::spawn(self.gossiper.clone().run(self.token.clone()));
        let collector = Collector::new(
            self.catalog.clone(),
            self.config.collection.collection_quantum,
        );
        tokio::spawn(collector.run(idle, self.token.clone()));
        tokio::spawn(self.clone().publish_load());
        tokio::spawn(self.clone().follow_view());
    }

    async fn publish_load(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(self.config.placement.load_publish_interval);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {
                    self.placement.publish_load(self.catalog.count()).await;
                }
            }
        }
    }

    /// Applies membership changes to the directory and the catalog.
    async fn follow_view(self: Arc<Self>) {
        let mut watch = self.membership.watch();
        let mut previous = watch.borrow_and_update().clone();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                changed = watch.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let current = watch.borrow_and_update().clone();

            if self.membership.own_status() == Some(SiloStatus::Dead)
                && !self.stopping.load(Ordering::SeqCst)
            {
                self.on_declared_dead().await;
                previous = self.membership.view();
                continue;
            }

            for dead in current.dead_silos() {
                if !previous.is_dead(&dead) {
                    self.placement.forget(&dead);
                }
            }
            self.directory.on_view_change(&previous, &current).await;
            if previous.active_silos() != current.active_silos() {
                debug!(
                    "Ring of {} now has {} silos.",
                    self.membership.myself(),
                    current.active_silos().len()
                );
                self.catalog.reregister(&previous, &current).await;
            }
            previous = current;
        }
        debug!("Stopped following membership.");
    }

    async fn on_declared_dead(self: &Arc<Self>) {
        let old = self.membership.myself();
        warn!("{} was declared dead, dropping its activations.", old);
        self.catalog.drop_all().await;
        self.directory.clear();

        if !self.config.auto_rejoin {
            self.stopping.store(true, Ordering::SeqCst);
            self.token.cancel();
            self.transport.unbind(&old).await;
            return;
        }

        self.transport.unbind(&old).await;
        let next = self.membership.rejoin();
        let handler: Arc<dyn RequestHandler> = self.clone();
        if let Err(e) = self.transport.bind(next.clone(), handler).await {
            error!("{} can not bind its new generation: {}", next, e);
            self.stopping.store(true, Ordering::SeqCst);
            self.token.cancel();
            return;
        }
        if let Err(e) = self.join().await {
            error!("{} can not rejoin: {}", next, e);
            self.stopping.store(true, Ordering::SeqCst);
            self.token.cancel();
            self.transport.unbind(&next).await;
        }
    }

    /// Answer of a silo that is dead or stopping.
    fn refuse(&self, request: &SiloRequest) -> SiloResponse {
        let myself = self.membership.myself();
        let error = match request {
            SiloRequest::Lookup { grain } => Error::NotOwner {
                grain: grain.clone(),
                silo: myself,
                owner_hint: None,
            },
            SiloRequest::Register { address } | SiloRequest::Unregister { address } => {
                Error::NotOwner {
                    grain: address.grain.clone(),
                    silo: myself,
                    owner_hint: None,
                }
            }
            _ => unreachable(&myself, "silo is not serving"),
        };
        SiloResponse::Failed(error)
    }

    async fn deliver(
        &self,
        target: ActivationAddress,
        envelope: RequestEnvelope,
    ) -> SiloResponse {
        match self.catalog.deliver(&target, envelope).await {
            Ok(response) => SiloResponse::Delivered(response),
            Err(Error::StaleActivation(stale)) => {
                // Whoever routed here read a record that is gone.
                if self.catalog.get(&stale.grain).is_none_or(|handle| {
                    handle.address().activation != stale.activation
                }) {
                    let directory = self.directory.clone();
                    let address = stale.clone();
                    tokio::spawn(async move {
                        if let Err(e) = directory.unregister(&address).await {
                            debug!("Can not unregister stale {}: {}", address, e);
                        }
                    });
                }
                SiloResponse::Failed(Error::StaleActivation(stale))
            }
            Err(e) => SiloResponse::Failed(e),
        }
    }
}

#[async_trait]
impl RequestHandler for SiloCore {
    async fn handle(&self, from: SiloAddress, request: SiloRequest) -> SiloResponse {
        trace!("{} request from {}.", request.kind(), from);
        let serving = !self.token.is_cancelled()
            && self.membership.own_status() != Some(SiloStatus::Dead);
        let stopping = self.stopping.load(Ordering::SeqCst);
        if !serving {
            return self.refuse(&request);
        }

        match request {
            SiloRequest::Ping => SiloResponse::Pong,
            SiloRequest::Join { entry } => {
                info!("{} is joining.", entry.silo);
                self.membership.retire_older_generations(&entry.silo);
                self.membership.apply(vec![entry]);
                SiloResponse::Membership(self.membership.entries())
            }
            SiloRequest::Gossip(message) => self.gossiper.handle(message),
            SiloRequest::Lookup { grain } => self
                .directory
                .handle_lookup(&grain)
                .map(SiloResponse::Lookup)
                .into(),
            SiloRequest::Register { address } => self
                .directory
                .handle_register(address)
                .map(SiloResponse::Registered)
                .into(),
            SiloRequest::Unregister { address } => self
                .directory
                .handle_unregister(&address)
                .map(|_| SiloResponse::Ack)
                .into(),
            SiloRequest::Handoff { entries, hops } => {
                self.directory.handle_handoff(entries, hops).await;
                SiloResponse::Ack
            }
            SiloRequest::Activate { .. } if stopping => self.refuse(&request),
            SiloRequest::Activate { grain } => {
                self.catalog.activate(&grain).await.map(SiloResponse::Activated).into()
            }
            SiloRequest::Deliver { target, envelope } => {
                self.deliver(target, envelope).await
            }
            SiloRequest::Deactivate { grain, activation } => {
                self.catalog.deactivate(&grain, activation.as_ref(), true).await;
                SiloResponse::Ack
            }
            SiloRequest::LoadReport { silo, activations } => {
                self.placement.record_load(silo, activations);
                SiloResponse::Ack
            }
        }
    }
}

/// A running silo.
pub struct Silo {
    core: Arc<SiloCore>,
}

impl Silo {
    pub fn builder(config: SiloConfig) -> SiloBuilder {
        SiloBuilder::new(config)
    }

    /// Current address, which changes when the silo rejoins.
    pub fn address(&self) -> SiloAddress {
        self.core.membership.myself()
    }

    pub fn config(&self) -> &SiloConfig {
        &self.core.config
    }

    /// Latest membership snapshot.
    pub fn view(&self) -> ClusterView {
        self.core.membership.view()
    }

    pub fn status(&self) -> Option<SiloStatus> {
        self.core.membership.own_status()
    }

    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.core.membership.subscribe()
    }

    /// Activation serving `grain`, creating one if needed.
    pub async fn resolve(&self, grain: &GrainId) -> Result<ActivationAddress, Error> {
        self.core.router.resolve(grain).await
    }

    /// Delivers a call to a known activation, without retries.
    pub async fn send(
        &self,
        target: &ActivationAddress,
        envelope: RequestEnvelope,
    ) -> Result<ResponseEnvelope, Error> {
        self.core.router.send(target, envelope).await
    }

    /// Calls a grain wherever it lives.
    pub async fn call(
        &self,
        grain: &GrainId,
        envelope: RequestEnvelope,
    ) -> Result<ResponseEnvelope, Error> {
        self.core.router.call(grain, envelope).await
    }

    /// Deactivates the registered activation of `grain`, wherever it lives.
    pub async fn deactivate(&self, grain: &GrainId) -> Result<(), Error> {
        let Some(address) = self.core.directory.lookup(grain).await? else {
            return Ok(());
        };
        self.core.directory.invalidate(grain);
        let request = SiloRequest::Deactivate {
            grain: grain.clone(),
            activation: Some(address.activation.clone()),
        };
        match self.core.messenger.request(&address.silo, request).await? {
            SiloResponse::Ack => Ok(()),
            other => Err(other.unexpected("deactivate")),
        }
    }

    /// Number of activations hosted here.
    pub fn activation_count(&self) -> usize {
        self.core.catalog.count()
    }

    pub fn local_activations(&self) -> Vec<ActivationAddress> {
        self.core.catalog.local_addresses()
    }

    /// Number of grains in the local directory partition.
    pub fn directory_partition_len(&self) -> usize {
        self.core.directory.partition_len()
    }

    /// Activation registered for `grain` in the local partition.
    pub fn directory_record(&self, grain: &GrainId) -> Result<Option<ActivationAddress>, Error> {
        self.core.directory.local_lookup(grain)
    }

    pub fn is_stopped(&self) -> bool {
        self.core.token.is_cancelled()
    }

    /// Leaves the cluster gracefully.
    ///
    /// Activations are deactivated and unregistered, the directory partition
    /// goes to the new owners, and the silo announces itself dead.
    pub async fn shutdown(&self) {
        let core = &self.core;
        if core.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let myself = core.membership.myself();
        info!("Silo {} is shutting down.", myself);
        core.catalog.deactivate_all().await;
        // Leaving the ring first makes the hand over target the new owners.
        core.membership.set_own_status(SiloStatus::Dead);
        core.directory.hand_over_all().await;
        core.gossiper.broadcast().await;
        core.token.cancel();
        core.transport.unbind(&myself).await;
        info!("Silo {} stopped.", myself);
    }

    /// Stops the silo at once, as a crash would. Nothing is announced.
    pub async fn kill(&self) {
        let core = &self.core;
        core.stopping.store(true, Ordering::SeqCst);
        core.token.cancel();
        let myself = core.membership.myself();
        core.transport.unbind(&myself).await;
        core.catalog.drop_all().await;
        warn!("Silo {} killed.", myself);
    }
}

impl Drop for Silo {
    fn drop(&mut self) {
        self.core.token.cancel();
    }
}
