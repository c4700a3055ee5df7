// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Grains
//!
//! The application side of the runtime. A grain type is registered with a
//! factory; the runtime creates an activation with it on first access and
//! feeds it requests one turn at a time.
//!
//! A [`ReentrantGrain`] takes `&self` and may have several turns in flight:
//! a request coming back through the call chain of a suspended turn runs
//! right away instead of waiting behind it. Requests from unrelated callers
//! still run one after the other.
//!

use crate::{
    activation::ActivationStats,
    error::Error,
    identity::{ActivationAddress, ActivationId, GrainId, SiloAddress},
    message::{RequestEnvelope, ResponseEnvelope},
    router::Router,
};

use async_trait::async_trait;

use std::{collections::HashMap, sync::Arc, time::Duration};

/// A virtual actor.
///
/// Only one turn of an activation runs at a time, so implementations need no
/// locking of their own.
#[async_trait]
pub trait Grain: Send + 'static {
    /// Runs after the stored state was loaded and before the first request.
    /// An error aborts the activation.
    async fn on_activate(&mut self, _ctx: &mut GrainContext) -> Result<(), Error> {
        Ok(())
    }

    /// Handles one request.
    async fn handle(
        &mut self,
        request: RequestEnvelope,
        ctx: &mut GrainContext,
    ) -> Result<ResponseEnvelope, Error>;

    /// Runs when the activation is deactivated, before its state is saved.
    async fn on_deactivate(&mut self, _ctx: &mut GrainContext) -> Result<(), Error> {
        Ok(())
    }

    /// Restores the stored state.
    fn load_state(&mut self, _state: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    /// State to store on deactivation. `None` stores nothing.
    fn save_state(&self) -> Result<Option<Vec<u8>>, Error> {
        Ok(None)
    }
}

/// A grain whose turns interleave along a call chain.
///
/// State shared between turns needs interior mutability, since a turn
/// suspended on a call may see another turn of the same chain change it.
#[async_trait]
pub trait ReentrantGrain: Send + Sync + 'static {
    async fn on_activate(&self, _ctx: &mut GrainContext) -> Result<(), Error> {
        Ok(())
    }

    async fn handle(
        &self,
        request: RequestEnvelope,
        ctx: &mut GrainContext,
    ) -> Result<ResponseEnvelope, Error>;

    async fn on_deactivate(&self, _ctx: &mut GrainContext) -> Result<(), Error> {
        Ok(())
    }

    fn load_state(&self, _state: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn save_state(&self) -> Result<Option<Vec<u8>>, Error> {
        Ok(None)
    }
}

/// Creates the grain of a new activation.
pub trait GrainFactory: Send + Sync + 'static {
    fn create(&self, grain: &GrainId) -> Result<Box<dyn Grain>, Error>;
}

impl<F> GrainFactory for F
where
    F: Fn(&GrainId) -> Result<Box<dyn Grain>, Error> + Send + Sync + 'static,
{
    fn create(&self, grain: &GrainId) -> Result<Box<dyn Grain>, Error> {
        self(grain)
    }
}

/// Creates the grain of a new reentrant activation.
pub trait ReentrantGrainFactory: Send + Sync + 'static {
    fn create(&self, grain: &GrainId) -> Result<Arc<dyn ReentrantGrain>, Error>;
}

impl<F> ReentrantGrainFactory for F
where
    F: Fn(&GrainId) -> Result<Arc<dyn ReentrantGrain>, Error> + Send + Sync + 'static,
{
    fn create(&self, grain: &GrainId) -> Result<Arc<dyn ReentrantGrain>, Error> {
        self(grain)
    }
}

/// The grain behind an activation.
pub(crate) enum GrainInstance {
    Exclusive(Box<dyn Grain>),
    Reentrant(Arc<dyn ReentrantGrain>),
}

impl GrainInstance {
    pub(crate) fn is_reentrant(&self) -> bool {
        matches!(self, GrainInstance::Reentrant(_))
    }

    pub(crate) async fn on_activate(&mut self, ctx: &mut GrainContext) -> Result<(), Error> {
        match self {
            GrainInstance::Exclusive(grain) => grain.on_activate(ctx).await,
            GrainInstance::Reentrant(grain) => grain.on_activate(ctx).await,
        }
    }

    pub(crate) async fn handle(
        &mut self,
        request: RequestEnvelope,
        ctx: &mut GrainContext,
    ) -> Result<ResponseEnvelope, Error> {
        match self {
            GrainInstance::Exclusive(grain) => grain.handle(request, ctx).await,
            GrainInstance::Reentrant(grain) => grain.handle(request, ctx).await,
        }
    }

    pub(crate) async fn on_deactivate(&mut self, ctx: &mut GrainContext) -> Result<(), Error> {
        match self {
            GrainInstance::Exclusive(grain) => grain.on_deactivate(ctx).await,
            GrainInstance::Reentrant(grain) => grain.on_deactivate(ctx).await,
        }
    }

    pub(crate) fn load_state(&mut self, state: &[u8]) -> Result<(), Error> {
        match self {
            GrainInstance::Exclusive(grain) => grain.load_state(state),
            GrainInstance::Reentrant(grain) => grain.load_state(state),
        }
    }

    pub(crate) fn save_state(&self) -> Result<Option<Vec<u8>>, Error> {
        match self {
            GrainInstance::Exclusive(grain) => grain.save_state(),
            GrainInstance::Reentrant(grain) => grain.save_state(),
        }
    }
}

/// Per grain type behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrainTypeOptions {
    /// Idle time before collection, overriding the silo setting.
    pub collection_age: Option<Duration>,
}

impl GrainTypeOptions {
    pub fn collection_age(mut self, age: Duration) -> Self {
        self.collection_age = Some(age);
        self
    }
}

#[derive(Clone)]
enum Factory {
    Exclusive(Arc<dyn GrainFactory>),
    Reentrant(Arc<dyn ReentrantGrainFactory>),
}

#[derive(Clone)]
struct RegisteredGrain {
    factory: Factory,
    options: GrainTypeOptions,
}

/// Grain types a silo can activate.
#[derive(Clone, Default)]
pub struct GrainRegistry {
    types: HashMap<String, RegisteredGrain>,
}

impl GrainRegistry {
    pub fn register(
        &mut self,
        grain_type: &str,
        factory: Arc<dyn GrainFactory>,
        options: GrainTypeOptions,
    ) {
        self.types.insert(
            grain_type.to_owned(),
            RegisteredGrain {
                factory: Factory::Exclusive(factory),
                options,
            },
        );
    }

    pub fn register_reentrant(
        &mut self,
        grain_type: &str,
        factory: Arc<dyn ReentrantGrainFactory>,
        options: GrainTypeOptions,
    ) {
        self.types.insert(
            grain_type.to_owned(),
            RegisteredGrain {
                factory: Factory::Reentrant(factory),
                options,
            },
        );
    }

    pub fn is_reentrant(&self, grain_type: &str) -> bool {
        self.types
            .get(grain_type)
            .is_some_and(|registered| matches!(registered.factory, Factory::Reentrant(_)))
    }

    pub fn contains(&self, grain_type: &str) -> bool {
        self.types.contains_key(grain_type)
    }

    pub fn options(&self, grain_type: &str) -> Option<&GrainTypeOptions> {
        self.types.get(grain_type).map(|registered| &registered.options)
    }

    /// Creates a grain and returns it with the options of its type.
    pub(crate) fn create(
        &self,
        grain: &GrainId,
    ) -> Result<(GrainInstance, GrainTypeOptions), Error> {
        let registered = self
            .types
            .get(grain.grain_type())
            .ok_or_else(|| Error::UnknownGrainType(grain.grain_type().to_owned()))?;
        let created = match &registered.factory {
            Factory::Exclusive(factory) => factory.create(grain).map(GrainInstance::Exclusive),
            Factory::Reentrant(factory) => factory.create(grain).map(GrainInstance::Reentrant),
        }
        .map_err(|e| Error::ActivationFailed(grain.clone(), e.to_string()))?;
        Ok((created, registered.options.clone()))
    }
}

/// What an activation knows about itself while it runs.
#[derive(Clone)]
pub struct GrainContext {
    address: ActivationAddress,
    router: Arc<Router>,
    stats: Arc<ActivationStats>,
    call_chain: Vec<ActivationId>,
}

impl GrainContext {
    pub(crate) fn new(
        address: ActivationAddress,
        router: Arc<Router>,
        stats: Arc<ActivationStats>,
    ) -> Self {
        Self {
            address,
            router,
            stats,
            call_chain: Vec::new(),
        }
    }

    pub fn address(&self) -> &ActivationAddress {
        &self.address
    }

    pub fn grain_id(&self) -> &GrainId {
        &self.address.grain
    }

    pub fn silo(&self) -> &SiloAddress {
        &self.address.silo
    }

    /// Calls another grain from the current turn.
    pub async fn call(
        &self,
        grain: &GrainId,
        method: u32,
        body: Vec<u8>,
    ) -> Result<ResponseEnvelope, Error> {
        let mut call_chain = self.call_chain.clone();
        call_chain.push(self.address.activation.clone());
        let envelope = RequestEnvelope {
            method,
            body,
            call_chain,
        };
        self.router.call(grain, envelope).await
    }

    /// Deactivates the activation once the current turn is over.
    pub fn deactivate_on_idle(&self) {
        self.stats.request_deactivation();
    }

    /// Keeps the activation from being collected for `period`.
    pub fn delay_deactivation(&self, period: Duration) {
        self.stats.keep_alive_for(period);
    }

    pub(crate) fn set_call_chain(&mut self, call_chain: Vec<ActivationId>) {
        self.call_chain = call_chain;
    }
}
