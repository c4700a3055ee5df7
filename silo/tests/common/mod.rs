// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Grains and cluster helpers shared by the cluster tests.

#![allow(dead_code)]

use silo::{
    ActivationAddress, Error, Grain, GrainContext, GrainId, GrainTypeOptions,
    InMemoryNetwork, PlacementContext, PlacementStrategy, ReentrantGrain,
    RequestEnvelope, ResponseEnvelope, Silo, SiloAddress, SiloBuilder, SiloConfig,
    codec,
};

use async_trait::async_trait;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

pub const INCREMENT: u32 = 0;
pub const WHERE: u32 = 1;
pub const SLOW: u32 = 2;
pub const CALL: u32 = 3;
pub const LEAVE: u32 = 4;
pub const BOUNCE: u32 = 5;

/// Counts calls and tells where it runs.
#[derive(Default)]
pub struct Counter {
    value: u64,
    activation_delay: Duration,
}

impl Counter {
    pub fn slow_to_activate(delay: Duration) -> Self {
        Self {
            value: 0,
            activation_delay: delay,
        }
    }
}

#[async_trait]
impl Grain for Counter {
    async fn on_activate(&mut self, _ctx: &mut GrainContext) -> Result<(), Error> {
        if !self.activation_delay.is_zero() {
            tokio::time::sleep(self.activation_delay).await;
        }
        Ok(())
    }

    async fn handle(
        &mut self,
        request: RequestEnvelope,
        ctx: &mut GrainContext,
    ) -> Result<ResponseEnvelope, Error> {
        match request.method {
            INCREMENT => {
                self.value += 1;
                reply(ctx.address(), self.value)
            }
            WHERE => reply(ctx.address(), self.value),
            SLOW => {
                let millis: u64 = codec::decode(&request.body)?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                reply(ctx.address(), self.value)
            }
            CALL => {
                let target: GrainId = codec::decode(&request.body)?;
                let body = codec::encode(ctx.grain_id())?;
                ctx.call(&target, CALL, body).await
            }
            LEAVE => {
                ctx.deactivate_on_idle();
                reply(ctx.address(), self.value)
            }
            other => Err(Error::Functional(format!("unknown method {}", other))),
        }
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), Error> {
        self.value = codec::decode(state)?;
        Ok(())
    }

    fn save_state(&self) -> Result<Option<Vec<u8>>, Error> {
        codec::encode(&self.value).map(Some)
    }
}

/// Reentrant counter. `CALL` increments the target, `BOUNCE` asks the
/// target to `CALL` back.
#[derive(Default)]
pub struct Relay {
    value: AtomicU64,
}

#[async_trait]
impl ReentrantGrain for Relay {
    async fn handle(
        &self,
        request: RequestEnvelope,
        ctx: &mut GrainContext,
    ) -> Result<ResponseEnvelope, Error> {
        match request.method {
            INCREMENT => {
                let value = self.value.fetch_add(1, Ordering::SeqCst) + 1;
                reply(ctx.address(), value)
            }
            SLOW => {
                let millis: u64 = codec::decode(&request.body)?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                reply(ctx.address(), self.value.load(Ordering::SeqCst))
            }
            CALL => {
                let target: GrainId = codec::decode(&request.body)?;
                ctx.call(&target, INCREMENT, Vec::new()).await
            }
            BOUNCE => {
                let target: GrainId = codec::decode(&request.body)?;
                let body = codec::encode(ctx.grain_id())?;
                ctx.call(&target, CALL, body).await
            }
            other => Err(Error::Functional(format!("unknown method {}", other))),
        }
    }
}

pub fn relay(_: &GrainId) -> Result<Arc<dyn ReentrantGrain>, Error> {
    Ok(Arc::new(Relay::default()))
}

fn reply(address: &ActivationAddress, value: u64) -> Result<ResponseEnvelope, Error> {
    codec::encode(&(address.clone(), value)).map(ResponseEnvelope::new)
}

/// Decodes a counter reply.
pub fn served_by(response: &ResponseEnvelope) -> (ActivationAddress, u64) {
    codec::decode(&response.body).unwrap()
}

pub fn request(method: u32) -> RequestEnvelope {
    RequestEnvelope::new(method, Vec::new())
}

pub fn slow_request(millis: u64) -> RequestEnvelope {
    RequestEnvelope::new(SLOW, codec::encode(&millis).unwrap())
}

/// Places every grain on the silo owning its directory entry.
pub struct OwnerPlacement;

impl PlacementStrategy for OwnerPlacement {
    fn name(&self) -> &'static str {
        "owner"
    }

    fn select(&self, ctx: &PlacementContext<'_>) -> SiloAddress {
        silo::ConsistentRing::new(ctx.candidates.iter().cloned(), 30)
            .owner(ctx.grain)
            .cloned()
            .unwrap_or_else(|| ctx.local.clone())
    }
}

pub fn counter(_: &GrainId) -> Result<Box<dyn Grain>, Error> {
    Ok(Box::new(Counter::default()))
}

pub fn slow_counter(_: &GrainId) -> Result<Box<dyn Grain>, Error> {
    Ok(Box::new(Counter::slow_to_activate(Duration::from_millis(100))))
}

pub fn config(port: u16) -> SiloConfig {
    let mut config = SiloConfig::fast("127.0.0.1", port);
    config.generation = Some(1);
    config
}

pub fn counter_builder(config: SiloConfig, network: &InMemoryNetwork) -> SiloBuilder {
    SiloBuilder::new(config)
        .register_grain("counter", counter, GrainTypeOptions::default())
        .register_grain("slow", slow_counter, GrainTypeOptions::default())
        .with_transport(Arc::new(network.clone()))
}

/// Starts one silo per port, the first one being the seed of the others.
pub async fn start_cluster<F>(
    network: &InMemoryNetwork,
    ports: &[u16],
    customize: F,
) -> Vec<Silo>
where
    F: Fn(SiloBuilder) -> SiloBuilder,
{
    let seed = SiloAddress::seed("127.0.0.1", ports[0]);
    let mut silos = Vec::new();
    for (i, port) in ports.iter().enumerate() {
        let mut config = config(*port);
        if i > 0 {
            config = config.with_seed(seed.clone());
        }
        let silo = customize(counter_builder(config, network))
            .start()
            .await
            .unwrap();
        silos.push(silo);
    }
    assert!(
        eventually(Duration::from_secs(5), || all_see_active(&silos, ports.len())).await,
        "cluster did not converge"
    );
    silos
}

pub fn all_see_active(silos: &[Silo], count: usize) -> bool {
    silos
        .iter()
        .all(|silo| silo.view().active_silos().len() == count)
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A grain of `grain_type` whose directory owner is `owner`.
pub fn grain_owned_by(silo: &Silo, grain_type: &str, owner: &SiloAddress) -> GrainId {
    let view = silo.view();
    (0..10_000)
        .map(|i| GrainId::new(grain_type, &format!("key-{}", i)))
        .find(|grain| view.owner(grain).as_ref() == Some(owner))
        .unwrap()
}

pub fn total_activations(silos: &[Silo], grain: &GrainId) -> usize {
    silos
        .iter()
        .flat_map(|silo| silo.local_activations())
        .filter(|address| address.grain == *grain)
        .count()
}
