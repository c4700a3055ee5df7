// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # In-memory network
//!
//! A transport connecting silos of the same process. Every request and
//! response goes through the wire codec, so an in-process cluster exchanges
//! the same bytes a real network would. Faults are injected by killing a
//! silo (its endpoint disappears and its in-flight requests fail) or by
//! isolating it (nothing goes in or out until it is healed).
//!

use crate::{
    codec,
    error::Error,
    identity::SiloAddress,
    message::{SiloRequest, SiloResponse},
    transport::{RequestHandler, Transport, unreachable},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

struct Endpoint {
    address: SiloAddress,
    handler: Arc<dyn RequestHandler>,
    alive: CancellationToken,
}

#[derive(Default)]
struct NetworkState {
    /// Bound silos by `host:port`.
    endpoints: HashMap<String, Endpoint>,
    /// Endpoints cut off from everyone.
    isolated: HashSet<String>,
}

/// Transport for silos living in one process.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes a silo from the network. Requests in flight to it fail.
    pub fn kill(&self, silo: &SiloAddress) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(endpoint) = state.endpoints.remove(&silo.endpoint()) {
            endpoint.alive.cancel();
        }
        state.isolated.insert(silo.endpoint());
        debug!("Network killed {}.", silo);
    }

    /// Cuts a silo off without stopping it.
    pub fn isolate(&self, silo: &SiloAddress) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.isolated.insert(silo.endpoint());
        debug!("Network isolated {}.", silo);
    }

    /// Reconnects an isolated silo.
    pub fn heal(&self, silo: &SiloAddress) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.isolated.remove(&silo.endpoint());
        debug!("Network healed {}.", silo);
    }

    /// Address currently bound at the endpoint of `silo`.
    pub fn bound(&self, silo: &SiloAddress) -> Option<SiloAddress> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .endpoints
            .get(&silo.endpoint())
            .map(|endpoint| endpoint.address.clone())
    }

    fn route(
        &self,
        from: &SiloAddress,
        target: &SiloAddress,
    ) -> Result<(Arc<dyn RequestHandler>, CancellationToken), Error> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.isolated.contains(&from.endpoint())
            || state.isolated.contains(&target.endpoint())
        {
            return Err(unreachable(target, "network partition"));
        }
        let Some(endpoint) = state.endpoints.get(&target.endpoint()) else {
            return Err(unreachable(target, "no silo bound"));
        };
        if !target.designates(&endpoint.address) {
            return Err(unreachable(
                target,
                format!("endpoint is bound to {}", endpoint.address),
            ));
        }
        Ok((endpoint.handler.clone(), endpoint.alive.clone()))
    }
}

#[async_trait]
impl Transport for InMemoryNetwork {
    async fn bind(
        &self,
        address: SiloAddress,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), Error> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let endpoint = address.endpoint();
        if let Some(existing) = state.endpoints.get(&endpoint) {
            if existing.address != address && !existing.alive.is_cancelled() {
                return Err(Error::Transport(format!(
                    "Endpoint {} is already bound to {}",
                    endpoint, existing.address
                )));
            }
        }
        state.isolated.remove(&endpoint);
        state.endpoints.insert(
            endpoint,
            Endpoint {
                address,
                handler,
                alive: CancellationToken::new(),
            },
        );
        Ok(())
    }

    async fn unbind(&self, address: &SiloAddress) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let endpoint = address.endpoint();
        if state
            .endpoints
            .get(&endpoint)
            .is_some_and(|bound| bound.address == *address)
        {
            if let Some(bound) = state.endpoints.remove(&endpoint) {
                bound.alive.cancel();
            }
        }
    }

    async fn request(
        &self,
        from: &SiloAddress,
        target: &SiloAddress,
        request: SiloRequest,
        timeout: Duration,
    ) -> Result<SiloResponse, Error> {
        let (handler, alive) = self.route(from, target)?;
        let request = codec::round_trip(&request)?;
        let response = tokio::select! {
            response = tokio::time::timeout(
                timeout,
                handler.handle(from.clone(), request),
            ) => response.map_err(|_| Error::Timeout(timeout.as_millis() as u64))?,
            _ = alive.cancelled() => {
                return Err(unreachable(target, "silo killed"));
            }
        };
        codec::round_trip(&response)
    }
}
