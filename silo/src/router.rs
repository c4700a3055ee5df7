// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Router
//!
//! Resolves grains to activations and delivers calls to them. Resolution
//! tries the directory cache, then the directory owner, then placement.
//!
//! A stale route (the activation is gone, or a directory node refused the
//! grain) invalidates the cached address and re-resolves, up to
//! `max_forward_count` times. An unreachable silo is reported to the failure
//! detector and the call waits, for a bounded time, for membership to
//! declare it dead before resolving again.
//!

use crate::{
    config::MessagingConfig,
    error::Error,
    failure_detector::FailureDetector,
    grain_directory::GrainDirectory,
    identity::{ActivationAddress, GrainId, SiloAddress},
    membership_service::MembershipService,
    message::{RequestEnvelope, ResponseEnvelope, SiloRequest, SiloResponse},
    messenger::Messenger,
    placement::PlacementEngine,
};

use tracing::{debug, warn};

use std::sync::Arc;

pub struct Router {
    membership: Arc<MembershipService>,
    directory: Arc<GrainDirectory>,
    placement: Arc<PlacementEngine>,
    messenger: Arc<Messenger>,
    failure_detector: Arc<FailureDetector>,
    config: MessagingConfig,
}

impl Router {
    pub fn new(
        membership: Arc<MembershipService>,
        directory: Arc<GrainDirectory>,
        placement: Arc<PlacementEngine>,
        messenger: Arc<Messenger>,
        failure_detector: Arc<FailureDetector>,
        config: MessagingConfig,
    ) -> Self {
        Self {
            membership,
            directory,
            placement,
            messenger,
            failure_detector,
            config,
        }
    }

    /// Activation currently serving `grain`, creating one if there is none.
    pub async fn resolve(&self, grain: &GrainId) -> Result<ActivationAddress, Error> {
        if let Some(address) = self.directory.cached(grain) {
            if !self.membership.view().is_dead(&address.silo) {
                return Ok(address);
            }
            self.directory.invalidate_address(&address);
        }

        if let Some(address) = self.lookup_live(grain).await? {
            return Ok(address);
        }

        let address = self.placement.place(grain).await?;
        self.directory.cache_put(address.clone());
        Ok(address)
    }

    /// Directory lookup ignoring activations on silos known to be dead.
    async fn lookup_live(
        &self,
        grain: &GrainId,
    ) -> Result<Option<ActivationAddress>, Error> {
        let Some(address) = self.directory.lookup(grain).await? else {
            return Ok(None);
        };
        if !self.membership.view().is_dead(&address.silo) {
            return Ok(Some(address));
        }
        // The owner is behind: bring it up to date so it drops the record.
        debug!("Directory returned {} on a dead silo.", address);
        self.directory.invalidate_address(&address);
        self.directory.sync_owner(grain).await;
        match self.directory.lookup(grain).await? {
            Some(address) if self.membership.view().is_dead(&address.silo) => {
                self.directory.invalidate_address(&address);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Delivers a call to a known activation, without retries.
    pub async fn send(
        &self,
        target: &ActivationAddress,
        envelope: RequestEnvelope,
    ) -> Result<ResponseEnvelope, Error> {
        let request = SiloRequest::Deliver {
            target: target.clone(),
            envelope,
        };
        match self.messenger.request(&target.silo, request).await? {
            SiloResponse::Delivered(response) => Ok(response),
            other => Err(other.unexpected("deliver")),
        }
    }

    /// Calls a grain, activating it if needed.
    pub async fn call(
        &self,
        grain: &GrainId,
        envelope: RequestEnvelope,
    ) -> Result<ResponseEnvelope, Error> {
        let mut hops = 0;
        let mut unreachable = 0;
        loop {
            let result = match self.resolve(grain).await {
                Ok(target) => self.send(&target, envelope.clone()).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e @ Error::StaleActivation(_)) | Err(e @ Error::NotOwner { .. }) => {
                    debug!("Stale route to {}: {}", grain, e);
                    self.directory.invalidate(grain);
                    hops += 1;
                    if hops > self.config.max_forward_count {
                        warn!("Giving up on {} after {} re-resolutions.", grain, hops - 1);
                        return Err(Error::ForwardingLimitExceeded {
                            grain: grain.clone(),
                            limit: self.config.max_forward_count,
                        });
                    }
                }
                Err(Error::NodeUnreachable(silo, reason))
                    if unreachable < self.config.unreachable_retries =>
                {
                    unreachable += 1;
                    debug!("{} is unreachable while calling {}: {}", silo, grain, reason);
                    self.directory.invalidate(grain);
                    self.directory.invalidate_silo(&silo);
                    self.failure_detector.report_unreachable(&silo).await;
                    self.await_failure(&silo).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Waits until membership declares `silo` dead, at most
    /// `unreachable_retry_delay`.
    async fn await_failure(&self, silo: &SiloAddress) {
        let mut watch = self.membership.watch();
        let wait = async {
            loop {
                if watch.borrow_and_update().is_dead(silo) {
                    break;
                }
                if watch.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.config.unreachable_retry_delay, wait)
            .await
            .is_err()
        {
            debug!("{} is still not declared dead, retrying anyway.", silo);
        }
    }
}
