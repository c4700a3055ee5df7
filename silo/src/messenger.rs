// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Messenger
//!
//! Outbound requests of one silo. Requests addressed to the silo itself are
//! served in place; the others go through the transport.
//!

use crate::{
    error::Error,
    identity::SiloAddress,
    membership_service::MembershipService,
    message::{SiloRequest, SiloResponse},
    transport::{RequestHandler, Transport},
};

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

pub struct Messenger {
    membership: Arc<MembershipService>,
    transport: Arc<dyn Transport>,
    local: Weak<dyn RequestHandler>,
    response_timeout: Duration,
}

impl Messenger {
    pub fn new(
        membership: Arc<MembershipService>,
        transport: Arc<dyn Transport>,
        local: Weak<dyn RequestHandler>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            membership,
            transport,
            local,
            response_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Sends a request with the default response timeout.
    pub async fn request(
        &self,
        target: &SiloAddress,
        request: SiloRequest,
    ) -> Result<SiloResponse, Error> {
        self.request_with_timeout(target, request, self.response_timeout)
            .await
    }

    /// Sends a request. `Failed` responses come back as errors.
    pub async fn request_with_timeout(
        &self,
        target: &SiloAddress,
        request: SiloRequest,
        timeout: Duration,
    ) -> Result<SiloResponse, Error> {
        let myself = self.membership.myself();
        let response = if target.designates(&myself) {
            let Some(local) = self.local.upgrade() else {
                return Err(Error::SiloStopped(myself));
            };
            tokio::time::timeout(timeout, local.handle(myself, request))
                .await
                .map_err(|_| Error::Timeout(timeout.as_millis() as u64))?
        } else {
            self.transport
                .request(&myself, target, request, timeout)
                .await?
        };
        response.into_result()
    }
}
