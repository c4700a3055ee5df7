// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Transport
//!
//! Point-to-point request/response between silos. A transport binds the
//! inbound handler of each local silo to its endpoint and carries requests
//! to remote endpoints. Failing to reach a silo, or reaching a different
//! generation of it, is reported as `NodeUnreachable`.
//!

use crate::{
    error::Error,
    identity::SiloAddress,
    message::{SiloRequest, SiloResponse},
};

use async_trait::async_trait;

use std::{sync::Arc, time::Duration};

/// Inbound side of a silo.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Serves one request. Failures are answered with
    /// [`SiloResponse::Failed`].
    async fn handle(&self, from: SiloAddress, request: SiloRequest) -> SiloResponse;
}

/// Outbound side shared by all silos of a process.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts delivering requests addressed to `address` to `handler`.
    async fn bind(
        &self,
        address: SiloAddress,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), Error>;

    /// Stops delivering requests to `address`.
    async fn unbind(&self, address: &SiloAddress);

    /// Sends a request and waits for its response.
    ///
    /// A `Failed` response is returned as is; use
    /// [`SiloResponse::into_result`] to turn it into an error.
    async fn request(
        &self,
        from: &SiloAddress,
        target: &SiloAddress,
        request: SiloRequest,
        timeout: Duration,
    ) -> Result<SiloResponse, Error>;
}

/// Error for a target that did not answer.
pub(crate) fn unreachable(target: &SiloAddress, reason: impl ToString) -> Error {
    Error::NodeUnreachable(target.clone(), reason.to_string())
}
