// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Activation collector
//!
//! Deactivates idle activations every collection quantum, and activations
//! that asked to be deactivated as soon as they do.
//!

use crate::{catalog::Catalog, identity::ActivationAddress};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

pub struct Collector {
    catalog: Arc<Catalog>,
    quantum: Duration,
}

impl Collector {
    pub fn new(catalog: Arc<Catalog>, quantum: Duration) -> Self {
        Self { catalog, quantum }
    }

    pub async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<ActivationAddress>,
        token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.quantum);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.catalog.collect_idle(Instant::now()).await;
                }
                Some(address) = requests.recv() => {
                    debug!("{} asked to be deactivated.", address);
                    self.catalog
                        .deactivate(&address.grain, Some(&address.activation), true)
                        .await;
                }
            }
        }
        debug!("Collector stopped.");
    }
}
