// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Store errors
//!
//! Errors raised by grain storage providers. They are serializable so a silo
//! can ship them back to a remote caller inside a response envelope.
//!

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for grain storage providers.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq)]
pub enum Error {
    /// The provider could not be created or opened.
    #[error("Can't create store: {0}")]
    CreateStore(String),

    /// Reading a grain state failed.
    ///
    /// A missing state is not an error: providers return `Ok(None)` for it.
    #[error("Get error: {0}")]
    Get(String),

    /// Writing or clearing a grain state failed.
    #[error("Store error: {0}")]
    Store(String),
}
