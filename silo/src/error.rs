// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!
//! One error type for the whole cluster core. Errors are serializable because
//! a silo answers a failed remote request with the error itself, and the
//! caller's router decides from the variant whether to redirect, retry or
//! surface the failure.
//!

use crate::identity::{ActivationAddress, GrainId, SiloAddress};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the cluster core.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The silo asked about a grain is not its directory owner in its own
    /// view of the ring. Carries the owner that silo believes in, if any.
    #[error("Silo {silo} does not own grain {grain}.")]
    NotOwner {
        grain: GrainId,
        silo: SiloAddress,
        owner_hint: Option<SiloAddress>,
    },
    /// A different activation is already registered for the grain.
    /// The caller must discard its own activation and use `existing`.
    #[error("Grain is already registered at {existing}.")]
    AlreadyRegistered { existing: ActivationAddress },
    /// The target silo does not host that activation anymore.
    #[error("Activation {0} is not hosted by its silo.")]
    StaleActivation(ActivationAddress),
    /// The target silo did not answer.
    #[error("Silo {0} is unreachable: {1}.")]
    NodeUnreachable(SiloAddress, String),
    /// The request was re-resolved more times than allowed.
    #[error("Forwarding limit of {limit} hops exceeded for grain {grain}.")]
    ForwardingLimitExceeded { grain: GrainId, limit: u32 },
    /// The directory broke one of its own invariants.
    #[error("Directory inconsistent: {0}")]
    DirectoryInconsistent(String),
    /// The activation could not be created on the chosen silo.
    #[error("Activation of grain {0} failed: {1}")]
    ActivationFailed(GrainId, String),
    /// No response arrived in time.
    #[error("Request timed out after {0} ms.")]
    Timeout(u64),
    /// Encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(String),
    /// The transport failed for a reason other than an unreachable peer.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The grain storage provider failed.
    #[error("Storage error: {0}")]
    Storage(String),
    /// No factory is registered for the grain type.
    #[error("Unknown grain type {0}.")]
    UnknownGrainType(String),
    /// A non-reentrant activation was called back from its own call chain.
    #[error("Deadlock: {0} is already waiting in the call chain.")]
    Deadlock(ActivationAddress),
    /// The silo is not serving anymore.
    #[error("Silo {0} is stopped.")]
    SiloStopped(SiloAddress),
    /// The silo could not join the cluster.
    #[error("Join failed: {0}")]
    Join(String),
    /// Error raised by grain code that does not compromise the runtime.
    #[error("Error: {0}")]
    Functional(String),
}

impl From<store::Error> for Error {
    fn from(error: store::Error) -> Self {
        Error::Storage(error.to_string())
    }
}
