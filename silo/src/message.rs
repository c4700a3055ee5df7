// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Silo protocol
//!
//! Requests and responses exchanged between silos. Grain payloads travel as
//! opaque bytes inside envelopes; the runtime never looks into them.
//!

use crate::{
    directory::DirectoryEntry,
    error::Error,
    identity::{ActivationAddress, ActivationId, GrainId, SiloAddress},
    membership::{EntryDigest, MembershipEntry},
};

use serde::{Deserialize, Serialize};

/// A call to a grain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Method identifier, meaningful to the grain only.
    pub method: u32,
    /// Serialized arguments.
    pub body: Vec<u8>,
    /// Activations waiting on this request, outermost first.
    pub call_chain: Vec<ActivationId>,
}

impl RequestEnvelope {
    pub fn new(method: u32, body: Vec<u8>) -> Self {
        Self {
            method,
            body,
            call_chain: Vec::new(),
        }
    }
}

/// Result of a grain call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub body: Vec<u8>,
}

impl ResponseEnvelope {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }

    pub fn empty() -> Self {
        Self { body: Vec::new() }
    }
}

/// One push-pull gossip exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Entries changed since the last exchange with the receiver.
    pub entries: Vec<MembershipEntry>,
    /// What the sender knows, so the receiver can answer with better entries.
    pub digest: Vec<EntryDigest>,
}

/// Requests a silo serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiloRequest {
    /// Liveness probe.
    Ping,
    /// A silo announces itself to a seed.
    Join { entry: MembershipEntry },
    Gossip(GossipMessage),
    /// Directory lookup at the grain's owner.
    Lookup { grain: GrainId },
    /// Directory registration at the grain's owner.
    Register { address: ActivationAddress },
    /// Directory removal at the grain's owner.
    Unregister { address: ActivationAddress },
    /// Directory entries pushed to their new owner after a ring change.
    Handoff { entries: Vec<DirectoryEntry>, hops: u32 },
    /// Create, or find, the activation of a grain on the receiving silo.
    Activate { grain: GrainId },
    /// Run a grain call on an activation of the receiving silo.
    Deliver {
        target: ActivationAddress,
        envelope: RequestEnvelope,
    },
    /// Deactivate a grain. `activation` restricts it to one activation.
    Deactivate {
        grain: GrainId,
        activation: Option<ActivationId>,
    },
    /// Activation count of the sender.
    LoadReport { silo: SiloAddress, activations: usize },
}

impl SiloRequest {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SiloRequest::Ping => "ping",
            SiloRequest::Join { .. } => "join",
            SiloRequest::Gossip(_) => "gossip",
            SiloRequest::Lookup { .. } => "lookup",
            SiloRequest::Register { .. } => "register",
            SiloRequest::Unregister { .. } => "unregister",
            SiloRequest::Handoff { .. } => "handoff",
            SiloRequest::Activate { .. } => "activate",
            SiloRequest::Deliver { .. } => "deliver",
            SiloRequest::Deactivate { .. } => "deactivate",
            SiloRequest::LoadReport { .. } => "load report",
        }
    }
}

/// Responses to [`SiloRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiloResponse {
    Pong,
    /// Membership entries: the full table after a join, or the entries the
    /// requester lacks after gossip.
    Membership(Vec<MembershipEntry>),
    Lookup(Option<ActivationAddress>),
    Registered(ActivationAddress),
    Activated(ActivationAddress),
    Delivered(ResponseEnvelope),
    Ack,
    Failed(Error),
}

impl SiloResponse {
    /// Turns a `Failed` response into an error.
    pub fn into_result(self) -> Result<SiloResponse, Error> {
        match self {
            SiloResponse::Failed(error) => Err(error),
            response => Ok(response),
        }
    }

    pub(crate) fn unexpected(self, request: &str) -> Error {
        Error::Transport(format!("Unexpected response to {}: {:?}", request, self))
    }
}

impl From<Result<SiloResponse, Error>> for SiloResponse {
    fn from(result: Result<SiloResponse, Error>) -> Self {
        result.unwrap_or_else(SiloResponse::Failed)
    }
}
