// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Silo
//!
//! The cluster core of a virtual actor runtime. Grains are addressed by a
//! stable identity and exist conceptually forever; the runtime creates an
//! activation on first use, keeps at most one registered activation per
//! grain across the cluster, and tears idle activations down.
//!
//! ## Overview
//!
//! A cluster is a set of silos. Every silo runs:
//!
//! - **Membership**: a local replica of the membership table, merged by
//!   push-pull gossip. Entries carry a status (Joining, Active, Suspect,
//!   Dead), an incarnation and a sequence number; the greater version wins
//!   and Dead is final for a silo generation.
//! - **Failure detection**: each silo probes its successors on the silo hash
//!   ring. Missed probes turn into suspicion votes, enough votes into a
//!   death declaration. A suspected silo that is alive refutes.
//! - **Grain directory**: a consistent hash ring over the active silos
//!   partitions the grain space. The owner of a grain decides which
//!   activation is registered; the first registration wins.
//! - **Routing**: calls resolve through a cache, the directory owner and
//!   placement. Stale routes re-resolve a bounded number of times.
//! - **Activations**: each activation runs one turn at a time from a FIFO
//!   queue. Idle activations are collected, unregistering first.
//!
//! ## Getting Started
//!
//! ```ignore
//! use silo::{
//!     Error, Grain, GrainContext, GrainId, GrainTypeOptions, InMemoryNetwork,
//!     RequestEnvelope, ResponseEnvelope, SiloBuilder, SiloConfig,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! #[derive(Default)]
//! struct Counter {
//!     value: u64,
//! }
//!
//! #[async_trait]
//! impl Grain for Counter {
//!     async fn handle(
//!         &mut self,
//!         _request: RequestEnvelope,
//!         _ctx: &mut GrainContext,
//!     ) -> Result<ResponseEnvelope, Error> {
//!         self.value += 1;
//!         Ok(ResponseEnvelope::new(self.value.to_be_bytes().to_vec()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let network = Arc::new(InMemoryNetwork::new());
//!     let silo = SiloBuilder::new(SiloConfig::new("127.0.0.1", 11111))
//!         .register_grain(
//!             "counter",
//!             |_: &GrainId| Ok(Box::new(Counter::default())),
//!             GrainTypeOptions::default(),
//!         )
//!         .with_transport(network)
//!         .start()
//!         .await?;
//!
//!     let grain = GrainId::new("counter", "visits");
//!     silo.call(&grain, RequestEnvelope::new(0, vec![])).await?;
//!     silo.shutdown().await;
//!     Ok(())
//! }
//! ```
//!

mod activation;
mod catalog;
pub mod codec;
mod collector;
mod config;
mod directory;
mod directory_cache;
mod error;
mod failure_detector;
mod gossip;
mod grain;
mod grain_directory;
mod identity;
mod membership;
mod membership_service;
mod memory_transport;
mod message;
mod messenger;
mod placement;
mod retry;
mod ring;
mod router;
mod silo;
mod sink;
mod tcp_transport;
mod transport;

pub use activation::ActivationStats;
pub use config::{
    CollectionConfig, DirectoryConfig, MembershipConfig, MessagingConfig,
    PlacementConfig, PlacementKind, SiloConfig,
};
pub use directory::{
    ActivationRecord, DirectoryEntry, GrainDirectoryPartition, RecordStatus,
};
pub use directory_cache::DirectoryCache;
pub use error::Error;
pub use failure_detector::Probe;
pub use grain::{
    Grain, GrainContext, GrainFactory, GrainRegistry, GrainTypeOptions, ReentrantGrain,
    ReentrantGrainFactory,
};
pub use identity::{ActivationAddress, ActivationId, GrainId, SiloAddress, stable_hash};
pub use membership::{
    EntryDigest, MembershipEntry, MembershipEvent, MembershipTable, MergeOutcome,
    SiloStatus, SuspectVote,
};
pub use membership_service::{ApplyOutcome, ClusterView, MembershipService, Suspicion};
pub use memory_transport::InMemoryNetwork;
pub use message::{
    GossipMessage, RequestEnvelope, ResponseEnvelope, SiloRequest, SiloResponse,
};
pub use placement::{
    LeastLoadedPlacement, PlacementContext, PlacementStrategy, PreferLocalPlacement,
    RandomPlacement,
};
pub use retry::{
    ExponentialBackoffStrategy, FixedIntervalStrategy, NoIntervalStrategy,
    Retries, RetryPolicy, RetryStrategy,
};
pub use ring::ConsistentRing;
pub use silo::{Silo, SiloBuilder};
pub use sink::{Sink, Subscriber};
pub use tcp_transport::TcpTransport;
pub use transport::{RequestHandler, Transport};
