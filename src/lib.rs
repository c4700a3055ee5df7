// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Core library for the Grove framework.
//! Provides the cluster runtime for virtual actors: silos that agree on
//! membership, locate grains through a distributed directory and activate
//! them on demand. Grain state is kept by pluggable storage providers.

pub use silo::{
    codec, ActivationAddress, ActivationId, ActivationStats, ClusterView,
    CollectionConfig, ConsistentRing, DirectoryConfig, Error, GrainContext,
    GrainFactory, GrainId, GrainTypeOptions, Grain, InMemoryNetwork,
    LeastLoadedPlacement, MembershipConfig, MembershipEvent, MessagingConfig,
    PlacementConfig, PlacementContext, PlacementKind, PlacementStrategy,
    PreferLocalPlacement, RandomPlacement, ReentrantGrain, RequestEnvelope, RequestHandler,
    ResponseEnvelope, RetryPolicy, Silo, SiloAddress, SiloBuilder, SiloConfig,
    SiloStatus, Sink, Subscriber, TcpTransport, Transport,
};

pub use store::{Error as StoreError, GrainStorage, MemoryStorage};
