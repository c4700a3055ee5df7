// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Silo configuration
//!
//! Every option has a default, so a configuration file only needs to name
//! what it changes.
//!

use crate::{identity::SiloAddress, retry::RetryPolicy};

use serde::{Deserialize, Serialize};

use std::{collections::HashMap, time::Duration};

/// Complete configuration of one silo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiloConfig {
    /// Host the silo binds to and announces.
    pub host: String,
    /// Port the silo binds to and announces.
    pub port: u16,
    /// Generation of the silo identity. Taken from the clock when `None`.
    pub generation: Option<u64>,
    /// Silos contacted to join the cluster. Empty for the first silo.
    pub seeds: Vec<SiloAddress>,
    /// Retry policy while no seed answers.
    pub join_retry: RetryPolicy,
    /// Rejoin with a new generation after being declared dead.
    pub auto_rejoin: bool,
    pub membership: MembershipConfig,
    pub directory: DirectoryConfig,
    pub placement: PlacementConfig,
    pub collection: CollectionConfig,
    pub messaging: MessagingConfig,
}

impl Default for SiloConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 11111,
            generation: None,
            seeds: Vec::new(),
            join_retry: RetryPolicy::default(),
            auto_rejoin: true,
            membership: MembershipConfig::default(),
            directory: DirectoryConfig::default(),
            placement: PlacementConfig::default(),
            collection: CollectionConfig::default(),
            messaging: MessagingConfig::default(),
        }
    }
}

impl SiloConfig {
    /// Configuration for a silo listening on `host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_owned(),
            port,
            ..Default::default()
        }
    }

    /// Millisecond-scale timings for clusters running inside one process.
    pub fn fast(host: &str, port: u16) -> Self {
        Self {
            host: host.to_owned(),
            port,
            generation: None,
            seeds: Vec::new(),
            join_retry: RetryPolicy::FixedInterval {
                max_retries: 20,
                interval: Duration::from_millis(20),
            },
            auto_rejoin: true,
            membership: MembershipConfig {
                probe_interval: Duration::from_millis(50),
                probe_timeout: Duration::from_millis(100),
                num_missed_probes_limit: 2,
                num_probed_silos: 3,
                num_votes_for_death_declaration: 2,
                death_vote_fraction: 0.5,
                death_vote_expiration: Duration::from_secs(5),
                suspect_timeout: Duration::from_millis(500),
                gossip_interval: Duration::from_millis(20),
                gossip_fanout: 3,
                dead_entry_retention: Duration::from_secs(60),
            },
            directory: DirectoryConfig::default(),
            placement: PlacementConfig {
                load_publish_interval: Duration::from_millis(50),
                ..Default::default()
            },
            collection: CollectionConfig {
                collection_quantum: Duration::from_millis(50),
                ..Default::default()
            },
            messaging: MessagingConfig {
                response_timeout: Duration::from_secs(5),
                unreachable_retry_delay: Duration::from_secs(2),
                ..Default::default()
            },
        }
    }

    /// Adds a seed.
    pub fn with_seed(mut self, seed: SiloAddress) -> Self {
        self.seeds.push(seed);
        self
    }
}

/// Liveness: probing, suspicion and gossip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive missed probes before the prober suspects a silo.
    pub num_missed_probes_limit: u32,
    /// How many successors on the silo ring each silo probes.
    pub num_probed_silos: usize,
    /// Fresh votes that declare a suspect silo dead.
    pub num_votes_for_death_declaration: usize,
    /// Share of the active silos whose votes also declare a silo dead.
    pub death_vote_fraction: f64,
    pub death_vote_expiration: Duration,
    /// A silo suspect for this long is declared dead by its suspecter.
    pub suspect_timeout: Duration,
    pub gossip_interval: Duration,
    pub gossip_fanout: usize,
    pub dead_entry_retention: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(10),
            num_missed_probes_limit: 3,
            num_probed_silos: 3,
            num_votes_for_death_declaration: 2,
            death_vote_fraction: 0.5,
            death_vote_expiration: Duration::from_secs(120),
            suspect_timeout: Duration::from_secs(180),
            gossip_interval: Duration::from_secs(1),
            gossip_fanout: 3,
            dead_entry_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Ring and directory cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub virtual_buckets_per_silo: u32,
    pub cache_max_entries: usize,
    pub cache_initial_ttl: Duration,
    pub cache_max_ttl: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            virtual_buckets_per_silo: 30,
            cache_max_entries: 1_000_000,
            cache_initial_ttl: Duration::from_secs(30),
            cache_max_ttl: Duration::from_secs(240),
        }
    }
}

/// Built-in placement strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementKind {
    Random,
    LeastLoaded,
    PreferLocal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub strategy: PlacementKind,
    /// Candidates sampled by least-loaded placement.
    pub choose_out_of: usize,
    pub load_publish_interval: Duration,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            strategy: PlacementKind::Random,
            choose_out_of: 2,
            load_publish_interval: Duration::from_secs(1),
        }
    }
}

/// Idle activation collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Idle time after which an activation is collected.
    pub collection_age: Duration,
    /// How often the collector looks for idle activations.
    pub collection_quantum: Duration,
    /// Collection age per grain type, overriding `collection_age`.
    pub per_type: HashMap<String, Duration>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            collection_age: Duration::from_secs(2 * 3600),
            collection_quantum: Duration::from_secs(60),
            per_type: HashMap::new(),
        }
    }
}

impl CollectionConfig {
    /// Collection age of a grain type.
    pub fn age_for(&self, grain_type: &str) -> Duration {
        self.per_type
            .get(grain_type)
            .copied()
            .unwrap_or(self.collection_age)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Re-resolutions allowed after stale routing before giving up.
    pub max_forward_count: u32,
    /// Retries against a re-resolved target after an unreachable silo.
    pub unreachable_retries: u32,
    pub response_timeout: Duration,
    /// Longest wait for membership to react to an unreachable silo.
    pub unreachable_retry_delay: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_forward_count: 3,
            unreachable_retries: 1,
            response_timeout: Duration::from_secs(30),
            unreachable_retry_delay: Duration::from_secs(30),
        }
    }
}
