// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Identities
//!
//! Silo, grain and activation identities, plus the stable hash used to place
//! silos and grains on the consistent ring. The hash must give the same value
//! on every silo, so it is computed from the identity text and never from
//! `std::hash`, whose output may differ between processes.
//!

use serde::{Deserialize, Serialize};

use std::{
    fmt::{self, Display, Formatter},
    time::{SystemTime, UNIX_EPOCH},
};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable 32-bit hash of a byte string.
///
/// FNV-1a followed by the murmur3 finalizer, so that short inputs differing
/// in one character still spread across the whole ring.
pub fn stable_hash(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^= hash >> 33;
    (hash ^ (hash >> 32)) as u32
}

/// Milliseconds since the unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Identity of one silo process.
///
/// The generation distinguishes successive incarnations of a process bound
/// to the same endpoint: a restarted silo is a different silo. Generation `0`
/// is a wildcard accepted only when contacting seeds whose generation is not
/// known yet.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SiloAddress {
    host: String,
    port: u16,
    generation: u64,
}

impl SiloAddress {
    /// Creates a silo address.
    pub fn new(host: &str, port: u16, generation: u64) -> Self {
        Self {
            host: host.to_owned(),
            port,
            generation,
        }
    }

    /// Creates the address of a seed whose generation is unknown.
    pub fn seed(host: &str, port: u16) -> Self {
        Self::new(host, port, 0)
    }

    /// Creates an address whose generation is taken from the clock.
    pub fn with_current_generation(host: &str, port: u16) -> Self {
        Self::new(host, port, now_millis().max(1))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `host:port`, without the generation.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when both addresses point at the same endpoint.
    pub fn same_endpoint(&self, other: &SiloAddress) -> bool {
        self.host == other.host && self.port == other.port
    }

    /// True when `self`, used as a request target, designates `bound`.
    pub fn designates(&self, bound: &SiloAddress) -> bool {
        self.same_endpoint(bound)
            && (self.generation == 0 || self.generation == bound.generation)
    }

    /// The identity this process takes when it rejoins after being declared
    /// dead.
    pub fn next_generation(&self) -> Self {
        Self::new(
            &self.host,
            self.port,
            now_millis().max(self.generation + 1),
        )
    }

    /// Hash of the silo itself, used to order silos for probing.
    pub fn consistent_hash(&self) -> u32 {
        stable_hash(self.to_string().as_bytes())
    }

    /// Hash of one virtual bucket of the silo.
    pub fn bucket_hash(&self, bucket: u32) -> u32 {
        stable_hash(format!("{}#{}", self, bucket).as_bytes())
    }
}

impl Display for SiloAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "S{}:{}:{}", self.host, self.port, self.generation)
    }
}

/// Identity of a virtual actor: its type and its key within that type.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GrainId {
    grain_type: String,
    key: String,
}

impl GrainId {
    pub fn new(grain_type: &str, key: &str) -> Self {
        Self {
            grain_type: grain_type.to_owned(),
            key: key.to_owned(),
        }
    }

    pub fn grain_type(&self) -> &str {
        &self.grain_type
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Position of the grain on the consistent ring.
    pub fn uniform_hash(&self) -> u32 {
        stable_hash(self.to_string().as_bytes())
    }
}

impl Display for GrainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.grain_type, self.key)
    }
}

/// Identity of one activation. Unique per creation, never reused.
///
/// Ordering is lexicographic and is the tie-break when two directory
/// partitions disagree on the activation of a grain.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ActivationId(String);

impl ActivationId {
    /// Creates a fresh random activation id.
    pub fn new() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ActivationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ActivationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for ActivationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Where one activation of a grain lives.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ActivationAddress {
    pub silo: SiloAddress,
    pub grain: GrainId,
    pub activation: ActivationId,
}

impl ActivationAddress {
    pub fn new(silo: SiloAddress, grain: GrainId, activation: ActivationId) -> Self {
        Self {
            silo,
            grain,
            activation,
        }
    }
}

impl Display for ActivationAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} on {}]", self.grain, self.activation, self.silo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_hash_is_deterministic() {
        assert_eq!(stable_hash(b"counter/a"), stable_hash(b"counter/a"));
        assert_ne!(stable_hash(b"counter/a"), stable_hash(b"counter/b"));
        let grain = GrainId::new("counter", "a");
        assert_eq!(grain.uniform_hash(), stable_hash(b"counter/a"));
    }

    #[test]
    fn test_silo_address() {
        let silo = SiloAddress::new("127.0.0.1", 11111, 7);
        assert_eq!(silo.to_string(), "S127.0.0.1:11111:7");
        assert_eq!(silo.endpoint(), "127.0.0.1:11111");

        let seed = SiloAddress::seed("127.0.0.1", 11111);
        assert!(seed.designates(&silo));
        assert!(silo.designates(&silo));
        assert!(!SiloAddress::new("127.0.0.1", 11111, 8).designates(&silo));

        let next = silo.next_generation();
        assert!(next.same_endpoint(&silo));
        assert!(next.generation() > silo.generation());
        assert_ne!(next, silo);
    }

    #[test]
    fn test_bucket_hashes_differ() {
        let silo = SiloAddress::new("127.0.0.1", 11111, 7);
        assert_ne!(silo.bucket_hash(0), silo.bucket_hash(1));
        let other = SiloAddress::new("127.0.0.1", 11111, 8);
        assert_ne!(silo.bucket_hash(0), other.bucket_hash(0));
    }

    #[test]
    fn test_activation_ids_are_unique_and_ordered() {
        let a = ActivationId::new();
        let b = ActivationId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(ActivationId::from("0001") < ActivationId::from("0002"));
    }
}
