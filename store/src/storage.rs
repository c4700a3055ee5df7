// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Grain storage trait
//!
//! A storage provider keeps one opaque blob per grain, addressed by the grain
//! type and the grain key. Providers are shared by every activation of a silo,
//! so all methods take `&self` and implementations synchronize internally.
//!

use crate::error::Error;

/// Durable state backend for grain activations.
///
/// The activation catalog calls [`GrainStorage::read_state`] before a new
/// activation runs its activation hook, and [`GrainStorage::write_state`]
/// after its deactivation hook. Nothing else in the cluster core touches the
/// provider.
pub trait GrainStorage: Send + Sync + 'static {
    /// Provider name, used in logs.
    fn name(&self) -> &str;

    /// Reads the state stored for a grain.
    ///
    /// # Arguments
    ///
    /// * `grain_type` - The grain type name.
    /// * `key` - The grain key within its type.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when nothing has been stored for the grain yet.
    ///
    fn read_state(
        &self,
        grain_type: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, Error>;

    /// Replaces the state stored for a grain.
    fn write_state(
        &self,
        grain_type: &str,
        key: &str,
        data: &[u8],
    ) -> Result<(), Error>;

    /// Removes the state of a grain. Clearing a missing state succeeds.
    fn clear_state(&self, grain_type: &str, key: &str) -> Result<(), Error>;

    /// Flushes buffered writes, if the provider buffers any.
    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Generates the conformance tests every provider must pass.
#[macro_export]
macro_rules! test_grain_storage {
    ($name:ident: $type:ty) => {
        #[cfg(test)]
        mod $name {
            use super::*;
            use $crate::storage::GrainStorage;

            #[test]
            fn test_read_missing_state() {
                let storage = <$type>::default();
                assert_eq!(storage.read_state("counter", "a").unwrap(), None);
            }

            #[test]
            fn test_write_read_state() {
                let storage = <$type>::default();
                storage.write_state("counter", "a", b"value").unwrap();
                assert_eq!(
                    storage.read_state("counter", "a").unwrap(),
                    Some(b"value".to_vec())
                );
                assert!(storage.flush().is_ok());
            }

            #[test]
            fn test_overwrite_state() {
                let storage = <$type>::default();
                storage.write_state("counter", "a", b"one").unwrap();
                storage.write_state("counter", "a", b"two").unwrap();
                assert_eq!(
                    storage.read_state("counter", "a").unwrap(),
                    Some(b"two".to_vec())
                );
            }

            #[test]
            fn test_clear_state() {
                let storage = <$type>::default();
                storage.write_state("counter", "a", b"value").unwrap();
                storage.clear_state("counter", "a").unwrap();
                assert_eq!(storage.read_state("counter", "a").unwrap(), None);
                // Clearing twice is fine.
                storage.clear_state("counter", "a").unwrap();
            }

            #[test]
            fn test_grain_types_are_isolated() {
                let storage = <$type>::default();
                storage.write_state("counter", "a", b"counter").unwrap();
                storage.write_state("account", "a", b"account").unwrap();
                assert_eq!(
                    storage.read_state("counter", "a").unwrap(),
                    Some(b"counter".to_vec())
                );
                assert_eq!(
                    storage.read_state("account", "a").unwrap(),
                    Some(b"account".to_vec())
                );
            }
        }
    };
}
