// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Memory storage provider.
//!

use crate::{error::Error, storage::GrainStorage};

use tracing::debug;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

type TypeData = Arc<RwLock<BTreeMap<String, Vec<u8>>>>;

/// A storage provider that keeps grain state in memory.
///
/// Clones share the same data, so a provider handed to several silos of an
/// in-process cluster behaves like one shared database.
#[derive(Default, Clone)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<String, TypeData>>>,
}

impl MemoryStorage {
    fn grain_type_data(&self, grain_type: &str) -> Result<TypeData, Error> {
        {
            let lock = self.data.read().map_err(|e| {
                Error::Get(format!("Can not lock storage data: {}", e))
            })?;
            if let Some(data) = lock.get(grain_type) {
                return Ok(data.clone());
            }
        }
        let mut lock = self.data.write().map_err(|e| {
            Error::Store(format!("Can not lock storage data: {}", e))
        })?;
        Ok(lock
            .entry(grain_type.to_owned())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
            .clone())
    }

    /// Number of grain states stored for a grain type.
    pub fn len(&self, grain_type: &str) -> usize {
        self.grain_type_data(grain_type)
            .ok()
            .and_then(|data| data.read().ok().map(|lock| lock.len()))
            .unwrap_or(0)
    }

    /// True when no state is stored for the grain type.
    pub fn is_empty(&self, grain_type: &str) -> bool {
        self.len(grain_type) == 0
    }
}

impl GrainStorage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    fn read_state(
        &self,
        grain_type: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, Error> {
        let data = self.grain_type_data(grain_type)?;
        let lock = data
            .read()
            .map_err(|e| Error::Get(format!("Can not lock data: {}", e)))?;
        Ok(lock.get(key).cloned())
    }

    fn write_state(
        &self,
        grain_type: &str,
        key: &str,
        data: &[u8],
    ) -> Result<(), Error> {
        debug!("Writing state of {}/{}.", grain_type, key);
        let type_data = self.grain_type_data(grain_type)?;
        let mut lock = type_data
            .write()
            .map_err(|e| Error::Store(format!("Can not lock data: {}", e)))?;
        lock.insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn clear_state(&self, grain_type: &str, key: &str) -> Result<(), Error> {
        let type_data = self.grain_type_data(grain_type)?;
        let mut lock = type_data
            .write()
            .map_err(|e| Error::Store(format!("Can not lock data: {}", e)))?;
        lock.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_grain_storage;

    test_grain_storage! {
        unit_test_memory_storage:crate::memory::MemoryStorage
    }

    #[test]
    fn test_clones_share_data() {
        let storage = MemoryStorage::default();
        let clone = storage.clone();
        storage.write_state("counter", "a", b"1").unwrap();
        assert_eq!(
            clone.read_state("counter", "a").unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(clone.len("counter"), 1);
        assert!(clone.is_empty("account"));
    }
}
