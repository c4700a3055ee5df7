// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Directory partition
//!
//! The slice of the grain directory owned by one silo. The owner is the only
//! writer of its partition, so every race between registrations for a grain
//! is decided here, one call at a time.
//!

use crate::{
    error::Error,
    identity::{ActivationAddress, ActivationId, GrainId, SiloAddress},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use std::collections::HashMap;

/// Status of an activation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// The registered activation of the grain.
    Valid,
    /// A contender that lost, kept only while the race is being resolved.
    Doubtful,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub address: ActivationAddress,
    pub status: RecordStatus,
}

/// Directory entry of one grain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub grain: GrainId,
    pub records: Vec<ActivationRecord>,
}

impl DirectoryEntry {
    fn new(grain: GrainId) -> Self {
        Self {
            grain,
            records: Vec::new(),
        }
    }

    /// Entry holding one valid record.
    pub fn valid(address: ActivationAddress) -> Self {
        Self {
            grain: address.grain.clone(),
            records: vec![ActivationRecord {
                address,
                status: RecordStatus::Valid,
            }],
        }
    }

    /// The valid record, if any.
    pub fn valid_address(&self) -> Option<&ActivationAddress> {
        self.records
            .iter()
            .find(|record| record.status == RecordStatus::Valid)
            .map(|record| &record.address)
    }

    fn valid_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == RecordStatus::Valid)
            .count()
    }
}

/// Directory partition owned by one silo.
#[derive(Debug, Default)]
pub struct GrainDirectoryPartition {
    entries: HashMap<GrainId, DirectoryEntry>,
}

impl GrainDirectoryPartition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The valid activation of a grain.
    pub fn lookup(
        &self,
        grain: &GrainId,
    ) -> Result<Option<ActivationAddress>, Error> {
        let Some(entry) = self.entries.get(grain) else {
            return Ok(None);
        };
        if entry.valid_count() > 1 {
            error!("Grain {} has {} valid records.", grain, entry.valid_count());
            return Err(Error::DirectoryInconsistent(format!(
                "grain {} has more than one valid activation",
                grain
            )));
        }
        Ok(entry.valid_address().cloned())
    }

    /// Registers an activation.
    ///
    /// The first registration wins. A later contender is recorded as
    /// doubtful, then rejected with the winner. A winner hosted on a silo
    /// that `is_dead` reports dead is replaced.
    pub fn register<F>(
        &mut self,
        address: ActivationAddress,
        is_dead: F,
    ) -> Result<ActivationAddress, Error>
    where
        F: Fn(&SiloAddress) -> bool,
    {
        let entry = self
            .entries
            .entry(address.grain.clone())
            .or_insert_with(|| DirectoryEntry::new(address.grain.clone()));

        if let Some(existing) = entry.valid_address().cloned() {
            if existing.activation == address.activation {
                return Ok(existing);
            }
            if is_dead(&existing.silo) {
                info!(
                    "Replacing {} hosted on dead silo by {}.",
                    existing, address
                );
                entry.records.clear();
            } else {
                entry.records.push(ActivationRecord {
                    address: address.clone(),
                    status: RecordStatus::Doubtful,
                });
                debug!("{} lost the registration to {}.", address, existing);
                entry
                    .records
                    .retain(|record| record.status == RecordStatus::Valid);
                return Err(Error::AlreadyRegistered { existing });
            }
        }

        entry.records.push(ActivationRecord {
            address: address.clone(),
            status: RecordStatus::Valid,
        });
        debug!("Registered {}.", address);
        Ok(address)
    }

    /// Removes the record of an activation if it is still the valid one.
    /// Returns false when nothing was removed.
    pub fn unregister(&mut self, address: &ActivationAddress) -> bool {
        let Some(entry) = self.entries.get_mut(&address.grain) else {
            return false;
        };
        let before = entry.records.len();
        entry
            .records
            .retain(|record| record.address.activation != address.activation);
        let removed = entry.records.len() != before;
        if entry.records.is_empty() {
            self.entries.remove(&address.grain);
        }
        if removed {
            debug!("Unregistered {}.", address);
        }
        removed
    }

    /// Merges a record handed over by another silo.
    ///
    /// On conflict the smaller activation id wins, whatever the arrival
    /// order. Returns the losing address, which must be deactivated.
    pub fn merge(
        &mut self,
        address: ActivationAddress,
    ) -> Option<ActivationAddress> {
        let entry = self
            .entries
            .entry(address.grain.clone())
            .or_insert_with(|| DirectoryEntry::new(address.grain.clone()));
        let Some(existing) = entry.valid_address().cloned() else {
            entry.records.push(ActivationRecord {
                address,
                status: RecordStatus::Valid,
            });
            return None;
        };
        if existing.activation == address.activation {
            return None;
        }
        let (winner, loser) = if address.activation < existing.activation {
            (address, existing)
        } else {
            (existing, address)
        };
        info!("Duplicate activations {} and {}, keeping {}.", winner, loser, winner);
        entry.records = vec![ActivationRecord {
            address: winner,
            status: RecordStatus::Valid,
        }];
        Some(loser)
    }

    /// Drops every record hosted on a silo. Returns how many were dropped.
    pub fn remove_silo(&mut self, silo: &SiloAddress) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let before = entry.records.len();
            entry.records.retain(|record| record.address.silo != *silo);
            removed += before - entry.records.len();
            !entry.records.is_empty()
        });
        removed
    }

    /// Removes and returns the entries for which `moved` is true.
    pub fn split_off<F>(&mut self, moved: F) -> Vec<DirectoryEntry>
    where
        F: Fn(&GrainId) -> bool,
    {
        let grains: Vec<GrainId> = self
            .entries
            .keys()
            .filter(|grain| moved(grain))
            .cloned()
            .collect();
        grains
            .iter()
            .filter_map(|grain| self.entries.remove(grain))
            .collect()
    }

    /// Valid activation ids per grain, for inspection.
    pub fn valid_activations(&self) -> Vec<(GrainId, ActivationId)> {
        self.entries
            .values()
            .filter_map(|entry| {
                entry
                    .valid_address()
                    .map(|a| (entry.grain.clone(), a.activation.clone()))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
