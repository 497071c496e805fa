// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The authoritative set of VM records and per-VM operation serialization.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;
use vmadm_api_types::VmRecord;

use crate::error::Error;

/// A record together with the generation it was read at.
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned {
    pub record: VmRecord,
    pub gen: u64,
}

/// The committed VM records on this host.
///
/// Every successful write bumps the record's generation. Writers that
/// computed a new record from an earlier read commit with the generation
/// they read, so a record that changed in between is never overwritten.
#[derive(Debug, Default)]
pub struct VmStore {
    records: RwLock<BTreeMap<Uuid, Versioned>>,
}

impl VmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<Versioned> {
        self.records.read().unwrap().get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.records.read().unwrap().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.records.read().unwrap().keys().copied().collect()
    }

    /// Adds a record for a VM that does not exist yet.
    pub fn insert(&self, record: VmRecord) -> Result<u64, Error> {
        let mut records = self.records.write().unwrap();
        let id = record.uuid;
        if records.contains_key(&id) {
            return Err(Error::Conflict {
                vm: id,
                reason: "a VM with this identifier already exists".to_string(),
            });
        }
        records.insert(id, Versioned { record, gen: 1 });
        Ok(1)
    }

    /// Replaces the record for `record.uuid` if it is still at `expected`.
    /// Returns the new generation.
    pub fn commit(&self, record: VmRecord, expected: u64) -> Result<u64, Error> {
        let mut records = self.records.write().unwrap();
        let id = record.uuid;
        let entry = records.get_mut(&id).ok_or_else(|| Error::vm_not_found(id))?;
        if entry.gen != expected {
            return Err(Error::Conflict {
                vm: id,
                reason: format!(
                    "record changed from generation {expected} to {}",
                    entry.gen
                ),
            });
        }
        entry.record = record;
        entry.gen += 1;
        Ok(entry.gen)
    }

    pub fn remove(&self, id: Uuid) -> Option<VmRecord> {
        self.records.write().unwrap().remove(&id).map(|v| v.record)
    }
}

/// Hands out one FIFO lock per VM identifier.
///
/// Operations that modify a VM hold its lock for their duration, so they
/// run one at a time and in arrival order. Operations on different VMs do
/// not contend.
#[derive(Debug, Default)]
pub struct IdLocks {
    locks: Mutex<BTreeMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held while an operation owns a VM.
pub type IdGuard = OwnedMutexGuard<()>;

impl IdLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: Uuid) -> IdGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            // Nobody holds or waits on a lock whose only reference is ours.
            locks.retain(|other, l| *other == id || Arc::strong_count(l) > 1);
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of identifiers with a live lock. Exposed for tests.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
