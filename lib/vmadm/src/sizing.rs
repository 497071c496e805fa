// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Derivation of a VM's memory and storage limits from a partial change.
//!
//! Memory limits are coupled: `ram` and `max_physical_memory` always move
//! together, and the locked, swap, and tmpfs limits follow them unless they
//! are set explicitly in the same change. Every result satisfies
//!
//! * `max_physical_memory >= ram`
//! * `max_locked_memory <= max_physical_memory`
//! * `max_swap >= max(max_physical_memory, min_swap)`
//! * `tmpfs <= max_physical_memory`

use vmadm_api_types::VmRecord;

use crate::error::Error;

/// Requested changes to sizing fields. Memory values are MiB, quota GiB.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceChange {
    pub ram: Option<u64>,
    pub max_physical_memory: Option<u64>,
    pub max_locked_memory: Option<u64>,
    pub max_swap: Option<u64>,
    pub tmpfs: Option<u64>,
    pub quota: Option<u64>,
}

impl ResourceChange {
    pub fn is_empty(&self) -> bool {
        *self == ResourceChange::default()
    }
}

/// A complete set of sizing fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sizing {
    pub ram: u64,
    pub max_physical_memory: u64,
    pub max_locked_memory: u64,
    pub max_swap: u64,
    pub tmpfs: u64,
    pub quota: u64,
}

impl Sizing {
    pub fn of(record: &VmRecord) -> Self {
        Self {
            ram: record.ram,
            max_physical_memory: record.max_physical_memory,
            max_locked_memory: record.max_locked_memory,
            max_swap: record.max_swap,
            tmpfs: record.tmpfs,
            quota: record.quota,
        }
    }

    pub fn apply_to(&self, record: &mut VmRecord) {
        record.ram = self.ram;
        record.max_physical_memory = self.max_physical_memory;
        record.max_locked_memory = self.max_locked_memory;
        record.max_swap = self.max_swap;
        record.tmpfs = self.tmpfs;
        record.quota = self.quota;
    }

    /// Sizing for a new VM with `ram` MiB of memory.
    pub fn for_ram(ram: u64, min_swap: u64) -> Result<Self, Error> {
        if ram == 0 {
            return Err(Error::invalid("ram", "must be greater than zero"));
        }
        Ok(Self {
            ram,
            max_physical_memory: ram,
            max_locked_memory: ram,
            max_swap: ram.max(min_swap),
            tmpfs: ram,
            quota: 0,
        })
    }
}

/// Computes the sizing that results from applying `change` to `current`.
pub fn resize(
    current: Sizing,
    change: &ResourceChange,
    min_swap: u64,
) -> Result<Sizing, Error> {
    let mut next = current;

    let memory = match (change.ram, change.max_physical_memory) {
        (Some(ram), Some(mpm)) if ram != mpm => {
            return Err(Error::invalid(
                "max_physical_memory",
                format!("{mpm} does not match ram {ram}"),
            ));
        }
        (Some(v), _) => Some(("ram", v)),
        (None, Some(v)) => Some(("max_physical_memory", v)),
        (None, None) => None,
    };
    if let Some((field, v)) = memory {
        if v == 0 {
            return Err(Error::invalid(field, "must be greater than zero"));
        }
        next.ram = v;
        next.max_physical_memory = v;
        next.max_locked_memory = v;
        next.tmpfs = v;
        next.max_swap = v.max(min_swap);
    }

    if let Some(swap) = change.max_swap {
        next.max_swap = swap.max(next.max_physical_memory).max(min_swap);
    }
    if let Some(locked) = change.max_locked_memory {
        next.max_locked_memory = locked.min(next.max_physical_memory);
    }
    if let Some(tmpfs) = change.tmpfs {
        next.tmpfs = tmpfs.min(next.max_physical_memory);
    }
    if let Some(quota) = change.quota {
        next.quota = quota;
    }

    Ok(next)
}
