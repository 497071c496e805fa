// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the host facilities vmadm drives but does not implement:
//! zone lifecycle, state observation, dataset quotas, datalink
//! configuration, backing storage, and bundle transport.
//!
//! Each is a narrow async trait so that the engine can run against the real
//! illumos tooling or against the in-memory fakes behind the `fakes` feature.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use vmadm_api_types::{Nic, Transition, VmRecord, VmState};

/// Identifies which collaborator an error came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Interface {
    Zone,
    State,
    Quota,
    Network,
    Storage,
}

/// Failures reported by host collaborators.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("VM is not known to the host")]
    NoSuchVm,

    #[error("{0}")]
    Failed(String),
}

/// The lifecycle state of a VM as the host currently sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observed {
    pub state: VmState,
    pub transition: Option<Transition>,
    pub zoneid: Option<i32>,
}

impl Observed {
    pub fn is_settled(&self) -> bool {
        self.transition.is_none() && self.state.is_settled()
    }

    /// Overwrites the lifecycle fields of `record` with what was observed.
    pub fn apply_to(&self, record: &mut VmRecord) {
        record.state = self.state;
        record.transition = self.transition.clone();
        record.zoneid = self.zoneid;
    }
}

/// A named piece of backing storage that travels with a VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRef {
    pub name: String,
    /// Length in bytes.
    pub size: u64,
}

/// Creation, destruction, and power control of the OS virtualization
/// instance behind a VM.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ZoneManager: Send + Sync {
    /// Creates the instance and its datasets. The VM starts out stopped.
    async fn provision(&self, record: &VmRecord) -> Result<(), HostError>;

    /// Destroys the instance and releases its datasets.
    async fn destroy(&self, vm: Uuid) -> Result<(), HostError>;

    /// Asks the instance to boot. Returns once the request is accepted;
    /// the state change itself is observed through [`StateObserver`].
    async fn boot(&self, vm: Uuid) -> Result<(), HostError>;

    /// Asks the instance to halt. Same contract as [`ZoneManager::boot`].
    async fn halt(&self, vm: Uuid) -> Result<(), HostError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateObserver: Send + Sync {
    async fn observe(&self, vm: Uuid) -> Result<Observed, HostError>;
}

/// Capacity limits on a VM's backing dataset, expressed as size tokens
/// such as `13G` or `none`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    async fn set_quota(&self, vm: Uuid, token: &str) -> Result<(), HostError>;
    async fn get_quota(&self, vm: Uuid) -> Result<String, HostError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkConfig: Send + Sync {
    /// Creates or reconfigures the datalink behind `nic`.
    async fn apply_nic(&self, vm: Uuid, nic: &Nic) -> Result<(), HostError>;
    async fn remove_nic(&self, vm: Uuid, nic: &Nic) -> Result<(), HostError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn list_extents(&self, vm: Uuid)
        -> Result<Vec<ExtentRef>, HostError>;

    async fn read_extent(
        &self,
        vm: Uuid,
        extent: &ExtentRef,
    ) -> Result<Bytes, HostError>;

    async fn write_extent(
        &self,
        vm: Uuid,
        extent: &ExtentRef,
        data: Bytes,
    ) -> Result<(), HostError>;

    /// Removes every extent written for `vm`. Used to back out a receive
    /// that failed part way.
    async fn discard_extents(&self, vm: Uuid) -> Result<(), HostError>;
}

/// Moves an encoded bundle to its destination: opaque bytes in, opaque bytes
/// out on the far side.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transfer(&self, vm: Uuid, bundle: Bytes)
        -> Result<Bytes, HostError>;
}

/// The set of collaborators one host provides.
#[derive(Clone)]
pub struct HostServices {
    pub zones: Arc<dyn ZoneManager>,
    pub state: Arc<dyn StateObserver>,
    pub quota: Arc<dyn QuotaBackend>,
    pub network: Arc<dyn NetworkConfig>,
    pub storage: Arc<dyn StorageBackend>,
}

/// The storage token for "no quota".
pub const QUOTA_NONE: &str = "none";

/// Renders a quota in GiB as the storage layer's size token.
pub fn quota_token(gib: u64) -> String {
    if gib == 0 {
        QUOTA_NONE.to_string()
    } else {
        format!("{gib}G")
    }
}

/// Parses a storage size token back into whole GiB.
///
/// Accepts `none`, `<n>G`, and `<n>T`. Anything else, including sizes that
/// are not a whole number of GiB, yields `None`.
pub fn parse_quota_token(token: &str) -> Option<u64> {
    if token == QUOTA_NONE || token == "0" {
        return Some(0);
    }
    let (digits, scale) = match token.as_bytes().last()? {
        b'G' => (&token[..token.len() - 1], 1),
        b'T' => (&token[..token.len() - 1], 1024),
        _ => return None,
    };
    digits.parse::<u64>().ok()?.checked_mul(scale)
}
