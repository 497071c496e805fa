// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for the types exchanged with the vmadm engine: the
//! authoritative VM record, its network interfaces, update requests, and the
//! status of send/receive migrations.

mod migration;
mod nic;
mod record;

pub use migration::{
    FieldMismatch, MigrationResult, MigrationState, MigrationStatus,
};
pub use nic::{MacAddr, Nic, NicIp, ParseNicFieldError};
pub use record::{
    Brand, BrandSpec, CreateRequest, Disk, KvmSpec, ScalarValue, Transition,
    UpdateRequest, VmRecord, VmState, VOLATILE_FIELDS,
};
