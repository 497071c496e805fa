// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use serde_derive::Serialize;
use thiserror::Error;
use uuid::Uuid;
use vmadm_api_types::{Brand, VmState};

use crate::host::{HostError, Interface};

/// The broad category an [`Error`] falls into.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, strum::Display,
)]
pub enum ErrorKind {
    InvalidValue,
    NotFound,
    Conflict,
    BrandMismatch,
    TransferError,
    DecodeError,
    TimedOut,
    ExternalFailure,
}

/// Errors returned by every public vmadm operation.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    /// A field carried a malformed or out-of-range value.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// A referenced VM or NIC does not exist.
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    /// The stored record changed underneath an in-flight operation, or a VM
    /// with the same identifier already exists.
    #[error("conflict on VM {vm}: {reason}")]
    Conflict { vm: Uuid, reason: String },

    /// A field does not apply to the VM's brand.
    #[error("{field} is not supported by brand {brand}")]
    BrandMismatch { field: String, brand: Brand },

    /// The bundle could not be handed to, or received from, the transport.
    #[error("bundle transfer for VM {vm} failed: {reason}")]
    Transfer { vm: Uuid, reason: String },

    /// The bundle stream was malformed.
    #[error("failed to decode bundle: {0}")]
    Decode(String),

    /// The VM did not reach a settled state within the allotted time.
    #[error("VM {vm} did not settle within {waited:?} (last seen {last_state})")]
    TimedOut { vm: Uuid, waited: Duration, last_state: VmState },

    /// A host collaborator reported a failure.
    #[error("{interface} interface failed for VM {vm}: {source}")]
    External {
        interface: Interface,
        vm: Uuid,
        #[source]
        source: HostError,
    },
}

impl Error {
    pub(crate) fn invalid(
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidValue { field: field.into(), reason: reason.into() }
    }

    pub(crate) fn vm_not_found(vm: Uuid) -> Self {
        Error::NotFound { what: "VM", id: vm.to_string() }
    }

    pub(crate) fn external(
        interface: Interface,
        vm: Uuid,
        source: HostError,
    ) -> Self {
        Error::External { interface, vm, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidValue { .. } => ErrorKind::InvalidValue,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::BrandMismatch { .. } => ErrorKind::BrandMismatch,
            Error::Transfer { .. } => ErrorKind::TransferError,
            Error::Decode(_) => ErrorKind::DecodeError,
            Error::TimedOut { .. } => ErrorKind::TimedOut,
            Error::External { .. } => ErrorKind::ExternalFailure,
        }
    }

    /// The field or identifier the error is about, when there is one.
    pub fn subject(&self) -> Option<String> {
        match self {
            Error::InvalidValue { field, .. }
            | Error::BrandMismatch { field, .. } => Some(field.clone()),
            Error::NotFound { id, .. } => Some(id.clone()),
            Error::Conflict { vm, .. }
            | Error::Transfer { vm, .. }
            | Error::TimedOut { vm, .. }
            | Error::External { vm, .. } => Some(vm.to_string()),
            Error::Decode(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_subjects() {
        let err = Error::invalid("add_nics[0].ip", "bad address");
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
        assert_eq!(err.subject().as_deref(), Some("add_nics[0].ip"));

        let vm = Uuid::new_v4();
        let err = Error::external(
            Interface::Quota,
            vm,
            HostError::Failed("zfs set failed".to_string()),
        );
        assert_eq!(err.kind(), ErrorKind::ExternalFailure);
        assert_eq!(err.subject(), Some(vm.to_string()));
        assert!(err.to_string().contains("quota"));

        assert_eq!(Error::Decode("eof".into()).subject(), None);
    }
}
