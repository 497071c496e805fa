// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration reconciliation and send/receive for VMs.
//!
//! [`Vmadm`] owns the authoritative record store for one host and exposes
//! the operations callers use: creating and deleting VMs, applying partial
//! updates, exporting and importing bundles, and migrating a VM to another
//! host. Everything the engine needs from the operating system is reached
//! through the traits in [`host`].

pub extern crate usdt;

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use slog::{info, o, warn, Logger};
use tokio::time::Instant;
use uuid::Uuid;
use vmadm_api_types::{
    CreateRequest, MigrationResult, UpdateRequest, VmRecord, VmState,
};
use vmadm_config::{Config, ParseError};

pub mod brand;
pub mod bundle;
pub mod error;
#[cfg(any(test, feature = "fakes"))]
pub mod fakes;
pub mod host;
pub mod logging;
pub mod migrate;
pub mod nic;
pub mod sizing;
pub mod store;
pub mod update;
pub mod validate;

#[cfg(test)]
mod test_support;

pub use error::{Error, ErrorKind};
pub use host::{HostError, HostServices, Transport};
pub use migrate::{Migration, MigrationStatusRx};
pub use update::{UpdateOutcome, UpdateReport};

use bundle::Bundle;
use host::Interface;
use migrate::Endpoint;
use store::{IdLocks, VmStore};
use update::UpdateCoordinator;

/// Registers the USDT probes defined by this crate.
pub fn register_probes() -> Result<(), usdt::Error> {
    usdt::register_probes()
}

/// The VM management engine for one host.
pub struct Vmadm {
    log: Logger,
    store: Arc<VmStore>,
    locks: Arc<IdLocks>,
    host: HostServices,
    config: Arc<Config>,
    updates: UpdateCoordinator,
}

impl Vmadm {
    /// Builds an engine over `host`. Fails if `config` does not pass
    /// [`Config::validate`].
    pub fn new(
        log: &Logger,
        host: HostServices,
        config: Config,
    ) -> Result<Self, ParseError> {
        config.validate()?;
        let log = log.new(o!("component" => "vmadm"));
        let store = Arc::new(VmStore::new());
        let locks = Arc::new(IdLocks::new());
        let config = Arc::new(config);
        let updates = UpdateCoordinator::new(
            &log,
            store.clone(),
            locks.clone(),
            host.clone(),
            config.clone(),
        );
        Ok(Self { log, store, locks, host, config, updates })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Identifiers of every VM in the store.
    pub fn list(&self) -> Vec<Uuid> {
        self.store.ids()
    }

    /// Provisions a new VM and records it. The VM is booted afterwards when
    /// `autoboot` is set, without waiting for it to settle.
    ///
    /// If the boot request fails the VM stays provisioned and recorded, and
    /// the failure is returned.
    pub async fn create(
        &self,
        request: &CreateRequest,
    ) -> Result<UpdateOutcome, Error> {
        let update::UpdatePlan { mut record, report, .. } =
            update::plan_create(request, &self.config, &mut rand::thread_rng())?;
        let id = record.uuid;
        let _guard = self.locks.lock(id).await;
        let log = self.log.new(o!("vm" => id.to_string()));

        if self.store.contains(id) {
            return Err(Error::Conflict {
                vm: id,
                reason: "a VM with this identifier already exists".to_string(),
            });
        }

        record.state = VmState::Stopped;
        record.last_modified = Utc::now();
        self.host
            .zones
            .provision(&record)
            .await
            .map_err(|e| Error::external(Interface::Zone, id, e))?;
        if let Err(e) = self.store.insert(record.clone()) {
            if let Err(destroy_err) = self.host.zones.destroy(id).await {
                warn!(log, "failed to destroy orphaned zone";
                    "error" => %destroy_err);
            }
            return Err(e);
        }
        info!(log, "created VM";
            "brand" => %record.brand_kind(),
            "ignored" => report.ignored.len());

        if record.autoboot {
            self.host
                .zones
                .boot(id)
                .await
                .map_err(|e| Error::external(Interface::Zone, id, e))?;
        }
        Ok(UpdateOutcome { record, report })
    }

    /// The stored record for `id` with its lifecycle fields as the host sees
    /// them right now. Does not wait for in-flight operations, so a VM part
    /// way through a boot or halt is reported in its transitional state.
    pub async fn load(&self, id: Uuid) -> Result<VmRecord, Error> {
        let mut record =
            self.store.get(id).ok_or_else(|| Error::vm_not_found(id))?.record;
        let observed = self
            .host
            .state
            .observe(id)
            .await
            .map_err(|e| Error::external(Interface::State, id, e))?;
        observed.apply_to(&mut record);
        Ok(record)
    }

    /// Halts the VM if needed, destroys it on the host, and forgets it.
    pub async fn delete(&self, id: Uuid) -> Result<(), Error> {
        let _guard = self.locks.lock(id).await;
        let log = self.log.new(o!("vm" => id.to_string()));
        if !self.store.contains(id) {
            return Err(Error::vm_not_found(id));
        }

        let zone_err = |e| Error::external(Interface::Zone, id, e);
        let observed = self
            .host
            .state
            .observe(id)
            .await
            .map_err(|e| Error::external(Interface::State, id, e))?;
        if observed.state != VmState::Stopped || observed.transition.is_some()
        {
            self.host.zones.halt(id).await.map_err(zone_err)?;
        }
        self.host.zones.destroy(id).await.map_err(zone_err)?;
        self.store.remove(id);
        info!(log, "deleted VM");
        Ok(())
    }

    /// Applies a partial update to the VM `id`.
    pub async fn apply_update(
        &self,
        id: Uuid,
        request: &UpdateRequest,
    ) -> Result<UpdateOutcome, Error> {
        self.updates.apply_update(id, request).await
    }

    /// Exports the stopped VM `id` as a bundle.
    pub async fn export_bundle(&self, id: Uuid) -> Result<Bytes, Error> {
        let _guard = self.locks.lock(id).await;
        bundle::export(
            &self.log,
            &self.store,
            &self.host,
            id,
            false,
            self.config.bundle.extent_chunk_size,
        )
        .await
    }

    /// Recreates a VM from a bundle, booting it if the bundle says its
    /// source was running when exported.
    pub async fn import_bundle(&self, bytes: Bytes) -> Result<VmRecord, Error> {
        let id = Bundle::decode(bytes.clone())
            .await?
            .vm()
            .ok_or_else(|| Error::Decode("record carries no uuid".to_string()))?;
        let _guard = self.locks.lock(id).await;

        let (record, was_running) =
            bundle::import(&self.log, &self.store, &self.host, bytes).await?;
        if was_running {
            self.host
                .zones
                .boot(record.uuid)
                .await
                .map_err(|e| Error::external(Interface::Zone, record.uuid, e))?;
        }
        Ok(record)
    }

    /// Starts tracking a migration of `id`, returning the migration and a
    /// receiver for its status. Nothing happens until it is passed to
    /// [`Vmadm::run_migration`].
    pub fn begin_migration(&self, id: Uuid) -> (Migration, MigrationStatusRx) {
        Migration::new(&self.log, id)
    }

    /// Moves the VM `id` to `destination` through `transport`.
    pub async fn migrate(
        &self,
        id: Uuid,
        destination: &Vmadm,
        transport: &dyn Transport,
        deadline: Option<Instant>,
    ) -> Result<MigrationResult, Error> {
        let (migration, _rx) = self.begin_migration(id);
        self.run_migration(migration, destination, transport, deadline).await
    }

    pub async fn run_migration(
        &self,
        migration: Migration,
        destination: &Vmadm,
        transport: &dyn Transport,
        deadline: Option<Instant>,
    ) -> Result<MigrationResult, Error> {
        migration
            .run(
                &self.config,
                self.endpoint(),
                destination.endpoint(),
                transport,
                deadline,
            )
            .await
    }

    /// Waits for the VM `id` to reach `running` or `stopped`, then returns
    /// its record as [`Vmadm::load`] would.
    pub async fn settle(
        &self,
        id: Uuid,
        deadline: Option<Instant>,
    ) -> Result<VmRecord, Error> {
        let mut record =
            self.store.get(id).ok_or_else(|| Error::vm_not_found(id))?.record;
        let log = self.log.new(o!("vm" => id.to_string()));
        let observed = migrate::settle::settle(
            &log,
            self.host.state.as_ref(),
            id,
            &self.config.settle,
            deadline,
        )
        .await?;
        observed.apply_to(&mut record);
        Ok(record)
    }

    fn endpoint(&self) -> Endpoint<'_> {
        Endpoint { store: &self.store, locks: &self.locks, host: &self.host }
    }
}
