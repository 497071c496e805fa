// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving a VM between hosts by sending a bundle.
//!
//! A migration walks a fixed sequence of phases: the source is stopped and
//! exported, the bundle is handed to a [`Transport`], the destination imports
//! it and (if the source had been running) boots it, and then the
//! destination is polled until it settles. The source VM is left stopped on
//! its host in every outcome; deleting it is up to the caller.

use std::future::Future;

use bytes::Bytes;
use serde_json::Value;
use slog::{error, info, o, warn, Logger};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;
use vmadm_api_types::{
    FieldMismatch, MigrationResult, MigrationState, MigrationStatus, VmRecord,
    VmState,
};
use vmadm_config::Config;

use crate::bundle::{self, Bundle};
use crate::error::Error;
use crate::host::{
    parse_quota_token, HostServices, Interface, Observed, Transport,
};
use crate::store::{IdLocks, VmStore};

pub mod equivalence;
pub mod settle;

use settle::settle;

#[usdt::provider(provider = "vmadm")]
mod probes {
    fn migrate_phase_begin(step_desc: &str) {}
    fn migrate_phase_end(step_desc: &str) {}
}

pub type MigrationStatusRx = watch::Receiver<MigrationStatus>;

/// The stores and host collaborators of one side of a migration.
#[derive(Clone, Copy)]
pub struct Endpoint<'a> {
    pub store: &'a VmStore,
    pub locks: &'a IdLocks,
    pub host: &'a HostServices,
}

#[derive(Debug, PartialEq, Eq)]
enum MigratePhase {
    Export,
    Transfer,
    Import,
    Settle,
}

impl std::fmt::Display for MigratePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigratePhase::Export => "Export",
            MigratePhase::Transfer => "Transfer",
            MigratePhase::Import => "Import",
            MigratePhase::Settle => "Settle",
        };

        write!(f, "{s}")
    }
}

async fn run_phase<T>(
    step: MigratePhase,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    probes::migrate_phase_begin!(|| { step.to_string() });
    let res = fut.await;
    probes::migrate_phase_end!(|| { step.to_string() });
    res
}

struct StatePublisher {
    tx: watch::Sender<MigrationStatus>,
    log: Logger,
}

impl StatePublisher {
    fn new(log: &Logger, id: Uuid, vm: Uuid) -> (Self, MigrationStatusRx) {
        let (tx, rx) = watch::channel(MigrationStatus {
            id,
            vm,
            state: MigrationState::Idle,
            gen: 1,
        });
        (Self { tx, log: log.clone() }, rx)
    }

    fn publish(&mut self, state: MigrationState) {
        let MigrationStatus { id, vm, state: old, gen: old_gen } =
            self.tx.borrow().clone();
        if old.is_terminal() || state <= old {
            warn!(self.log, "ignoring backwards migration state";
                "from" => %old, "to" => %state);
            return;
        }

        let gen = old_gen + 1;
        info!(self.log, "publishing new migration state";
            "gen" => gen,
            "state" => %state);

        // Nobody may be watching; the status is still recorded in the
        // result.
        let _ = self.tx.send(MigrationStatus { id, vm, state, gen });
    }
}

/// One attempt to move a VM between hosts.
pub struct Migration {
    id: Uuid,
    vm: Uuid,
    log: Logger,
    publisher: StatePublisher,
    phases: Vec<MigrationState>,
}

impl Migration {
    /// Prepares to migrate `vm`. The receiver sees every phase change as it
    /// is published.
    pub fn new(log: &Logger, vm: Uuid) -> (Self, MigrationStatusRx) {
        let id = Uuid::new_v4();
        let log = log.new(o!(
            "component" => "migrate",
            "migration_id" => id.to_string(),
            "vm" => vm.to_string()
        ));
        let (publisher, rx) = StatePublisher::new(&log, id, vm);
        let migration = Self {
            id,
            vm,
            log,
            publisher,
            phases: vec![MigrationState::Idle],
        };
        (migration, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn update_state(&mut self, state: MigrationState) {
        self.publisher.publish(state);
        self.phases.push(state);
    }

    /// Runs the migration to completion.
    ///
    /// A destination that never settles fails the migration with
    /// [`Error::TimedOut`] but is not rolled back: the imported VM stays
    /// registered on the destination. Dropping the returned future abandons
    /// the migration at whatever point it had reached.
    pub async fn run(
        mut self,
        config: &Config,
        source: Endpoint<'_>,
        destination: Endpoint<'_>,
        transport: &dyn Transport,
        deadline: Option<Instant>,
    ) -> Result<MigrationResult, Error> {
        info!(self.log, "starting migration");
        let res = self
            .run_phases(config, source, destination, transport, deadline)
            .await;
        match res {
            Ok(result) => {
                self.update_state(MigrationState::Done);
                info!(self.log, "migration complete";
                    "final_state" => %result.final_state,
                    "mismatches" => result.mismatches.len());
                Ok(MigrationResult { phases: self.phases, ..result })
            }
            Err(e) => {
                error!(self.log, "migration failed"; "error" => %e);
                self.update_state(MigrationState::Failed);
                Err(e)
            }
        }
    }

    async fn run_phases(
        &mut self,
        config: &Config,
        source: Endpoint<'_>,
        destination: Endpoint<'_>,
        transport: &dyn Transport,
        deadline: Option<Instant>,
    ) -> Result<MigrationResult, Error> {
        let vm = self.vm;
        let log = self.log.clone();
        if std::ptr::eq(source.locks, destination.locks) {
            return Err(Error::Conflict {
                vm,
                reason: "source and destination are the same host".to_string(),
            });
        }

        // Keep updates off the source from the snapshot until its bundle has
        // been imported.
        let guard = source.locks.lock(vm).await;

        self.update_state(MigrationState::Exporting);
        let (snapshot, bytes) = run_phase(
            MigratePhase::Export,
            export_source(&log, config, source, vm, deadline),
        )
        .await?;

        let received = run_phase(MigratePhase::Transfer, async {
            transport
                .transfer(vm, bytes)
                .await
                .map_err(|e| Error::Transfer { vm, reason: e.to_string() })
        })
        .await?;
        self.update_state(MigrationState::Transferred);

        self.update_state(MigrationState::Importing);
        run_phase(
            MigratePhase::Import,
            import_destination(&log, destination, vm, received),
        )
        .await?;
        drop(guard);

        self.update_state(MigrationState::Settling);
        let observed = run_phase(
            MigratePhase::Settle,
            settle(
                &log,
                destination.host.state.as_ref(),
                vm,
                &config.settle,
                deadline,
            ),
        )
        .await?;

        let mut imported = destination
            .store
            .get(vm)
            .ok_or_else(|| Error::vm_not_found(vm))?
            .record;
        observed.apply_to(&mut imported);
        let mut mismatches = equivalence::compare(&snapshot, &imported)?;
        mismatches.extend(
            storage_quota_mismatch(destination.host, &snapshot).await?,
        );
        for m in &mismatches {
            warn!(log, "destination record differs from source";
                "field" => m.field());
        }

        Ok(MigrationResult {
            id: self.id,
            vm,
            final_state: observed.state,
            phases: Vec::new(),
            mismatches,
        })
    }
}

/// Brings the source to rest, stops it if it was running, and exports it.
/// Returns the record as it looked before the source was touched, along
/// with the encoded bundle.
async fn export_source(
    log: &Logger,
    config: &Config,
    source: Endpoint<'_>,
    vm: Uuid,
    deadline: Option<Instant>,
) -> Result<(VmRecord, Bytes), Error> {
    let mut snapshot =
        source.store.get(vm).ok_or_else(|| Error::vm_not_found(vm))?.record;
    let observed =
        settle(log, source.host.state.as_ref(), vm, &config.settle, deadline)
            .await?;
    observed.apply_to(&mut snapshot);

    let was_running = observed.state == VmState::Running;
    if was_running {
        info!(log, "halting source VM");
        source
            .host
            .zones
            .halt(vm)
            .await
            .map_err(|e| Error::external(Interface::Zone, vm, e))?;
        let Observed { state, .. } = settle(
            log,
            source.host.state.as_ref(),
            vm,
            &config.settle,
            deadline,
        )
        .await?;
        if state != VmState::Stopped {
            return Err(Error::Conflict {
                vm,
                reason: format!("source came to rest {state} after halt"),
            });
        }
    }

    let bytes = bundle::export(
        log,
        source.store,
        source.host,
        vm,
        was_running,
        config.bundle.extent_chunk_size,
    )
    .await?;
    Ok((snapshot, bytes))
}

/// Checks that the destination's storage enforces the quota the source
/// record asked for.
async fn storage_quota_mismatch(
    host: &HostServices,
    snapshot: &VmRecord,
) -> Result<Option<FieldMismatch>, Error> {
    let vm = snapshot.uuid;
    let token = host
        .quota
        .get_quota(vm)
        .await
        .map_err(|e| Error::external(Interface::Quota, vm, e))?;
    if parse_quota_token(&token) == Some(snapshot.quota) {
        return Ok(None);
    }
    Ok(Some(FieldMismatch::Differs {
        field: "quota".to_string(),
        before: Value::from(snapshot.quota),
        after: Value::from(token),
    }))
}

/// Imports the bundle on the destination and restores its run state, holding
/// the destination's lock on the VM throughout.
async fn import_destination(
    log: &Logger,
    destination: Endpoint<'_>,
    vm: Uuid,
    bytes: Bytes,
) -> Result<(), Error> {
    let carried = Bundle::decode(bytes.clone()).await?.vm();
    if carried != Some(vm) {
        return Err(Error::Decode(format!(
            "bundle carries VM {carried:?}, expected {vm}"
        )));
    }
    let _guard = destination.locks.lock(vm).await;

    let (_, was_running) =
        bundle::import(log, destination.store, destination.host, bytes).await?;
    if was_running {
        info!(log, "booting destination VM");
        destination
            .host
            .zones
            .boot(vm)
            .await
            .map_err(|e| Error::external(Interface::Zone, vm, e))?;
    }
    Ok(())
}
