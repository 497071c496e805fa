// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turning partial update requests into committed VM records.
//!
//! An update is planned without side effects ([`plan`]): the request is
//! validated, the NIC set reconciled, and the sizing fields recomputed,
//! producing the complete next record and the host changes it implies.
//! [`UpdateCoordinator`] then carries out those host changes, undoing the
//! ones already made if a later one fails, and commits the record only if
//! nothing else committed to the VM in the meantime.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde_derive::Serialize;
use serde_json::Value;
use slog::{debug, info, o, warn, Logger};
use uuid::Uuid;
use vmadm_api_types::{
    Brand, BrandSpec, CreateRequest, Disk, KvmSpec, MacAddr, Nic,
    UpdateRequest, VmRecord, VmState,
};
use vmadm_config::Config;

use crate::error::Error;
use crate::host::{quota_token, HostServices, Interface};
use crate::nic::reconcile;
use crate::sizing::{resize, Sizing};
use crate::store::{IdGuard, IdLocks, Versioned, VmStore};
use crate::validate::{validate, IgnoredField};

#[usdt::provider(provider = "vmadm")]
mod probes {
    fn update_begin(vm: &str) {}
    fn update_commit(vm: &str, gen: u64) {}
    fn update_rollback(vm: &str, steps: u64) {}
}

/// What an update did not apply, and why.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub ignored: Vec<IgnoredField>,
}

/// A change to one NIC that has to be pushed to the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NicChange {
    Added(Nic),
    Changed { before: Nic, after: Nic },
}

impl NicChange {
    pub fn nic(&self) -> &Nic {
        match self {
            NicChange::Added(nic) | NicChange::Changed { after: nic, .. } => nic,
        }
    }
}

/// Host changes implied by an update, in the order they are made.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Effects {
    /// Previous and new quota, in GiB.
    pub quota: Option<(u64, u64)>,
    pub removed_nics: Vec<Nic>,
    pub applied_nics: Vec<NicChange>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.quota.is_none()
            && self.removed_nics.is_empty()
            && self.applied_nics.is_empty()
    }

    fn between(current: &VmRecord, next: &VmRecord) -> Self {
        let quota = (current.quota != next.quota)
            .then_some((current.quota, next.quota));

        let kept: BTreeSet<MacAddr> = next.nics.iter().map(|n| n.mac).collect();
        let removed_nics = current
            .nics
            .iter()
            .filter(|n| !kept.contains(&n.mac))
            .cloned()
            .collect();

        let applied_nics = next
            .nics
            .iter()
            .filter_map(|after| match current.nic(&after.mac) {
                None => Some(NicChange::Added(after.clone())),
                Some(before) if before != after => Some(NicChange::Changed {
                    before: before.clone(),
                    after: after.clone(),
                }),
                Some(_) => None,
            })
            .collect();

        Self { quota, removed_nics, applied_nics }
    }
}

/// A fully computed update that has not been carried out yet.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdatePlan {
    pub record: VmRecord,
    pub report: UpdateReport,
    pub effects: Effects,
}

/// The result of a committed update.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UpdateOutcome {
    pub record: VmRecord,
    pub report: UpdateReport,
}

/// Computes the record that results from applying `request` to `current`.
pub fn plan<R: Rng + ?Sized>(
    current: &VmRecord,
    request: &UpdateRequest,
    config: &Config,
    rng: &mut R,
) -> Result<UpdatePlan, Error> {
    let update = validate(current, request, &config.policy)?;
    if config.policy.strict_brand_fields {
        if let Some(err) = update.first_brand_mismatch() {
            return Err(err);
        }
    }

    let nics = reconcile(&current.nics, &update.nics, current.brand_kind(), rng)?;
    let sizing = resize(
        Sizing::of(current),
        &update.resources,
        config.sizing.min_swap_mib,
    )?;

    let mut next = current.clone();
    sizing.apply_to(&mut next);
    next.nics = nics.nics;

    if let Some(autoboot) = update.autoboot {
        next.autoboot = autoboot;
    }
    if let Some(resolvers) = update.resolvers {
        next.resolvers = resolvers;
    }
    for key in &update.remove_metadata {
        next.customer_metadata.remove(key);
    }
    next.customer_metadata.extend(update.set_metadata);
    for (key, value) in update.properties {
        match value {
            Some(v) => {
                next.properties.insert(key, v);
            }
            None => {
                next.properties.remove(&key);
            }
        }
    }
    if let BrandSpec::Kvm(spec) = &mut next.brand {
        if let Some(vcpus) = update.hvm.vcpus {
            spec.vcpus = Some(vcpus);
        }
        if let Some(driver) = update.hvm.disk_driver {
            spec.disk_driver = Some(driver);
        }
        if let Some(driver) = update.hvm.nic_driver {
            spec.nic_driver = Some(driver);
        }
    }

    let effects = Effects::between(current, &next);
    Ok(UpdatePlan {
        record: next,
        report: UpdateReport { ignored: update.ignored },
        effects,
    })
}

/// Computes the initial record for a VM described by `request`.
///
/// The request's free-form keys are applied as an update to a bare record of
/// the requested brand and size, so creation accepts exactly the vocabulary
/// updates do. `nics` and `customer_metadata` are accepted as synonyms for
/// `add_nics` and `set_customer_metadata`, and `disks` is taken for the
/// hardware-virtualized brand.
pub fn plan_create<R: Rng + ?Sized>(
    request: &CreateRequest,
    config: &Config,
    rng: &mut R,
) -> Result<UpdatePlan, Error> {
    let mut rest = request.rest.clone();
    let mut ignored = Vec::new();

    let disks = match rest.remove("disks") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => serde_json::from_value::<Vec<Disk>>(value)
            .map_err(|e| Error::invalid("disks", e.to_string()))?,
    };
    let brand = match request.brand {
        Brand::Joyent => BrandSpec::Joyent,
        Brand::JoyentMinimal => BrandSpec::JoyentMinimal,
        Brand::Kvm => BrandSpec::Kvm(KvmSpec { disks, ..Default::default() }),
    };
    if !request.brand.is_hvm() && !disks_empty(&request.rest) {
        ignored.push(IgnoredField::BrandRestricted {
            field: "disks".to_string(),
            brand: request.brand,
        });
    }

    for (from, to) in
        [("nics", "add_nics"), ("customer_metadata", "set_customer_metadata")]
    {
        if let Some(value) = rest.remove(from) {
            rest.insert(to.to_string(), value);
        }
    }

    let sizing = Sizing::for_ram(request.ram, config.sizing.min_swap_mib)?;
    let mut bare = VmRecord {
        uuid: request.uuid.unwrap_or_else(Uuid::new_v4),
        brand,
        state: VmState::Configured,
        transition: None,
        autoboot: request.autoboot,
        ram: 0,
        max_physical_memory: 0,
        max_locked_memory: 0,
        max_swap: 0,
        tmpfs: 0,
        quota: 0,
        nics: Vec::new(),
        resolvers: Vec::new(),
        customer_metadata: Default::default(),
        properties: Default::default(),
        last_modified: Utc::now(),
        zoneid: None,
    };
    Sizing { quota: request.quota, ..sizing }.apply_to(&mut bare);

    let mut plan = plan(&bare, &UpdateRequest(rest), config, rng)?;
    ignored.append(&mut plan.report.ignored);
    plan.report.ignored = ignored;
    Ok(plan)
}

fn disks_empty(rest: &serde_json::Map<String, Value>) -> bool {
    match rest.get("disks") {
        None | Some(Value::Null) => true,
        Some(Value::Array(a)) => a.is_empty(),
        Some(_) => false,
    }
}

fn plan_with_thread_rng(
    current: &VmRecord,
    request: &UpdateRequest,
    config: &Config,
) -> Result<UpdatePlan, Error> {
    plan(current, request, config, &mut rand::thread_rng())
}

/// Host changes already made for an in-flight update, and how to reverse
/// them.
#[derive(Debug)]
enum Undo {
    Quota(u64),
    Reapply(Nic),
    Remove(Nic),
}

/// Applies updates to VMs: one at a time per VM, with host changes made
/// before the record is committed.
pub struct UpdateCoordinator {
    log: Logger,
    store: Arc<VmStore>,
    locks: Arc<IdLocks>,
    host: HostServices,
    config: Arc<Config>,
}

impl UpdateCoordinator {
    pub fn new(
        log: &Logger,
        store: Arc<VmStore>,
        locks: Arc<IdLocks>,
        host: HostServices,
        config: Arc<Config>,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "update")),
            store,
            locks,
            host,
            config,
        }
    }

    /// Applies `request` to the VM `id`.
    ///
    /// Dropping the returned future before it completes leaves the stored
    /// record as it was, and host changes already made are reversed on a
    /// separate task that holds the VM's lock until it finishes.
    pub async fn apply_update(
        &self,
        id: Uuid,
        request: &UpdateRequest,
    ) -> Result<UpdateOutcome, Error> {
        let guard = self.locks.lock(id).await;
        let log = self.log.new(o!("vm" => id.to_string()));
        probes::update_begin!(|| id.to_string());

        let Versioned { record: current, gen } =
            self.store.get(id).ok_or_else(|| Error::vm_not_found(id))?;
        let UpdatePlan { record, report, effects } =
            plan_with_thread_rng(&current, request, &self.config)?;

        for field in &report.ignored {
            debug!(log, "ignoring field"; "field" => ?field);
        }

        let mut pending = Pending {
            log: log.clone(),
            host: self.host.clone(),
            id,
            undo: Vec::new(),
            guard: Some(guard),
        };
        if let Err(e) = self.make_changes(id, &effects, &mut pending.undo).await
        {
            pending.roll_back().await;
            return Err(e);
        }

        let mut record = record;
        record.last_modified = Utc::now();
        let new_gen = match self.store.commit(record.clone(), gen) {
            Ok(new_gen) => new_gen,
            Err(e) => {
                pending.roll_back().await;
                return Err(e);
            }
        };
        pending.undo.clear();

        probes::update_commit!(|| (id.to_string(), new_gen));
        info!(log, "committed update";
            "gen" => new_gen,
            "ignored" => report.ignored.len());
        Ok(UpdateOutcome { record, report })
    }

    async fn make_changes(
        &self,
        id: Uuid,
        effects: &Effects,
        undo: &mut Vec<Undo>,
    ) -> Result<(), Error> {
        if let Some((before, after)) = effects.quota {
            self.host
                .quota
                .set_quota(id, &quota_token(after))
                .await
                .map_err(|e| Error::external(Interface::Quota, id, e))?;
            undo.push(Undo::Quota(before));
        }
        for nic in &effects.removed_nics {
            self.host
                .network
                .remove_nic(id, nic)
                .await
                .map_err(|e| Error::external(Interface::Network, id, e))?;
            undo.push(Undo::Reapply(nic.clone()));
        }
        for change in &effects.applied_nics {
            self.host
                .network
                .apply_nic(id, change.nic())
                .await
                .map_err(|e| Error::external(Interface::Network, id, e))?;
            undo.push(match change {
                NicChange::Added(nic) => Undo::Remove(nic.clone()),
                NicChange::Changed { before, .. } => Undo::Reapply(before.clone()),
            });
        }
        Ok(())
    }

}

/// Host changes made by an update that has not committed yet, together with
/// the lock on its VM.
struct Pending {
    log: Logger,
    host: HostServices,
    id: Uuid,
    undo: Vec<Undo>,
    guard: Option<IdGuard>,
}

impl Pending {
    async fn roll_back(&mut self) {
        let undo = std::mem::take(&mut self.undo);
        roll_back(&self.log, &self.host, self.id, undo).await;
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.undo.is_empty() {
            return;
        }
        let undo = std::mem::take(&mut self.undo);
        let log = self.log.clone();
        let host = self.host.clone();
        let id = self.id;
        let guard = self.guard.take();
        warn!(log, "update dropped before commit"; "steps" => undo.len());

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    roll_back(&log, &host, id, undo).await;
                    drop(guard);
                });
            }
            Err(_) => {
                warn!(log, "no runtime to roll back host changes on");
            }
        }
    }
}

/// Reverses host changes, most recent first. Failures are logged and do not
/// stop the remaining steps.
async fn roll_back(
    log: &Logger,
    host: &HostServices,
    id: Uuid,
    undo: Vec<Undo>,
) {
    if undo.is_empty() {
        return;
    }
    probes::update_rollback!(|| (id.to_string(), undo.len() as u64));
    warn!(log, "rolling back host changes"; "steps" => undo.len());

    for step in undo.into_iter().rev() {
        let res = match &step {
            Undo::Quota(gib) => {
                host.quota.set_quota(id, &quota_token(*gib)).await
            }
            Undo::Reapply(nic) => host.network.apply_nic(id, nic).await,
            Undo::Remove(nic) => host.network.remove_nic(id, nic).await,
        };
        if let Err(e) = res {
            warn!(log, "rollback step failed";
                "step" => ?step,
                "error" => %e);
        }
    }
}
