// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory implementations of the host interfaces.
//!
//! [`FakeHost`] models one host: VMs move through transitional states for a
//! configurable number of observations after a boot or halt, and any
//! operation can be made to fail once with [`FakeHost::fail_next`].
//! [`LoopbackTransport`] hands bundles straight back, optionally damaged.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use uuid::Uuid;
use vmadm_api_types::{MacAddr, Nic, Transition, VmRecord, VmState};

use crate::host::{
    quota_token, ExtentRef, HostError, HostServices, NetworkConfig, Observed,
    QuotaBackend, StateObserver, StorageBackend, Transport, ZoneManager,
};

/// Operations whose failure can be injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FakeOp {
    Provision,
    Destroy,
    Boot,
    Halt,
    Observe,
    SetQuota,
    GetQuota,
    ApplyNic,
    RemoveNic,
    ListExtents,
    ReadExtent,
    WriteExtent,
    DiscardExtents,
}

struct FakeVm {
    state: VmState,
    zoneid: Option<i32>,
    /// Observations to report before `state` becomes visible.
    pending: VecDeque<Observed>,
    quota: String,
    nics: BTreeMap<MacAddr, Nic>,
}

impl FakeVm {
    fn new(record: &VmRecord) -> Self {
        Self {
            state: VmState::Stopped,
            zoneid: None,
            pending: VecDeque::new(),
            quota: quota_token(record.quota),
            nics: record.nics.iter().map(|n| (n.mac, n.clone())).collect(),
        }
    }

    fn observed(&self) -> Observed {
        Observed { state: self.state, transition: None, zoneid: self.zoneid }
    }
}

struct Inner {
    vms: BTreeMap<Uuid, FakeVm>,
    storage: BTreeMap<Uuid, Vec<(ExtentRef, Bytes)>>,
    /// Observations reported forever in place of the real state.
    stalled: BTreeMap<Uuid, Observed>,
    failures: BTreeMap<FakeOp, VecDeque<HostError>>,
    calls: BTreeMap<FakeOp, usize>,
    transition_polls: usize,
    next_zoneid: i32,
}

impl Inner {
    /// Records a call to `op`, failing it if a failure was queued.
    fn enter(&mut self, op: FakeOp) -> Result<(), HostError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn vm(&mut self, id: Uuid) -> Result<&mut FakeVm, HostError> {
        self.vms.get_mut(&id).ok_or(HostError::NoSuchVm)
    }

    fn transition(&mut self, id: Uuid, via: VmState, to: VmState) -> Result<(), HostError> {
        let polls = self.transition_polls;
        let zoneid = match to {
            VmState::Running => {
                self.next_zoneid += 1;
                Some(self.next_zoneid)
            }
            _ => None,
        };
        let vm = self.vm(id)?;
        if vm.state == to && vm.pending.is_empty() {
            return Ok(());
        }
        vm.pending = (0..polls)
            .map(|_| Observed {
                state: via,
                transition: Some(Transition { to }),
                zoneid: vm.zoneid,
            })
            .collect();
        vm.state = to;
        vm.zoneid = zoneid;
        Ok(())
    }
}

/// An in-memory host.
pub struct FakeHost {
    inner: Mutex<Inner>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self::with_transition_polls(1)
    }

    /// A host on which boots and halts report a transitional state for
    /// `polls` observations before completing.
    pub fn with_transition_polls(polls: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                vms: BTreeMap::new(),
                storage: BTreeMap::new(),
                stalled: BTreeMap::new(),
                failures: BTreeMap::new(),
                calls: BTreeMap::new(),
                transition_polls: polls,
                next_zoneid: 0,
            }),
        }
    }

    pub fn services(self: &Arc<Self>) -> HostServices {
        HostServices {
            zones: self.clone(),
            state: self.clone(),
            quota: self.clone(),
            network: self.clone(),
            storage: self.clone(),
        }
    }

    /// Registers a stopped VM as if it had been provisioned.
    pub fn install(&self, record: &VmRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.vms.insert(record.uuid, FakeVm::new(record));
    }

    /// Makes the next call to `op` fail with `err`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: FakeOp, err: HostError) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures.entry(op).or_default().push_back(err);
    }

    /// Makes `vm` report `observed` until [`FakeHost::unstall`] is called.
    /// Takes effect once `vm` exists, so it can be set up ahead of a
    /// provision.
    pub fn stall(&self, vm: Uuid, observed: Observed) {
        self.inner.lock().unwrap().stalled.insert(vm, observed);
    }

    pub fn unstall(&self, vm: Uuid) {
        self.inner.lock().unwrap().stalled.remove(&vm);
    }

    pub fn put_extent(&self, vm: Uuid, name: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let extent = ExtentRef { name: name.to_string(), size: data.len() as u64 };
        let mut inner = self.inner.lock().unwrap();
        inner.storage.entry(vm).or_default().push((extent, data));
    }

    pub fn extents_of(&self, vm: Uuid) -> Vec<(ExtentRef, Bytes)> {
        let inner = self.inner.lock().unwrap();
        inner.storage.get(&vm).cloned().unwrap_or_default()
    }

    pub fn contains(&self, vm: Uuid) -> bool {
        self.inner.lock().unwrap().vms.contains_key(&vm)
    }

    /// The settled state `vm` is in or heading to.
    pub fn state_of(&self, vm: Uuid) -> Option<VmState> {
        self.inner.lock().unwrap().vms.get(&vm).map(|v| v.state)
    }

    pub fn quota_of(&self, vm: Uuid) -> Option<String> {
        self.inner.lock().unwrap().vms.get(&vm).map(|v| v.quota.clone())
    }

    pub fn nics_of(&self, vm: Uuid) -> Vec<Nic> {
        let inner = self.inner.lock().unwrap();
        inner
            .vms
            .get(&vm)
            .map(|v| v.nics.values().cloned().collect())
            .unwrap_or_default()
    }

    /// How many times `op` has been called.
    pub fn calls(&self, op: FakeOp) -> usize {
        self.inner.lock().unwrap().calls.get(&op).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ZoneManager for FakeHost {
    async fn provision(&self, record: &VmRecord) -> Result<(), HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::Provision)?;
        if inner.vms.contains_key(&record.uuid) {
            return Err(HostError::Failed(format!(
                "zone {} already exists",
                record.uuid
            )));
        }
        inner.vms.insert(record.uuid, FakeVm::new(record));
        Ok(())
    }

    async fn destroy(&self, vm: Uuid) -> Result<(), HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::Destroy)?;
        inner.vms.remove(&vm).ok_or(HostError::NoSuchVm)?;
        inner.storage.remove(&vm);
        Ok(())
    }

    async fn boot(&self, vm: Uuid) -> Result<(), HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::Boot)?;
        inner.transition(vm, VmState::Ready, VmState::Running)
    }

    async fn halt(&self, vm: Uuid) -> Result<(), HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::Halt)?;
        inner.transition(vm, VmState::ShuttingDown, VmState::Stopped)
    }
}

#[async_trait]
impl StateObserver for FakeHost {
    async fn observe(&self, vm: Uuid) -> Result<Observed, HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::Observe)?;
        if let Some(stalled) = inner.stalled.get(&vm) {
            if inner.vms.contains_key(&vm) {
                return Ok(stalled.clone());
            }
        }
        let vm = inner.vm(vm)?;
        Ok(vm.pending.pop_front().unwrap_or_else(|| vm.observed()))
    }
}

#[async_trait]
impl QuotaBackend for FakeHost {
    async fn set_quota(&self, vm: Uuid, token: &str) -> Result<(), HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::SetQuota)?;
        inner.vm(vm)?.quota = token.to_string();
        Ok(())
    }

    async fn get_quota(&self, vm: Uuid) -> Result<String, HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::GetQuota)?;
        Ok(inner.vm(vm)?.quota.clone())
    }
}

#[async_trait]
impl NetworkConfig for FakeHost {
    async fn apply_nic(&self, vm: Uuid, nic: &Nic) -> Result<(), HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::ApplyNic)?;
        inner.vm(vm)?.nics.insert(nic.mac, nic.clone());
        Ok(())
    }

    async fn remove_nic(&self, vm: Uuid, nic: &Nic) -> Result<(), HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::RemoveNic)?;
        inner.vm(vm)?.nics.remove(&nic.mac);
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FakeHost {
    async fn list_extents(
        &self,
        vm: Uuid,
    ) -> Result<Vec<ExtentRef>, HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::ListExtents)?;
        Ok(inner
            .storage
            .get(&vm)
            .map(|e| e.iter().map(|(r, _)| r.clone()).collect())
            .unwrap_or_default())
    }

    async fn read_extent(
        &self,
        vm: Uuid,
        extent: &ExtentRef,
    ) -> Result<Bytes, HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::ReadExtent)?;
        inner
            .storage
            .get(&vm)
            .and_then(|e| e.iter().find(|(r, _)| r.name == extent.name))
            .map(|(_, data)| data.clone())
            .ok_or_else(|| {
                HostError::Failed(format!("no extent named {}", extent.name))
            })
    }

    async fn write_extent(
        &self,
        vm: Uuid,
        extent: &ExtentRef,
        data: Bytes,
    ) -> Result<(), HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::WriteExtent)?;
        let extents = inner.storage.entry(vm).or_default();
        extents.retain(|(r, _)| r.name != extent.name);
        extents.push((extent.clone(), data));
        Ok(())
    }

    async fn discard_extents(&self, vm: Uuid) -> Result<(), HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter(FakeOp::DiscardExtents)?;
        inner.storage.remove(&vm);
        Ok(())
    }
}

#[derive(Default)]
struct LoopbackState {
    failures: VecDeque<HostError>,
    corrupt_at: Option<usize>,
    transfers: usize,
}

/// A transport that returns every bundle unchanged, unless told to fail or
/// to damage one byte.
#[derive(Default)]
pub struct LoopbackTransport {
    inner: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, err: HostError) {
        self.inner.lock().unwrap().failures.push_back(err);
    }

    /// Flips the bits of the byte at `offset` in the next bundle.
    pub fn corrupt_next(&self, offset: usize) {
        self.inner.lock().unwrap().corrupt_at = Some(offset);
    }

    pub fn transfers(&self) -> usize {
        self.inner.lock().unwrap().transfers
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn transfer(
        &self,
        _vm: Uuid,
        bundle: Bytes,
    ) -> Result<Bytes, HostError> {
        let mut inner = self.inner.lock().unwrap();
        inner.transfers += 1;
        if let Some(err) = inner.failures.pop_front() {
            return Err(err);
        }
        match inner.corrupt_at.take() {
            Some(offset) if offset < bundle.len() => {
                let mut damaged = BytesMut::from(&bundle[..]);
                damaged[offset] ^= 0xff;
                Ok(damaged.freeze())
            }
            _ => Ok(bundle),
        }
    }
}
