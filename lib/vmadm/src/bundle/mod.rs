// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Export of a stopped VM into a self-contained bundle, and reconstruction
//! of a VM from one.
//!
//! A bundle is a sequence of frames (see [`codec`]): a header, the VM record
//! without its volatile fields, each storage extent as a begin frame, data
//! chunks and an end frame, and a closing frame counting the extents.
//! Importing decodes and checks the entire bundle before touching the host,
//! so a malformed bundle leaves nothing behind.

use std::collections::BTreeSet;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use slog::{info, o, warn, Logger};
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;
use vmadm_api_types::{VmRecord, VmState, VOLATILE_FIELDS};

use crate::error::Error;
use crate::host::{ExtentRef, HostServices, Interface};
use crate::store::VmStore;

pub mod codec;

use codec::{BundleFramer, Frame, FrameError};

/// The bundle format version this crate writes and reads.
pub const BUNDLE_VERSION: u32 = 1;

/// Header flag: the VM was running before it was stopped for export, and
/// should be booted once imported.
pub const FLAG_WAS_RUNNING: u8 = 0x01;

/// The contents of a bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct Bundle {
    /// The exported record, without volatile fields.
    pub record: Map<String, Value>,
    pub was_running: bool,
    pub extents: Vec<(ExtentRef, Bytes)>,
}

impl Bundle {
    /// Captures `record` and `extents`.
    pub fn new(
        record: &VmRecord,
        was_running: bool,
        extents: Vec<(ExtentRef, Bytes)>,
    ) -> Result<Self, Error> {
        Ok(Self { record: exportable(record)?, was_running, extents })
    }

    pub fn vm(&self) -> Option<Uuid> {
        self.record.get("uuid")?.as_str()?.parse().ok()
    }

    /// Rebuilds the VM record, stamping it with a fresh modification time.
    ///
    /// Fails if the record is not a valid VM record, or if it carries fields
    /// a record cannot hold: every exported field must survive the trip.
    pub fn to_record(&self) -> Result<VmRecord, Error> {
        let mut value = self.record.clone();
        for field in VOLATILE_FIELDS {
            if value.contains_key(*field) {
                return Err(Error::Decode(format!(
                    "record carries volatile field {field}"
                )));
            }
        }
        value.insert(
            "last_modified".to_string(),
            serde_json::to_value(Utc::now())
                .map_err(|e| Error::Decode(e.to_string()))?,
        );
        let record: VmRecord = serde_json::from_value(Value::Object(value))
            .map_err(|e| Error::Decode(format!("invalid record: {e}")))?;

        let reread = exportable(&record)?;
        if reread != self.record {
            let before: BTreeSet<&String> = self.record.keys().collect();
            let after: BTreeSet<&String> = reread.keys().collect();
            let lost: Vec<_> = before.difference(&after).collect();
            return Err(Error::Decode(format!(
                "record does not survive import (fields lost: {lost:?})"
            )));
        }
        Ok(record)
    }

    /// Serializes the bundle into frames, splitting extent data into chunks
    /// of at most `chunk_size` bytes.
    pub async fn encode(&self, chunk_size: usize) -> Result<Bytes, Error> {
        let chunk_size = chunk_size.max(1);
        let mut sink = FramedWrite::new(Vec::new(), BundleFramer::new());

        let flags = if self.was_running { FLAG_WAS_RUNNING } else { 0 };
        let record = serde_json::to_string(&self.record)
            .map_err(|e| Error::invalid("record", e.to_string()))?;
        let mut frames = vec![
            Frame::Header { version: BUNDLE_VERSION, flags },
            Frame::Record(record),
        ];
        for (extent, data) in &self.extents {
            let begin = serde_json::to_string(extent)
                .map_err(|e| Error::invalid("extent", e.to_string()))?;
            frames.push(Frame::ExtentBegin(begin));
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + chunk_size).min(data.len());
                frames.push(Frame::ExtentData(data.slice(offset..end)));
                offset = end;
            }
            frames.push(Frame::ExtentEnd(data.len() as u64));
        }
        frames.push(Frame::End(self.extents.len() as u32));

        for frame in frames {
            sink.feed(frame).await.map_err(encode_error)?;
        }
        sink.flush().await.map_err(encode_error)?;
        Ok(Bytes::from(sink.into_inner()))
    }

    /// Parses and checks an entire bundle.
    pub async fn decode(bytes: Bytes) -> Result<Self, Error> {
        let mut frames = FramedRead::new(&bytes[..], BundleFramer::new());

        let was_running = match next_frame(&mut frames).await? {
            Frame::Header { version: BUNDLE_VERSION, flags } => {
                if flags & !FLAG_WAS_RUNNING != 0 {
                    return Err(Error::Decode(format!(
                        "unknown header flags {flags:#04x}"
                    )));
                }
                flags & FLAG_WAS_RUNNING != 0
            }
            Frame::Header { version, .. } => {
                return Err(Error::Decode(format!(
                    "unsupported bundle version {version}"
                )));
            }
            other => return Err(unexpected(&other, "header")),
        };

        let record = match next_frame(&mut frames).await? {
            Frame::Record(s) => match serde_json::from_str::<Value>(&s) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(Error::Decode(
                        "record is not a JSON object".to_string(),
                    ))
                }
                Err(e) => {
                    return Err(Error::Decode(format!("invalid record: {e}")))
                }
            },
            other => return Err(unexpected(&other, "record")),
        };

        let mut extents = Vec::new();
        loop {
            match next_frame(&mut frames).await? {
                Frame::ExtentBegin(s) => {
                    let extent: ExtentRef = serde_json::from_str(&s)
                        .map_err(|e| {
                            Error::Decode(format!("invalid extent: {e}"))
                        })?;
                    let mut data = BytesMut::new();
                    let sent = loop {
                        match next_frame(&mut frames).await? {
                            Frame::ExtentData(chunk) => {
                                data.extend_from_slice(&chunk)
                            }
                            Frame::ExtentEnd(n) => break n,
                            other => {
                                return Err(unexpected(&other, "extent data"))
                            }
                        }
                    };
                    if sent != data.len() as u64 || sent != extent.size {
                        return Err(Error::Decode(format!(
                            "extent {} declared {} bytes, ended at {sent}, \
                             carried {}",
                            extent.name,
                            extent.size,
                            data.len()
                        )));
                    }
                    extents.push((extent, data.freeze()));
                }
                Frame::End(n) => {
                    if n as usize != extents.len() {
                        return Err(Error::Decode(format!(
                            "bundle declares {n} extents, carried {}",
                            extents.len()
                        )));
                    }
                    break;
                }
                other => return Err(unexpected(&other, "extent or end")),
            }
        }

        if frames.next().await.is_some() {
            return Err(Error::Decode(
                "frames follow the end of the bundle".to_string(),
            ));
        }
        Ok(Self { record, was_running, extents })
    }
}

async fn next_frame(
    frames: &mut FramedRead<&[u8], BundleFramer>,
) -> Result<Frame, Error> {
    match frames.next().await {
        Some(res) => res.map_err(decode_error),
        None => Err(Error::Decode("bundle ends early".to_string())),
    }
}

/// The record as JSON, without the volatile fields.
pub(crate) fn exportable(record: &VmRecord) -> Result<Map<String, Value>, Error> {
    match serde_json::to_value(record) {
        Ok(Value::Object(mut map)) => {
            for field in VOLATILE_FIELDS {
                map.remove(*field);
            }
            Ok(map)
        }
        Ok(_) => Err(Error::invalid("record", "not a JSON object")),
        Err(e) => Err(Error::invalid("record", e.to_string())),
    }
}

fn encode_error(e: FrameError) -> Error {
    Error::invalid("bundle", e.to_string())
}

fn decode_error(e: FrameError) -> Error {
    Error::Decode(e.to_string())
}

fn unexpected(frame: &Frame, wanted: &str) -> Error {
    Error::Decode(format!(
        "expected {wanted} frame, found {:?}",
        codec::FrameType::from(frame)
    ))
}

/// Exports the stopped VM `id` as an encoded bundle.
pub async fn export(
    log: &Logger,
    store: &VmStore,
    host: &HostServices,
    id: Uuid,
    was_running: bool,
    chunk_size: usize,
) -> Result<Bytes, Error> {
    let log = log.new(o!("vm" => id.to_string()));
    let mut record =
        store.get(id).ok_or_else(|| Error::vm_not_found(id))?.record;

    let observed = host
        .state
        .observe(id)
        .await
        .map_err(|e| Error::external(Interface::State, id, e))?;
    if observed.state != VmState::Stopped || observed.transition.is_some() {
        return Err(Error::Conflict {
            vm: id,
            reason: format!(
                "must be stopped to export (is {})",
                observed.state
            ),
        });
    }
    record.state = VmState::Stopped;
    record.transition = None;

    let storage_err = |e| Error::external(Interface::Storage, id, e);
    let mut extents = Vec::new();
    for extent in host.storage.list_extents(id).await.map_err(storage_err)? {
        let data =
            host.storage.read_extent(id, &extent).await.map_err(storage_err)?;
        if data.len() as u64 != extent.size {
            return Err(storage_err(crate::host::HostError::Failed(format!(
                "extent {} is {} bytes, expected {}",
                extent.name,
                data.len(),
                extent.size
            ))));
        }
        extents.push((extent, data));
    }

    let bundle = Bundle::new(&record, was_running, extents)?;
    let bytes = bundle.encode(chunk_size).await?;
    info!(log, "exported bundle";
        "bytes" => bytes.len(),
        "extents" => bundle.extents.len(),
        "was_running" => was_running);
    Ok(bytes)
}

/// Reconstructs a VM from an encoded bundle, returning its record and
/// whether the source was running before export. The VM is left stopped.
///
/// Nothing is registered on the host or in `store` unless the whole bundle
/// decodes. If a host step fails part way, the steps already taken are
/// undone.
pub async fn import(
    log: &Logger,
    store: &VmStore,
    host: &HostServices,
    bytes: Bytes,
) -> Result<(VmRecord, bool), Error> {
    let bundle = Bundle::decode(bytes).await?;
    let record = bundle.to_record()?;
    let id = record.uuid;
    let log = log.new(o!("vm" => id.to_string()));

    if store.contains(id) {
        return Err(Error::Conflict {
            vm: id,
            reason: "a VM with this identifier already exists".to_string(),
        });
    }

    // Provisioning fails for a zone the host already has, before any of its
    // storage is touched.
    host
        .zones
        .provision(&record)
        .await
        .map_err(|e| Error::external(Interface::Zone, id, e))?;

    for (extent, data) in &bundle.extents {
        if let Err(e) =
            host.storage.write_extent(id, extent, data.clone()).await
        {
            destroy(&log, host, id).await;
            discard(&log, host, id).await;
            return Err(Error::external(Interface::Storage, id, e));
        }
    }

    if let Err(e) = store.insert(record.clone()) {
        destroy(&log, host, id).await;
        discard(&log, host, id).await;
        return Err(e);
    }

    info!(log, "imported bundle";
        "extents" => bundle.extents.len(),
        "was_running" => bundle.was_running);
    Ok((record, bundle.was_running))
}

async fn destroy(log: &Logger, host: &HostServices, id: Uuid) {
    if let Err(e) = host.zones.destroy(id).await {
        warn!(log, "failed to destroy orphaned zone"; "error" => %e);
    }
}

async fn discard(log: &Logger, host: &HostServices, id: Uuid) {
    if let Err(e) = host.storage.discard_extents(id).await {
        warn!(log, "failed to discard extents"; "error" => %e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeHost, FakeOp};
    use crate::host::HostError;
    use crate::test_support::{logger, minimal_zone};
    use proptest::collection::{btree_map, vec};
    use proptest::option::of;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tokio_util::codec::Encoder;
    use vmadm_api_types::{
        BrandSpec, Disk, KvmSpec, MacAddr, Nic, NicIp, ScalarValue, Transition,
    };

    fn extent(name: &str, data: &'static [u8]) -> (ExtentRef, Bytes) {
        (
            ExtentRef { name: name.to_string(), size: data.len() as u64 },
            Bytes::from_static(data),
        )
    }

    fn frames(frames: Vec<Frame>) -> Bytes {
        let mut bytes = BytesMut::new();
        let mut framer = BundleFramer::new();
        for f in frames {
            framer.encode(f, &mut bytes).unwrap();
        }
        bytes.freeze()
    }

    fn record_frame(record: &VmRecord) -> Frame {
        let map = exportable(record).unwrap();
        Frame::Record(serde_json::to_string(&map).unwrap())
    }

    #[tokio::test]
    async fn encode_then_decode_with_chunks() {
        let mut record = minimal_zone();
        record.zoneid = Some(12);
        let bundle = Bundle::new(
            &record,
            true,
            vec![extent("root", b"0123456789"), extent("empty", b"")],
        )
        .unwrap();
        assert!(!bundle.record.contains_key("zoneid"));
        assert!(!bundle.record.contains_key("last_modified"));

        let bytes = bundle.encode(4).await.unwrap();
        let decoded = Bundle::decode(bytes).await.unwrap();
        assert_eq!(decoded, bundle);

        let back = decoded.to_record().unwrap();
        assert_eq!(back.zoneid, None);
        assert_eq!(exportable(&back).unwrap(), bundle.record);
    }

    #[tokio::test]
    async fn rejects_unknown_version() {
        let record = minimal_zone();
        let bytes = frames(vec![
            Frame::Header { version: 2, flags: 0 },
            record_frame(&record),
            Frame::End(0),
        ]);
        let err = Bundle::decode(bytes).await.unwrap_err();
        assert!(matches!(err, Error::Decode(ref m) if m.contains("version 2")));
    }

    #[tokio::test]
    async fn rejects_out_of_order_frames() {
        let record = minimal_zone();
        let bytes = frames(vec![
            record_frame(&record),
            Frame::Header { version: 1, flags: 0 },
            Frame::End(0),
        ]);
        assert!(matches!(
            Bundle::decode(bytes).await.unwrap_err(),
            Error::Decode(_)
        ));

        let bytes = frames(vec![
            Frame::Header { version: 1, flags: 0 },
            record_frame(&record),
            Frame::ExtentData(Bytes::from_static(b"stray")),
            Frame::End(0),
        ]);
        assert!(matches!(
            Bundle::decode(bytes).await.unwrap_err(),
            Error::Decode(_)
        ));
    }

    #[tokio::test]
    async fn rejects_size_mismatches() {
        let record = minimal_zone();
        let begin = serde_json::to_string(&ExtentRef {
            name: "root".to_string(),
            size: 4,
        })
        .unwrap();
        let bytes = frames(vec![
            Frame::Header { version: 1, flags: 0 },
            record_frame(&record),
            Frame::ExtentBegin(begin),
            Frame::ExtentData(Bytes::from_static(b"abc")),
            Frame::ExtentEnd(3),
            Frame::End(1),
        ]);
        let err = Bundle::decode(bytes).await.unwrap_err();
        assert!(matches!(err, Error::Decode(ref m) if m.contains("root")));

        let bytes = frames(vec![
            Frame::Header { version: 1, flags: 0 },
            record_frame(&record),
            Frame::End(1),
        ]);
        assert!(Bundle::decode(bytes).await.is_err());
    }

    #[tokio::test]
    async fn rejects_truncation_and_trailing_frames() {
        let bundle = Bundle::new(&minimal_zone(), false, Vec::new()).unwrap();
        let bytes = bundle.encode(1024).await.unwrap();

        let truncated = bytes.slice(..bytes.len() - 2);
        assert!(Bundle::decode(truncated).await.is_err());

        let mut extended = BytesMut::from(&bytes[..]);
        BundleFramer::new().encode(Frame::End(0), &mut extended).unwrap();
        assert!(Bundle::decode(extended.freeze()).await.is_err());
    }

    #[tokio::test]
    async fn record_must_survive_import() {
        let mut bundle = Bundle::new(&minimal_zone(), false, Vec::new()).unwrap();
        bundle.record.insert("bogus".to_string(), Value::from(1));
        let err = bundle.to_record().unwrap_err();
        assert!(matches!(err, Error::Decode(ref m) if m.contains("bogus")));

        let mut bundle = Bundle::new(&minimal_zone(), false, Vec::new()).unwrap();
        bundle.record.remove("ram");
        assert!(matches!(bundle.to_record().unwrap_err(), Error::Decode(_)));
    }

    #[tokio::test]
    async fn export_requires_stopped_vm() {
        let fake = Arc::new(FakeHost::new());
        let host = fake.services();
        let store = VmStore::new();
        let record = minimal_zone();
        let id = record.uuid;
        fake.install(&record);
        store.insert(record).unwrap();
        host.zones.boot(id).await.unwrap();

        let err = export(&logger(), &store, &host, id, false, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn import_failure_leaves_nothing_behind() {
        let fake = Arc::new(FakeHost::new());
        let host = fake.services();
        let store = VmStore::new();
        let record = minimal_zone();
        let id = record.uuid;
        let bundle =
            Bundle::new(&record, false, vec![extent("root", b"data")]).unwrap();
        let bytes = bundle.encode(2).await.unwrap();

        fake.fail_next(FakeOp::Provision, HostError::Failed("zoneadm".into()));
        let err = import(&logger(), &store, &host, bytes.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::External { interface: Interface::Zone, .. }));
        assert!(!store.contains(id));
        assert!(!fake.contains(id));
        assert!(fake.extents_of(id).is_empty());

        let (imported, was_running) =
            import(&logger(), &store, &host, bytes).await.unwrap();
        assert!(!was_running);
        assert_eq!(imported.uuid, id);
        assert!(store.contains(id));
        assert_eq!(fake.extents_of(id), vec![extent("root", b"data")]);
    }

    #[tokio::test]
    async fn storage_failure_removes_provisioned_zone() {
        let fake = Arc::new(FakeHost::new());
        let host = fake.services();
        let store = VmStore::new();
        let record = minimal_zone();
        let id = record.uuid;
        let bytes = Bundle::new(&record, false, vec![extent("root", b"data")])
            .unwrap()
            .encode(16)
            .await
            .unwrap();

        fake.fail_next(FakeOp::WriteExtent, HostError::Failed("zfs".into()));
        let err = import(&logger(), &store, &host, bytes).await.unwrap_err();
        assert!(matches!(
            err,
            Error::External { interface: Interface::Storage, .. }
        ));
        assert!(!store.contains(id));
        assert!(!fake.contains(id));
        assert!(fake.extents_of(id).is_empty());
    }

    #[tokio::test]
    async fn unrecorded_zone_keeps_its_storage() {
        let fake = Arc::new(FakeHost::new());
        let host = fake.services();
        let store = VmStore::new();
        let record = minimal_zone();
        let id = record.uuid;
        fake.install(&record);
        fake.put_extent(id, "root", Bytes::from_static(b"live"));
        let bytes = Bundle::new(&record, false, vec![extent("root", b"old")])
            .unwrap()
            .encode(16)
            .await
            .unwrap();

        let err = import(&logger(), &store, &host, bytes).await.unwrap_err();
        assert!(matches!(err, Error::External { interface: Interface::Zone, .. }));
        assert_eq!(fake.extents_of(id), vec![extent("root", b"live")]);
        assert_eq!(fake.calls(FakeOp::WriteExtent), 0);
        assert_eq!(fake.calls(FakeOp::DiscardExtents), 0);
    }

    #[tokio::test]
    async fn import_rejects_existing_vm() {
        let fake = Arc::new(FakeHost::new());
        let host = fake.services();
        let store = VmStore::new();
        let record = minimal_zone();
        store.insert(record.clone()).unwrap();
        let bytes = Bundle::new(&record, false, Vec::new())
            .unwrap()
            .encode(16)
            .await
            .unwrap();
        let err = import(&logger(), &store, &host, bytes).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(fake.calls(FakeOp::Provision), 0);
    }

    fn ipv4() -> impl Strategy<Value = Ipv4Addr> {
        any::<[u8; 4]>().prop_map(Ipv4Addr::from)
    }

    fn state() -> impl Strategy<Value = VmState> {
        prop_oneof![
            Just(VmState::Stopped),
            Just(VmState::Running),
            Just(VmState::Ready),
            Just(VmState::Installed),
            Just(VmState::Failed),
        ]
    }

    fn nic_strategy() -> impl Strategy<Value = Nic> {
        let ip = prop_oneof![
            Just(NicIp::Dhcp),
            ipv4().prop_map(NicIp::Static),
            // A single-entry list reads back as a static address.
            vec(ipv4(), 2..4).prop_map(NicIp::List),
        ];
        (
            (0u8..16, any::<[u8; 6]>(), "[a-z]{1,8}", ip),
            (
                of(ipv4()),
                of(ipv4()),
                of(0u16..4095),
                of(any::<bool>()),
                of(any::<bool>()),
                of("[a-z0-9]{1,8}"),
            ),
        )
            .prop_map(
                |(
                    (index, mac, nic_tag, ip),
                    (netmask, gateway, vlan_id, primary, promisc, model),
                )| Nic {
                    interface: format!("net{index}"),
                    mac: MacAddr::new(mac),
                    nic_tag,
                    ip,
                    netmask,
                    gateway,
                    vlan_id,
                    primary,
                    allow_unfiltered_promisc: promisc,
                    model,
                },
            )
    }

    fn brand_strategy() -> impl Strategy<Value = BrandSpec> {
        let disk = (
            "/dev/zvol/rdsk/zones/[a-z0-9]{1,8}",
            0u64..(1 << 40),
            of(any::<bool>()),
            of(any::<u128>().prop_map(Uuid::from_u128)),
            of("[a-z]{1,8}"),
        )
            .prop_map(|(path, size, boot, image_uuid, model)| Disk {
                path,
                size,
                boot,
                image_uuid,
                model,
            });
        let kvm = (
            of(1u32..64),
            of("[a-z-]{1,8}"),
            of("[a-z-]{1,8}"),
            vec(disk, 0..3),
        )
            .prop_map(|(vcpus, disk_driver, nic_driver, disks)| {
                BrandSpec::Kvm(KvmSpec { vcpus, disk_driver, nic_driver, disks })
            });
        prop_oneof![Just(BrandSpec::Joyent), Just(BrandSpec::JoyentMinimal), kvm]
    }

    fn scalar_strategy() -> impl Strategy<Value = ScalarValue> {
        prop_oneof![
            any::<bool>().prop_map(ScalarValue::Bool),
            any::<i64>().prop_map(|n| ScalarValue::Number(n.into())),
            "[a-z0-9 ._-]{0,16}".prop_map(ScalarValue::String),
        ]
    }

    fn record_strategy() -> impl Strategy<Value = VmRecord> {
        (
            (
                any::<u128>(),
                brand_strategy(),
                state(),
                of(state()),
                any::<bool>(),
                of(any::<i32>()),
            ),
            (
                1u64..65536,
                1u64..65536,
                0u64..65536,
                0u64..65536,
                0u64..65536,
                0u64..1024,
            ),
            (
                vec(nic_strategy(), 0..4),
                vec(ipv4(), 0..3),
                btree_map("[a-z-]{1,12}", ".{0,24}", 0..4),
                btree_map("[a-z_]{1,12}", scalar_strategy(), 0..4),
            ),
        )
            .prop_map(
                |(
                    (id, brand, state, to, autoboot, zoneid),
                    (ram, mpm, locked, swap, tmpfs, quota),
                    (nics, resolvers, customer_metadata, properties),
                )| VmRecord {
                    uuid: Uuid::from_u128(id),
                    brand,
                    state,
                    transition: to.map(|to| Transition { to }),
                    autoboot,
                    ram,
                    max_physical_memory: mpm,
                    max_locked_memory: locked,
                    max_swap: swap,
                    tmpfs,
                    quota,
                    nics,
                    resolvers,
                    customer_metadata,
                    properties,
                    last_modified: Utc::now(),
                    zoneid,
                },
            )
    }

    proptest! {
        #[test]
        fn any_record_survives_a_bundle(
            record in record_strategy(),
            was_running in any::<bool>(),
            data in vec(any::<u8>(), 0..64),
            chunk_size in 1usize..32,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let extent = ExtentRef {
                name: "disk0".to_string(),
                size: data.len() as u64,
            };
            let extents = vec![(extent, Bytes::from(data))];
            let bundle = Bundle::new(&record, was_running, extents).unwrap();
            let decoded = rt.block_on(async {
                let bytes = bundle.encode(chunk_size).await.unwrap();
                Bundle::decode(bytes).await.unwrap()
            });
            prop_assert_eq!(&decoded, &bundle);

            let back = decoded.to_record().unwrap();
            prop_assert_eq!(back.zoneid, None);
            prop_assert_eq!(
                exportable(&back).unwrap(),
                exportable(&record).unwrap()
            );
        }
    }
}
