// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of a VM's NIC set against add, update, and remove
//! operations.
//!
//! The result always has unique MAC addresses and at most one NIC marked
//! primary. Operations are applied as removals, then updates, then
//! additions.

use std::collections::BTreeSet;

use rand::Rng;
use vmadm_api_types::{Brand, MacAddr, Nic};

use crate::brand::BrandField;
use crate::error::Error;
use crate::validate::{NicFields, NicOps};

/// The OUI used for generated MAC addresses.
pub const GENERATED_MAC_PREFIX: [u8; 3] = [0x90, 0xb8, 0xd0];

/// The result of reconciling a NIC set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NicOutcome {
    pub nics: Vec<Nic>,
    /// Removals that matched no NIC.
    pub unmatched_removals: Vec<MacAddr>,
    /// Fields that were dropped because the brand does not accept them.
    pub dropped: Vec<String>,
}

/// Applies `ops` to `current`.
///
/// Removing a NIC that does not exist is not an error; it is reported in
/// [`NicOutcome::unmatched_removals`]. Updating one is.
pub fn reconcile<R: Rng + ?Sized>(
    current: &[Nic],
    ops: &NicOps,
    brand: Brand,
    rng: &mut R,
) -> Result<NicOutcome, Error> {
    let mut nics = current.to_vec();
    let mut unmatched_removals = Vec::new();
    let mut dropped = Vec::new();

    let mut removed_primary = false;
    for mac in &ops.remove {
        match nics.iter().position(|n| &n.mac == mac) {
            Some(idx) => {
                removed_primary |= nics.remove(idx).is_primary();
            }
            None => unmatched_removals.push(*mac),
        }
    }

    for (i, patch) in ops.update.iter().enumerate() {
        let idx = nics
            .iter()
            .position(|n| n.mac == patch.mac)
            .ok_or_else(|| Error::NotFound {
                what: "NIC",
                id: patch.mac.to_string(),
            })?;
        let fields =
            admit(&patch.fields, brand, &format!("update_nics[{i}]"), &mut dropped);
        if fields.primary == Some(true) {
            clear_primary(&mut nics);
        }
        merge(&mut nics[idx], fields);
    }

    for (i, add) in ops.add.iter().enumerate() {
        let prefix = format!("add_nics[{i}]");
        let mut fields = admit(&add.fields, brand, &prefix, &mut dropped);

        let mac = match add.mac {
            Some(mac) => {
                if nics.iter().any(|n| n.mac == mac) {
                    return Err(Error::invalid(
                        format!("{prefix}.mac"),
                        format!("{mac} is already in use"),
                    ));
                }
                mac
            }
            None => generate_mac(&nics, rng),
        };
        let interface = match fields.interface.take() {
            Some(name) => name,
            None => next_interface(&nics),
        };
        let nic_tag = fields.nic_tag.take().ok_or_else(|| {
            Error::invalid(format!("{prefix}.nic_tag"), "is required")
        })?;
        let ip = fields
            .ip
            .take()
            .ok_or_else(|| Error::invalid(format!("{prefix}.ip"), "is required"))?;

        if fields.primary == Some(true) {
            clear_primary(&mut nics);
        }
        nics.push(Nic {
            interface,
            mac,
            nic_tag,
            ip,
            netmask: fields.netmask,
            gateway: fields.gateway,
            vlan_id: fields.vlan_id,
            primary: fields.primary,
            allow_unfiltered_promisc: fields.allow_unfiltered_promisc,
            model: fields.model,
        });
    }

    if removed_primary && !nics.iter().any(Nic::is_primary) {
        let elected = nics
            .iter()
            .position(|n| n.ip.has_public_addr())
            .or_else(|| (!nics.is_empty()).then_some(0));
        if let Some(idx) = elected {
            nics[idx].primary = Some(true);
        }
    }

    Ok(NicOutcome { nics, unmatched_removals, dropped })
}

/// Returns a copy of `fields` without the ones `brand` does not accept,
/// recording each dropped field under `prefix`.
fn admit(
    fields: &NicFields,
    brand: Brand,
    prefix: &str,
    dropped: &mut Vec<String>,
) -> NicFields {
    let mut fields = fields.clone();
    if fields.allow_unfiltered_promisc.is_some()
        && !BrandField::AllowUnfilteredPromisc.allowed_for(brand)
    {
        fields.allow_unfiltered_promisc = None;
        dropped.push(format!("{prefix}.{}", BrandField::AllowUnfilteredPromisc));
    }
    if fields.model.is_some() && !BrandField::Model.allowed_for(brand) {
        fields.model = None;
        dropped.push(format!("{prefix}.{}", BrandField::Model));
    }
    fields
}

fn merge(nic: &mut Nic, fields: NicFields) {
    if let Some(v) = fields.interface {
        nic.interface = v;
    }
    if let Some(v) = fields.nic_tag {
        nic.nic_tag = v;
    }
    if let Some(v) = fields.ip {
        nic.ip = v;
    }
    if fields.netmask.is_some() {
        nic.netmask = fields.netmask;
    }
    if fields.gateway.is_some() {
        nic.gateway = fields.gateway;
    }
    if fields.vlan_id.is_some() {
        nic.vlan_id = fields.vlan_id;
    }
    if fields.primary.is_some() {
        nic.primary = fields.primary;
    }
    if fields.allow_unfiltered_promisc.is_some() {
        nic.allow_unfiltered_promisc = fields.allow_unfiltered_promisc;
    }
    if fields.model.is_some() {
        nic.model = fields.model;
    }
}

fn clear_primary(nics: &mut [Nic]) {
    for nic in nics.iter_mut().filter(|n| n.primary.is_some()) {
        nic.primary = None;
    }
}

/// Picks a random address under [`GENERATED_MAC_PREFIX`] not used by `nics`.
pub fn generate_mac<R: Rng + ?Sized>(nics: &[Nic], rng: &mut R) -> MacAddr {
    let [a, b, c] = GENERATED_MAC_PREFIX;
    loop {
        let tail: [u8; 3] = rng.gen();
        let mac = MacAddr::new([a, b, c, tail[0], tail[1], tail[2]]);
        if !nics.iter().any(|n| n.mac == mac) {
            return mac;
        }
    }
}

/// The lowest `netN` name not used by `nics`.
pub fn next_interface(nics: &[Nic]) -> String {
    let used: BTreeSet<&str> = nics.iter().map(|n| n.interface.as_str()).collect();
    (0..)
        .map(|n| format!("net{n}"))
        .find(|name| !used.contains(name.as_str()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::nic;
    use crate::validate::{NicAdd, NicPatch};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use vmadm_api_types::NicIp;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x90b8d0)
    }

    fn add(mac: Option<&str>, ip: &str, primary: Option<bool>) -> NicAdd {
        NicAdd {
            mac: mac.map(|m| m.parse().unwrap()),
            fields: NicFields {
                nic_tag: Some("external".to_string()),
                ip: Some(ip.parse().unwrap()),
                netmask: ip.parse::<NicIp>().unwrap().is_static().then(|| {
                    "255.255.255.0".parse().unwrap()
                }),
                primary,
                ..Default::default()
            },
        }
    }

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    fn primaries(nics: &[Nic]) -> Vec<String> {
        nics.iter()
            .filter(|n| n.is_primary())
            .map(|n| n.mac.to_string())
            .collect()
    }

    #[test]
    fn add_generates_mac_and_interface() {
        let current = vec![nic("01:02:03:04:05:06", "net0", "10.1.1.2")];
        let ops = NicOps { add: vec![add(None, "dhcp", None)], ..Default::default() };
        let out = reconcile(&current, &ops, Brand::Joyent, &mut rng()).unwrap();

        assert_eq!(out.nics.len(), 2);
        let added = &out.nics[1];
        assert_eq!(added.interface, "net1");
        assert_eq!(&added.mac.octets()[..3], &GENERATED_MAC_PREFIX);
        assert_eq!(added.primary, None);
    }

    #[test]
    fn interface_names_fill_gaps() {
        let current = vec![
            nic("01:02:03:04:05:06", "net0", "10.1.1.2"),
            nic("01:02:03:04:05:07", "net2", "10.1.1.3"),
        ];
        assert_eq!(next_interface(&current), "net1");
        assert_eq!(next_interface(&[]), "net0");
    }

    #[test]
    fn last_primary_add_wins() {
        let mut current = vec![nic("01:02:03:04:05:06", "net0", "10.1.1.2")];
        current[0].primary = Some(true);
        let ops = NicOps {
            add: vec![
                add(Some("01:02:03:04:05:07"), "10.1.1.3", Some(true)),
                add(Some("01:02:03:04:05:08"), "10.1.1.4", Some(true)),
            ],
            ..Default::default()
        };
        let out = reconcile(&current, &ops, Brand::Joyent, &mut rng()).unwrap();
        assert_eq!(primaries(&out.nics), ["01:02:03:04:05:08"]);
    }

    #[test]
    fn update_merges_only_present_fields() {
        let current = vec![nic("01:02:03:04:05:06", "net0", "10.1.1.2")];
        let ops = NicOps {
            update: vec![NicPatch {
                mac: mac("01:02:03:04:05:06"),
                fields: NicFields { vlan_id: Some(100), ..Default::default() },
            }],
            ..Default::default()
        };
        let out = reconcile(&current, &ops, Brand::Joyent, &mut rng()).unwrap();
        assert_eq!(out.nics[0].vlan_id, Some(100));
        assert_eq!(out.nics[0].ip, current[0].ip);
        assert_eq!(out.nics[0].netmask, current[0].netmask);
    }

    #[test]
    fn update_of_missing_nic_fails() {
        let ops = NicOps {
            update: vec![NicPatch {
                mac: mac("01:02:03:04:05:06"),
                fields: NicFields::default(),
            }],
            ..Default::default()
        };
        let err = reconcile(&[], &ops, Brand::Joyent, &mut rng()).unwrap_err();
        assert!(matches!(err, Error::NotFound { what: "NIC", .. }));
    }

    #[test]
    fn removal_is_tolerant() {
        let current = vec![nic("01:02:03:04:05:06", "net0", "10.1.1.2")];
        let ops = NicOps {
            remove: vec![mac("01:02:03:04:05:06"), mac("0a:0b:0c:0d:0e:0f")],
            ..Default::default()
        };
        let out = reconcile(&current, &ops, Brand::Joyent, &mut rng()).unwrap();
        assert!(out.nics.is_empty());
        assert_eq!(out.unmatched_removals, [mac("0a:0b:0c:0d:0e:0f")]);
    }

    #[test]
    fn removing_primary_elects_public_nic() {
        let mut current = vec![
            nic("01:02:03:04:05:06", "net0", "10.1.1.2"),
            nic("01:02:03:04:05:07", "net1", "10.1.1.3"),
            nic("01:02:03:04:05:08", "net2", "169.254.169.254"),
        ];
        current[0].primary = Some(true);
        let ops = NicOps {
            remove: vec![mac("01:02:03:04:05:06")],
            ..Default::default()
        };
        let out = reconcile(&current, &ops, Brand::Joyent, &mut rng()).unwrap();
        assert_eq!(primaries(&out.nics), ["01:02:03:04:05:08"]);
    }

    #[test]
    fn removing_primary_falls_back_to_first_nic() {
        let mut current = vec![
            nic("01:02:03:04:05:06", "net0", "10.1.1.2"),
            nic("01:02:03:04:05:07", "net1", "10.1.1.3"),
        ];
        current[0].primary = Some(true);
        let ops = NicOps {
            remove: vec![mac("01:02:03:04:05:06")],
            ..Default::default()
        };
        let out = reconcile(&current, &ops, Brand::Joyent, &mut rng()).unwrap();
        assert_eq!(primaries(&out.nics), ["01:02:03:04:05:07"]);
    }

    #[test]
    fn brand_restricted_fields_dropped() {
        let mut a = add(None, "dhcp", None);
        a.fields.allow_unfiltered_promisc = Some(true);
        a.fields.model = Some("virtio".to_string());
        let ops = NicOps { add: vec![a], ..Default::default() };

        let out = reconcile(&[], &ops, Brand::JoyentMinimal, &mut rng()).unwrap();
        assert_eq!(out.nics[0].allow_unfiltered_promisc, None);
        assert_eq!(out.nics[0].model, None);
        assert_eq!(
            out.dropped,
            ["add_nics[0].allow_unfiltered_promisc", "add_nics[0].model"]
        );

        let out = reconcile(&[], &ops, Brand::Kvm, &mut rng()).unwrap();
        assert_eq!(out.nics[0].allow_unfiltered_promisc, Some(true));
        assert!(out.dropped.is_empty());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Add { primary: bool, public: bool },
        Remove(usize),
        MakePrimary(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<bool>(), any::<bool>())
                .prop_map(|(primary, public)| Op::Add { primary, public }),
            (0usize..8).prop_map(Op::Remove),
            (0usize..8).prop_map(Op::MakePrimary),
        ]
    }

    proptest! {
        #[test]
        fn macs_unique_and_single_primary(
            ops in proptest::collection::vec(op_strategy(), 1..24),
            seed in any::<u64>(),
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut nics: Vec<Nic> = Vec::new();
            for op in ops {
                let ops = match op {
                    Op::Add { primary, public } => {
                        let ip = if public { "8.8.8.8" } else { "10.0.0.8" };
                        NicOps {
                            add: vec![add(None, ip, primary.then_some(true))],
                            ..Default::default()
                        }
                    }
                    Op::Remove(i) => match nics.get(i) {
                        Some(n) => NicOps { remove: vec![n.mac], ..Default::default() },
                        None => continue,
                    },
                    Op::MakePrimary(i) => match nics.get(i) {
                        Some(n) => NicOps {
                            update: vec![NicPatch {
                                mac: n.mac,
                                fields: NicFields {
                                    primary: Some(true),
                                    ..Default::default()
                                },
                            }],
                            ..Default::default()
                        },
                        None => continue,
                    },
                };
                nics = reconcile(&nics, &ops, Brand::Joyent, &mut rng)
                    .unwrap()
                    .nics;

                let macs: BTreeSet<_> = nics.iter().map(|n| n.mac).collect();
                prop_assert_eq!(macs.len(), nics.len());
                let names: BTreeSet<_> =
                    nics.iter().map(|n| n.interface.clone()).collect();
                prop_assert_eq!(names.len(), nics.len());
                prop_assert!(nics.iter().filter(|n| n.is_primary()).count() <= 1);
            }
        }
    }
}
