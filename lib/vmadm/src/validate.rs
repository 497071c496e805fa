// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validation of partial update requests.
//!
//! Requests arrive as loosely-typed JSON: numbers may be passed as strings,
//! callers may include keys that cannot be changed, and NIC operations refer
//! to NICs by MAC address. [`validate`] turns such a request into a
//! [`ValidatedUpdate`] in which every value has been parsed and checked
//! against the current record, or fails on the first bad field. Keys are
//! examined in lexical order so the reported failure is deterministic.
//!
//! Validation has no side effects. Deciding what to do about findings that
//! are not outright errors (fields the brand does not accept, removals of
//! NICs that do not exist) is left to the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde_derive::Serialize;
use serde_json::{Map, Value};
use vmadm_api_types::{
    Brand, MacAddr, NicIp, ScalarValue, UpdateRequest, VmRecord,
};
use vmadm_config::Policy;

use crate::brand::BrandField;
use crate::error::Error;
use crate::sizing::ResourceChange;

/// Keys that identify a VM or describe its runtime state. Requests may carry
/// them (a record read back and resubmitted does), but they are never applied.
pub const IMMUTABLE_FIELDS: &[&str] = &[
    "uuid",
    "brand",
    "state",
    "zoneid",
    "last_modified",
    "transition",
    "v",
    "zonepath",
    "zonename",
    "disks",
];

/// Largest valid 802.1Q VLAN identifier.
pub const MAX_VLAN_ID: u64 = 4094;

/// A part of a request that was accepted but not applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IgnoredField {
    /// The key names a field that cannot be changed, or carries a value that
    /// is not a scalar.
    NotUpdatable { field: String },
    /// The field does not apply to the VM's brand.
    BrandRestricted { field: String, brand: Brand },
    /// A NIC named for removal does not exist.
    UnmatchedRemoval { mac: MacAddr },
}

/// Parsed NIC settings. Absent fields are left as they are on update and
/// left unset on add.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NicFields {
    pub interface: Option<String>,
    pub nic_tag: Option<String>,
    pub ip: Option<NicIp>,
    pub netmask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub vlan_id: Option<u16>,
    pub primary: Option<bool>,
    pub allow_unfiltered_promisc: Option<bool>,
    pub model: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NicAdd {
    /// Generated when absent.
    pub mac: Option<MacAddr>,
    pub fields: NicFields,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NicPatch {
    pub mac: MacAddr,
    pub fields: NicFields,
}

/// NIC operations, applied in the order removals, updates, additions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NicOps {
    pub remove: Vec<MacAddr>,
    pub update: Vec<NicPatch>,
    pub add: Vec<NicAdd>,
}

impl NicOps {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.update.is_empty() && self.add.is_empty()
    }
}

/// Changes to settings only hardware-virtualized brands carry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HvmChange {
    pub vcpus: Option<u32>,
    pub disk_driver: Option<String>,
    pub nic_driver: Option<String>,
}

/// A fully parsed and checked update request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidatedUpdate {
    pub resources: ResourceChange,
    pub nics: NicOps,
    pub autoboot: Option<bool>,
    pub resolvers: Option<Vec<Ipv4Addr>>,
    pub hvm: HvmChange,
    pub set_metadata: BTreeMap<String, String>,
    pub remove_metadata: Vec<String>,
    /// Scalar properties to set; `None` removes the property.
    pub properties: BTreeMap<String, Option<ScalarValue>>,
    pub ignored: Vec<IgnoredField>,
}

impl ValidatedUpdate {
    /// The first brand-restricted field in the request, if any.
    pub fn first_brand_mismatch(&self) -> Option<Error> {
        self.ignored.iter().find_map(|f| match f {
            IgnoredField::BrandRestricted { field, brand } => {
                Some(Error::BrandMismatch { field: field.clone(), brand: *brand })
            }
            _ => None,
        })
    }
}

/// Parses and checks `request` against `current`.
pub fn validate(
    current: &VmRecord,
    request: &UpdateRequest,
    policy: &Policy,
) -> Result<ValidatedUpdate, Error> {
    let brand = current.brand_kind();
    let mut out = ValidatedUpdate::default();

    for (key, value) in sorted(&request.0) {
        let key = key.as_str();
        if IMMUTABLE_FIELDS.contains(&key) {
            out.ignored.push(IgnoredField::NotUpdatable { field: key.into() });
            continue;
        }
        match key {
            "ram" => out.resources.ram = Some(parse_u64(key, value)?),
            "max_physical_memory" => {
                out.resources.max_physical_memory =
                    Some(parse_u64(key, value)?)
            }
            "max_locked_memory" => {
                out.resources.max_locked_memory = Some(parse_u64(key, value)?)
            }
            "max_swap" => out.resources.max_swap = Some(parse_u64(key, value)?),
            "tmpfs" => out.resources.tmpfs = Some(parse_u64(key, value)?),
            "quota" => out.resources.quota = Some(parse_u64(key, value)?),
            "autoboot" => out.autoboot = Some(parse_bool(key, value)?),
            "resolvers" => out.resolvers = Some(parse_resolvers(value)?),
            "set_customer_metadata" => {
                out.set_metadata = parse_metadata(key, value)?;
            }
            "remove_customer_metadata" => {
                out.remove_metadata = parse_string_list(key, value)?;
            }
            "vcpus" | "disk_driver" | "nic_driver" => {
                let field = BrandField::from_str(key).map_err(|_| {
                    Error::invalid(key, "unrecognized brand field")
                })?;
                if !field.allowed_for(brand) {
                    out.ignored.push(IgnoredField::BrandRestricted {
                        field: key.into(),
                        brand,
                    });
                    continue;
                }
                match field {
                    BrandField::Vcpus => {
                        let vcpus = parse_u64(key, value)?;
                        if vcpus == 0 {
                            return Err(Error::invalid(
                                key,
                                "must be greater than zero",
                            ));
                        }
                        out.hvm.vcpus = Some(u32::try_from(vcpus).map_err(
                            |_| Error::invalid(key, "out of range"),
                        )?);
                    }
                    BrandField::DiskDriver => {
                        out.hvm.disk_driver = Some(parse_string(key, value)?)
                    }
                    _ => out.hvm.nic_driver = Some(parse_string(key, value)?),
                }
            }
            "add_nics" => {
                for (i, obj) in nic_objects(key, value)?.iter().enumerate() {
                    let prefix = format!("add_nics[{i}]");
                    let (mac, fields) = parse_nic_fields(
                        &prefix,
                        obj,
                        brand,
                        policy,
                        &mut out.ignored,
                    )?;
                    out.nics.add.push(NicAdd { mac, fields });
                }
            }
            "update_nics" => {
                for (i, obj) in nic_objects(key, value)?.iter().enumerate() {
                    let prefix = format!("update_nics[{i}]");
                    let (mac, fields) = parse_nic_fields(
                        &prefix,
                        obj,
                        brand,
                        policy,
                        &mut out.ignored,
                    )?;
                    let mac = mac.ok_or_else(|| {
                        Error::invalid(format!("{prefix}.mac"), "is required")
                    })?;
                    out.nics.update.push(NicPatch { mac, fields });
                }
            }
            "remove_nics" => {
                for (i, mac) in
                    parse_string_list(key, value)?.iter().enumerate()
                {
                    let mac = MacAddr::from_str(mac).map_err(|e| {
                        Error::invalid(format!("remove_nics[{i}]"), e.to_string())
                    })?;
                    if !out.nics.remove.contains(&mac) {
                        out.nics.remove.push(mac);
                    }
                }
            }
            _ => match value {
                Value::Null => {
                    out.properties.insert(key.into(), None);
                }
                other => match ScalarValue::from_json(other) {
                    Some(v) => {
                        out.properties.insert(key.into(), Some(v));
                    }
                    None => out
                        .ignored
                        .push(IgnoredField::NotUpdatable { field: key.into() }),
                },
            },
        }
    }

    check_nic_ops(current, &mut out, policy)?;
    Ok(out)
}

/// Cross-checks NIC operations against the NICs the VM already has.
fn check_nic_ops(
    current: &VmRecord,
    out: &mut ValidatedUpdate,
    policy: &Policy,
) -> Result<(), Error> {
    let existing: BTreeSet<MacAddr> =
        current.nics.iter().map(|n| n.mac).collect();

    let mut remove = Vec::with_capacity(out.nics.remove.len());
    for mac in out.nics.remove.drain(..) {
        if existing.contains(&mac) {
            remove.push(mac);
        } else if policy.strict_nic_removal {
            return Err(Error::NotFound { what: "NIC", id: mac.to_string() });
        } else {
            out.ignored.push(IgnoredField::UnmatchedRemoval { mac });
        }
    }
    out.nics.remove = remove;

    let mut interfaces: BTreeSet<String> = current
        .nics
        .iter()
        .filter(|n| !out.nics.remove.contains(&n.mac))
        .map(|n| n.interface.clone())
        .collect();

    for (i, patch) in out.nics.update.iter().enumerate() {
        let prefix = format!("update_nics[{i}]");
        let nic = current.nic(&patch.mac).ok_or_else(|| Error::NotFound {
            what: "NIC",
            id: patch.mac.to_string(),
        })?;
        if out.nics.remove.contains(&patch.mac) {
            return Err(Error::invalid(
                format!("{prefix}.mac"),
                "NIC is also being removed",
            ));
        }
        let ip = patch.fields.ip.as_ref().unwrap_or(&nic.ip);
        if ip.is_static()
            && patch.fields.netmask.or(nic.netmask).is_none()
        {
            return Err(Error::invalid(
                format!("{prefix}.netmask"),
                "is required for a static address",
            ));
        }
        if let Some(name) = &patch.fields.interface {
            if *name != nic.interface {
                if !interfaces.insert(name.clone()) {
                    return Err(Error::invalid(
                        format!("{prefix}.interface"),
                        format!("{name} is already in use"),
                    ));
                }
                interfaces.remove(&nic.interface);
            }
        }
    }

    let mut macs: BTreeSet<MacAddr> = existing
        .iter()
        .filter(|m| !out.nics.remove.contains(m))
        .copied()
        .collect();

    for (i, add) in out.nics.add.iter().enumerate() {
        let prefix = format!("add_nics[{i}]");
        if add.fields.nic_tag.is_none() {
            return Err(Error::invalid(format!("{prefix}.nic_tag"), "is required"));
        }
        let Some(ip) = &add.fields.ip else {
            return Err(Error::invalid(format!("{prefix}.ip"), "is required"));
        };
        if ip.is_static() && add.fields.netmask.is_none() {
            return Err(Error::invalid(
                format!("{prefix}.netmask"),
                "is required for a static address",
            ));
        }
        if let Some(mac) = add.mac {
            if !macs.insert(mac) {
                return Err(Error::invalid(
                    format!("{prefix}.mac"),
                    format!("{mac} is already in use"),
                ));
            }
        }
        if let Some(name) = &add.fields.interface {
            if !interfaces.insert(name.clone()) {
                return Err(Error::invalid(
                    format!("{prefix}.interface"),
                    format!("{name} is already in use"),
                ));
            }
        }
    }

    Ok(())
}

fn parse_nic_fields(
    prefix: &str,
    obj: &Map<String, Value>,
    brand: Brand,
    policy: &Policy,
    ignored: &mut Vec<IgnoredField>,
) -> Result<(Option<MacAddr>, NicFields), Error> {
    let mut mac = None;
    let mut fields = NicFields::default();

    for (key, value) in sorted(obj) {
        if value.is_null() {
            continue;
        }
        let name = format!("{prefix}.{key}");
        match key.as_str() {
            "mac" => {
                let s = parse_string(&name, value)?;
                mac = Some(
                    MacAddr::from_str(&s)
                        .map_err(|e| Error::invalid(&name, e.to_string()))?,
                );
            }
            "interface" => fields.interface = Some(parse_string(&name, value)?),
            "nic_tag" => {
                let tag = parse_string(&name, value)?;
                if tag.is_empty() {
                    return Err(Error::invalid(name, "must not be empty"));
                }
                fields.nic_tag = Some(tag);
            }
            "ip" => {
                let s = parse_string(&name, value)?;
                let ip = NicIp::from_str(&s)
                    .map_err(|e| Error::invalid(&name, e.to_string()))?;
                if matches!(ip, NicIp::List(_)) && !policy.allow_ip_lists {
                    return Err(Error::invalid(
                        name,
                        "address lists are not permitted",
                    ));
                }
                fields.ip = Some(ip);
            }
            "netmask" => fields.netmask = Some(parse_ipv4(&name, value)?),
            "gateway" => fields.gateway = Some(parse_ipv4(&name, value)?),
            "vlan_id" => {
                let id = parse_u64(&name, value)?;
                if id > MAX_VLAN_ID {
                    return Err(Error::invalid(
                        name,
                        format!("{id} exceeds {MAX_VLAN_ID}"),
                    ));
                }
                fields.vlan_id = Some(id as u16);
            }
            "primary" => fields.primary = Some(parse_bool(&name, value)?),
            "allow_unfiltered_promisc" | "model" => {
                if let Ok(field) = BrandField::from_str(key) {
                    if !field.allowed_for(brand) {
                        ignored.push(IgnoredField::BrandRestricted {
                            field: name.clone(),
                            brand,
                        });
                    }
                }
                if key == "model" {
                    fields.model = Some(parse_string(&name, value)?);
                } else {
                    fields.allow_unfiltered_promisc =
                        Some(parse_bool(&name, value)?);
                }
            }
            _ => ignored.push(IgnoredField::NotUpdatable { field: name }),
        }
    }

    Ok((mac, fields))
}

fn sorted(map: &Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn nic_objects<'a>(
    field: &str,
    value: &'a Value,
) -> Result<Vec<&'a Map<String, Value>>, Error> {
    let Value::Array(items) = value else {
        return Err(Error::invalid(field, "expected an array of objects"));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_object().ok_or_else(|| {
                Error::invalid(format!("{field}[{i}]"), "expected an object")
            })
        })
        .collect()
}

/// Parses a non-negative integer given either as a JSON number or as a
/// string of decimal digits.
fn parse_u64(field: &str, value: &Value) -> Result<u64, Error> {
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| {
            Error::invalid(field, format!("{n} is not a non-negative integer"))
        }),
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| {
            Error::invalid(field, format!("{s:?} is not a non-negative integer"))
        }),
        Value::Null => Err(Error::invalid(field, "cannot be unset")),
        other => Err(Error::invalid(field, format!("{other} is not a number"))),
    }
}

fn parse_bool(field: &str, value: &Value) -> Result<bool, Error> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s == "true" => Ok(true),
        Value::String(s) if s == "false" => Ok(false),
        other => Err(Error::invalid(field, format!("{other} is not a boolean"))),
    }
}

fn parse_string(field: &str, value: &Value) -> Result<String, Error> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(Error::invalid(field, format!("{other} is not a string"))),
    }
}

fn parse_ipv4(field: &str, value: &Value) -> Result<Ipv4Addr, Error> {
    let s = parse_string(field, value)?;
    Ipv4Addr::from_str(&s)
        .map_err(|_| Error::invalid(field, format!("{s:?} is not an IPv4 address")))
}

fn parse_string_list(field: &str, value: &Value) -> Result<Vec<String>, Error> {
    let Value::Array(items) = value else {
        return Err(Error::invalid(field, "expected an array of strings"));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_string(&format!("{field}[{i}]"), item))
        .collect()
}

fn parse_resolvers(value: &Value) -> Result<Vec<Ipv4Addr>, Error> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let Value::Array(items) = value else {
        return Err(Error::invalid("resolvers", "expected an array of addresses"));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_ipv4(&format!("resolvers[{i}]"), item))
        .collect()
}

fn parse_metadata(
    field: &str,
    value: &Value,
) -> Result<BTreeMap<String, String>, Error> {
    let Value::Object(map) = value else {
        return Err(Error::invalid(field, "expected an object"));
    };
    map.iter()
        .map(|(k, v)| {
            parse_string(&format!("{field}.{k}"), v).map(|s| (k.clone(), s))
        })
        .collect()
}
