// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::nic::{MacAddr, Nic};

/// Record fields that are expected to differ after a VM has been sent and
/// received, and so never take part in equivalence checks.
pub const VOLATILE_FIELDS: &[&str] = &["last_modified", "zoneid"];

/// The kind of virtualization backing a VM.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Brand {
    /// A full OS container.
    Joyent,
    /// An OS container with a minimal service set.
    JoyentMinimal,
    /// A hardware-virtualized guest.
    Kvm,
}

impl Brand {
    /// True for brands that run a guest kernel on virtual hardware.
    pub fn is_hvm(self) -> bool {
        matches!(self, Brand::Kvm)
    }
}

/// A virtual disk attached to a hardware-virtualized VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Disk {
    /// The device path of the backing volume.
    pub path: String,

    /// Size in MiB.
    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Settings that only exist for hardware-virtualized VMs.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct KvmSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_driver: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic_driver: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,
}

/// The brand of a VM together with the settings only that brand accepts.
///
/// Flattened into [`VmRecord`] so the serialized record carries a `brand`
/// tag next to the brand-specific fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "brand", rename_all = "kebab-case")]
pub enum BrandSpec {
    Joyent,
    JoyentMinimal,
    Kvm(KvmSpec),
}

impl BrandSpec {
    pub fn kind(&self) -> Brand {
        match self {
            BrandSpec::Joyent => Brand::Joyent,
            BrandSpec::JoyentMinimal => Brand::JoyentMinimal,
            BrandSpec::Kvm(_) => Brand::Kvm,
        }
    }
}

/// Lifecycle state of a VM as reported by the host.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VmState {
    Configured,
    Provisioning,
    Installed,
    Ready,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Receiving,
    Failed,
}

impl VmState {
    /// Running and stopped are the only states a VM rests in; everything
    /// else is on its way somewhere.
    pub fn is_settled(self) -> bool {
        matches!(self, VmState::Running | VmState::Stopped)
    }
}

/// Marks a state change the host has begun but not finished.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Transition {
    /// The state the VM is moving to.
    pub to: VmState,
}

/// A scalar property value. Properties hold strings, numbers, or booleans.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl ScalarValue {
    /// Converts a JSON value to a scalar, returning `None` for arrays,
    /// objects, and null.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(ScalarValue::Bool(*b)),
            Value::Number(n) => Some(ScalarValue::Number(n.clone())),
            Value::String(s) => Some(ScalarValue::String(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(b) => b.fmt(f),
            ScalarValue::Number(n) => n.fmt(f),
            ScalarValue::String(s) => s.fmt(f),
        }
    }
}

/// The authoritative specification and state of one VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VmRecord {
    pub uuid: Uuid,

    #[serde(flatten)]
    pub brand: BrandSpec,

    pub state: VmState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<Transition>,

    pub autoboot: bool,

    /// Memory sizes, all in MiB.
    pub ram: u64,
    pub max_physical_memory: u64,
    pub max_locked_memory: u64,
    pub max_swap: u64,
    pub tmpfs: u64,

    /// Storage cap in GiB; zero means no quota.
    pub quota: u64,

    #[serde(default)]
    pub nics: Vec<Nic>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolvers: Vec<Ipv4Addr>,

    #[serde(default)]
    pub customer_metadata: BTreeMap<String, String>,

    /// Free-form scalar properties (alias, hostname, owner_uuid, ...).
    #[serde(default)]
    pub properties: BTreeMap<String, ScalarValue>,

    pub last_modified: DateTime<Utc>,

    /// Runtime identifier assigned by the host while the VM is booted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoneid: Option<i32>,
}

impl VmRecord {
    pub fn brand_kind(&self) -> Brand {
        self.brand.kind()
    }

    pub fn nic(&self, mac: &MacAddr) -> Option<&Nic> {
        self.nics.iter().find(|n| &n.mac == mac)
    }

    /// The NIC used for default routing: the one marked primary, or the
    /// first NIC if none is marked.
    pub fn routing_primary(&self) -> Option<&Nic> {
        self.nics
            .iter()
            .find(|n| n.is_primary())
            .or_else(|| self.nics.first())
    }

    /// True once the VM rests in a settled state with no transition pending.
    pub fn is_settled(&self) -> bool {
        self.transition.is_none() && self.state.is_settled()
    }
}

/// A partial update: a mapping from field name to the requested new value.
///
/// Values are kept as raw JSON so that heterogeneous input (numbers passed as
/// strings, unknown keys) reaches the validator intact. A JSON `null` unsets
/// a scalar property.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct UpdateRequest(pub Map<String, Value>);

impl UpdateRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a request from a JSON object; any other JSON value yields
    /// `None`.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Requests removal of a scalar property.
    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.0.insert(key.into(), Value::Null);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A request to create a new VM.
///
/// Everything beyond the identity, brand, and base sizing is expressed in the
/// same vocabulary as an update: `nics` entries are added as if passed in
/// `add_nics`, `customer_metadata` is set as if passed in
/// `set_customer_metadata`, hardware-virtualized settings (`vcpus`, `disks`,
/// drivers) are picked out for the `kvm` brand, and remaining keys become
/// properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CreateRequest {
    #[serde(default)]
    pub uuid: Option<Uuid>,

    pub brand: Brand,

    #[serde(default = "default_autoboot")]
    pub autoboot: bool,

    pub ram: u64,

    #[serde(default)]
    pub quota: u64,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

fn default_autoboot() -> bool {
    true
}
