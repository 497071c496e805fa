// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use chrono::Utc;
use uuid::Uuid;
use vmadm_api_types::{BrandSpec, Nic, NicIp, VmRecord, VmState};

pub(crate) fn logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// A stopped `joyent-minimal` VM with 256 MiB of memory and no NICs.
pub(crate) fn minimal_zone() -> VmRecord {
    VmRecord {
        uuid: Uuid::new_v4(),
        brand: BrandSpec::JoyentMinimal,
        state: VmState::Stopped,
        transition: None,
        autoboot: false,
        ram: 256,
        max_physical_memory: 256,
        max_locked_memory: 256,
        max_swap: 256,
        tmpfs: 256,
        quota: 0,
        nics: Vec::new(),
        resolvers: Vec::new(),
        customer_metadata: BTreeMap::new(),
        properties: BTreeMap::new(),
        last_modified: Utc::now(),
        zoneid: None,
    }
}

pub(crate) fn nic(mac: &str, interface: &str, ip: &str) -> Nic {
    let ip: NicIp = ip.parse().unwrap();
    Nic {
        interface: interface.to_string(),
        mac: mac.parse().unwrap(),
        nic_tag: "external".to_string(),
        netmask: ip.is_static().then(|| "255.255.255.0".parse().unwrap()),
        ip,
        gateway: None,
        vlan_id: None,
        primary: None,
        allow_unfiltered_promisc: None,
        model: None,
    }
}
