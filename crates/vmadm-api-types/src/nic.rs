// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::{self, Display};
use std::net::Ipv4Addr;
use std::str::FromStr;

use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The literal a NIC's `ip` carries when its address is assigned by DHCP.
const DHCP_SENTINEL: &str = "dhcp";

/// Errors produced while parsing the string forms of NIC fields.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseNicFieldError {
    #[error("invalid MAC address {0:?}")]
    Mac(String),

    #[error("invalid IPv4 address {0:?}")]
    Ip(String),
}

/// A 48-bit Ethernet address. Supports conversion from a string formatted as
/// six colon-separated hex octets, e.g. "90:b8:d0:1c:2e:3f".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    #[inline]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = ParseNicFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut fields = s.split(':');
        for octet in octets.iter_mut() {
            let field = fields
                .next()
                .filter(|f| !f.is_empty() && f.len() <= 2)
                .ok_or_else(|| ParseNicFieldError::Mac(s.to_string()))?;
            *octet = u8::from_str_radix(field, 16)
                .map_err(|_| ParseNicFieldError::Mac(s.to_string()))?;
        }
        if fields.next().is_some() {
            return Err(ParseNicFieldError::Mac(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'d> Deserialize<'d> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

impl JsonSchema for MacAddr {
    fn schema_name() -> String {
        "MacAddr".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

/// The address configuration of a NIC.
///
/// The string form is either a dotted quad, a comma-separated list of dotted
/// quads, or the literal `dhcp`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum NicIp {
    Dhcp,
    Static(Ipv4Addr),
    List(Vec<Ipv4Addr>),
}

impl NicIp {
    /// Returns every statically-assigned address.
    pub fn addrs(&self) -> &[Ipv4Addr] {
        match self {
            NicIp::Dhcp => &[],
            NicIp::Static(addr) => std::slice::from_ref(addr),
            NicIp::List(addrs) => addrs,
        }
    }

    pub fn is_static(&self) -> bool {
        !matches!(self, NicIp::Dhcp)
    }

    /// True if any statically-assigned address lies outside the RFC 1918
    /// private ranges.
    pub fn has_public_addr(&self) -> bool {
        self.addrs().iter().any(|addr| !addr.is_private())
    }
}

impl FromStr for NicIp {
    type Err = ParseNicFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == DHCP_SENTINEL {
            return Ok(NicIp::Dhcp);
        }

        let parse = |a: &str| {
            Ipv4Addr::from_str(a)
                .map_err(|_| ParseNicFieldError::Ip(a.to_string()))
        };

        if s.contains(',') {
            let addrs =
                s.split(',').map(parse).collect::<Result<Vec<_>, _>>()?;
            Ok(NicIp::List(addrs))
        } else {
            Ok(NicIp::Static(parse(s)?))
        }
    }
}

impl Display for NicIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NicIp::Dhcp => f.write_str(DHCP_SENTINEL),
            NicIp::Static(addr) => addr.fmt(f),
            NicIp::List(addrs) => {
                for (i, addr) in addrs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    addr.fmt(f)?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for NicIp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'d> Deserialize<'d> for NicIp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

impl JsonSchema for NicIp {
    fn schema_name() -> String {
        "NicIp".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

/// One virtual network interface attached to a VM.
///
/// Optional fields that were never supplied stay absent from the serialized
/// form, so a NIC added with only a MAC, address, and tag serializes as
/// exactly those fields plus its interface name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Nic {
    pub interface: String,
    pub mac: MacAddr,
    pub nic_tag: String,
    pub ip: NicIp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<bool>,

    /// Hardware-virtualized brands only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unfiltered_promisc: Option<bool>,

    /// Emulated device model; hardware-virtualized brands only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Nic {
    pub fn is_primary(&self) -> bool {
        self.primary == Some(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_test::{assert_tokens, Token};

    const MAC_CASES: &[(&str, Result<[u8; 6], ()>)] = &[
        ("01:02:03:04:05:06", Ok([1, 2, 3, 4, 5, 6])),
        ("90:b8:d0:ff:0a:1b", Ok([0x90, 0xb8, 0xd0, 0xff, 0x0a, 0x1b])),
        ("01:02:03:04:05", Err(())),
        ("01:02:03:04:05:06:07", Err(())),
        ("01:02:03:04:05:zz", Err(())),
        ("001:02:03:04:05:06", Err(())),
        ("01::03:04:05:06", Err(())),
        ("", Err(())),
    ];

    #[test]
    fn mac_from_str() {
        for (input, expected) in MAC_CASES {
            match MacAddr::from_str(input) {
                Ok(mac) => assert_eq!(mac.octets(), expected.unwrap()),
                Err(_) => assert!(
                    expected.is_err(),
                    "Expected error parsing MAC {}",
                    input
                ),
            }
        }
    }

    #[test]
    fn mac_serialization() {
        let mac = MacAddr::new([2, 3, 4, 5, 6, 7]);
        assert_tokens(&mac, &[Token::Str("02:03:04:05:06:07")]);
    }

    #[test]
    fn nic_ip_forms() {
        assert_eq!(NicIp::from_str("dhcp").unwrap(), NicIp::Dhcp);
        assert_eq!(
            NicIp::from_str("10.254.254.254").unwrap(),
            NicIp::Static(Ipv4Addr::new(10, 254, 254, 254))
        );
        let list = NicIp::from_str("10.99.99.12,10.99.99.33").unwrap();
        assert_eq!(list.addrs().len(), 2);
        assert_eq!(list.to_string(), "10.99.99.12,10.99.99.33");

        assert!(NicIp::from_str("10.99.99").is_err());
        assert!(NicIp::from_str("10.99.99.1,").is_err());
        assert!(NicIp::from_str("DHCP").is_err());
    }

    #[test]
    fn public_addresses() {
        let private = NicIp::from_str("10.254.254.253").unwrap();
        let link_local = NicIp::from_str("169.254.169.254").unwrap();
        assert!(!private.has_public_addr());
        assert!(link_local.has_public_addr());
        assert!(!NicIp::Dhcp.has_public_addr());
    }

    #[test]
    fn minimal_nic_serializes_only_supplied_fields() {
        let nic = Nic {
            interface: "net0".to_string(),
            mac: "01:02:03:04:05:06".parse().unwrap(),
            nic_tag: "admin".to_string(),
            ip: NicIp::Dhcp,
            netmask: None,
            gateway: None,
            vlan_id: None,
            primary: None,
            allow_unfiltered_promisc: None,
            model: None,
        };
        let value = serde_json::to_value(&nic).unwrap();
        let keys: Vec<_> =
            value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 4);
        for key in ["interface", "mac", "nic_tag", "ip"] {
            assert!(keys.iter().any(|k| k == key), "missing {key}");
        }
    }
}
