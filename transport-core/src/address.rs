/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::InvalidFormatError;
use crate::util::buffer::Buffer;

/// Name of the datagram bearer plugin.
pub const PLUGIN_NAME_XU: &str = "xu";

/// Name of the 802.11 bearer plugin.
pub const PLUGIN_NAME_WLAN: &str = "wlan";

/// Wire size of an IPv4 datagram bearer address: options + ip + port.
pub const XU_ADDRESS_V4_SIZE: usize = 10;

/// Wire size of an IPv6 datagram bearer address: options + ip + port.
pub const XU_ADDRESS_V6_SIZE: usize = 22;

/// Wire size of an 802.11 bearer address (a MAC).
pub const WLAN_ADDRESS_SIZE: usize = 6;

/// Coarse classification of an address used by higher layers for path selection.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum NetworkScope {
    Unspecified,
    Loopback,
    Lan,
    Wan,
}

impl Display for NetworkScope {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            NetworkScope::Unspecified => "unspecified",
            NetworkScope::Loopback => "loopback",
            NetworkScope::Lan => "lan",
            NetworkScope::Wan => "wan",
        })
    }
}

/// Classify an IP the way path selection wants to see it.
pub fn scope_of_ip(ip: &IpAddr) -> NetworkScope {
    match ip {
        IpAddr::V4(ip4) => {
            if ip4.is_unspecified() {
                NetworkScope::Unspecified
            } else if ip4.is_loopback() {
                NetworkScope::Loopback
            } else if ip4.is_private() || ip4.is_link_local() {
                NetworkScope::Lan
            } else {
                NetworkScope::Wan
            }
        }
        IpAddr::V6(ip6) => {
            if ip6.is_unspecified() {
                NetworkScope::Unspecified
            } else if ip6.is_loopback() {
                NetworkScope::Loopback
            } else if (ip6.segments()[0] & 0xffc0) == 0xfe80 || (ip6.segments()[0] & 0xfe00) == 0xfc00 {
                NetworkScope::Lan
            } else {
                NetworkScope::Wan
            }
        }
    }
}

/// Where knowledge of an address came from.
///
/// Advisory only: it never participates in equality or hashing, so the same
/// wire address learned two ways deduplicates to one entry in any map.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum OriginHint {
    #[default]
    None,
    Inbound,
    OutboundValidation,
}

/// A bearer address: the owning plugin's name tagged onto bearer-specific bytes.
///
/// This is the unit the overlay trades in; it never interprets the bytes
/// itself. Equality and hashing cover plugin name and bytes only.
#[derive(Clone)]
pub struct Address {
    plugin: String,
    bytes: Vec<u8>,
    origin: OriginHint,
}

impl Address {
    pub fn new(plugin: &str, bytes: Vec<u8>, origin: OriginHint) -> Self {
        Self { plugin: plugin.to_owned(), bytes, origin }
    }

    #[inline(always)]
    pub fn plugin(&self) -> &str {
        self.plugin.as_str()
    }

    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    #[inline(always)]
    pub fn origin(&self) -> OriginHint {
        self.origin
    }

    pub fn with_origin(mut self, origin: OriginHint) -> Self {
        self.origin = origin;
        self
    }

    /// Append this address to a wire buffer: name length, name, byte length, bytes.
    /// The origin hint is local knowledge and does not travel.
    pub fn marshal<const L: usize>(&self, buf: &mut Buffer<L>) -> std::io::Result<()> {
        if self.plugin.len() > u8::MAX as usize {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "plugin name too long"));
        }
        buf.append_u8(self.plugin.len() as u8)?;
        buf.append_bytes(self.plugin.as_bytes())?;
        buf.append_u16(self.bytes.len() as u16)?;
        buf.append_bytes(self.bytes.as_slice())
    }

    pub fn unmarshal<const L: usize>(buf: &Buffer<L>, cursor: &mut usize) -> std::io::Result<Address> {
        let name_len = buf.read_u8(cursor)? as usize;
        let name = String::from_utf8(buf.read_bytes(name_len, cursor)?.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "plugin name not utf8"))?;
        let byte_len = buf.read_u16(cursor)? as usize;
        let bytes = buf.read_bytes(byte_len, cursor)?.to_vec();
        Ok(Address { plugin: name, bytes, origin: OriginHint::None })
    }
}

impl PartialEq for Address {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.plugin == other.plugin && self.bytes == other.bytes
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.plugin.hash(state);
        self.bytes.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.plugin.as_str() {
            PLUGIN_NAME_XU => match XuAddress::from_bytes(self.bytes.as_slice()) {
                Some(xu) => f.write_fmt(format_args!("{}.{}", PLUGIN_NAME_XU, xu)),
                None => f.write_str("invalid"),
            },
            PLUGIN_NAME_WLAN => match WlanAddress::from_bytes(self.bytes.as_slice()) {
                Some(w) => f.write_fmt(format_args!("{}.0.{}", PLUGIN_NAME_WLAN, w.mac())),
                None => f.write_str("invalid"),
            },
            other => f.write_fmt(format_args!("{}.{}", other, crate::util::to_hex(self.bytes.as_slice()))),
        }
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = InvalidFormatError;

    /// Parse the canonical human-readable form `"<plugin>.<options>.<ip>:<port>"`
    /// (IPv6 in brackets) or `"wlan.<options>.<mac>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (plugin, rest) = s.trim().split_once('.').ok_or(InvalidFormatError)?;
        match plugin {
            PLUGIN_NAME_XU => {
                let xu = XuAddress::from_str(rest)?;
                Ok(Address::new(PLUGIN_NAME_XU, xu.to_bytes(), OriginHint::None))
            }
            PLUGIN_NAME_WLAN => {
                let (options, mac) = rest.split_once('.').ok_or(InvalidFormatError)?;
                let _ = u32::from_str(options).map_err(|_| InvalidFormatError)?;
                let mac = MacAddress::from_str(mac)?;
                Ok(Address::new(PLUGIN_NAME_WLAN, mac.to_bytes().to_vec(), OriginHint::None))
            }
            _ => Err(InvalidFormatError),
        }
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_string().as_str())
        } else {
            let mut tmp: Buffer<512> = Buffer::new();
            assert!(self.marshal(&mut tmp).is_ok());
            serializer.serialize_bytes(tmp.as_bytes())
        }
    }
}

struct AddressVisitor;

impl<'de> serde::de::Visitor<'de> for AddressVisitor {
    type Value = Address;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a bearer address")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        let tmp: Buffer<512> = Buffer::from_bytes(v).map_err(|e| E::custom(e.to_string()))?;
        let mut cursor = 0;
        Address::unmarshal(&tmp, &mut cursor).map_err(|e| E::custom(e.to_string()))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Address::from_str(v).map_err(|e| E::custom(e.to_string()))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(AddressVisitor)
        } else {
            deserializer.deserialize_bytes(AddressVisitor)
        }
    }
}

/// Parsed form of a datagram bearer address.
///
/// The options field is an opaque bit set carried end to end; zero means no
/// options. A port of zero is the "not mapped" sentinel and never keys a
/// session.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum XuAddress {
    V4 { options: u32, ip: Ipv4Addr, port: u16 },
    V6 { options: u32, ip: Ipv6Addr, port: u16 },
}

impl XuAddress {
    pub fn from_socket_addr(sa: &SocketAddr, options: u32) -> XuAddress {
        match sa {
            SocketAddr::V4(v4) => XuAddress::V4 { options, ip: *v4.ip(), port: v4.port() },
            SocketAddr::V6(v6) => XuAddress::V6 { options, ip: *v6.ip(), port: v6.port() },
        }
    }

    #[inline(always)]
    pub fn options(&self) -> u32 {
        match self {
            XuAddress::V4 { options, .. } | XuAddress::V6 { options, .. } => *options,
        }
    }

    #[inline(always)]
    pub fn port(&self) -> u16 {
        match self {
            XuAddress::V4 { port, .. } | XuAddress::V6 { port, .. } => *port,
        }
    }

    #[inline(always)]
    pub fn ip(&self) -> IpAddr {
        match self {
            XuAddress::V4 { ip, .. } => IpAddr::V4(*ip),
            XuAddress::V6 { ip, .. } => IpAddr::V6(*ip),
        }
    }

    #[inline(always)]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port())
    }

    #[inline(always)]
    pub fn scope(&self) -> NetworkScope {
        scope_of_ip(&self.ip())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            XuAddress::V4 { options, ip, port } => {
                let mut b: Buffer<XU_ADDRESS_V4_SIZE> = Buffer::new();
                let _ = b.append_u32(*options);
                let _ = b.append_bytes_fixed(&ip.octets());
                let _ = b.append_u16(*port);
                b.as_bytes().to_vec()
            }
            XuAddress::V6 { options, ip, port } => {
                let mut b: Buffer<XU_ADDRESS_V6_SIZE> = Buffer::new();
                let _ = b.append_u32(*options);
                let _ = b.append_bytes_fixed(&ip.octets());
                let _ = b.append_u16(*port);
                b.as_bytes().to_vec()
            }
        }
    }

    /// Decode from wire bytes; the length alone distinguishes IPv4 from IPv6.
    pub fn from_bytes(b: &[u8]) -> Option<XuAddress> {
        match b.len() {
            XU_ADDRESS_V4_SIZE => Some(XuAddress::V4 {
                options: u32::from_be_bytes(b[0..4].try_into().unwrap()),
                ip: Ipv4Addr::from(<[u8; 4]>::try_from(&b[4..8]).unwrap()),
                port: u16::from_be_bytes(b[8..10].try_into().unwrap()),
            }),
            XU_ADDRESS_V6_SIZE => Some(XuAddress::V6 {
                options: u32::from_be_bytes(b[0..4].try_into().unwrap()),
                ip: Ipv6Addr::from(<[u8; 16]>::try_from(&b[4..20]).unwrap()),
                port: u16::from_be_bytes(b[20..22].try_into().unwrap()),
            }),
            _ => None,
        }
    }

    pub fn to_address(&self, origin: OriginHint) -> Address {
        Address::new(PLUGIN_NAME_XU, self.to_bytes(), origin)
    }
}

impl Display for XuAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            XuAddress::V4 { options, ip, port } => f.write_fmt(format_args!("{}.{}:{}", options, ip, port)),
            XuAddress::V6 { options, ip, port } => f.write_fmt(format_args!("{}.[{}]:{}", options, ip, port)),
        }
    }
}

impl FromStr for XuAddress {
    type Err = InvalidFormatError;

    /// Parse `"<options>.<ip>:<port>"` with IPv6 wrapped in brackets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (options, rest) = s.split_once('.').ok_or(InvalidFormatError)?;
        let options = u32::from_str(options).map_err(|_| InvalidFormatError)?;
        if let Some(rest) = rest.strip_prefix('[') {
            let (ip, port) = rest.split_once("]:").ok_or(InvalidFormatError)?;
            let ip = Ipv6Addr::from_str(ip).map_err(|_| InvalidFormatError)?;
            let port = u16::from_str(port).map_err(|_| InvalidFormatError)?;
            Ok(XuAddress::V6 { options, ip, port })
        } else {
            let (ip, port) = rest.rsplit_once(':').ok_or(InvalidFormatError)?;
            let ip = Ipv4Addr::from_str(ip).map_err(|_| InvalidFormatError)?;
            let port = u16::from_str(port).map_err(|_| InvalidFormatError)?;
            Ok(XuAddress::V4 { options, ip, port })
        }
    }
}

/// An 802.11 MAC address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MacAddress(pub [u8; WLAN_ADDRESS_SIZE]);

impl MacAddress {
    #[inline(always)]
    pub fn to_bytes(&self) -> &[u8; WLAN_ADDRESS_SIZE] {
        &self.0
    }

    pub fn from_bytes(b: &[u8]) -> Option<MacAddress> {
        if b.len() == WLAN_ADDRESS_SIZE {
            Some(MacAddress(b.try_into().unwrap()))
        } else {
            None
        }
    }

    /// Group bit: set on multicast and broadcast destinations.
    #[inline(always)]
    pub fn is_multicast(&self) -> bool {
        (self.0[0] & 0x01) != 0
    }

    #[inline(always)]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; WLAN_ADDRESS_SIZE]
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        ))
    }
}

impl Debug for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for MacAddress {
    type Err = InvalidFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut b = [0u8; WLAN_ADDRESS_SIZE];
        let mut n = 0;
        for part in s.trim().split(':') {
            if n >= WLAN_ADDRESS_SIZE || part.len() != 2 {
                return Err(InvalidFormatError);
            }
            b[n] = u8::from_str_radix(part, 16).map_err(|_| InvalidFormatError)?;
            n += 1;
        }
        if n == WLAN_ADDRESS_SIZE {
            Ok(MacAddress(b))
        } else {
            Err(InvalidFormatError)
        }
    }
}

/// Parsed form of an 802.11 bearer address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct WlanAddress(MacAddress);

impl WlanAddress {
    pub fn new(mac: MacAddress) -> Self {
        Self(mac)
    }

    #[inline(always)]
    pub fn mac(&self) -> &MacAddress {
        &self.0
    }

    pub fn from_bytes(b: &[u8]) -> Option<WlanAddress> {
        MacAddress::from_bytes(b).map(WlanAddress)
    }

    pub fn to_address(&self, origin: OriginHint) -> Address {
        Address::new(PLUGIN_NAME_WLAN, self.0.to_bytes().to_vec(), origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xu_v4_string_round_trip() {
        let a = Address::from_str("xu.0.127.0.0.1:2086").unwrap();
        assert_eq!(a.plugin(), PLUGIN_NAME_XU);
        assert_eq!(a.bytes().len(), XU_ADDRESS_V4_SIZE);
        let xu = XuAddress::from_bytes(a.bytes()).unwrap();
        assert_eq!(xu.options(), 0);
        assert_eq!(xu.port(), 2086);
        assert_eq!(xu.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        // On-wire layout is big-endian options, ip octets, big-endian port.
        assert_eq!(a.bytes(), &[0, 0, 0, 0, 127, 0, 0, 1, 0x08, 0x26]);
        assert_eq!(a.to_string(), "xu.0.127.0.0.1:2086");
    }

    #[test]
    fn xu_v6_string_round_trip() {
        let s = "xu.7.[::1]:40000";
        let a = Address::from_str(s).unwrap();
        assert_eq!(a.bytes().len(), XU_ADDRESS_V6_SIZE);
        assert_eq!(a.to_string(), s);
        let xu = XuAddress::from_bytes(a.bytes()).unwrap();
        assert_eq!(xu.options(), 7);
        assert_eq!(xu.scope(), NetworkScope::Loopback);
    }

    #[test]
    fn wlan_string_round_trip() {
        let s = "wlan.0.02:1a:2b:3c:4d:5e";
        let a = Address::from_str(s).unwrap();
        assert_eq!(a.bytes().len(), WLAN_ADDRESS_SIZE);
        assert_eq!(a.to_string(), s);
    }

    #[test]
    fn malformed_strings_rejected() {
        assert!(Address::from_str("xu.0.300.0.0.1:1").is_err());
        assert!(Address::from_str("xu.0.127.0.0.1").is_err());
        assert!(Address::from_str("xu.abc.127.0.0.1:1").is_err());
        assert!(Address::from_str("tcp.0.127.0.0.1:1").is_err());
        assert!(Address::from_str("wlan.0.02:1a:2b:3c:4d").is_err());
        assert!(Address::from_str("nonsense").is_err());
    }

    #[test]
    fn equality_ignores_origin() {
        let a = Address::from_str("xu.0.10.0.0.1:4242").unwrap();
        let b = a.clone().with_origin(OriginHint::Inbound);
        assert_eq!(a, b);
    }

    #[test]
    fn options_participate_in_equality() {
        let a = Address::from_str("xu.0.10.0.0.1:4242").unwrap();
        let b = Address::from_str("xu.1.10.0.0.1:4242").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wire_marshal_round_trip() {
        let a = Address::from_str("xu.9.192.168.1.10:9000").unwrap();
        let mut buf: Buffer<64> = Buffer::new();
        a.marshal(&mut buf).unwrap();
        let mut cursor = 0;
        let back = Address::unmarshal(&buf, &mut cursor).unwrap();
        assert_eq!(a, back);
        assert_eq!(cursor, buf.len());
    }

    #[test]
    fn scope_classification() {
        assert_eq!(scope_of_ip(&"127.0.0.1".parse().unwrap()), NetworkScope::Loopback);
        assert_eq!(scope_of_ip(&"10.1.2.3".parse().unwrap()), NetworkScope::Lan);
        assert_eq!(scope_of_ip(&"192.168.0.1".parse().unwrap()), NetworkScope::Lan);
        assert_eq!(scope_of_ip(&"8.8.8.8".parse().unwrap()), NetworkScope::Wan);
        assert_eq!(scope_of_ip(&"0.0.0.0".parse().unwrap()), NetworkScope::Unspecified);
        assert_eq!(scope_of_ip(&"fe80::1".parse().unwrap()), NetworkScope::Lan);
        assert_eq!(scope_of_ip(&"2001:4860:4860::8888".parse().unwrap()), NetworkScope::Wan);
    }

    #[test]
    fn mac_group_bit() {
        assert!(MacAddress([0x01, 0, 0x5e, 1, 2, 3]).is_multicast());
        assert!(MacAddress([0xff; 6]).is_broadcast());
        assert!(!MacAddress([0x02, 0, 0, 1, 2, 3]).is_multicast());
    }
}
