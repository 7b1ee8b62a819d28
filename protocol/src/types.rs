// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::decode_error;
use crate::encoding_error;
use crate::macaddr::MacAddr;
use crate::packet::deparse_tlvs;
use crate::packet::parse_tlvs;
use crate::packet::EthHdr;
use crate::packet::LldpTlv;
use crate::packet::ETHER_LLDP;
use crate::ProtocolError;
use crate::ProtocolResult;

/// Largest payload allowed for the identifier and string TLVs we emit.
pub const MAX_STRING_LEN: usize = 255;

/// How a Chassis ID or Port ID value is expressed on the wire.
#[derive(
    Clone,
    Copy,
    Debug,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Deserialize,
    JsonSchema,
    Serialize,
)]
pub enum LinkIdentifierKind {
    InterfaceName,
    MacAddress,
}

/// The value carried by a Chassis ID or Port ID TLV.  MAC addresses are
/// stored in their colon-separated text form.
#[derive(
    Clone,
    Debug,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Deserialize,
    JsonSchema,
    Serialize,
)]
pub struct LinkIdentifier {
    pub kind: LinkIdentifierKind,
    pub value: String,
}

impl LinkIdentifier {
    pub fn mac(mac: MacAddr) -> Self {
        LinkIdentifier {
            kind: LinkIdentifierKind::MacAddress,
            value: mac.to_string(),
        }
    }

    pub fn interface_name(name: impl ToString) -> Self {
        LinkIdentifier {
            kind: LinkIdentifierKind::InterfaceName,
            value: name.to_string(),
        }
    }

    pub fn is_mac(&self) -> bool {
        self.kind == LinkIdentifierKind::MacAddress
    }

    // The octets following the subtype byte in a Chassis or Port TLV
    fn to_octets(&self, label: &str) -> ProtocolResult<Vec<u8>> {
        match self.kind {
            LinkIdentifierKind::MacAddress => {
                let mac = self.value.parse::<MacAddr>().map_err(|e| {
                    encoding_error(format!(
                        "{label} {:?} is not a mac address: {e}",
                        self.value
                    ))
                })?;
                // Decoding always yields the lowercase, zero-padded form.
                if mac.to_string() != self.value {
                    return Err(encoding_error(format!(
                        "{label} {:?} is not in canonical form ({mac})",
                        self.value
                    )));
                }
                Ok(mac.to_vec())
            }
            LinkIdentifierKind::InterfaceName => {
                if self.value.is_empty() {
                    Err(encoding_error(format!("{label} is empty")))
                } else if self.value.len() > MAX_STRING_LEN {
                    Err(encoding_error(format!(
                        "{label} exceeds {MAX_STRING_LEN} octets"
                    )))
                } else {
                    Ok(self.value.as_bytes().to_vec())
                }
            }
        }
    }
}

impl fmt::Display for LinkIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            LinkIdentifierKind::MacAddress => {
                write!(f, "Mac Address - {}", self.value)
            }
            LinkIdentifierKind::InterfaceName => {
                write!(f, "Interface Name - {}", self.value)
            }
        }
    }
}

/// The subset of an LLDPDU used for neighbor discovery.  Optional string
/// TLVs that were not present are left empty.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct Lldpdu {
    pub chassis_id: LinkIdentifier,
    pub port_id: LinkIdentifier,
    /// Seconds
    pub ttl: u16,
    pub port_description: String,
    pub system_name: String,
    pub system_description: String,
}

impl Lldpdu {
    /// Did the sender include any of the descriptive TLVs?
    pub fn has_descriptive_tlv(&self) -> bool {
        !(self.port_description.is_empty()
            && self.system_name.is_empty()
            && self.system_description.is_empty())
    }

    /// Serialize the LLDPDU, including the trailing End Of LLDPDU TLV.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let tlvs: Vec<LldpTlv> = self.try_into()?;
        let mut bytes = Vec::new();
        deparse_tlvs(&tlvs, &mut bytes);
        Ok(bytes)
    }
}

impl fmt::Display for Lldpdu {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Chassis ID: {}", self.chassis_id)?;
        writeln!(f, "Port ID: {}", self.port_id)?;
        writeln!(f, "Time To Live: {} seconds", self.ttl)?;
        if !self.port_description.is_empty() {
            writeln!(f, "Port description: {}", self.port_description)?;
        }
        if !self.system_name.is_empty() {
            writeln!(f, "System name: {}", self.system_name)?;
        }
        if !self.system_description.is_empty() {
            writeln!(f, "System description: {}", self.system_description)?;
        }
        Ok(())
    }
}

impl TryFrom<&Lldpdu> for Vec<LldpTlv> {
    type Error = ProtocolError;

    fn try_from(lldpdu: &Lldpdu) -> ProtocolResult<Self> {
        let mut lldp_data: Vec<LldpTlv> = vec![
            chassis_to_tlv(&lldpdu.chassis_id)?,
            port_to_tlv(&lldpdu.port_id)?,
            ttl_to_tlv(lldpdu.ttl),
        ];
        if !lldpdu.port_description.is_empty() {
            lldp_data.push(string_to_tlv(
                TlvType::PortDescription,
                &lldpdu.port_description,
            )?);
        }
        if !lldpdu.system_name.is_empty() {
            lldp_data
                .push(string_to_tlv(TlvType::SystemName, &lldpdu.system_name)?);
        }
        if !lldpdu.system_description.is_empty() {
            lldp_data.push(string_to_tlv(
                TlvType::SystemDescription,
                &lldpdu.system_description,
            )?);
        }
        Ok(lldp_data)
    }
}

impl TryFrom<&[LldpTlv]> for Lldpdu {
    type Error = ProtocolError;

    fn try_from(data: &[LldpTlv]) -> ProtocolResult<Self> {
        // The standard requires the first three TLVs to be the chassis ID,
        // port ID, and TTL, in that order.
        let chassis_id = match data.first() {
            Some(tlv) => chassis_from_tlv(tlv),
            None => Err(decode_error("LLDP packet has no ChassisId")),
        }?;
        let port_id = match data.get(1) {
            Some(tlv) => port_from_tlv(tlv),
            None => Err(decode_error("LLDP packet has no PortId")),
        }?;
        let ttl = match data.get(2) {
            Some(tlv) => ttl_from_tlv(tlv),
            None => Err(decode_error("LLDP packet has no TTL")),
        }?;

        let mut port_description = None;
        let mut system_name = None;
        let mut system_description = None;

        for tlv in data.iter().skip(3) {
            // Capabilities, management addresses, organizationally specific
            // and unknown TLVs carry nothing we report.
            let Ok(tlv_type) = TlvType::try_from(tlv.lldp_tlv_type) else {
                continue;
            };
            match tlv_type {
                TlvType::EndOfLLDPDU => break,
                TlvType::ChassisId => {
                    return Err(decode_error(
                        "LLDP packet has multiple ChassisId TLVs",
                    ))
                }
                TlvType::PortId => {
                    return Err(decode_error(
                        "LLDP packet has multiple PortId TLVs",
                    ))
                }
                TlvType::Ttl => {
                    return Err(decode_error(
                        "LLDP packet has multiple TTL TLVs",
                    ))
                }
                TlvType::PortDescription => {
                    port_description =
                        Some(string_from_octets(&tlv.lldp_tlv_octets))
                }
                TlvType::SystemName => {
                    system_name = Some(string_from_octets(&tlv.lldp_tlv_octets))
                }
                TlvType::SystemDescription => {
                    system_description =
                        Some(string_from_octets(&tlv.lldp_tlv_octets))
                }
                TlvType::SystemCapabilities
                | TlvType::ManagementAddress
                | TlvType::OrganizationallySpecific => {}
            }
        }

        Ok(Lldpdu {
            chassis_id,
            port_id,
            ttl,
            port_description: port_description.unwrap_or_default(),
            system_name: system_name.unwrap_or_default(),
            system_description: system_description.unwrap_or_default(),
        })
    }
}

/// Encode an LLDPDU carrying the given identity.  The TTL is expressed in
/// whole seconds and saturates at the 16-bit maximum.
pub fn encode(
    chassis_id: &LinkIdentifier,
    port_id: &LinkIdentifier,
    ttl: Duration,
    system_name: &str,
    system_description: &str,
    port_description: &str,
) -> ProtocolResult<Vec<u8>> {
    Lldpdu {
        chassis_id: chassis_id.clone(),
        port_id: port_id.clone(),
        ttl: u16::try_from(ttl.as_secs()).unwrap_or(u16::MAX),
        port_description: port_description.to_string(),
        system_name: system_name.to_string(),
        system_description: system_description.to_string(),
    }
    .encode()
}

/// Build a complete ethernet frame carrying `lldpdu`.
pub fn encode_frame(
    dst: MacAddr,
    src: MacAddr,
    lldpdu: &Lldpdu,
) -> ProtocolResult<Vec<u8>> {
    let payload = lldpdu.encode()?;
    let hdr = EthHdr::new(dst, src);
    let mut bytes = Vec::with_capacity(hdr.size() + payload.len());
    hdr.deparse(&mut bytes);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode the LLDPDU that follows the ethernet header.
pub fn decode(payload: &[u8]) -> ProtocolResult<Lldpdu> {
    let tlvs = parse_tlvs(payload)?;
    Lldpdu::try_from(tlvs.as_slice())
}

/// Decode a full ethernet frame.  Anything other than an LLDP frame is
/// reported as a decode error.
pub fn decode_frame(frame: &[u8]) -> ProtocolResult<(EthHdr, Lldpdu)> {
    let (hdr, size) = EthHdr::parse(frame)?;
    if hdr.eth_type != ETHER_LLDP {
        return Err(decode_error(format!(
            "not an LLDP frame: ethertype {:#06x}",
            hdr.eth_type
        )));
    }
    decode(&frame[size..]).map(|lldpdu| (hdr, lldpdu))
}

fn expect_type(tlv: &LldpTlv, expected: TlvType) -> ProtocolResult<()> {
    if tlv.lldp_tlv_type != expected as u8 {
        Err(decode_error(format!(
            "expected {expected:?} TLV, found type {}",
            tlv.lldp_tlv_type
        )))
    } else {
        Ok(())
    }
}

fn hex2str(data: &[u8]) -> String {
    data.iter()
        .map(|a| format!("{a:02x}"))
        .collect::<Vec<String>>()
        .join(":")
}

// IANA Address Family Numbers used by the network-address subtypes.
const IANA_IPV4: u8 = 1;
const IANA_IPV6: u8 = 2;

fn network_addr_to_string(data: &[u8]) -> String {
    match (data.first(), data.len()) {
        (Some(&IANA_IPV4), 5) => {
            let a: [u8; 4] = (&data[1..]).try_into().unwrap_or_default();
            IpAddr::from(a).to_string()
        }
        (Some(&IANA_IPV6), 17) => {
            let a: [u8; 16] = (&data[1..]).try_into().unwrap_or_default();
            IpAddr::from(a).to_string()
        }
        // Some switches put a name here instead of an address.
        _ if is_printable(data) => string_from_octets(data),
        _ => hex2str(data),
    }
}

fn is_printable(data: &[u8]) -> bool {
    match std::str::from_utf8(data) {
        Ok(s) => {
            let s = s.trim_end_matches('\0');
            !s.is_empty() && !s.chars().any(char::is_control)
        }
        Err(_) => false,
    }
}

fn id_from_octets(
    label: &str,
    data: &[u8],
    is_mac: bool,
    is_network_addr: bool,
) -> ProtocolResult<LinkIdentifier> {
    let value = &data[1..];
    if value.is_empty() {
        return Err(decode_error(format!("{label} has no value")));
    }
    if is_mac {
        MacAddr::try_from(value).map(LinkIdentifier::mac).map_err(|e| {
            decode_error(format!("{label} has invalid mac address: {e}"))
        })
    } else if is_network_addr {
        Ok(LinkIdentifier::interface_name(network_addr_to_string(value)))
    } else {
        Ok(LinkIdentifier::interface_name(string_from_octets(value)))
    }
}

fn chassis_to_tlv(id: &LinkIdentifier) -> ProtocolResult<LldpTlv> {
    let subtype = match id.kind {
        LinkIdentifierKind::MacAddress => ChassisIdSubtype::MacAddress,
        LinkIdentifierKind::InterfaceName => ChassisIdSubtype::InterfaceName,
    };
    let mut octets = vec![subtype.into()];
    octets.extend(id.to_octets("ChassisId")?);
    LldpTlv::new(TlvType::ChassisId, &octets)
}

fn chassis_from_tlv(tlv: &LldpTlv) -> ProtocolResult<LinkIdentifier> {
    expect_type(tlv, TlvType::ChassisId)?;
    let data = &tlv.lldp_tlv_octets;
    if data.is_empty() {
        return Err(decode_error("ChassisId TLV is empty"));
    }
    match ChassisIdSubtype::try_from(data[0])? {
        ChassisIdSubtype::Reserved => {
            Err(decode_error("ChassisId has reserved subtype"))
        }
        ChassisIdSubtype::MacAddress => {
            id_from_octets("ChassisId", data, true, false)
        }
        ChassisIdSubtype::NetworkAddress => {
            id_from_octets("ChassisId", data, false, true)
        }
        _ => id_from_octets("ChassisId", data, false, false),
    }
}

fn port_to_tlv(id: &LinkIdentifier) -> ProtocolResult<LldpTlv> {
    let subtype = match id.kind {
        LinkIdentifierKind::MacAddress => PortIdSubtype::MacAddress,
        LinkIdentifierKind::InterfaceName => PortIdSubtype::InterfaceName,
    };
    let mut octets = vec![subtype.into()];
    octets.extend(id.to_octets("PortId")?);
    LldpTlv::new(TlvType::PortId, &octets)
}

fn port_from_tlv(tlv: &LldpTlv) -> ProtocolResult<LinkIdentifier> {
    expect_type(tlv, TlvType::PortId)?;
    let data = &tlv.lldp_tlv_octets;
    if data.is_empty() {
        return Err(decode_error("PortId TLV is empty"));
    }
    match PortIdSubtype::try_from(data[0])? {
        PortIdSubtype::Reserved => {
            Err(decode_error("PortId has reserved subtype"))
        }
        PortIdSubtype::MacAddress => {
            id_from_octets("PortId", data, true, false)
        }
        PortIdSubtype::NetworkAddress => {
            id_from_octets("PortId", data, false, true)
        }
        _ => id_from_octets("PortId", data, false, false),
    }
}

pub fn ttl_to_tlv(ttl: u16) -> LldpTlv {
    LldpTlv {
        lldp_tlv_type: TlvType::Ttl.into(),
        lldp_tlv_size: 2,
        lldp_tlv_octets: ttl.to_be_bytes().to_vec(),
    }
}

pub fn ttl_from_tlv(tlv: &LldpTlv) -> ProtocolResult<u16> {
    expect_type(tlv, TlvType::Ttl)?;
    match tlv.lldp_tlv_octets.as_slice() {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(decode_error(format!(
            "TTL TLV has {} octets",
            tlv.lldp_tlv_octets.len()
        ))),
    }
}

pub fn string_to_tlv(tlv_type: TlvType, data: &str) -> ProtocolResult<LldpTlv> {
    if data.len() > MAX_STRING_LEN {
        Err(encoding_error(format!(
            "{tlv_type:?} exceeds {MAX_STRING_LEN} octets"
        )))
    } else {
        LldpTlv::new(tlv_type, data.as_bytes())
    }
}

// Switches in the field are not careful about the "alphanumeric" strings
// they send: accept anything, and drop any NUL terminator.
fn string_from_octets(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}

/// Nearest-bridge group address, the destination of unsolicited LLDPDUs.
pub const LLDP_MULTICAST: MacAddr =
    MacAddr::new(0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e);

/// TLV Type values as defined in table 8-1
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Deserialize, JsonSchema, Serialize,
)]
#[repr(u8)]
pub enum TlvType {
    EndOfLLDPDU = 0,
    ChassisId,
    PortId,
    Ttl,
    PortDescription,
    SystemName,
    SystemDescription,
    SystemCapabilities,
    ManagementAddress,
    OrganizationallySpecific = 127,
}

impl TryFrom<u8> for TlvType {
    type Error = ProtocolError;

    fn try_from(t: u8) -> ProtocolResult<Self> {
        match t {
            0 => Ok(TlvType::EndOfLLDPDU),
            1 => Ok(TlvType::ChassisId),
            2 => Ok(TlvType::PortId),
            3 => Ok(TlvType::Ttl),
            4 => Ok(TlvType::PortDescription),
            5 => Ok(TlvType::SystemName),
            6 => Ok(TlvType::SystemDescription),
            7 => Ok(TlvType::SystemCapabilities),
            8 => Ok(TlvType::ManagementAddress),
            127 => Ok(TlvType::OrganizationallySpecific),
            x => Err(decode_error(format!("invalid TLV type: {x}"))),
        }
    }
}

impl From<TlvType> for u8 {
    fn from(x: TlvType) -> u8 {
        x as u8
    }
}

/// Chassis ID Subtype values as defined in table 8-2.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Deserialize, JsonSchema, Serialize,
)]
#[repr(u8)]
pub enum ChassisIdSubtype {
    Reserved = 0,
    ChassisComponent,
    InterfaceAlias,
    PortComponent,
    MacAddress,
    NetworkAddress,
    InterfaceName,
    LocallyAssigned,
}

impl TryFrom<u8> for ChassisIdSubtype {
    type Error = ProtocolError;

    fn try_from(id: u8) -> ProtocolResult<Self> {
        match id {
            0 => Ok(ChassisIdSubtype::Reserved),
            1 => Ok(ChassisIdSubtype::ChassisComponent),
            2 => Ok(ChassisIdSubtype::InterfaceAlias),
            3 => Ok(ChassisIdSubtype::PortComponent),
            4 => Ok(ChassisIdSubtype::MacAddress),
            5 => Ok(ChassisIdSubtype::NetworkAddress),
            6 => Ok(ChassisIdSubtype::InterfaceName),
            7 => Ok(ChassisIdSubtype::LocallyAssigned),
            x => Err(decode_error(format!("invalid ChassisId subtype: {x}"))),
        }
    }
}

impl From<ChassisIdSubtype> for u8 {
    fn from(x: ChassisIdSubtype) -> u8 {
        x as u8
    }
}

/// Port ID Subtype values as defined by table 8-3.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Deserialize, JsonSchema, Serialize,
)]
#[repr(u8)]
pub enum PortIdSubtype {
    Reserved = 0,
    InterfaceAlias,
    PortComponent,
    MacAddress,
    NetworkAddress,
    InterfaceName,
    AgentCircuitId,
    LocallyAssigned,
}

impl TryFrom<u8> for PortIdSubtype {
    type Error = ProtocolError;

    fn try_from(id: u8) -> ProtocolResult<Self> {
        match id {
            0 => Ok(PortIdSubtype::Reserved),
            1 => Ok(PortIdSubtype::InterfaceAlias),
            2 => Ok(PortIdSubtype::PortComponent),
            3 => Ok(PortIdSubtype::MacAddress),
            4 => Ok(PortIdSubtype::NetworkAddress),
            5 => Ok(PortIdSubtype::InterfaceName),
            6 => Ok(PortIdSubtype::AgentCircuitId),
            7 => Ok(PortIdSubtype::LocallyAssigned),
            x => Err(decode_error(format!("invalid PortId subtype: {x}"))),
        }
    }
}

impl From<PortIdSubtype> for u8 {
    fn from(x: PortIdSubtype) -> u8 {
        x as u8
    }
}

#[test]
fn verify_chassis_subtype() -> ProtocolResult<()> {
    assert_eq!(ChassisIdSubtype::try_from(4)?, ChassisIdSubtype::MacAddress);
    assert_eq!(
        ChassisIdSubtype::try_from(6)?,
        ChassisIdSubtype::InterfaceName
    );
    assert_eq!(u8::from(ChassisIdSubtype::MacAddress), 4);
    assert_eq!(u8::from(ChassisIdSubtype::InterfaceName), 6);
    assert!(ChassisIdSubtype::try_from(8).is_err());
    Ok(())
}

#[test]
fn verify_port_subtype() -> ProtocolResult<()> {
    assert_eq!(PortIdSubtype::try_from(3)?, PortIdSubtype::MacAddress);
    assert_eq!(PortIdSubtype::try_from(5)?, PortIdSubtype::InterfaceName);
    assert_eq!(u8::from(PortIdSubtype::MacAddress), 3);
    assert_eq!(u8::from(PortIdSubtype::InterfaceName), 5);
    assert!(PortIdSubtype::try_from(8).is_err());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn sled_mac() -> MacAddr {
        MacAddr::new(0xa8, 0x40, 0x25, 0x04, 0x05, 0x06)
    }

    #[test]
    fn test_encode_decode_mac_ids() {
        let chassis = LinkIdentifier::mac(sled_mac());
        let port = LinkIdentifier::mac(sled_mac());
        let bytes = encode(
            &chassis,
            &port,
            Duration::from_secs(120),
            "sled-07",
            "waiting for allocation",
            "",
        )
        .unwrap();

        let lldpdu = decode(&bytes).unwrap();
        assert_eq!(lldpdu.chassis_id, chassis);
        assert_eq!(lldpdu.port_id, port);
        assert_eq!(lldpdu.ttl, 120);
        assert_eq!(lldpdu.system_name, "sled-07");
        assert_eq!(lldpdu.system_description, "waiting for allocation");
        assert_eq!(lldpdu.port_description, "");
    }

    #[test]
    fn test_encode_decode_ifname_ids() {
        let chassis = LinkIdentifier::interface_name("leaf-03");
        let port = LinkIdentifier::interface_name("Ethernet48");
        let bytes = encode(
            &chassis,
            &port,
            Duration::from_secs(90),
            "",
            "",
            "uplink to spine",
        )
        .unwrap();

        let lldpdu = decode(&bytes).unwrap();
        assert_eq!(lldpdu.chassis_id.kind, LinkIdentifierKind::InterfaceName);
        assert_eq!(lldpdu.chassis_id.value, "leaf-03");
        assert_eq!(lldpdu.port_id.kind, LinkIdentifierKind::InterfaceName);
        assert_eq!(lldpdu.port_id.value, "Ethernet48");
        assert_eq!(lldpdu.port_description, "uplink to spine");
        assert!(lldpdu.has_descriptive_tlv());
    }

    #[test]
    fn test_wire_layout() {
        let lldpdu = Lldpdu {
            chassis_id: LinkIdentifier::mac(sled_mac()),
            port_id: LinkIdentifier::interface_name("eth0"),
            ttl: 120,
            port_description: String::new(),
            system_name: "s".to_string(),
            system_description: String::new(),
        };
        let frame =
            encode_frame(LLDP_MULTICAST, sled_mac(), &lldpdu).unwrap();
        let expected = hex!(
            "
            0180 c200 000e a840 2504 0506 88cc
            0207 04a8 4025 0405 06
            0405 0565 7468 30
            0602 0078
            0a01 73
            0000
        "
        );
        assert_eq!(frame, expected.to_vec());
    }

    #[test]
    fn test_encode_rejects_bad_mac() {
        let chassis = LinkIdentifier {
            kind: LinkIdentifierKind::MacAddress,
            value: "eth0".to_string(),
        };
        let port = LinkIdentifier::interface_name("eth0");
        let e = encode(&chassis, &port, Duration::from_secs(1), "", "", "")
            .unwrap_err();
        assert!(matches!(e, ProtocolError::Encoding(_)));

        // Accepted by the parser, but would not come back unchanged.
        for value in ["A8:40:25:04:05:06", "a8:40:25:4:5:6"] {
            let chassis = LinkIdentifier {
                kind: LinkIdentifierKind::MacAddress,
                value: value.to_string(),
            };
            let e = encode(&chassis, &port, Duration::from_secs(1), "", "", "")
                .unwrap_err();
            assert!(matches!(e, ProtocolError::Encoding(_)));
        }

        let port = LinkIdentifier::interface_name("");
        let chassis = LinkIdentifier::mac(sled_mac());
        assert!(
            encode(&chassis, &port, Duration::from_secs(1), "", "", "")
                .is_err()
        );

        let long = "x".repeat(MAX_STRING_LEN + 1);
        assert!(encode(
            &chassis,
            &LinkIdentifier::interface_name("eth0"),
            Duration::from_secs(1),
            &long,
            "",
            ""
        )
        .is_err());
    }

    #[test]
    fn test_ttl_saturates() {
        let id = LinkIdentifier::mac(sled_mac());
        let bytes =
            encode(&id, &id, Duration::from_secs(1 << 20), "", "", "").unwrap();
        assert_eq!(decode(&bytes).unwrap().ttl, u16::MAX);
    }

    // Captured from a switch: MAC chassis and port ids, a TTL, and three
    // organizationally specific TLVs.
    #[test]
    fn test_decode_captured_frame() {
        let bytes = hex!(
            "
            0180 c200 000e 0007 436c f0d7 88cc 0207
            0400 0743 6cf0 d704 0703 0007 436c f0d7
            0602 0078 fe19 0080 c209 8000 0100 0032
            3200 0000 0000 0002 0202 0202 0202 02fe
            0600 80c2 0b88 08fe 0500 80c2 0c00 0000
        "
        );

        let (hdr, lldpdu) = decode_frame(&bytes).unwrap();
        assert_eq!(hdr.eth_dmac, LLDP_MULTICAST);
        assert_eq!(hdr.eth_smac.to_string(), "00:07:43:6c:f0:d7");
        assert_eq!(lldpdu.chassis_id.kind, LinkIdentifierKind::MacAddress);
        assert_eq!(lldpdu.chassis_id.value, "00:07:43:6c:f0:d7");
        assert_eq!(lldpdu.port_id.kind, LinkIdentifierKind::MacAddress);
        assert_eq!(lldpdu.ttl, 120);
        assert!(!lldpdu.has_descriptive_tlv());
    }

    #[test]
    fn test_decode_other_subtypes() {
        // Chassis: locally assigned "sw1", port: network address 10.0.0.1
        let payload = hex!(
            "
            0204 0773 7731
            0406 0401 0a00 0001
            0602 0078
            0000
        "
        );
        let lldpdu = decode(&payload).unwrap();
        assert_eq!(lldpdu.chassis_id, LinkIdentifier::interface_name("sw1"));
        assert_eq!(
            lldpdu.port_id,
            LinkIdentifier::interface_name("10.0.0.1")
        );
    }

    #[test]
    fn test_decode_name_in_network_address() {
        // Chassis subtype 5 carrying "eth0", port subtype 4 carrying bytes
        // that are neither an address nor text.
        let payload = hex!(
            "
            0205 0565 7468 30
            0404 0403 ff01
            0602 0078
            0000
        "
        );
        let lldpdu = decode(&payload).unwrap();
        assert_eq!(lldpdu.chassis_id, LinkIdentifier::interface_name("eth0"));
        assert_eq!(lldpdu.port_id, LinkIdentifier::interface_name("03:ff:01"));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // Not an LLDP frame
        let mut frame =
            hex!("0180 c200 000e 0007 436c f0d7 0800 0000").to_vec();
        assert!(matches!(
            decode_frame(&frame),
            Err(ProtocolError::Decode(_))
        ));

        // MAC subtype with a 5-octet value
        frame = hex!("0206 0400 0743 6cf0 0403 0565 3006 0200 78").to_vec();
        assert!(decode(&frame).is_err());

        // TTL before PortId
        frame = hex!("0207 0400 0743 6cf0 d706 0200 7804 0305 6530").to_vec();
        assert!(decode(&frame).is_err());

        // Second chassis id
        frame = [
            &hex!("0207 0400 0743 6cf0 d704 0305 6530 0602 0078")[..],
            &hex!("0207 0400 0743 6cf0 d7")[..],
        ]
        .concat();
        assert!(decode(&frame).is_err());

        // Reserved chassis subtype
        frame = hex!("0202 0061 0403 0565 3006 0200 78").to_vec();
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn test_decode_never_panics_on_truncation() {
        let id = LinkIdentifier::mac(sled_mac());
        let lldpdu = Lldpdu {
            chassis_id: id.clone(),
            port_id: LinkIdentifier::interface_name("eth1"),
            ttl: 30,
            port_description: "p".to_string(),
            system_name: "n".to_string(),
            system_description: "d".to_string(),
        };
        let frame = encode_frame(LLDP_MULTICAST, sled_mac(), &lldpdu).unwrap();
        for len in 0..frame.len() {
            // Every prefix either fails cleanly or, once the optional TLVs
            // start getting cut, still yields the mandatory fields.
            if let Ok((_, d)) = decode_frame(&frame[..len]) {
                assert_eq!(d.chassis_id, id);
            }
        }
        for len in 0..crate::packet::TLV_HDR_LEN {
            assert!(matches!(
                decode(&frame[14..14 + len]),
                Err(ProtocolError::Decode(_))
            ));
        }
        assert!(decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_unknown_tlvs_skipped() {
        // Mandatory TLVs, a capabilities TLV, a reserved type 9, then the
        // system name.
        let payload = hex!(
            "
            0207 0400 0743 6cf0 d7
            0405 0565 7468 30
            0602 0078
            0e04 0014 0014
            1201 00
            0a02 7377
        "
        );
        let lldpdu = decode(&payload).unwrap();
        assert_eq!(lldpdu.system_name, "sw");
    }
}
