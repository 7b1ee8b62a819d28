// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use crate::decode_error;
use crate::encoding_error;
use crate::MacAddr;
use crate::ProtocolResult;

pub const ETHER_VLAN: u16 = 0x8100;
pub const ETHER_LLDP: u16 = 0x88cc;
pub const ETHER_LEN: usize = 14;
pub const VLAN_LEN: usize = 4;

/// Every TLV starts with a 7-bit type and a 9-bit length.
pub const TLV_HDR_LEN: usize = 2;
pub const TLV_MAX_SIZE: usize = 511;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthQHdr {
    pub eth_pcp: u8,       // 802.1q Priority code point
    pub eth_dei: u8,       // 802.1q Drop eligible indicator
    pub eth_vlan_tag: u16, // 802.1q VID
}

impl From<EthQHdr> for u16 {
    fn from(x: EthQHdr) -> Self {
        ((x.eth_pcp as u16) << 13) | ((x.eth_dei as u16) << 12) | x.eth_vlan_tag
    }
}

impl From<u16> for EthQHdr {
    fn from(x: u16) -> Self {
        EthQHdr {
            eth_pcp: ((x >> 13) & 0x07) as u8,
            eth_dei: ((x >> 12) & 0x01) as u8,
            eth_vlan_tag: x & 0xfff,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthHdr {
    pub eth_dmac: MacAddr,
    pub eth_smac: MacAddr,
    pub eth_8021q: Option<EthQHdr>,
    pub eth_type: u16,
}

impl EthHdr {
    /// Build an untagged header for an LLDP frame.
    pub fn new(eth_dmac: MacAddr, eth_smac: MacAddr) -> EthHdr {
        EthHdr {
            eth_dmac,
            eth_smac,
            eth_8021q: None,
            eth_type: ETHER_LLDP,
        }
    }

    pub fn size(&self) -> usize {
        match self.eth_8021q {
            Some(_) => ETHER_LEN + VLAN_LEN,
            None => ETHER_LEN,
        }
    }

    /// Parse the ethernet header at the front of `data`, returning the header
    /// and the number of bytes it occupied.
    pub fn parse(data: &[u8]) -> ProtocolResult<(EthHdr, usize)> {
        if data.len() < ETHER_LEN {
            return Err(decode_error("ethernet header too short"));
        }
        let mut eth_hdr = EthHdr {
            eth_dmac: MacAddr::from_slice(&data[0..6]),
            eth_smac: MacAddr::from_slice(&data[6..12]),
            eth_8021q: None,
            eth_type: get_u16(&data[12..])?,
        };

        if eth_hdr.eth_type == ETHER_VLAN {
            if data.len() < ETHER_LEN + VLAN_LEN {
                return Err(decode_error("vlan header too short"));
            }
            eth_hdr.eth_8021q = Some(get_u16(&data[14..])?.into());
            eth_hdr.eth_type = get_u16(&data[16..])?;
        }
        Ok((eth_hdr, eth_hdr.size()))
    }

    pub fn deparse(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.eth_dmac.to_vec());
        bytes.extend_from_slice(&self.eth_smac.to_vec());
        if let Some(q) = self.eth_8021q {
            bytes.extend_from_slice(&get_bytes(ETHER_VLAN));
            bytes.extend_from_slice(&get_bytes(q.into()));
        }
        bytes.extend_from_slice(&get_bytes(self.eth_type));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LldpTlv {
    pub lldp_tlv_type: u8,  // 7 bits
    pub lldp_tlv_size: u16, // 9 bits
    pub lldp_tlv_octets: Vec<u8>,
}

impl LldpTlv {
    pub fn new(
        tlv_type: impl Into<u8>,
        tlv_data: &[u8],
    ) -> ProtocolResult<Self> {
        let tlv_type = tlv_type.into();
        let tlv_size = tlv_data.len();
        if tlv_type & 0x80 != 0 {
            Err(encoding_error(format!("invalid tlv type: {tlv_type}")))
        } else if tlv_size > TLV_MAX_SIZE {
            Err(encoding_error("tlv data exceeds 511 octets"))
        } else {
            Ok(LldpTlv {
                lldp_tlv_type: tlv_type,
                lldp_tlv_size: tlv_size as u16,
                lldp_tlv_octets: tlv_data.into(),
            })
        }
    }

    /// The End Of LLDPDU TLV: type 0, no payload.
    pub fn end() -> Self {
        LldpTlv {
            lldp_tlv_type: 0,
            lldp_tlv_size: 0,
            lldp_tlv_octets: Vec::new(),
        }
    }

    fn parse(data: &[u8]) -> ProtocolResult<(LldpTlv, usize)> {
        if data.len() < TLV_HDR_LEN {
            return Err(decode_error("lldp tlv prefix too short"));
        }

        let word = get_u16(data)?;
        let lldp_tlv_type = (word >> 9) as u8;
        let lldp_tlv_size = word & 0x1ff;
        let end = TLV_HDR_LEN + lldp_tlv_size as usize;

        if end > data.len() {
            return Err(decode_error(format!(
                "lldp tlv too short: type {lldp_tlv_type} claims \
                 {lldp_tlv_size} octets, {} available",
                data.len() - TLV_HDR_LEN
            )));
        }
        Ok((
            LldpTlv {
                lldp_tlv_type,
                lldp_tlv_size,
                lldp_tlv_octets: data[TLV_HDR_LEN..end].to_vec(),
            },
            end,
        ))
    }

    fn deparse(&self, bytes: &mut Vec<u8>) {
        let w = ((self.lldp_tlv_type as u16) << 9) | self.lldp_tlv_size;
        bytes.extend_from_slice(&get_bytes(w));
        bytes.extend_from_slice(&self.lldp_tlv_octets);
    }
}

/// Split an LLDPDU into its TLVs.  Parsing stops at the End Of LLDPDU TLV or
/// at the end of the buffer, whichever comes first, so trailing ethernet
/// padding is ignored.  The End TLV itself is not returned.
pub fn parse_tlvs(data: &[u8]) -> ProtocolResult<Vec<LldpTlv>> {
    if data.len() < TLV_HDR_LEN {
        return Err(decode_error("lldpdu too short"));
    }

    let mut tlvs = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (tlv, bytes) = LldpTlv::parse(&data[offset..])?;
        offset += bytes;
        if tlv.lldp_tlv_type == 0 {
            break;
        }
        tlvs.push(tlv);
    }
    Ok(tlvs)
}

/// Serialize a list of TLVs, terminated by an End Of LLDPDU TLV.
pub fn deparse_tlvs(tlvs: &[LldpTlv], bytes: &mut Vec<u8>) {
    for tlv in tlvs {
        tlv.deparse(bytes);
    }
    LldpTlv::end().deparse(bytes);
}

fn get_u16(data: &[u8]) -> ProtocolResult<u16> {
    if data.len() < 2 {
        Err(decode_error("buffer too small"))
    } else {
        Ok(((data[0] as u16) << 8) | data[1] as u16)
    }
}

fn get_bytes(data: u16) -> [u8; 2] {
    data.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tlv_header_packing() {
        let tlv = LldpTlv::new(5u8, b"sled-07").unwrap();
        let mut bytes = Vec::new();
        tlv.deparse(&mut bytes);
        // type 5 in the top 7 bits, length 7 in the bottom 9
        assert_eq!(&bytes[0..2], &[0x0a, 0x07]);

        let (parsed, used) = LldpTlv::parse(&bytes).unwrap();
        assert_eq!(parsed, tlv);
        assert_eq!(used, 9);
    }

    #[test]
    fn test_tlv_limits() {
        assert!(LldpTlv::new(0x80u8, &[]).is_err());
        assert!(LldpTlv::new(1u8, &[0u8; 512]).is_err());
        assert!(LldpTlv::new(1u8, &[0u8; 511]).is_ok());
    }

    #[test]
    fn test_parse_stops_at_end_tlv() {
        // chassis-ish TLV, End TLV, then ethernet padding
        let data = [0x02, 0x01, 0xaa, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff];
        let tlvs = parse_tlvs(&data).unwrap();
        assert_eq!(tlvs.len(), 1);
        assert_eq!(tlvs[0].lldp_tlv_octets, vec![0xaa]);
    }

    #[test]
    fn test_parse_truncated_tlv() {
        // claims 16 octets, carries 2
        let data = [0x02, 0x10, 0xaa, 0xbb];
        assert!(parse_tlvs(&data).is_err());
        assert!(parse_tlvs(&[]).is_err());
        assert!(parse_tlvs(&[0x02]).is_err());
    }

    #[test]
    fn test_vlan_header() {
        let mut bytes = Vec::new();
        let mut hdr = EthHdr::new(
            MacAddr::new(0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e),
            MacAddr::new(0xa8, 0x40, 0x25, 0x00, 0x00, 0x01),
        );
        hdr.eth_8021q = Some(EthQHdr {
            eth_pcp: 7,
            eth_dei: 0,
            eth_vlan_tag: 42,
        });
        hdr.deparse(&mut bytes);
        assert_eq!(bytes.len(), ETHER_LEN + VLAN_LEN);

        let (parsed, size) = EthHdr::parse(&bytes).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(size, ETHER_LEN + VLAN_LEN);
        assert!(EthHdr::parse(&bytes[..ETHER_LEN + 2]).is_err());
    }
}
