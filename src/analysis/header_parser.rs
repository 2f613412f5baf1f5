use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::vlan::VlanPacket;
use serde::Serialize;
use std::fmt;

use crate::analysis::protocols::TransportProtocol;
use crate::capture::{LinkType, RawFrame};

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const SLL_HEADER_LEN: usize = 16;
const SLL_PROTOCOL_OFFSET: usize = 14;
const MIN_IPV4_HEADER_LEN: usize = 20;

/// Classified summary of one frame. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketRecord {
    #[serde(rename = "src")]
    source_address: String,
    #[serde(rename = "dst")]
    dest_address: String,
    protocol: TransportProtocol,
    #[serde(rename = "size")]
    size_bytes: usize,
}

impl PacketRecord {
    pub fn new(source_address: String, dest_address: String, protocol: TransportProtocol, size_bytes: usize) -> Self {
        Self { source_address, dest_address, protocol, size_bytes }
    }

    pub fn source_address(&self) -> &str {
        &self.source_address
    }

    pub fn dest_address(&self) -> &str {
        &self.dest_address
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl fmt::Display for PacketRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {} ({}, {} bytes)", self.source_address, self.dest_address, self.protocol, self.size_bytes)
    }
}

/// Why a frame produced no record. Both reasons are handled identically;
/// they are only counted apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotIp,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Record(PacketRecord),
    Skip(SkipReason),
}

enum NetworkLayer<'a> {
    Ipv4(&'a [u8]),
    Ipv6(&'a [u8]),
}

pub struct HeaderParser {
    link_type: LinkType,
}

impl HeaderParser {
    pub fn new(link_type: LinkType) -> Self {
        Self { link_type }
    }

    pub fn parse(&self, frame: RawFrame) -> ParseOutcome {
        let size_bytes = frame.len();

        match self.network_layer(frame.data()) {
            Some(NetworkLayer::Ipv4(bytes)) => Self::parse_ipv4(bytes, size_bytes),
            Some(NetworkLayer::Ipv6(bytes)) => Self::parse_ipv6(bytes, size_bytes),
            None => ParseOutcome::Skip(SkipReason::NotIp),
        }
    }

    fn network_layer<'a>(&self, data: &'a [u8]) -> Option<NetworkLayer<'a>> {
        match self.link_type {
            LinkType::Ethernet => {
                let ethernet = EthernetPacket::new(data)?;
                let mut ethertype = ethernet.get_ethertype();
                let mut offset = ETHERNET_HEADER_LEN;

                if ethertype == EtherTypes::Vlan {
                    let vlan = VlanPacket::new(&data[offset..])?;
                    ethertype = vlan.get_ethertype();
                    offset += VLAN_TAG_LEN;
                }

                Self::by_ethertype(ethertype, &data[offset..])
            },
            LinkType::LinuxSll => {
                if data.len() < SLL_HEADER_LEN {
                    return None;
                }
                let ethertype = EtherType(u16::from_be_bytes([
                    data[SLL_PROTOCOL_OFFSET],
                    data[SLL_PROTOCOL_OFFSET + 1],
                ]));
                Self::by_ethertype(ethertype, &data[SLL_HEADER_LEN..])
            },
            LinkType::RawIp => match *data.first()? >> 4 {
                4 => Some(NetworkLayer::Ipv4(data)),
                6 => Some(NetworkLayer::Ipv6(data)),
                _ => None,
            },
        }
    }

    fn by_ethertype(ethertype: EtherType, payload: &[u8]) -> Option<NetworkLayer<'_>> {
        match ethertype {
            EtherTypes::Ipv4 => Some(NetworkLayer::Ipv4(payload)),
            EtherTypes::Ipv6 => Some(NetworkLayer::Ipv6(payload)),
            _ => None,
        }
    }

    fn parse_ipv4(bytes: &[u8], size_bytes: usize) -> ParseOutcome {
        let ipv4 = match Ipv4Packet::new(bytes) {
            Some(packet) => packet,
            None => return ParseOutcome::Skip(SkipReason::Malformed),
        };

        let header_len = ipv4.get_header_length() as usize * 4;
        if ipv4.get_version() != 4 || header_len < MIN_IPV4_HEADER_LEN || bytes.len() < header_len {
            return ParseOutcome::Skip(SkipReason::Malformed);
        }

        ParseOutcome::Record(PacketRecord::new(
            ipv4.get_source().to_string(),
            ipv4.get_destination().to_string(),
            TransportProtocol::from_ip_number(ipv4.get_next_level_protocol().0),
            size_bytes,
        ))
    }

    // Next Header of the fixed header only; extension headers are not walked.
    fn parse_ipv6(bytes: &[u8], size_bytes: usize) -> ParseOutcome {
        let ipv6 = match Ipv6Packet::new(bytes) {
            Some(packet) => packet,
            None => return ParseOutcome::Skip(SkipReason::Malformed),
        };

        if ipv6.get_version() != 6 {
            return ParseOutcome::Skip(SkipReason::Malformed);
        }

        ParseOutcome::Record(PacketRecord::new(
            ipv6.get_source().to_string(),
            ipv6.get_destination().to_string(),
            TransportProtocol::from_ip_number(ipv6.get_next_header().0),
            size_bytes,
        ))
    }
}
