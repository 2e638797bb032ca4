//! IPv4 layer: header parse/validate, header construction, and next-hop
//! selection (§4.6).

use std::net::Ipv4Addr;

use crate::checksum;
use crate::mac::MacAddress;

pub const HEADER_SIZE: usize = 20;
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_UDP: u8 = 17;
pub const DEFAULT_TTL: u8 = 64;

const FLAG_DF: u16 = 0x4000;
const FLAG_MF: u16 = 0x2000;
const FRAGOFF_MASK: u16 = 0x1FFF;

/// Why an inbound datagram's header was rejected. Each variant maps to a
/// distinct [`crate::error::DropCounters`] field so ingress can count
/// precisely rather than lumping every malformed header together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Truncated, wrong version, IHL ≠ 5 (options unsupported, §6), or the
    /// header's own total-length field doesn't fit the received frame.
    Malformed,
    BadChecksum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub ttl: u8,
    pub protocol: u8,
    pub id: u16,
    pub flags_fragoff: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub total_length: u16,
}

impl Header {
    pub fn is_fragmented(&self) -> bool {
        self.flags_fragoff & FLAG_MF != 0 || self.flags_fragoff & FRAGOFF_MASK != 0
    }
}

/// Parse and fully validate a header at the front of `frame` (version, IHL,
/// checksum, total-length-fits-frame). Returns the header and the slice
/// following it (exactly `total_length - HEADER_SIZE` bytes).
pub fn parse(frame: &[u8]) -> Result<(Header, &[u8]), ParseError> {
    if frame.len() < HEADER_SIZE {
        return Err(ParseError::Malformed);
    }
    let version = frame[0] >> 4;
    let ihl = frame[0] & 0x0F;
    if version != 4 || ihl != 5 {
        return Err(ParseError::Malformed);
    }
    let total_length = u16::from_be_bytes([frame[2], frame[3]]);
    if (total_length as usize) < HEADER_SIZE || (total_length as usize) > frame.len() {
        return Err(ParseError::Malformed);
    }
    if checksum::internet_checksum(&frame[..HEADER_SIZE]) != 0 {
        return Err(ParseError::BadChecksum);
    }
    let id = u16::from_be_bytes([frame[4], frame[5]]);
    let flags_fragoff = u16::from_be_bytes([frame[6], frame[7]]);
    let ttl = frame[8];
    let protocol = frame[9];
    let src = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let dst = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);
    let header = Header {
        ttl,
        protocol,
        id,
        flags_fragoff,
        src,
        dst,
        total_length,
    };
    Ok((header, &frame[HEADER_SIZE..total_length as usize]))
}

/// Stamp a header (version=4, IHL=5, DF set, fragment offset 0) in place at
/// the front of `frame`, over a payload of `payload_len` bytes already
/// resident at `frame[HEADER_SIZE..]` — composing the header in place over
/// an application payload already sitting in a pool buffer (§1), rather
/// than copying it there. Checksum is computed last, over the header only
/// (§4.6). Returns the total datagram length.
#[allow(clippy::too_many_arguments)]
pub fn stamp(
    frame: &mut [u8],
    id: u16,
    ttl: u8,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    payload_len: usize,
) -> usize {
    let total_length = (HEADER_SIZE + payload_len) as u16;
    frame[0] = 0x45;
    frame[1] = 0;
    frame[2..4].copy_from_slice(&total_length.to_be_bytes());
    frame[4..6].copy_from_slice(&id.to_be_bytes());
    frame[6..8].copy_from_slice(&FLAG_DF.to_be_bytes());
    frame[8] = ttl;
    frame[9] = protocol;
    frame[10..12].copy_from_slice(&[0, 0]);
    frame[12..16].copy_from_slice(&src.octets());
    frame[16..20].copy_from_slice(&dst.octets());
    let cksum = checksum::internet_checksum(&frame[..HEADER_SIZE]);
    frame[10..12].copy_from_slice(&cksum.to_be_bytes());
    HEADER_SIZE + payload_len
}

/// A monotonically increasing IP identification counter (§4.6), wrapping at
/// `u16::MAX` like any other wire-format counter.
#[derive(Debug, Default)]
pub struct IdGenerator(u16);

impl IdGenerator {
    pub fn next(&mut self) -> u16 {
        let id = self.0;
        self.0 = self.0.wrapping_add(1);
        id
    }
}

/// The engine's locally-configured interface identity: address, mask, MAC,
/// and optional default gateway, plus the derived values next-hop selection
/// needs.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceConfig {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mac: MacAddress,
    pub gateway: Option<Ipv4Addr>,
}

impl InterfaceConfig {
    pub fn broadcast(&self) -> Ipv4Addr {
        let ip = u32::from(self.ip);
        let mask = u32::from(self.netmask);
        Ipv4Addr::from(ip | !mask)
    }

    pub fn is_on_link(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(addr) & mask == u32::from(self.ip) & mask
    }

    /// True if `addr` is one this interface should accept datagrams for:
    /// our own address, our subnet broadcast, or the global broadcast
    /// (§4.6 ingress destination check).
    pub fn accepts(&self, addr: Ipv4Addr) -> bool {
        addr == self.ip || addr == self.broadcast() || addr == Ipv4Addr::BROADCAST
    }

    /// The IPv4 peer a datagram to `dst` must be handed to: `dst` itself
    /// when on-link, otherwise the configured default gateway. `None` when
    /// `dst` is off-link and no gateway is configured (§4.6, §9 glossary
    /// "next-hop").
    pub fn next_hop(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        if self.is_on_link(dst) {
            Some(dst)
        } else {
            self.gateway
        }
    }
}
