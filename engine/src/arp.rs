//! ARP cache: IPv4 → MAC resolution (§4.4). Entries move
//! `absent → pending → resolved`; a lookup while pending does not block
//! here — [`crate::engine::Engine::connect`] is the suspension point that
//! polls this cache until it resolves or a retry cap is hit (§5, §9).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use log::debug;

use crate::ethernet::{self, EthernetHeader};
use crate::mac::MacAddress;

pub const HTYPE_ETHERNET: u16 = 1;
pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;
pub const HEADER_SIZE: usize = 28;

/// A parsed ARP packet (the 28-byte IPv4-over-Ethernet case only; the
/// hardware/protocol length fields are validated but not otherwise
/// generalized, same narrowing the reference stack makes).
#[derive(Debug, Clone, Copy)]
pub struct ArpPacket {
    pub op: u16,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let htype = u16::from_be_bytes([data[0], data[1]]);
        let ptype = u16::from_be_bytes([data[2], data[3]]);
        let hlen = data[4];
        let plen = data[5];
        if htype != HTYPE_ETHERNET || ptype != ethernet::ETHERTYPE_IPV4 || hlen != 6 || plen != 4 {
            return None;
        }
        let op = u16::from_be_bytes([data[6], data[7]]);
        let sender_mac = MacAddress::new(data[8..14].try_into().unwrap());
        let sender_ip = Ipv4Addr::new(data[14], data[15], data[16], data[17]);
        let target_mac = MacAddress::new(data[18..24].try_into().unwrap());
        let target_ip = Ipv4Addr::new(data[24], data[25], data[26], data[27]);
        Some(ArpPacket {
            op,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&HTYPE_ETHERNET.to_be_bytes());
        out[2..4].copy_from_slice(&ethernet::ETHERTYPE_IPV4.to_be_bytes());
        out[4] = 6;
        out[5] = 4;
        out[6..8].copy_from_slice(&self.op.to_be_bytes());
        out[8..14].copy_from_slice(self.sender_mac.as_bytes());
        out[14..18].copy_from_slice(&self.sender_ip.octets());
        out[18..24].copy_from_slice(self.target_mac.as_bytes());
        out[24..28].copy_from_slice(&self.target_ip.octets());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Resolved(MacAddress),
}

#[derive(Default)]
pub struct ArpCache {
    entries: HashMap<Ipv4Addr, State>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when absent or still pending; `Some(mac)` once resolved.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddress> {
        match self.entries.get(&ip) {
            Some(State::Resolved(mac)) => Some(*mac),
            _ => None,
        }
    }

    pub fn is_pending(&self, ip: Ipv4Addr) -> bool {
        matches!(self.entries.get(&ip), Some(State::Pending))
    }

    /// `absent → pending`, issued when a send targets an unresolved
    /// next-hop.
    pub fn mark_pending(&mut self, ip: Ipv4Addr) {
        self.entries.entry(ip).or_insert(State::Pending);
    }

    /// Opportunistic learning (§4.4): any observed ARP packet updates the
    /// cache regardless of whether we were waiting on this address.
    pub fn learn(&mut self, ip: Ipv4Addr, mac: MacAddress) {
        self.entries.insert(ip, State::Resolved(mac));
    }

    /// Build a broadcast ARP request for `target_ip` into `out`. Returns the
    /// frame length written.
    pub fn build_request(
        local_mac: MacAddress,
        local_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
        out: &mut [u8],
    ) -> usize {
        let pkt = ArpPacket {
            op: OP_REQUEST,
            sender_mac: local_mac,
            sender_ip: local_ip,
            target_mac: MacAddress::ZERO,
            target_ip,
        };
        let mut payload = [0u8; HEADER_SIZE];
        pkt.write(&mut payload);
        ethernet::build_frame(
            MacAddress::BROADCAST,
            local_mac,
            ethernet::ETHERTYPE_ARP,
            &payload,
            out,
        )
    }

    /// Build a reply to `request`, copying its sender fields into the
    /// reply's target fields per §4.4. `None` if `request` was not itself an
    /// ARP request.
    pub fn build_reply(
        local_mac: MacAddress,
        local_ip: Ipv4Addr,
        request: &ArpPacket,
        out: &mut [u8],
    ) -> Option<usize> {
        if request.op != OP_REQUEST {
            return None;
        }
        let pkt = ArpPacket {
            op: OP_REPLY,
            sender_mac: local_mac,
            sender_ip: local_ip,
            target_mac: request.sender_mac,
            target_ip: request.sender_ip,
        };
        let mut payload = [0u8; HEADER_SIZE];
        pkt.write(&mut payload);
        Some(ethernet::build_frame(
            request.sender_mac,
            local_mac,
            ethernet::ETHERTYPE_ARP,
            &payload,
            out,
        ))
    }
}

/// Handle one already-demultiplexed ARP frame: reply if we're the target of
/// a request, and opportunistically learn the sender's mapping either way.
/// `reply_out`, if a reply is produced, receives the frame to transmit.
pub fn handle_incoming(
    cache: &mut ArpCache,
    local_mac: MacAddress,
    local_ip: Ipv4Addr,
    eth: &EthernetHeader,
    payload: &[u8],
    reply_out: &mut [u8],
) -> Option<usize> {
    let pkt = ArpPacket::parse(payload)?;
    cache.learn(pkt.sender_ip, pkt.sender_mac);
    let _ = eth;
    if pkt.op == OP_REQUEST && pkt.target_ip == local_ip {
        return ArpCache::build_reply(local_mac, local_ip, &pkt, reply_out);
    }
    debug!("arp: ignoring op {} not addressed to us", pkt.op);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> MacAddress {
        MacAddress::new([b, 0, 0, 0, 0, 1])
    }

    #[test]
    fn request_round_trips_through_parse() {
        let mut buf = [0u8; 128];
        let n = ArpCache::build_request(
            mac(1),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 9),
            &mut buf,
        );
        let (eth, payload) = EthernetHeader::parse(&buf[..n]).unwrap();
        assert_eq!(eth.dst, MacAddress::BROADCAST);
        assert_eq!(eth.ethertype, ethernet::ETHERTYPE_ARP);
        let pkt = ArpPacket::parse(payload).unwrap();
        assert_eq!(pkt.op, OP_REQUEST);
        assert_eq!(pkt.sender_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(pkt.target_ip, Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn cache_resolves_only_after_learn() {
        let mut cache = ArpCache::new();
        let ip = Ipv4Addr::new(10, 0, 0, 9);
        assert_eq!(cache.lookup(ip), None);
        cache.mark_pending(ip);
        assert!(cache.is_pending(ip));
        assert_eq!(cache.lookup(ip), None);
        cache.learn(ip, mac(7));
        assert_eq!(cache.lookup(ip), Some(mac(7)));
        assert!(!cache.is_pending(ip));
    }

    #[test]
    fn request_addressed_to_us_produces_reply() {
        let mut cache = ArpCache::new();
        let local_ip = Ipv4Addr::new(10, 0, 0, 1);
        let local_mac = mac(1);
        let mut req_buf = [0u8; 128];
        let n = ArpCache::build_request(mac(2), Ipv4Addr::new(10, 0, 0, 2), local_ip, &mut req_buf);
        let (eth, payload) = EthernetHeader::parse(&req_buf[..n]).unwrap();

        let mut reply_buf = [0u8; 128];
        let reply_len =
            handle_incoming(&mut cache, local_mac, local_ip, &eth, payload, &mut reply_buf)
                .expect("reply expected");
        let (reply_eth, reply_payload) = EthernetHeader::parse(&reply_buf[..reply_len]).unwrap();
        assert_eq!(reply_eth.dst, mac(2));
        let reply = ArpPacket::parse(reply_payload).unwrap();
        assert_eq!(reply.op, OP_REPLY);
        assert_eq!(reply.target_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 2)), Some(mac(2)));
    }

    #[test]
    fn request_not_addressed_to_us_still_teaches_sender() {
        let mut cache = ArpCache::new();
        let local_ip = Ipv4Addr::new(10, 0, 0, 1);
        let mut req_buf = [0u8; 128];
        let n = ArpCache::build_request(
            mac(3),
            Ipv4Addr::new(10, 0, 0, 3),
            Ipv4Addr::new(10, 0, 0, 4),
            &mut req_buf,
        );
        let (eth, payload) = EthernetHeader::parse(&req_buf[..n]).unwrap();
        let mut reply_buf = [0u8; 128];
        let reply = handle_incoming(&mut cache, mac(1), local_ip, &eth, payload, &mut reply_buf);
        assert!(reply.is_none());
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 3)), Some(mac(3)));
    }
}
