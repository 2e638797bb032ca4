//! Socket table: a direct-mapped array of bound UDP endpoints indexed by
//! `port - PORT_LO`, plus each socket's receive queue (§4.9). The transport
//! byte distinguishes protocols at the IPv4 layer; a TCP table is
//! deliberately not implemented here (§1 Non-goals), though the port range
//! constants are shared so one could be added alongside this one without
//! changing how the IPv4 layer picks a table.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use crate::buffer::BufIdx;
use crate::mac::MacAddress;

pub const PORT_LO: u32 = 0;
pub const PORT_HI: u32 = 65_536;

/// Ethernet + IPv4 addressing fixed by `connect` once ARP resolves, so
/// egress on a connected socket only has to fill the fields that vary per
/// datagram (ports, length, checksum, IP id) rather than re-resolve the
/// next-hop every send (§4.10 "precomputed header template").
#[derive(Debug, Clone, Copy)]
pub struct HeaderTemplate {
    pub dst_mac: MacAddress,
    pub src_mac: MacAddress,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
}

/// One datagram waiting in a socket's receive queue.
#[derive(Debug, Clone, Copy)]
pub struct DatagramRecord {
    pub buf_idx: BufIdx,
    pub payload_offset: u16,
    pub payload_len: u16,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
}

/// Caps a single socket's receive queue so one noisy peer cannot exhaust the
/// engine's pool on behalf of a socket nobody is draining.
pub const MAX_QUEUED_DATAGRAMS: usize = 64;

pub struct Socket {
    pub local_port: u16,
    pub remote: Option<(Ipv4Addr, u16)>,
    pub header_template: Option<HeaderTemplate>,
    queue: VecDeque<DatagramRecord>,
}

impl Socket {
    fn new(local_port: u16) -> Self {
        Socket {
            local_port,
            remote: None,
            header_template: None,
            queue: VecDeque::new(),
        }
    }

    /// Enqueue a received datagram, dropping the oldest once the queue is
    /// full rather than growing unbounded.
    pub fn enqueue(&mut self, record: DatagramRecord) -> Option<DatagramRecord> {
        let evicted = if self.queue.len() >= MAX_QUEUED_DATAGRAMS {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(record);
        evicted
    }

    pub fn pop(&mut self) -> Option<DatagramRecord> {
        self.queue.pop_front()
    }

    pub fn has_data(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Drain the whole queue, e.g. to return buffers to the pool on close.
    pub fn drain(&mut self) -> Vec<DatagramRecord> {
        self.queue.drain(..).collect()
    }
}

/// Direct-mapped UDP socket table: `sockets[port - PORT_LO]` is `Some` iff
/// that port is bound.
pub struct UdpSocketTable {
    sockets: Vec<Option<Socket>>,
}

impl Default for UdpSocketTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpSocketTable {
    pub fn new() -> Self {
        UdpSocketTable {
            sockets: (PORT_LO..PORT_HI).map(|_| None).collect(),
        }
    }

    fn index(port: u16) -> usize {
        (port as u32 - PORT_LO) as usize
    }

    /// Bind `port`, failing if it's already occupied (§4.9, §8 bind
    /// conflict, §7 kind 6).
    pub fn bind(&mut self, port: u16) -> bool {
        let idx = Self::index(port);
        if self.sockets[idx].is_some() {
            return false;
        }
        self.sockets[idx] = Some(Socket::new(port));
        true
    }

    /// Close `port`, returning any datagrams still queued so the caller can
    /// return their buffers to the pool. `None` if the port wasn't bound
    /// (§8 "idempotence of close": a second close is a well-defined no-op).
    pub fn close(&mut self, port: u16) -> Option<Vec<DatagramRecord>> {
        let idx = Self::index(port);
        self.sockets[idx].take().map(|mut s| s.drain())
    }

    pub fn get(&self, port: u16) -> Option<&Socket> {
        self.sockets[Self::index(port)].as_ref()
    }

    pub fn get_mut(&mut self, port: u16) -> Option<&mut Socket> {
        self.sockets[Self::index(port)].as_mut()
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.sockets[Self::index(port)].is_some()
    }
}
