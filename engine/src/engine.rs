//! The engine: aggregates every layer behind the public API (§4.10). One
//! `Engine` owns exactly one NIC handle and runs on exactly one thread (§5);
//! nothing here takes an internal lock.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::arp::{self, ArpCache};
use crate::buffer::{BufIdx, BufferPool};
use crate::error::{DropCounters, EngineError};
use crate::ethernet::{self, EthernetHeader};
use crate::icmp;
use crate::ipv4::{self, InterfaceConfig};
use crate::mac::MacAddress;
use crate::nic::NicDevice;
use crate::socket::{DatagramRecord, HeaderTemplate, UdpSocketTable};
use crate::udp;

/// Fixed offsets of the header stack the engine composes in place over an
/// application payload. Ethernet, then IPv4, then UDP, then payload — the
/// same layering order §1 item 3 and §4.8's egress description walk through.
pub const ETH_OFFSET: usize = 0;
pub const IP_OFFSET: usize = ethernet::HEADER_SIZE;
pub const UDP_OFFSET: usize = IP_OFFSET + ipv4::HEADER_SIZE;
pub const PAYLOAD_OFFSET: usize = UDP_OFFSET + udp::HEADER_SIZE;

/// Default ARP retry cap and per-attempt poll interval (§4.10 "~1s per
/// attempt"). Overridable via [`Engine::with_arp_retry`] so tests don't have
/// to burn real wall-clock time waiting out a timeout.
pub const DEFAULT_ARP_RETRY_CAP: u32 = 3;
pub const DEFAULT_ARP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Transport a socket table entry belongs to. `Tcp` exists so the table
/// shape matches a possible future addition (§1); no TCP state machine is
/// implemented, so binding one always fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// An opaque handle to a bound socket, returned by [`Engine::bind`]. Carries
/// the bound port; the protocol is implicit in which table it indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(u16);

pub struct Engine<N: NicDevice> {
    nic: N,
    config: InterfaceConfig,
    pool: BufferPool,
    arp: ArpCache,
    udp_sockets: UdpSocketTable,
    ip_ids: ipv4::IdGenerator,
    /// Round-robin cursor over RX rings (§5 "drained in round-robin order
    /// starting from `cur_rxr`").
    cur_rxr: u32,
    pub drops: DropCounters,
    arp_retry_cap: u32,
    arp_retry_interval: Duration,
}

impl<N: NicDevice> Engine<N> {
    /// Wrap an already-opened NIC handle. The free pool is seeded from
    /// `nic.take_extra_buffers()` — opening the device, running the
    /// registration ioctl, and granting those extra buffers is the NIC
    /// contract's job (§4.11), not the engine's.
    pub fn new(mut nic: N, config: InterfaceConfig) -> Self {
        let extra = nic.take_extra_buffers();
        let pool = BufferPool::from_extra_buffers(&extra);
        Engine {
            nic,
            config,
            pool,
            arp: ArpCache::new(),
            udp_sockets: UdpSocketTable::new(),
            ip_ids: ipv4::IdGenerator::default(),
            cur_rxr: 0,
            drops: DropCounters::default(),
            arp_retry_cap: DEFAULT_ARP_RETRY_CAP,
            arp_retry_interval: DEFAULT_ARP_RETRY_INTERVAL,
        }
    }

    pub fn with_arp_retry(mut self, cap: u32, interval: Duration) -> Self {
        self.arp_retry_cap = cap;
        self.arp_retry_interval = interval;
        self
    }

    /// Test-only escape hatch into the owned NIC handle, for an integration
    /// test to splice two engines' fake NICs together (§9.4). Never built
    /// outside `--features test-support`.
    #[cfg(feature = "test-support")]
    pub fn nic_mut(&mut self) -> &mut N {
        &mut self.nic
    }

    /// Tear down: return every pooled buffer to the NIC's free list in its
    /// own linked-list encoding, then hand back the NIC handle so the caller
    /// can unmap/close it (§3 "cleanup... must return every pool buffer to
    /// the NIC's free list... unmap memory, and close the NIC handle").
    pub fn cleanup(self) -> N {
        let Engine { mut nic, pool, .. } = self;
        pool.to_nic_freelist(&mut nic);
        nic
    }

    /// Bind `port` on `proto`. `None` on conflict (§8 bind conflict) or for
    /// `Protocol::Tcp`, which has no backing table.
    pub fn bind(&mut self, proto: Protocol, port: u16) -> Option<SocketHandle> {
        match proto {
            Protocol::Udp => self.udp_sockets.bind(port).then_some(SocketHandle(port)),
            Protocol::Tcp => None,
        }
    }

    /// Close `socket`, returning any still-queued receive buffers to the
    /// pool. A second close on the same handle is a no-op (§8 idempotence).
    pub fn close(&mut self, socket: SocketHandle) {
        if let Some(records) = self.udp_sockets.close(socket.0) {
            for r in records {
                self.pool.release_one(r.buf_idx);
            }
        }
    }

    /// Resolve `remote_ip`'s next-hop and precompute `socket`'s header
    /// template. Blocks on ARP resolution if the next-hop isn't already
    /// cached (§5 "the only blocking operation").
    pub fn connect(
        &mut self,
        socket: SocketHandle,
        remote_ip: Ipv4Addr,
        remote_port: u16,
    ) -> Result<(), EngineError> {
        let next_hop = self
            .config
            .next_hop(remote_ip)
            .ok_or(EngineError::NoGateway(remote_ip))?;
        let dst_mac = self.resolve(next_hop)?;
        if let Some(sock) = self.udp_sockets.get_mut(socket.0) {
            sock.remote = Some((remote_ip, remote_port));
            sock.header_template = Some(HeaderTemplate {
                dst_mac,
                src_mac: self.config.mac,
                src_ip: self.config.ip,
                dst_ip: remote_ip,
            });
        }
        Ok(())
    }

    /// Resolve `next_hop` to a MAC, issuing exactly one ARP request and
    /// polling up to `arp_retry_cap` times for a reply (§4.10, §8 scenario
    /// 3). Opportunistic learning from unrelated traffic can also resolve
    /// this entry mid-poll.
    fn resolve(&mut self, next_hop: Ipv4Addr) -> Result<MacAddress, EngineError> {
        if let Some(mac) = self.arp.lookup(next_hop) {
            return Ok(mac);
        }
        if !self.arp.is_pending(next_hop) {
            self.arp.mark_pending(next_hop);
            self.send_arp_request(next_hop);
            if let Err(e) = self.nic.tx_sync() {
                warn!("connect: tx_sync failed while flushing an ARP request: {e}");
            }
        }
        for _ in 0..self.arp_retry_cap {
            if self.arp_retry_interval > Duration::ZERO {
                thread::sleep(self.arp_retry_interval);
            }
            if let Err(e) = self.nic.rx_sync() {
                warn!("connect: rx_sync failed while awaiting ARP resolution: {e}");
            }
            self.drain_rx_rings();
            if let Some(mac) = self.arp.lookup(next_hop) {
                return Ok(mac);
            }
        }
        Err(EngineError::ArpTimeout(next_hop, self.arp_retry_cap))
    }

    fn send_arp_request(&mut self, target_ip: Ipv4Addr) {
        let mut scratch = [0u8; ethernet::MIN_FRAME_SIZE];
        let n = ArpCache::build_request(self.config.mac, self.config.ip, target_ip, &mut scratch);
        self.transmit_from_scratch(&scratch[..n]);
    }

    /// Allocate a fresh pool buffer, copy `frame` into it, and place it on
    /// the TX ring — for self-contained control frames (ARP) that aren't
    /// composed in place over an existing payload buffer.
    fn transmit_from_scratch(&mut self, frame: &[u8]) -> bool {
        let Some(buf_idx) = self.pool.alloc() else {
            warn!("tx: pool exhausted while building a control frame, dropping");
            return false;
        };
        self.nic.buffer_mut(buf_idx)[..frame.len()].copy_from_slice(frame);
        if self.place_in_tx_ring(buf_idx, frame.len() as u16) {
            true
        } else {
            self.pool.release_one(buf_idx);
            false
        }
    }

    /// Swap `buf_idx` into the next TX slot, returning the slot's prior
    /// buffer to the pool (§4.2, §4.8 "move the buffer index... into the
    /// next available TX slot via ring swap"). `false` if the ring has no
    /// room this sweep; the caller keeps ownership of `buf_idx`.
    fn place_in_tx_ring(&mut self, buf_idx: BufIdx, len: u16) -> bool {
        let ring = self.nic.tx_ring(0);
        if ring.is_empty() {
            return false;
        }
        let cur = ring.cur;
        let old = ring.swap(cur, buf_idx);
        ring.slot_mut(cur).len = len;
        ring.consume();
        self.pool.release_one(old);
        true
    }

    /// Allocate a buffer for the application to write an egress payload
    /// into, starting at [`PAYLOAD_OFFSET`] (the engine reserves the bytes
    /// before it for the header stack it stamps on send).
    pub fn alloc_tx_buffer(&mut self) -> Option<BufIdx> {
        self.pool.alloc()
    }

    /// Mutable view of buffer `idx`'s backing bytes, for the application to
    /// write a payload into (at [`PAYLOAD_OFFSET`]) or read a received one
    /// from.
    pub fn buffer_mut(&mut self, idx: BufIdx) -> &mut [u8] {
        self.nic.buffer_mut(idx)
    }

    /// The payload bytes of a datagram record returned by [`Engine::rx`].
    pub fn payload(&self, record: &DatagramRecord) -> &[u8] {
        let frame = self.nic.buffer(record.buf_idx);
        let start = record.payload_offset as usize;
        &frame[start..start + record.payload_len as usize]
    }

    /// Return a buffer the application is done with to the free pool
    /// (closing the "application chain" stage of the buffer's lifecycle,
    /// §3 state (iv)).
    pub fn release(&mut self, idx: BufIdx) {
        self.pool.release_one(idx);
    }

    /// Send `payloads` on `socket`: stamp UDP/IPv4/Ethernet headers over each
    /// already-resident payload buffer and place it on the TX ring. Entries
    /// that don't fit this sweep stay on `payloads` for the caller to retry
    /// (§4.10 "payloads that do not fit this sweep stay on the chain").
    pub fn tx(&mut self, socket: SocketHandle, payloads: &mut VecDeque<(BufIdx, u16)>) {
        let Some((template, local_port, remote_port)) =
            self.udp_sockets.get(socket.0).and_then(|s| {
                let template = s.header_template?;
                let (_, remote_port) = s.remote?;
                Some((template, s.local_port, remote_port))
            })
        else {
            warn!("tx: socket not connected, dropping {} payload(s)", payloads.len());
            return;
        };

        while let Some(&(buf_idx, payload_len)) = payloads.front() {
            if self.nic.tx_ring(0).is_empty() {
                break;
            }
            payloads.pop_front();
            let id = self.ip_ids.next();
            let total_len = {
                let frame = self.nic.buffer_mut(buf_idx);
                let udp_len = udp::stamp(
                    frame,
                    UDP_OFFSET,
                    local_port,
                    remote_port,
                    payload_len as usize,
                    template.src_ip,
                    template.dst_ip,
                );
                let ip_len = ipv4::stamp(
                    &mut frame[IP_OFFSET..],
                    id,
                    ipv4::DEFAULT_TTL,
                    ipv4::PROTO_UDP,
                    template.src_ip,
                    template.dst_ip,
                    udp_len,
                );
                ethernet::stamp(frame, template.dst_mac, template.src_mac, ethernet::ETHERTYPE_IPV4, ip_len)
            };
            if !self.place_in_tx_ring(buf_idx, total_len as u16) {
                // Single-threaded, so the ring shouldn't have filled between
                // the check above and here; stay defensive anyway.
                payloads.push_front((buf_idx, payload_len));
                break;
            }
        }
    }

    /// Drain every RX ring, then return the head of `socket`'s receive queue
    /// (§4.10: "drains globally... then return the head of socket's
    /// queue"). Returning `None` is normal.
    pub fn rx(&mut self, socket: SocketHandle) -> Option<DatagramRecord> {
        self.drain_rx_rings();
        self.udp_sockets.get_mut(socket.0).and_then(|s| s.pop())
    }

    /// Ask the NIC to refresh receive descriptors.
    pub fn nic_rx(&mut self) -> Result<(), EngineError> {
        Ok(self.nic.rx_sync()?)
    }

    /// Ask the NIC to drain transmit descriptors.
    pub fn nic_tx(&mut self) -> Result<(), EngineError> {
        Ok(self.nic.tx_sync()?)
    }

    /// The NIC file descriptor, suitable for an external event loop to poll
    /// for readability (§4.10). Shared by every socket on this engine —
    /// there is exactly one NIC handle per engine, not per socket.
    pub fn fd(&self, _socket: SocketHandle) -> RawFd {
        self.nic.as_raw_fd()
    }

    /// Drain every RX ring once, round-robin starting at `cur_rxr` (§5
    /// ordering guarantee), decoding and dispatching each frame.
    fn drain_rx_rings(&mut self) {
        let num_rings = self.nic.num_rx_rings();
        if num_rings == 0 {
            return;
        }
        for _ in 0..num_rings {
            let ring_idx = self.cur_rxr;
            while !self.nic.rx_ring(ring_idx).is_empty() {
                let cur = self.nic.rx_ring(ring_idx).cur;
                let (old_buf, len) = {
                    let slot = self.nic.rx_ring(ring_idx).slot(cur);
                    (slot.buf_idx, slot.len as usize)
                };
                match self.pool.alloc() {
                    Some(fresh) => {
                        let ring = self.nic.rx_ring(ring_idx);
                        ring.swap(cur, fresh);
                        ring.consume();
                        self.process_received(old_buf, len);
                    }
                    None => {
                        // Can't swap without a replacement buffer; drop the
                        // frame but still advance, or the NIC stalls (§7
                        // kind 5).
                        self.drops.pool_exhausted_on_receive += 1;
                        self.nic.rx_ring(ring_idx).consume();
                    }
                }
            }
            self.cur_rxr = (self.cur_rxr + 1) % num_rings;
        }
    }

    /// Decode and dispatch one just-detached RX buffer. Responsible for its
    /// final disposition: released to the pool, placed on the TX ring as a
    /// reply, or retained in a socket's receive queue.
    fn process_received(&mut self, buf_idx: BufIdx, len: usize) {
        let eth = {
            let frame = self.nic.buffer(buf_idx);
            EthernetHeader::parse(&frame[..len])
        };
        let Some((eth, _)) = eth else {
            self.pool.release_one(buf_idx);
            return;
        };
        if !eth.is_for_us(self.config.mac) {
            self.pool.release_one(buf_idx);
            return;
        }
        match eth.ethertype {
            ethernet::ETHERTYPE_ARP => self.handle_arp(buf_idx, len),
            ethernet::ETHERTYPE_IPV4 => self.handle_ipv4(buf_idx, len, eth),
            other => {
                self.drops.unknown_ethertype += 1;
                debug!("ethernet: unknown ethertype {other:#06x}, dropping");
                self.pool.release_one(buf_idx);
            }
        }
    }

    fn handle_arp(&mut self, buf_idx: BufIdx, len: usize) {
        let mut reply_buf = [0u8; ethernet::MIN_FRAME_SIZE];
        let mut reply_len = None;
        {
            let frame = self.nic.buffer(buf_idx);
            if let Some((eth, payload)) = EthernetHeader::parse(&frame[..len]) {
                reply_len = arp::handle_incoming(
                    &mut self.arp,
                    self.config.mac,
                    self.config.ip,
                    &eth,
                    payload,
                    &mut reply_buf,
                );
            }
        }
        self.pool.release_one(buf_idx);
        if let Some(n) = reply_len {
            self.transmit_from_scratch(&reply_buf[..n]);
        }
    }

    fn handle_ipv4(&mut self, buf_idx: BufIdx, len: usize, eth: EthernetHeader) {
        let parsed = {
            let frame = self.nic.buffer(buf_idx);
            ipv4::parse(&frame[IP_OFFSET..len]).map(|(h, payload)| (h, payload.len()))
        };
        let (header, payload_len) = match parsed {
            Ok(v) => v,
            Err(_) => {
                self.drops.bad_ip_checksum += 1;
                self.pool.release_one(buf_idx);
                return;
            }
        };
        if !self.config.accepts(header.dst) {
            self.drops.bad_ip_checksum += 1;
            self.pool.release_one(buf_idx);
            return;
        }
        if header.is_fragmented() {
            self.drops.fragmented += 1;
            self.pool.release_one(buf_idx);
            return;
        }
        match header.protocol {
            ipv4::PROTO_ICMP => self.handle_icmp(buf_idx, len, eth, header),
            ipv4::PROTO_UDP => self.handle_udp(buf_idx, len, eth, header, payload_len),
            other => {
                self.drops.unknown_ip_protocol += 1;
                debug!("ipv4: unknown protocol {other}, dropping");
                self.pool.release_one(buf_idx);
            }
        }
    }

    fn handle_icmp(&mut self, buf_idx: BufIdx, len: usize, eth: EthernetHeader, ip: ipv4::Header) {
        let icmp_len = len - UDP_OFFSET;
        let outcome = {
            let frame = self.nic.buffer_mut(buf_idx);
            icmp::handle_incoming(&mut frame[UDP_OFFSET..], icmp_len)
        };
        match outcome {
            icmp::Outcome::Reply(n) => {
                let id = self.ip_ids.next();
                let total = {
                    let frame = self.nic.buffer_mut(buf_idx);
                    let ip_len = ipv4::stamp(
                        &mut frame[IP_OFFSET..],
                        id,
                        ipv4::DEFAULT_TTL,
                        ipv4::PROTO_ICMP,
                        self.config.ip,
                        ip.src,
                        n,
                    );
                    ethernet::stamp(frame, eth.src, self.config.mac, ethernet::ETHERTYPE_IPV4, ip_len)
                };
                if !self.place_in_tx_ring(buf_idx, total as u16) {
                    self.pool.release_one(buf_idx);
                }
            }
            icmp::Outcome::BadChecksum => {
                self.drops.bad_icmp_checksum += 1;
                self.pool.release_one(buf_idx);
            }
            icmp::Outcome::Dropped => {
                self.pool.release_one(buf_idx);
            }
        }
    }

    fn handle_udp(
        &mut self,
        buf_idx: BufIdx,
        frame_len: usize,
        eth: EthernetHeader,
        ip: ipv4::Header,
        udp_segment_len: usize,
    ) {
        let parsed = {
            let frame = self.nic.buffer(buf_idx);
            let segment = &frame[UDP_OFFSET..UDP_OFFSET + udp_segment_len];
            udp::parse(segment).map(|(h, payload)| (h, payload.len()))
        };
        let Some((header, payload_len)) = parsed else {
            self.drops.bad_udp_checksum += 1;
            self.pool.release_one(buf_idx);
            return;
        };
        let checksum_ok = {
            let frame = self.nic.buffer(buf_idx);
            let segment = &frame[UDP_OFFSET..UDP_OFFSET + udp_segment_len];
            udp::validate_checksum(segment, header.length, ip.src, ip.dst)
        };
        if !checksum_ok {
            self.drops.bad_udp_checksum += 1;
            self.pool.release_one(buf_idx);
            return;
        }
        if !self.udp_sockets.is_bound(header.dst_port) {
            if ip.dst == self.config.ip {
                self.send_port_unreachable(buf_idx, frame_len, eth, ip);
            } else {
                self.pool.release_one(buf_idx);
            }
            return;
        }
        let record = DatagramRecord {
            buf_idx,
            payload_offset: (UDP_OFFSET + udp::HEADER_SIZE) as u16,
            payload_len: payload_len as u16,
            src_ip: ip.src,
            src_port: header.src_port,
        };
        if let Some(sock) = self.udp_sockets.get_mut(header.dst_port) {
            if let Some(evicted) = sock.enqueue(record) {
                self.pool.release_one(evicted.buf_idx);
            }
        }
    }

    /// Build and send an ICMP port-unreachable in reply to the UDP datagram
    /// in `buf_idx` (§4.6/§4.8, §8 scenario 4). Reuses the same buffer: the
    /// offending IP header + UDP header (exactly 8 bytes, satisfying RFC
    /// 792's "IP header + 8 bytes") already sit at [`IP_OFFSET`], and the
    /// reply's own Ethernet/IP/ICMP headers are stamped in front of them.
    fn send_port_unreachable(&mut self, buf_idx: BufIdx, frame_len: usize, eth: EthernetHeader, ip: ipv4::Header) {
        let offending_len = (frame_len - IP_OFFSET).min(ipv4::HEADER_SIZE + 8);
        let icmp_len = {
            let frame = self.nic.buffer_mut(buf_idx);
            icmp::build_dest_unreachable(frame, UDP_OFFSET, IP_OFFSET, offending_len, icmp::CODE_PORT_UNREACHABLE)
        };
        let id = self.ip_ids.next();
        let total = {
            let frame = self.nic.buffer_mut(buf_idx);
            let ip_len = ipv4::stamp(
                &mut frame[IP_OFFSET..],
                id,
                ipv4::DEFAULT_TTL,
                ipv4::PROTO_ICMP,
                self.config.ip,
                ip.src,
                icmp_len,
            );
            ethernet::stamp(frame, eth.src, self.config.mac, ethernet::ETHERTYPE_IPV4, ip_len)
        };
        self.drops.port_unreachable_sent += 1;
        if !self.place_in_tx_ring(buf_idx, total as u16) {
            self.pool.release_one(buf_idx);
        }
    }
}
