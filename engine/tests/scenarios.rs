//! End-to-end coverage of the six concrete scenarios, driven entirely
//! through the public API plus the `test-support`-gated `FakeNic`/`nic_mut`
//! escape hatch. Each test stands up one or two complete engines rather than
//! poking at a single layer in isolation.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::Duration;

use ringcore::engine::{Engine, Protocol, IP_OFFSET, PAYLOAD_OFFSET, UDP_OFFSET};
use ringcore::{arp::ArpCache, checksum, ethernet, icmp, ipv4, udp};
use ringcore::{EngineError, FakeNic, InterfaceConfig, MacAddress};

fn config(ip: Ipv4Addr, mac: MacAddress) -> InterfaceConfig {
    InterfaceConfig {
        ip,
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        mac,
        gateway: None,
    }
}

fn engine(ip: Ipv4Addr, mac: MacAddress) -> Engine<FakeNic> {
    Engine::new(FakeNic::new(64, 8), config(ip, mac)).with_arp_retry(3, Duration::ZERO)
}

/// Teach `target` the `from_ip -> from_mac` mapping by delivering a real ARP
/// request over its wire and letting opportunistic learning do the rest —
/// the same mechanism scenario 3's "ARP opportunism" property exercises, but
/// reached here through the public surface instead of a private cache field.
fn seed_arp(target: &mut Engine<FakeNic>, observer: ringcore::SocketHandle, from_ip: Ipv4Addr, from_mac: MacAddress, target_ip: Ipv4Addr) {
    let mut buf = [0u8; ethernet::MIN_FRAME_SIZE];
    let n = ArpCache::build_request(from_mac, from_ip, target_ip, &mut buf);
    target.nic_mut().deliver(&buf[..n]);
    let _ = target.rx(observer);
}

fn mac(b: u8) -> MacAddress {
    MacAddress::new([b, 0, 0, 0, 0, 1])
}

#[test]
fn scenario_1_icmp_echo_request_becomes_reply() {
    let local_ip = Ipv4Addr::new(10, 0, 0, 1);
    let local_mac = mac(1);
    let peer_mac = mac(9);
    let mut e = engine(local_ip, local_mac);

    // 56-byte "abcdefg...wxyz" ping payload, the classic default-size pattern.
    let payload: Vec<u8> = (b'a'..=b'z').cycle().take(56).collect();
    assert_eq!(payload.len() + icmp::HEADER_SIZE + ipv4::HEADER_SIZE + ethernet::HEADER_SIZE, 98);

    let mut icmp_buf = vec![0u8; icmp::HEADER_SIZE + payload.len()];
    icmp_buf[0] = icmp::TYPE_ECHO_REQUEST;
    icmp_buf[1] = 0;
    icmp_buf[4..6].copy_from_slice(&0x0001u16.to_be_bytes());
    icmp_buf[6..8].copy_from_slice(&0x0002u16.to_be_bytes());
    icmp_buf[icmp::HEADER_SIZE..].copy_from_slice(&payload);
    let cksum = checksum::internet_checksum(&icmp_buf);
    icmp_buf[2..4].copy_from_slice(&cksum.to_be_bytes());

    let mut frame = vec![0u8; ethernet::HEADER_SIZE + ipv4::HEADER_SIZE + icmp_buf.len()];
    frame[IP_OFFSET + ipv4::HEADER_SIZE..].copy_from_slice(&icmp_buf);
    let ip_len = ipv4::stamp(
        &mut frame[IP_OFFSET..],
        7,
        ipv4::DEFAULT_TTL,
        ipv4::PROTO_ICMP,
        Ipv4Addr::new(10, 0, 0, 9),
        local_ip,
        icmp_buf.len(),
    );
    let total = ethernet::stamp(&mut frame, local_mac, peer_mac, ethernet::ETHERTYPE_IPV4, ip_len);
    assert_eq!(total, 98);

    e.nic_mut().deliver(&frame[..total]);
    e.nic_rx().unwrap();
    let s = e.bind(Protocol::Udp, 1).unwrap(); // unrelated socket, just to trigger a drain via rx()
    let _ = e.rx(s);
    e.nic_tx().unwrap();

    let (out_idx, out_len) = e.nic_mut().outbox.pop_front().expect("an echo reply was transmitted");
    let reply = e.nic_mut().buffer(out_idx)[..out_len as usize].to_vec();
    assert_eq!(reply.len(), 98);

    let (reply_eth, ip_bytes) = ethernet::EthernetHeader::parse(&reply).unwrap();
    assert_eq!(reply_eth.dst, peer_mac);
    assert_eq!(reply_eth.src, local_mac);
    let (reply_ip, icmp_bytes) = ipv4::parse(ip_bytes).unwrap();
    assert_eq!(reply_ip.src, local_ip);
    assert_eq!(reply_ip.dst, Ipv4Addr::new(10, 0, 0, 9));
    assert_eq!(reply_ip.id, 0);
    assert_eq!(icmp_bytes[0], icmp::TYPE_ECHO_REPLY);
    assert_eq!(checksum::internet_checksum(icmp_bytes), 0);
    assert_eq!(&icmp_bytes[4..6], &0x0001u16.to_be_bytes());
    assert_eq!(&icmp_bytes[6..8], &0x0002u16.to_be_bytes());
    assert_eq!(&icmp_bytes[icmp::HEADER_SIZE..], &payload[..]);
}

#[test]
fn scenario_2_udp_loopback_between_two_engines() {
    let ip_a = Ipv4Addr::new(10, 0, 0, 1);
    let ip_b = Ipv4Addr::new(10, 0, 0, 2);
    let mac_a = mac(1);
    let mac_b = mac(2);

    let mut a = engine(ip_a, mac_a);
    let mut b = engine(ip_b, mac_b);
    let sa = a.bind(Protocol::Udp, 7).unwrap();
    let sb = b.bind(Protocol::Udp, 7).unwrap();

    seed_arp(&mut a, sa, ip_b, mac_b, ip_a);
    seed_arp(&mut b, sb, ip_a, mac_a, ip_b);
    a.connect(sa, ip_b, 7).unwrap();
    b.connect(sb, ip_a, 7).unwrap();

    let buf_idx = b.alloc_tx_buffer().unwrap();
    b.buffer_mut(buf_idx)[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 5].copy_from_slice(b"hello");
    let mut payloads = VecDeque::new();
    payloads.push_back((buf_idx, 5u16));
    b.tx(sb, &mut payloads);
    assert!(payloads.is_empty());
    b.nic_tx().unwrap();

    let (idx, len) = b.nic_mut().outbox.pop_front().expect("b transmitted a frame");
    let bytes = b.nic_mut().buffer(idx)[..len as usize].to_vec();
    assert_eq!(&bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 5], b"hello");
    a.nic_mut().deliver(&bytes);
    a.nic_rx().unwrap();

    let record = a.rx(sa).expect("a receives the datagram");
    assert_eq!(record.src_ip, ip_b);
    assert_eq!(record.src_port, 7);
    assert_eq!(a.payload(&record), &[0x68, 0x65, 0x6c, 0x6c, 0x6f]);
    a.release(record.buf_idx);
}

#[test]
fn scenario_3_arp_blocking_connect_times_out() {
    let ip_b = Ipv4Addr::new(10, 0, 0, 2);
    let unbound_target = Ipv4Addr::new(10, 0, 0, 9);
    let mut b = engine(ip_b, mac(2));
    let s = b.bind(Protocol::Udp, 7).unwrap();

    let err = b.connect(s, unbound_target, 7).unwrap_err();
    assert!(matches!(err, EngineError::ArpTimeout(ip, 3) if ip == unbound_target));

    let (idx, len) = b.nic_mut().outbox.pop_front().expect("b emitted an ARP request");
    let frame = b.nic_mut().buffer(idx)[..len as usize].to_vec();
    let (eth, payload) = ethernet::EthernetHeader::parse(&frame).unwrap();
    assert_eq!(eth.dst, MacAddress::BROADCAST);
    let arp_pkt = ringcore::arp::ArpPacket::parse(payload).unwrap();
    assert_eq!(arp_pkt.op, ringcore::arp::OP_REQUEST);
    assert_eq!(arp_pkt.target_ip, unbound_target);
}

#[test]
fn scenario_4_port_unreachable_for_unbound_destination() {
    let ip_a = Ipv4Addr::new(10, 0, 0, 1);
    let ip_b = Ipv4Addr::new(10, 0, 0, 2);
    let mac_a = mac(1);
    let mac_b = mac(2);

    let mut a = engine(ip_a, mac_a);
    let mut b = engine(ip_b, mac_b);
    let sb = b.bind(Protocol::Udp, 5000).unwrap();
    seed_arp(&mut b, sb, ip_a, mac_a, ip_b);
    b.connect(sb, ip_a, 9999).unwrap();

    let buf_idx = b.alloc_tx_buffer().unwrap();
    b.buffer_mut(buf_idx)[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 3].copy_from_slice(b"hey");
    let mut payloads = VecDeque::new();
    payloads.push_back((buf_idx, 3u16));
    b.tx(sb, &mut payloads);
    b.nic_tx().unwrap();

    let (idx, len) = b.nic_mut().outbox.pop_front().unwrap();
    let bytes = b.nic_mut().buffer(idx)[..len as usize].to_vec();
    a.nic_mut().deliver(&bytes);
    a.nic_rx().unwrap();
    let sa = a.bind(Protocol::Udp, 1).unwrap();
    let _ = a.rx(sa);
    assert_eq!(a.drops.port_unreachable_sent, 1);

    a.nic_tx().unwrap();
    let (ridx, rlen) = a.nic_mut().outbox.pop_front().expect("a replied with port-unreachable");
    let reply = a.nic_mut().buffer(ridx)[..rlen as usize].to_vec();
    let (reply_eth, ip_bytes) = ethernet::EthernetHeader::parse(&reply).unwrap();
    assert_eq!(reply_eth.dst, mac_b);
    let (reply_ip, icmp_bytes) = ipv4::parse(ip_bytes).unwrap();
    assert_eq!(reply_ip.protocol, ipv4::PROTO_ICMP);
    assert_eq!(icmp_bytes[0], icmp::TYPE_DEST_UNREACHABLE);
    assert_eq!(icmp_bytes[1], icmp::CODE_PORT_UNREACHABLE);

    // The carried payload starts with the offending IP header, exactly as
    // the original datagram left B's wire.
    let offending_ip = &bytes[IP_OFFSET..IP_OFFSET + ipv4::HEADER_SIZE];
    assert_eq!(&icmp_bytes[icmp::HEADER_SIZE..icmp::HEADER_SIZE + ipv4::HEADER_SIZE], offending_ip);
    let offending_udp_first8 = &bytes[UDP_OFFSET..UDP_OFFSET + 8];
    assert_eq!(
        &icmp_bytes[icmp::HEADER_SIZE + ipv4::HEADER_SIZE..icmp::HEADER_SIZE + ipv4::HEADER_SIZE + 8],
        offending_udp_first8
    );
}

#[test]
fn scenario_5_fragmented_datagram_is_dropped_and_counted() {
    let ip_a = Ipv4Addr::new(10, 0, 0, 1);
    let mut a = engine(ip_a, mac(1));

    let mut frame = vec![0u8; ethernet::MIN_FRAME_SIZE];
    let n = ipv4::stamp(
        &mut frame[IP_OFFSET..],
        1,
        ipv4::DEFAULT_TTL,
        ipv4::PROTO_UDP,
        Ipv4Addr::new(10, 0, 0, 9),
        ip_a,
        4,
    );
    // Set the MF bit, then restamp the checksum the initial stamp() call
    // already computed over the unfragmented flags field.
    frame[IP_OFFSET + 6..IP_OFFSET + 8].copy_from_slice(&0x2000u16.to_be_bytes());
    frame[IP_OFFSET + 10..IP_OFFSET + 12].copy_from_slice(&[0, 0]);
    let cksum = checksum::internet_checksum(&frame[IP_OFFSET..IP_OFFSET + ipv4::HEADER_SIZE]);
    frame[IP_OFFSET + 10..IP_OFFSET + 12].copy_from_slice(&cksum.to_be_bytes());
    ethernet::stamp(&mut frame, mac(1), mac(9), ethernet::ETHERTYPE_IPV4, n);
    let total = IP_OFFSET + n;

    a.nic_mut().deliver(&frame[..total]);
    a.nic_rx().unwrap();
    let s = a.bind(Protocol::Udp, 1).unwrap();
    assert!(a.rx(s).is_none());
    assert_eq!(a.drops.fragmented, 1);
}

#[test]
fn scenario_6_bind_conflict_leaves_first_socket_usable() {
    let mut e = engine(Ipv4Addr::new(10, 0, 0, 1), mac(1));
    let s1 = e.bind(Protocol::Udp, 1234).expect("first bind succeeds");
    assert!(e.bind(Protocol::Udp, 1234).is_none(), "second bind on the same port must fail");

    // The first socket is still fully usable: a datagram addressed to it
    // still gets queued and can be popped.
    seed_arp(&mut e, s1, Ipv4Addr::new(10, 0, 0, 9), mac(9), Ipv4Addr::new(10, 0, 0, 1));
    let peer_ip = Ipv4Addr::new(10, 0, 0, 9);
    let local_ip = Ipv4Addr::new(10, 0, 0, 1);
    let mut frame = vec![0u8; ethernet::MIN_FRAME_SIZE];
    frame[UDP_OFFSET + udp::HEADER_SIZE..UDP_OFFSET + udp::HEADER_SIZE + 3].copy_from_slice(b"hi!");
    let udp_len = udp::stamp(&mut frame, UDP_OFFSET, 9001, 1234, 3, peer_ip, local_ip);
    let ip_len = ipv4::stamp(
        &mut frame[IP_OFFSET..],
        1,
        ipv4::DEFAULT_TTL,
        ipv4::PROTO_UDP,
        Ipv4Addr::new(10, 0, 0, 9),
        Ipv4Addr::new(10, 0, 0, 1),
        udp_len,
    );
    let total = ethernet::stamp(&mut frame, mac(1), mac(9), ethernet::ETHERTYPE_IPV4, ip_len);

    e.nic_mut().deliver(&frame[..total]);
    e.nic_rx().unwrap();
    let record = e.rx(s1).expect("first socket still receives datagrams after the conflicting bind");
    assert_eq!(e.payload(&record), b"hi!");
    e.release(record.buf_idx);
    e.close(s1);
    e.close(s1); // idempotent
}
