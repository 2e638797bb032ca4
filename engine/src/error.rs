//! Ambient error types and protocol-drop accounting. Public API failures use
//! [`EngineError`]; everything the error taxonomy calls a protocol drop
//! (§7 kind 2) is counted in [`DropCounters`] and logged instead, matching
//! the taxonomy's "drops are never fatal, never surfaced as `Err`" rule.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::nic::NicError;

/// Failures visible to the embedder. Only initialization and explicit API
/// misuse reach this type (§7: "only initialization and explicit API errors
/// are visible to the caller").
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("NIC initialization failed: {0}")]
    Nic(#[from] NicError),
    #[error("ARP resolution for {0} timed out after {1} attempts")]
    ArpTimeout(Ipv4Addr, u32),
    #[error("no default gateway configured for off-link destination {0}")]
    NoGateway(Ipv4Addr),
    #[error("port {0} is already bound")]
    PortInUse(u16),
    #[error("socket is not bound to a remote endpoint")]
    NotConnected,
    #[error("port {0} is outside the configured [{1}, {2}) range")]
    PortOutOfRange(u16, u16, u16),
}

/// One counter per class of silent protocol drop. The engine increments
/// these instead of returning an error (§7 kinds 2, 3, 5); tests assert
/// against the counters directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropCounters {
    /// Any basic IPv4 header validation failure: bad version/IHL, a
    /// checksum mismatch, a total-length that doesn't fit the frame, or a
    /// destination that isn't ours (§4.6 lumps all of these under one
    /// "reject silently with a checksum counter increment" disposition).
    pub bad_ip_checksum: u64,
    pub bad_icmp_checksum: u64,
    pub bad_udp_checksum: u64,
    pub unknown_ethertype: u64,
    pub unknown_ip_protocol: u64,
    pub fragmented: u64,
    pub pool_exhausted_on_receive: u64,
    pub port_unreachable_sent: u64,
}
