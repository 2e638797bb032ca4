//! A user-space networking engine that drives a NIC directly through
//! memory-mapped descriptor rings, bypassing the host kernel's protocol
//! stack for Ethernet/ARP/IPv4/ICMP/UDP traffic.
//!
//! The crate is organized leaf-first, mirroring the component breakdown: the
//! frame pool and ring view sit at the bottom, the protocol layers (ARP,
//! Ethernet, IPv4, ICMP, UDP) build on them, and [`engine::Engine`]
//! aggregates everything behind the public API. [`nic::NicDevice`] is the
//! contract the engine is generic over; [`nic::netmap`] is this crate's one
//! concrete backend, and a `#[cfg(test)]`-only fake backend lives alongside
//! it for the test suite.

pub mod arp;
pub mod buffer;
pub mod checksum;
pub mod engine;
pub mod error;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod mac;
pub mod nic;
pub mod ring;
pub mod socket;
pub mod udp;

pub use engine::{Engine, Protocol, SocketHandle};
pub use error::{DropCounters, EngineError};
pub use ipv4::InterfaceConfig;
pub use mac::MacAddress;
pub use nic::{NicDevice, NicError};

/// Only built with `--features test-support`, for the integration suite
/// under `tests/` to drive two engines against each other without a real
/// NIC (§9.4).
#[cfg(feature = "test-support")]
pub use nic::fake::FakeNic;
