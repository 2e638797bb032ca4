//! ICMP layer: Echo Reply and Destination Unreachable (§4.7).

use log::debug;

use crate::checksum;
use crate::ipv4;

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_ECHO_REQUEST: u8 = 8;
pub const TYPE_DEST_UNREACHABLE: u8 = 3;
pub const CODE_HOST_UNREACHABLE: u8 = 1;
pub const CODE_PORT_UNREACHABLE: u8 = 3;

/// type + code + checksum + the 4-byte "rest of header" (echo id/seq, or
/// unused for Destination Unreachable).
pub const HEADER_SIZE: usize = 8;

/// Result of dispatching one inbound ICMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `buf[..len]` now holds the reply frame to hand to the TX path.
    Reply(usize),
    /// Checksum failed; caller should bump `DropCounters::bad_icmp_checksum`.
    BadChecksum,
    /// Valid but not a type we answer (§9: logged and dropped, never abort).
    Dropped,
}

/// Validate and dispatch an inbound ICMP message living at `buf[..len]`. An
/// Echo Request is rewritten into its Echo Reply in place, reusing the same
/// buffer as the reference codebase's in-place transform does.
pub fn handle_incoming(buf: &mut [u8], len: usize) -> Outcome {
    if len < HEADER_SIZE {
        return Outcome::Dropped;
    }
    if checksum::internet_checksum(&buf[..len]) != 0 {
        return Outcome::BadChecksum;
    }
    match buf[0] {
        TYPE_ECHO_REQUEST => {
            transform_echo_reply(&mut buf[..len]);
            Outcome::Reply(len)
        }
        other => {
            debug!("icmp: unhandled type {other}, dropping");
            Outcome::Dropped
        }
    }
}

/// Rewrite a (caller-validated) Echo Request into an Echo Reply: flip the
/// type, zero then recompute the checksum. Identifier/sequence/payload are
/// untouched, so the reply is byte-identical in length to the request.
fn transform_echo_reply(buf: &mut [u8]) {
    buf[0] = TYPE_ECHO_REPLY;
    buf[2..4].copy_from_slice(&[0, 0]);
    let cksum = checksum::internet_checksum(buf);
    buf[2..4].copy_from_slice(&cksum.to_be_bytes());
}

/// Build a Destination Unreachable message in place within `frame`. The
/// offending IP datagram (the frame being answered) is assumed to already
/// sit at `frame[offending_offset..]` for at least `offending_len` bytes;
/// the message itself is written starting at `icmp_offset`, which may be
/// different (a reply wraps the offending bytes in a fresh Ethernet+IP
/// header pair ahead of where the original datagram started). The carried
/// payload is the offending IP header plus its first 8 bytes of transport
/// data (RFC 792); the 4-byte ICMP-unused field is zero (no RFC 4884
/// extension, §4.7). Returns the ICMP message length (header + carried
/// bytes).
///
/// Source and destination ranges can overlap — the carried bytes shift to
/// make room for the header in front of them — so this uses `copy_within`
/// the same way the reference codebase reaches for `memmove` for this exact
/// construction.
pub fn build_dest_unreachable(
    frame: &mut [u8],
    icmp_offset: usize,
    offending_offset: usize,
    offending_len: usize,
    code: u8,
) -> usize {
    let carry_len = (ipv4::HEADER_SIZE + 8).min(offending_len);
    frame.copy_within(
        offending_offset..offending_offset + carry_len,
        icmp_offset + HEADER_SIZE,
    );
    let h = icmp_offset;
    frame[h] = TYPE_DEST_UNREACHABLE;
    frame[h + 1] = code;
    frame[h + 2..h + 4].copy_from_slice(&[0, 0]);
    frame[h + 4..h + 8].copy_from_slice(&[0, 0, 0, 0]);
    let total = HEADER_SIZE + carry_len;
    let cksum = checksum::internet_checksum(&frame[h..h + total]);
    frame[h + 2..h + 4].copy_from_slice(&cksum.to_be_bytes());
    total
}
