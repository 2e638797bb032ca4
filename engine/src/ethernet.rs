//! Ethernet layer: EtherType demultiplexing, MAC filtering, and frame
//! construction (§4.5).

use crate::mac::MacAddress;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Smallest frame a conforming NIC will put on the wire; shorter payloads
/// are zero-padded on egress.
pub const MIN_FRAME_SIZE: usize = 60;
pub const HEADER_SIZE: usize = 14;

/// A parsed Ethernet header plus a view of what follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub ethertype: u16,
}

impl EthernetHeader {
    /// Parse the leading 14 bytes of `frame`. Returns the header and the
    /// remaining payload slice, or `None` if `frame` is too short to hold a
    /// header at all.
    pub fn parse(frame: &[u8]) -> Option<(Self, &[u8])> {
        if frame.len() < HEADER_SIZE {
            return None;
        }
        let dst = MacAddress::new(frame[0..6].try_into().unwrap());
        let src = MacAddress::new(frame[6..12].try_into().unwrap());
        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        Some((
            EthernetHeader {
                dst,
                src,
                ethertype,
            },
            &frame[HEADER_SIZE..],
        ))
    }

    /// True if a host whose address is `local` should accept this frame:
    /// addressed to it directly, or broadcast.
    pub fn is_for_us(&self, local: MacAddress) -> bool {
        self.dst == local || self.dst.is_broadcast()
    }

    /// Write the 14-byte header into `out[..HEADER_SIZE]`. Panics if `out`
    /// is shorter than `HEADER_SIZE`, same as any other fixed-header writer
    /// in this crate.
    pub fn write(&self, out: &mut [u8]) {
        out[0..6].copy_from_slice(self.dst.as_bytes());
        out[6..12].copy_from_slice(self.src.as_bytes());
        out[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }
}

/// Assemble a full frame (header + payload) into `out`, zero-padding up to
/// [`MIN_FRAME_SIZE`] when the payload is short. Returns the total frame
/// length written. For small self-contained packets (ARP) built into a
/// scratch buffer; egress over an already-resident payload should use
/// [`stamp`] instead to avoid a redundant copy.
pub fn build_frame(
    dst: MacAddress,
    src: MacAddress,
    ethertype: u16,
    payload: &[u8],
    out: &mut [u8],
) -> usize {
    let hdr = EthernetHeader {
        dst,
        src,
        ethertype,
    };
    hdr.write(&mut out[..HEADER_SIZE]);
    out[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
    let written = HEADER_SIZE + payload.len();
    let total = written.max(MIN_FRAME_SIZE);
    if total > written {
        out[written..total].fill(0);
    }
    total
}

/// Stamp a header in place at the front of `frame`, over a payload of
/// `payload_len` bytes already resident at `frame[HEADER_SIZE..]` (the IPv4
/// datagram an egress socket already composed there). Returns the total
/// frame length.
pub fn stamp(
    frame: &mut [u8],
    dst: MacAddress,
    src: MacAddress,
    ethertype: u16,
    payload_len: usize,
) -> usize {
    let hdr = EthernetHeader {
        dst,
        src,
        ethertype,
    };
    hdr.write(&mut frame[..HEADER_SIZE]);
    let written = HEADER_SIZE + payload_len;
    let total = written.max(MIN_FRAME_SIZE);
    if total > written {
        frame[written..total].fill(0);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b0: u8) -> MacAddress {
        MacAddress::new([b0, 0, 0, 0, 0, 1])
    }

    #[test]
    fn parse_round_trips_with_build() {
        let mut buf = [0u8; 128];
        let payload = [1, 2, 3, 4];
        let n = build_frame(mac(1), mac(2), ETHERTYPE_IPV4, &payload, &mut buf);
        assert_eq!(n, MIN_FRAME_SIZE);
        let (hdr, rest) = EthernetHeader::parse(&buf[..n]).unwrap();
        assert_eq!(hdr.dst, mac(1));
        assert_eq!(hdr.src, mac(2));
        assert_eq!(hdr.ethertype, ETHERTYPE_IPV4);
        assert_eq!(&rest[..4], &payload);
    }

    #[test]
    fn short_payload_pads_to_min_frame_size() {
        let mut buf = [0xAAu8; 128];
        let n = build_frame(mac(1), mac(2), ETHERTYPE_ARP, &[9, 9], &mut buf);
        assert_eq!(n, MIN_FRAME_SIZE);
        assert_eq!(buf[HEADER_SIZE + 2], 0);
    }

    #[test]
    fn stamp_writes_header_over_resident_payload() {
        let mut buf = [0u8; 128];
        buf[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&[9, 9, 9, 9]);
        let n = stamp(&mut buf, mac(1), mac(2), ETHERTYPE_IPV4, 4);
        assert_eq!(n, MIN_FRAME_SIZE);
        let (hdr, rest) = EthernetHeader::parse(&buf[..n]).unwrap();
        assert_eq!(hdr.dst, mac(1));
        assert_eq!(&rest[..4], &[9, 9, 9, 9]);
    }

    #[test]
    fn oversized_payload_is_not_truncated() {
        let mut buf = [0u8; 2048];
        let payload = vec![7u8; 1500];
        let n = build_frame(mac(1), mac(2), ETHERTYPE_IPV4, &payload, &mut buf);
        assert_eq!(n, HEADER_SIZE + 1500);
    }

    #[test]
    fn is_for_us_accepts_unicast_and_broadcast_only() {
        let us = mac(1);
        let other = mac(2);
        let unicast = EthernetHeader {
            dst: us,
            src: other,
            ethertype: ETHERTYPE_IPV4,
        };
        assert!(unicast.is_for_us(us));
        assert!(!unicast.is_for_us(other));

        let broadcast = EthernetHeader {
            dst: MacAddress::BROADCAST,
            src: other,
            ethertype: ETHERTYPE_ARP,
        };
        assert!(broadcast.is_for_us(us));
    }

    #[test]
    fn parse_rejects_short_buffer() {
        let buf = [0u8; 10];
        assert!(EthernetHeader::parse(&buf).is_none());
    }
}
