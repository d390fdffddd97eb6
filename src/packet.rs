//! ICMP echo message building and parsing.

use std::fmt;

use crate::error::WatchError;

/// Fixed ICMP header length for echo request/reply.
pub const ICMP_HEADER_LEN: usize = 8;

pub const ECHO_REQUEST_V4: u8 = 8;
pub const ECHO_REPLY_V4: u8 = 0;
pub const ECHO_REQUEST_V6: u8 = 128;
pub const ECHO_REPLY_V6: u8 = 129;

/// Classified ICMP message type. Anything a prober does not send itself and
/// cannot interpret as a reply lands in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpKind {
    EchoReply,
    EchoRequest,
    DestinationUnreachable,
    TimeExceeded,
    Other(u8),
}

impl IcmpKind {
    pub fn classify(ty: u8, v4: bool) -> Self {
        if v4 {
            match ty {
                ECHO_REPLY_V4 => IcmpKind::EchoReply,
                ECHO_REQUEST_V4 => IcmpKind::EchoRequest,
                3 => IcmpKind::DestinationUnreachable,
                11 => IcmpKind::TimeExceeded,
                t => IcmpKind::Other(t),
            }
        } else {
            match ty {
                ECHO_REPLY_V6 => IcmpKind::EchoReply,
                ECHO_REQUEST_V6 => IcmpKind::EchoRequest,
                1 => IcmpKind::DestinationUnreachable,
                3 => IcmpKind::TimeExceeded,
                t => IcmpKind::Other(t),
            }
        }
    }
}

impl fmt::Display for IcmpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpKind::EchoReply => write!(f, "echo reply"),
            IcmpKind::EchoRequest => write!(f, "echo request"),
            IcmpKind::DestinationUnreachable => write!(f, "destination unreachable"),
            IcmpKind::TimeExceeded => write!(f, "time exceeded"),
            IcmpKind::Other(t) => write!(f, "icmp type {}", t),
        }
    }
}

/// Outbound echo request. The payload is `size` filler bytes; its content
/// does not matter, only its length does for round-trip realism.
#[derive(Debug, Clone, Copy)]
pub struct EchoRequest {
    pub ident: u16,
    pub seq: u16,
    pub size: usize,
}

impl EchoRequest {
    /// Serialize to wire format. The checksum is filled in for IPv4; for
    /// ICMPv6 the kernel computes it over the pseudo-header on send.
    pub fn encode(&self, v4: bool) -> Vec<u8> {
        let mut buf = vec![0u8; ICMP_HEADER_LEN + self.size];
        buf[0] = if v4 { ECHO_REQUEST_V4 } else { ECHO_REQUEST_V6 };
        buf[1] = 0; // code
        buf[4..6].copy_from_slice(&self.ident.to_be_bytes());
        buf[6..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[ICMP_HEADER_LEN..].fill(b'a');
        if v4 {
            let sum = checksum(&buf);
            buf[2..4].copy_from_slice(&sum.to_be_bytes());
        }
        buf
    }
}

/// Parsed inbound ICMP message. `ident` and `seq` hold the echo fields and
/// are only meaningful when `kind` is an echo message.
#[derive(Debug, Clone, Copy)]
pub struct Message {
    pub kind: IcmpKind,
    pub code: u8,
    pub ident: u16,
    pub seq: u16,
    pub payload_len: usize,
}

impl Message {
    pub fn parse(buf: &[u8], v4: bool) -> Result<Self, WatchError> {
        if buf.len() < ICMP_HEADER_LEN {
            return Err(WatchError::Decode(format!(
                "reply too short: {} bytes, want at least {}",
                buf.len(),
                ICMP_HEADER_LEN
            )));
        }
        Ok(Self {
            kind: IcmpKind::classify(buf[0], v4),
            code: buf[1],
            ident: u16::from_be_bytes([buf[4], buf[5]]),
            seq: u16::from_be_bytes([buf[6], buf[7]]),
            payload_len: buf.len() - ICMP_HEADER_LEN,
        })
    }
}

/// RFC 1071 internet checksum: one's-complement sum of big-endian 16-bit
/// words with end-around carry, complemented. An odd trailing byte counts as
/// the high byte of a final word.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_payload_lengths() {
        let zero = EchoRequest { ident: 1, seq: 0, size: 0 }.encode(true);
        assert_eq!(zero.len(), ICMP_HEADER_LEN);

        let filled = EchoRequest { ident: 1, seq: 0, size: 32 }.encode(true);
        assert_eq!(filled.len(), ICMP_HEADER_LEN + 32);
        assert!(filled[ICMP_HEADER_LEN..].iter().all(|&b| b == b'a'));
    }

    #[test]
    fn encode_wire_layout() {
        let buf = EchoRequest { ident: 0x1234, seq: 0x0001, size: 0 }.encode(true);
        assert_eq!(buf[0], ECHO_REQUEST_V4);
        assert_eq!(buf[1], 0);
        assert_eq!(&buf[4..6], &[0x12, 0x34]);
        assert_eq!(&buf[6..8], &[0x00, 0x01]);
        // words 0x0800 + 0x1234 + 0x0001 = 0x1A35, complement 0xE5CA
        assert_eq!(&buf[2..4], &[0xE5, 0xCA]);

        let v6 = EchoRequest { ident: 0x1234, seq: 0x0001, size: 0 }.encode(false);
        assert_eq!(v6[0], ECHO_REQUEST_V6);
        // checksum left for the kernel
        assert_eq!(&v6[2..4], &[0, 0]);
    }

    #[test]
    fn encoded_packet_checksums_to_zero() {
        let buf = EchoRequest { ident: 0xBEEF, seq: 7, size: 13 }.encode(true);
        // re-summing a packet with a valid checksum in place yields zero
        assert_eq!(checksum(&buf), 0);
    }

    #[test]
    fn parse_round_trips_echo_fields() {
        let mut buf = EchoRequest { ident: 0xABCD, seq: 3, size: 4 }.encode(true);
        buf[0] = ECHO_REPLY_V4;
        let msg = Message::parse(&buf, true).unwrap();
        assert_eq!(msg.kind, IcmpKind::EchoReply);
        assert_eq!(msg.ident, 0xABCD);
        assert_eq!(msg.seq, 3);
        assert_eq!(msg.payload_len, 4);
    }

    #[test]
    fn parse_rejects_short_input() {
        let err = Message::parse(&[0, 0, 0], true).unwrap_err();
        assert!(matches!(err, WatchError::Decode(_)));
    }

    #[test]
    fn classify_non_echo_types() {
        assert_eq!(IcmpKind::classify(3, true), IcmpKind::DestinationUnreachable);
        assert_eq!(IcmpKind::classify(11, true), IcmpKind::TimeExceeded);
        assert_eq!(IcmpKind::classify(42, true), IcmpKind::Other(42));
        assert_eq!(IcmpKind::classify(129, false), IcmpKind::EchoReply);
        assert_eq!(IcmpKind::classify(1, false), IcmpKind::DestinationUnreachable);
    }
}
