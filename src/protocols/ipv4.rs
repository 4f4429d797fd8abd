//! Just enough of the [Internet Protocol](https://www.rfc-editor.org/rfc/rfc791)
//! to carry TCP segments through the hosting simulator.
//!
//! The engine neither fragments nor routes; options are not produced and not
//! accepted. What remains is the 20-byte header with a valid checksum.

use super::tcp::Segment;
use super::utility::{Checksum, Endpoint, Endpoints};
use crate::Message;
use std::fmt::{self, Display};
use thiserror::Error as ThisError;

/// The number of bytes in a basic IPv4 header
const BASE_OCTETS: u16 = 20;
/// The protocol number assigned to TCP
pub const PROTOCOL_TCP: u8 = 6;
/// Default time-to-live for outbound datagrams
const TTL: u8 = 64;

/// An IPv4 address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    pub const LOCALHOST: Self = Self([127, 0, 0, 1]);
    /// The wildcard address, used for listening on every local address.
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);

    pub const fn new(address: [u8; 4]) -> Self {
        Self(address)
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        self.0
    }

    pub fn is_unspecified(self) -> bool {
        self == Self::UNSPECIFIED
    }

    /// Whether this is a class D (multicast) address.
    pub fn is_multicast(self) -> bool {
        self.0[0] & 0xf0 == 0xe0
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(address: [u8; 4]) -> Self {
        Self(address)
    }
}

impl From<Ipv4Address> for [u8; 4] {
    fn from(address: Ipv4Address) -> Self {
        address.0
    }
}

impl From<Ipv4Address> for u32 {
    fn from(address: Ipv4Address) -> Self {
        u32::from_be_bytes(address.0)
    }
}

impl Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

/// An IPv4 header, as described in RFC 791 s3.1. Only the fields the engine
/// actually varies are public; everything else is fixed at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// The length of the datagram in bytes
    pub total_length: u16,
    /// The number of remaining hops this datagram can take
    pub time_to_live: u8,
    /// The next level protocol in the data portion of the datagram
    pub protocol: u8,
    /// The IPv4 header checksum
    pub checksum: u16,
    /// The source address
    pub source: Ipv4Address,
    /// The destination address
    pub destination: Ipv4Address,
}

impl Ipv4Header {
    /// Builds a header for a TCP payload of `payload_len` bytes, computing
    /// the header checksum.
    pub fn new(source: Ipv4Address, destination: Ipv4Address, payload_len: u16) -> Self {
        let mut header = Self {
            total_length: BASE_OCTETS + payload_len,
            time_to_live: TTL,
            protocol: PROTOCOL_TCP,
            checksum: 0,
            source,
            destination,
        };
        let mut checksum = Checksum::new();
        checksum.add_bytes(header.serialize());
        header.checksum = checksum.finish();
        header
    }

    /// Serializes the header into wire format.
    pub fn serialize(&self) -> [u8; BASE_OCTETS as usize] {
        let mut out = [0u8; BASE_OCTETS as usize];
        out[0] = 4 << 4 | 5; // version, IHL
        out[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        out[8] = self.time_to_live;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        out[12..16].copy_from_slice(&self.source.to_bytes());
        out[16..20].copy_from_slice(&self.destination.to_bytes());
        out
    }

    /// Parses a header from a byte iterator, verifying the checksum.
    pub fn from_bytes(bytes: &mut impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        let mut next = || -> Result<u8, ParseError> { bytes.next().ok_or(ParseError::HeaderTooShort) };
        let mut checksum = Checksum::new();

        let version_and_ihl = next()?;
        if version_and_ihl >> 4 != 4 {
            Err(ParseError::IncorrectIpv4Version)?
        }
        if version_and_ihl & 0b1111 != 5 {
            Err(ParseError::UnexpectedOptions)?
        }
        let type_of_service = next()?;
        checksum.add_bytes([version_and_ihl, type_of_service]);

        let total_length = u16::from_be_bytes([next()?, next()?]);
        checksum.add_word(total_length);

        // identification, flags, fragment offset
        checksum.add_bytes([next()?, next()?, next()?, next()?]);

        let time_to_live = next()?;
        let protocol = next()?;
        checksum.add_bytes([time_to_live, protocol]);

        let expected_checksum = u16::from_be_bytes([next()?, next()?]);

        let source_bytes = [next()?, next()?, next()?, next()?];
        checksum.add_bytes(source_bytes);
        let destination_bytes = [next()?, next()?, next()?, next()?];
        checksum.add_bytes(destination_bytes);

        let actual_checksum = checksum.finish();
        if actual_checksum != expected_checksum {
            Err(ParseError::InvalidChecksum {
                actual: actual_checksum,
                expected: expected_checksum,
            })?
        }

        Ok(Self {
            total_length,
            time_to_live,
            protocol,
            checksum: expected_checksum,
            source: source_bytes.into(),
            destination: destination_bytes.into(),
        })
    }
}

/// A TCP segment wrapped in an IPv4 header, ready for transmission.
#[derive(Debug, Clone)]
pub struct Ipv4Packet {
    pub header: Ipv4Header,
    pub segment: Segment,
}

impl Ipv4Packet {
    pub fn new(source: Ipv4Address, destination: Ipv4Address, segment: Segment) -> Self {
        let payload_len = segment.wire_len() as u16;
        Self {
            header: Ipv4Header::new(source, destination, payload_len),
            segment,
        }
    }

    /// The connection identity as seen by the receiving stack.
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            local: Endpoint::new(self.header.destination, self.segment.header.dst_port),
            remote: Endpoint::new(self.header.source, self.segment.header.src_port),
        }
    }

    /// Serializes the entire datagram into wire format.
    pub fn to_message(&self) -> Message {
        let mut message = self.segment.text.clone();
        message.header(self.segment.header.serialize());
        message.header(self.header.serialize());
        message
    }

    /// Parses a datagram, verifying both checksums.
    pub fn from_bytes(mut bytes: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        let header = Ipv4Header::from_bytes(&mut bytes)?;
        if header.protocol != PROTOCOL_TCP {
            Err(ParseError::NotTcp(header.protocol))?
        }
        let segment = Segment::from_bytes(bytes, header.source, header.destination)
            .map_err(ParseError::Tcp)?;
        Ok(Self { header, segment })
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("the header is incomplete")]
    HeaderTooShort,
    #[error("the version field was not 4")]
    IncorrectIpv4Version,
    #[error("IPv4 options are not supported")]
    UnexpectedOptions,
    #[error("the header checksum {actual:#06x} does not match {expected:#06x}")]
    InvalidChecksum { actual: u16, expected: u16 },
    #[error("datagram does not carry TCP (protocol {0})")]
    NotTcp(u8),
    #[error(transparent)]
    Tcp(super::tcp::tcp_parsing::ParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() -> anyhow::Result<()> {
        let source = Ipv4Address::new([10, 0, 0, 1]);
        let destination = Ipv4Address::new([10, 0, 0, 2]);
        let header = Ipv4Header::new(source, destination, 40);
        let parsed = Ipv4Header::from_bytes(&mut header.serialize().into_iter())?;
        assert_eq!(parsed, header);
        assert_eq!(parsed.total_length, 60);
        assert_eq!(parsed.protocol, PROTOCOL_TCP);
        Ok(())
    }

    #[test]
    fn corrupted_header_rejected() {
        let header = Ipv4Header::new(Ipv4Address::LOCALHOST, Ipv4Address::new([10, 0, 0, 2]), 0);
        let mut bytes = header.serialize();
        bytes[17] ^= 0xff;
        assert!(matches!(
            Ipv4Header::from_bytes(&mut bytes.into_iter()),
            Err(ParseError::InvalidChecksum { .. })
        ));
    }
}
