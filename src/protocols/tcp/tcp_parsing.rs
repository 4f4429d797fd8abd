//! Parsing and serialization for TCP headers, including the options the
//! engine understands (MSS, window scale, timestamps).

use crate::protocols::ipv4::Ipv4Address;
use crate::protocols::utility::Checksum;
use crate::Message;
use std::fmt::{self, Debug};
use thiserror::Error as ThisError;

/// The length of a TCP header with no options
const BASE_OCTETS: usize = 20;

const KIND_END: u8 = 0;
const KIND_NOP: u8 = 1;
const KIND_MSS: u8 = 2;
const KIND_WINDOW_SCALE: u8 = 3;
const KIND_TIMESTAMP: u8 = 8;

/// A TCP header, as described in RFC 793 s3.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// The sequence number of the first byte in the segment
    pub seq: u32,
    /// The next sequence number the sender expects to receive
    pub ack: u32,
    /// The control flags
    pub ctl: Control,
    /// The advertised receive window, possibly scaled
    pub wnd: u16,
    pub checksum: u16,
    /// The urgent pointer. Parsed but never acted on.
    pub urgent: u16,
    pub options: TcpOptions,
}

impl TcpHeader {
    /// Serializes the header into wire format using the stored checksum.
    pub fn serialize(&self) -> Vec<u8> {
        let options = self.options.serialize();
        let data_offset = (BASE_OCTETS + options.len()) / 4;
        let mut out = Vec::with_capacity(BASE_OCTETS + options.len());
        out.extend(self.src_port.to_be_bytes());
        out.extend(self.dst_port.to_be_bytes());
        out.extend(self.seq.to_be_bytes());
        out.extend(self.ack.to_be_bytes());
        out.push((data_offset as u8) << 4);
        out.push(self.ctl.into());
        out.extend(self.wnd.to_be_bytes());
        out.extend(self.checksum.to_be_bytes());
        out.extend(self.urgent.to_be_bytes());
        out.extend(options);
        out
    }

    /// The length of the serialized header in bytes.
    pub fn serialized_len(&self) -> usize {
        BASE_OCTETS + self.options.serialized_len()
    }

    /// Parses a header and its payload from the bytes of a TCP segment,
    /// verifying the checksum against the pseudo-header for the given
    /// addresses.
    pub fn from_bytes(
        mut bytes: impl Iterator<Item = u8>,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
    ) -> Result<(Self, Message), ParseError> {
        let mut next = || -> Result<u8, ParseError> { bytes.next().ok_or(ParseError::HeaderTooShort) };
        let mut checksum = Checksum::new();

        let src_port = u16::from_be_bytes([next()?, next()?]);
        checksum.add_word(src_port);

        let dst_port = u16::from_be_bytes([next()?, next()?]);
        checksum.add_word(dst_port);

        let seq_bytes = [next()?, next()?, next()?, next()?];
        checksum.add_bytes(seq_bytes);

        let ack_bytes = [next()?, next()?, next()?, next()?];
        checksum.add_bytes(ack_bytes);

        let offset_byte = next()?;
        let ctl_byte = next()?;
        checksum.add_bytes([offset_byte, ctl_byte]);
        let data_offset = (offset_byte >> 4) as usize * 4;
        if data_offset < BASE_OCTETS {
            Err(ParseError::HeaderTooShort)?
        }

        let wnd = u16::from_be_bytes([next()?, next()?]);
        checksum.add_word(wnd);

        let expected_checksum = u16::from_be_bytes([next()?, next()?]);

        let urgent = u16::from_be_bytes([next()?, next()?]);
        checksum.add_word(urgent);

        let mut option_bytes = Vec::with_capacity(data_offset - BASE_OCTETS);
        for _ in 0..data_offset - BASE_OCTETS {
            option_bytes.push(next()?);
        }
        // The options region is always a multiple of four bytes, so the
        // text below still starts word-aligned
        checksum.add_bytes(option_bytes.iter().cloned());
        let options = TcpOptions::parse(&option_bytes)?;

        let text: Vec<u8> = bytes.collect();
        let text_length = checksum.add_bytes(text.iter().cloned());

        // Pseudo header
        checksum.add_bytes(src_address.to_bytes());
        checksum.add_bytes(dst_address.to_bytes());
        checksum.add_word(super::super::ipv4::PROTOCOL_TCP as u16);
        checksum.add_word(data_offset as u16 + text_length);

        let actual_checksum = checksum.finish();
        if actual_checksum != expected_checksum {
            Err(ParseError::InvalidChecksum {
                actual: actual_checksum,
                expected: expected_checksum,
            })?
        }

        Ok((
            Self {
                src_port,
                dst_port,
                seq: u32::from_be_bytes(seq_bytes),
                ack: u32::from_be_bytes(ack_bytes),
                ctl: Control::from(ctl_byte),
                wnd,
                checksum: expected_checksum,
                urgent,
                options,
            },
            Message::new(text),
        ))
    }
}

/// The TCP control bits, in their wire encoding.
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq)]
pub struct Control(u8);

impl Control {
    pub const FIN: Self = Self(1 << 0);
    pub const SYN: Self = Self(1 << 1);
    pub const RST: Self = Self(1 << 2);
    pub const PSH: Self = Self(1 << 3);
    pub const ACK: Self = Self(1 << 4);
    pub const URG: Self = Self(1 << 5);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// No more data from sender
    pub fn fin(self) -> bool {
        self.contains(Self::FIN)
    }

    /// Synchronize sequence numbers
    pub fn syn(self) -> bool {
        self.contains(Self::SYN)
    }

    /// Reset the connection
    pub fn rst(self) -> bool {
        self.contains(Self::RST)
    }

    /// Push function
    pub fn psh(self) -> bool {
        self.contains(Self::PSH)
    }

    /// Acknowledgment field significant
    pub fn ack(self) -> bool {
        self.contains(Self::ACK)
    }

    /// Urgent pointer field significant
    pub fn urg(self) -> bool {
        self.contains(Self::URG)
    }

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for Control {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl From<u8> for Control {
    fn from(n: u8) -> Self {
        Self(n & 0b11_1111)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

impl Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut any = false;
        for (flag, name) in [
            (Self::SYN, "SYN"),
            (Self::FIN, "FIN"),
            (Self::RST, "RST"),
            (Self::PSH, "PSH"),
            (Self::ACK, "ACK"),
            (Self::URG, "URG"),
        ] {
            if self.contains(flag) {
                if any {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                any = true;
            }
        }
        if !any {
            write!(f, "(none)")?;
        }
        Ok(())
    }
}

/// A timestamps option, RFC 7323 s3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    /// The sender's timestamp clock value
    pub value: u32,
    /// The most recent timestamp received from the peer
    pub echo: u32,
}

/// The TCP options the engine understands. Unknown options are skipped on
/// parse and never produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    /// Maximum segment size, RFC 9293 3.7.1. Understood but never produced.
    pub mss: Option<u16>,
    /// Window scale shift count, RFC 7323 s2
    pub window_scale: Option<u8>,
    /// Timestamps, RFC 7323 s3
    pub timestamp: Option<Timestamp>,
}

impl TcpOptions {
    pub fn is_empty(&self) -> bool {
        self.mss.is_none() && self.window_scale.is_none() && self.timestamp.is_none()
    }

    /// The serialized length, padded to a four-byte boundary.
    pub fn serialized_len(&self) -> usize {
        let len = self.mss.map_or(0, |_| 4)
            + self.window_scale.map_or(0, |_| 3)
            + self.timestamp.map_or(0, |_| 10);
        (len + 3) / 4 * 4
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        if let Some(mss) = self.mss {
            out.push(KIND_MSS);
            out.push(4);
            out.extend(mss.to_be_bytes());
        }
        if let Some(shift) = self.window_scale {
            out.push(KIND_WINDOW_SCALE);
            out.push(3);
            out.push(shift);
        }
        if let Some(ts) = self.timestamp {
            out.push(KIND_TIMESTAMP);
            out.push(10);
            out.extend(ts.value.to_be_bytes());
            out.extend(ts.echo.to_be_bytes());
        }
        while out.len() % 4 != 0 {
            out.push(KIND_NOP);
        }
        out
    }

    fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut options = Self::default();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                KIND_END => break,
                KIND_NOP => {
                    i += 1;
                    continue;
                }
                kind => {
                    let len = *bytes.get(i + 1).ok_or(ParseError::MalformedOptions)? as usize;
                    if len < 2 || i + len > bytes.len() {
                        Err(ParseError::MalformedOptions)?
                    }
                    let body = &bytes[i + 2..i + len];
                    match (kind, len) {
                        (KIND_MSS, 4) => {
                            options.mss = Some(u16::from_be_bytes([body[0], body[1]]));
                        }
                        (KIND_WINDOW_SCALE, 3) => {
                            options.window_scale = Some(body[0]);
                        }
                        (KIND_TIMESTAMP, 10) => {
                            options.timestamp = Some(Timestamp {
                                value: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                                echo: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                            });
                        }
                        (KIND_MSS | KIND_WINDOW_SCALE | KIND_TIMESTAMP, _) => {
                            Err(ParseError::MalformedOptions)?
                        }
                        _ => {} // Unknown option, skip
                    }
                    i += len;
                }
            }
        }
        Ok(options)
    }
}

/// Assembles a [`TcpHeader`] a field at a time, then computes the checksum
/// over the segment it will carry.
#[derive(Debug, Clone)]
pub struct TcpHeaderBuilder(TcpHeader);

impl TcpHeaderBuilder {
    pub fn new(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self(TcpHeader {
            src_port,
            dst_port,
            seq,
            ack: 0,
            ctl: Control::default(),
            wnd: 0,
            checksum: 0,
            urgent: 0,
            options: TcpOptions::default(),
        })
    }

    /// Sets the acknowledgment number and the ACK control bit.
    pub fn ack(mut self, ack: u32) -> Self {
        self.0.ack = ack;
        self.0.ctl = self.0.ctl.with(Control::ACK);
        self
    }

    /// Sets the acknowledgment number without raising the ACK bit.
    pub fn ack_no(mut self, ack: u32) -> Self {
        self.0.ack = ack;
        self
    }

    pub fn syn(mut self) -> Self {
        self.0.ctl = self.0.ctl.with(Control::SYN);
        self
    }

    pub fn fin(mut self) -> Self {
        self.0.ctl = self.0.ctl.with(Control::FIN);
        self
    }

    pub fn rst(mut self) -> Self {
        self.0.ctl = self.0.ctl.with(Control::RST);
        self
    }

    pub fn psh(mut self) -> Self {
        self.0.ctl = self.0.ctl.with(Control::PSH);
        self
    }

    pub fn ctl(mut self, ctl: Control) -> Self {
        self.0.ctl = self.0.ctl.with(ctl);
        self
    }

    pub fn wnd(mut self, wnd: u16) -> Self {
        self.0.wnd = wnd;
        self
    }

    pub fn window_scale(mut self, shift: u8) -> Self {
        self.0.options.window_scale = Some(shift);
        self
    }

    pub fn timestamp(mut self, value: u32, echo: u32) -> Self {
        self.0.options.timestamp = Some(Timestamp { value, echo });
        self
    }

    /// Finishes the header, computing the checksum over the pseudo-header,
    /// the header itself, and `text`.
    pub fn build(self, src_address: Ipv4Address, dst_address: Ipv4Address, text: &Message) -> TcpHeader {
        let mut header = self.0;
        header.checksum = 0;

        let mut checksum = Checksum::new();
        let serialized = header.serialize();
        checksum.add_bytes(serialized.iter().cloned());
        let text_length = checksum.add_bytes(text.iter());

        checksum.add_bytes(src_address.to_bytes());
        checksum.add_bytes(dst_address.to_bytes());
        checksum.add_word(super::super::ipv4::PROTOCOL_TCP as u16);
        checksum.add_word(serialized.len() as u16 + text_length);

        header.checksum = checksum.finish();
        header
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("the header is incomplete")]
    HeaderTooShort,
    #[error("the options region could not be parsed")]
    MalformedOptions,
    #[error("the segment checksum {actual:#06x} does not match {expected:#06x}")]
    InvalidChecksum { actual: u16, expected: u16 },
}
