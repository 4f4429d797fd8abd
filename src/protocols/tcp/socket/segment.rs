use crate::protocols::ipv4::Ipv4Address;
use crate::protocols::tcp::tcp_parsing::{ParseError, TcpHeader};
use crate::Message;

/// A TCP header together with its segment text.
#[derive(Debug, Clone)]
pub struct Segment {
    pub header: TcpHeader,
    pub text: Message,
}

impl Segment {
    pub fn new(header: TcpHeader, text: Message) -> Self {
        Self { header, text }
    }

    /// The amount of sequence space the segment occupies. SYN and FIN each
    /// take up one sequence number in addition to the text.
    pub fn seg_len(&self) -> u32 {
        self.text.len() as u32 + self.header.ctl.syn() as u32 + self.header.ctl.fin() as u32
    }

    /// The number of bytes the segment occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.header.serialized_len() + self.text.len()
    }

    /// Parses a segment, verifying the checksum against the pseudo-header.
    pub fn from_bytes(
        bytes: impl Iterator<Item = u8>,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
    ) -> Result<Self, ParseError> {
        let (header, text) = TcpHeader::from_bytes(bytes, src_address, dst_address)?;
        Ok(Self { header, text })
    }

    pub fn into_inner(self) -> (TcpHeader, Message) {
        (self.header, self.text)
    }
}
