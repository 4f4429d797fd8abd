//! Contains utilities for implementing protocols.

use super::ipv4::Ipv4Address;
use std::fmt::{self, Display};

/// Running one's-complement sum for the Internet checksum (RFC 1071),
/// shared by the IPv4 and TCP headers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(u16);

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one 16-bit word, folding any carry back into the low bit.
    pub fn add_word(&mut self, word: u16) {
        let (sum, overflowed) = self.0.overflowing_add(word);
        self.0 = sum.wrapping_add(overflowed as u16);
    }

    /// Folds a run of bytes into the sum as big-endian words. An odd
    /// trailing byte becomes the high half of a zero-padded word, so only
    /// the final run of a segment may have odd length. Returns how many
    /// bytes were folded in.
    pub fn add_bytes(&mut self, bytes: impl IntoIterator<Item = u8>) -> u16 {
        let mut count = 0u16;
        let mut pending: Option<u8> = None;
        for byte in bytes {
            count += 1;
            match pending.take() {
                Some(high) => self.add_word(u16::from_be_bytes([high, byte])),
                None => pending = Some(byte),
            }
        }
        if let Some(high) = pending {
            self.add_word(u16::from_be_bytes([high, 0]));
        }
        count
    }

    /// The finished checksum: the sum's complement, with an all-zero
    /// result mapped to all-ones (both encode zero in one's complement,
    /// and the nonzero form keeps the field from looking absent).
    pub fn finish(&self) -> u16 {
        match !self.0 {
            0 => 0xffff,
            value => value,
        }
    }
}

/// An address-port pair identifying one end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub address: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: Ipv4Address, port: u16) -> Self {
        Self { address, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// The pair of endpoints that identifies a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoints {
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl Endpoints {
    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    /// The same connection as seen from the other side.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.local, self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carry_wraps_around() {
        let mut checksum = Checksum::new();
        checksum.add_word(0xffff);
        checksum.add_word(0x0001);
        // 0xffff + 0x0001 carries out and back in, leaving 0x0001
        assert_eq!(checksum.finish(), !0x0001);
    }

    #[test]
    fn byte_runs_match_word_adds() {
        let mut by_words = Checksum::new();
        by_words.add_word(0x1234);
        by_words.add_word(0x5678);

        let mut by_bytes = Checksum::new();
        assert_eq!(by_bytes.add_bytes([0x12, 0x34, 0x56, 0x78]), 4);

        assert_eq!(by_words.finish(), by_bytes.finish());
    }

    #[test]
    fn odd_tail_is_zero_padded() {
        let mut odd = Checksum::new();
        assert_eq!(odd.add_bytes([0xab]), 1);

        let mut padded = Checksum::new();
        padded.add_word(0xab00);

        assert_eq!(odd.finish(), padded.finish());
    }

    #[test]
    fn zero_sum_reads_as_all_ones() {
        // The complement of zero must not be emitted as zero
        let checksum = Checksum::new();
        assert_eq!(checksum.finish(), 0xffff);
        let mut full = Checksum::new();
        full.add_word(0xffff);
        assert_eq!(full.finish(), 0xffff);
    }
}
