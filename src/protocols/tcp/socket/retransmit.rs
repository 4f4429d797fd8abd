use super::modular_cmp::{mod_geq, mod_gt, mod_leq, mod_lt};
use super::Segment;
use crate::protocols::tcp::tcp_parsing::Control;
use std::collections::VecDeque;

/// A segment on the retransmission queue, along with the bookkeeping needed
/// for RTT sampling and timeout accounting.
#[derive(Debug, Clone)]
pub struct Transmit {
    pub segment: Segment,
    /// When the segment was first transmitted
    pub tx_ts: f64,
    /// When the segment was last retransmitted, if ever. A retransmitted
    /// segment is never used for RTT estimation (Karn's algorithm).
    pub retx_ts: Option<f64>,
    /// How many times the segment's retransmission timer has fired
    pub timeout_count: u32,
}

impl Transmit {
    pub fn new(segment: Segment, tx_ts: f64) -> Self {
        Self {
            segment,
            tx_ts,
            retx_ts: None,
            timeout_count: 0,
        }
    }
}

/// The retransmission queue: every in-flight segment that occupies sequence
/// space, ordered by sequence number.
#[derive(Debug, Clone, Default)]
pub struct RetransmitQueue {
    entries: VecDeque<Transmit>,
}

impl RetransmitQueue {
    /// Inserts an entry in sequence order. New transmissions always append;
    /// the scan only runs when something was enqueued out of order.
    pub fn push(&mut self, transmit: Transmit) {
        let seq = transmit.segment.header.seq;
        match self.entries.back() {
            Some(last) if mod_lt(seq, last.segment.header.seq) => {
                let at = self
                    .entries
                    .iter()
                    .position(|entry| mod_lt(seq, entry.segment.header.seq))
                    .unwrap_or(self.entries.len());
                self.entries.insert(at, transmit);
            }
            _ => self.entries.push_back(transmit),
        }
    }

    /// Removes entries fully covered by `ack` and strips the acknowledged
    /// prefix from a partially covered head (RFC 793 p26: the SYN is
    /// conceptually before the text, the FIN after it). Returns how many
    /// entries were removed outright.
    pub fn ack_through(&mut self, ack: u32) -> usize {
        let mut fully_acked = 0;
        for transmit in self.entries.iter_mut() {
            let seq = transmit.segment.header.seq;
            let len = transmit.segment.seg_len();
            let partial = mod_lt(seq, ack);

            if mod_leq(seq.wrapping_add(len), ack) {
                fully_acked += 1;
            } else if partial {
                let mut acked_bytes = ack.wrapping_sub(seq);
                if transmit.segment.header.ctl.syn() {
                    // The SYN must be covered for the ACK to be partial
                    acked_bytes = acked_bytes.wrapping_sub(1);
                    transmit.segment.header.ctl = transmit.segment.header.ctl.without(Control::SYN);
                }
                tracing::warn!(
                    "segment partially acknowledged ({acked_bytes} bytes of {})",
                    transmit.segment.text.len()
                );
                transmit.segment.text.remove_front(acked_bytes as usize);
                transmit.segment.header.seq = ack;
                break;
            } else {
                break;
            }
        }
        self.entries.drain(..fully_acked);
        fully_acked
    }

    /// Finds the entry whose sequence range contains `seqno`, for fast
    /// retransmission.
    pub fn position_of(&self, seqno: u32) -> Option<usize> {
        self.entries.iter().position(|entry| {
            let seq = entry.segment.header.seq;
            mod_geq(seq, seqno) && mod_gt(seq.wrapping_add(entry.segment.seg_len()), seqno)
        })
    }

    /// Finds the unretransmitted entry that `ack` acknowledges into, for RTT
    /// sampling. Mirrors the queue order: once an entry is not covered at
    /// all, nothing later can be.
    pub fn sample_for_ack(&self, ack: u32) -> Option<&Transmit> {
        for entry in &self.entries {
            let seq = entry.segment.header.seq;
            if !mod_gt(ack, seq) {
                break;
            }
            if mod_leq(ack, seq.wrapping_add(entry.segment.seg_len())) {
                return Some(entry);
            }
        }
        None
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Transmit> {
        self.entries.get_mut(index)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transmit> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The total sequence space covered by queued entries, for consistency
    /// checks against `snd.nxt - snd.una`.
    pub fn sequence_span(&self) -> u32 {
        self.entries
            .iter()
            .fold(0u32, |acc, entry| acc.wrapping_add(entry.segment.seg_len()))
    }
}
