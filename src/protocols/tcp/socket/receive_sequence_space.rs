use super::modular_cmp::{mod_leq, mod_lt};

//     1          2          3
// ----------|----------|----------
//        RCV.NXT    RCV.NXT
//                  +RCV.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers allowed for new reception
// 3 - future sequence numbers which are not yet allowed
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct ReceiveSequenceSpace {
    /// Initial receive sequence number
    pub irs: u32,
    /// Next sequence number expected on an incoming segment; the left edge
    /// of the receive window
    pub nxt: u32,
    /// The number of bytes we can buffer from the remote TCP
    pub wnd: u32,
}

impl ReceiveSequenceSpace {
    pub fn new(wnd: u32) -> Self {
        Self { irs: 0, nxt: 0, wnd }
    }

    /// Whether a sequence number lies inside the receive window.
    fn contains(&self, n: u32) -> bool {
        mod_leq(self.nxt, n) && mod_lt(n, self.nxt.wrapping_add(self.wnd))
    }

    /// The segment acceptability test of RFC 793 s3.3: a segment is
    /// acceptable when some part of its sequence range falls in the window,
    /// with the empty-segment and zero-window cases handled specially.
    pub fn is_acceptable(&self, seq: u32, seg_len: u32) -> bool {
        match (seg_len == 0, self.wnd == 0) {
            (true, true) => seq == self.nxt,
            (true, false) => self.contains(seq),
            (false, true) => false,
            (false, false) => {
                self.contains(seq) || self.contains(seq.wrapping_add(seg_len).wrapping_sub(1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(nxt: u32, wnd: u32) -> ReceiveSequenceSpace {
        ReceiveSequenceSpace { irs: 0, nxt, wnd }
    }

    #[test]
    fn empty_segment_zero_window() {
        let rcv = space(100, 0);
        assert!(rcv.is_acceptable(100, 0));
        assert!(!rcv.is_acceptable(99, 0));
        assert!(!rcv.is_acceptable(101, 0));
    }

    #[test]
    fn empty_segment_open_window() {
        let rcv = space(100, 10);
        assert!(rcv.is_acceptable(100, 0));
        assert!(rcv.is_acceptable(109, 0));
        assert!(!rcv.is_acceptable(110, 0));
        assert!(!rcv.is_acceptable(99, 0));
    }

    #[test]
    fn data_never_fits_a_zero_window() {
        let rcv = space(100, 0);
        assert!(!rcv.is_acceptable(100, 1));
        assert!(!rcv.is_acceptable(99, 5));
    }

    #[test]
    fn data_overlapping_the_window_edge() {
        let rcv = space(100, 10);
        // Entirely before the window
        assert!(!rcv.is_acceptable(90, 10));
        // Tail reaches into the window
        assert!(rcv.is_acceptable(95, 6));
        // Head starts inside the window
        assert!(rcv.is_acceptable(109, 100));
        // Entirely past the window
        assert!(!rcv.is_acceptable(110, 5));
    }

    #[test]
    fn acceptability_across_wraparound() {
        let rcv = space(u32::MAX - 2, 10);
        assert!(rcv.is_acceptable(u32::MAX - 2, 4));
        assert!(rcv.is_acceptable(1, 2));
        assert!(!rcv.is_acceptable(8, 1));
    }
}
