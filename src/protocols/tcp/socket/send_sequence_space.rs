//      1         2          3          4
// ----------|----------|----------|----------
//        SND.UNA    SND.NXT    SND.UNA
//                             +SND.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers of unacknowledged data
// 3 - sequence numbers allowed for new data transmission (send window)
// 4 - future sequence numbers which are not yet allowed
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct SendSequenceSpace {
    /// Initial send sequence number
    pub iss: u32,
    /// Oldest unacknowledged sequence number
    pub una: u32,
    /// Next sequence number to be sent
    pub nxt: u32,
    /// The size of the remote TCP's window, after any scaling
    pub wnd: u32,
    /// Segment sequence number used for last window update
    pub wl1: u32,
    /// Segment acknowledgment number used for last window update
    pub wl2: u32,
}

impl SendSequenceSpace {
    /// A fresh send space as described on RFC 793 p66: the SYN will carry
    /// `iss`, so the next new sequence number is one past it.
    pub fn new(iss: u32) -> Self {
        Self {
            iss,
            una: iss,
            nxt: iss.wrapping_add(1),
            wnd: 0,
            wl1: 0,
            wl2: 0,
        }
    }
}
