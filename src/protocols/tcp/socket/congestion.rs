//! Congestion control state per RFC 5681, with the NewReno fast-recovery
//! modification (RFC 6582) and limited transmit (RFC 3042).

/// The congestion controller's view of one connection.
///
/// The window is lazily initialized so the initial window can be computed
/// from the final SMSS rather than whatever was known at socket creation.
/// The sending and ACK-processing decisions that need to retransmit live on
/// the socket; this struct owns the arithmetic.
#[derive(Debug, Clone)]
pub struct Congestion {
    cwnd: Option<u32>,
    /// Slow start threshold, initially "infinite" (RFC 5681 s3.1)
    pub ssthresh: u32,
    /// Whether we are between fast-recovery entry and exit
    pub in_fast_recovery: bool,
    /// NewReno recovery point guarding against re-entering fast recovery on
    /// old duplicate ACKs (RFC 6582 s6)
    pub recover: u32,
    /// Consecutive duplicate ACKs observed
    pub dup_ack_count: u32,
    /// Bytes sent beyond the congestion window under limited transmit
    pub limited_transmit_sent: u32,
    /// Partial ACKs seen during the current fast-recovery episode
    pub partial_ack_count: u32,
    /// Bytes acknowledged since the last congestion-avoidance increase
    /// (RFC 5681 s3.1 byte counting)
    pub ca_acked_bytes: u32,
    /// When we last sent data; used to collapse an idle window back to the
    /// restart window (RFC 5681 s4.1)
    pub last_send_ts: Option<f64>,
}

impl Congestion {
    pub fn new(iss: u32) -> Self {
        Self {
            cwnd: None,
            ssthresh: u32::MAX,
            in_fast_recovery: false,
            recover: iss,
            dup_ack_count: 0,
            limited_transmit_sent: 0,
            partial_ack_count: 0,
            ca_acked_bytes: 0,
            last_send_ts: None,
        }
    }

    /// The congestion window, initialized to IW on first use.
    pub fn cwnd(&mut self, smss: u32) -> u32 {
        *self.cwnd.get_or_insert_with(|| Self::initial_window(smss))
    }

    /// Sets the window, refusing to go negative.
    pub fn set_cwnd(&mut self, value: i64) {
        if value < 0 {
            tracing::warn!("refusing to set a negative congestion window");
            return;
        }
        if self.cwnd != Some(value as u32) {
            tracing::debug!("cwnd {:?} -> {value}", self.cwnd);
        }
        self.cwnd = Some(value as u32);
    }

    pub fn in_slow_start(&mut self, smss: u32) -> bool {
        self.cwnd(smss) < self.ssthresh
    }

    /// IW per RFC 5681 s3.1
    pub fn initial_window(smss: u32) -> u32 {
        if smss > 2190 {
            2 * smss
        } else if smss > 1095 {
            3 * smss
        } else {
            4 * smss
        }
    }

    /// LW per RFC 5681 s3.1
    pub fn loss_window(smss: u32) -> u32 {
        smss
    }

    /// RW per RFC 5681 s4.1
    pub fn restart_window(&mut self, smss: u32) -> u32 {
        Self::initial_window(smss).min(self.cwnd(smss))
    }

    /// Window growth on an ACK of `acked` new bytes outside fast recovery:
    /// slow start below ssthresh, byte-counted congestion avoidance above
    /// it (RFC 5681 s3.1).
    pub fn open_window(&mut self, acked: u32, smss: u32) {
        if self.in_slow_start(smss) {
            let cwnd = self.cwnd(smss) + acked.min(smss);
            self.set_cwnd(cwnd as i64);
            if !self.in_slow_start(smss) {
                tracing::debug!("leaving slow start for congestion avoidance");
                self.ca_acked_bytes = 0;
            }
        } else {
            // Counting bytes rather than ACKs sidesteps ACK-division
            // inflation; excess beyond one window is discarded so growth
            // stays at one SMSS per RTT.
            self.ca_acked_bytes += acked;
            if self.ca_acked_bytes >= self.cwnd(smss) {
                let cwnd = self.cwnd(smss) + smss;
                self.set_cwnd(cwnd as i64);
                self.ca_acked_bytes = 0;
            }
        }
    }

    /// Reaction to an RTO-driven retransmission (RFC 5681 s3.1 equation 4):
    /// ssthresh is recomputed only the first time a given segment times out.
    pub fn on_rto_retransmit(&mut self, first_retx: bool, flight: u32, smss: u32) {
        if first_retx {
            self.ssthresh = (flight / 2).max(2 * smss);
        }
        self.set_cwnd(Self::loss_window(smss) as i64);
    }

    /// Leaves fast recovery, clearing every episode counter.
    pub fn exit_recovery(&mut self) {
        self.dup_ack_count = 0;
        self.limited_transmit_sent = 0;
        self.in_fast_recovery = false;
        self.partial_ack_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_window_tiers() {
        assert_eq!(Congestion::initial_window(2200), 4400);
        assert_eq!(Congestion::initial_window(1460), 4380);
        assert_eq!(Congestion::initial_window(1000), 4000);
    }

    #[test]
    fn lazy_window_starts_at_iw() {
        let mut congestion = Congestion::new(0);
        assert_eq!(congestion.cwnd(1460), 4380);
        assert!(congestion.in_slow_start(1460));
    }

    #[test]
    fn slow_start_counts_acked_bytes() {
        let mut congestion = Congestion::new(0);
        congestion.cwnd(1460);
        congestion.open_window(500, 1460);
        assert_eq!(congestion.cwnd(1460), 4880);
        // A jumbo ACK only opens the window by one SMSS
        congestion.open_window(50_000, 1460);
        assert_eq!(congestion.cwnd(1460), 6340);
    }

    #[test]
    fn congestion_avoidance_grows_once_per_window() {
        let mut congestion = Congestion::new(0);
        congestion.set_cwnd(4000);
        congestion.ssthresh = 2000;
        for _ in 0..3 {
            congestion.open_window(1000, 1000);
        }
        assert_eq!(congestion.cwnd(1000), 4000);
        congestion.open_window(1000, 1000);
        assert_eq!(congestion.cwnd(1000), 5000);
        assert_eq!(congestion.ca_acked_bytes, 0);
    }

    #[test]
    fn rto_collapses_to_loss_window() {
        let mut congestion = Congestion::new(0);
        congestion.set_cwnd(20_000);
        congestion.on_rto_retransmit(true, 10_000, 1460);
        assert_eq!(congestion.cwnd(1460), 1460);
        assert_eq!(congestion.ssthresh, 5000);
        // Second timeout of the same segment leaves ssthresh alone
        congestion.on_rto_retransmit(false, 1460, 1460);
        assert_eq!(congestion.ssthresh, 5000);
    }

    #[test]
    fn rto_ssthresh_has_floor() {
        let mut congestion = Congestion::new(0);
        congestion.cwnd(1460);
        congestion.on_rto_retransmit(true, 1000, 1460);
        assert_eq!(congestion.ssthresh, 2920);
    }

    #[test]
    fn negative_window_rejected() {
        let mut congestion = Congestion::new(0);
        congestion.set_cwnd(1460);
        congestion.set_cwnd(-5);
        assert_eq!(congestion.cwnd(1460), 1460);
    }

    #[test]
    fn exit_recovery_clears_episode_state() {
        let mut congestion = Congestion::new(0);
        congestion.in_fast_recovery = true;
        congestion.dup_ack_count = 5;
        congestion.limited_transmit_sent = 2920;
        congestion.partial_ack_count = 2;
        congestion.exit_recovery();
        assert!(!congestion.in_fast_recovery);
        assert_eq!(congestion.dup_ack_count, 0);
        assert_eq!(congestion.limited_transmit_sent, 0);
        assert_eq!(congestion.partial_ack_count, 0);
    }
}
