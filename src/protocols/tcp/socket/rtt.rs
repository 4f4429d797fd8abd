//! The retransmission timer, computed as described in RFC 6298.

/// Lower bound on the retransmission timeout, RFC 6298 s2.4
pub const MIN_RTO: f64 = 1.0;
/// Upper bound on the retransmission timeout, RFC 6298 s2.5
pub const MAX_RTO: f64 = 60.0;

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;
const K: f64 = 4.0;

/// Smoothed round-trip state and the RTO derived from it.
///
/// Samples are weighted by the number of samples expected per round trip
/// (RFC 7323 Appendix G) because the engine measures most segments rather
/// than one per window.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<f64>,
    rttvar: Option<f64>,
    rto: f64,
    /// The clock granularity G from RFC 6298
    granularity: f64,
    /// Consecutive backoffs since the last successful sample
    backoff_count: u32,
}

impl RttEstimator {
    pub fn new(granularity: f64) -> Self {
        Self {
            srtt: None,
            rttvar: None,
            rto: MIN_RTO,
            granularity,
            backoff_count: 0,
        }
    }

    pub fn rto(&self) -> f64 {
        self.rto
    }

    pub fn srtt(&self) -> Option<f64> {
        self.srtt
    }

    /// Folds in a round-trip measurement of `r` seconds.
    pub fn sample(&mut self, r: f64, expected_samples: u32) {
        self.backoff_count = 0;

        let (srtt, rttvar) = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let alpha = ALPHA / expected_samples as f64;
                let beta = BETA / expected_samples as f64;
                let rttvar = (1.0 - beta) * rttvar + beta * (srtt - r).abs();
                let srtt = (1.0 - alpha) * srtt + alpha * r;
                (srtt, rttvar)
            }
            // First measurement, RFC 6298 s2.2
            _ => (r, r / 2.0),
        };
        self.srtt = Some(srtt);
        self.rttvar = Some(rttvar);

        let old_rto = self.rto;
        self.rto = (srtt + (K * rttvar).max(self.granularity)).clamp(MIN_RTO, MAX_RTO);

        if (self.rto - old_rto).abs() > 0.5 {
            tracing::info!(
                "RTO now {:.3} (was {old_rto:.3}, R {r:.3}, SRTT {srtt:.3}, RTTVAR {rttvar:.3})",
                self.rto,
            );
        } else {
            tracing::debug!("RTO now {:.3} (was {old_rto:.3}, R {r:.3})", self.rto);
        }
    }

    /// Exponential backoff after a retransmission timeout, RFC 6298 s5.5.
    /// After backing off repeatedly the smoothed state is discarded so the
    /// next sample re-seeds the estimate from scratch (s5, final paragraph).
    pub fn back_off(&mut self) {
        tracing::warn!("RTO backoff {:.3} -> {:.3}", self.rto, self.rto * 2.0);
        self.rto = (self.rto * 2.0).min(MAX_RTO);
        self.backoff_count += 1;
        if self.backoff_count > 2 {
            self.srtt = None;
            self.rttvar = None;
        }
    }

    /// RFC 6298 s5.7: retransmitted SYNs get at least a 3 second timer.
    pub fn apply_syn_floor(&mut self) {
        if self.rto < 3.0 {
            self.rto = 3.0;
        }
    }
}
