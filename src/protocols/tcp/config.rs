/// Tunables for the engine. The defaults reproduce the stock behavior of the
/// hosting simulator; tests shrink the buffers to force windowing behavior.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// How often the host promises to call
    /// [`Tcp::timer_tick`](super::Tcp::timer_tick), in seconds. Must be at
    /// most 0.5 for delayed ACKs to stay within the RFC 1122 bound.
    pub timer_granularity: f64,
    /// Send buffer capacity in bytes
    pub tx_data_max: usize,
    /// Receive buffer capacity in bytes; also the initial receive window
    pub rx_data_max: usize,
    /// Whether ACKs for in-order data may be delayed until the next tick
    pub use_delayed_acks: bool,
    /// Whether to offer window scaling in SYN segments (RFC 7323 s2)
    pub allow_ws_option: bool,
    /// Whether to offer timestamps in SYN segments (RFC 7323 s3)
    pub allow_ts_option: bool,
    /// Validate timestamp echoes against the retransmission queue instead of
    /// the cheap "an ACK is expected" test
    pub expensive_ts_heuristic: bool,
    /// Seed the RNG and timestamp salt from the stack name so repeated runs
    /// produce identical traces
    pub deterministic: bool,
    /// Cap on segments retransmitted per RTO expiry; `None` retransmits the
    /// whole queue
    pub retx_on_rto_count: Option<u32>,
    /// Longest interval between zero-window probes, in seconds
    pub zwp_max_interval: f64,
    /// How long to linger in TIME-WAIT (2 MSL), in seconds
    pub time_wait_timeout: f64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            timer_granularity: 0.1001,
            tx_data_max: 1024 * 1024,
            rx_data_max: 10 * 1024 * 1024,
            use_delayed_acks: true,
            allow_ws_option: true,
            allow_ts_option: true,
            expensive_ts_heuristic: false,
            deterministic: false,
            retx_on_rto_count: None,
            zwp_max_interval: 30.0,
            time_wait_timeout: 30.0,
        }
    }
}
