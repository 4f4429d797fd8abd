//! The per-connection protocol engine.
//!
//! A [`Socket`] is one TCB: the state machine, both sequence spaces, the
//! buffers and queues, and every timer a connection needs. It exposes a
//! socket-like interface modeled on the kernel side of the sockets API, and
//! nothing in it ever blocks. The [`Tcp`](super::Tcp) manager owns all
//! sockets, routes arriving segments to them, and fans out timer ticks; the
//! socket talks back to the network only through [`Host::emit`].
//!
//! The receive path follows the segment-arrives processing of RFC 793 s3.9
//! as updated by RFC 1122, with congestion control per RFC 5681, NewReno
//! fast recovery per RFC 6582, limited transmit per RFC 3042, the
//! retransmission timer per RFC 6298, and window scaling and timestamps per
//! RFC 7323.

use crate::host::Host;
use crate::protocols::ipv4::Ipv4Packet;
use crate::protocols::utility::Endpoint;
use crate::Message;
use std::fmt;

pub(crate) mod modular_cmp;
use modular_cmp::{mod_geq, mod_gt, mod_leq, mod_lt};

mod state;
pub use state::State;

mod segment;
pub use segment::Segment;

mod send_sequence_space;
use send_sequence_space::SendSequenceSpace;

mod receive_sequence_space;
use receive_sequence_space::ReceiveSequenceSpace;

mod retransmit;
use retransmit::{RetransmitQueue, Transmit};

mod reassembly;
use reassembly::ReassemblyQueue;

mod rtt;
use rtt::RttEstimator;

mod congestion;
use congestion::Congestion;

use super::tcp_parsing::{Control, TcpHeader, TcpHeaderBuilder, TcpOptions};
use super::{ShutdownKind, SocketId, TcpConfig, TcpError};

/// Granularity of the timestamp option clock, in milliseconds
const TS_GRANULARITY_MS: f64 = 1.0;
/// IP and TCP headers can each take up to 60 bytes from the MTU
pub(super) const MAX_HEADER_OVERHEAD: u32 = 120;

/// Per-call context the manager hands into the receive path.
pub(super) struct RxContext {
    pub now: f64,
    /// Whether our listener has room to accept us once established. Only
    /// meaningful for passively-opened sockets.
    pub accept_has_room: bool,
}

/// What the manager must do after a socket processed an event.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct RxEffects {
    /// The socket reached CLOSED; drop it from the registry and queues
    pub closed: bool,
    /// The handshake completed; migrate from the SYN queue to the listener's
    /// accept queue
    pub established: bool,
}

/// One-shot wake functions registered through `poll`.
#[derive(Default)]
struct WakeList(Vec<Box<dyn FnOnce()>>);

impl WakeList {
    fn register(&mut self, wake: Box<dyn FnOnce()>) {
        self.0.push(wake);
    }

    fn wake_all(&mut self) {
        for wake in self.0.drain(..) {
            wake();
        }
    }
}

impl fmt::Debug for WakeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WakeList({})", self.0.len())
    }
}

/// The transmission control block for one connection.
#[derive(Debug)]
pub struct Socket {
    state: State,
    local: Option<Endpoint>,
    peer: Option<Endpoint>,
    /// The listening socket that spawned us, for passive opens
    pub(super) parent: Option<SocketId>,

    snd: SendSequenceSpace,
    rcv: ReceiveSequenceSpace,

    tx_data: Message,
    rx_data: Message,
    retx_queue: RetransmitQueue,
    rx_queue: ReassemblyQueue,

    /// Effective maximum segment size, set when the route to the peer is
    /// known. RFC 6691: the payload bytes per segment, headers excluded.
    mss: Option<u32>,
    config: TcpConfig,

    /// When the retransmission timer started, `None` when stopped
    retx_start: Option<f64>,
    time_wait_ends_at: Option<f64>,
    /// When to send the next zero-window probe, `None` when not probing
    zwp_at: Option<f64>,
    zwps_sent: u32,

    rtt: RttEstimator,
    congestion: Congestion,

    /// 0 = no ACK owed, 1 = delayable, >= 2 = send at next opportunity
    ack_pending: u32,
    use_delayed_acks: bool,

    fin_pending: bool,
    fin_sent: bool,
    /// One past the FIN's sequence number, once sent
    fin_seqno: Option<u32>,
    fin_next_state: Option<State>,

    /// Bytes at the front of `tx_data` that still owe a PSH
    tx_push_bytes: usize,
    /// Bytes in `rx_data` that were delivered pushed and not yet read
    rx_push_bytes: usize,
    shut_rd: bool,

    /// Options carried by the SYN that spawned us (passive open)
    peer_syn: Option<TcpOptions>,
    /// Options carried by the SYN+ACK we received (active open)
    peer_synack: Option<TcpOptions>,
    use_ws_option: bool,
    /// Whether timestamps are in use; decided once the handshake fixes it
    use_ts_option: Option<bool>,
    /// Shift applied to windows the peer advertises
    snd_wnd_shift: u8,
    /// Shift we asked the peer to apply to windows we advertise
    rcv_wnd_shift: u8,
    ts_recent: Option<u32>,
    /// The last acknowledgment number we transmitted
    ts_last_ack: Option<u32>,
    /// Deterministic per-stack offset so both sides' tsvals differ
    ts_salt: u32,

    last_wnd_advertisement: u16,

    /// Listener state: connections ready to be accepted
    pub(super) accept_queue: std::collections::VecDeque<SocketId>,
    pub(super) accept_queue_max: usize,

    wakers: WakeList,
}

impl Socket {
    pub(super) fn new(config: TcpConfig, iss: u32, ts_salt: u32, parent: Option<SocketId>) -> Self {
        let mut use_delayed_acks = config.use_delayed_acks;
        if config.timer_granularity > 0.5 && use_delayed_acks {
            tracing::error!("timer granularity too coarse for delayed ACKs");
            use_delayed_acks = false;
        }
        Self {
            state: State::Initial,
            local: None,
            peer: None,
            parent,
            snd: SendSequenceSpace::new(iss),
            rcv: ReceiveSequenceSpace::new(config.rx_data_max as u32),
            tx_data: Message::default(),
            rx_data: Message::default(),
            retx_queue: RetransmitQueue::default(),
            rx_queue: ReassemblyQueue::default(),
            mss: None,
            retx_start: None,
            time_wait_ends_at: None,
            zwp_at: None,
            zwps_sent: 0,
            rtt: RttEstimator::new(config.timer_granularity),
            congestion: Congestion::new(iss),
            ack_pending: 0,
            use_delayed_acks,
            fin_pending: false,
            fin_sent: false,
            fin_seqno: None,
            fin_next_state: None,
            tx_push_bytes: 0,
            rx_push_bytes: 0,
            shut_rd: false,
            peer_syn: None,
            peer_synack: None,
            use_ws_option: false,
            use_ts_option: None,
            snd_wnd_shift: 0,
            rcv_wnd_shift: 0,
            ts_recent: None,
            ts_last_ack: None,
            ts_salt,
            last_wnd_advertisement: 0,
            accept_queue: Default::default(),
            accept_queue_max: 0,
            wakers: WakeList::default(),
            config,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn local(&self) -> Option<Endpoint> {
        self.local
    }

    pub fn peer(&self) -> Option<Endpoint> {
        self.peer
    }

    pub fn is_bound(&self) -> bool {
        self.local.is_some()
    }

    pub fn is_peered(&self) -> bool {
        self.peer.is_some()
    }

    pub(super) fn set_local(&mut self, local: Endpoint) {
        self.local = Some(local);
    }

    pub(super) fn set_peer(&mut self, peer: Endpoint) {
        self.peer = Some(peer);
    }

    pub(super) fn set_mss(&mut self, mss: u32) {
        if mss <= 400 {
            tracing::warn!("MSS of {mss} is very small");
        }
        self.mss = Some(mss);
    }

    pub(super) fn set_listening(&mut self, backlog: usize) {
        self.set_state(State::Listen);
        self.accept_queue_max = backlog;
    }

    fn set_state(&mut self, new: State) {
        if new != self.state {
            tracing::debug!("state {:?} -> {new:?}", self.state);
            self.state = new;
            // Might make a difference to someone
            self.unblock();
        }
    }

    pub(super) fn unblock(&mut self) {
        self.wakers.wake_all();
    }

    pub(super) fn register_waker(&mut self, wake: Box<dyn FnOnce()>) {
        self.wakers.register(wake);
    }

    /// Sender MSS. The default applies only before the route is known and
    /// matches the RFC 1122 s4.2.2.6 default of 536.
    fn smss(&self) -> u32 {
        self.mss.unwrap_or(536)
    }

    /// Receiver MSS. No separate negotiation; same as the sender's.
    fn rmss(&self) -> u32 {
        self.smss()
    }

    /// Bytes in flight: sent but not yet acknowledged.
    fn flight_size(&self) -> u32 {
        self.snd.nxt.wrapping_sub(self.snd.una)
    }

    /// Called when the socket is done for: unregister and become CLOSED.
    fn delete_tcb(&mut self) {
        self.set_state(State::Closed);
        tracing::info!("deleting TCB");
    }

    // -----------------------------------------------------------------
    //  Socket-like interface
    // -----------------------------------------------------------------

    pub(super) fn start_connect(&mut self, now: f64, host: &mut dyn Host) {
        self.set_state(State::SynSent);
        let syn = self.make_segment(now, Control::SYN, Some(self.snd.iss), None, Message::default());
        self.tx(syn, now, host);
    }

    /// Initializes a socket spawned by a listener in response to a SYN and
    /// sends the SYN+ACK (RFC 793 p66).
    pub(super) fn start_passive(&mut self, syn: &TcpHeader, now: f64, host: &mut dyn Host) {
        self.peer_syn = Some(syn.options);
        self.set_state(State::SynReceived);
        self.rcv.irs = syn.seq;
        self.rcv.nxt = syn.seq.wrapping_add(1);
        let syn_ack = self.make_segment(
            now,
            Control::SYN | Control::ACK,
            Some(self.snd.iss),
            None,
            Message::default(),
        );
        self.tx(syn_ack, now, host);
    }

    pub(super) fn send(
        &mut self,
        data: &[u8],
        push: bool,
        now: f64,
        host: &mut dyn Host,
    ) -> Result<usize, TcpError> {
        // RFC 793 p56, except that states the RFC queues sends from just
        // reject here
        if self.fin_pending || self.fin_sent {
            return Err(TcpError::BadState(self.state));
        }
        match self.state {
            State::Closed => Err(TcpError::Closed),
            State::Established | State::CloseWait => {
                let remaining = self.config.tx_data_max.saturating_sub(self.tx_data.len());
                let accepted = data.len().min(remaining);
                self.tx_data.concatenate(Message::new(&data[..accepted]));
                if push {
                    self.tx_push_bytes = self.tx_data.len();
                }
                self.maybe_send(now, host);
                Ok(accepted)
            }
            state => Err(TcpError::BadState(state)),
        }
    }

    /// Returns up to `length` buffered bytes without blocking, `None` once
    /// no more data can ever arrive.
    pub(super) fn recv(
        &mut self,
        length: Option<usize>,
        now: f64,
        host: &mut dyn Host,
    ) -> Result<Option<Message>, TcpError> {
        if self.shut_rd {
            return Err(TcpError::ShutForReading);
        }
        if matches!(self.state, State::Listen | State::Initial) {
            // Never anything to read on LISTEN sockets!
            return Err(TcpError::BadState(self.state));
        }

        let length = length.unwrap_or(self.rx_data.len()).min(self.rx_data.len());
        let data = self.rx_data.cut(length);

        if self.rx_push_bytes > 0 {
            self.rx_push_bytes = self.rx_push_bytes.saturating_sub(data.len());
            if self.rx_push_bytes == 0 {
                tracing::debug!("all pushed RX data has been read");
            }
        }

        self.rcv.wnd = (self.config.rx_data_max - self.rx_data.len()) as u32;

        // Update the other side if reading reopened a window that had been
        // closed or small enough to stall the sender.
        let cur = self.wnd_advertisement();
        let prv = self.last_wnd_advertisement;
        self.last_wnd_advertisement = cur;
        if prv == 0 && cur != 0 {
            tracing::warn!("local window had closed");
            self.set_ack_pending(false);
            self.maybe_send_pending_ack(false, now, host);
        } else if cur > prv {
            let shift = if self.use_ws_option { self.rcv_wnd_shift } else { 0 };
            let prv = (prv as u32) << shift;
            let cur = (cur as u32) << shift;
            let split = self.rmss() * 10;
            if prv < split && cur >= split {
                tracing::info!("local window had been small");
                if self.ack_pending == 0 {
                    self.ack_pending = 1;
                }
                self.maybe_send_pending_ack(false, now, host);
            }
        }

        if data.is_empty() && matches!(self.state, State::CloseWait | State::Closed) {
            return Ok(None);
        }
        Ok(Some(data))
    }

    pub(super) fn shutdown(&mut self, how: ShutdownKind, now: f64, host: &mut dyn Host) {
        if how.shuts_write() && !(self.fin_sent || self.fin_pending) {
            self.set_fin_pending(None, now, host);
            self.tx_push_bytes = self.tx_data.len();
        }
        if how.shuts_read() {
            self.shut_read_side();
        }
    }

    /// RFC 793 p60 close processing. Returns whether the manager should
    /// delete the TCB outright.
    pub(super) fn close(&mut self, now: f64, host: &mut dyn Host) -> Result<bool, TcpError> {
        match self.state {
            State::Closed => Err(TcpError::Closed),
            State::Initial => Err(TcpError::BadState(State::Initial)),
            State::Listen => {
                self.delete_tcb();
                Ok(true)
            }
            State::SynSent => {
                self.shutdown(ShutdownKind::Both, now, host);
                self.delete_tcb();
                Ok(true)
            }
            State::SynReceived | State::Established => {
                // send() is only legal from ESTABLISHED and CLOSE_WAIT, so
                // unlike the RFC we never have to queue the close from
                // SYN_RECEIVED for later.
                if self.fin_pending || self.fin_sent {
                    return Err(TcpError::BadState(self.state));
                }
                self.shut_read_side();
                self.tx_push_bytes = self.tx_data.len();
                // The transition happens when the FIN actually goes out;
                // until the send buffer drains we keep accepting ACKs here.
                self.set_fin_pending(Some(State::FinWait1), now, host);
                Ok(false)
            }
            State::FinWait1 | State::FinWait2 => Err(TcpError::BadState(self.state)),
            State::CloseWait => {
                self.shut_read_side();
                if self.fin_pending || self.fin_sent {
                    tracing::warn!("close() called while socket shutting down");
                } else {
                    self.tx_push_bytes = self.tx_data.len();
                    self.set_fin_pending(Some(State::LastAck), now, host);
                }
                Ok(false)
            }
            State::Closing | State::LastAck | State::TimeWait => {
                Err(TcpError::BadState(self.state))
            }
        }
    }

    fn shut_read_side(&mut self) {
        self.shut_rd = true;
        // Make the advertised window go back up
        self.rx_data = Message::default();
        self.rx_push_bytes = 0;
        self.rcv.wnd = self.config.rx_data_max as u32;
    }

    pub(super) fn bytes_readable(&self) -> usize {
        if self.state == State::Listen || self.shut_rd {
            return 0;
        }
        self.rx_data.len()
    }

    pub(super) fn bytes_writable(&self) -> usize {
        if self.fin_pending || self.fin_sent {
            return 0;
        }
        match self.state {
            State::Established | State::CloseWait => {
                self.config.tx_data_max.saturating_sub(self.tx_data.len())
            }
            _ => 0,
        }
    }

    // -----------------------------------------------------------------
    //  Sending
    // -----------------------------------------------------------------

    /// Builds a segment for this connection. The sequence number defaults to
    /// `snd.nxt`, in which case `snd.nxt` advances past the text; control
    /// segments that reuse old sequence space pass an explicit `seq`. The
    /// acknowledgment field always carries `rcv.nxt` unless overridden.
    fn make_segment(
        &mut self,
        now: f64,
        ctl: Control,
        seq: Option<u32>,
        ack_no: Option<u32>,
        text: Message,
    ) -> Segment {
        let local = self.local.expect("cannot build a segment while unbound");
        let peer = self.peer.expect("cannot build a segment while unpeered");

        let advance = seq.is_none();
        let seq = seq.unwrap_or(self.snd.nxt);
        let ack_value = ack_no.unwrap_or(self.rcv.nxt);
        let mut builder = TcpHeaderBuilder::new(local.port, peer.port, seq)
            .ctl(ctl)
            .ack_no(ack_value);

        // Window scaling is negotiated in the handshake: always offered on
        // our SYN, echoed on a SYN+ACK only if the peer's SYN carried it
        // (RFC 7323 s2.2)
        if self.config.allow_ws_option && ctl.syn() {
            let offer = if ctl.ack() {
                self.peer_syn.map_or(false, |options| options.window_scale.is_some())
            } else {
                true
            };
            if offer {
                let mut wnd = self.rcv.wnd;
                let mut shift = 0u8;
                while wnd > 0xffff {
                    wnd >>= 1;
                    shift += 1;
                }
                self.rcv_wnd_shift = shift.min(14);
                builder = builder.window_scale(self.rcv_wnd_shift);
            } else {
                self.rcv_wnd_shift = 0;
            }
        }

        if self.config.allow_ts_option {
            let add_ts = if ctl.syn() && !ctl.ack() {
                // Offer the timestamp option
                true
            } else if ctl.syn() && ctl.ack() {
                match self.peer_syn.and_then(|options| options.timestamp) {
                    Some(ts) => {
                        // The SYN hasn't been through timestamp processing,
                        // so pick up ts.recent here
                        self.ts_recent = Some(ts.value);
                        true
                    }
                    None => false,
                }
            } else {
                match self.use_ts_option {
                    Some(use_ts) => use_ts,
                    None => match self.peer_syn.or(self.peer_synack) {
                        Some(options) => {
                            let use_ts = options.timestamp.is_some();
                            self.use_ts_option = Some(use_ts);
                            use_ts
                        }
                        None => {
                            tracing::error!("no SYN recorded for timestamp negotiation");
                            false
                        }
                    },
                }
            };
            if add_ts {
                let value = self.generate_timestamp(now);
                let echo = if ctl.ack() { self.ts_recent.unwrap_or(0) } else { 0 };
                builder = builder.timestamp(value, echo);
            }
        }

        let advert = self.wnd_advertisement();
        builder = builder.wnd(advert);
        self.last_wnd_advertisement = advert;

        if advance {
            self.snd.nxt = self.snd.nxt.wrapping_add(text.len() as u32);
        }

        let header = builder.build(local.address, peer.address, &text);
        Segment::new(header, text)
    }

    fn emit(&self, segment: Segment, host: &mut dyn Host) {
        let local = self.local.expect("cannot emit while unbound");
        let peer = self.peer.expect("cannot emit while unpeered");
        host.emit(Ipv4Packet::new(local.address, peer.address, segment));
    }

    /// First transmission of a segment. Anything occupying sequence space
    /// goes on the retransmission queue; the timer starts if it was stopped
    /// (RFC 6298 5.1).
    fn tx(&mut self, segment: Segment, now: f64, host: &mut dyn Host) {
        self.congestion.last_send_ts = Some(now);
        if segment.header.ctl.ack() {
            self.ack_pending = 0;
            self.ts_last_ack = Some(segment.header.ack);
        }
        let retransmittable = segment.seg_len() > 0;
        self.emit(segment.clone(), host);
        if retransmittable {
            self.retx_queue.push(Transmit::new(segment, now));
            if self.retx_start.is_none() {
                self.retx_start = Some(now);
            }
        }
    }

    /// Segmentizes and transmits whatever `tx_data`, the peer's window, and
    /// the congestion window allow.
    fn maybe_send(&mut self, now: f64, host: &mut dyn Host) {
        self.maybe_handle_zero_window(now, host);

        if self.tx_data.is_empty() {
            return;
        }
        if self.fin_sent {
            tracing::error!("have data to send, but FIN already sent");
            return;
        }

        let smss = self.smss();

        // RFC 5681 s4.1: an idle connection restarts from RW to get the ACK
        // clock going again
        if let Some(last_send) = self.congestion.last_send_ts {
            if now - last_send > self.rtt.rto() {
                let rw = self.congestion.restart_window(smss);
                tracing::debug!("idle restart, cwnd = {rw}");
                self.congestion.set_cwnd(rw as i64);
                self.congestion.last_send_ts = None;
            }
        }

        let flight = self.flight_size();
        let available = self.tx_data.len() as u32;
        let cwnd = self.congestion.cwnd(smss);
        // Limited transmit (RFC 3042): the first two duplicate ACKs may each
        // clock out one extra segment beyond cwnd
        let lt_delta = if matches!(self.congestion.dup_ack_count, 1 | 2) {
            (self.congestion.dup_ack_count * smss)
                .saturating_sub(self.congestion.limited_transmit_sent)
        } else {
            0
        };
        let budget = |cwnd: u32| available.min(self.snd.wnd.min(cwnd).saturating_sub(flight));
        let total = budget(cwnd + lt_delta);
        if total == 0 {
            return;
        }
        let limited_transmit_sent = total - budget(cwnd);
        self.congestion.limited_transmit_sent += limited_transmit_sent;
        if limited_transmit_sent > 0 {
            tracing::info!("{limited_transmit_sent} bytes sent due to limited transmit");
        }

        let mut remaining = total;
        let mut count = 0u32;
        while remaining > 0 {
            let size = remaining.min(smss);
            remaining -= size;
            let data = self.tx_data.cut(size as usize);

            let mut ctl = Control::ACK;
            if self.tx_push_bytes > 0 {
                self.tx_push_bytes = self.tx_push_bytes.saturating_sub(size as usize);
                if self.tx_push_bytes == 0 {
                    // PSH goes on the last segment of the push, RFC 793 p46
                    ctl = ctl | Control::PSH;
                }
            }

            let segment = self.make_segment(now, ctl, None, None, data);
            self.tx(segment, now, host);
            count += 1;
        }
        tracing::debug!(
            "sent {count} segment(s), {total} payload bytes, {} buffered",
            self.tx_data.len()
        );
    }

    /// RFC 6298 5.2/5.3: restart the timer while anything is outstanding,
    /// stop it once the queue drains.
    fn reset_retx_timer(&mut self, now: f64) {
        if self.retx_queue.is_empty() {
            self.retx_start = None;
        } else {
            self.retx_start = Some(now);
        }
    }

    /// Retransmission. With `seqno` of `None` this is the RTO path, run from
    /// the timer: on expiry, up to `retx_on_rto_count` segments go out and
    /// congestion control reacts. With a sequence number it is a fast
    /// retransmission of the single covering segment, using the current
    /// acknowledgment and window rather than the original's (RFC 6298 5.4).
    fn maybe_retx(&mut self, seqno: Option<u32>, now: f64, host: &mut dyn Host) -> u32 {
        let from_timer = seqno.is_none();

        if self.state == State::Closed {
            return 0;
        }
        if from_timer {
            match self.retx_start {
                // No timer running
                None => return 0,
                Some(start) => {
                    if start + self.rtt.rto() > now {
                        return 0; // Not expired yet
                    }
                }
            }

            self.congestion.recover = self.snd.nxt.wrapping_sub(1);
            if self.congestion.in_fast_recovery {
                self.congestion.exit_recovery();
            }
        }

        // An expired RTO may mean multiple losses; had it been a single one
        // we would likely have entered fast recovery instead. So the timer
        // path may retransmit a batch.
        let maximum = if from_timer {
            self.config.retx_on_rto_count.unwrap_or(u32::MAX) as usize
        } else {
            1
        };

        let start_index = match seqno {
            Some(seqno) => match self.retx_queue.position_of(seqno) {
                Some(index) => index,
                None => {
                    tracing::warn!("no queued segment covers {seqno} for fast retransmit");
                    0
                }
            },
            None => 0,
        };

        let mut sent = 0;
        for which in 0..maximum {
            let index = which + start_index;
            let (old_segment, tx_ts, timeout_count) = match self.retx_queue.get_mut(index) {
                Some(entry) => (entry.segment.clone(), entry.tx_ts, entry.timeout_count),
                None => break,
            };

            if old_segment.header.ctl.ack() {
                self.ack_pending = 0;
            }
            let segment = self.make_segment(
                now,
                old_segment.header.ctl,
                Some(old_segment.header.seq),
                None,
                old_segment.text,
            );
            if segment.header.ctl.ack() {
                self.ts_last_ack = Some(segment.header.ack);
            }
            if let Some(entry) = self.retx_queue.get_mut(index) {
                entry.segment = segment.clone();
                entry.tx_ts = tx_ts;
                entry.retx_ts = Some(now);
                entry.timeout_count = timeout_count + 1;
            }
            tracing::debug!(
                "retx seq {} len {} rto {:.3}",
                segment.header.seq.wrapping_sub(self.snd.iss),
                segment.text.len(),
                self.rtt.rto(),
            );
            self.emit(segment, host);
            sent += 1;

            if which == 0 && from_timer {
                // Inform CC of the timeout and leave fast recovery
                // (RFC 6582 s3.1)
                self.congestion
                    .on_rto_retransmit(timeout_count == 0, self.flight_size(), self.smss());
                self.congestion.exit_recovery();
                // RFC 6298 5.5
                self.rtt.back_off();
            }

            // RFC 6298 5.7
            if self.state == State::SynSent {
                self.rtt.apply_syn_floor();
            }
        }

        // RFC 6298 5.6
        self.reset_retx_timer(now);
        sent
    }

    // -----------------------------------------------------------------
    //  Receive pipeline
    // -----------------------------------------------------------------

    /// Processes one arriving segment end to end: RTT bookkeeping, per-state
    /// handling, replay of queued out-of-order segments, then a send
    /// opportunity and any owed ACK or FIN.
    pub(super) fn rx(&mut self, segment: Segment, ctx: RxContext, host: &mut dyn Host) -> RxEffects {
        let mut effects = RxEffects::default();

        // RTT and timestamp state updates happen in arrival order rather
        // than replay order, but only for segments near the expected window
        if !matches!(self.state, State::Closed | State::Listen | State::SynSent) {
            let half_window = self.rcv.wnd / 2;
            let lo = self.rcv.nxt.wrapping_sub(half_window);
            let hi = self.rcv.nxt.wrapping_add(half_window);
            if mod_geq(segment.header.seq, lo) && mod_leq(segment.header.seq, hi) {
                if self.use_ts_option == Some(true) {
                    self.process_timestamp(&segment.header, ctx.now);
                } else {
                    self.maybe_update_rto(&segment.header, ctx.now);
                }
            }
        }

        if self.rx_one(segment, &ctx, host, &mut effects) {
            return effects;
        }

        // The new segment may have filled the gap in front of queued
        // segments; replay everything now in order
        while let Some(head_seq) = self.rx_queue.next_seq() {
            if !mod_leq(head_seq, self.rcv.nxt) {
                break;
            }
            let queued = self.rx_queue.pop().expect("peeked entry is poppable");
            tracing::debug!(
                "replaying queued segment (seq {} nxt {})",
                queued.header.seq.wrapping_sub(self.rcv.irs),
                self.rcv.nxt.wrapping_sub(self.rcv.irs),
            );
            if self.rx_one(queued, &ctx, host, &mut effects) {
                return effects;
            }
        }

        self.maybe_send(ctx.now, host);

        // RFC 1122 s4.2.2.20: when a series of queued segments is processed,
        // they must all be processed before ACKing them, so owed ACKs go out
        // here. maybe_send has piggybacked one if it sent anything.
        self.maybe_send_pending_ack(false, ctx.now, host);
        self.maybe_send_pending_fin(ctx.now, host);
        self.maybe_handle_zero_window(ctx.now, host);
        self.unblock();

        effects
    }

    /// Dispatches one segment by state. Returns true once the connection has
    /// closed and processing must stop.
    fn rx_one(
        &mut self,
        segment: Segment,
        ctx: &RxContext,
        host: &mut dyn Host,
        effects: &mut RxEffects,
    ) -> bool {
        match self.state {
            State::Closed => self.rx_closed(segment, ctx.now, host),
            State::SynSent => self.rx_syn_sent(segment, ctx, host, effects),
            _ => self.rx_other(segment, ctx, host, effects),
        }
        if self.state == State::Closed {
            effects.closed = true;
            true
        } else {
            false
        }
    }

    /// RFC 793 p65: anything but a RST arriving for a closed connection gets
    /// a RST shaped after the offending segment.
    fn rx_closed(&mut self, segment: Segment, now: f64, host: &mut dyn Host) {
        let (header, text) = segment.into_inner();
        if header.ctl.rst() {
            return;
        }
        let reply = if header.ctl.ack() {
            self.make_segment(now, Control::RST, Some(header.ack), None, Message::default())
        } else {
            let seg_len =
                text.len() as u32 + header.ctl.syn() as u32 + header.ctl.fin() as u32;
            self.make_segment(
                now,
                Control::RST | Control::ACK,
                Some(0),
                Some(header.seq.wrapping_add(seg_len)),
                Message::default(),
            )
        };
        self.tx(reply, now, host);
    }

    /// RFC 793 p66: segment arrives in SYN-SENT.
    fn rx_syn_sent(
        &mut self,
        segment: Segment,
        ctx: &RxContext,
        host: &mut dyn Host,
        effects: &mut RxEffects,
    ) {
        let (header, text) = segment.into_inner();
        let is_other = header.ctl.urg() || !text.is_empty();

        // first: check the ACK
        let mut ack_ok = false;
        if header.ctl.ack() {
            if mod_leq(header.ack, self.snd.iss) || mod_gt(header.ack, self.snd.nxt) {
                if header.ctl.rst() {
                    return;
                }
                let reply =
                    self.make_segment(ctx.now, Control::RST, Some(header.ack), None, Message::default());
                self.tx(reply, ctx.now, host);
                return;
            }
            if mod_leq(self.snd.una, header.ack) && mod_leq(header.ack, self.snd.nxt) {
                ack_ok = true;
            } else {
                tracing::warn!("unacceptable ACK in SYN_SENT");
            }
        }

        // second: check the RST
        if header.ctl.rst() {
            if ack_ok {
                tracing::error!("connection reset");
                self.delete_tcb();
            }
            return;
        }

        // third: security checks are ignored

        // fourth: check the SYN (p68)
        if !header.ctl.syn() {
            return;
        }
        self.rcv.irs = header.seq;
        self.rcv.nxt = header.seq.wrapping_add(1);
        if header.ctl.ack() {
            // Any queued segments would be removed here per the RFC, but we
            // cannot have sent data before ESTABLISHED
            self.snd_una_advance(header.ack);
        }

        if mod_gt(self.snd.una, self.snd.iss) {
            // Our SYN is acknowledged: this was a SYN+ACK
            self.peer_synack = Some(header.options);
            if !self.establish(ctx, effects) {
                return;
            }

            // RFC 1122 p94 (c)
            self.snd.wnd = self.read_wnd(&header);
            self.snd.wl1 = header.seq;
            self.snd.wl2 = header.ack;

            self.set_ack_pending(false);

            if ack_ok {
                self.process_ack(header.ack);
                self.snd_una_advance(header.ack);
                self.reset_retx_timer(ctx.now); // RFC 6298 5.3
            }
        } else {
            // Simultaneous open: answer the bare SYN with our SYN+ACK. The
            // SYN+ACK covers the queued SYN's sequence number, so it
            // replaces it on the retransmission queue.
            self.peer_syn = Some(header.options);
            self.retx_queue.clear();
            let syn_ack = self.make_segment(
                ctx.now,
                Control::SYN | Control::ACK,
                Some(self.snd.iss),
                None,
                Message::default(),
            );
            self.tx(syn_ack, ctx.now, host);
            self.set_state(State::SynReceived);
            if is_other {
                tracing::error!("double-active connect SYN had control or data");
            }
            return;
        }

        if is_other {
            tracing::error!("SYN_SENT got control or data it won't handle");
        }
    }

    /// RFC 793 p69: segment arrives, all synchronized states.
    fn rx_other(
        &mut self,
        segment: Segment,
        ctx: &RxContext,
        host: &mut dyn Host,
        effects: &mut RxEffects,
    ) {
        let (header, text) = segment.into_inner();
        let text_len = text.len();
        let seg_len = text_len as u32 + header.ctl.syn() as u32 + header.ctl.fin() as u32;

        // first: acceptability
        if !self.rcv.is_acceptable(header.seq, seg_len) {
            if header.ctl.rst() {
                return;
            }
            tracing::debug!("unacceptable segment dropped");
            self.set_ack_pending(false);
            return;
        }

        if header.seq == self.rcv.nxt {
            // The common case: exactly the segment we were waiting for
        } else if mod_lt(header.seq, self.rcv.nxt) {
            // Starts in the past; may still hold new in-window data, and the
            // payload processing trims the overlap. ACK it either way
            // (RFC 5681 p8)
            self.set_ack_pending(false);
            tracing::debug!("segment with old sequence number");
        } else {
            // From the future; hold it until the gap fills
            tracing::debug!(
                "future segment queued (seq {} nxt {})",
                header.seq.wrapping_sub(self.rcv.irs),
                self.rcv.nxt.wrapping_sub(self.rcv.irs),
            );
            self.rx_queue.push(Segment::new(header, text));
            self.set_ack_pending(false);
            return;
        }

        // second: check the RST
        if header.ctl.rst() {
            match self.state {
                State::SynReceived => {
                    if self.parent.is_none() {
                        // Refused double-active open
                        tracing::error!("connection refused");
                    }
                    // For a passive open the RFC returns the connection to
                    // LISTEN, but this socket never was the listener, so it
                    // just goes away
                    self.delete_tcb();
                }
                State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait => {
                    tracing::error!("connection reset");
                    self.delete_tcb();
                }
                State::Closing | State::LastAck | State::TimeWait => {
                    self.delete_tcb();
                }
                _ => {}
            }
            return;
        }

        // third: security checks are ignored

        // fourth: check the SYN (p71)
        if header.ctl.syn() {
            if self.state == State::SynReceived && self.parent.is_some() {
                // RFC 1122 p94 (e); cleaning up this socket stands in for
                // returning to LISTEN, which the listener never left
                self.delete_tcb();
                return;
            }
            // A SYN here is always in the window, which the RFC calls an
            // error: reset the connection
            tracing::error!("connection reset (by SYN)");
            let reply = self.make_segment(
                ctx.now,
                Control::RST | Control::ACK,
                Some(header.ack),
                None,
                Message::default(),
            );
            self.tx(reply, ctx.now, host);
            self.delete_tcb();
            return;
        }

        // fifth: check the ACK (p72)
        if !header.ctl.ack() {
            return;
        }
        let ack = header.ack;

        if self.state == State::SynReceived {
            if mod_leq(self.snd.una, ack) && mod_leq(ack, self.snd.nxt) {
                if !self.establish(ctx, effects) {
                    return;
                }
                // RFC 1122 p94 (f)
                self.snd.wnd = self.read_wnd(&header);
                self.snd.wl1 = header.seq;
                self.snd.wl2 = header.ack;
            } else {
                let reply =
                    self.make_segment(ctx.now, Control::RST, Some(ack), None, Message::default());
                self.tx(reply, ctx.now, host);
                return;
            }
        }

        match self.state {
            State::Established
            | State::FinWait1
            | State::FinWait2
            | State::CloseWait
            | State::Closing => {
                if mod_gt(ack, self.snd.nxt) {
                    // Acking beyond what we've sent: ACK and ignore
                    self.set_ack_pending(false);
                    tracing::info!("bad ACK ignored");
                    return;
                }
                if mod_lt(ack, self.snd.una) {
                    tracing::debug!(
                        "old duplicate ACK for {}",
                        ack.wrapping_sub(self.snd.iss)
                    );
                }

                if mod_leq(self.snd.una, ack) && mod_leq(ack, self.snd.nxt) {
                    // Fast retransmit / recovery bookkeeping, RFC 5681 s3.2
                    if self.is_dup_ack(&header, text_len) {
                        self.congestion.dup_ack_count += 1;
                        tracing::debug!("duplicate ACKs: {}", self.congestion.dup_ack_count);

                        if !self.congestion.in_fast_recovery {
                            if self.congestion.dup_ack_count == 1 {
                                // Limited transmit window opens, RFC 3042
                                self.congestion.limited_transmit_sent = 0;
                            } else if self.congestion.dup_ack_count == 3
                                && mod_gt(ack.wrapping_sub(1), self.congestion.recover)
                            {
                                // Enter fast recovery (RFC 6582 s3.2); the
                                // recover guard keeps stale dup ACKs from
                                // re-triggering it
                                let smss = self.smss();
                                let flight = self.flight_size();
                                self.congestion.recover = self.snd.nxt.wrapping_sub(1);
                                self.congestion.in_fast_recovery = true;
                                self.congestion.ssthresh =
                                    (flight.saturating_sub(self.congestion.limited_transmit_sent)
                                        / 2)
                                    .max(2 * smss);
                                self.congestion
                                    .set_cwnd((self.congestion.ssthresh + 3 * smss) as i64);
                                tracing::info!(
                                    "fast retransmit at {}",
                                    self.snd.una.wrapping_sub(self.snd.iss)
                                );
                                if self.maybe_retx(Some(self.snd.una), ctx.now, host) == 0 {
                                    tracing::warn!("no retransmission in fast retransmit");
                                }
                            }
                        } else {
                            // Each further dup ACK means a segment left the
                            // network: inflate
                            let cwnd = self.congestion.cwnd(self.smss()) + self.smss();
                            self.congestion.set_cwnd(cwnd as i64);
                        }
                    } else {
                        self.congestion.dup_ack_count = 0;
                    }

                    self.process_ack(ack);

                    if mod_lt(self.snd.una, ack) {
                        self.on_unacked_data_acked(ack, ctx.now, host);
                        self.snd_una_advance(ack);
                        self.reset_retx_timer(ctx.now); // RFC 6298 5.3
                    }

                    // Window update
                    if mod_lt(self.snd.wl1, header.seq)
                        || (self.snd.wl1 == header.seq && mod_leq(self.snd.wl2, ack))
                    {
                        self.snd.wnd = self.read_wnd(&header);
                        self.snd.wl1 = header.seq;
                        self.snd.wl2 = ack;
                    }
                }

                if self.state == State::FinWait1 {
                    if self.acks_our_fin(ack) {
                        self.set_state(State::FinWait2);
                    }
                } else if self.state == State::Closing {
                    if self.acks_our_fin(ack) {
                        self.start_time_wait(ctx.now);
                    }
                }
            }
            State::LastAck => {
                // p73: only our FIN's acknowledgment matters now
                if self.acks_our_fin(ack) {
                    self.delete_tcb();
                    return;
                }
            }
            State::TimeWait => {
                // A retransmission of the remote FIN; ACK it and restart the
                // 2 MSL timeout
                self.set_ack_pending(false);
                self.start_time_wait(ctx.now);
                return;
            }
            _ => {}
        }

        // sixth: check the URG bit
        if header.ctl.urg() {
            tracing::error!("urgent data not supported");
            return;
        }

        // seventh: process the segment text (p74)
        if text_len > 0 {
            if matches!(
                self.state,
                State::Established | State::FinWait1 | State::FinWait2
            ) {
                self.process_payload(&header, text);
            } else {
                tracing::warn!("got data while in state {:?}", self.state);
            }
        }

        // eighth: check the FIN (p75)
        if header.ctl.fin() {
            tracing::debug!("got FIN");

            // The FIN is conceptually after the payload
            let fin_seq = header.seq.wrapping_add(text_len as u32);
            if self.rcv.nxt == fin_seq {
                // Advance over the FIN
                self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
            } else {
                tracing::warn!(
                    "FIN seq isn't rcv.nxt ({fin_seq} != {}), payload {text_len}",
                    self.rcv.nxt
                );
            }
            self.set_ack_pending(false);

            match self.state {
                State::SynReceived | State::Established => self.set_state(State::CloseWait),
                State::FinWait1 => {
                    if self.acks_our_fin(header.ack) {
                        self.start_time_wait(ctx.now);
                    } else {
                        self.set_state(State::Closing);
                    }
                }
                State::FinWait2 => self.start_time_wait(ctx.now),
                State::TimeWait => self.start_time_wait(ctx.now),
                _ => {}
            }
        }
    }

    /// RFC 793 p74: append in-window text, trimming anything we already
    /// have and clamping to the receive window.
    fn process_payload(&mut self, header: &TcpHeader, mut text: Message) {
        if mod_lt(header.seq, self.rcv.nxt) {
            // Overlaps data we already have; cut off the beginning
            let offset = self.rcv.nxt.wrapping_sub(header.seq) as usize;
            if offset >= text.len() {
                return;
            }
            text.remove_front(offset);
        }

        if text.len() as u32 > self.rcv.wnd {
            // Partial receive of whatever fits
            text.truncate(self.rcv.wnd as usize);
        }
        if text.is_empty() {
            return;
        }

        self.rcv.nxt = self.rcv.nxt.wrapping_add(text.len() as u32);
        self.rcv.wnd -= text.len() as u32;

        self.set_ack_pending(true);

        let pushed = header.ctl.psh() || header.ctl.fin(); // FIN implies PSH
        if !self.shut_rd {
            // If reading is shut, the data just disappears
            self.rx_data.concatenate(text);
        }
        if pushed {
            self.rx_push_bytes = self.rx_data.len();
        }

        self.unblock();
    }

    /// Enters ESTABLISHED. For a passively-opened socket this is also the
    /// moment it becomes accept()able, so a full accept queue fails the
    /// establishment and the triggering segment is dropped.
    fn establish(&mut self, ctx: &RxContext, effects: &mut RxEffects) -> bool {
        if self.parent.is_some() {
            if !ctx.accept_has_room {
                return false;
            }
            effects.established = true;
        }

        // Window scaling is on only when both SYNs carried the option
        // (RFC 7323 s2.2)
        let handshake_options = self.peer_syn.or(self.peer_synack);
        match handshake_options.and_then(|options| options.window_scale) {
            Some(shift) if self.config.allow_ws_option => {
                self.use_ws_option = true;
                if shift > 14 {
                    // RFC 7323 s2.3: shift is at most 14
                    tracing::warn!("got window scale option with shift of {shift}");
                }
                self.snd_wnd_shift = shift.min(14);
            }
            _ => {
                self.use_ws_option = false;
                self.snd_wnd_shift = 0;
                self.rcv_wnd_shift = 0;
            }
        }

        self.set_state(State::Established);
        true
    }

    /// Reads the window a segment advertises, applying the negotiated scale.
    /// The window of a SYN segment is never scaled (RFC 7323 s2.2).
    fn read_wnd(&self, header: &TcpHeader) -> u32 {
        if header.ctl.syn() {
            header.wnd as u32
        } else {
            (header.wnd as u32) << self.snd_wnd_shift
        }
    }

    /// The window to advertise, scaled down and clamped to the field width.
    fn wnd_advertisement(&self) -> u16 {
        let shift = if self.use_ws_option { self.rcv_wnd_shift } else { 0 };
        (self.rcv.wnd >> shift).min(0xffff) as u16
    }

    // -----------------------------------------------------------------
    //  ACK processing
    // -----------------------------------------------------------------

    /// RFC 5681 s2 p4: an ACK that advances nothing, carries nothing, and
    /// repeats the window while we have data outstanding.
    fn is_dup_ack(&self, header: &TcpHeader, text_len: usize) -> bool {
        header.ctl.ack()
            && !(self.tx_data.is_empty() && self.retx_queue.is_empty())
            && text_len == 0
            && !header.ctl.syn()
            && !header.ctl.fin()
            && header.ack == self.snd.una
            && self.read_wnd(header) == self.snd.wnd
    }

    /// Drops acknowledged entries from the retransmission queue.
    fn process_ack(&mut self, ack: u32) {
        let removed = self.retx_queue.ack_through(ack);
        if removed > 0 || !self.retx_queue.is_empty() {
            tracing::debug!(
                "removed {removed} segment(s) from retx queue ({} remain)",
                self.retx_queue.len()
            );
        }
    }

    /// Advances `snd.una`, dragging the NewReno recovery point along when
    /// the window wraps past it (RFC 6582 s6 p10).
    fn snd_una_advance(&mut self, ackno: u32) {
        let was_past_recover = mod_geq(self.snd.una, self.congestion.recover);
        self.snd.una = ackno;
        if !self.congestion.in_fast_recovery
            && mod_geq(self.snd.una, self.congestion.recover) != was_past_recover
        {
            self.congestion.recover = self.snd.una;
        }
    }

    /// Congestion response to an ACK of new data: NewReno full/partial ACK
    /// processing inside fast recovery (RFC 6582 s3.2), slow start or
    /// congestion avoidance outside it (RFC 5681 s3.1). Runs before
    /// `snd.una` advances so flight still includes the newly-acked bytes.
    fn on_unacked_data_acked(&mut self, ack: u32, now: f64, host: &mut dyn Host) {
        let acked_bytes = ack.wrapping_sub(self.snd.una);
        let smss = self.smss();

        if self.congestion.in_fast_recovery {
            if mod_gt(ack, self.congestion.recover) {
                // Full acknowledgment: deflate and leave recovery
                tracing::debug!("fast recovery full ACK");
                let cwnd = self
                    .congestion
                    .ssthresh
                    .min(self.flight_size().max(smss) + smss);
                self.congestion.set_cwnd(cwnd as i64);
                self.congestion.exit_recovery();
            } else {
                // Partial acknowledgment: the next hole is right at snd.una
                tracing::debug!("fast recovery partial ACK");
                if self.maybe_retx(Some(self.snd.una), now, host) == 0 {
                    tracing::warn!("no retransmission on NewReno partial ACK");
                }
                let cwnd = self.congestion.cwnd(smss) as i64 - acked_bytes as i64
                    + if acked_bytes >= smss { smss as i64 } else { 0 };
                self.congestion.set_cwnd(cwnd);
                self.congestion.partial_ack_count += 1;
                if self.congestion.partial_ack_count == 1 {
                    // Only the first partial ACK resets the timer
                    self.reset_retx_timer(now);
                }
            }
            return;
        }

        self.congestion.open_window(acked_bytes, smss);
    }

    // -----------------------------------------------------------------
    //  ACK management
    // -----------------------------------------------------------------

    /// Notes that an ACK is owed. A delayable request adds one, anything
    /// else adds two; the flush threshold is two, so a single delayable
    /// request waits for the timer (or a second request) while everything
    /// else goes out with the next flush.
    fn set_ack_pending(&mut self, delayable: bool) {
        let delayable = delayable && self.use_delayed_acks;
        self.ack_pending += if delayable { 1 } else { 2 };
    }

    /// Sends an owed ACK. The timer calls this with `ignore_delay` so a
    /// delayed ACK waits at most one tick, which also bounds it by the
    /// RFC 1122 half-second rule as long as the granularity is sane.
    fn maybe_send_pending_ack(&mut self, ignore_delay: bool, now: f64, host: &mut dyn Host) {
        if self.ack_pending >= 2 || (self.ack_pending > 0 && ignore_delay) {
            self.ack_pending = 0;
            let ack = self.make_segment(now, Control::ACK, None, None, Message::default());
            self.tx(ack, now, host);
        }
    }

    // -----------------------------------------------------------------
    //  FIN management
    // -----------------------------------------------------------------

    /// Whether `ack` acknowledges our FIN.
    fn acks_our_fin(&self, ack: u32) -> bool {
        match self.fin_seqno {
            Some(fin_seqno) => mod_geq(ack, fin_seqno),
            None => false, // We haven't sent one, so no
        }
    }

    /// Registers the intent to send a FIN. The FIN cannot go out until
    /// `tx_data` drains, so the state change that goes with it (if any) is
    /// deferred to the same moment.
    fn set_fin_pending(&mut self, next_state: Option<State>, now: f64, host: &mut dyn Host) {
        if self.fin_sent {
            if let Some(next_state) = next_state {
                tracing::error!("FIN already sent when queuing another close");
                if self.state == State::Established {
                    self.set_state(next_state);
                }
            }
            return;
        }
        self.fin_pending = true;
        self.fin_next_state = next_state;
        self.maybe_send_pending_fin(now, host);
    }

    /// Emits a pending FIN once the send buffer is empty, applying the
    /// deferred state transition.
    fn maybe_send_pending_fin(&mut self, now: f64, host: &mut dyn Host) {
        if !self.fin_pending || self.fin_sent {
            return;
        }
        if !self.tx_data.is_empty() {
            return; // Still data to be sent
        }

        self.fin_pending = false;
        self.fin_sent = true;
        if let Some(next_state) = self.fin_next_state.take() {
            self.set_state(next_state);
        }

        let fin = self.make_segment(now, Control::FIN | Control::ACK, None, None, Message::default());
        let fin_seq = fin.header.seq;
        self.tx(fin, now, host);

        // The FIN takes up sequence space
        self.snd.nxt = fin_seq.wrapping_add(1);
        self.fin_seqno = Some(self.snd.nxt);
    }

    // -----------------------------------------------------------------
    //  TIME-WAIT management
    // -----------------------------------------------------------------

    /// Enters TIME-WAIT, or restarts the 2 MSL timer if already there.
    fn start_time_wait(&mut self, now: f64) {
        self.set_state(State::TimeWait);
        self.time_wait_ends_at = Some(now + self.config.time_wait_timeout);
    }

    fn maybe_time_wait_timeout(&mut self, now: f64) {
        if let Some(ends_at) = self.time_wait_ends_at {
            if ends_at <= now {
                self.time_wait_ends_at = None;
                self.delete_tcb();
            }
        }
    }

    // -----------------------------------------------------------------
    //  Zero window probing
    // -----------------------------------------------------------------

    fn reset_zwp_timer(&mut self, now: f64, reset_backoff: bool) {
        if reset_backoff {
            self.zwps_sent = 0;
        }
        let backoff = (self.zwps_sent + 1) as f64;
        let interval = (backoff * self.rtt.rto()).min(self.config.zwp_max_interval);
        self.zwp_at = Some(now + interval);
    }

    /// Keeps the probe timer consistent with the peer's window: running
    /// whenever the peer advertises zero and we have data waiting, stopped
    /// otherwise, and emitting a one-below-window probe on expiry
    /// (RFC 1122 s4.2.2.17).
    fn maybe_handle_zero_window(&mut self, now: f64, host: &mut dyn Host) {
        if matches!(self.state, State::Initial | State::Closed | State::Listen) {
            return;
        }
        if self.snd.wnd != 0 {
            if self.zwp_at.is_some() {
                tracing::debug!("peer window no longer zero");
                self.zwp_at = None;
            }
            return;
        }
        if self.zwp_at.is_none() {
            if self.tx_data.is_empty() {
                return; // No need to probe
            }
            self.reset_zwp_timer(now, true);
        }

        if now < self.zwp_at.expect("probe timer was just ensured") {
            return; // Not elapsed yet
        }

        if self.zwps_sent == 0 {
            tracing::debug!("sending zero window probes");
        }
        self.zwps_sent += 1; // Back off
        self.reset_zwp_timer(now, false);

        // Keepalive-style probe: one below the window
        let probe = self.make_segment(
            now,
            Control::ACK,
            Some(self.snd.nxt.wrapping_sub(1)),
            None,
            Message::default(),
        );
        self.tx(probe, now, host);
    }

    // -----------------------------------------------------------------
    //  Timers
    // -----------------------------------------------------------------

    /// Runs the periodic timers; the manager calls this every granularity
    /// interval.
    pub(super) fn on_timer(&mut self, now: f64, host: &mut dyn Host) -> RxEffects {
        if matches!(self.state, State::Initial | State::Closed) {
            return RxEffects {
                closed: self.state == State::Closed,
                established: false,
            };
        }
        self.maybe_retx(None, now, host);
        self.maybe_time_wait_timeout(now);
        self.maybe_handle_zero_window(now, host);
        self.maybe_send_pending_ack(true, now, host);

        RxEffects {
            closed: self.state == State::Closed,
            established: false,
        }
    }

    // -----------------------------------------------------------------
    //  RTO estimation
    // -----------------------------------------------------------------

    /// Expected RTT samples per round trip, RFC 7323 Appendix G.
    fn expected_samples(&self) -> u32 {
        let smss = self.smss();
        (self.flight_size() + 2 * smss - 1) / (2 * smss)
    }

    /// Classic RTT measurement: find the queued transmission this ACK lands
    /// in and, if it was never retransmitted, use its age as a sample.
    fn maybe_update_rto(&mut self, header: &TcpHeader, now: f64) {
        if !header.ctl.ack() {
            return; // Couldn't be responding to anything we timed
        }

        let Some(transmit) = self.retx_queue.sample_for_ack(header.ack) else {
            return;
        };
        if transmit.retx_ts.is_some() {
            // Retransmitted; ambiguous per Karn's algorithm
            return;
        }
        let sample = now - transmit.tx_ts;
        if sample > 0.0 {
            let expected_samples = self.expected_samples();
            if expected_samples > 0 {
                self.rtt.sample(sample, expected_samples);
            }
        }
    }

    // -----------------------------------------------------------------
    //  Timestamp option
    // -----------------------------------------------------------------

    fn generate_timestamp(&self, now: f64) -> u32 {
        ((now * 1000.0 / TS_GRANULARITY_MS) as u32).wrapping_add(self.ts_salt)
    }

    /// RFC 7323 s3/s4: track `ts.recent` for our outgoing echoes and use a
    /// validated echo as an RTT sample.
    fn process_timestamp(&mut self, header: &TcpHeader, now: f64) {
        if !header.ctl.ack() {
            return;
        }
        let Some(ts) = header.options.timestamp else {
            if !header.ctl.rst() {
                tracing::error!("was expecting a TCP timestamp, but didn't get one");
            }
            return;
        };

        let recent_ok = self.ts_recent.map_or(true, |recent| mod_geq(ts.value, recent));
        let last_ack_ok = self.ts_last_ack.map_or(true, |last| mod_leq(header.seq, last));
        if recent_ok && last_ack_ok && ts.value != 0 {
            // Zero tsvals are ignored; middleboxes are known to write them
            self.ts_recent = Some(ts.value);
        }

        if ts.echo == 0 {
            return;
        }

        // An arbitrarily old echo must not poison the estimator, so the echo
        // only counts when this ACK plausibly answers something we sent
        // recently: either it lands in the retransmission queue (expensive
        // heuristic) or we are expecting ACKs at all (cheap one).
        let echo_plausible = if self.config.expensive_ts_heuristic {
            self.retx_queue.sample_for_ack(header.ack).is_some()
        } else {
            self.snd.una != self.snd.nxt && mod_leq(header.ack, self.snd.nxt)
        };
        if !echo_plausible {
            tracing::debug!("not using timestamp echo for RTO");
            return;
        }

        let elapsed_ticks = self.generate_timestamp(now).wrapping_sub(ts.echo);
        let sample = elapsed_ticks as f64 * TS_GRANULARITY_MS / 1000.0;
        if sample > 0.0 {
            let expected_samples = self.expected_samples();
            if expected_samples > 0 {
                self.rtt.sample(sample, expected_samples);
            }
        }
    }
}

#[cfg(test)]
impl Socket {
    pub(crate) fn snd(&self) -> &SendSequenceSpace {
        &self.snd
    }

    pub(crate) fn rcv(&self) -> &ReceiveSequenceSpace {
        &self.rcv
    }

    pub(crate) fn rto(&self) -> f64 {
        self.rtt.rto()
    }

    pub(crate) fn srtt(&self) -> Option<f64> {
        self.rtt.srtt()
    }

    pub(crate) fn cwnd(&mut self) -> u32 {
        let smss = self.smss();
        self.congestion.cwnd(smss)
    }

    pub(crate) fn ssthresh(&self) -> u32 {
        self.congestion.ssthresh
    }

    pub(crate) fn in_fast_recovery(&self) -> bool {
        self.congestion.in_fast_recovery
    }

    pub(crate) fn dup_ack_count(&self) -> u32 {
        self.congestion.dup_ack_count
    }

    pub(crate) fn time_wait_ends_at(&self) -> Option<f64> {
        self.time_wait_ends_at
    }

    pub(crate) fn buffered_tx(&self) -> usize {
        self.tx_data.len()
    }

    pub(crate) fn window_shifts(&self) -> (u8, u8) {
        (self.snd_wnd_shift, self.rcv_wnd_shift)
    }

    pub(crate) fn uses_timestamps(&self) -> Option<bool> {
        self.use_ts_option
    }

    /// Checks the cross-field invariants that must hold between events.
    pub(crate) fn check_invariants(&self) {
        use rtt::{MAX_RTO, MIN_RTO};
        if matches!(self.state, State::Initial | State::Listen) {
            // Nothing has been transmitted; the sequence spaces are inert
            return;
        }
        assert!(
            mod_leq(self.snd.una, self.snd.nxt),
            "snd.una must not pass snd.nxt"
        );
        assert!(
            self.rtt.rto() >= MIN_RTO && self.rtt.rto() <= MAX_RTO,
            "RTO out of range: {}",
            self.rtt.rto()
        );
        assert_eq!(
            self.retx_queue.sequence_span(),
            self.flight_size(),
            "retx queue does not cover exactly the flight"
        );
        let mut previous: Option<u32> = None;
        for entry in self.retx_queue.iter() {
            let seq = entry.segment.header.seq;
            assert!(
                mod_leq(self.snd.una, seq) && mod_leq(seq, self.snd.nxt),
                "retx entry outside [una, nxt]"
            );
            if let Some(previous) = previous {
                assert!(mod_lt(previous, seq), "retx queue out of order");
            }
            previous = Some(seq);
        }
        if self.fin_sent {
            assert!(self.fin_seqno.is_some());
        }
    }
}
