#![allow(clippy::bool_assert_comparison)]

use super::tcp_parsing::TcpHeaderBuilder;
use super::*;
use crate::host::{Host, Route};
use crate::protocols::ipv4::Ipv4Address;
use rand::{rngs::StdRng, Rng, SeedableRng};

const CLIENT_IP: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
const SERVER_IP: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
const CLIENT_PORT: u16 = 5000;
const SERVER_PORT: u16 = 80;

/// MTU chosen so the MSS comes out to the classic 1460
const TEST_MTU: u32 = 1580;
const SMSS: u32 = 1460;
const TICK: f64 = 0.1001;

fn client_endpoint() -> Endpoint {
    Endpoint::new(CLIENT_IP, CLIENT_PORT)
}

fn server_endpoint() -> Endpoint {
    Endpoint::new(SERVER_IP, SERVER_PORT)
}

/// A stand-in for the hosting simulator: a hand-cranked clock, a single
/// interface, and a record of everything emitted.
struct TestHost {
    now: f64,
    local: Ipv4Address,
    sent: Vec<Ipv4Packet>,
}

impl TestHost {
    fn new(local: Ipv4Address) -> Self {
        Self {
            now: 0.0,
            local,
            sent: Vec::new(),
        }
    }

    fn take(&mut self) -> Vec<Ipv4Packet> {
        std::mem::take(&mut self.sent)
    }
}

impl Host for TestHost {
    fn now(&self) -> f64 {
        self.now
    }

    fn emit(&mut self, packet: Ipv4Packet) {
        self.sent.push(packet);
    }

    fn route(&self, _destination: Ipv4Address) -> Option<Route> {
        Some(Route {
            local: self.local,
            mtu: TEST_MTU,
        })
    }
}

/// Two stacks wired back to back, packets moved by hand so tests can drop,
/// reorder, and duplicate them.
struct Pair {
    client: Tcp,
    client_host: TestHost,
    server: Tcp,
    server_host: TestHost,
}

impl Pair {
    fn new() -> Self {
        Self::with_configs(test_config(), test_config())
    }

    fn with_configs(client_config: TcpConfig, server_config: TcpConfig) -> Self {
        Self {
            client: Tcp::new("client", client_config),
            client_host: TestHost::new(CLIENT_IP),
            server: Tcp::new("server", server_config),
            server_host: TestHost::new(SERVER_IP),
        }
    }

    /// Delivers everything the client has emitted to the server. Returns
    /// how many packets moved.
    fn flush_to_server(&mut self) -> usize {
        let packets = self.client_host.take();
        let count = packets.len();
        for packet in packets {
            self.server.rx(packet, &mut self.server_host);
        }
        count
    }

    fn flush_to_client(&mut self) -> usize {
        let packets = self.server_host.take();
        let count = packets.len();
        for packet in packets {
            self.client.rx(packet, &mut self.client_host);
        }
        count
    }

    /// Moves packets both ways until the network is quiet.
    fn pump(&mut self) {
        for _ in 0..1000 {
            if self.flush_to_server() + self.flush_to_client() == 0 {
                return;
            }
        }
        panic!("network did not become quiet");
    }

    /// Advances both clocks and fires both stacks' timers.
    fn advance(&mut self, dt: f64) {
        self.client_host.now += dt;
        self.server_host.now += dt;
        self.client.timer_tick(&mut self.client_host);
        self.server.timer_tick(&mut self.server_host);
    }

    /// Pumps packets and ticks until nothing moves for a full tick.
    fn converge(&mut self) {
        for _ in 0..1000 {
            self.pump();
            self.advance(TICK);
            if self.client_host.sent.is_empty() && self.server_host.sent.is_empty() {
                return;
            }
        }
        panic!("stacks did not converge");
    }

    fn check_invariants(&self) {
        self.client.check_invariants();
        self.server.check_invariants();
    }
}

fn test_config() -> TcpConfig {
    TcpConfig {
        deterministic: true,
        ..TcpConfig::default()
    }
}

/// Brings up a listener and a fully established connection pair.
fn established_pair(pair: &mut Pair) -> (SocketId, SocketId, SocketId) {
    let listener = pair.server.socket();
    pair.server.bind(listener, server_endpoint()).unwrap();
    pair.server.listen(listener, 5).unwrap();

    let client = pair.client.socket();
    pair.client.bind(client, client_endpoint()).unwrap();
    pair.client
        .connect(client, server_endpoint(), &mut pair.client_host)
        .unwrap();
    pair.pump();

    let conn = pair.server.accept(listener).unwrap();
    assert_eq!(pair.client.state(client), Some(State::Established));
    assert_eq!(pair.server.state(conn), Some(State::Established));
    (client, conn, listener)
}

/// Grows the client's congestion window past `target` bytes by streaming
/// acknowledged data through the connection.
fn grow_cwnd(pair: &mut Pair, client: SocketId, conn: SocketId, target: u32) {
    let chunk = vec![0u8; SMSS as usize];
    for _ in 0..64 {
        if pair.client.socket_mut(client).cwnd() >= target {
            return;
        }
        pair.client
            .send(client, &chunk, false, &mut pair.client_host)
            .unwrap();
        pair.converge();
        pair.server.recv(conn, None, &mut pair.server_host).unwrap();
    }
    panic!("congestion window refused to grow");
}

// ---------------------------------------------------------------------
//  Connection establishment
// ---------------------------------------------------------------------

#[test]
fn three_way_handshake() {
    // Based on RFC 9293 3.5 Figure 6
    let mut pair = Pair::new();
    let listener = pair.server.socket();
    pair.server.bind(listener, server_endpoint()).unwrap();
    pair.server.listen(listener, 5).unwrap();

    let client = pair.client.socket();
    pair.client.bind(client, client_endpoint()).unwrap();
    pair.client
        .connect(client, server_endpoint(), &mut pair.client_host)
        .unwrap();
    assert_eq!(pair.client.state(client), Some(State::SynSent));
    let client_iss = pair.client.socket_ref(client).snd().iss;

    // Client SYN
    let packets = pair.client_host.take();
    assert_eq!(packets.len(), 1);
    let syn = &packets[0].segment;
    assert!(syn.header.ctl.syn());
    assert!(!syn.header.ctl.ack());
    assert_eq!(syn.header.seq, client_iss);
    pair.server.rx(packets.into_iter().next().unwrap(), &mut pair.server_host);

    // Server SYN+ACK
    let packets = pair.server_host.take();
    assert_eq!(packets.len(), 1);
    let syn_ack = &packets[0].segment;
    assert!(syn_ack.header.ctl.syn());
    assert!(syn_ack.header.ctl.ack());
    assert_eq!(syn_ack.header.ack, client_iss.wrapping_add(1));
    let server_iss = syn_ack.header.seq;
    pair.client.rx(packets.into_iter().next().unwrap(), &mut pair.client_host);
    assert_eq!(pair.client.state(client), Some(State::Established));

    // Client ACK
    let packets = pair.client_host.take();
    assert_eq!(packets.len(), 1);
    let ack = &packets[0].segment;
    assert!(ack.header.ctl.ack());
    assert!(!ack.header.ctl.syn());
    assert_eq!(ack.header.seq, client_iss.wrapping_add(1));
    assert_eq!(ack.header.ack, server_iss.wrapping_add(1));
    pair.server.rx(packets.into_iter().next().unwrap(), &mut pair.server_host);

    let conn = pair.server.accept(listener).unwrap();
    assert_eq!(pair.server.state(conn), Some(State::Established));
    assert!(pair.client_host.sent.is_empty());
    assert!(pair.server_host.sent.is_empty());
    pair.check_invariants();
}

#[test]
fn syn_is_retransmitted_with_floor() {
    let mut pair = Pair::new();
    let listener = pair.server.socket();
    pair.server.bind(listener, server_endpoint()).unwrap();
    pair.server.listen(listener, 5).unwrap();

    let client = pair.client.socket();
    pair.client
        .connect(client, server_endpoint(), &mut pair.client_host)
        .unwrap();
    // The SYN is lost
    let lost = pair.client_host.take();
    assert_eq!(lost.len(), 1);

    // After the initial RTO the SYN goes out again and the timer is floored
    // at three seconds for SYN retransmission
    for _ in 0..11 {
        pair.advance(TICK);
    }
    let packets = pair.client_host.take();
    assert_eq!(packets.len(), 1);
    assert!(packets[0].segment.header.ctl.syn());
    assert_eq!(pair.client.socket_ref(client).rto(), 3.0);

    for packet in packets {
        pair.server.rx(packet, &mut pair.server_host);
    }
    pair.pump();
    assert_eq!(pair.client.state(client), Some(State::Established));
}

#[test]
fn simultaneous_open() {
    // RFC 9293 3.5 Figure 7: both sides actively open at once. The crossed
    // SYNs put both ends in SYN-RECEIVED; the crossed SYN+ACKs fall outside
    // each receive window and are answered with plain ACKs, which complete
    // both handshakes.
    let mut pair = Pair::new();

    let a = pair.client.socket();
    pair.client.bind(a, client_endpoint()).unwrap();
    pair.client
        .connect(a, server_endpoint(), &mut pair.client_host)
        .unwrap();

    let b = pair.server.socket();
    pair.server.bind(b, server_endpoint()).unwrap();
    pair.server
        .connect(b, client_endpoint(), &mut pair.server_host)
        .unwrap();

    assert_eq!(pair.client.state(a), Some(State::SynSent));
    assert_eq!(pair.server.state(b), Some(State::SynSent));

    pair.pump();
    assert_eq!(pair.client.state(a), Some(State::Established));
    assert_eq!(pair.server.state(b), Some(State::Established));
    pair.check_invariants();

    // The connection works like any other
    pair.client
        .send(a, b"crossed", false, &mut pair.client_host)
        .unwrap();
    pair.converge();
    let received = pair.server.recv(b, None, &mut pair.server_host).unwrap();
    assert_eq!(received.unwrap().to_vec(), b"crossed");
}

#[test]
fn listener_ignores_stray_segments() {
    let mut pair = Pair::new();
    let listener = pair.server.socket();
    pair.server.bind(listener, server_endpoint()).unwrap();
    pair.server.listen(listener, 5).unwrap();

    // A bare ACK to a listening port elicits nothing from the listener
    let text = Message::default();
    let header = TcpHeaderBuilder::new(CLIENT_PORT, SERVER_PORT, 500)
        .ack(1234)
        .wnd(4096)
        .build(CLIENT_IP, SERVER_IP, &text);
    let packet = Ipv4Packet::new(CLIENT_IP, SERVER_IP, Segment::new(header, text));
    pair.server.rx(packet, &mut pair.server_host);
    assert!(pair.server_host.sent.is_empty());
    assert_eq!(pair.server.state(listener), Some(State::Listen));
}

#[test]
fn no_listener_elicits_rst() {
    let mut pair = Pair::new();
    let text = Message::default();
    let header = TcpHeaderBuilder::new(CLIENT_PORT, 9999, 77)
        .syn()
        .wnd(4096)
        .build(CLIENT_IP, SERVER_IP, &text);
    let packet = Ipv4Packet::new(CLIENT_IP, SERVER_IP, Segment::new(header, text));
    pair.server.rx(packet, &mut pair.server_host);

    let replies = pair.server_host.take();
    assert_eq!(replies.len(), 1);
    let rst = &replies[0].segment.header;
    assert!(rst.ctl.rst());
    assert!(rst.ctl.ack());
    assert_eq!(rst.seq, 0);
    // The SYN occupies one sequence number
    assert_eq!(rst.ack, 78);
}

#[test]
fn backlog_overflow_drops_silently() {
    let mut pair = Pair::new();
    let listener = pair.server.socket();
    pair.server.bind(listener, server_endpoint()).unwrap();
    pair.server.listen(listener, 1).unwrap();

    let first = pair.client.socket();
    pair.client
        .connect(first, server_endpoint(), &mut pair.client_host)
        .unwrap();
    pair.pump();

    let second = pair.client.socket();
    pair.client
        .connect(second, server_endpoint(), &mut pair.client_host)
        .unwrap();
    pair.pump();

    // Only the first connection fit the backlog
    let conn = pair.server.accept(listener).unwrap();
    assert_eq!(pair.server.state(conn), Some(State::Established));
    assert_eq!(pair.server.accept(listener), Err(TcpError::WouldBlock));
}

// ---------------------------------------------------------------------
//  Data transfer
// ---------------------------------------------------------------------

#[test]
fn simple_data_transfer() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);
    let client_iss = pair.client.socket_ref(client).snd().iss;

    let sent = pair
        .client
        .send(client, b"hello world", false, &mut pair.client_host)
        .unwrap();
    assert_eq!(sent, 11);

    // Exactly one data segment
    let packets = pair.client_host.take();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].segment.text.len(), 11);
    assert_eq!(packets[0].segment.header.seq, client_iss.wrapping_add(1));
    for packet in packets {
        pair.server.rx(packet, &mut pair.server_host);
    }

    assert_eq!(pair.server.bytes_readable(conn).unwrap(), 11);
    let received = pair.server.recv(conn, None, &mut pair.server_host).unwrap();
    assert_eq!(received.unwrap().to_vec(), b"hello world");

    // The ACK is delayed until the next tick, then carries the full range
    pair.advance(TICK);
    let acks = pair.server_host.take();
    assert_eq!(acks.len(), 1);
    let ack = &acks[0].segment.header;
    assert!(ack.ctl.ack());
    assert_eq!(ack.ack, client_iss.wrapping_add(1 + 11));
    pair.check_invariants();
}

#[test]
fn immediate_ack_without_delayed_acks() {
    let mut pair = Pair::with_configs(
        test_config(),
        TcpConfig {
            use_delayed_acks: false,
            ..test_config()
        },
    );
    let (client, _conn, _) = established_pair(&mut pair);

    pair.client
        .send(client, b"ping", false, &mut pair.client_host)
        .unwrap();
    pair.flush_to_server();
    // No tick needed: the ACK comes straight back
    assert_eq!(pair.server_host.sent.len(), 1);
}

#[test]
fn segmentation_at_mss() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);

    let data: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
    pair.client
        .send(client, &data, false, &mut pair.client_host)
        .unwrap();

    let packets = pair.client_host.take();
    assert_eq!(packets.len(), 3);
    assert_eq!(packets[0].segment.text.len(), SMSS as usize);
    assert_eq!(packets[1].segment.text.len(), SMSS as usize);
    assert_eq!(packets[2].segment.text.len(), 4000 - 2 * SMSS as usize);
    for packet in packets {
        pair.server.rx(packet, &mut pair.server_host);
    }

    let received = pair.server.recv(conn, None, &mut pair.server_host).unwrap();
    assert_eq!(received.unwrap().to_vec(), data);
}

#[test]
fn push_goes_on_the_last_segment() {
    let mut pair = Pair::new();
    let (client, _conn, _) = established_pair(&mut pair);

    let data = vec![7u8; 3000];
    pair.client
        .send(client, &data, true, &mut pair.client_host)
        .unwrap();

    let packets = pair.client_host.take();
    assert_eq!(packets.len(), 3);
    assert!(!packets[0].segment.header.ctl.psh());
    assert!(!packets[1].segment.header.ctl.psh());
    assert!(packets[2].segment.header.ctl.psh());
}

#[test]
fn out_of_order_delivery() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);

    let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    pair.client
        .send(client, &data, false, &mut pair.client_host)
        .unwrap();

    for packet in pair.client_host.take().into_iter().rev() {
        pair.server.rx(packet, &mut pair.server_host);
    }

    let received = pair.server.recv(conn, None, &mut pair.server_host).unwrap();
    assert_eq!(received.unwrap().to_vec(), data);
    pair.check_invariants();
}

#[test]
fn send_buffer_truncates_at_capacity() {
    let mut pair = Pair::with_configs(
        TcpConfig {
            tx_data_max: 1000,
            ..test_config()
        },
        test_config(),
    );
    let (client, _conn, _) = established_pair(&mut pair);

    let data = vec![1u8; 1500];
    let accepted = pair
        .client
        .send(client, &data, false, &mut pair.client_host)
        .unwrap();
    assert!(accepted <= 1000);
}

#[test]
fn lossy_transfer_converges() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);

    let data: Vec<u8> = (0..50_000u32).map(|i| (i % 239) as u8).collect();
    let mut offset = 0;
    let mut received = Vec::new();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..20_000 {
        if offset < data.len() {
            let end = (offset + 4096).min(data.len());
            offset += pair
                .client
                .send(client, &data[offset..end], false, &mut pair.client_host)
                .unwrap();
        }

        for packet in pair.client_host.take() {
            if rng.gen_bool(0.7) {
                pair.server.rx(packet, &mut pair.server_host);
            }
        }
        for packet in pair.server_host.take() {
            if rng.gen_bool(0.7) {
                pair.client.rx(packet, &mut pair.client_host);
            }
        }

        if let Ok(Some(chunk)) = pair.server.recv(conn, None, &mut pair.server_host) {
            received.extend(chunk.iter());
        }

        pair.check_invariants();
        pair.advance(TICK);

        if received.len() == data.len() && offset == data.len() {
            break;
        }
    }

    assert_eq!(received.len(), data.len());
    assert_eq!(received, data);
}

// ---------------------------------------------------------------------
//  Congestion control
// ---------------------------------------------------------------------

#[test]
fn fast_retransmit_and_recovery() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);
    grow_cwnd(&mut pair, client, conn, 4 * SMSS);
    assert!(pair.client.socket_mut(client).cwnd() >= 4 * SMSS);

    let first_unsent = pair.client.socket_ref(client).snd().nxt;

    let data = vec![3u8; 4 * SMSS as usize];
    pair.client
        .send(client, &data, false, &mut pair.client_host)
        .unwrap();
    let mut packets = pair.client_host.take();
    assert_eq!(packets.len(), 4);

    // The first segment is lost; the rest arrive and each one elicits an
    // immediate duplicate ACK for the hole
    let _lost = packets.remove(0);
    for packet in packets {
        pair.server.rx(packet, &mut pair.server_host);
    }
    let dup_acks = pair.server_host.take();
    assert_eq!(dup_acks.len(), 3);
    for ack in &dup_acks {
        assert_eq!(ack.segment.header.ack, first_unsent);
    }

    // Two duplicate ACKs leave recovery alone; the third triggers the fast
    // retransmission of the missing segment
    for (i, ack) in dup_acks.into_iter().enumerate() {
        pair.client.rx(ack, &mut pair.client_host);
        let in_recovery = pair.client.socket_ref(client).in_fast_recovery();
        assert_eq!(in_recovery, i == 2);
    }
    let ssthresh = pair.client.socket_ref(client).ssthresh();
    assert_eq!(ssthresh, 2 * SMSS);
    assert_eq!(pair.client.socket_mut(client).cwnd(), ssthresh + 3 * SMSS);

    let retx = pair.client_host.take();
    assert_eq!(retx.len(), 1);
    assert_eq!(retx[0].segment.header.seq, first_unsent);
    assert_eq!(retx[0].segment.text.len(), SMSS as usize);

    // The retransmission fills the hole; the cumulative ACK takes the
    // sender out of recovery and the window deflates to ssthresh
    for packet in retx {
        pair.server.rx(packet, &mut pair.server_host);
    }
    let acks = pair.server_host.take();
    assert_eq!(acks.len(), 1);
    assert_eq!(
        acks[0].segment.header.ack,
        first_unsent.wrapping_add(4 * SMSS)
    );
    for ack in acks {
        pair.client.rx(ack, &mut pair.client_host);
    }
    assert!(!pair.client.socket_ref(client).in_fast_recovery());
    assert_eq!(pair.client.socket_mut(client).cwnd(), ssthresh);

    let received = pair.server.recv(conn, None, &mut pair.server_host).unwrap();
    assert!(received.unwrap().to_vec().ends_with(&data));
    pair.check_invariants();
}

#[test]
fn duplicate_ack_processing_is_idempotent() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);
    grow_cwnd(&mut pair, client, conn, 4 * SMSS);

    let data = vec![9u8; 2 * SMSS as usize];
    pair.client
        .send(client, &data, false, &mut pair.client_host)
        .unwrap();
    let mut packets = pair.client_host.take();
    assert_eq!(packets.len(), 2);
    let _lost = packets.remove(0);
    for packet in packets {
        pair.server.rx(packet, &mut pair.server_host);
    }
    let dup_ack = pair.server_host.take().into_iter().next().unwrap();

    pair.client.rx(dup_ack.clone(), &mut pair.client_host);
    let cwnd_after_one = pair.client.socket_mut(client).cwnd();
    let ssthresh_after_one = pair.client.socket_ref(client).ssthresh();
    assert_eq!(pair.client.socket_ref(client).dup_ack_count(), 1);

    // A second copy changes nothing but the counter
    pair.client.rx(dup_ack.clone(), &mut pair.client_host);
    assert_eq!(pair.client.socket_mut(client).cwnd(), cwnd_after_one);
    assert_eq!(pair.client.socket_ref(client).ssthresh(), ssthresh_after_one);
    assert_eq!(pair.client.socket_ref(client).dup_ack_count(), 2);

    // The third triggers fast retransmission
    pair.client.rx(dup_ack, &mut pair.client_host);
    assert!(pair.client.socket_ref(client).in_fast_recovery());
    assert_eq!(pair.client_host.sent.len(), 1);
}

#[test]
fn rto_collapses_window_to_loss_window() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);
    grow_cwnd(&mut pair, client, conn, 4 * SMSS);

    let data = vec![5u8; 2 * SMSS as usize];
    pair.client
        .send(client, &data, false, &mut pair.client_host)
        .unwrap();
    // Everything is lost
    let lost = pair.client_host.take();
    assert_eq!(lost.len(), 2);
    let rto = pair.client.socket_ref(client).rto();

    // Cross the RTO and let the timer fire
    let mut ticks = 0;
    while pair.client_host.sent.is_empty() {
        pair.advance(TICK);
        ticks += 1;
        assert!(ticks < 1000, "no retransmission happened");
    }
    assert!(ticks as f64 * TICK >= rto);

    let retx = pair.client_host.take();
    assert!(!retx.is_empty());
    assert_eq!(pair.client.socket_mut(client).cwnd(), SMSS);
    assert!(pair.client.socket_ref(client).ssthresh() >= 2 * SMSS);
    // RFC 6298 5.5: the timer backed off
    assert!(pair.client.socket_ref(client).rto() >= 2.0 * rto - 1e-9);

    // Delivery still completes afterwards
    for packet in retx {
        pair.server.rx(packet, &mut pair.server_host);
    }
    pair.converge();
    let received = pair.server.recv(conn, None, &mut pair.server_host).unwrap();
    assert_eq!(received.unwrap().len(), data.len());
    pair.check_invariants();
}

// ---------------------------------------------------------------------
//  Close sequences
// ---------------------------------------------------------------------

#[test]
fn normal_close_sequence() {
    // This test implements the exchange from RFC 9293 3.6, Figure 12
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);

    pair.client.close(client, &mut pair.client_host).unwrap();
    assert_eq!(pair.client.state(client), Some(State::FinWait1));
    let fin = &pair.client_host.sent[0].segment.header;
    assert!(fin.ctl.fin());
    assert!(fin.ctl.ack());

    pair.flush_to_server();
    assert_eq!(pair.server.state(conn), Some(State::CloseWait));
    pair.flush_to_client();
    assert_eq!(pair.client.state(client), Some(State::FinWait2));

    pair.server.close(conn, &mut pair.server_host).unwrap();
    assert_eq!(pair.server.state(conn), Some(State::LastAck));
    pair.flush_to_client();
    assert_eq!(pair.client.state(client), Some(State::TimeWait));
    pair.flush_to_server();
    assert_eq!(pair.server.state(conn), Some(State::Closed));

    // 2 MSL of quiet and the client is gone too
    for _ in 0..305 {
        pair.advance(TICK);
    }
    assert_eq!(pair.client.state(client), Some(State::Closed));
    assert!(!pair.client.is_registered(client));
}

#[test]
fn fin_waits_for_pending_data() {
    // A close with data still buffered must not emit the FIN until the
    // buffer drains; the FIN then takes the next sequence number
    let mut pair = Pair::with_configs(
        test_config(),
        TcpConfig {
            rx_data_max: 64,
            ..test_config()
        },
    );
    let (client, conn, _) = established_pair(&mut pair);
    let client_iss = pair.client.socket_ref(client).snd().iss;

    let accepted = pair
        .client
        .send(client, &vec![8u8; 100], false, &mut pair.client_host)
        .unwrap();
    assert_eq!(accepted, 100);
    // Only 64 bytes fit the peer's window; 36 remain buffered
    assert_eq!(pair.client.socket_ref(client).buffered_tx(), 36);

    pair.client.close(client, &mut pair.client_host).unwrap();
    // No FIN yet: data is still pending, and the state transition waits
    // for the FIN to hit the wire
    assert_eq!(pair.client.state(client), Some(State::Established));
    for packet in pair.client_host.take() {
        assert!(!packet.segment.header.ctl.fin());
        pair.server.rx(packet, &mut pair.server_host);
    }

    // Reading frees the peer's window; the window update lets the client
    // finish the data and finally emit the FIN
    pair.advance(TICK);
    pair.server.recv(conn, None, &mut pair.server_host).unwrap();
    pair.flush_to_client();

    let packets = pair.client_host.take();
    let fin = packets
        .iter()
        .find(|packet| packet.segment.header.ctl.fin())
        .expect("the FIN should be out now");
    assert_eq!(fin.segment.header.seq, client_iss.wrapping_add(1 + 100));
    assert_eq!(pair.client.state(client), Some(State::FinWait1));
    assert_eq!(pair.client.socket_ref(client).buffered_tx(), 0);
}

#[test]
fn simultaneous_close() {
    // RFC 9293 3.6, Figure 13: both sides close at once, the FINs cross in
    // the network, and both ends pass through CLOSING into TIME-WAIT
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);

    pair.client.close(client, &mut pair.client_host).unwrap();
    pair.server.close(conn, &mut pair.server_host).unwrap();
    assert_eq!(pair.client.state(client), Some(State::FinWait1));
    assert_eq!(pair.server.state(conn), Some(State::FinWait1));

    // Hold both FINs, then cross them
    let client_fin = pair.client_host.take();
    let server_fin = pair.server_host.take();
    for packet in server_fin {
        pair.client.rx(packet, &mut pair.client_host);
    }
    assert_eq!(pair.client.state(client), Some(State::Closing));
    for packet in client_fin {
        pair.server.rx(packet, &mut pair.server_host);
    }
    assert_eq!(pair.server.state(conn), Some(State::Closing));

    // The crossing ACKs finish the job
    pair.pump();
    assert_eq!(pair.client.state(client), Some(State::TimeWait));
    assert_eq!(pair.server.state(conn), Some(State::TimeWait));
}

#[test]
fn time_wait_restarts_and_expires() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);

    pair.client.close(client, &mut pair.client_host).unwrap();
    pair.pump();
    pair.server.close(conn, &mut pair.server_host).unwrap();
    let server_fin = pair.server_host.take();
    assert_eq!(server_fin.len(), 1);
    for packet in server_fin.clone() {
        pair.client.rx(packet, &mut pair.client_host);
    }
    assert_eq!(pair.client.state(client), Some(State::TimeWait));
    let first_deadline = pair.client.socket_ref(client).time_wait_ends_at().unwrap();

    // An in-window segment restarts the 2 MSL timer
    pair.advance(10.0);
    pair.client_host.take();
    let rcv_nxt = pair.client.socket_ref(client).rcv().nxt;
    let snd_nxt = pair.client.socket_ref(client).snd().nxt;
    let text = Message::default();
    let header = TcpHeaderBuilder::new(SERVER_PORT, CLIENT_PORT, rcv_nxt)
        .ack(snd_nxt)
        .wnd(500)
        .build(SERVER_IP, CLIENT_IP, &text);
    pair.client.rx(
        Ipv4Packet::new(SERVER_IP, CLIENT_IP, Segment::new(header, text)),
        &mut pair.client_host,
    );
    assert_eq!(pair.client.state(client), Some(State::TimeWait));
    let restarted = pair.client.socket_ref(client).time_wait_ends_at().unwrap();
    assert!(restarted > first_deadline);

    // Quiescence runs the timer out and the TCB is deleted
    pair.client_host.now += 30.1;
    pair.client.timer_tick(&mut pair.client_host);
    assert_eq!(pair.client.state(client), Some(State::Closed));
    assert!(!pair.client.is_registered(client));

    // A stray segment for the dead connection now draws a manager RST
    pair.client_host.take();
    let text = Message::default();
    let header = TcpHeaderBuilder::new(SERVER_PORT, CLIENT_PORT, 42)
        .ack(77)
        .wnd(100)
        .build(SERVER_IP, CLIENT_IP, &text);
    pair.client.rx(
        Ipv4Packet::new(SERVER_IP, CLIENT_IP, Segment::new(header, text)),
        &mut pair.client_host,
    );
    let replies = pair.client_host.take();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].segment.header.ctl.rst());
}

#[test]
fn recv_returns_eof_after_fin() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);

    pair.client
        .send(client, b"last words", false, &mut pair.client_host)
        .unwrap();
    pair.client.close(client, &mut pair.client_host).unwrap();
    pair.pump();

    assert_eq!(pair.server.state(conn), Some(State::CloseWait));
    let received = pair.server.recv(conn, None, &mut pair.server_host).unwrap();
    assert_eq!(received.unwrap().to_vec(), b"last words");
    // Buffer drained and the peer is gone: end of file
    let eof = pair.server.recv(conn, None, &mut pair.server_host).unwrap();
    assert!(eof.is_none());
}

#[test]
fn close_is_rejected_while_closing() {
    let mut pair = Pair::new();
    let (client, _conn, _) = established_pair(&mut pair);

    pair.client.close(client, &mut pair.client_host).unwrap();
    assert!(matches!(
        pair.client.close(client, &mut pair.client_host),
        Err(TcpError::BadState(_))
    ));
}

// ---------------------------------------------------------------------
//  Flow control
// ---------------------------------------------------------------------

#[test]
fn zero_window_probing() {
    let mut pair = Pair::with_configs(
        test_config(),
        TcpConfig {
            rx_data_max: 500,
            ..test_config()
        },
    );
    let (client, conn, _) = established_pair(&mut pair);

    pair.client
        .send(client, &vec![2u8; 1500], false, &mut pair.client_host)
        .unwrap();
    // The first 500 bytes fill the peer's whole window
    let packets = pair.client_host.take();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].segment.text.len(), 500);
    for packet in packets {
        pair.server.rx(packet, &mut pair.server_host);
    }
    pair.advance(TICK);
    pair.flush_to_client();
    assert_eq!(pair.client.socket_ref(client).snd().wnd, 0);
    assert_eq!(pair.client.socket_ref(client).buffered_tx(), 1000);

    // After roughly one RTO a one-byte-below-window probe goes out
    let rto = pair.client.socket_ref(client).rto();
    let mut probes = Vec::new();
    let mut elapsed = 0.0;
    while probes.is_empty() {
        pair.advance(TICK);
        elapsed += TICK;
        probes = pair.client_host.take();
        assert!(elapsed < 2.0 * rto + 1.0, "no probe was sent");
    }
    assert_eq!(probes.len(), 1);
    let probe = &probes[0].segment;
    assert!(probe.text.is_empty());
    assert_eq!(
        probe.header.seq,
        pair.client.socket_ref(client).snd().nxt.wrapping_sub(1)
    );
    // The probe is answered with a zero-window ACK
    for packet in probes {
        pair.server.rx(packet, &mut pair.server_host);
    }
    let answers = pair.server_host.take();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].segment.header.wnd, 0);
    for packet in answers {
        pair.client.rx(packet, &mut pair.client_host);
    }

    // Reading reopens the window; the update ACK restarts the flow
    pair.server.recv(conn, None, &mut pair.server_host).unwrap();
    pair.flush_to_client();
    assert!(pair.client.socket_ref(client).snd().wnd > 0);
    let moved = pair.flush_to_server();
    assert!(moved > 0, "data should flow after the window reopened");

    // Drain the rest
    for _ in 0..10 {
        pair.converge();
        pair.server.recv(conn, None, &mut pair.server_host).unwrap();
    }
    assert_eq!(pair.client.socket_ref(client).buffered_tx(), 0);
}

#[test]
fn window_scaling_is_negotiated() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);

    // Both sides advertise 10 MiB buffers, which need a shift of 8
    assert_eq!(pair.client.socket_ref(client).window_shifts(), (8, 8));
    assert_eq!(pair.server.socket_ref(conn).window_shifts(), (8, 8));

    // The SYN+ACK's window was unscaled and clamped; the first real ACK
    // carries the scaled advertisement and opens the send window past the
    // 16-bit limit
    assert_eq!(pair.client.socket_ref(client).snd().wnd, 0xffff);
    pair.client
        .send(client, b"!", false, &mut pair.client_host)
        .unwrap();
    pair.converge();
    assert!(pair.client.socket_ref(client).snd().wnd > 0xffff);
    let _ = conn;
}

#[test]
fn window_scaling_off_when_peer_declines() {
    let mut pair = Pair::with_configs(
        test_config(),
        TcpConfig {
            allow_ws_option: false,
            ..test_config()
        },
    );
    let (client, conn, _) = established_pair(&mut pair);

    assert_eq!(pair.client.socket_ref(client).window_shifts().0, 0);
    assert_eq!(pair.server.socket_ref(conn).window_shifts(), (0, 0));
    // Without scaling the advertised window is clamped to 16 bits
    assert_eq!(pair.client.socket_ref(client).snd().wnd, 0xffff);
}

// ---------------------------------------------------------------------
//  RTT estimation and timestamps
// ---------------------------------------------------------------------

#[test]
fn timestamps_are_negotiated_and_feed_rtt() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);

    pair.client
        .send(client, &vec![1u8; 100], false, &mut pair.client_host)
        .unwrap();
    pair.converge();
    pair.server.recv(conn, None, &mut pair.server_host).unwrap();

    assert_eq!(pair.client.socket_ref(client).uses_timestamps(), Some(true));
    assert!(pair.client.socket_ref(client).srtt().is_some());
}

#[test]
fn classic_rtt_estimation_without_timestamps() {
    let mut pair = Pair::with_configs(
        test_config(),
        TcpConfig {
            allow_ts_option: false,
            ..test_config()
        },
    );
    let (client, conn, _) = established_pair(&mut pair);

    pair.client
        .send(client, &vec![1u8; 100], false, &mut pair.client_host)
        .unwrap();
    pair.flush_to_server();
    // Let some simulated time pass before the delayed ACK comes back
    pair.advance(TICK);
    pair.flush_to_client();

    assert_ne!(pair.client.socket_ref(client).uses_timestamps(), Some(true));
    assert!(pair.client.socket_ref(client).srtt().is_some());
    let _ = conn;
}

// ---------------------------------------------------------------------
//  Resets and errors
// ---------------------------------------------------------------------

#[test]
fn in_window_rst_kills_the_connection() {
    let mut pair = Pair::new();
    let (client, _conn, _) = established_pair(&mut pair);

    let rcv_nxt = pair.client.socket_ref(client).rcv().nxt;
    let text = Message::default();
    let header = TcpHeaderBuilder::new(SERVER_PORT, CLIENT_PORT, rcv_nxt)
        .rst()
        .wnd(4096)
        .build(SERVER_IP, CLIENT_IP, &text);
    pair.client.rx(
        Ipv4Packet::new(SERVER_IP, CLIENT_IP, Segment::new(header, text)),
        &mut pair.client_host,
    );

    assert_eq!(pair.client.state(client), Some(State::Closed));
    assert!(!pair.client.is_registered(client));
    // EOF to the application, errors on writes
    let eof = pair.client.recv(client, None, &mut pair.client_host).unwrap();
    assert!(eof.is_none());
    assert_eq!(
        pair.client.send(client, b"x", false, &mut pair.client_host),
        Err(TcpError::Closed)
    );
}

#[test]
fn out_of_window_rst_is_ignored() {
    let mut pair = Pair::new();
    let (client, _conn, _) = established_pair(&mut pair);

    let rcv_nxt = pair.client.socket_ref(client).rcv().nxt;
    let text = Message::default();
    let header = TcpHeaderBuilder::new(SERVER_PORT, CLIENT_PORT, rcv_nxt.wrapping_sub(100_000))
        .rst()
        .wnd(4096)
        .build(SERVER_IP, CLIENT_IP, &text);
    pair.client.rx(
        Ipv4Packet::new(SERVER_IP, CLIENT_IP, Segment::new(header, text)),
        &mut pair.client_host,
    );

    assert_eq!(pair.client.state(client), Some(State::Established));
}

#[test]
fn api_misuse_is_reported() {
    let mut pair = Pair::new();

    let sock = pair.client.socket();
    assert_eq!(pair.client.listen(sock, 5), Err(TcpError::NotBound));
    assert_eq!(pair.client.accept(sock), Err(TcpError::BadState(State::Initial)));

    pair.client.bind(sock, client_endpoint()).unwrap();
    assert_eq!(
        pair.client.bind(sock, client_endpoint()),
        Err(TcpError::AlreadyBound)
    );

    let other = pair.client.socket();
    assert_eq!(
        pair.client.bind(other, client_endpoint()),
        Err(TcpError::AddressInUse)
    );

    pair.client.listen(sock, 5).unwrap();
    assert!(matches!(
        pair.client.connect(sock, server_endpoint(), &mut pair.client_host),
        Err(TcpError::BadState(State::Listen))
    ));
    assert!(matches!(
        pair.client.recv(sock, None, &mut pair.client_host),
        Err(TcpError::BadState(State::Listen))
    ));
    assert_eq!(
        pair.client.send(sock, b"hi", false, &mut pair.client_host),
        Err(TcpError::BadState(State::Listen))
    );
}

#[test]
fn ephemeral_bind_picks_a_free_port() {
    let mut pair = Pair::new();
    let sock = pair.client.socket();
    pair.client
        .bind(sock, Endpoint::new(CLIENT_IP, 0))
        .unwrap();
    let port = pair.client.socket_ref(sock).local().unwrap().port;
    assert!((49152..=61000).contains(&port));
}

#[test]
fn shutdown_read_discards_incoming() {
    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);

    pair.server
        .shutdown(conn, ShutdownKind::Read, &mut pair.server_host)
        .unwrap();
    pair.client
        .send(client, b"into the void", false, &mut pair.client_host)
        .unwrap();
    pair.converge();

    assert_eq!(pair.server.bytes_readable(conn).unwrap(), 0);
    assert_eq!(
        pair.server.recv(conn, None, &mut pair.server_host),
        Err(TcpError::ShutForReading)
    );
    // The write side still works
    assert!(pair.server.bytes_writable(conn).unwrap() > 0);
}

#[test]
fn poll_wakes_on_arrival() {
    use std::cell::Cell;
    use std::rc::Rc;

    let mut pair = Pair::new();
    let (client, conn, _) = established_pair(&mut pair);

    let woken = Rc::new(Cell::new(false));
    let flag = woken.clone();
    pair.server
        .poll(conn, move || flag.set(true))
        .unwrap();
    assert!(!woken.get());

    pair.client
        .send(client, b"wake up", false, &mut pair.client_host)
        .unwrap();
    pair.flush_to_server();
    assert!(woken.get());
}

#[test]
fn release_frees_the_slot() {
    let mut pair = Pair::new();
    let (client, _conn, _) = established_pair(&mut pair);

    assert_eq!(
        pair.client.release(client),
        Err(TcpError::BadState(State::Established))
    );

    // Reset the connection, then release
    let rcv_nxt = pair.client.socket_ref(client).rcv().nxt;
    let text = Message::default();
    let header = TcpHeaderBuilder::new(SERVER_PORT, CLIENT_PORT, rcv_nxt)
        .rst()
        .wnd(4096)
        .build(SERVER_IP, CLIENT_IP, &text);
    pair.client.rx(
        Ipv4Packet::new(SERVER_IP, CLIENT_IP, Segment::new(header, text)),
        &mut pair.client_host,
    );
    pair.client.release(client).unwrap();
    assert_eq!(pair.client.state(client), None);
    assert_eq!(pair.client.release(client), Err(TcpError::NoSuchSocket));
}
