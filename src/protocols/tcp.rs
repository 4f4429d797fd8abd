//! An implementation of the [Transmission Control
//! Protocol](https://www.rfc-editor.org/rfc/rfc9293.html) for simulator
//! hosts.
//!
//! [`Tcp`] is the socket manager: it owns every [`Socket`], hands out
//! [`SocketId`] handles, demultiplexes arriving datagrams to the owning
//! connection by 4-tuple, fans timer ticks out to every connection, and
//! does the bookkeeping the sockets API needs (ephemeral ports, address
//! conflicts, the listen/accept queues). The per-connection protocol logic
//! lives in [`socket`].

use crate::host::Host;
use crate::protocols::ipv4::{Ipv4Address, Ipv4Packet};
use crate::protocols::utility::{Endpoint, Endpoints};
use crate::Message;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHasher};
use std::collections::VecDeque;
use std::fmt::{self, Display};
use std::hash::Hasher;
use thiserror::Error as ThisError;

pub mod socket;
pub use socket::{Segment, Socket, State};

pub mod tcp_parsing;

mod config;
pub use config::TcpConfig;

use socket::{RxContext, MAX_HEADER_OVERHEAD};
use tcp_parsing::TcpHeaderBuilder;

#[cfg(test)]
mod tests;

/// Local ports handed out when binding to port zero
const EPHEMERAL_RANGE: std::ops::RangeInclusive<u16> = 49152..=61000;
/// Capacity of the stack-wide queue of half-open passive connections
const SYN_QUEUE_MAX: usize = 4096;

/// A handle to a socket owned by [`Tcp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Failures surfaced by the socket-like interface. Protocol-level anomalies
/// never show up here; they are handled inside the engine.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    #[error("operation illegal in {0:?}")]
    BadState(State),
    #[error("socket is closed")]
    Closed,
    #[error("no such socket")]
    NoSuchSocket,
    #[error("address in use")]
    AddressInUse,
    #[error("socket is already bound")]
    AlreadyBound,
    #[error("socket is not bound")]
    NotBound,
    #[error("operation would block")]
    WouldBlock,
    #[error("no route to host")]
    NoRoute,
    #[error("no free ephemeral port")]
    PortsExhausted,
    #[error("socket is shut down for reading")]
    ShutForReading,
    #[error("maximum segment size too small")]
    MssTooSmall,
}

/// Which direction(s) of a connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Read,
    Write,
    Both,
}

impl ShutdownKind {
    pub fn shuts_read(self) -> bool {
        matches!(self, ShutdownKind::Read | ShutdownKind::Both)
    }

    pub fn shuts_write(self) -> bool {
        matches!(self, ShutdownKind::Write | ShutdownKind::Both)
    }
}

/// The TCP socket manager for one stack.
pub struct Tcp {
    config: TcpConfig,
    /// The stack identity; seeds the RNG and the timestamp salt in
    /// deterministic mode
    name: String,
    /// Every socket this stack owns, live or closed-but-unreleased
    sockets: FxHashMap<SocketId, Socket>,
    /// Connections with a peer, looked up by full 4-tuple
    peered: FxHashMap<Endpoints, SocketId>,
    /// Bound but unpeered sockets (listeners and the freshly bound),
    /// looked up by local endpoint
    unpeered: FxHashMap<Endpoint, SocketId>,
    /// Passive connections whose SYN+ACK is not yet acknowledged. Shared by
    /// all listeners; entries move to a listener's accept queue or die.
    syn_queue: VecDeque<SocketId>,
    next_id: u64,
    rng: SmallRng,
    /// Offset applied to outgoing timestamp values so both sides of a
    /// connection produce visibly different clocks
    ts_salt: u32,
    last_tick: Option<f64>,
}

impl Tcp {
    pub fn new(name: impl Into<String>, config: TcpConfig) -> Self {
        let name = name.into();
        let digest = stack_digest(&name);
        let rng = if config.deterministic {
            SmallRng::seed_from_u64(digest)
        } else {
            SmallRng::from_entropy()
        };
        Self {
            config,
            sockets: Default::default(),
            peered: Default::default(),
            unpeered: Default::default(),
            syn_queue: Default::default(),
            next_id: 1,
            rng,
            // Zero timestamps are ignored as middlebox damage, so the salt
            // must not be zero
            ts_salt: ((digest & 0xffff) as u32).max(1),
            last_tick: None,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // -----------------------------------------------------------------
    //  Socket-like interface
    // -----------------------------------------------------------------

    /// Creates a new socket and returns its handle.
    pub fn socket(&mut self) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        let iss = self.rng.gen_range(1..=u32::MAX);
        self.sockets
            .insert(id, Socket::new(self.config.clone(), iss, self.ts_salt, None));
        id
    }

    /// Binds a socket to a local endpoint. Port zero picks an unused
    /// ephemeral port.
    pub fn bind(&mut self, id: SocketId, mut local: Endpoint) -> Result<(), TcpError> {
        let sock = self.sockets.get(&id).ok_or(TcpError::NoSuchSocket)?;
        if sock.state() != State::Initial {
            return Err(TcpError::BadState(sock.state()));
        }
        if sock.is_bound() {
            return Err(TcpError::AlreadyBound);
        }
        if local.port == 0 {
            local.port = self
                .pick_ephemeral_port(local.address)
                .ok_or(TcpError::PortsExhausted)?;
        } else if self.port_in_use(local.address, local.port) {
            return Err(TcpError::AddressInUse);
        }
        self.unpeered.insert(local, id);
        self.sockets
            .get_mut(&id)
            .expect("socket looked up above")
            .set_local(local);
        Ok(())
    }

    /// Puts a bound socket into LISTEN with the given accept backlog.
    pub fn listen(&mut self, id: SocketId, backlog: usize) -> Result<(), TcpError> {
        let sock = self.sockets.get_mut(&id).ok_or(TcpError::NoSuchSocket)?;
        if sock.state() != State::Initial {
            return Err(TcpError::BadState(sock.state()));
        }
        if !sock.is_bound() {
            return Err(TcpError::NotBound);
        }
        sock.set_listening(backlog);
        Ok(())
    }

    /// Starts an active open toward `peer`, binding to the outgoing
    /// interface first if the socket is unbound.
    pub fn connect(
        &mut self,
        id: SocketId,
        peer: Endpoint,
        host: &mut dyn Host,
    ) -> Result<(), TcpError> {
        let now = host.now();
        let sock = self.sockets.get(&id).ok_or(TcpError::NoSuchSocket)?;
        if sock.state() != State::Initial {
            return Err(TcpError::BadState(sock.state()));
        }

        let route = host.route(peer.address).ok_or(TcpError::NoRoute)?;
        let mss = route.mtu.saturating_sub(MAX_HEADER_OVERHEAD);
        if mss == 0 {
            return Err(TcpError::MssTooSmall);
        }

        let local = match sock.local() {
            // Assume an existing binding is good
            Some(local) => local,
            None => {
                let port = self
                    .pick_ephemeral_port(route.local)
                    .ok_or(TcpError::PortsExhausted)?;
                Endpoint::new(route.local, port)
            }
        };

        let endpoints = Endpoints::new(local, peer);
        if self.peered.contains_key(&endpoints) {
            return Err(TcpError::AddressInUse);
        }
        self.unpeered.retain(|_, registered| *registered != id);
        self.peered.insert(endpoints, id);

        let sock = self.sockets.get_mut(&id).expect("socket looked up above");
        sock.set_local(local);
        sock.set_peer(peer);
        sock.set_mss(mss);
        sock.start_connect(now, host);
        Ok(())
    }

    /// Pops one established connection off a listener's accept queue.
    pub fn accept(&mut self, id: SocketId) -> Result<SocketId, TcpError> {
        let sock = self.sockets.get_mut(&id).ok_or(TcpError::NoSuchSocket)?;
        if sock.state() != State::Listen {
            return Err(TcpError::BadState(sock.state()));
        }
        sock.accept_queue.pop_front().ok_or(TcpError::WouldBlock)
    }

    /// Queues data for transmission, sending whatever the windows allow
    /// right away. Returns how many bytes were accepted; the rest did not
    /// fit the send buffer.
    pub fn send(
        &mut self,
        id: SocketId,
        data: &[u8],
        push: bool,
        host: &mut dyn Host,
    ) -> Result<usize, TcpError> {
        let now = host.now();
        let sock = self.sockets.get_mut(&id).ok_or(TcpError::NoSuchSocket)?;
        sock.send(data, push, now, host)
    }

    /// Reads up to `length` buffered bytes (everything buffered when
    /// `None`). Returns `Ok(None)` once the peer has closed and the buffer
    /// has drained.
    pub fn recv(
        &mut self,
        id: SocketId,
        length: Option<usize>,
        host: &mut dyn Host,
    ) -> Result<Option<Message>, TcpError> {
        let now = host.now();
        let sock = self.sockets.get_mut(&id).ok_or(TcpError::NoSuchSocket)?;
        sock.recv(length, now, host)
    }

    /// Shuts down reading, writing, or both. Shutting down writes schedules
    /// a FIN behind any buffered data; shutting down reads discards the
    /// receive buffer.
    pub fn shutdown(
        &mut self,
        id: SocketId,
        how: ShutdownKind,
        host: &mut dyn Host,
    ) -> Result<(), TcpError> {
        let now = host.now();
        let sock = self.sockets.get_mut(&id).ok_or(TcpError::NoSuchSocket)?;
        sock.shutdown(how, now, host);
        Ok(())
    }

    /// Closes the socket, RFC 793 p60 style: listeners and half-open
    /// connects are deleted outright, established connections begin the FIN
    /// handshake.
    pub fn close(&mut self, id: SocketId, host: &mut dyn Host) -> Result<(), TcpError> {
        let now = host.now();
        let sock = self.sockets.get_mut(&id).ok_or(TcpError::NoSuchSocket)?;
        if sock.close(now, host)? {
            self.remove_registration(id);
        }
        Ok(())
    }

    /// Registers a one-shot wake function, called the next time anything
    /// happens on the socket that could unblock a waiter.
    pub fn poll(
        &mut self,
        id: SocketId,
        wake: impl FnOnce() + 'static,
    ) -> Result<(), TcpError> {
        let sock = self.sockets.get_mut(&id).ok_or(TcpError::NoSuchSocket)?;
        sock.register_waker(Box::new(wake));
        Ok(())
    }

    /// Bytes available to `recv` right now.
    pub fn bytes_readable(&self, id: SocketId) -> Result<usize, TcpError> {
        let sock = self.sockets.get(&id).ok_or(TcpError::NoSuchSocket)?;
        Ok(sock.bytes_readable())
    }

    /// Bytes `send` would accept right now.
    pub fn bytes_writable(&self, id: SocketId) -> Result<usize, TcpError> {
        let sock = self.sockets.get(&id).ok_or(TcpError::NoSuchSocket)?;
        Ok(sock.bytes_writable())
    }

    pub fn state(&self, id: SocketId) -> Option<State> {
        self.sockets.get(&id).map(Socket::state)
    }

    pub fn endpoints(&self, id: SocketId) -> Option<Endpoints> {
        let sock = self.sockets.get(&id)?;
        Some(Endpoints::new(sock.local()?, sock.peer()?))
    }

    /// Frees the arena slot of a socket that has finished its lifecycle.
    /// The handle becomes invalid.
    pub fn release(&mut self, id: SocketId) -> Result<(), TcpError> {
        let sock = self.sockets.get(&id).ok_or(TcpError::NoSuchSocket)?;
        match sock.state() {
            State::Closed | State::Initial => {
                self.remove_registration(id);
                self.sockets.remove(&id);
                Ok(())
            }
            state => Err(TcpError::BadState(state)),
        }
    }

    // -----------------------------------------------------------------
    //  Datagram entry points
    // -----------------------------------------------------------------

    /// Demultiplexes one arriving datagram: a peered connection wins, then a
    /// listener on the exact or wildcard local address; anything else gets a
    /// RST shaped after the offending segment.
    pub fn rx(&mut self, packet: Ipv4Packet, host: &mut dyn Host) {
        let endpoints = packet.endpoints();
        let segment = packet.segment;

        if let Some(&id) = self.peered.get(&endpoints) {
            self.deliver(id, segment, host);
            return;
        }

        let wildcard = Endpoint::new(Ipv4Address::UNSPECIFIED, endpoints.local.port);
        for key in [endpoints.local, wildcard] {
            if let Some(&id) = self.unpeered.get(&key) {
                if self.sockets.get(&id).map(Socket::state) == Some(State::Listen) {
                    self.rx_listen(id, endpoints, segment, host);
                    return;
                }
            }
        }

        // Nobody home. Send a RST
        tracing::debug!("no connection for {endpoints}");
        if segment.header.ctl.rst() {
            return;
        }
        let seq = if segment.header.ctl.ack() {
            segment.header.ack
        } else {
            0
        };
        let ack = segment.header.seq.wrapping_add(segment.seg_len());
        let text = Message::default();
        let header = TcpHeaderBuilder::new(endpoints.local.port, endpoints.remote.port, seq)
            .rst()
            .ack(ack)
            .build(endpoints.local.address, endpoints.remote.address, &text);
        host.emit(Ipv4Packet::new(
            endpoints.local.address,
            endpoints.remote.address,
            Segment::new(header, text),
        ));
    }

    /// Drives every socket's timers. The host calls this at the configured
    /// granularity; late ticks are tolerated but noted.
    pub fn timer_tick(&mut self, host: &mut dyn Host) {
        let now = host.now();
        if let Some(last_tick) = self.last_tick {
            let drift = now - last_tick - self.config.timer_granularity;
            if drift > 0.5 {
                tracing::warn!("timer tick arrived {drift:.3}s late");
            }
        }
        self.last_tick = Some(now);

        let ids: Vec<SocketId> = self.sockets.keys().copied().collect();
        for id in ids {
            let Some(sock) = self.sockets.get_mut(&id) else {
                continue;
            };
            let was_closed = sock.state() == State::Closed;
            let effects = sock.on_timer(now, host);
            if effects.closed && !was_closed {
                self.remove_registration(id);
            }
        }
    }

    /// Hands a segment to a peered socket and applies whatever bookkeeping
    /// its processing asks for.
    fn deliver(&mut self, id: SocketId, segment: Segment, host: &mut dyn Host) {
        let accept_has_room = match self.sockets.get(&id).and_then(|sock| sock.parent) {
            Some(parent_id) => self
                .sockets
                .get(&parent_id)
                .map(|parent| parent.accept_queue.len() < parent.accept_queue_max)
                .unwrap_or(false),
            None => false,
        };
        let ctx = RxContext {
            now: host.now(),
            accept_has_room,
        };
        let Some(sock) = self.sockets.get_mut(&id) else {
            return;
        };
        let was_closed = sock.state() == State::Closed;
        let effects = sock.rx(segment, ctx, host);

        if effects.established {
            self.syn_queue.retain(|queued| *queued != id);
            if let Some(parent_id) = self.sockets.get(&id).and_then(|sock| sock.parent) {
                if let Some(parent) = self.sockets.get_mut(&parent_id) {
                    parent.accept_queue.push_back(id);
                    tracing::debug!(
                        "accept queue of {parent_id} got {id} ({} waiting)",
                        parent.accept_queue.len()
                    );
                    parent.unblock();
                }
            }
        }
        if effects.closed && !was_closed {
            self.remove_registration(id);
        }
    }

    /// RFC 793 p64: only a clean SYN does anything on a listener; it spawns
    /// a server socket that answers with SYN+ACK and waits in the SYN queue.
    fn rx_listen(
        &mut self,
        listener_id: SocketId,
        endpoints: Endpoints,
        segment: Segment,
        host: &mut dyn Host,
    ) {
        let header = &segment.header;
        if header.ctl.rst() || header.ctl.fin() || header.ctl.ack() || !header.ctl.syn() {
            return;
        }
        if endpoints.remote.address.is_multicast() {
            tracing::warn!("TCP to multicast address not supported");
            return;
        }
        if self.syn_queue.len() >= SYN_QUEUE_MAX {
            tracing::warn!("listening socket dropping SYN because queue is full");
            return;
        }
        let Some(route) = host.route(endpoints.remote.address) else {
            tracing::warn!("no route back to {}", endpoints.remote);
            return;
        };
        let mss = route.mtu.saturating_sub(MAX_HEADER_OVERHEAD);
        if mss == 0 {
            tracing::warn!("dropping SYN: MSS too small");
            return;
        }

        let id = SocketId(self.next_id);
        self.next_id += 1;
        let iss = self.rng.gen_range(1..=u32::MAX);
        let mut sock = Socket::new(self.config.clone(), iss, self.ts_salt, Some(listener_id));
        sock.set_local(endpoints.local);
        sock.set_peer(endpoints.remote);
        sock.set_mss(mss);
        sock.start_passive(header, host.now(), host);

        self.peered.insert(endpoints, id);
        self.syn_queue.push_back(id);
        self.sockets.insert(id, sock);
    }

    /// Forgets a socket that reached CLOSED: demux entries, the SYN queue,
    /// and its listener's accept queue. The arena entry stays until
    /// [`release`](Tcp::release) so the handle can still be queried.
    fn remove_registration(&mut self, id: SocketId) {
        self.peered.retain(|_, registered| *registered != id);
        self.unpeered.retain(|_, registered| *registered != id);
        self.syn_queue.retain(|queued| *queued != id);
        if let Some(parent_id) = self.sockets.get(&id).and_then(|sock| sock.parent) {
            if let Some(parent) = self.sockets.get_mut(&parent_id) {
                parent.accept_queue.retain(|queued| *queued != id);
            }
        }
    }

    // -----------------------------------------------------------------
    //  Ports
    // -----------------------------------------------------------------

    fn port_in_use(&self, address: Ipv4Address, port: u16) -> bool {
        let any = address.is_unspecified();
        let conflicts = |endpoint: &Endpoint| {
            endpoint.port == port
                && (any || endpoint.address == address || endpoint.address.is_unspecified())
        };
        self.unpeered.keys().any(conflicts)
            || self.peered.keys().any(|endpoints| conflicts(&endpoints.local))
    }

    fn pick_ephemeral_port(&mut self, address: Ipv4Address) -> Option<u16> {
        for _ in 0..10_000 {
            let port = self.rng.gen_range(EPHEMERAL_RANGE);
            if !self.port_in_use(address, port) {
                return Some(port);
            }
        }
        None
    }
}

impl fmt::Debug for Tcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcp")
            .field("name", &self.name)
            .field("sockets", &self.sockets.len())
            .field("peered", &self.peered.len())
            .field("unpeered", &self.unpeered.len())
            .field("syn_queue", &self.syn_queue.len())
            .finish()
    }
}

fn stack_digest(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

#[cfg(test)]
impl Tcp {
    pub(crate) fn socket_ref(&self, id: SocketId) -> &Socket {
        self.sockets.get(&id).expect("no such socket")
    }

    pub(crate) fn socket_mut(&mut self, id: SocketId) -> &mut Socket {
        self.sockets.get_mut(&id).expect("no such socket")
    }

    pub(crate) fn is_registered(&self, id: SocketId) -> bool {
        self.peered.values().any(|registered| *registered == id)
            || self.unpeered.values().any(|registered| *registered == id)
    }

    pub(crate) fn check_invariants(&self) {
        for sock in self.sockets.values() {
            sock.check_invariants();
        }
    }
}
