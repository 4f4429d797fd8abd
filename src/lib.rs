//! A per-connection TCP protocol engine for simulator hosts.
//!
//! This crate implements the hard middle of a TCP/IP stack: the state
//! machine, sliding windows, retransmission, congestion control, and timer
//! logic that turn an unreliable datagram substrate into an ordered byte
//! stream. It deliberately implements nothing else. The simulator that hosts
//! the engine supplies virtual time, routes, and a packet sink through the
//! [`Host`] trait, and drives the engine with exactly two entry points:
//! [`Tcp::rx`] for every arriving datagram and [`Tcp::timer_tick`] at a fixed
//! cadence.
//!
//! # Organization
//!
//! - [`message`] provides [`Message`], a chunked byte rope used for socket
//!   buffers and segment payloads so that segmentation never copies data.
//! - [`protocols::tcp`] contains the engine: the [`Tcp`](protocols::tcp::Tcp)
//!   socket manager, which owns every connection and demultiplexes inbound
//!   segments, and the per-connection state in
//!   [`socket`](protocols::tcp::socket).
//! - [`protocols::ipv4`] has just enough IPv4 to wrap outbound segments and
//!   unwrap inbound ones.
//!
//! The engine never blocks. Application-facing calls (`send`, `recv`,
//! `accept`, ...) return immediately with a [`TcpError`] when they cannot
//! make progress; a higher-level wrapper can use
//! [`poll`](protocols::tcp::Tcp::poll) to learn when to retry.

pub mod message;
pub use message::Message;

pub mod host;
pub use host::{Host, Route};

pub mod protocols;
pub use protocols::tcp::{ShutdownKind, SocketId, State, Tcp, TcpConfig, TcpError};
pub use protocols::utility::{Endpoint, Endpoints};
