//! The boundary between the engine and its hosting simulator.

use crate::protocols::ipv4::{Ipv4Address, Ipv4Packet};

/// What the engine needs to know to reach a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// The local address of the interface the destination is reached through
    pub local: Ipv4Address,
    /// The maximum transmission unit of that interface
    pub mtu: u32,
}

/// Services the hosting simulator provides to the engine.
///
/// The engine is driven entirely from the outside: the host calls
/// [`Tcp::rx`](crate::Tcp::rx) for arriving datagrams and
/// [`Tcp::timer_tick`](crate::Tcp::timer_tick) on a fixed cadence, and every
/// such call receives a `Host` so the engine can read the clock and transmit.
/// Transmission is fire-and-forget; the engine never waits for the network.
pub trait Host {
    /// Seconds since the stack started. Must be monotonic.
    fn now(&self) -> f64;

    /// Submits a packet for transmission.
    fn emit(&mut self, packet: Ipv4Packet);

    /// Resolves the interface used to reach `destination`, if any.
    fn route(&self, destination: Ipv4Address) -> Option<Route>;
}
