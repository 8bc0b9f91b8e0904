//! Error types returned by the buffer codec and the network layer.

use std::io;
use std::net::SocketAddr;

/// Errors raised while reading or writing a single [`Buffer`](crate::buffer::Buffer).
///
/// These are always local to the packet they occurred on: per §7 of the design, the
/// containing datagram is dropped and processing continues, the process never
/// crashes because of a malformed or hostile packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// A write would have advanced the cursor past the buffer's fixed capacity.
    #[error("buffer overflow")]
    BufferOverflow,
    /// A read would have advanced the cursor past the populated `size` of the buffer.
    #[error("buffer underrun")]
    BufferUnderrun,
    /// The first byte of the datagram did not map to a known [`PacketKind`](crate::packet::PacketKind).
    #[error("unknown packet type")]
    UnknownPacketType,
    /// A reliable packet arrived that is neither the next expected id nor a future one
    /// worth buffering (i.e. a duplicate or a very late retransmission).
    #[error("ordering violation (late or duplicate reliable packet)")]
    OrderingViolation,
}

/// Process/connection scoped errors.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to bind the UDP socket during [`Network::new`](crate::network::Network::new).
    #[error("failed to bind udp socket: {0}")]
    Bind(#[source] io::Error),
    /// Failed to resolve a host/port pair passed to [`Network::connect`](crate::network::Network::connect).
    #[error("failed to resolve address: {0}")]
    ResolveFailure(#[source] io::Error),
    /// A send or receive syscall failed. Recorded and the affected datagram is
    /// dropped; the connection itself is unaffected unless the failure recurs long
    /// enough to trip the liveness timeout.
    #[error("socket error on {addr:?}: {source}")]
    SocketError {
        addr: Option<SocketAddr>,
        #[source]
        source: io::Error,
    },
}
