//! Packet kinds and the thin queue-entry wrappers around a [`Buffer`].

use std::fmt;
use std::net::SocketAddr;

use crate::buffer::Buffer;

/// Wire value of the `type` field (the low 3 bits of byte 0), see [`Buffer::get_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Liveness probe.
    Ping = 0,
    /// Liveness reply.
    Pong = 1,
    /// Handshake/teardown; body starts with a [`ConnectionMessage`] sub-code.
    Connection = 2,
    /// Application payload.
    Data = 3,
}

impl PacketKind {

    /// Decode a wire `type` value, or `None` for a value that doesn't map to a known
    /// kind (the caller should treat this as [`crate::error::PacketError::UnknownPacketType`]).
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ping),
            1 => Some(Self::Pong),
            2 => Some(Self::Connection),
            3 => Some(Self::Data),
            _ => None,
        }
    }

}

/// Sub-code carried in the first body byte of a [`PacketKind::Connection`] packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionMessage {
    Request = 0,
    Accept = 1,
    Refuse = 2,
    Disconnect = 3,
}

impl ConnectionMessage {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Accept),
            2 => Some(Self::Refuse),
            3 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// An unreliable outgoing entry: sent once, next tick, never retransmitted.
#[derive(Debug)]
pub struct UnreliablePacket {
    pub buffer: Buffer,
}

impl UnreliablePacket {
    pub fn new(buffer: Buffer) -> Self {
        Self { buffer }
    }
}

/// A reliable outgoing entry: stays queued, retransmitted on the connection's ping
/// interval, until its id is acked.
pub struct ReliablePacket {
    pub buffer: Buffer,
    /// Tick timestamp (externally supplied monotonic milliseconds) of the last
    /// (re)transmission; `None` until the first send.
    pub last_sent: Option<u64>,
}

impl ReliablePacket {
    pub fn new(buffer: Buffer) -> Self {
        Self { buffer, last_sent: None }
    }
}

impl fmt::Debug for ReliablePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliablePacket")
            .field("id", &self.buffer.get_id())
            .field("sent", &self.last_sent.is_some())
            .finish()
    }
}

/// A one-shot datagram addressed outside of any tracked connection, used for REFUSE
/// replies and the final DISCONNECT notice sent after a connection is torn down.
#[derive(Debug)]
pub struct AddressedPacket {
    pub buffer: Buffer,
    pub addr: SocketAddr,
}

impl AddressedPacket {
    pub fn new(buffer: Buffer, addr: SocketAddr) -> Self {
        Self { buffer, addr }
    }
}
