//! A lightweight, connection-oriented reliability layer over UDP: fixed-size
//! buffer framing, ack piggybacking and retransmission, connection
//! handshake/liveness, and delta-replicated state.
//!
//! The entry point is [`network::Network`]; everything else is either a piece of
//! its wire format ([`buffer`], [`packet`], [`seq`]) or built on top of it
//! ([`replicated`]).

pub mod buffer;
pub mod codec;
pub mod connection;
pub mod error;
pub mod network;
pub mod packet;
pub mod replicated;
pub mod seq;

pub use buffer::Buffer;
pub use connection::Connection;
pub use error::{NetError, PacketError};
pub use network::{DisconnectReason, Network, NetworkConfig};
pub use packet::PacketKind;
pub use replicated::{CellHandle, ReplicatedContainer};
pub use seq::PacketId;
