//! Per-peer reliability state machine: outgoing queues, the incoming reorder buffer,
//! ack bookkeeping and liveness timestamps.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use mio::net::UdpSocket;

use crate::buffer::Buffer;
use crate::error::PacketError;
use crate::packet::{ConnectionMessage, PacketKind, ReliablePacket, UnreliablePacket};
use crate::seq::{PacketId, PacketIdAlloc};

/// Reliability and liveness state for one peer, keyed by its [`SocketAddr`] in the
/// owning [`crate::network::Network`].
pub struct Connection {
    addr: SocketAddr,
    connected: bool,

    reliable_tx: VecDeque<ReliablePacket>,
    unreliable_tx: VecDeque<UnreliablePacket>,

    /// Reliable packets that arrived ahead of `last_delivered_reliable_id + 1`,
    /// buffered until their predecessors show up.
    reorder: HashMap<PacketId, Buffer>,
    /// Buffers ready for the application to read, populated this tick.
    delivered: Vec<Buffer>,

    pending_acks: Vec<PacketId>,
    next_reliable_id: PacketIdAlloc,
    next_unreliable_id: PacketIdAlloc,
    /// High-watermark `R` of contiguous reliable delivery.
    last_delivered_reliable_id: PacketId,

    /// Tick timestamp of this connection's last transmission, used to throttle
    /// connection-request retries while `PENDING`.
    last_sent: u64,
    last_ping_sent: u64,
    last_heartbeat: u64,

    /// Measured RTT in milliseconds, seeding reliable retransmission delay. Defaults
    /// to zero (aggressive per-tick resend) until the application measures and sets
    /// it; nothing in this crate computes it automatically.
    ping: u64,

    /// Opaque application handle, the Rust stand-in for the source's `void* mUserData`.
    user_data: Option<Box<dyn Any>>,
}

impl Connection {

    pub(crate) fn new(addr: SocketAddr, now: u64) -> Self {
        Self {
            addr,
            connected: false,
            reliable_tx: VecDeque::new(),
            unreliable_tx: VecDeque::new(),
            reorder: HashMap::new(),
            delivered: Vec::new(),
            pending_acks: Vec::new(),
            next_reliable_id: PacketIdAlloc::new(),
            next_unreliable_id: PacketIdAlloc::new(),
            last_delivered_reliable_id: PacketId::ZERO,
            last_sent: now,
            last_ping_sent: now,
            last_heartbeat: now,
            ping: 0,
            user_data: None,
        }
    }

    // -- application-facing API ----------------------------------------------------

    /// Queue a new, freshly-allocated `DATA` packet and return a writable handle to
    /// it. Every call allocates a new queue entry (no coalescing): one `send()` call
    /// is one logical message, reliable or not.
    pub fn send(&mut self, reliable: bool) -> &mut Buffer {
        let mut buf = Buffer::new();
        buf.set_type(PacketKind::Data as u8);
        buf.set_reliable(reliable);

        if reliable {
            let id = self.next_reliable_id.alloc();
            buf.set_id(id);
            self.reliable_tx.push_back(ReliablePacket::new(buf));
            &mut self.reliable_tx.back_mut().unwrap().buffer
        } else {
            let id = self.next_unreliable_id.alloc();
            buf.set_id(id);
            self.unreliable_tx.push_back(UnreliablePacket::new(buf));
            &mut self.unreliable_tx.back_mut().unwrap().buffer
        }
    }

    /// Buffers delivered to the application this tick, in delivery order. Readable
    /// any number of times; cleared only at the start of the next tick.
    pub fn received_buffers(&self) -> &[Buffer] {
        &self.delivered
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.addr
    }

    /// Measured RTT in milliseconds, or zero if never set.
    pub fn ping(&self) -> u64 {
        self.ping
    }

    /// Feed an externally measured RTT, used to seed the retransmission delay.
    pub fn set_ping(&mut self, ping_ms: u64) {
        self.ping = ping_ms;
    }

    /// Attach an opaque application value to this connection, replacing any previous one.
    pub fn set_user_data<T: 'static>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    /// Borrow the attached user data, if any was set and its type matches `T`.
    pub fn user_data<T: 'static>(&self) -> Option<&T> {
        self.user_data.as_deref()?.downcast_ref::<T>()
    }

    /// Mutably borrow the attached user data, if any was set and its type matches `T`.
    pub fn user_data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.user_data.as_deref_mut()?.downcast_mut::<T>()
    }

    // -- crate-internal state machine -----------------------------------------------

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub(crate) fn last_sent(&self) -> u64 {
        self.last_sent
    }

    pub(crate) fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat
    }

    pub(crate) fn last_ping_sent(&self) -> u64 {
        self.last_ping_sent
    }

    /// Update the liveness timestamp. Called by the network for every inbound
    /// datagram on this connection, regardless of packet kind.
    pub(crate) fn touch_heartbeat(&mut self, now: u64) {
        self.last_heartbeat = now;
    }

    /// Queue a handshake/teardown control packet: type `CONNECTION`, a one-byte
    /// sub-code, and an optional trailing diagnostic string. Sent unreliably, relying
    /// on the caller's retry loop rather than the reliable queue to tolerate loss.
    pub(crate) fn queue_connection_message(
        &mut self,
        sub: ConnectionMessage,
        info: Option<&str>,
    ) -> Result<(), PacketError> {
        let buf = self.send(false);
        buf.set_type(PacketKind::Connection as u8);
        buf.write_u8(sub as u8)?;
        if let Some(s) = info {
            buf.write_string(s)?;
        }
        Ok(())
    }

    /// Reliable-path reorder and ack-on-arrival logic, applied to every inbound
    /// `DATA` buffer handed to this connection. Buffers that end up neither delivered
    /// nor buffered in the reorder map are returned to `pool`.
    ///
    /// Acks every reliable packet as soon as it's accepted, even one that only gets
    /// buffered in the reorder map pending its predecessors — the source only acked
    /// packets that advanced the contiguous high-watermark, which made the sender
    /// pointlessly retransmit packets the receiver had already buffered.
    pub(crate) fn add_incoming(&mut self, buf: Buffer, now: u64, pool: &mut Vec<Buffer>) {
        self.last_heartbeat = now;

        if !buf.get_reliable() {
            self.delivered.push(buf);
            return;
        }

        let mut current = buf;
        // Only the buffer that just arrived over the wire gets a fresh ack; entries
        // drained out of `reorder` below were already acked the moment they were
        // first buffered, and must not be acked a second time here.
        let mut freshly_arrived = true;
        loop {
            let id = current.get_id();

            if id.wrapping_le(self.last_delivered_reliable_id) {
                // Duplicate or a very late retransmission: drop silently, no re-ack.
                current.clear();
                pool.push(current);
                return;
            }

            if freshly_arrived {
                self.pending_acks.push(id);
                freshly_arrived = false;
            }

            if id == self.last_delivered_reliable_id + 1 {
                self.last_delivered_reliable_id = id;
                self.delivered.push(current);

                match self.reorder.remove(&(self.last_delivered_reliable_id + 1)) {
                    Some(next) => current = next,
                    None => return,
                }
            } else {
                self.reorder.insert(id, current);
                return;
            }
        }
    }

    /// Remove the reliable queue entry matching `id`, in response to an inbound ack.
    pub(crate) fn handle_ack(&mut self, id: PacketId) {
        if let Some(pos) = self.reliable_tx.iter().position(|p| p.buffer.get_id() == id) {
            self.reliable_tx.remove(pos);
        }
    }

    pub(crate) fn send_ping(&mut self, now: u64) {
        self.last_ping_sent = now;
        self.send(false).set_type(PacketKind::Ping as u8);
    }

    pub(crate) fn handle_ping(&mut self) {
        self.send(false).set_type(PacketKind::Pong as u8);
    }

    /// A PONG resets both the heartbeat and the ping-retry timer: leaving
    /// `last_ping_sent` stale would make the connection immediately eligible to send
    /// another PING as soon as `response_timeout` re-elapses, defeating
    /// `ping_retry_delay` as a rate limit.
    pub(crate) fn handle_pong(&mut self, now: u64) {
        self.last_heartbeat = now;
        self.last_ping_sent = now;
    }

    /// Attach any pending acks to the tail of the unreliable queue, falling back to
    /// the reliable queue, falling back to a synthesized empty unreliable packet.
    fn attach_pending_acks(&mut self) -> Result<(), PacketError> {
        if self.pending_acks.is_empty() {
            return Ok(());
        }

        let acks = std::mem::take(&mut self.pending_acks);

        if let Some(p) = self.unreliable_tx.back_mut() {
            for &id in &acks {
                p.buffer.add_ack(id)?;
            }
        } else if let Some(p) = self.reliable_tx.back_mut() {
            for &id in &acks {
                p.buffer.add_ack(id)?;
            }
        } else {
            let buf = self.send(false);
            for &id in &acks {
                buf.add_ack(id)?;
            }
        }

        Ok(())
    }

    /// Attach pending acks, then send every queued unreliable packet once and every
    /// reliable packet that is either unsent or past its retransmission deadline.
    #[tracing::instrument(level = "trace", skip(self, socket), fields(addr = %self.addr))]
    pub(crate) fn flush(&mut self, socket: &UdpSocket, now: u64) {
        if let Err(error) = self.attach_pending_acks() {
            tracing::warn!(%error, "failed to attach pending acks");
        }

        for p in self.unreliable_tx.iter_mut() {
            if let Err(error) = p.buffer.finalize() {
                tracing::warn!(%error, "failed to finalize unreliable packet");
                continue;
            }
            if let Err(error) = socket.send_to(p.buffer.data(), self.addr) {
                tracing::warn!(%error, addr = %self.addr, "udp send failed");
            }
        }

        for p in self.reliable_tx.iter_mut() {
            let due = match p.last_sent {
                None => true,
                Some(last) => now.saturating_sub(last) >= self.ping,
            };
            if !due {
                continue;
            }

            if let Err(error) = p.buffer.finalize() {
                tracing::warn!(%error, "failed to finalize reliable packet");
                continue;
            }
            match socket.send_to(p.buffer.data(), self.addr) {
                Ok(_) => {
                    tracing::trace!(id = %p.buffer.get_id(), "sent reliable packet");
                    p.last_sent = Some(now);
                }
                Err(error) => tracing::warn!(%error, addr = %self.addr, "udp send failed"),
            }
        }

        if !self.unreliable_tx.is_empty() || !self.reliable_tx.is_empty() {
            self.last_sent = now;
        }
    }

    /// Release delivered-to-app buffers from the previous tick back to `pool`, and
    /// drop the just-flushed unreliable queue. Called once per tick, after `flush`.
    /// The reliable queue is left untouched: its entries persist until acked.
    pub(crate) fn end_tick(&mut self, pool: &mut Vec<Buffer>) {
        for mut buf in self.delivered.drain(..) {
            buf.clear();
            pool.push(buf);
        }
        self.unreliable_tx.clear();
    }

}


#[cfg(test)]
mod tests {

    use super::*;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    /// Build a reliable `DATA` buffer with the given wire id, as if it had arrived
    /// over the wire from a peer whose own `next_reliable_id` allocator produced it.
    fn reliable_buf(id: u16) -> Buffer {
        let mut buf = Buffer::new();
        buf.set_type(PacketKind::Data as u8);
        buf.set_reliable(true);
        buf.set_id(PacketId::new(id));
        buf
    }

    /// S3 out-of-order reliable: ids 1,2,3,4 arriving in order 2,4,1,3 must surface
    /// to the application as [], [], [1,2], [3,4] across the four arrivals, per
    /// spec.md §8 scenario S3.
    #[test]
    fn out_of_order_reliable_delivers_in_order() {
        let mut conn = Connection::new(addr(), 0);
        let mut pool = Vec::new();

        conn.add_incoming(reliable_buf(2), 0, &mut pool);
        assert!(conn.received_buffers().is_empty());

        conn.add_incoming(reliable_buf(4), 0, &mut pool);
        assert!(conn.received_buffers().is_empty());

        conn.end_tick(&mut pool);
        conn.add_incoming(reliable_buf(1), 0, &mut pool);
        let ids: Vec<u16> = conn.received_buffers().iter().map(|b| b.get_id().get()).collect();
        assert_eq!(ids, vec![1, 2]);

        conn.end_tick(&mut pool);
        conn.add_incoming(reliable_buf(3), 0, &mut pool);
        let ids: Vec<u16> = conn.received_buffers().iter().map(|b| b.get_id().get()).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    /// Early (out-of-order) reliable arrivals are acked on arrival, not just the ones
    /// that advance the contiguous high-watermark — the redesign fix for spec.md §9's
    /// "reorder buffer does not ack early packets".
    #[test]
    fn early_reliable_packets_are_acked_on_arrival() {
        let mut conn = Connection::new(addr(), 0);
        let mut pool = Vec::new();

        conn.add_incoming(reliable_buf(2), 0, &mut pool);
        assert_eq!(conn.pending_acks, vec![PacketId::new(2)]);
    }

    /// A reliable packet that was buffered early in the reorder map and already acked
    /// on arrival must not be acked a second time once it is drained out of the map by
    /// the arrival of its predecessor — otherwise the ack count on the next flush would
    /// over-count the number of distinct receipts (spec.md §8 invariant 4).
    #[test]
    fn draining_the_reorder_map_does_not_double_ack() {
        let mut conn = Connection::new(addr(), 0);
        let mut pool = Vec::new();

        conn.add_incoming(reliable_buf(2), 0, &mut pool);
        assert_eq!(conn.pending_acks, vec![PacketId::new(2)]);

        conn.pending_acks.clear();
        conn.add_incoming(reliable_buf(1), 0, &mut pool);
        assert_eq!(conn.pending_acks, vec![PacketId::new(1)]);
    }

    /// S4 dropped ack: a retransmitted duplicate (id <= R) is dropped without being
    /// re-acked as a *new* pending ack entry list addition beyond the original ack,
    /// and does not get delivered twice.
    #[test]
    fn duplicate_reliable_is_dropped_not_redelivered() {
        let mut conn = Connection::new(addr(), 0);
        let mut pool = Vec::new();

        conn.add_incoming(reliable_buf(1), 0, &mut pool);
        assert_eq!(conn.received_buffers().len(), 1);
        conn.end_tick(&mut pool);
        pool.clear();

        // Sender never saw the ack and retransmits id 1.
        conn.add_incoming(reliable_buf(1), 0, &mut pool);
        assert!(conn.received_buffers().is_empty());
        assert_eq!(pool.len(), 1, "duplicate buffer returned to the pool");
    }

    /// Invariant 4: after receiving a reliable packet, the next flush carries
    /// `HAS_ACK` with a matching count, piggybacked onto the unreliable queue tail
    /// when one exists.
    #[test]
    fn pending_acks_piggyback_onto_unreliable_tail() {
        let mut conn = Connection::new(addr(), 0);
        let mut pool = Vec::new();

        conn.add_incoming(reliable_buf(1), 0, &mut pool);
        conn.send(false); // outgoing unreliable packet exists to piggyback onto.
        conn.attach_pending_acks().unwrap();

        let tail = &mut conn.unreliable_tx.back_mut().unwrap().buffer;
        tail.finalize().unwrap();
        assert!(tail.has_ack());
        assert_eq!(tail.get_ack_count(), 1);
        assert_eq!(tail.get_ack(0).unwrap(), PacketId::new(1));
    }

    /// When no outgoing packet of either queue exists, a fresh unreliable packet is
    /// synthesized to carry the acks rather than delaying them.
    #[test]
    fn pending_acks_synthesize_unreliable_packet_when_queues_empty() {
        let mut conn = Connection::new(addr(), 0);
        let mut pool = Vec::new();

        conn.add_incoming(reliable_buf(1), 0, &mut pool);
        assert!(conn.unreliable_tx.is_empty());
        conn.attach_pending_acks().unwrap();
        assert_eq!(conn.unreliable_tx.len(), 1);
    }

    /// Retransmission: an unacked reliable packet is resent once `ping` ms have
    /// elapsed since its last send, and removed only once its ack arrives.
    #[test]
    fn reliable_retransmits_after_ping_and_clears_on_ack() {
        use mio::net::UdpSocket;

        let mut conn = Connection::new(addr(), 0);
        conn.set_ping(100);
        let id = {
            let buf = conn.send(true);
            buf.write_u8(7).unwrap();
            buf.get_id()
        };

        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        conn.flush(&socket, 0);
        let first_sent = conn.reliable_tx.front().unwrap().last_sent;
        assert_eq!(first_sent, Some(0));

        // Too soon: no retransmission.
        conn.flush(&socket, 50);
        assert_eq!(conn.reliable_tx.front().unwrap().last_sent, Some(0));

        // Past the ping interval: retransmitted.
        conn.flush(&socket, 150);
        assert_eq!(conn.reliable_tx.front().unwrap().last_sent, Some(150));

        conn.handle_ack(id);
        assert!(conn.reliable_tx.is_empty());
    }

}
