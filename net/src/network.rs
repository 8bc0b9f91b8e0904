//! Connection handshake, liveness scheduling and the single-threaded tick loop.
//!
//! [`Network`] owns the UDP socket, the connection table keyed by peer address, the
//! buffer pool, and the one-shot addressed-packet queue used for replies that precede
//! (REFUSE) or follow (post-destroy DISCONNECT) a tracked [`Connection`]'s lifetime.
//! Everything is driven synchronously from [`Network::update`]; there is no internal
//! thread and no async runtime.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use mio::net::UdpSocket;

use crate::buffer::Buffer;
use crate::connection::Connection;
use crate::error::NetError;
use crate::packet::{AddressedPacket, ConnectionMessage, PacketKind};

/// Tunable timings and bind parameters, grouped so the core never hardcodes these
/// outside of [`Default`]. Defaults match spec.md §4.2.
#[derive(Debug, Clone, Copy)]
pub struct NetworkConfig {
    /// A silent peer is pinged once this much time has passed since its last
    /// heartbeat, provided a ping isn't already outstanding.
    pub response_timeout: Duration,
    /// A peer silent for this long is destroyed with [`DisconnectReason::Timeout`].
    pub connection_timeout: Duration,
    /// Minimum spacing between consecutive PINGs sent while waiting for a response.
    pub ping_retry_delay: Duration,
    /// Minimum spacing between consecutive CM_REQUEST retries while `PENDING`.
    pub connection_request_retry_delay: Duration,
    /// Local UDP port to bind; `0` lets the OS assign one.
    pub bind_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(2000),
            connection_timeout: Duration::from_millis(5000),
            ping_retry_delay: Duration::from_millis(1000),
            connection_request_retry_delay: Duration::from_millis(1000),
            bind_port: 0,
        }
    }
}

/// Why a connection was torn down, passed to the disconnection callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The application called [`Network::disconnect`].
    Local,
    /// No inbound datagram for `connection_timeout`.
    Timeout,
    /// The peer sent `CM_DISCONNECT`.
    PeerDisconnect,
    /// A pending outgoing connection was refused by the peer (`CM_REFUSE`).
    Refused,
    /// A pending incoming connection's [`Network::new`] callback returned `false`.
    RequestRejected,
}

impl DisconnectReason {
    /// Whether a destruction for this reason should send a one-shot `CM_DISCONNECT`
    /// addressed packet to the peer. Skipped for [`Self::PeerDisconnect`] (the peer
    /// already knows, see spec.md §4.3 "destroys its local connection silently") and
    /// for [`Self::RequestRejected`] (the caller already sends a dedicated `CM_REFUSE`
    /// in its place).
    fn notifies_peer(self) -> bool {
        !matches!(self, Self::PeerDisconnect | Self::RequestRejected)
    }
}

enum Job {
    Destroy(SocketAddr, DisconnectReason),
}

type RequestCb = Box<dyn FnMut(&Connection, &mut String) -> bool>;
type DisconnectCb = Box<dyn FnMut(Connection, DisconnectReason)>;

/// Owns the socket, the connection table and the buffer pool; the sole entry point
/// driving handshakes, retransmission, liveness and dispatch is [`Network::update`].
pub struct Network {
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: NetworkConfig,

    connections: HashMap<SocketAddr, Connection>,
    free_pool: Vec<Buffer>,
    addressed_tx: Vec<AddressedPacket>,

    /// Set for the duration of [`Network::update`]; any destruction requested while
    /// it is set is deferred to `jobs` instead of mutating `connections` in place.
    in_update: bool,
    jobs: Vec<Job>,

    on_request: Option<RequestCb>,
    on_disconnect: Option<DisconnectCb>,
}

impl Network {

    /// Open a non-blocking IPv4 UDP socket bound to `config.bind_port` (`0` = OS
    /// assigned) and construct an otherwise-empty network.
    ///
    /// `on_request(conn, info_out)` is invoked synchronously whenever a peer sends a
    /// connection request; returning `true` accepts it, `false` refuses it and the
    /// diagnostic written to `info_out` is carried in the `CM_REFUSE` body.
    /// `on_disconnect(conn, reason)` is invoked synchronously whenever a connection,
    /// accepted or not, is torn down. Neither callback may call [`Network::update`];
    /// both may call [`Connection::send`] and [`Network::disconnect`].
    pub fn new<F, G>(
        on_request: F,
        on_disconnect: G,
        config: NetworkConfig,
    ) -> Result<Self, NetError>
    where
        F: FnMut(&Connection, &mut String) -> bool + 'static,
        G: FnMut(Connection, DisconnectReason) + 'static,
    {
        let bind_addr: SocketAddr = ([0, 0, 0, 0], config.bind_port).into();
        let socket = UdpSocket::bind(bind_addr).map_err(NetError::Bind)?;
        let local_addr = socket.local_addr().map_err(NetError::Bind)?;

        tracing::info!(addr = %local_addr, "udp socket bound");

        Ok(Self {
            socket,
            local_addr,
            config,
            connections: HashMap::new(),
            free_pool: Vec::new(),
            addressed_tx: Vec::new(),
            in_update: false,
            jobs: Vec::new(),
            on_request: Some(Box::new(on_request)),
            on_disconnect: Some(Box::new(on_disconnect)),
        })
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Human-readable status line, mirroring the original's `getStatus()`; useful for
    /// a CLI status line or a test assertion, not part of the reliability contract.
    pub fn status(&self) -> String {
        format!(
            "socket bound on {} ({} connection{})",
            self.local_addr,
            self.connections.len(),
            if self.connections.len() == 1 { "" } else { "s" },
        )
    }

    /// Whether the socket is still usable. Always `true` today: the socket is closed
    /// only by dropping the `Network`, mirroring the original's `isUp()`.
    pub fn is_bound(&self) -> bool {
        true
    }

    /// Look up an established or pending connection by endpoint.
    pub fn connection(&self, addr: SocketAddr) -> Option<&Connection> {
        self.connections.get(&addr)
    }

    /// Mutably look up an established or pending connection by endpoint.
    pub fn connection_mut(&mut self, addr: SocketAddr) -> Option<&mut Connection> {
        self.connections.get_mut(&addr)
    }

    /// Iterate over every tracked connection, pending or established.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    // -- lifecycle ------------------------------------------------------------------

    /// Resolve `host:port`, create a `PENDING` connection and schedule its first
    /// `CM_REQUEST`. Returns the connection's endpoint, a stable handle usable with
    /// [`Network::connection`] until [`Network::disconnect`] fires its callback.
    /// Resolving again for an endpoint already tracked just returns it unchanged.
    pub fn connect(&mut self, host: &str, port: u16, now: u64) -> Result<SocketAddr, NetError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(NetError::ResolveFailure)?
            .next()
            .ok_or_else(|| {
                NetError::ResolveFailure(io::Error::new(
                    io::ErrorKind::NotFound,
                    "address resolved to no candidates",
                ))
            })?;

        if !self.connections.contains_key(&addr) {
            let mut conn = Connection::new(addr, now);
            if let Err(error) = conn.queue_connection_message(ConnectionMessage::Request, None) {
                tracing::warn!(%error, "failed to queue connection request");
            }
            self.connections.insert(addr, conn);
            tracing::debug!(%addr, "connection request scheduled");
        }

        Ok(addr)
    }

    /// Schedule `addr`'s destruction with [`DisconnectReason::Local`]. Deferred the
    /// same way an in-tick destruction is: it takes effect at the end of the next
    /// [`Network::update`] call, which then invokes the disconnection callback.
    pub fn disconnect(&mut self, addr: SocketAddr) {
        if self.connections.contains_key(&addr) {
            self.jobs.push(Job::Destroy(addr, DisconnectReason::Local));
        }
    }

    fn destroy_connection(&mut self, addr: SocketAddr, reason: DisconnectReason) {
        if self.in_update {
            self.jobs.push(Job::Destroy(addr, reason));
            return;
        }

        let Some(conn) = self.connections.remove(&addr) else { return };

        if reason.notifies_peer() {
            self.queue_addressed(addr, |buf| {
                buf.set_type(PacketKind::Connection as u8);
                buf.write_u8(ConnectionMessage::Disconnect as u8)?;
                buf.write_string("")?;
                Ok(())
            });
        }

        tracing::info!(%addr, ?reason, "connection destroyed");

        if let Some(mut cb) = self.on_disconnect.take() {
            cb(conn, reason);
            self.on_disconnect = Some(cb);
        }
    }

    /// Queue a one-shot addressed packet (outside any tracked connection) built by
    /// `fill`, used for `CM_REFUSE` and post-destroy `CM_DISCONNECT` replies.
    fn queue_addressed(
        &mut self,
        addr: SocketAddr,
        fill: impl FnOnce(&mut Buffer) -> Result<(), crate::error::PacketError>,
    ) {
        let mut buf = self.take_buffer();
        if let Err(error) = fill(&mut buf) {
            tracing::warn!(%error, "failed to build addressed packet");
            self.give_buffer(buf);
            return;
        }
        self.addressed_tx.push(AddressedPacket::new(buf, addr));
    }

    fn take_buffer(&mut self) -> Buffer {
        self.free_pool.pop().unwrap_or_default()
    }

    fn give_buffer(&mut self, mut buf: Buffer) {
        buf.clear();
        self.free_pool.push(buf);
    }

    // -- tick -------------------------------------------------------------------------

    /// Run one tick: per-connection scheduling and flush, addressed-packet flush,
    /// socket drain and dispatch, then deferred destructions. `now` is monotonic
    /// milliseconds and must be non-decreasing across calls.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn update(&mut self, now: u64) {
        self.in_update = true;

        self.schedule_and_flush(now);
        self.flush_addressed();
        self.drain_socket(now);

        self.in_update = false;
        self.run_jobs();
    }

    fn schedule_and_flush(&mut self, now: u64) {
        let request_retry = self.config.connection_request_retry_delay.as_millis() as u64;
        let response_timeout = self.config.response_timeout.as_millis() as u64;
        let connection_timeout = self.config.connection_timeout.as_millis() as u64;
        let ping_retry = self.config.ping_retry_delay.as_millis() as u64;

        let mut timed_out = Vec::new();

        for (&addr, conn) in self.connections.iter_mut() {
            if !conn.is_connected() {
                if now.saturating_sub(conn.last_sent()) >= request_retry {
                    if let Err(error) = conn.queue_connection_message(ConnectionMessage::Request, None) {
                        tracing::warn!(%error, %addr, "failed to queue connection request retry");
                    }
                }
            } else if now.saturating_sub(conn.last_heartbeat()) >= connection_timeout {
                timed_out.push(addr);
                continue;
            } else if now.saturating_sub(conn.last_heartbeat()) >= response_timeout
                && now.saturating_sub(conn.last_ping_sent()) >= ping_retry
            {
                conn.send_ping(now);
            }

            conn.flush(&self.socket, now);
            conn.end_tick(&mut self.free_pool);
        }

        for addr in timed_out {
            self.destroy_connection(addr, DisconnectReason::Timeout);
        }
    }

    fn flush_addressed(&mut self) {
        for mut packet in self.addressed_tx.drain(..) {
            if let Err(error) = packet.buffer.finalize() {
                tracing::warn!(%error, "failed to finalize addressed packet");
                continue;
            }
            if let Err(error) = self.socket.send_to(packet.buffer.data(), packet.addr) {
                tracing::warn!(%error, addr = %packet.addr, "udp send failed (addressed)");
            }
            self.give_buffer(packet.buffer);
        }
    }

    fn drain_socket(&mut self, now: u64) {
        loop {
            let mut buf = self.take_buffer();
            let (len, addr) = match self.socket.recv_from(buf.raw_mut()) {
                Ok(t) => t,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    self.give_buffer(buf);
                    break;
                }
                Err(error) => {
                    tracing::warn!(%error, "udp receive failed");
                    self.give_buffer(buf);
                    break;
                }
            };

            if len == 0 {
                self.give_buffer(buf);
                break;
            }

            buf.set_received_len(len);
            self.dispatch(addr, buf, now);
        }
    }

    fn dispatch(&mut self, addr: SocketAddr, mut buf: Buffer, now: u64) {
        if buf.has_ack() {
            if let Some(conn) = self.connections.get_mut(&addr) {
                for i in 0..buf.get_ack_count() {
                    match buf.get_ack(i) {
                        Ok(id) => conn.handle_ack(id),
                        Err(error) => {
                            tracing::warn!(%error, %addr, "malformed ack list");
                            break;
                        }
                    }
                }
            }
        }

        let Some(kind) = PacketKind::from_wire(buf.get_type()) else {
            tracing::debug!(%addr, "dropping datagram with unknown packet type");
            self.give_buffer(buf);
            return;
        };

        match kind {
            PacketKind::Ping => {
                if let Some(conn) = self.connections.get_mut(&addr) {
                    conn.touch_heartbeat(now);
                    conn.handle_ping();
                }
                self.give_buffer(buf);
            }
            PacketKind::Pong => {
                if let Some(conn) = self.connections.get_mut(&addr) {
                    conn.touch_heartbeat(now);
                    conn.handle_pong(now);
                }
                self.give_buffer(buf);
            }
            PacketKind::Connection => {
                self.dispatch_handshake(addr, &mut buf, now);
                self.give_buffer(buf);
            }
            PacketKind::Data => {
                match self.connections.get_mut(&addr) {
                    Some(conn) => conn.add_incoming(buf, now, &mut self.free_pool),
                    None => self.give_buffer(buf),
                }
            }
        }
    }

    fn dispatch_handshake(&mut self, addr: SocketAddr, buf: &mut Buffer, now: u64) {
        let sub = match buf.read_u8().ok().and_then(ConnectionMessage::from_wire) {
            Some(sub) => sub,
            None => {
                tracing::debug!(%addr, "dropping malformed connection packet");
                return;
            }
        };

        match sub {
            ConnectionMessage::Request => self.handle_request(addr, now),
            ConnectionMessage::Accept => {
                if let Some(conn) = self.connections.get_mut(&addr) {
                    conn.touch_heartbeat(now);
                    conn.set_connected(true);
                    tracing::info!(%addr, "connection established");
                }
            }
            ConnectionMessage::Refuse => {
                if self.connections.contains_key(&addr) {
                    self.destroy_connection(addr, DisconnectReason::Refused);
                }
            }
            ConnectionMessage::Disconnect => {
                if self.connections.contains_key(&addr) {
                    self.destroy_connection(addr, DisconnectReason::PeerDisconnect);
                }
            }
        }
    }

    /// A peer sent `CM_REQUEST`. Mirrors the original's `createConnection` +
    /// callback + `acceptConnection`/`refuseConnection` dance: a connection already
    /// `ESTABLISHED` for this endpoint just re-acks by re-sending `CM_ACCEPT`
    /// (handles the peer's own request retry racing a lost accept).
    fn handle_request(&mut self, addr: SocketAddr, now: u64) {
        if let Some(conn) = self.connections.get_mut(&addr) {
            if conn.is_connected() {
                if let Err(error) = conn.queue_connection_message(ConnectionMessage::Accept, None) {
                    tracing::warn!(%error, %addr, "failed to re-queue connection accept");
                }
            }
            return;
        }

        let mut conn = Connection::new(addr, now);
        let mut info = String::new();

        let accepted = match self.on_request.take() {
            Some(mut cb) => {
                let accepted = cb(&conn, &mut info);
                self.on_request = Some(cb);
                accepted
            }
            None => false,
        };

        if accepted {
            conn.set_connected(true);
            if let Err(error) = conn.queue_connection_message(ConnectionMessage::Accept, None) {
                tracing::warn!(%error, %addr, "failed to queue connection accept");
            }
            self.connections.insert(addr, conn);
            tracing::info!(%addr, "connection accepted");
        } else {
            self.queue_addressed(addr, |buf| {
                buf.set_type(PacketKind::Connection as u8);
                buf.write_u8(ConnectionMessage::Refuse as u8)?;
                buf.write_string(&info)
            });
            tracing::info!(%addr, %info, "connection refused");
            // `conn` is local-only (never inserted), so tearing it down just fires
            // the disconnection callback without touching the connection map.
            if let Some(mut cb) = self.on_disconnect.take() {
                cb(conn, DisconnectReason::RequestRejected);
                self.on_disconnect = Some(cb);
            }
        }
    }

    fn run_jobs(&mut self) {
        for job in std::mem::take(&mut self.jobs) {
            let Job::Destroy(addr, reason) = job;
            self.destroy_connection(addr, reason);
        }
    }

}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn config_defaults_match_spec() {
        let cfg = NetworkConfig::default();
        assert_eq!(cfg.response_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.connection_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.ping_retry_delay, Duration::from_millis(1000));
        assert_eq!(cfg.connection_request_retry_delay, Duration::from_millis(1000));
        assert_eq!(cfg.bind_port, 0);
    }

    #[test]
    fn disconnect_reason_notification_policy() {
        assert!(DisconnectReason::Local.notifies_peer());
        assert!(DisconnectReason::Timeout.notifies_peer());
        assert!(DisconnectReason::Refused.notifies_peer());
        assert!(!DisconnectReason::PeerDisconnect.notifies_peer());
        assert!(!DisconnectReason::RequestRejected.notifies_peer());
    }

    #[test]
    fn handshake_between_two_local_sockets() {
        let accepted = std::rc::Rc::new(std::cell::RefCell::new(false));
        let accepted2 = accepted.clone();

        let mut server = Network::new(
            move |_conn, _info| {
                *accepted2.borrow_mut() = true;
                true
            },
            |_conn, _reason| {},
            NetworkConfig::default(),
        ).unwrap();

        let mut client = Network::new(
            |_conn, _info| true,
            |_conn, _reason| {},
            NetworkConfig::default(),
        ).unwrap();

        let server_addr = server.local_addr();

        let mut now = 0u64;
        let client_addr = client.connect("127.0.0.1", server_addr.port(), now).unwrap();

        // Client sends CM_REQUEST, server receives and accepts, client receives CM_ACCEPT.
        for _ in 0..4 {
            now += 10;
            client.update(now);
            server.update(now);
        }

        assert!(*accepted.borrow());
        assert!(client.connection(client_addr).unwrap().is_connected());
    }

    /// S2 refuse: a server whose `on_request` returns `false` sends `CM_REFUSE`; the
    /// client's connection is destroyed and its disconnection callback fires with
    /// [`DisconnectReason::Refused`].
    #[test]
    fn refused_connection_destroys_client_side() {
        let mut server = Network::new(
            |_conn, info| {
                info.push_str("server full");
                false
            },
            |_conn, _reason| {},
            NetworkConfig::default(),
        ).unwrap();

        let reason = std::rc::Rc::new(std::cell::RefCell::new(None));
        let reason2 = reason.clone();
        let mut client = Network::new(
            |_conn, _info| true,
            move |_conn, r| *reason2.borrow_mut() = Some(r),
            NetworkConfig::default(),
        ).unwrap();

        let server_addr = server.local_addr();
        let mut now = 0u64;
        let client_addr = client.connect("127.0.0.1", server_addr.port(), now).unwrap();

        for _ in 0..4 {
            now += 10;
            client.update(now);
            server.update(now);
        }

        assert_eq!(*reason.borrow(), Some(DisconnectReason::Refused));
        assert!(client.connection(client_addr).is_none());
    }

    /// S5 timeout: a fully silent peer for `connection_timeout` ms triggers
    /// `on_disconnection` exactly once and removes the connection from the map.
    #[test]
    fn silent_peer_times_out() {
        let reason = std::rc::Rc::new(std::cell::RefCell::new(None));
        let reason2 = reason.clone();
        let mut net = Network::new(
            |_conn, _info| true,
            move |_conn, r| *reason2.borrow_mut() = Some(r),
            NetworkConfig::default(),
        ).unwrap();

        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        net.connections.insert(addr, Connection::new(addr, 0));
        net.connections.get_mut(&addr).unwrap().set_connected(true);

        net.update(1000);
        assert!(net.connection(addr).is_some(), "not yet timed out");

        net.update(5001);
        assert!(net.connection(addr).is_none());
        assert_eq!(*reason.borrow(), Some(DisconnectReason::Timeout));
    }

}
