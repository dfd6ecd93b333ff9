//! # Backend Link
//!
//! The single control connection to the authoritative backend process.
//!
//! Lifecycle is a three-state machine:
//!
//! ```text
//! disconnected → connect-sent → ready → disconnected (on any read error)
//! ```
//!
//! The transport opens the socket on a fixed retry interval (exactly one
//! backend link exists, so reconnect storms are not a topology concern and
//! no backoff is applied). Entering `ready` triggers the partial-failure
//! recovery path (replaying session identities and re-submitting pending
//! handoffs), which the dispatch engine drives because it owns the session
//! table and the auth store.
//!
//! Losing the link resets all cross-server state: the other-server counter
//! and every cached map route. While the link is not ready, operations that
//! need the backend fail fast with `BackendUnavailable`; the core never
//! silently drops a save.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::backend::wire::{self, BackendMsg};
use crate::codec::framing::{ConnBuffer, Frame};
use crate::codec::registry::Registry;
use crate::error::{ProtocolError, Result};

/// Connection state of the backend link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    ConnectSent,
    Ready,
}

/// Map id → (ip, port) of the world server responsible for it.
///
/// Populated from the backend's announce messages; dropped wholesale when
/// the link dies, since the data may be arbitrarily stale by the time the
/// link returns.
#[derive(Debug, Default)]
pub struct RouteTable {
    by_map: HashMap<u16, (u32, u16)>,
}

impl RouteTable {
    #[must_use]
    pub fn lookup(&self, map: u16) -> Option<(u32, u16)> {
        self.by_map.get(&map).copied()
    }

    pub fn announce(&mut self, ip: u32, port: u16, maps: &[u16]) {
        for &m in maps {
            self.by_map.insert(m, (ip, port));
        }
    }

    pub fn retract(&mut self, ip: u32, port: u16, maps: &[u16]) {
        for m in maps {
            if self.by_map.get(m) == Some(&(ip, port)) {
                self.by_map.remove(m);
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_map.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_map.is_empty()
    }
}

/// Process-wide singleton managing the backend control connection.
pub struct BackendLink {
    state: LinkState,
    buf: ConnBuffer,
    registry: Arc<Registry>,
    last_ping_sent: Option<Instant>,
    /// Liveness flag refreshed by ping acks; diagnostics only.
    peer_alive: bool,
    /// Name reported by the backend after it accepts our area list.
    server_name: Option<String>,
    other_server_count: u32,
    routes: RouteTable,
}

impl BackendLink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            buf: ConnBuffer::new(),
            registry: Arc::new(Registry::backend()),
            last_ping_sent: None,
            peer_alive: false,
            server_name: None,
            other_server_count: 0,
            routes: RouteTable::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// Fails fast while the link is down; callers decide whether to retry,
    /// queue, or surface the failure.
    pub fn require_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ProtocolError::BackendUnavailable)
        }
    }

    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    #[must_use]
    pub fn other_server_count(&self) -> u32 {
        self.other_server_count
    }

    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// A fresh socket to the backend exists; send the connect handshake.
    pub fn socket_opened(&mut self, user: &str, password: &str, public_ip: u32, public_port: u16) {
        debug!("backend socket opened, sending connect handshake");
        self.buf = ConnBuffer::new();
        self.buf
            .queue_send(&wire::encode_connect_req(user, password, public_ip, public_port));
        self.state = LinkState::ConnectSent;
        self.last_ping_sent = None;
        self.peer_alive = false;
    }

    /// Socket error or EOF. Resets all cross-server counters and cached
    /// address-mapping data; the transport schedules the reconnect.
    pub fn socket_closed(&mut self) {
        if self.state != LinkState::Disconnected {
            warn!("backend link lost, dropping cross-server state");
        }
        self.state = LinkState::Disconnected;
        self.buf = ConnBuffer::new();
        self.other_server_count = 0;
        self.routes.clear();
        self.peer_alive = false;
        self.last_ping_sent = None;
    }

    /// Bytes arrived from the backend socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.feed(bytes);
    }

    /// Extract and consume the next complete backend frame.
    ///
    /// The backend is a trusted peer on a single link, so frames are
    /// consumed as they are taken; the client-side liveness dance does not
    /// apply here.
    pub fn poll_frame(&mut self) -> Result<Option<Frame>> {
        let table = self
            .registry
            .table(wire::BACKEND_VERSION)
            .ok_or(ProtocolError::BackendUnavailable)?;
        match self.buf.peek_frame(table)? {
            Some(frame) => {
                self.buf.consume(frame.len());
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Apply a decoded message's link-level effects. Returns `true` when
    /// the message completed the connect handshake and the engine must run
    /// the ready-recovery path.
    ///
    /// Messages inconsistent with the current state are no-ops.
    pub fn apply(&mut self, msg: &BackendMsg) -> bool {
        match (self.state, msg) {
            (LinkState::ConnectSent, BackendMsg::ConnectAck { ok: true }) => {
                info!("backend accepted connection, link ready");
                self.state = LinkState::Ready;
                true
            }
            (LinkState::ConnectSent, BackendMsg::ConnectAck { ok: false }) => {
                warn!("backend refused credentials");
                self.state = LinkState::Disconnected;
                false
            }
            (LinkState::Ready, BackendMsg::AreaListAck { server_name }) => {
                info!(backend = %server_name, "area list accepted");
                self.server_name = Some(server_name.clone());
                false
            }
            (LinkState::Ready, BackendMsg::PingAck) => {
                self.peer_alive = true;
                false
            }
            (LinkState::Ready, BackendMsg::MapAnnounce { ip, port, maps }) => {
                self.other_server_count += 1;
                self.routes.announce(*ip, *port, maps);
                debug!(maps = maps.len(), "peer world server announced");
                false
            }
            (LinkState::Ready, BackendMsg::MapRetract { ip, port, maps }) => {
                self.other_server_count = self.other_server_count.saturating_sub(1);
                self.routes.retract(*ip, *port, maps);
                false
            }
            _ => false,
        }
    }

    /// Emit a keepalive ping if the interval elapsed while ready.
    pub fn maybe_keepalive(&mut self, now: Instant, interval: Duration) {
        if self.state != LinkState::Ready {
            return;
        }
        let due = match self.last_ping_sent {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= interval,
        };
        if due {
            self.last_ping_sent = Some(now);
            self.buf.queue_send(&wire::encode_ping());
        }
    }

    /// Queue bytes for the backend. Fails unless the link is ready, except
    /// for the handshake itself which goes through [`Self::socket_opened`].
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.require_ready()?;
        self.buf.queue_send(bytes);
        Ok(())
    }

    /// Drain bytes the transport should write to the backend socket.
    pub fn take_outgoing(&mut self) -> Bytes {
        self.buf.take_outgoing()
    }

    #[must_use]
    pub fn has_outgoing(&self) -> bool {
        self.buf.pending_out() > 0
    }
}

impl Default for BackendLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened_link() -> BackendLink {
        let mut link = BackendLink::new();
        link.socket_opened("gate01", "secret", 0x7f00_0001, 5121);
        link
    }

    #[test]
    fn connect_handshake_reaches_ready() {
        let mut link = opened_link();
        assert_eq!(link.state(), LinkState::ConnectSent);
        let out = link.take_outgoing();
        assert_eq!(u16::from_le_bytes([out[0], out[1]]), wire::op::CONNECT_REQ);

        let ready = link.apply(&BackendMsg::ConnectAck { ok: true });
        assert!(ready, "positive ack must trigger the recovery path");
        assert!(link.is_ready());
    }

    #[test]
    fn refused_credentials_drop_the_link() {
        let mut link = opened_link();
        assert!(!link.apply(&BackendMsg::ConnectAck { ok: false }));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn messages_in_wrong_state_are_noops() {
        let mut link = BackendLink::new();
        // ack without a connect in flight
        assert!(!link.apply(&BackendMsg::ConnectAck { ok: true }));
        assert_eq!(link.state(), LinkState::Disconnected);

        let mut link = opened_link();
        // ping ack before ready
        assert!(!link.apply(&BackendMsg::PingAck));
    }

    #[test]
    fn disconnect_resets_cross_server_state() {
        let mut link = opened_link();
        link.apply(&BackendMsg::ConnectAck { ok: true });
        link.apply(&BackendMsg::MapAnnounce {
            ip: 1,
            port: 2,
            maps: vec![7, 8],
        });
        assert_eq!(link.other_server_count(), 1);
        assert_eq!(link.routes().lookup(7), Some((1, 2)));

        link.socket_closed();
        assert_eq!(link.other_server_count(), 0);
        assert!(link.routes().is_empty());
        assert!(link.require_ready().is_err());
    }

    #[test]
    fn keepalive_fires_on_interval_only_while_ready() {
        let interval = Duration::from_secs(10);
        let mut link = opened_link();
        let t0 = Instant::now();

        // not ready yet: nothing queued beyond the handshake
        let _ = link.take_outgoing();
        link.maybe_keepalive(t0, interval);
        assert!(!link.has_outgoing());

        link.apply(&BackendMsg::ConnectAck { ok: true });
        link.maybe_keepalive(t0, interval);
        let out = link.take_outgoing();
        assert_eq!(u16::from_le_bytes([out[0], out[1]]), wire::op::PING);

        // within the interval: quiet
        link.maybe_keepalive(t0 + Duration::from_secs(5), interval);
        assert!(!link.has_outgoing());

        // past the interval: another ping
        link.maybe_keepalive(t0 + Duration::from_secs(10), interval);
        assert!(link.has_outgoing());
    }

    #[test]
    fn ping_ack_only_refreshes_diagnostics() {
        let mut link = opened_link();
        link.apply(&BackendMsg::ConnectAck { ok: true });
        let before = link.state();
        link.apply(&BackendMsg::PingAck);
        assert_eq!(link.state(), before);
    }

    #[test]
    fn send_fails_fast_while_down() {
        let mut link = BackendLink::new();
        match link.send(&wire::encode_ping()) {
            Err(ProtocolError::BackendUnavailable) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn retract_only_removes_matching_owner() {
        let mut routes = RouteTable::default();
        routes.announce(1, 10, &[5, 6]);
        routes.announce(2, 20, &[7]);
        // a retract from a different server must not clobber map 5
        routes.retract(2, 20, &[5, 7]);
        assert_eq!(routes.lookup(5), Some((1, 10)));
        assert_eq!(routes.lookup(7), None);
    }
}
