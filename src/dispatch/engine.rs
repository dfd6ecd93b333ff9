//! # Dispatch Engine
//!
//! Single-threaded core owning every session, the auth-node store, and the
//! backend link. All mutation funnels through one engine value driven by
//! the transport's scheduling tick, so none of the state behind it needs
//! locking.
//!
//! Each tick walks every connection with pending input and dispatches at
//! most a fixed number of frames per connection, round-robin, so one
//! flooding client cannot starve the rest. Frames from one connection are
//! always processed in arrival order.
//!
//! A session is detached from the table while its handler runs; handlers
//! get `&mut Engine` and may deliver to any other session, begin handoffs,
//! or talk to the backend. Output addressed to the detached session is
//! parked and re-queued when it is reinserted. Teardown requested by a
//! handler takes effect only after the current frame fully returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::random;
use tracing::{debug, info, warn};

use crate::backend::auth::{AuthNode, AuthStore, HandoffState};
use crate::backend::link::BackendLink;
use crate::backend::wire::{self, BackendMsg};
use crate::broadcast::{
    self, AreaParams, BroadcastOptions, DeliveryScope, EntityId, MapId, Payload, RawPayload,
    Recipients, VersionedEncoder, WorldIndex,
};
use crate::codec::cursor::ByteWriter;
use crate::codec::framing::Frame;
use crate::codec::registry::{opcodes, Descriptor, FrameLen, Registry};
use crate::config::NetworkConfig;
use crate::dispatch::handler::HandlerMap;
use crate::dispatch::session::{Session, SessionId, SessionPhase};
use crate::error::{ProtocolError, RejectReason, Result};
use crate::utils::metrics::Metrics;

/// Smallest and largest account id a handshake may carry. Anything outside
/// this window fails version sniffing for every registered version.
pub const ACCOUNT_ID_MIN: u32 = 2_000_000;
pub const ACCOUNT_ID_MAX: u32 = 100_000_000;

/// Identity material a login presents, as carried by the handshake frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginCredentials {
    pub account_id: u32,
    pub char_id: u32,
    /// Correlation token issued to the client by the backend beforehand.
    pub token1: u32,
    pub sex: u8,
}

/// Where a map-change is headed; kept until the backend answers so the
/// route request can be re-issued after a link loss.
#[derive(Debug, Clone)]
struct RoutePlan {
    map: String,
    x: i16,
    y: i16,
    ip: u32,
    port: u16,
}

/// Identity of the session currently detached for handler dispatch.
struct DetachedMeta {
    id: SessionId,
    version: Option<u16>,
    active: bool,
}

enum Sniff {
    Match(u16),
    Incomplete,
    NoMatch,
}

/// The dispatch engine. One per process, owned by the transport task.
pub struct Engine {
    registry: Arc<Registry>,
    handlers: Arc<HandlerMap>,
    sessions: HashMap<SessionId, Session>,
    by_entity: HashMap<EntityId, SessionId>,
    by_account: HashMap<u32, SessionId>,
    auth: AuthStore,
    link: BackendLink,
    world: Arc<dyn WorldIndex>,
    cfg: NetworkConfig,
    metrics: Arc<Metrics>,
    route_plans: HashMap<u32, RoutePlan>,
    next_session: u64,
    started: Instant,
    detached: Option<DetachedMeta>,
    /// Output addressed to the detached session while a handler runs.
    pending_sends: Vec<(SessionId, Bytes)>,
}

impl Engine {
    #[must_use]
    pub fn new(cfg: NetworkConfig, world: Arc<dyn WorldIndex>) -> Self {
        Self::with_parts(
            cfg,
            world,
            Arc::new(Registry::builtin_client()),
            Arc::new(builtin_handlers()),
        )
    }

    #[must_use]
    pub fn with_parts(
        cfg: NetworkConfig,
        world: Arc<dyn WorldIndex>,
        registry: Arc<Registry>,
        handlers: Arc<HandlerMap>,
    ) -> Self {
        Self {
            registry,
            handlers,
            sessions: HashMap::new(),
            by_entity: HashMap::new(),
            by_account: HashMap::new(),
            auth: AuthStore::new(),
            link: BackendLink::new(),
            world,
            cfg,
            metrics: Arc::new(Metrics::new()),
            route_plans: HashMap::new(),
            next_session: 0,
            started: Instant::now(),
            detached: None,
            pending_sends: Vec::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.cfg
    }

    #[must_use]
    pub fn auth_store(&self) -> &AuthStore {
        &self.auth
    }

    #[must_use]
    pub fn link(&self) -> &BackendLink {
        &self.link
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn session(&self, sid: SessionId) -> Option<&Session> {
        self.sessions.get(&sid)
    }

    pub fn session_mut(&mut self, sid: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&sid)
    }

    /// Milliseconds since the engine started; the tick value echoed to
    /// clients.
    #[must_use]
    pub fn uptime_ticks(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    // ---- session lifecycle -------------------------------------------------

    /// A client socket was accepted. Over the connection limit the session
    /// still gets a slot just long enough to receive a rejection frame.
    pub fn session_opened(&mut self, client_ip: u32) -> SessionId {
        self.next_session += 1;
        let sid = SessionId(self.next_session);
        let mut session = Session::new(sid, client_ip);
        if self.sessions.len() >= self.cfg.server.max_connections {
            warn!(session = %sid, limit = self.cfg.server.max_connections, "connection limit reached");
            session.mark_closing(Some(RejectReason::ServerClosed));
        }
        self.sessions.insert(sid, session);
        self.metrics.inc_sessions_opened();
        debug!(session = %sid, "session opened");
        sid
    }

    pub fn attach_writer(&mut self, sid: SessionId, tx: tokio::sync::mpsc::UnboundedSender<Bytes>) {
        if let Some(s) = self.sessions.get_mut(&sid) {
            s.attach_writer(tx);
        }
    }

    /// Bytes arrived from a client socket.
    pub fn feed(&mut self, sid: SessionId, bytes: &[u8]) {
        if let Some(s) = self.sessions.get_mut(&sid) {
            s.buf.feed(bytes);
        }
    }

    /// Socket EOF or read error. The session is reaped on the next tick so
    /// its logout handoff goes through the single teardown path.
    pub fn session_closed(&mut self, sid: SessionId) {
        if let Some(s) = self.sessions.get_mut(&sid) {
            s.mark_closing(None);
        }
    }

    // ---- the scheduling tick -----------------------------------------------

    /// One dispatch pass. Returns the sessions torn down this tick.
    pub fn tick(&mut self, now: Instant) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        for sid in ids {
            self.run_session(sid, now);
        }

        let closing: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_closing())
            .map(Session::id)
            .collect();
        for &sid in &closing {
            self.teardown(sid);
        }

        self.link
            .maybe_keepalive(now, self.cfg.backend.keepalive_interval);

        for s in self.sessions.values_mut() {
            s.flush();
        }
        closing
    }

    fn run_session(&mut self, sid: SessionId, now: Instant) {
        let Some(mut session) = self.sessions.remove(&sid) else {
            return;
        };
        self.detached = Some(DetachedMeta {
            id: sid,
            version: session.version,
            active: session.is_authed(),
        });

        for _ in 0..self.cfg.server.frames_per_tick {
            if session.is_closing() || !session.buf.has_input() {
                break;
            }
            if !self.dispatch_one(&mut session, now) {
                break;
            }
        }

        self.detached = None;
        for (target, bytes) in std::mem::take(&mut self.pending_sends) {
            if target == sid {
                session.buf.queue_send(&bytes);
            } else if let Some(s) = self.sessions.get_mut(&target) {
                s.buf.queue_send(&bytes);
            }
        }
        self.sessions.insert(sid, session);
    }

    /// Dispatch at most one frame. Returns `false` when the loop for this
    /// session should stop (need more bytes, or the session is done for).
    fn dispatch_one(&mut self, session: &mut Session, now: Instant) -> bool {
        let sid = session.id();
        let version = match session.version {
            Some(v) => v,
            None => match self.sniff_version(session) {
                Sniff::Match(v) => {
                    session.version = Some(v);
                    if let Some(m) = self.detached.as_mut() {
                        m.version = Some(v);
                    }
                    debug!(session = %sid, version = v, "protocol version negotiated");
                    v
                }
                Sniff::Incomplete => return false,
                Sniff::NoMatch => {
                    warn!(session = %sid, "handshake matched no protocol version");
                    self.metrics.inc_protocol_violations();
                    session.mark_closing(Some(RejectReason::VersionRejected));
                    return false;
                }
            },
        };

        let registry = Arc::clone(&self.registry);
        let Some(table) = registry.table(version) else {
            session.mark_closing(None);
            return false;
        };
        let frame = match session.buf.peek_frame(table) {
            Ok(Some(f)) => f,
            Ok(None) => return false,
            Err(e) => {
                warn!(session = %sid, error = %e, "protocol violation");
                self.metrics.inc_protocol_violations();
                session.mark_closing(None);
                return false;
            }
        };
        // peek_frame already resolved the descriptor; re-fetch for the
        // handler's layout information.
        let Some(descriptor) = table.descriptor(frame.opcode()) else {
            session.mark_closing(None);
            return false;
        };

        let Some(name) = descriptor.handler.clone() else {
            warn!(
                session = %sid,
                opcode = format_args!("0x{:04x}", frame.opcode()),
                "inbound frame for a send-only opcode"
            );
            self.metrics.inc_protocol_violations();
            session.mark_closing(None);
            return false;
        };

        if !session.is_authed() && !self.handlers.is_pre_auth(&name) {
            warn!(
                session = %sid,
                error = %ProtocolError::NotAuthenticated(frame.opcode()),
                "dropping connection"
            );
            self.metrics.inc_protocol_violations();
            session.mark_closing(None);
            return false;
        }

        let handlers = Arc::clone(&self.handlers);
        match handlers.dispatch(&name, self, session, &frame, descriptor) {
            None => {
                warn!(handler = %name, "descriptor names an unregistered handler");
                session.mark_closing(None);
            }
            Some(Err(e)) => {
                warn!(session = %sid, handler = %name, error = %e, "handler failed");
                session.mark_closing(None);
            }
            Some(Ok(())) => {
                self.metrics.inc_frames_dispatched();
            }
        }

        // The liveness re-check: only a still-live session advances past
        // the frame, so teardown mid-handler never consumes input it did
        // not fully process.
        if session.is_closing() {
            return false;
        }
        session.buf.consume(frame.len());
        session.touch(now);
        true
    }

    /// Try every version's handshake descriptor against the buffered bytes,
    /// newest first. A version is accepted only if the frame is complete at
    /// the declared length and the embedded identity fields are plausible.
    /// Ties go to the newest matching version.
    fn sniff_version(&self, session: &Session) -> Sniff {
        let raw = session.buf.raw_input();
        if raw.len() < 2 {
            return Sniff::Incomplete;
        }
        let opcode = u16::from_le_bytes([raw[0], raw[1]]);
        let mut any_incomplete = false;

        for table in self.registry.versions_newest_first() {
            let Some(hs) = table.handshake_opcode() else {
                continue;
            };
            if hs != opcode {
                continue;
            }
            let Some(d) = table.descriptor(hs) else {
                continue;
            };
            let FrameLen::Fixed(len) = d.len else {
                continue;
            };
            if raw.len() < len as usize {
                any_incomplete = true;
                continue;
            }
            let frame = Frame::new(opcode, Bytes::copy_from_slice(&raw[..len as usize]));
            if handshake_fields_valid(&frame, d) {
                return Sniff::Match(table.version());
            }
        }
        if any_incomplete {
            Sniff::Incomplete
        } else {
            Sniff::NoMatch
        }
    }

    fn teardown(&mut self, sid: SessionId) {
        let Some(mut session) = self.sessions.remove(&sid) else {
            return;
        };
        if let Some(reason) = session.close_reason {
            session.queue_send(&reject_frame(reason));
            self.metrics.inc_rejects_sent();
        }
        session.flush();

        if let Some(entity) = session.entity {
            self.by_entity.remove(&entity);
        }
        if let Some(account_id) = session.account_id {
            self.by_account.remove(&account_id);
            // A map change abandoned mid-route must not keep its plan; the
            // logout handoff below supersedes it.
            self.route_plans.remove(&account_id);

            if let Some(char_id) = session.char_id.filter(|_| session.entity.is_some()) {
                // Authenticated session gone: its state must reach the
                // backend even though the socket is already dead.
                self.auth.remove(account_id);
                let node = AuthNode::new(
                    account_id,
                    char_id,
                    0,
                    0,
                    0,
                    HandoffState::PendingLogout,
                    None,
                );
                let _ = self.auth.begin(node);
                self.metrics.inc_handoffs_begun();
                if self.link.is_ready() {
                    let _ = self
                        .link
                        .send(&wire::encode_save_req(account_id, char_id, true, &[]));
                }
            } else if let Some(n) = self.auth.find(account_id) {
                // Login still in flight; abandon it with the socket.
                if n.session == Some(sid) && n.state == HandoffState::PendingLogin {
                    self.auth.remove(account_id);
                }
            }
        }
        self.metrics.inc_sessions_closed();
        info!(session = %sid, reason = ?session.close_reason, "session closed");
    }

    // ---- broadcast surface -------------------------------------------------

    /// Fan a payload out to every session the scope resolves to. Returns
    /// how many sessions the message was queued for.
    ///
    /// Recipients whose version has no descriptor for the payload's opcode
    /// are skipped for this one message.
    pub fn deliver(
        &mut self,
        scope: DeliveryScope,
        payload: &dyn Payload,
        source: EntityId,
        opts: BroadcastOptions,
    ) -> usize {
        let params = AreaParams {
            radius: self.cfg.world.area_radius,
            chat_shrink: self.cfg.world.chat_shrink,
        };
        let sids: Vec<SessionId> =
            match broadcast::resolve(scope, source, self.world.as_ref(), params, opts) {
                Recipients::AllSessions => {
                    let mut v: Vec<SessionId> = self
                        .sessions
                        .values()
                        .filter(|s| s.is_authed())
                        .map(Session::id)
                        .collect();
                    if let Some(m) = &self.detached {
                        if m.active {
                            v.push(m.id);
                        }
                    }
                    v
                }
                Recipients::Entities(entities) => entities
                    .iter()
                    .filter_map(|e| self.by_entity.get(e).copied())
                    .collect(),
            };

        let mut enc = VersionedEncoder::new(payload);
        let mut delivered = 0;
        for sid in sids {
            let version = match self.sessions.get(&sid) {
                Some(s) if s.is_closing() => continue,
                Some(s) => s.version,
                None => match &self.detached {
                    Some(m) if m.id == sid => m.version,
                    _ => continue,
                },
            };
            let Some(version) = version else { continue };
            let Some(bytes) = enc.encoded_for(&self.registry, version) else {
                continue;
            };
            match self.sessions.get_mut(&sid) {
                Some(s) => s.queue_send(&bytes),
                None => self.pending_sends.push((sid, bytes)),
            }
            delivered += 1;
        }
        self.metrics.inc_broadcasts();
        self.metrics.add_broadcast_frames(delivered as u64);
        delivered
    }

    // ---- handoff surface ---------------------------------------------------

    /// Start the backend authentication round-trip for a session.
    ///
    /// The built-in handshake handler funnels through the same path; this
    /// entry point is for lifecycle callers holding out-of-band credentials.
    /// A failure marks the session for close with the matching reject
    /// reason in addition to the returned error.
    pub fn authenticate(&mut self, sid: SessionId, creds: LoginCredentials) -> Result<()> {
        let mut session = self
            .sessions
            .remove(&sid)
            .ok_or(ProtocolError::ConnectionClosed)?;
        let out = self.start_login(&mut session, creds);
        self.sessions.insert(sid, session);
        out
    }

    fn start_login(&mut self, session: &mut Session, creds: LoginCredentials) -> Result<()> {
        if session.phase != SessionPhase::Connected {
            warn!(session = %session.id(), "handshake repeated mid-session");
            session.mark_closing(None);
            return Err(ProtocolError::MalformedFrame("handshake repeated"));
        }
        if let Some(&other) = self.by_account.get(&creds.account_id) {
            warn!(
                session = %session.id(),
                existing = %other,
                account_id = creds.account_id,
                "duplicate login"
            );
            session.mark_closing(Some(RejectReason::DuplicateLogin));
            return Err(ProtocolError::HandoffPending(creds.account_id));
        }

        let token2: u32 = random();
        let node = AuthNode::new(
            creds.account_id,
            creds.char_id,
            creds.token1,
            token2,
            creds.sex,
            HandoffState::PendingLogin,
            Some(session.id()),
        );
        if let Err(e) = self.auth.begin(node) {
            warn!(
                session = %session.id(),
                account_id = creds.account_id,
                error = %e,
                "handoff already pending"
            );
            session.mark_closing(Some(RejectReason::AuthFailed));
            return Err(e);
        }
        if let Err(e) = self.link.send(&wire::encode_auth_req(
            creds.account_id,
            creds.char_id,
            creds.token1,
            token2,
            creds.sex,
            session.client_ip,
        )) {
            // Never silently drop an auth attempt: undo the node and tell
            // the client the server is unavailable.
            self.auth.remove(creds.account_id);
            warn!(session = %session.id(), error = %e, "cannot authenticate, backend down");
            session.mark_closing(Some(RejectReason::ServerClosed));
            return Err(e);
        }

        session.phase = SessionPhase::AuthPending;
        session.account_id = Some(creds.account_id);
        session.char_id = Some(creds.char_id);
        // Legacy clients expect their account id echoed raw, before any frame.
        session.queue_send(&creds.account_id.to_le_bytes());
        self.metrics.inc_handoffs_begun();
        Ok(())
    }

    /// Open a handoff record on behalf of a session lifecycle caller.
    ///
    /// Logins and map changes carry extra inputs and start through
    /// [`Engine::authenticate`] and [`Engine::request_map_change`]; all
    /// three paths land in the same store. A logout handoff detaches the
    /// account's live session, and teardown puts the final save in flight.
    pub fn begin_handoff(&mut self, account_id: u32, state: HandoffState) -> Result<()> {
        if state != HandoffState::PendingLogout {
            return Err(ProtocolError::Custom(format!(
                "{state:?} handoffs need credentials or a route"
            )));
        }
        let sid = *self
            .by_account
            .get(&account_id)
            .ok_or(ProtocolError::NoSuchSession(account_id))?;
        let session = self
            .sessions
            .get_mut(&sid)
            .ok_or(ProtocolError::ConnectionClosed)?;
        if !session.is_authed() {
            return Err(ProtocolError::HandoffMismatch(account_id));
        }
        session.mark_closing(None);
        Ok(())
    }

    /// Hand the session off to the server responsible for `map`. The route
    /// answer arrives asynchronously as a backend message.
    pub fn request_map_change(
        &mut self,
        sid: SessionId,
        map: MapId,
        map_name: &str,
        x: i16,
        y: i16,
    ) -> Result<()> {
        self.link.require_ready()?;
        let (account_id, char_id) = {
            let s = self
                .sessions
                .get(&sid)
                .ok_or(ProtocolError::ConnectionClosed)?;
            match (s.account_id, s.char_id) {
                (Some(a), Some(c)) if s.is_authed() => (a, c),
                _ => return Err(ProtocolError::NotAuthenticated(opcodes::ROUTE_TO_SERVER)),
            }
        };
        let (ip, port) = self
            .link
            .routes()
            .lookup(map)
            .ok_or_else(|| ProtocolError::Custom(format!("no server owns map {map}")))?;

        let token1: u32 = random();
        let token2: u32 = random();
        self.auth.begin(AuthNode::new(
            account_id,
            char_id,
            token1,
            token2,
            0,
            HandoffState::PendingMapChange,
            Some(sid),
        ))?;
        self.route_plans.insert(
            account_id,
            RoutePlan {
                map: map_name.to_owned(),
                x,
                y,
                ip,
                port,
            },
        );
        self.link.send(&wire::encode_route_req(
            account_id, char_id, token1, token2, map_name, x, y, ip, port,
        ))?;
        self.metrics.inc_handoffs_begun();
        Ok(())
    }

    /// Periodic staleness sweep over the auth-node store.
    pub fn sweep(&mut self, now: Instant) {
        let outcome = self.auth.sweep(now, self.cfg.handoff.stale_after);
        for (account_id, char_id) in outcome.retry {
            if self.link.is_ready() {
                let _ = self
                    .link
                    .send(&wire::encode_save_req(account_id, char_id, true, &[]));
            }
        }
        for node in outcome.evicted {
            self.route_plans.remove(&node.account_id);
            if self.link.is_ready() {
                let _ = self
                    .link
                    .send(&wire::encode_char_offline(node.account_id, node.char_id));
            }
            self.metrics.inc_handoffs_evicted();
            if let Some(sid) = node.session {
                if let Some(s) = self.sessions.get_mut(&sid) {
                    let reason = match node.state {
                        HandoffState::PendingLogin => RejectReason::AuthFailed,
                        _ => RejectReason::ServerClosed,
                    };
                    s.mark_closing(Some(reason));
                }
            }
        }
    }

    // ---- backend link ------------------------------------------------------

    /// The transport opened a fresh socket to the backend.
    pub fn backend_socket_opened(&mut self) {
        let ip = self.cfg.backend.public_ip_u32().unwrap_or(0x7f00_0001);
        let port = self.cfg.backend.public_port;
        let user = self.cfg.backend.user.clone();
        let password = self.cfg.backend.password.clone();
        self.link.socket_opened(&user, &password, ip, port);
    }

    pub fn backend_socket_closed(&mut self) {
        self.link.socket_closed();
    }

    /// Drain bytes owed to the backend socket.
    pub fn backend_outgoing(&mut self) -> Bytes {
        self.link.take_outgoing()
    }

    /// Bytes arrived from the backend socket. An error here is fatal to the
    /// link; the transport drops the socket and reconnects.
    pub fn on_backend_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.link.feed(bytes);
        while let Some(frame) = self.link.poll_frame()? {
            let msg = BackendMsg::decode(&frame)?;
            self.metrics.inc_backend_frames();
            if self.link.apply(&msg) {
                self.on_backend_ready();
            }
            self.apply_backend(msg);
        }
        Ok(())
    }

    /// The connect handshake completed: resynchronize the backend with
    /// everything it may have missed. Pending-login nodes are left alone;
    /// their clients either complete against the fresh link or age out.
    fn on_backend_ready(&mut self) {
        self.metrics.inc_backend_reconnects();
        let _ = self
            .link
            .send(&wire::encode_area_list(&self.cfg.world.maps));

        let users: Vec<(u32, u32)> = self
            .sessions
            .values()
            .filter(|s| s.is_authed())
            .filter_map(|s| Some((s.account_id?, s.char_id?)))
            .collect();
        let _ = self.link.send(&wire::encode_users(&users));

        let mut saves = Vec::new();
        let mut routes = Vec::new();
        for node in self.auth.nodes() {
            match node.state {
                HandoffState::PendingLogout => saves.push((node.account_id, node.char_id)),
                HandoffState::PendingMapChange => {
                    routes.push((node.account_id, node.char_id, node.token1, node.token2));
                }
                HandoffState::PendingLogin => {}
            }
        }
        for (account_id, char_id) in &saves {
            let _ = self
                .link
                .send(&wire::encode_save_req(*account_id, *char_id, true, &[]));
        }
        for (account_id, char_id, t1, t2) in &routes {
            if let Some(plan) = self.route_plans.get(account_id).cloned() {
                let _ = self.link.send(&wire::encode_route_req(
                    *account_id,
                    *char_id,
                    *t1,
                    *t2,
                    &plan.map,
                    plan.x,
                    plan.y,
                    plan.ip,
                    plan.port,
                ));
            }
        }
        info!(
            sessions = users.len(),
            resaves = saves.len(),
            reroutes = routes.len(),
            "backend link ready, state resynchronized"
        );
    }

    /// Engine-level effects of one backend message. Messages inconsistent
    /// with the matching auth node's state are no-ops.
    fn apply_backend(&mut self, msg: BackendMsg) {
        match msg {
            BackendMsg::AuthAck {
                account_id,
                char_id,
                token1,
                token2,
            } => self.finish_login(account_id, char_id, token1, token2),
            BackendMsg::AuthFail {
                account_id,
                char_id,
                reason,
            } => {
                if let Some(node) =
                    self.auth.complete(account_id, char_id, HandoffState::PendingLogin)
                {
                    info!(account_id, reason, "backend refused authentication");
                    if let Some(s) = node.session.and_then(|sid| self.sessions.get_mut(&sid)) {
                        s.mark_closing(Some(RejectReason::AuthFailed));
                    }
                }
            }
            BackendMsg::SaveAck {
                account_id,
                char_id,
            } => {
                if let Some(node) =
                    self.auth.complete(account_id, char_id, HandoffState::PendingLogout)
                {
                    let _ = self
                        .link
                        .send(&wire::encode_char_offline(account_id, char_id));
                    self.metrics.inc_handoffs_completed();
                    if let Some(s) = node.session.and_then(|sid| self.sessions.get_mut(&sid)) {
                        s.mark_closing(None);
                    }
                    debug!(account_id, "logout save confirmed");
                }
            }
            BackendMsg::RouteAck {
                account_id,
                char_id,
                token1,
                map,
                x,
                y,
                ip,
                port,
                ..
            } => self.finish_map_change(account_id, char_id, token1, &map, x, y, ip, port),
            // Link-level only; already applied.
            BackendMsg::ConnectAck { .. }
            | BackendMsg::AreaListAck { .. }
            | BackendMsg::PingAck
            | BackendMsg::MapAnnounce { .. }
            | BackendMsg::MapRetract { .. } => {}
        }
    }

    fn finish_login(&mut self, account_id: u32, char_id: u32, token1: u32, token2: u32) {
        let tokens_match = self
            .auth
            .check(account_id, char_id, HandoffState::PendingLogin)
            .is_some_and(|n| n.token1 == token1 && n.token2 == token2);
        if !tokens_match {
            debug!(account_id, "auth ack matched no pending login");
            return;
        }
        let Some(node) = self
            .auth
            .complete(account_id, char_id, HandoffState::PendingLogin)
        else {
            return;
        };
        self.metrics.inc_handoffs_completed();

        let live = node
            .session
            .filter(|sid| self.sessions.contains_key(sid));
        let Some(sid) = live else {
            // Client gave up while the round-trip was in flight.
            let _ = self
                .link
                .send(&wire::encode_char_offline(account_id, char_id));
            return;
        };

        let entity: EntityId = char_id;
        let pos = self.world.position(entity);
        let tick = self.uptime_ticks();
        if let Some(s) = self.sessions.get_mut(&sid) {
            s.phase = SessionPhase::Active;
            s.entity = Some(entity);
            s.queue_send(&auth_ok_frame(tick, pos.map(|p| (p.x, p.y))));
        }
        self.by_entity.insert(entity, sid);
        self.by_account.insert(account_id, sid);
        let _ = self
            .link
            .send(&wire::encode_char_online(account_id, char_id));
        info!(session = %sid, account_id, char_id, "session authenticated");
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_map_change(
        &mut self,
        account_id: u32,
        char_id: u32,
        token1: u32,
        map: &str,
        x: i16,
        y: i16,
        ip: u32,
        port: u16,
    ) {
        let Some(node) =
            self.auth
                .complete(account_id, char_id, HandoffState::PendingMapChange)
        else {
            debug!(account_id, "route ack matched no pending map change");
            return;
        };
        self.route_plans.remove(&account_id);
        let Some(sid) = node.session else { return };

        if token1 == 0 {
            warn!(account_id, "backend refused the map-change route");
            if let Some(s) = self.sessions.get_mut(&sid) {
                s.mark_closing(Some(RejectReason::RouteFailed));
            }
            return;
        }

        let mut w = ByteWriter::with_len(28);
        w.put_u16(0, opcodes::ROUTE_TO_SERVER);
        w.put_str(2, wire::MAP_NAME_LEN, map);
        w.put_i16(18, x);
        w.put_i16(20, y);
        w.put_net_u32(22, ip);
        w.put_net_u16(26, port);
        let redirect = w.finish();

        if let Some(s) = self.sessions.get_mut(&sid) {
            s.queue_send(&redirect);
            // The destination server owns this identity now: detach it
            // before teardown so no logout save is issued here.
            s.entity = None;
            s.account_id = None;
            s.char_id = None;
            s.mark_closing(None);
        }
        self.by_entity.remove(&char_id);
        self.by_account.remove(&account_id);
        self.metrics.inc_handoffs_completed();
        info!(session = %sid, account_id, map, "session routed to peer server");
    }
}

fn handshake_fields_valid(frame: &Frame, d: &Descriptor) -> bool {
    let last = d.fields.len().saturating_sub(1);
    let (Ok(account_id), Ok(char_id), Ok(sex)) = (
        frame.field_u32(d, 0),
        frame.field_u32(d, 1),
        frame.field_u8(d, last),
    ) else {
        return false;
    };
    (ACCOUNT_ID_MIN..=ACCOUNT_ID_MAX).contains(&account_id) && char_id > 0 && sex <= 1
}

fn reject_frame(reason: RejectReason) -> Vec<u8> {
    let mut w = ByteWriter::with_len(6);
    w.put_u16(0, opcodes::REJECT);
    w.put_u8(2, reason.code());
    w.finish()
}

fn auth_ok_frame(tick: u32, pos: Option<(i16, i16)>) -> Vec<u8> {
    let (x, y) = pos.unwrap_or((0, 0));
    let packed = pack_position(x, y, 0);
    let mut w = ByteWriter::with_len(11);
    w.put_u16(0, opcodes::AUTH_OK);
    w.put_u32(2, tick);
    w.put_u8(6, packed[0]);
    w.put_u8(7, packed[1]);
    w.put_u8(8, packed[2]);
    w.put_u8(9, 5);
    w.put_u8(10, 5);
    w.finish()
}

/// 10-bit x, 10-bit y and a 4-bit facing packed into three bytes, the
/// layout legacy clients expect in spawn frames.
fn pack_position(x: i16, y: i16, dir: u8) -> [u8; 3] {
    let x = (x as u16) & 0x3ff;
    let y = (y as u16) & 0x3ff;
    [
        (x >> 2) as u8,
        (((x & 0x3) as u8) << 6) | (y >> 4) as u8,
        (((y & 0xf) as u8) << 4) | (dir & 0xf),
    ]
}

// ---- built-in handlers -----------------------------------------------------

/// The handler set matching [`Registry::builtin_client`].
#[must_use]
pub fn builtin_handlers() -> HandlerMap {
    let mut map = HandlerMap::new();
    map.register_pre_auth("enter", handle_enter);
    map.register_pre_auth("server_version", handle_server_version);
    map.register_pre_auth("force_close", handle_force_close);
    map.register("load_end", handle_load_end);
    map.register("client_tick", handle_client_tick);
    map.register("chat", handle_chat);
    map.register("quit", handle_quit);
    map
}

fn handle_enter(
    engine: &mut Engine,
    session: &mut Session,
    frame: &Frame,
    d: &Descriptor,
) -> Result<()> {
    let creds = LoginCredentials {
        account_id: frame.field_u32(d, 0)?,
        char_id: frame.field_u32(d, 1)?,
        token1: frame.field_u32(d, 2)?,
        sex: frame.field_u8(d, d.fields.len().saturating_sub(1))?,
    };
    // A failed start already marked the session closing with its reject
    // reason; the frame itself was well-formed.
    let _ = engine.start_login(session, creds);
    Ok(())
}

fn handle_load_end(
    engine: &mut Engine,
    session: &mut Session,
    _frame: &Frame,
    _d: &Descriptor,
) -> Result<()> {
    let Some(entity) = session.entity else {
        return Err(ProtocolError::NotAuthenticated(opcodes::LOAD_END_ACK));
    };
    debug!(session = %session.id(), entity, "client finished loading");
    // Announce the arrival to everyone already in range.
    let mut w = ByteWriter::with_len(7);
    w.put_u16(0, opcodes::ACTION);
    w.put_u32(2, entity);
    w.put_u8(6, 0);
    let payload = RawPayload::new(opcodes::ACTION, w.finish());
    engine.deliver(
        DeliveryScope::AreaWithoutSource,
        &payload,
        entity,
        BroadcastOptions::default(),
    );
    Ok(())
}

fn handle_client_tick(
    engine: &mut Engine,
    session: &mut Session,
    _frame: &Frame,
    _d: &Descriptor,
) -> Result<()> {
    let mut w = ByteWriter::with_len(6);
    w.put_u16(0, opcodes::SERVER_TICK);
    w.put_u32(2, engine.uptime_ticks());
    session.queue_send(&w.finish());
    Ok(())
}

fn handle_chat(
    engine: &mut Engine,
    session: &mut Session,
    frame: &Frame,
    d: &Descriptor,
) -> Result<()> {
    let text_off = d.fields.first().copied().unwrap_or(4) as usize;
    if frame.len() <= text_off {
        return Err(ProtocolError::MalformedFrame("empty chat payload"));
    }
    let Some(entity) = session.entity else {
        return Err(ProtocolError::NotAuthenticated(frame.opcode()));
    };
    // Re-broadcast the frame as-is to everyone in range, speaker included.
    let payload = RawPayload::new(frame.opcode(), frame.bytes().to_vec());
    engine.deliver(
        DeliveryScope::Area,
        &payload,
        entity,
        BroadcastOptions::default(),
    );
    Ok(())
}

fn handle_quit(
    _engine: &mut Engine,
    session: &mut Session,
    _frame: &Frame,
    _d: &Descriptor,
) -> Result<()> {
    let mut w = ByteWriter::with_len(4);
    w.put_u16(0, opcodes::QUIT_ACK);
    w.put_u16(2, 0);
    session.queue_send(&w.finish());
    // Teardown runs the logout handoff.
    session.mark_closing(None);
    Ok(())
}

fn handle_server_version(
    _engine: &mut Engine,
    session: &mut Session,
    _frame: &Frame,
    _d: &Descriptor,
) -> Result<()> {
    let major: u8 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor: u8 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    let patch: u32 = env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0);
    let mut w = ByteWriter::with_len(10);
    w.put_u16(0, opcodes::ADMIN_VERSION_ACK);
    w.put_u8(2, major);
    w.put_u8(3, minor);
    w.put_u32(4, patch);
    session.queue_send(&w.finish());
    Ok(())
}

fn handle_force_close(
    _engine: &mut Engine,
    session: &mut Session,
    _frame: &Frame,
    _d: &Descriptor,
) -> Result<()> {
    session.mark_closing(Some(RejectReason::ServerClosed));
    Ok(())
}
