//! # Sessions
//!
//! One live client connection: socket-side buffers, negotiated protocol
//! version, and lifecycle phase.
//!
//! Sessions are owned exclusively by the dispatch engine. The game-entity
//! reference is a non-owning back-reference set only after authentication;
//! the session's auth node is referenced by account id only, never by
//! pointer, so the two sides can be torn down independently.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::broadcast::EntityId;
use crate::codec::framing::ConnBuffer;
use crate::error::RejectReason;

/// Opaque session handle, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Socket open, no handshake seen; only the handshake opcode (and
    /// explicitly exempt opcodes) are legal.
    Connected,
    /// Handshake accepted, backend authentication round-trip in flight.
    AuthPending,
    /// Fully authenticated; gameplay opcodes flow.
    Active,
    /// Marked for teardown; no further frames are dispatched. The actual
    /// removal happens after the current frame fully returns.
    Closing,
}

/// One live client connection.
pub struct Session {
    id: SessionId,
    /// Client address as a raw IPv4, forwarded to the backend during auth.
    pub client_ip: u32,
    /// Negotiated protocol version; `None` until the handshake is sniffed.
    pub version: Option<u16>,
    pub phase: SessionPhase,
    pub account_id: Option<u32>,
    pub char_id: Option<u32>,
    /// Owning game entity; set only after authentication completes.
    pub entity: Option<EntityId>,
    pub buf: ConnBuffer,
    pub last_activity: Instant,
    /// Why the session is closing, if a rejection frame was owed.
    pub close_reason: Option<RejectReason>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId, client_ip: u32) -> Self {
        Self {
            id,
            client_ip,
            version: None,
            phase: SessionPhase::Connected,
            account_id: None,
            char_id: None,
            entity: None,
            buf: ConnBuffer::new(),
            last_activity: Instant::now(),
            close_reason: None,
            writer: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Attach the transport's write half. Tests leave it unattached and
    /// inspect the buffered bytes instead.
    pub fn attach_writer(&mut self, tx: mpsc::UnboundedSender<Bytes>) {
        self.writer = Some(tx);
    }

    #[must_use]
    pub fn is_authed(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.phase == SessionPhase::Closing
    }

    /// Queue a teardown. Takes effect after the current frame returns;
    /// later frames from this connection in the same tick are not
    /// dispatched. The first reason sticks.
    pub fn mark_closing(&mut self, reason: Option<RejectReason>) {
        if self.phase != SessionPhase::Closing {
            self.phase = SessionPhase::Closing;
            self.close_reason = reason;
        }
    }

    pub fn queue_send(&mut self, bytes: &[u8]) {
        self.buf.queue_send(bytes);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Push batched output to the transport. A dead writer is treated like
    /// a closed socket by the engine's next reap, not an error here.
    pub fn flush(&mut self) {
        if self.buf.pending_out() == 0 {
            return;
        }
        let out = self.buf.take_outgoing();
        if let Some(tx) = &self.writer {
            let _ = tx.send(out);
        } else {
            // No transport attached (tests): leave the drained bytes
            // retrievable through take_outgoing by re-queueing.
            self.buf.queue_send(&out);
        }
    }

    /// Drain whatever is queued without a transport; test helper.
    pub fn take_outgoing(&mut self) -> Bytes {
        self.buf.take_outgoing()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("phase", &self.phase)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}
