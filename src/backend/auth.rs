//! # Auth Node Store
//!
//! In-flight session-handoff records exchanged with the backend process.
//!
//! A node exists while a session's identity is in transit: logging in,
//! logging out (final save pending), or changing to a map another server
//! owns. "Waiting" for the backend is a node persisting across scheduler
//! ticks, never a blocked call stack.
//!
//! At most one node may exist per account id at a time; [`AuthStore::begin`]
//! enforces that. The node's state tag determines which backend messages are
//! legal to process for the account; a mismatched message is a no-op, not a
//! crash, which is what [`AuthStore::check`] is for.
//!
//! Sessions hold only the account id of their node, never a pointer; the
//! store owns the node outright and hands it back on removal so the caller
//! can clear the session's side of the linkage.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::info;

use crate::dispatch::session::SessionId;
use crate::error::{ProtocolError, Result};

/// Which lifecycle transition a node is coordinating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    /// Backend authentication round-trip in flight.
    PendingLogin,
    /// Final save in flight; the session may already be gone.
    PendingLogout,
    /// Map-change route request in flight.
    PendingMapChange,
}

impl HandoffState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingLogin => "login",
            Self::PendingLogout => "logout",
            Self::PendingMapChange => "map-change",
        }
    }
}

/// One handoff record, keyed by account id in the store.
#[derive(Debug, Clone)]
pub struct AuthNode {
    pub account_id: u32,
    pub char_id: u32,
    /// Login-correlation tokens; the backend echoes them and both sides
    /// verify.
    pub token1: u32,
    pub token2: u32,
    pub sex: u8,
    pub state: HandoffState,
    /// Owning session, if it still exists. Nullable: a logout node outlives
    /// its socket and must still complete the backend round-trip.
    pub session: Option<SessionId>,
    created: Instant,
}

impl AuthNode {
    #[must_use]
    pub fn new(
        account_id: u32,
        char_id: u32,
        token1: u32,
        token2: u32,
        sex: u8,
        state: HandoffState,
        session: Option<SessionId>,
    ) -> Self {
        Self {
            account_id,
            char_id,
            token1,
            token2,
            sex,
            state,
            session,
            created: Instant::now(),
        }
    }

    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }

    /// Reset the staleness clock; used when a logout save is retried.
    pub fn refresh(&mut self, now: Instant) {
        self.created = now;
    }

    #[cfg(test)]
    pub fn backdate(&mut self, by: Duration) {
        self.created -= by;
    }
}

/// What a sweep decided for the stale nodes it found.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Pending-logout nodes whose final save must be re-issued. Their
    /// staleness clocks have already been refreshed.
    pub retry: Vec<(u32, u32)>,
    /// Abandoned nodes, removed from the store. The owning entity must be
    /// forced to an offline-equivalent status.
    pub evicted: Vec<AuthNode>,
}

/// Map keyed by account identity holding in-flight handoff records.
#[derive(Debug, Default)]
pub struct AuthStore {
    nodes: HashMap<u32, AuthNode>,
}

impl AuthStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handoff. Fails if one is already pending for the account,
    /// preventing duplicate concurrent handoffs.
    pub fn begin(&mut self, node: AuthNode) -> Result<()> {
        if self.nodes.contains_key(&node.account_id) {
            return Err(ProtocolError::HandoffPending(node.account_id));
        }
        self.nodes.insert(node.account_id, node);
        Ok(())
    }

    #[must_use]
    pub fn find(&self, account_id: u32) -> Option<&AuthNode> {
        self.nodes.get(&account_id)
    }

    pub fn find_mut(&mut self, account_id: u32) -> Option<&mut AuthNode> {
        self.nodes.get_mut(&account_id)
    }

    /// Node for the account only if account, character and state all match.
    /// Guards against acting on stale or mismatched handoff data.
    #[must_use]
    pub fn check(&self, account_id: u32, char_id: u32, state: HandoffState) -> Option<&AuthNode> {
        self.nodes
            .get(&account_id)
            .filter(|n| n.char_id == char_id && n.state == state)
    }

    /// Atomically validate-and-remove. Returns the removed node so the
    /// caller can clear the owning session's back-reference; `None` means
    /// the triple did not match and nothing was removed.
    pub fn complete(
        &mut self,
        account_id: u32,
        char_id: u32,
        state: HandoffState,
    ) -> Option<AuthNode> {
        if self.check(account_id, char_id, state).is_some() {
            self.nodes.remove(&account_id)
        } else {
            None
        }
    }

    /// Unconditional removal, used when the session itself is torn down.
    pub fn remove(&mut self, account_id: u32) -> Option<AuthNode> {
        self.nodes.remove(&account_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &AuthNode> {
        self.nodes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolve or evict every node older than `stale_after`.
    ///
    /// Losing a logout save is a correctness issue, so pending-logout nodes
    /// are retried with a refreshed clock, never evicted. Every other state
    /// means the client timed out waiting; those nodes are removed and
    /// reported for offline cleanup. The state tag alone distinguishes
    /// "recoverable, must retry" from "abandoned, must clean up".
    pub fn sweep(&mut self, now: Instant, stale_after: Duration) -> SweepOutcome {
        let mut out = SweepOutcome::default();
        let stale: Vec<u32> = self
            .nodes
            .values()
            .filter(|n| n.age(now) > stale_after)
            .map(|n| n.account_id)
            .collect();

        for account_id in stale {
            let Some(node) = self.nodes.get_mut(&account_id) else {
                continue;
            };
            match node.state {
                HandoffState::PendingLogout => {
                    // Refresh first so a struggling backend is not flooded.
                    node.refresh(now);
                    out.retry.push((node.account_id, node.char_id));
                }
                _ => {
                    info!(
                        account_id = node.account_id,
                        char_id = node.char_id,
                        state = node.state.as_str(),
                        "handoff node timed out"
                    );
                    if let Some(node) = self.nodes.remove(&account_id) {
                        out.evicted.push(node);
                    }
                }
            }
        }
        out
    }
}
