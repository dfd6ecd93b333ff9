//! # Backend Coordination
//!
//! Session identity coordination with the authoritative backend process.
//!
//! Two processes that do not share memory agree on who is logged in where
//! through a private wire protocol and a store of in-flight handoff
//! records. Reconnection with state resynchronization is the primary
//! resilience mechanism: when the link comes back, pending saves and route
//! requests are re-submitted rather than lost.
//!
//! ## Components
//! - **Wire**: the backend-link opcode space and typed messages
//! - **Auth**: the Auth Node Store and its timeout sweeper
//! - **Link**: the connect/keepalive/reconnect state machine

pub mod auth;
pub mod link;
pub mod wire;

pub use auth::{AuthNode, AuthStore, HandoffState, SweepOutcome};
pub use link::{BackendLink, LinkState, RouteTable};
pub use wire::BackendMsg;
