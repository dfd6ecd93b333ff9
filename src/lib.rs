//! # Realm Protocol
//!
//! Network core for a multiplayer realm server: a versioned binary opcode
//! protocol, a single-owner frame dispatch loop, precisely-targeted
//! broadcast fan-out, and session handoff against an authoritative backend
//! process over a private wire protocol.
//!
//! ## Architecture
//!
//! The protocol state machines are sans-IO: [`dispatch::Engine`] owns every
//! session, the auth-node store, and the backend link, and is driven by
//! explicit `feed`/`tick` calls, so the whole core is testable without a
//! socket in sight. The [`transport`] module wraps it in tokio tasks: an
//! accept loop, per-connection reader/writer tasks, and a fixed scheduling
//! tick.
//!
//! ## Components
//! - [`codec`]: per-version opcode descriptor tables, bounds-checked byte
//!   cursors, and length-aware frame extraction
//! - [`dispatch`]: sessions, opcode handlers, and the dispatch engine
//! - [`broadcast`]: delivery-scope resolution and per-version payload
//!   serialization
//! - [`backend`]: the backend-link wire protocol, handoff records, and the
//!   link state machine
//! - [`transport`]: tokio plumbing around the engine
//! - [`config`]: TOML/env configuration with validation
//! - [`utils`]: observability counters
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use realm_protocol::broadcast::{EntityId, MapId, Position, WorldIndex};
//! use realm_protocol::config::NetworkConfig;
//! use realm_protocol::transport::start_server;
//!
//! struct EmptyWorld;
//!
//! impl WorldIndex for EmptyWorld {
//!     fn position(&self, _: EntityId) -> Option<Position> { None }
//!     fn entities_in_rect(&self, _: MapId, _: i16, _: i16, _: i16, _: i16) -> Vec<EntityId> {
//!         Vec::new()
//!     }
//!     fn party_of(&self, _: EntityId) -> Option<u32> { None }
//!     fn guild_of(&self, _: EntityId) -> Option<u32> { None }
//!     fn team_of(&self, _: EntityId) -> Option<u32> { None }
//!     fn chat_of(&self, _: EntityId) -> Option<u32> { None }
//!     fn party_members(&self, _: u32) -> Vec<EntityId> { Vec::new() }
//!     fn guild_members(&self, _: u32) -> Vec<EntityId> { Vec::new() }
//!     fn team_members(&self, _: u32) -> Vec<EntityId> { Vec::new() }
//!     fn chat_members(&self, _: u32) -> Vec<EntityId> { Vec::new() }
//! }
//!
//! #[tokio::main]
//! async fn main() -> realm_protocol::Result<()> {
//!     let cfg = NetworkConfig::default();
//!     start_server(cfg, Arc::new(EmptyWorld)).await
//! }
//! ```

pub mod backend;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use dispatch::{Engine, Session, SessionId, SessionPhase};
pub use error::{ProtocolError, RejectReason, Result};
