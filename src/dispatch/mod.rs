//! # Frame Dispatch
//!
//! The session table, the opcode-handler map, and the engine that drives
//! both once per scheduling tick.
//!
//! - [`session`]: one live client connection and its lifecycle phases
//! - [`handler`]: opcode handlers keyed by descriptor handler name
//! - [`engine`]: the single-owner dispatch loop, broadcast surface, and
//!   backend-handoff coordination

pub mod engine;
pub mod handler;
pub mod session;

pub use engine::{builtin_handlers, Engine, LoginCredentials};
pub use handler::{HandlerMap, PacketHandler};
pub use session::{Session, SessionId, SessionPhase};
