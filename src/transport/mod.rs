//! # Transport
//!
//! Async socket plumbing around the single-owner dispatch engine: the
//! client accept loop and per-connection tasks, and the backend socket
//! task with its fixed-interval reconnect.

pub mod backend;
pub mod server;

pub use server::{start_server, start_server_with_shutdown};
