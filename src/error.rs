//! # Error Types
//!
//! Comprehensive error handling for the realm protocol core.
//!
//! This module defines all error variants that can occur while framing,
//! dispatching, addressing, and handing sessions off to the backend process.
//!
//! ## Error Categories
//! - **I/O Errors**: socket and file system failures
//! - **Frame Errors**: malformed frames, unknown opcodes, length violations
//! - **Handoff Errors**: duplicate or mismatched auth-node operations
//! - **Backend Errors**: operations attempted while the backend link is down
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! Protocol-level violations from a client are fatal to that one connection
//! only; transport-level errors are recovered locally (reconnect, re-buffer).

use std::io;
use thiserror::Error;

/// Primary error type for all protocol-core operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Field read out of bounds: offset {offset} + {width} exceeds frame of {len} bytes")]
    FieldOutOfBounds {
        offset: usize,
        width: usize,
        len: usize,
    },

    #[error("Unknown opcode 0x{opcode:04x} for protocol version {version}")]
    UnknownOpcode { version: u16, opcode: u16 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("Frame length {0} outside sane bounds")]
    OversizedFrame(usize),

    #[error("No protocol version matched the handshake frame")]
    VersionSniffFailed,

    #[error("Gameplay opcode 0x{0:04x} received before authentication completed")]
    NotAuthenticated(u16),

    #[error("A handoff for account {0} is already pending")]
    HandoffPending(u32),

    #[error("Handoff record mismatch for account {0}")]
    HandoffMismatch(u32),

    #[error("Backend link is not ready")]
    BackendUnavailable,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No session for entity {0}")]
    NoSuchSession(u32),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Reason byte carried by the single rejection frame a client receives
/// before its connection is closed.
///
/// The code goes out on the wire so client-side diagnostics can tell the
/// failure modes apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    /// Backend refused the authentication round-trip.
    AuthFailed = 0,
    /// Server is closing or refused the connection.
    ServerClosed = 1,
    /// Another session for the same account is already connected.
    DuplicateLogin = 2,
    /// A map-change route could not be obtained.
    RouteFailed = 3,
    /// The handshake payload matched no registered protocol version.
    VersionRejected = 8,
}

impl RejectReason {
    /// Wire code for the rejection frame.
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_codes_are_stable() {
        // These values go out on the wire; clients pattern-match on them.
        assert_eq!(RejectReason::AuthFailed.code(), 0);
        assert_eq!(RejectReason::ServerClosed.code(), 1);
        assert_eq!(RejectReason::DuplicateLogin.code(), 2);
        assert_eq!(RejectReason::RouteFailed.code(), 3);
        assert_eq!(RejectReason::VersionRejected.code(), 8);
    }

    #[test]
    fn errors_render_opcode_in_hex() {
        let err = ProtocolError::UnknownOpcode {
            version: 5,
            opcode: 0x0089,
        };
        assert!(err.to_string().contains("0x0089"));
    }
}
