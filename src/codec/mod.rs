//! # Wire Codec
//!
//! Low-level frame handling for the client protocol and the backend link.
//!
//! This module provides the foundation the dispatch loop is built on:
//! bounds-checked field access, versioned opcode descriptor tables, and
//! per-connection frame reassembly.
//!
//! ## Components
//! - **Cursor**: checked little-endian reads/writes at explicit offsets
//! - **Registry**: immutable (version, opcode) → descriptor tables
//! - **Framing**: length-aware accumulation and send batching
//!
//! ## Wire Format
//! ```text
//! [Opcode(2, LE)] [TotalLen(2, LE, variable-length opcodes only)] [Fields...]
//! ```
//!
//! Embedded IPv4 addresses and ports are the one exception to little-endian:
//! they travel in network order.

pub mod cursor;
pub mod framing;
pub mod registry;

pub use cursor::{ByteReader, ByteWriter};
pub use framing::{ConnBuffer, Frame, MAX_VARIABLE_FRAME, MIN_VARIABLE_FRAME};
pub use registry::{Descriptor, FrameLen, Registry, RegistryBuilder, VersionTable};
