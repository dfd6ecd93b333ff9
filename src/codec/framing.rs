//! # Connection Buffer
//!
//! Per-socket input/output byte accumulation and frame extraction.
//!
//! Input bytes pile up in the receive buffer until a complete frame is
//! available under the descriptor table's length rule; outgoing bytes are
//! batched and drained once per scheduling tick.
//!
//! [`ConnBuffer::peek_frame`] is idempotent: it never consumes. The dispatch
//! loop consumes with an explicit [`ConnBuffer::consume`] *after* the handler
//! returns and only after re-checking that the session is still live, so a
//! handler that tears its own connection down mid-frame is never observable
//! as a fault.

use bytes::{Bytes, BytesMut};

use crate::codec::cursor::ByteReader;
use crate::codec::registry::{Descriptor, FrameLen, VersionTable};
use crate::error::{ProtocolError, Result};

/// Variable-length frames must declare a total length in this window.
/// Anything outside it is a protocol violation, fatal to the connection.
pub const MIN_VARIABLE_FRAME: usize = 4;
pub const MAX_VARIABLE_FRAME: usize = 32768;

/// One complete, length-delimited message, opcode header included.
#[derive(Debug, Clone)]
pub struct Frame {
    opcode: u16,
    bytes: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(opcode: u16, bytes: Bytes) -> Self {
        Self { opcode, bytes }
    }

    #[must_use]
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn reader(&self) -> ByteReader<'_> {
        ByteReader::new(&self.bytes)
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Declared field `idx` of the descriptor, read as u8.
    pub fn field_u8(&self, d: &Descriptor, idx: usize) -> Result<u8> {
        self.reader().u8_at(self.field_offset(d, idx)?)
    }

    /// Declared field `idx` of the descriptor, read as u16.
    pub fn field_u16(&self, d: &Descriptor, idx: usize) -> Result<u16> {
        self.reader().u16_at(self.field_offset(d, idx)?)
    }

    /// Declared field `idx` of the descriptor, read as u32.
    pub fn field_u32(&self, d: &Descriptor, idx: usize) -> Result<u32> {
        self.reader().u32_at(self.field_offset(d, idx)?)
    }

    fn field_offset(&self, d: &Descriptor, idx: usize) -> Result<usize> {
        d.fields
            .get(idx)
            .map(|&o| o as usize)
            .ok_or(ProtocolError::FieldOutOfBounds {
                offset: idx,
                width: 0,
                len: d.fields.len(),
            })
    }
}

/// Per-connection input/output cursor pair.
#[derive(Debug, Default)]
pub struct ConnBuffer {
    rx: BytesMut,
    tx: BytesMut,
}

impl ConnBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(rx: usize, tx: usize) -> Self {
        Self {
            rx: BytesMut::with_capacity(rx),
            tx: BytesMut::with_capacity(tx),
        }
    }

    /// Append received bytes to the input cursor.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend_from_slice(bytes);
    }

    /// Bytes currently buffered on the input side.
    #[must_use]
    pub fn pending_in(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn has_input(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Raw buffered input. Version sniffing must inspect the handshake
    /// bytes before any descriptor table has been chosen, so it cannot go
    /// through [`Self::peek_frame`].
    #[must_use]
    pub fn raw_input(&self) -> &[u8] {
        &self.rx
    }

    /// Extract the next complete frame under `table`'s length rules without
    /// consuming it. Returns `Ok(None)` while bytes are still missing.
    ///
    /// Errors are protocol violations: unknown opcode for this version, or a
    /// variable length outside the sane window. Callers disconnect on them.
    pub fn peek_frame(&self, table: &VersionTable) -> Result<Option<Frame>> {
        if self.rx.len() < 2 {
            return Ok(None);
        }
        let opcode = u16::from_le_bytes([self.rx[0], self.rx[1]]);
        let descriptor = table
            .descriptor(opcode)
            .ok_or(ProtocolError::UnknownOpcode {
                version: table.version(),
                opcode,
            })?;

        let frame_len = match descriptor.len {
            FrameLen::Fixed(n) => n as usize,
            FrameLen::Variable => {
                if self.rx.len() < 4 {
                    return Ok(None);
                }
                let declared = u16::from_le_bytes([self.rx[2], self.rx[3]]) as usize;
                if !(MIN_VARIABLE_FRAME..=MAX_VARIABLE_FRAME).contains(&declared) {
                    return Err(ProtocolError::OversizedFrame(declared));
                }
                declared
            }
        };

        if self.rx.len() < frame_len {
            return Ok(None);
        }
        Ok(Some(Frame::new(
            opcode,
            Bytes::copy_from_slice(&self.rx[..frame_len]),
        )))
    }

    /// Advance past a frame previously returned by [`Self::peek_frame`].
    pub fn consume(&mut self, len: usize) {
        let n = len.min(self.rx.len());
        let _ = self.rx.split_to(n);
    }

    /// Queue outgoing bytes; they sit until the next flush.
    pub fn queue_send(&mut self, bytes: &[u8]) {
        self.tx.extend_from_slice(bytes);
    }

    /// Bytes currently batched on the output side.
    #[must_use]
    pub fn pending_out(&self) -> usize {
        self.tx.len()
    }

    /// Drain everything queued for sending.
    pub fn take_outgoing(&mut self) -> Bytes {
        self.tx.split().freeze()
    }
}
