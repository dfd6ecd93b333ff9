//! # Byte Cursor
//!
//! Bounds-checked field access over raw frame bytes.
//!
//! Every multi-byte integer on the client and backend wire is little-endian
//! unless the field is documented as network-order (embedded IPv4 addresses
//! and ports). All reads and writes take explicit byte offsets, mirroring
//! the descriptor tables' field-offset lists, and every access is checked
//! against the frame length.

use crate::error::{ProtocolError, Result};

/// Read-only cursor over one frame's bytes.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Total frame length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn slice(&self, offset: usize, width: usize) -> Result<&'a [u8]> {
        self.buf
            .get(offset..offset + width)
            .ok_or(ProtocolError::FieldOutOfBounds {
                offset,
                width,
                len: self.buf.len(),
            })
    }

    pub fn u8_at(&self, offset: usize) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        let b = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i16_at(&self, offset: usize) -> Result<i16> {
        let b = self.slice(offset, 2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i32_at(&self, offset: usize) -> Result<i32> {
        let b = self.slice(offset, 4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Network-order u32, used for embedded IPv4 addresses.
    pub fn net_u32_at(&self, offset: usize) -> Result<u32> {
        let b = self.slice(offset, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Network-order u16, used for embedded ports.
    pub fn net_u16_at(&self, offset: usize) -> Result<u16> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Fixed-width NUL-padded string field.
    pub fn str_at(&self, offset: usize, width: usize) -> Result<String> {
        let b = self.slice(offset, width)?;
        let end = b.iter().position(|&c| c == 0).unwrap_or(width);
        Ok(String::from_utf8_lossy(&b[..end]).into_owned())
    }

    pub fn bytes_at(&self, offset: usize, width: usize) -> Result<&'a [u8]> {
        self.slice(offset, width)
    }
}

/// Growable write cursor for building outgoing frames.
///
/// Writes beyond the current end zero-extend the buffer, so fields may be
/// laid down in any order the descriptor lists them.
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sized writer; fixed-length frames know their size up front.
    #[must_use]
    pub fn with_len(len: usize) -> Self {
        Self { buf: vec![0; len] }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&mut self, end: usize) {
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
    }

    pub fn put_u8(&mut self, offset: usize, v: u8) {
        self.ensure(offset + 1);
        self.buf[offset] = v;
    }

    pub fn put_u16(&mut self, offset: usize, v: u16) {
        self.ensure(offset + 2);
        self.buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, offset: usize, v: u32) {
        self.ensure(offset + 4);
        self.buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_i16(&mut self, offset: usize, v: i16) {
        self.ensure(offset + 2);
        self.buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, offset: usize, v: i32) {
        self.ensure(offset + 4);
        self.buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Network-order u32, used for embedded IPv4 addresses.
    pub fn put_net_u32(&mut self, offset: usize, v: u32) {
        self.ensure(offset + 4);
        self.buf[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Network-order u16, used for embedded ports.
    pub fn put_net_u16(&mut self, offset: usize, v: u16) {
        self.ensure(offset + 2);
        self.buf[offset..offset + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Fixed-width NUL-padded string field. Longer values are truncated.
    pub fn put_str(&mut self, offset: usize, width: usize, s: &str) {
        self.ensure(offset + width);
        let field = &mut self.buf[offset..offset + width];
        field.fill(0);
        let n = s.len().min(width);
        field[..n].copy_from_slice(&s.as_bytes()[..n]);
    }

    pub fn put_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.ensure(offset + bytes.len());
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Patch the variable-length field (u16 at offset 2) to the final frame
    /// length, then return the finished frame.
    #[must_use]
    pub fn finish_variable(mut self) -> Vec<u8> {
        let len = self.buf.len() as u16;
        self.put_u16(2, len);
        self.buf
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
