//! NDR stream writer
//!
//! Encodes values into a single octet stream with natural alignment
//! (1/2/4/8 relative to the start of the stream). Pointer bodies are not
//! written inline: `write_ptr`/`write_unique_ptr` emit only the 4-byte
//! referent id and queue the body, and queued bodies are flushed in
//! first-encounter order after the fixed-size fields of the enclosing
//! construction. Referents marshaled under the same `RefKey` share one
//! referent id and one body.
//!
//! Output is always little-endian; the data representation label on the
//! enclosing PDU advertises this to the peer.

use std::collections::{HashMap, VecDeque};

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{NdrError, Result};

/// Identity key for a marshaled referent. Callers derive it from the
/// address or logical identity of the value; equal keys alias on the wire.
pub type RefKey = u64;

/// Referent ids start here and advance by 4, matching the id space
/// commonly observed on the wire.
const FIRST_REFERENT_ID: u32 = 0x0002_0000;

type DeferredWrite = Box<dyn FnOnce(&mut NdrWriter) -> Result<()>>;

/// Stateful NDR encoder
pub struct NdrWriter {
    buf: BytesMut,
    referents: HashMap<RefKey, u32>,
    next_referent: u32,
    deferred: VecDeque<DeferredWrite>,
}

impl NdrWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            referents: HashMap::new(),
            next_referent: FIRST_REFERENT_ID,
            deferred: VecDeque::new(),
        }
    }

    /// Current offset from the start of the stream
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Pad with zero bytes up to the given alignment boundary
    pub fn align(&mut self, boundary: usize) {
        let rem = self.buf.len() % boundary;
        if rem != 0 {
            self.buf.put_bytes(0, boundary - rem);
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.align(2);
        self.buf.put_u16_le(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.align(2);
        self.buf.put_i16_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.align(4);
        self.buf.put_u32_le(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.align(4);
        self.buf.put_i32_le(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.align(8);
        self.buf.put_u64_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.align(8);
        self.buf.put_i64_le(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.align(4);
        self.buf.put_f32_le(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.align(8);
        self.buf.put_f64_le(v);
    }

    /// Raw octets, no alignment
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// GUID in its on-wire (mixed-endian) layout
    pub fn write_uuid(&mut self, uuid: &Uuid) {
        self.align(4);
        self.buf.put_slice(&uuid.to_bytes_le());
    }

    /// Enums are 16-bit on the wire
    pub fn write_enum(&mut self, discriminant: u16) {
        self.write_u16(discriminant);
    }

    /// A 4-byte conformance or variance count
    pub fn write_size(&mut self, count: u32) {
        self.write_u32(count);
    }

    /// Conformant byte array: max_count, then the octets
    pub fn write_conformant_bytes(&mut self, data: &[u8]) -> Result<()> {
        let n = u32::try_from(data.len()).map_err(|_| NdrError::IntegerOverflow)?;
        self.write_size(n);
        self.write_bytes(data);
        Ok(())
    }

    /// UTF-16 conformant-varying string including the terminating NUL
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        if s.contains('\0') {
            return Err(NdrError::EmbeddedNul);
        }
        let mut units: Vec<u16> = s.encode_utf16().collect();
        units.push(0);
        let n = u32::try_from(units.len()).map_err(|_| NdrError::IntegerOverflow)?;
        self.write_size(n);
        self.write_size(0);
        self.write_size(n);
        self.align(2);
        for unit in units {
            self.buf.put_u16_le(unit);
        }
        Ok(())
    }

    /// A null pointer field
    pub fn write_null_ptr(&mut self) {
        self.write_u32(0);
    }

    /// Unique pointer: fresh referent id, body deferred. The body closure
    /// captures its data by value.
    pub fn write_unique_ptr<F>(&mut self, body: F)
    where
        F: FnOnce(&mut NdrWriter) -> Result<()> + 'static,
    {
        let id = self.alloc_referent();
        self.write_u32(id);
        self.deferred.push_back(Box::new(body));
    }

    /// Full pointer: referents with the same key alias to one referent id
    /// and the body is written once, on first encounter.
    pub fn write_ptr<F>(&mut self, key: RefKey, body: F)
    where
        F: FnOnce(&mut NdrWriter) -> Result<()> + 'static,
    {
        if let Some(&id) = self.referents.get(&key) {
            self.write_u32(id);
            return;
        }
        let id = self.alloc_referent();
        self.referents.insert(key, id);
        self.write_u32(id);
        self.deferred.push_back(Box::new(body));
    }

    fn alloc_referent(&mut self) -> u32 {
        let id = self.next_referent;
        self.next_referent = self.next_referent.wrapping_add(4);
        id
    }

    /// Write all queued pointer bodies, strictly FIFO. Bodies queued while
    /// flushing (nested pointers) run after everything already queued.
    pub fn flush_deferred(&mut self) -> Result<()> {
        while let Some(body) = self.deferred.pop_front() {
            body(self)?;
        }
        Ok(())
    }

    /// Flush deferrals and return the encoded stream
    pub fn finish(mut self) -> Result<Bytes> {
        self.flush_deferred()?;
        Ok(self.buf.freeze())
    }
}

impl Default for NdrWriter {
    fn default() -> Self {
        Self::new()
    }
}
