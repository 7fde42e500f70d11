//! NDR stream reader
//!
//! Mirror of the writer: a cursor over the input with natural alignment,
//! a deferred queue for pointer bodies, and a referent arena so that an
//! aliased referent id decodes to one shared value.
//!
//! Every primitive read bounds-checks before advancing, and conformance
//! counts are validated against the bytes actually remaining before any
//! element storage is allocated.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use uuid::Uuid;

use crate::error::{NdrError, Result};

type DeferredRead<'a> = Box<dyn FnOnce(&mut NdrReader<'a>) -> Result<()> + 'a>;

/// Handle to a deferred pointer body. Empty until the reader's deferred
/// queue is drained; aliased referent ids share the same slot, so their
/// resolved values are the same `Rc` allocation.
pub struct PtrSlot<T>(Rc<RefCell<Option<Rc<T>>>>);

impl<T> Clone for PtrSlot<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> PtrSlot<T> {
    pub fn get(&self) -> Option<Rc<T>> {
        self.0.borrow().clone()
    }

    /// The decoded referent; fails if the deferred queue was not drained
    pub fn resolved(&self) -> Result<Rc<T>> {
        self.get().ok_or(NdrError::UnresolvedReferent)
    }
}

/// Stateful NDR decoder over a borrowed input buffer
pub struct NdrReader<'a> {
    data: &'a [u8],
    pos: usize,
    little_endian: bool,
    arena: HashMap<u32, Rc<dyn Any>>,
    deferred: VecDeque<DeferredRead<'a>>,
}

impl<'a> NdrReader<'a> {
    /// Reader over little-endian data (the common case)
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_byte_order(data, true)
    }

    /// Reader honoring the byte order advertised by the peer's data
    /// representation label
    pub fn with_byte_order(data: &'a [u8], little_endian: bool) -> Self {
        Self {
            data,
            pos: 0,
            little_endian,
            arena: HashMap::new(),
            deferred: VecDeque::new(),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let have = self.remaining();
        if have < needed {
            return Err(NdrError::BufferUnderrun { needed, have });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skip padding up to the alignment boundary
    pub fn align(&mut self, boundary: usize) -> Result<()> {
        let rem = self.pos % boundary;
        if rem != 0 {
            self.take(boundary - rem)?;
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let s = self.take(2)?;
        let raw = [s[0], s[1]];
        Ok(if self.little_endian {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        })
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let s = self.take(4)?;
        let raw = [s[0], s[1], s[2], s[3]];
        Ok(if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let s = self.take(8)?;
        let raw = [s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]];
        Ok(if self.little_endian {
            u64::from_le_bytes(raw)
        } else {
            u64::from_be_bytes(raw)
        })
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Raw octets, no alignment
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        self.align(4)?;
        let s = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(s);
        Ok(if self.little_endian {
            Uuid::from_bytes_le(raw)
        } else {
            Uuid::from_bytes(raw)
        })
    }

    pub fn read_enum(&mut self) -> Result<u16> {
        self.read_u16()
    }

    /// Read a 4-byte conformance or variance count for elements of the
    /// given width. Rejects counts that cannot fit in the remaining input,
    /// before anything is allocated for them.
    pub fn read_size(&mut self, elem_width: usize) -> Result<u32> {
        let count = self.read_u32()?;
        let needed = (count as u64)
            .checked_mul(elem_width as u64)
            .ok_or(NdrError::IntegerOverflow)?;
        if needed > self.remaining() as u64 {
            return Err(NdrError::SizeOverflow {
                count,
                width: elem_width,
                remaining: self.remaining(),
            });
        }
        Ok(count)
    }

    /// Conformant byte array: max_count, then the octets
    pub fn read_conformant_bytes(&mut self) -> Result<Vec<u8>> {
        let n = self.read_size(1)?;
        Ok(self.take(n as usize)?.to_vec())
    }

    /// UTF-16 conformant-varying string; strips the terminating NUL
    pub fn read_string(&mut self) -> Result<String> {
        let max = self.read_size(2)?;
        let offset = self.read_u32()?;
        if offset != 0 {
            return Err(NdrError::UnsupportedOffset(offset));
        }
        let actual = self.read_size(2)?;
        if actual > max {
            return Err(NdrError::ConformanceMismatch { max, actual });
        }
        if actual == 0 {
            return Ok(String::new());
        }
        self.align(2)?;
        let raw = self.take(actual as usize * 2)?;
        let mut units = Vec::with_capacity(actual as usize);
        for pair in raw.chunks_exact(2) {
            let v = [pair[0], pair[1]];
            units.push(if self.little_endian {
                u16::from_le_bytes(v)
            } else {
                u16::from_be_bytes(v)
            });
        }
        if units.pop() != Some(0) {
            return Err(NdrError::InvalidString);
        }
        String::from_utf16(&units).map_err(|_| NdrError::InvalidString)
    }

    /// Pointer field. Returns `None` for a null referent id; otherwise a
    /// slot that fills in when `drain_deferred` runs the queued body.
    /// A referent id seen before resolves to the already-registered slot,
    /// so aliases share one decoded value.
    pub fn read_ptr<T, F>(&mut self, decode: F) -> Result<Option<PtrSlot<T>>>
    where
        T: 'static,
        F: FnOnce(&mut NdrReader<'a>) -> Result<T> + 'a,
    {
        let id = self.read_u32()?;
        if id == 0 {
            return Ok(None);
        }
        if let Some(existing) = self.arena.get(&id) {
            let cell = existing
                .clone()
                .downcast::<RefCell<Option<Rc<T>>>>()
                .map_err(|_| NdrError::UnexpectedReferent(id))?;
            return Ok(Some(PtrSlot(cell)));
        }
        let cell: Rc<RefCell<Option<Rc<T>>>> = Rc::new(RefCell::new(None));
        self.arena.insert(id, cell.clone());
        let fill = cell.clone();
        self.deferred.push_back(Box::new(move |r| {
            let value = decode(r)?;
            *fill.borrow_mut() = Some(Rc::new(value));
            Ok(())
        }));
        Ok(Some(PtrSlot(cell)))
    }

    /// Run all queued pointer bodies, strictly FIFO; nested pointers
    /// append to the same queue.
    pub fn drain_deferred(&mut self) -> Result<()> {
        while let Some(body) = self.deferred.pop_front() {
            body(self)?;
        }
        Ok(())
    }
}
