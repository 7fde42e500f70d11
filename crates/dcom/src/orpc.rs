//! ORPC call headers (MS-DCOM 2.2.13, 2.2.14)
//!
//! Every ORPC request stub opens with ORPCTHIS and every successful
//! response opens with ORPCTHAT; the method payload follows. The
//! causality id in ORPCTHIS ties together all calls made on behalf of
//! one logical client activity.

use ndr::{NdrReader, NdrWriter};
use uuid::Uuid;

use crate::error::{DcomError, Result};

/// COM wire version (MS-DCOM 2.2.11)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComVersion {
    pub major: u16,
    pub minor: u16,
}

impl ComVersion {
    /// Version spoken by this implementation
    pub const DCOM_5_7: Self = Self { major: 5, minor: 7 };

    pub fn write(&self, w: &mut NdrWriter) {
        w.write_u16(self.major);
        w.write_u16(self.minor);
    }

    pub fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        Ok(Self {
            major: r.read_u16()?,
            minor: r.read_u16()?,
        })
    }
}

impl Default for ComVersion {
    fn default() -> Self {
        Self::DCOM_5_7
    }
}

/// One extension entry riding an ORPC header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrpcExtent {
    pub id: Uuid,
    pub data: Vec<u8>,
}

impl OrpcExtent {
    /// Data length rounded up to the 8-byte granularity the wire format
    /// requires
    fn padded_len(&self) -> usize {
        self.data.len().div_ceil(8) * 8
    }

    fn write_body(&self, w: &mut NdrWriter) {
        w.write_size(self.padded_len() as u32);
        w.write_uuid(&self.id);
        w.write_u32(self.data.len() as u32);
        w.write_bytes(&self.data);
        for _ in self.data.len()..self.padded_len() {
            w.write_u8(0);
        }
    }

    fn read_body(r: &mut NdrReader<'_>) -> Result<Self> {
        let padded = r.read_size(1)? as usize;
        let id = r.read_uuid()?;
        let len = r.read_u32()? as usize;
        if len > padded {
            return Err(DcomError::MalformedOrpc("extent size exceeds conformance"));
        }
        let raw = r.read_bytes(padded)?;
        Ok(Self {
            id,
            data: raw[..len].to_vec(),
        })
    }
}

/// Extension array; the wire rounds the entry count up to an even
/// number, padding with null pointers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrpcExtentArray {
    pub extents: Vec<OrpcExtent>,
}

impl OrpcExtentArray {
    fn write_body(&self, w: &mut NdrWriter) {
        let count = self.extents.len();
        let rounded = count.div_ceil(2) * 2;
        w.write_size(count as u32);
        w.write_u32(0); // reserved
        let extents = self.extents.clone();
        w.write_unique_ptr(move |w| {
            w.write_size(rounded as u32);
            for extent in extents {
                w.write_unique_ptr(move |w| {
                    extent.write_body(w);
                    Ok(())
                });
            }
            // the rounded tail is null pointers
            for _ in count..rounded {
                w.write_null_ptr();
            }
            Ok(())
        });
    }

    fn read_body(r: &mut NdrReader<'_>) -> Result<Self> {
        let count = r.read_size(4)? as usize;
        let _reserved = r.read_u32()?;
        let entries_ref = r.read_u32()?;
        if entries_ref == 0 {
            return Ok(Self::default());
        }
        // pointer body follows inline: conformance, referent ids, bodies
        let rounded = r.read_size(4)? as usize;
        if count > rounded {
            return Err(DcomError::MalformedOrpc("extent count exceeds conformance"));
        }
        let mut referents = Vec::with_capacity(rounded);
        for _ in 0..rounded {
            referents.push(r.read_u32()?);
        }
        let mut extents = Vec::with_capacity(count);
        for &referent in &referents {
            if referent != 0 {
                extents.push(OrpcExtent::read_body(r)?);
            }
        }
        if extents.len() != count {
            return Err(DcomError::MalformedOrpc("extent array count mismatch"));
        }
        Ok(Self { extents })
    }
}

/// ORPCTHIS: prefix of every ORPC request stub
#[derive(Debug, Clone)]
pub struct OrpcThis {
    pub version: ComVersion,
    pub flags: u32,
    pub reserved1: u32,
    pub causality_id: Uuid,
    pub extensions: Option<OrpcExtentArray>,
}

impl OrpcThis {
    pub fn with_causality(causality_id: Uuid) -> Self {
        Self {
            version: ComVersion::DCOM_5_7,
            flags: 0,
            reserved1: 0,
            causality_id,
            extensions: None,
        }
    }

    pub fn write(&self, w: &mut NdrWriter) {
        self.version.write(w);
        w.write_u32(self.flags);
        w.write_u32(self.reserved1);
        w.write_uuid(&self.causality_id);
        match &self.extensions {
            None => w.write_null_ptr(),
            Some(ext) => {
                let ext = ext.clone();
                w.write_unique_ptr(move |w| {
                    ext.write_body(w);
                    Ok(())
                });
            }
        }
    }

    pub fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        let version = ComVersion::read(r)?;
        let flags = r.read_u32()?;
        let reserved1 = r.read_u32()?;
        let causality_id = r.read_uuid()?;
        let extensions = read_extensions(r)?;
        Ok(Self {
            version,
            flags,
            reserved1,
            causality_id,
            extensions,
        })
    }
}

/// ORPCTHAT: prefix of every successful ORPC response stub
#[derive(Debug, Clone, Default)]
pub struct OrpcThat {
    pub flags: u32,
    pub extensions: Option<OrpcExtentArray>,
}

impl OrpcThat {
    pub fn write(&self, w: &mut NdrWriter) {
        w.write_u32(self.flags);
        match &self.extensions {
            None => w.write_null_ptr(),
            Some(ext) => {
                let ext = ext.clone();
                w.write_unique_ptr(move |w| {
                    ext.write_body(w);
                    Ok(())
                });
            }
        }
    }

    pub fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        let flags = r.read_u32()?;
        let extensions = read_extensions(r)?;
        Ok(Self { flags, extensions })
    }
}

/// The extension array is the last field of both headers, so its
/// deferred pointer body sits directly behind the fixed part and can be
/// consumed inline.
fn read_extensions(r: &mut NdrReader<'_>) -> Result<Option<OrpcExtentArray>> {
    let referent = r.read_u32()?;
    if referent == 0 {
        return Ok(None);
    }
    Ok(Some(OrpcExtentArray::read_body(r)?))
}
