//! NDR (Network Data Representation) marshaling
//!
//! The transfer syntax used by connection-oriented DCE/RPC
//! (C706 chapter 14, transfer syntax 8a885d04-1ceb-11c9-9fe8-08002b104860
//! v2.0). The codec is a pair of stateful stream processors:
//!
//! - [`NdrWriter`] encodes into a growable buffer with natural alignment,
//!   deferring pointer bodies and deduplicating aliased referents.
//! - [`NdrReader`] decodes from a borrowed slice, validating every size
//!   field against the remaining input before allocating, and resolving
//!   aliased referent ids to one shared value.
//!
//! Composite types implement [`NdrMarshal`] and [`NdrUnmarshal`].

mod error;
mod marshal;
mod reader;
mod writer;

pub use error::{NdrError, Result};
pub use marshal::{NdrMarshal, NdrUnmarshal};
pub use reader::{NdrReader, PtrSlot};
pub use writer::{NdrWriter, RefKey};

use bytes::Bytes;

/// Encode a single top-level value, flushing deferred pointer bodies
pub fn to_bytes<T: NdrMarshal>(value: &T) -> Result<Bytes> {
    let mut w = NdrWriter::new();
    value.marshal(&mut w)?;
    w.finish()
}

/// Decode a single top-level value from little-endian data
pub fn from_bytes<T: NdrUnmarshal>(data: &[u8]) -> Result<T> {
    let mut r = NdrReader::new(data);
    let value = T::unmarshal(&mut r)?;
    r.drain_deferred()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_round_trip() {
        let bytes = to_bytes(&0x1234_5678u32).unwrap();
        assert_eq!(from_bytes::<u32>(&bytes).unwrap(), 0x1234_5678);

        let bytes = to_bytes(&"string param".to_string()).unwrap();
        assert_eq!(from_bytes::<String>(&bytes).unwrap(), "string param");
    }
}
