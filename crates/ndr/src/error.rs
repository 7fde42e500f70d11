//! NDR marshaling errors

use thiserror::Error;

/// Errors produced while encoding or decoding an NDR stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NdrError {
    /// Not enough bytes remain in the input
    #[error("buffer underrun: needed {needed} bytes, {have} remain")]
    BufferUnderrun { needed: usize, have: usize },

    /// A conformance count claims more data than the input holds.
    /// Raised before any allocation is made for the elements.
    #[error("size {count} x {width}-byte elements exceeds {remaining} remaining bytes")]
    SizeOverflow {
        count: u32,
        width: usize,
        remaining: usize,
    },

    /// A varying count exceeds the conformant maximum
    #[error("varying count {actual} exceeds conformant max {max}")]
    ConformanceMismatch { max: u32, actual: u32 },

    /// A varying offset other than zero, which this codec does not emit
    #[error("unsupported varying offset {0}")]
    UnsupportedOffset(u32),

    /// A referent id reused with an incompatible pointee type
    #[error("referent id {0:#010x} does not match the pointer that introduced it")]
    UnexpectedReferent(u32),

    /// A pointer body was read before the deferred queue was drained
    #[error("referent body not yet decoded; deferred queue not drained")]
    UnresolvedReferent,

    /// An enum discriminant outside the type's known values
    #[error("invalid enum discriminant {0}")]
    InvalidEnum(u16),

    /// String data that is not well-formed UTF-16 or lacks a terminator
    #[error("malformed UTF-16 string data")]
    InvalidString,

    /// Interior NUL in a string to be marshaled
    #[error("embedded NUL in string")]
    EmbeddedNul,

    /// Arithmetic overflow computing a wire size
    #[error("integer overflow computing wire size")]
    IntegerOverflow,
}

/// Result alias for NDR operations
pub type Result<T> = std::result::Result<T, NdrError>;
