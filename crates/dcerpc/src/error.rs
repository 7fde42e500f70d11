//! RPC error types

use thiserror::Error;

/// Errors surfaced by the RPC runtime
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ndr(#[from] ndr::NdrError),

    #[error("malformed PDU: {0}")]
    MalformedPdu(&'static str),

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("unsupported RPC version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("PDU of {size} bytes exceeds limit of {limit}")]
    PduTooLarge { size: usize, limit: usize },

    /// A fault PDU from the peer. `did_not_execute` reflects the header
    /// flag, so callers can tell whether retry is safe.
    #[error("fault {status:#010x} from peer")]
    Fault { status: u32, did_not_execute: bool },

    #[error("bind rejected: {0}")]
    BindRejected(String),

    #[error("presentation context {0} was not negotiated")]
    UnknownContext(u16),

    #[error("call id mismatch: expected {expected}, got {got}")]
    CallIdMismatch { expected: u32, got: u32 },

    #[error("duplicate first fragment")]
    DuplicateFirstFragment,

    #[error("fragment received before first fragment")]
    FragmentBeforeFirst,

    #[error("fragment context mismatch: expected {expected}, got {got}")]
    ContextMismatch { expected: u16, got: u16 },

    #[error("security negotiation failed: {0}")]
    Negotiation(String),

    #[error("message integrity check failed")]
    IntegrityCheck,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection is in state {0} for this request")]
    InvalidState(&'static str),

    #[error("call timed out")]
    Timeout,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// Result alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
