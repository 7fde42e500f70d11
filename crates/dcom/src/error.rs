use thiserror::Error;

/// Errors from the ORPC layer
#[derive(Debug, Error)]
pub enum DcomError {
    #[error(transparent)]
    Rpc(#[from] dcerpc::RpcError),

    #[error(transparent)]
    Ndr(#[from] ndr::NdrError),

    #[error("invalid OBJREF: {0}")]
    InvalidObjRef(String),

    #[error("OBJREF signature mismatch: got {0:#010x}")]
    BadSignature(u32),

    #[error("unsupported OBJREF flags: {0:#010x}")]
    UnsupportedObjRef(u32),

    #[error("malformed ORPC header: {0}")]
    MalformedOrpc(&'static str),
}

pub type Result<T> = std::result::Result<T, DcomError>;
