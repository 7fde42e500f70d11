//! DCOM object RPC on top of the connection-oriented `dcerpc` crate
//!
//! Implements the wire pieces of MS-DCOM needed to hold and call a
//! remote interface pointer: object identity, OBJREF marshaling, and
//! the ORPCTHIS/ORPCTHAT call headers.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                 ORPC Layer (this crate)                │
//! ├────────────────────────────────────────────────────────┤
//! │  Identity           │  Marshaling      │  Calls        │
//! │  - OXID/OID/IPID    │  - OBJREF (MEOW) │  - ORPCTHIS   │
//! │  - ObjectIdentity   │  - DualString-   │  - ORPCTHAT   │
//! │                     │    Array         │  - causality  │
//! ├────────────────────────────────────────────────────────┤
//! │            DCE RPC Layer (dcerpc crate)                │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! A reference arrives as an OBJREF inside some response payload;
//! [`unmarshal_interface`] turns it into an [`ObjRef`], whose
//! [`ObjectIdentity`] feeds [`bind_ipid`]. The resulting
//! [`BoundClient`] issues calls addressed at the IPID, with the ORPC
//! headers applied around the method payload.

pub mod client;
pub mod error;
pub mod identity;
pub mod objref;
pub mod orpc;

pub use client::{bind_ipid, BoundClient};
pub use error::{DcomError, Result};
pub use identity::{Ipid, ObjectIdentity, Oid, Oxid};
pub use objref::{
    marshal_interface, objref_flags, sorf, tower_id, unmarshal_interface, DualStringArray,
    ObjRef, ObjRefBody, SecurityBinding, StdObjRef, StringBinding, OBJREF_SIGNATURE,
};
pub use orpc::{ComVersion, OrpcExtent, OrpcExtentArray, OrpcThat, OrpcThis};

/// COM wire version spoken on ORPC calls
pub const DCOM_VERSION: ComVersion = ComVersion::DCOM_5_7;
