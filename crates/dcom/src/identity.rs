//! Object identity (MS-DCOM 2.2.18)
//!
//! Three identifiers locate a remote interface pointer: the OXID names
//! the exporting apartment, the OID names the object inside it, and the
//! IPID names one interface on that object. They are assigned by the
//! exporter and travel inside OBJREFs; this side only ever learns them
//! from unmarshaled wire data, never invents them.

use std::fmt;

use ndr::{NdrReader, NdrWriter};
use uuid::Uuid;

use crate::error::Result;

/// Object exporter identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Oxid(pub u64);

impl Oxid {
    pub fn write(&self, w: &mut NdrWriter) {
        w.write_u64(self.0);
    }

    pub fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        Ok(Self(r.read_u64()?))
    }
}

impl fmt::Debug for Oxid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OXID({:016x})", self.0)
    }
}

/// Object identifier, unique within one exporter
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Oid(pub u64);

impl Oid {
    pub fn write(&self, w: &mut NdrWriter) {
        w.write_u64(self.0);
    }

    pub fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        Ok(Self(r.read_u64()?))
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OID({:016x})", self.0)
    }
}

/// Interface pointer identifier; doubles as the request object uuid on
/// ORPC calls
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ipid(pub Uuid);

impl Ipid {
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    pub fn write(&self, w: &mut NdrWriter) {
        w.write_uuid(&self.0);
    }

    pub fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        Ok(Self(r.read_uuid()?))
    }
}

impl fmt::Debug for Ipid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPID({})", self.0)
    }
}

impl fmt::Display for Ipid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything needed to address one interface pointer on one remote
/// object. Built from an unmarshaled OBJREF (or an activation result),
/// never fabricated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectIdentity {
    pub oxid: Oxid,
    pub oid: Oid,
    pub ipid: Ipid,
    /// Interface the IPID was marshaled for
    pub iid: Uuid,
}
