//! Marshaled interface pointers: OBJREF and its bindings
//! (MS-DCOM 2.2.18, 2.2.19)
//!
//! An OBJREF is how an interface pointer crosses the wire. It opens
//! with the "MEOW" signature and a flags word naming the variant, then
//! the interface IID. The standard variant carries a STDOBJREF (the
//! object's identity plus reference counts) and a DUALSTRINGARRAY
//! telling the receiver where the exporter's resolver listens.
//!
//! On the wire an interface pointer travels as a conformant byte blob
//! (MInterfacePointer); [`marshal_interface`] / [`unmarshal_interface`]
//! handle the wrapping.

use ndr::{NdrReader, NdrWriter};
use uuid::Uuid;

use crate::error::{DcomError, Result};
use crate::identity::{Ipid, ObjectIdentity, Oid, Oxid};

/// "MEOW", the OBJREF signature
pub const OBJREF_SIGNATURE: u32 = 0x574F_454D;

pub mod objref_flags {
    pub const STANDARD: u32 = 0x0000_0001;
    pub const HANDLER: u32 = 0x0000_0002;
    pub const CUSTOM: u32 = 0x0000_0004;
    pub const EXTENDED: u32 = 0x0000_0008;
}

/// STDOBJREF flags
pub mod sorf {
    /// Reference does not participate in ping-based garbage collection
    pub const NOPING: u32 = 0x0000_1000;
}

/// Standard object reference (MS-DCOM 2.2.18.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdObjRef {
    pub flags: u32,
    pub public_refs: u32,
    pub oxid: Oxid,
    pub oid: Oid,
    pub ipid: Ipid,
}

impl StdObjRef {
    pub fn requires_pinging(&self) -> bool {
        self.flags & sorf::NOPING == 0
    }

    fn write(&self, w: &mut NdrWriter) {
        w.write_u32(self.flags);
        w.write_u32(self.public_refs);
        self.oxid.write(w);
        self.oid.write(w);
        self.ipid.write(w);
    }

    fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        Ok(Self {
            flags: r.read_u32()?,
            public_refs: r.read_u32()?,
            oxid: Oxid::read(r)?,
            oid: Oid::read(r)?,
            ipid: Ipid::read(r)?,
        })
    }
}

/// RPC protocol sequence identifiers used in string bindings
pub mod tower_id {
    pub const NCACN_IP_TCP: u16 = 0x07;
    pub const NCACN_NP: u16 = 0x0F;
    pub const NCALRPC: u16 = 0x10;
    pub const NCACN_HTTP: u16 = 0x1F;
}

/// One endpoint the exporter's resolver listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringBinding {
    pub tower_id: u16,
    pub network_addr: String,
}

impl StringBinding {
    pub fn tcp(addr: &str) -> Self {
        Self {
            tower_id: tower_id::NCACN_IP_TCP,
            network_addr: addr.to_owned(),
        }
    }

    /// Length in u16 units including the terminator
    fn wire_len(&self) -> usize {
        1 + self.network_addr.encode_utf16().count() + 1
    }

    fn write(&self, w: &mut NdrWriter) {
        w.write_u16(self.tower_id);
        for unit in self.network_addr.encode_utf16() {
            w.write_u16(unit);
        }
        w.write_u16(0);
    }
}

/// Security service advertised alongside the string bindings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityBinding {
    pub authn_svc: u16,
    pub authz_svc: u16,
    pub principal: String,
}

impl SecurityBinding {
    fn wire_len(&self) -> usize {
        2 + self.principal.encode_utf16().count() + 1
    }

    fn write(&self, w: &mut NdrWriter) {
        w.write_u16(self.authn_svc);
        w.write_u16(self.authz_svc);
        for unit in self.principal.encode_utf16() {
            w.write_u16(unit);
        }
        w.write_u16(0);
    }
}

/// String and security bindings packed into one u16 array
/// (MS-DCOM 2.2.19.1). Both halves end with an extra null terminator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DualStringArray {
    pub string_bindings: Vec<StringBinding>,
    pub security_bindings: Vec<SecurityBinding>,
}

impl DualStringArray {
    pub fn with_tcp_binding(addr: &str) -> Self {
        Self {
            string_bindings: vec![StringBinding::tcp(addr)],
            security_bindings: Vec::new(),
        }
    }

    fn write(&self, w: &mut NdrWriter) {
        let string_len: usize =
            self.string_bindings.iter().map(StringBinding::wire_len).sum::<usize>() + 1;
        let security_len: usize =
            self.security_bindings.iter().map(SecurityBinding::wire_len).sum::<usize>() + 1;
        w.write_u16((string_len + security_len) as u16);
        w.write_u16(string_len as u16);
        for binding in &self.string_bindings {
            binding.write(w);
        }
        w.write_u16(0);
        for binding in &self.security_bindings {
            binding.write(w);
        }
        w.write_u16(0);
    }

    fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        let num_entries = r.read_u16()? as usize;
        let security_offset = r.read_u16()? as usize;
        if security_offset > num_entries {
            return Err(DcomError::InvalidObjRef(
                "security offset beyond binding array".into(),
            ));
        }
        let mut units = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            units.push(r.read_u16()?);
        }

        let string_bindings = parse_string_bindings(&units[..security_offset])?;
        let security_bindings = parse_security_bindings(&units[security_offset..])?;
        Ok(Self {
            string_bindings,
            security_bindings,
        })
    }
}

fn take_wstring(units: &[u16]) -> Result<(String, &[u16])> {
    let end = units
        .iter()
        .position(|&u| u == 0)
        .ok_or_else(|| DcomError::InvalidObjRef("unterminated binding string".into()))?;
    let s = String::from_utf16(&units[..end])
        .map_err(|_| DcomError::InvalidObjRef("binding string is not UTF-16".into()))?;
    Ok((s, &units[end + 1..]))
}

fn parse_string_bindings(mut units: &[u16]) -> Result<Vec<StringBinding>> {
    let mut bindings = Vec::new();
    loop {
        match units.first() {
            None | Some(0) => return Ok(bindings),
            Some(&tower_id) => {
                let (network_addr, rest) = take_wstring(&units[1..])?;
                bindings.push(StringBinding {
                    tower_id,
                    network_addr,
                });
                units = rest;
            }
        }
    }
}

fn parse_security_bindings(mut units: &[u16]) -> Result<Vec<SecurityBinding>> {
    let mut bindings = Vec::new();
    loop {
        match units.first() {
            None | Some(0) => return Ok(bindings),
            Some(&authn_svc) => {
                let authz_svc = *units
                    .get(1)
                    .ok_or_else(|| DcomError::InvalidObjRef("truncated security binding".into()))?;
                let (principal, rest) = take_wstring(&units[2..])?;
                bindings.push(SecurityBinding {
                    authn_svc,
                    authz_svc,
                    principal,
                });
                units = rest;
            }
        }
    }
}

/// Variant payload of an OBJREF
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjRefBody {
    Standard {
        std: StdObjRef,
        resolver: DualStringArray,
    },
    Handler {
        std: StdObjRef,
        clsid: Uuid,
        resolver: DualStringArray,
    },
    Custom {
        clsid: Uuid,
        extension_size: u32,
        data: Vec<u8>,
    },
    Extended {
        std: StdObjRef,
        resolver: DualStringArray,
    },
}

/// A marshaled interface pointer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjRef {
    pub iid: Uuid,
    pub body: ObjRefBody,
}

// OBJREF_EXTENDED bracket signature, "TXSN"
const EXTENDED_SIGNATURE: u32 = 0x4E53_5854;

impl ObjRef {
    pub fn standard(iid: Uuid, std: StdObjRef, resolver: DualStringArray) -> Self {
        Self {
            iid,
            body: ObjRefBody::Standard { std, resolver },
        }
    }

    pub fn flags(&self) -> u32 {
        match &self.body {
            ObjRefBody::Standard { .. } => objref_flags::STANDARD,
            ObjRefBody::Handler { .. } => objref_flags::HANDLER,
            ObjRefBody::Custom { .. } => objref_flags::CUSTOM,
            ObjRefBody::Extended { .. } => objref_flags::EXTENDED,
        }
    }

    pub fn std_obj_ref(&self) -> Option<&StdObjRef> {
        match &self.body {
            ObjRefBody::Standard { std, .. }
            | ObjRefBody::Handler { std, .. }
            | ObjRefBody::Extended { std, .. } => Some(std),
            ObjRefBody::Custom { .. } => None,
        }
    }

    /// The identity this reference points at; `None` for custom
    /// marshaling, which carries opaque data instead
    pub fn identity(&self) -> Option<ObjectIdentity> {
        self.std_obj_ref().map(|std| ObjectIdentity {
            oxid: std.oxid,
            oid: std.oid,
            ipid: std.ipid,
            iid: self.iid,
        })
    }

    pub fn write(&self, w: &mut NdrWriter) {
        w.write_u32(OBJREF_SIGNATURE);
        w.write_u32(self.flags());
        w.write_uuid(&self.iid);
        match &self.body {
            ObjRefBody::Standard { std, resolver } => {
                std.write(w);
                resolver.write(w);
            }
            ObjRefBody::Handler {
                std,
                clsid,
                resolver,
            } => {
                std.write(w);
                w.write_uuid(clsid);
                resolver.write(w);
            }
            ObjRefBody::Custom {
                clsid,
                extension_size,
                data,
            } => {
                w.write_uuid(clsid);
                w.write_u32(*extension_size);
                w.write_u32(data.len() as u32);
                w.write_bytes(data);
            }
            ObjRefBody::Extended { std, resolver } => {
                std.write(w);
                w.write_u32(EXTENDED_SIGNATURE);
                resolver.write(w);
                w.write_u32(0); // no extension entries
                w.write_u32(EXTENDED_SIGNATURE);
            }
        }
    }

    pub fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        let signature = r.read_u32()?;
        if signature != OBJREF_SIGNATURE {
            return Err(DcomError::BadSignature(signature));
        }
        let flags = r.read_u32()?;
        let iid = r.read_uuid()?;
        let body = match flags {
            objref_flags::STANDARD => ObjRefBody::Standard {
                std: StdObjRef::read(r)?,
                resolver: DualStringArray::read(r)?,
            },
            objref_flags::HANDLER => ObjRefBody::Handler {
                std: StdObjRef::read(r)?,
                clsid: r.read_uuid()?,
                resolver: DualStringArray::read(r)?,
            },
            objref_flags::CUSTOM => {
                let clsid = r.read_uuid()?;
                let extension_size = r.read_u32()?;
                let size = r.read_size(1)?;
                let data = r.read_bytes(size as usize)?.to_vec();
                ObjRefBody::Custom {
                    clsid,
                    extension_size,
                    data,
                }
            }
            objref_flags::EXTENDED => {
                let std = StdObjRef::read(r)?;
                let sig1 = r.read_u32()?;
                let resolver = DualStringArray::read(r)?;
                let n_elms = r.read_u32()?;
                let sig2 = r.read_u32()?;
                if sig1 != EXTENDED_SIGNATURE || sig2 != EXTENDED_SIGNATURE || n_elms != 0 {
                    return Err(DcomError::InvalidObjRef(
                        "extended OBJREF bracket mismatch".into(),
                    ));
                }
                ObjRefBody::Extended { std, resolver }
            }
            other => return Err(DcomError::UnsupportedObjRef(other)),
        };
        Ok(Self { iid, body })
    }
}

/// Write an OBJREF as an MInterfacePointer: a conformant byte blob
/// holding the packed reference
pub fn marshal_interface(w: &mut NdrWriter, objref: &ObjRef) -> Result<()> {
    let mut inner = NdrWriter::new();
    objref.write(&mut inner);
    let blob = inner.finish()?;
    w.write_size(blob.len() as u32);
    w.write_conformant_bytes(&blob)?;
    Ok(())
}

/// Read an MInterfacePointer and parse the OBJREF inside it
pub fn unmarshal_interface(r: &mut NdrReader<'_>) -> Result<ObjRef> {
    let declared = r.read_size(1)? as usize;
    let blob = r.read_conformant_bytes()?;
    if blob.len() != declared {
        return Err(DcomError::InvalidObjRef(
            "interface pointer size disagrees with blob".into(),
        ));
    }
    let mut inner = NdrReader::with_byte_order(&blob, r.little_endian());
    ObjRef::read(&mut inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_std() -> StdObjRef {
        StdObjRef {
            flags: sorf::NOPING,
            public_refs: 5,
            oxid: Oxid(0x1122_3344_5566_7788),
            oid: Oid(0x99AA_BBCC_DDEE_FF00),
            ipid: Ipid(Uuid::from_u128(0xABCD_EF01_2345)),
        }
    }

    fn iid_unknown() -> Uuid {
        Uuid::from_u128(0x00000000_0000_0000_C000_000000000046)
    }

    #[test]
    fn test_meow_signature_spells_meow() {
        assert_eq!(&OBJREF_SIGNATURE.to_le_bytes(), b"MEOW");
    }

    #[test]
    fn test_standard_round_trip() {
        let objref = ObjRef::standard(
            iid_unknown(),
            sample_std(),
            DualStringArray::with_tcp_binding("192.168.1.50"),
        );
        let mut w = NdrWriter::new();
        objref.write(&mut w);
        let bytes = w.finish().unwrap();

        let mut r = NdrReader::new(&bytes);
        let got = ObjRef::read(&mut r).unwrap();
        assert_eq!(got, objref);
        assert_eq!(r.remaining(), 0);

        let identity = got.identity().expect("standard has identity");
        assert_eq!(identity.oxid, Oxid(0x1122_3344_5566_7788));
        assert_eq!(identity.iid, iid_unknown());
        assert!(!sample_std().requires_pinging());
    }

    #[test]
    fn test_handler_round_trip() {
        let objref = ObjRef {
            iid: iid_unknown(),
            body: ObjRefBody::Handler {
                std: sample_std(),
                clsid: Uuid::from_u128(0xC1),
                resolver: DualStringArray::with_tcp_binding("host"),
            },
        };
        let mut w = NdrWriter::new();
        objref.write(&mut w);
        let bytes = w.finish().unwrap();
        let got = ObjRef::read(&mut NdrReader::new(&bytes)).unwrap();
        assert_eq!(got, objref);
    }

    #[test]
    fn test_custom_round_trip() {
        let objref = ObjRef {
            iid: iid_unknown(),
            body: ObjRefBody::Custom {
                clsid: Uuid::from_u128(0xC2),
                extension_size: 0,
                data: b"opaque marshal data".to_vec(),
            },
        };
        let mut w = NdrWriter::new();
        objref.write(&mut w);
        let bytes = w.finish().unwrap();
        let got = ObjRef::read(&mut NdrReader::new(&bytes)).unwrap();
        assert_eq!(got, objref);
        assert!(got.identity().is_none());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut w = NdrWriter::new();
        w.write_u32(0x1234_5678);
        w.write_u32(objref_flags::STANDARD);
        let bytes = w.finish().unwrap();
        assert!(matches!(
            ObjRef::read(&mut NdrReader::new(&bytes)),
            Err(DcomError::BadSignature(0x1234_5678))
        ));
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut w = NdrWriter::new();
        w.write_u32(OBJREF_SIGNATURE);
        w.write_u32(0x40);
        w.write_uuid(&iid_unknown());
        let bytes = w.finish().unwrap();
        assert!(matches!(
            ObjRef::read(&mut NdrReader::new(&bytes)),
            Err(DcomError::UnsupportedObjRef(0x40))
        ));
    }

    #[test]
    fn test_dual_string_array_with_security() {
        let dsa = DualStringArray {
            string_bindings: vec![
                StringBinding::tcp("10.0.0.1"),
                StringBinding {
                    tower_id: tower_id::NCACN_NP,
                    network_addr: r"\\server\pipe\svc".into(),
                },
            ],
            security_bindings: vec![SecurityBinding {
                authn_svc: 10, // NTLM
                authz_svc: 0,
                principal: "DOMAIN\\user".into(),
            }],
        };
        let mut w = NdrWriter::new();
        dsa.write(&mut w);
        let bytes = w.finish().unwrap();
        let got = DualStringArray::read(&mut NdrReader::new(&bytes)).unwrap();
        assert_eq!(got, dsa);
    }

    #[test]
    fn test_marshal_interface_blob() {
        let objref = ObjRef::standard(
            iid_unknown(),
            sample_std(),
            DualStringArray::with_tcp_binding("127.0.0.1"),
        );
        let mut w = NdrWriter::new();
        marshal_interface(&mut w, &objref).unwrap();
        let bytes = w.finish().unwrap();

        let mut r = NdrReader::new(&bytes);
        let got = unmarshal_interface(&mut r).unwrap();
        assert_eq!(got, objref);
    }
}
