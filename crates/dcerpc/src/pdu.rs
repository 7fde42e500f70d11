//! Connection-oriented DCE/RPC PDUs (C706 chapter 12, MS-RPCE 2.2)
//!
//! Every PDU starts with a 16-byte header:
//!
//! ```text
//! +--------+--------+--------+--------+
//! | vers=5 | minor=0| ptype  | pflags |
//! +--------+--------+--------+--------+
//! |     data representation label     |
//! +-----------------+-----------------+
//! |   frag_length   |   auth_length   |
//! +-----------------+-----------------+
//! |              call_id              |
//! +-----------------------------------+
//! ```
//!
//! Body fields are NDR primitives and run through the codec; the header's
//! data representation label tells the peer which byte order the rest of
//! the PDU uses. When `auth_length` is non-zero, the PDU ends with the
//! security trailer: the stub is padded to a 4-byte boundary, followed by
//! the 8-byte verifier header and `auth_length` token bytes.

use bytes::{BufMut, Bytes, BytesMut};
use ndr::{NdrReader, NdrWriter};
use uuid::Uuid;

use crate::auth::AuthVerifier;
use crate::error::{Result, RpcError};

pub const RPC_VERSION_MAJOR: u8 = 5;
pub const RPC_VERSION_MINOR: u8 = 0;

/// NDR transfer syntax, v2.0
pub const NDR_TRANSFER_SYNTAX_UUID: Uuid = Uuid::from_u128(0x8a885d04_1ceb_11c9_9fe8_08002b104860);

/// The transfer syntax this stack proposes and accepts
pub fn ndr_transfer_syntax() -> SyntaxId {
    SyntaxId::new(NDR_TRANSFER_SYNTAX_UUID, 2, 0)
}

/// Interface or transfer syntax identifier: uuid plus packed version
/// (major in the low word, minor in the high word)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version: u32,
}

impl SyntaxId {
    pub const SIZE: usize = 20;

    pub fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            version: (major as u32) | ((minor as u32) << 16),
        }
    }

    pub fn major(&self) -> u16 {
        (self.version & 0xFFFF) as u16
    }

    pub fn minor(&self) -> u16 {
        (self.version >> 16) as u16
    }

    pub fn write(&self, w: &mut NdrWriter) {
        w.write_uuid(&self.uuid);
        w.write_u32(self.version);
    }

    pub fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        Ok(Self {
            uuid: r.read_uuid()?,
            version: r.read_u32()?,
        })
    }
}

impl std::fmt::Display for SyntaxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}.{}", self.uuid, self.major(), self.minor())
    }
}

/// PDU packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Ping = 1,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
    AlterContext = 14,
    AlterContextResponse = 15,
    Auth3 = 16,
    Shutdown = 17,
    CancelRequest = 18,
    Orphaned = 19,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Request,
            1 => Self::Ping,
            2 => Self::Response,
            3 => Self::Fault,
            11 => Self::Bind,
            12 => Self::BindAck,
            13 => Self::BindNak,
            14 => Self::AlterContext,
            15 => Self::AlterContextResponse,
            16 => Self::Auth3,
            17 => Self::Shutdown,
            18 => Self::CancelRequest,
            19 => Self::Orphaned,
            _ => return None,
        })
    }
}

/// Header flags byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    pub const FIRST_FRAG: u8 = 0x01;
    pub const LAST_FRAG: u8 = 0x02;
    pub const PENDING_CANCEL: u8 = 0x04;
    pub const CONC_MPX: u8 = 0x10;
    pub const DID_NOT_EXECUTE: u8 = 0x20;
    pub const MAYBE: u8 = 0x40;
    pub const OBJECT_UUID: u8 = 0x80;

    /// An unfragmented PDU: both first and last
    pub fn complete() -> Self {
        Self(Self::FIRST_FRAG | Self::LAST_FRAG)
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn insert(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn is_first(&self) -> bool {
        self.contains(Self::FIRST_FRAG)
    }

    pub fn is_last(&self) -> bool {
        self.contains(Self::LAST_FRAG)
    }
}

/// Data representation format label. We always emit little-endian
/// integers, ASCII characters and IEEE floats; on receive the label
/// drives the decoder's byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRepresentation {
    pub integer_character: u8,
    pub floating_point: u8,
}

impl DataRepresentation {
    const LITTLE_ENDIAN_ASCII: u8 = 0x10;
    const IEEE_FLOAT: u8 = 0x00;

    pub fn encode(&self) -> [u8; 4] {
        [self.integer_character, self.floating_point, 0, 0]
    }

    pub fn decode(raw: &[u8]) -> Self {
        Self {
            integer_character: raw[0],
            floating_point: raw[1],
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.integer_character & 0xF0 == 0x10
    }
}

impl Default for DataRepresentation {
    fn default() -> Self {
        Self {
            integer_character: Self::LITTLE_ENDIAN_ASCII,
            floating_point: Self::IEEE_FLOAT,
        }
    }
}

/// The common 16-byte PDU header
#[derive(Debug, Clone, Copy)]
pub struct PduHeader {
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub drep: DataRepresentation,
    pub frag_length: u16,
    pub auth_length: u16,
    pub call_id: u32,
}

impl PduHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(RPC_VERSION_MAJOR);
        buf.put_u8(RPC_VERSION_MINOR);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.flags.0);
        buf.put_slice(&self.drep.encode());
        buf.put_u16_le(self.frag_length);
        buf.put_u16_le(self.auth_length);
        buf.put_u32_le(self.call_id);
    }

    pub fn decode(raw: &[u8; Self::SIZE]) -> Result<Self> {
        if raw[0] != RPC_VERSION_MAJOR || raw[1] != RPC_VERSION_MINOR {
            return Err(RpcError::UnsupportedVersion {
                major: raw[0],
                minor: raw[1],
            });
        }
        let packet_type =
            PacketType::from_u8(raw[2]).ok_or(RpcError::UnknownPacketType(raw[2]))?;
        let flags = PacketFlags(raw[3]);
        let drep = DataRepresentation::decode(&raw[4..8]);
        let (frag_length, auth_length, call_id) = if drep.is_little_endian() {
            (
                u16::from_le_bytes([raw[8], raw[9]]),
                u16::from_le_bytes([raw[10], raw[11]]),
                u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
            )
        } else {
            (
                u16::from_be_bytes([raw[8], raw[9]]),
                u16::from_be_bytes([raw[10], raw[11]]),
                u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]),
            )
        };
        Ok(Self {
            packet_type,
            flags,
            drep,
            frag_length,
            auth_length,
            call_id,
        })
    }
}

/// One proposed presentation context in a bind or alter-context
#[derive(Debug, Clone)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl ContextElement {
    pub fn new(context_id: u16, abstract_syntax: SyntaxId) -> Self {
        Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes: vec![ndr_transfer_syntax()],
        }
    }

    fn write(&self, w: &mut NdrWriter) {
        w.write_u16(self.context_id);
        w.write_u16(self.transfer_syntaxes.len() as u16);
        self.abstract_syntax.write(w);
        for ts in &self.transfer_syntaxes {
            ts.write(w);
        }
    }

    fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        let context_id = r.read_u16()?;
        let n = r.read_u16()? as usize;
        let abstract_syntax = SyntaxId::read(r)?;
        if n * SyntaxId::SIZE > r.remaining() {
            return Err(RpcError::MalformedPdu("transfer syntax list overruns PDU"));
        }
        let mut transfer_syntaxes = Vec::with_capacity(n);
        for _ in 0..n {
            transfer_syntaxes.push(SyntaxId::read(r)?);
        }
        Ok(Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes,
        })
    }
}

/// Per-context negotiation outcome in a bind_ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ContextResultCode {
    Acceptance = 0,
    UserRejection = 1,
    ProviderRejection = 2,
}

impl ContextResultCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::Acceptance,
            1 => Self::UserRejection,
            2 => Self::ProviderRejection,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextResult {
    pub result: ContextResultCode,
    pub reason: u16,
    pub transfer_syntax: SyntaxId,
}

impl ContextResult {
    pub fn accepted(transfer_syntax: SyntaxId) -> Self {
        Self {
            result: ContextResultCode::Acceptance,
            reason: 0,
            transfer_syntax,
        }
    }

    pub fn provider_rejected(reason: u16) -> Self {
        Self {
            result: ContextResultCode::ProviderRejection,
            reason,
            transfer_syntax: SyntaxId::new(Uuid::nil(), 0, 0),
        }
    }

    fn write(&self, w: &mut NdrWriter) {
        w.write_u16(self.result as u16);
        w.write_u16(self.reason);
        self.transfer_syntax.write(w);
    }

    fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        let raw = r.read_u16()?;
        let result =
            ContextResultCode::from_u16(raw).ok_or(RpcError::MalformedPdu("context result"))?;
        Ok(Self {
            result,
            reason: r.read_u16()?,
            transfer_syntax: SyntaxId::read(r)?,
        })
    }
}

/// bind and alter_context share this body
#[derive(Debug, Clone)]
pub struct BindPdu {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub contexts: Vec<ContextElement>,
}

impl BindPdu {
    fn write(&self, w: &mut NdrWriter) {
        w.write_u16(self.max_xmit_frag);
        w.write_u16(self.max_recv_frag);
        w.write_u32(self.assoc_group_id);
        w.write_u32(self.contexts.len() as u32);
        for ctx in &self.contexts {
            ctx.write(w);
        }
    }

    fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        let max_xmit_frag = r.read_u16()?;
        let max_recv_frag = r.read_u16()?;
        let assoc_group_id = r.read_u32()?;
        let n = r.read_size(SyntaxId::SIZE + 4)? as usize;
        let mut contexts = Vec::with_capacity(n);
        for _ in 0..n {
            contexts.push(ContextElement::read(r)?);
        }
        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            contexts,
        })
    }
}

/// bind_ack and alter_context_resp share this body
#[derive(Debug, Clone)]
pub struct BindAckPdu {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    /// Secondary address (endpoint the server actually listens on);
    /// empty on alter_context_resp
    pub secondary_addr: String,
    pub results: Vec<ContextResult>,
}

impl BindAckPdu {
    fn write(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_u16(self.max_xmit_frag);
        w.write_u16(self.max_recv_frag);
        w.write_u32(self.assoc_group_id);
        let addr_len =
            u16::try_from(self.secondary_addr.len() + 1).map_err(|_| ndr::NdrError::IntegerOverflow)?;
        w.write_u16(addr_len);
        w.write_bytes(self.secondary_addr.as_bytes());
        w.write_u8(0);
        w.align(4);
        w.write_u32(self.results.len() as u32);
        for result in &self.results {
            result.write(w);
        }
        Ok(())
    }

    fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        let max_xmit_frag = r.read_u16()?;
        let max_recv_frag = r.read_u16()?;
        let assoc_group_id = r.read_u32()?;
        let addr_len = r.read_u16()? as usize;
        let raw = r.read_bytes(addr_len)?;
        let secondary_addr = match raw.split_last() {
            Some((0, addr)) => String::from_utf8_lossy(addr).into_owned(),
            _ => String::from_utf8_lossy(raw).into_owned(),
        };
        r.align(4)?;
        let n = r.read_size(SyntaxId::SIZE + 4)? as usize;
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(ContextResult::read(r)?);
        }
        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            secondary_addr,
            results,
        })
    }
}

/// Bind rejection reasons
pub mod bind_nak_reason {
    pub const NOT_SPECIFIED: u16 = 0;
    pub const TEMPORARY_CONGESTION: u16 = 1;
    pub const LOCAL_LIMIT_EXCEEDED: u16 = 2;
    pub const PROTOCOL_VERSION_NOT_SUPPORTED: u16 = 4;
    pub const AUTH_TYPE_NOT_RECOGNIZED: u16 = 8;
    pub const INVALID_CHECKSUM: u16 = 9;

    pub fn as_str(reason: u16) -> &'static str {
        match reason {
            NOT_SPECIFIED => "reason not specified",
            TEMPORARY_CONGESTION => "temporary congestion",
            LOCAL_LIMIT_EXCEEDED => "local limit exceeded",
            PROTOCOL_VERSION_NOT_SUPPORTED => "protocol version not supported",
            AUTH_TYPE_NOT_RECOGNIZED => "authentication type not recognized",
            INVALID_CHECKSUM => "invalid checksum",
            _ => "unknown reason",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BindNakPdu {
    pub reason: u16,
    /// Protocol versions the server does support
    pub versions: Vec<(u8, u8)>,
}

impl BindNakPdu {
    fn write(&self, w: &mut NdrWriter) {
        w.write_u16(self.reason);
        w.write_u8(self.versions.len() as u8);
        for &(major, minor) in &self.versions {
            w.write_u8(major);
            w.write_u8(minor);
        }
    }

    fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        let reason = r.read_u16()?;
        let mut versions = Vec::new();
        // version list is optional padding-sensitive trailing data
        if r.remaining() >= 1 {
            let n = r.read_u8()? as usize;
            if n * 2 > r.remaining() {
                return Err(RpcError::MalformedPdu("version list overruns PDU"));
            }
            for _ in 0..n {
                versions.push((r.read_u8()?, r.read_u8()?));
            }
        }
        Ok(Self { reason, versions })
    }
}

#[derive(Debug, Clone)]
pub struct RequestPdu {
    /// Total stub bytes remaining in this call, counted from this
    /// fragment; a hint for receiver buffer sizing
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    /// Object UUID routed to (DCOM IPID); drives the OBJECT_UUID flag
    pub object: Option<Uuid>,
    pub stub: Bytes,
}

impl RequestPdu {
    fn write(&self, w: &mut NdrWriter) {
        w.write_u32(self.alloc_hint);
        w.write_u16(self.context_id);
        w.write_u16(self.opnum);
        if let Some(object) = &self.object {
            w.write_uuid(object);
        }
        w.write_bytes(&self.stub);
    }

    fn read(r: &mut NdrReader<'_>, flags: PacketFlags) -> Result<Self> {
        let alloc_hint = r.read_u32()?;
        let context_id = r.read_u16()?;
        let opnum = r.read_u16()?;
        let object = if flags.contains(PacketFlags::OBJECT_UUID) {
            Some(r.read_uuid()?)
        } else {
            None
        };
        let stub = Bytes::copy_from_slice(r.read_bytes(r.remaining())?);
        Ok(Self {
            alloc_hint,
            context_id,
            opnum,
            object,
            stub,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResponsePdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub stub: Bytes,
}

impl ResponsePdu {
    fn write(&self, w: &mut NdrWriter) {
        w.write_u32(self.alloc_hint);
        w.write_u16(self.context_id);
        w.write_u8(self.cancel_count);
        w.write_u8(0);
        w.write_bytes(&self.stub);
    }

    fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        let alloc_hint = r.read_u32()?;
        let context_id = r.read_u16()?;
        let cancel_count = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let stub = Bytes::copy_from_slice(r.read_bytes(r.remaining())?);
        Ok(Self {
            alloc_hint,
            context_id,
            cancel_count,
            stub,
        })
    }
}

/// Fault status values (C706 appendix E, MS-RPCE 3.3.3.5.1)
pub mod fault_status {
    pub const UNSPECIFIED: u32 = 0x1C00_0009;
    pub const CONTEXT_MISMATCH: u32 = 0x1C00_001A;
    pub const OP_RNG_ERROR: u32 = 0x1C01_0002;
    pub const UNKNOWN_IF: u32 = 0x1C01_0003;
    pub const PROTOCOL_ERROR: u32 = 0x1C01_000B;
    pub const ACCESS_DENIED: u32 = 0x0000_0005;
}

#[derive(Debug, Clone)]
pub struct FaultPdu {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub status: u32,
    pub stub: Bytes,
}

impl FaultPdu {
    pub fn new(context_id: u16, status: u32) -> Self {
        Self {
            alloc_hint: 0,
            context_id,
            cancel_count: 0,
            status,
            stub: Bytes::new(),
        }
    }

    fn write(&self, w: &mut NdrWriter) {
        w.write_u32(self.alloc_hint);
        w.write_u16(self.context_id);
        w.write_u8(self.cancel_count);
        w.write_u8(0);
        w.write_u32(self.status);
        w.write_u32(0);
        w.write_bytes(&self.stub);
    }

    fn read(r: &mut NdrReader<'_>) -> Result<Self> {
        let alloc_hint = r.read_u32()?;
        let context_id = r.read_u16()?;
        let cancel_count = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let status = r.read_u32()?;
        let _reserved2 = r.read_u32()?;
        let stub = Bytes::copy_from_slice(r.read_bytes(r.remaining())?);
        Ok(Self {
            alloc_hint,
            context_id,
            cancel_count,
            status,
            stub,
        })
    }
}

/// PDU body, discriminated by the header packet type
#[derive(Debug, Clone)]
pub enum PduBody {
    Request(RequestPdu),
    Response(ResponsePdu),
    Fault(FaultPdu),
    Bind(BindPdu),
    BindAck(BindAckPdu),
    BindNak(BindNakPdu),
    AlterContext(BindPdu),
    AlterContextResponse(BindAckPdu),
    /// Final client authentication leg; the token rides the trailer
    Auth3,
    Shutdown,
    CancelRequest,
    Orphaned,
    Ping,
}

/// A complete protocol data unit
#[derive(Debug, Clone)]
pub struct Pdu {
    pub flags: PacketFlags,
    pub call_id: u32,
    pub drep: DataRepresentation,
    pub body: PduBody,
    pub auth: Option<AuthVerifier>,
}

impl Pdu {
    pub fn new(call_id: u32, body: PduBody) -> Self {
        Self {
            flags: PacketFlags::complete(),
            call_id,
            drep: DataRepresentation::default(),
            body,
            auth: None,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match &self.body {
            PduBody::Request(_) => PacketType::Request,
            PduBody::Response(_) => PacketType::Response,
            PduBody::Fault(_) => PacketType::Fault,
            PduBody::Bind(_) => PacketType::Bind,
            PduBody::BindAck(_) => PacketType::BindAck,
            PduBody::BindNak(_) => PacketType::BindNak,
            PduBody::AlterContext(_) => PacketType::AlterContext,
            PduBody::AlterContextResponse(_) => PacketType::AlterContextResponse,
            PduBody::Auth3 => PacketType::Auth3,
            PduBody::Shutdown => PacketType::Shutdown,
            PduBody::CancelRequest => PacketType::CancelRequest,
            PduBody::Orphaned => PacketType::Orphaned,
            PduBody::Ping => PacketType::Ping,
        }
    }

    fn effective_flags(&self) -> PacketFlags {
        let mut flags = self.flags;
        if let PduBody::Request(req) = &self.body {
            if req.object.is_some() {
                flags.insert(PacketFlags::OBJECT_UUID);
            }
        }
        flags
    }

    /// Encode to wire bytes, computing frag_length and auth_length
    pub fn encode(&self) -> Result<Bytes> {
        let mut w = NdrWriter::with_capacity(64);
        match &self.body {
            PduBody::Request(body) => body.write(&mut w),
            PduBody::Response(body) => body.write(&mut w),
            PduBody::Fault(body) => body.write(&mut w),
            PduBody::Bind(body) | PduBody::AlterContext(body) => body.write(&mut w),
            PduBody::BindAck(body) | PduBody::AlterContextResponse(body) => body.write(&mut w)?,
            PduBody::BindNak(body) => body.write(&mut w),
            PduBody::Auth3 => w.write_u32(0),
            PduBody::Shutdown | PduBody::CancelRequest | PduBody::Orphaned | PduBody::Ping => {}
        }
        let mut body = BytesMut::from(w.finish()?.as_ref());

        let mut auth_length = 0u16;
        if let Some(auth) = &self.auth {
            // the header is 16 bytes, so body-relative padding lands the
            // trailer on a PDU-relative 4-byte boundary too
            let pad = (4 - body.len() % 4) % 4;
            body.put_bytes(0, pad);
            auth.write_trailer(&mut body, pad as u8);
            auth_length =
                u16::try_from(auth.token.len()).map_err(|_| ndr::NdrError::IntegerOverflow)?;
        }

        let total = PduHeader::SIZE + body.len();
        let frag_length = u16::try_from(total).map_err(|_| RpcError::PduTooLarge {
            size: total,
            limit: u16::MAX as usize,
        })?;

        let header = PduHeader {
            packet_type: self.packet_type(),
            flags: self.effective_flags(),
            drep: self.drep,
            frag_length,
            auth_length,
            call_id: self.call_id,
        };
        let mut out = BytesMut::with_capacity(total);
        header.encode(&mut out);
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    /// Decode a complete PDU, validating frag_length against the input
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < PduHeader::SIZE {
            return Err(RpcError::MalformedPdu("short header"));
        }
        let mut raw = [0u8; PduHeader::SIZE];
        raw.copy_from_slice(&data[..PduHeader::SIZE]);
        let header = PduHeader::decode(&raw)?;
        if header.frag_length as usize != data.len() {
            return Err(RpcError::MalformedPdu("frag_length does not match PDU size"));
        }
        Self::decode_body(header, &data[PduHeader::SIZE..])
    }

    /// Decode the body given an already-parsed header. `body` is
    /// everything after the 16-byte header.
    pub fn decode_body(header: PduHeader, body: &[u8]) -> Result<Self> {
        let little_endian = header.drep.is_little_endian();

        // strip the security trailer before the stub is parsed
        let (payload, auth) = if header.auth_length > 0 {
            let trailer_len = AuthVerifier::HEADER_SIZE + header.auth_length as usize;
            if body.len() < trailer_len {
                return Err(RpcError::MalformedPdu("auth trailer overruns PDU"));
            }
            let trailer_at = body.len() - trailer_len;
            let (verifier, pad) = AuthVerifier::read_trailer(
                &body[trailer_at..],
                header.auth_length as usize,
                little_endian,
            )?;
            if trailer_at < pad {
                return Err(RpcError::MalformedPdu("auth padding overruns stub"));
            }
            (&body[..trailer_at - pad], Some(verifier))
        } else {
            (body, None)
        };

        let mut r = NdrReader::with_byte_order(payload, little_endian);
        let body = match header.packet_type {
            PacketType::Request => PduBody::Request(RequestPdu::read(&mut r, header.flags)?),
            PacketType::Response => PduBody::Response(ResponsePdu::read(&mut r)?),
            PacketType::Fault => PduBody::Fault(FaultPdu::read(&mut r)?),
            PacketType::Bind => PduBody::Bind(BindPdu::read(&mut r)?),
            PacketType::BindAck => PduBody::BindAck(BindAckPdu::read(&mut r)?),
            PacketType::BindNak => PduBody::BindNak(BindNakPdu::read(&mut r)?),
            PacketType::AlterContext => PduBody::AlterContext(BindPdu::read(&mut r)?),
            PacketType::AlterContextResponse => {
                PduBody::AlterContextResponse(BindAckPdu::read(&mut r)?)
            }
            PacketType::Auth3 => PduBody::Auth3,
            PacketType::Shutdown => PduBody::Shutdown,
            PacketType::CancelRequest => PduBody::CancelRequest,
            PacketType::Orphaned => PduBody::Orphaned,
            PacketType::Ping => PduBody::Ping,
        };

        Ok(Self {
            flags: header.flags,
            call_id: header.call_id,
            drep: header.drep,
            body,
            auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthLevel, AuthType};

    fn test_interface() -> SyntaxId {
        SyntaxId::new(
            Uuid::from_u128(0x12345678_1234_abcd_ef00_0123456789ab),
            1,
            0,
        )
    }

    #[test]
    fn test_header_reference_encoding() {
        let pdu = Pdu::new(
            7,
            PduBody::Request(RequestPdu {
                alloc_hint: 4,
                context_id: 0,
                opnum: 2,
                object: None,
                stub: Bytes::from_static(&[1, 2, 3, 4]),
            }),
        );
        let bytes = pdu.encode().unwrap();
        assert_eq!(
            &bytes[..16],
            &[
                5, 0, // version
                0,    // request
                0x03, // first | last
                0x10, 0, 0, 0, // little-endian / ASCII / IEEE
                28, 0, // frag_length
                0, 0, // auth_length
                7, 0, 0, 0, // call_id
            ]
        );
        // body: alloc_hint, context_id, opnum, stub
        assert_eq!(
            &bytes[16..],
            &[4, 0, 0, 0, 0, 0, 2, 0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn test_request_round_trip_with_object() {
        let object = Uuid::from_u128(0xaaaaaaaa_bbbb_cccc_dddd_eeeeeeeeeeee);
        let pdu = Pdu::new(
            42,
            PduBody::Request(RequestPdu {
                alloc_hint: 8,
                context_id: 1,
                opnum: 3,
                object: Some(object),
                stub: Bytes::from_static(b"stubdata"),
            }),
        );
        let bytes = pdu.encode().unwrap();
        let decoded = Pdu::decode(&bytes).unwrap();
        assert!(decoded.flags.contains(PacketFlags::OBJECT_UUID));
        match decoded.body {
            PduBody::Request(req) => {
                assert_eq!(req.object, Some(object));
                assert_eq!(req.opnum, 3);
                assert_eq!(req.context_id, 1);
                assert_eq!(req.stub.as_ref(), b"stubdata");
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn test_bind_round_trip() {
        let pdu = Pdu::new(
            1,
            PduBody::Bind(BindPdu {
                max_xmit_frag: 4280,
                max_recv_frag: 4280,
                assoc_group_id: 0,
                contexts: vec![ContextElement::new(0, test_interface())],
            }),
        );
        let bytes = pdu.encode().unwrap();
        let decoded = Pdu::decode(&bytes).unwrap();
        match decoded.body {
            PduBody::Bind(bind) => {
                assert_eq!(bind.max_xmit_frag, 4280);
                assert_eq!(bind.contexts.len(), 1);
                assert_eq!(bind.contexts[0].abstract_syntax, test_interface());
                assert_eq!(bind.contexts[0].transfer_syntaxes, vec![ndr_transfer_syntax()]);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn test_bind_ack_secondary_addr_alignment() {
        // odd-length secondary address forces the 4-byte re-alignment
        // before the result list
        let pdu = Pdu::new(
            1,
            PduBody::BindAck(BindAckPdu {
                max_xmit_frag: 4280,
                max_recv_frag: 4280,
                assoc_group_id: 0x1111,
                secondary_addr: "135".into(),
                results: vec![ContextResult::accepted(ndr_transfer_syntax())],
            }),
        );
        let bytes = pdu.encode().unwrap();
        let decoded = Pdu::decode(&bytes).unwrap();
        match decoded.body {
            PduBody::BindAck(ack) => {
                assert_eq!(ack.secondary_addr, "135");
                assert_eq!(ack.assoc_group_id, 0x1111);
                assert_eq!(ack.results.len(), 1);
                assert_eq!(ack.results[0].result, ContextResultCode::Acceptance);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn test_fault_round_trip() {
        let pdu = Pdu::new(
            9,
            PduBody::Fault(FaultPdu::new(0, fault_status::OP_RNG_ERROR)),
        );
        let bytes = pdu.encode().unwrap();
        let decoded = Pdu::decode(&bytes).unwrap();
        match decoded.body {
            PduBody::Fault(fault) => assert_eq!(fault.status, fault_status::OP_RNG_ERROR),
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn test_auth_trailer_round_trip() {
        let mut pdu = Pdu::new(
            5,
            PduBody::Request(RequestPdu {
                alloc_hint: 5,
                context_id: 0,
                opnum: 0,
                object: None,
                stub: Bytes::from_static(&[1, 2, 3, 4, 5]), // forces 3 pad bytes
            }),
        );
        pdu.auth = Some(AuthVerifier {
            auth_type: AuthType::Ntlm,
            level: AuthLevel::PktIntegrity,
            context_id: 0x99,
            token: Bytes::from_static(&[0xAA; 16]),
        });
        let bytes = pdu.encode().unwrap();

        let header = {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&bytes[..16]);
            PduHeader::decode(&raw).unwrap()
        };
        assert_eq!(header.auth_length, 16);

        let decoded = Pdu::decode(&bytes).unwrap();
        let auth = decoded.auth.expect("trailer survives");
        assert_eq!(auth.auth_type, AuthType::Ntlm);
        assert_eq!(auth.level, AuthLevel::PktIntegrity);
        assert_eq!(auth.context_id, 0x99);
        assert_eq!(auth.token.as_ref(), &[0xAA; 16]);
        match decoded.body {
            // padding stripped
            PduBody::Request(req) => assert_eq!(req.stub.as_ref(), &[1, 2, 3, 4, 5]),
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn test_frag_length_mismatch_rejected() {
        let pdu = Pdu::new(1, PduBody::Shutdown);
        let mut bytes = BytesMut::from(pdu.encode().unwrap().as_ref());
        bytes.extend_from_slice(&[0, 0]); // trailing garbage
        assert!(matches!(
            Pdu::decode(&bytes),
            Err(RpcError::MalformedPdu(_))
        ));
    }

    #[test]
    fn test_unknown_packet_type_rejected() {
        let pdu = Pdu::new(1, PduBody::Shutdown);
        let mut bytes = BytesMut::from(pdu.encode().unwrap().as_ref());
        bytes[2] = 99;
        assert!(matches!(
            Pdu::decode(&bytes),
            Err(RpcError::UnknownPacketType(99))
        ));
    }

    #[test]
    fn test_bind_nak_reason() {
        let pdu = Pdu::new(
            3,
            PduBody::BindNak(BindNakPdu {
                reason: bind_nak_reason::PROTOCOL_VERSION_NOT_SUPPORTED,
                versions: vec![(5, 0)],
            }),
        );
        let bytes = pdu.encode().unwrap();
        let decoded = Pdu::decode(&bytes).unwrap();
        match decoded.body {
            PduBody::BindNak(nak) => {
                assert_eq!(
                    bind_nak_reason::as_str(nak.reason),
                    "protocol version not supported"
                );
                assert_eq!(nak.versions, vec![(5, 0)]);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }
}
