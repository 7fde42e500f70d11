//! PDU framing over a caller-supplied byte stream
//!
//! The stack does not open sockets or pipes itself; anything
//! implementing [`Transport`] works. Framing reads the 16-byte header,
//! validates `frag_length` against the local receive limit, then reads
//! exactly the rest of the PDU.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{Result, RpcError};
use crate::pdu::{Pdu, PduHeader};

/// Default fragment size, negotiated down from here
pub const DEFAULT_MAX_FRAG: u16 = 4280;

/// A byte stream carrying PDUs. Blanket-implemented; supply a TCP
/// stream, a named pipe, a duplex pair in tests, anything.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Transport for T {}

/// Reads whole PDUs from the receive half of a transport
pub struct PduReader<R> {
    io: R,
    max_frag: u16,
}

impl<R: AsyncRead + Unpin> PduReader<R> {
    pub fn new(io: R, max_frag: u16) -> Self {
        Self { io, max_frag }
    }

    pub async fn read_pdu(&mut self) -> Result<Pdu> {
        let mut header_raw = [0u8; PduHeader::SIZE];
        match self.io.read_exact(&mut header_raw).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(RpcError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }
        let header = PduHeader::decode(&header_raw)?;
        let frag_length = header.frag_length as usize;
        if frag_length < PduHeader::SIZE {
            return Err(RpcError::MalformedPdu("frag_length shorter than header"));
        }
        if frag_length > self.max_frag as usize {
            return Err(RpcError::PduTooLarge {
                size: frag_length,
                limit: self.max_frag as usize,
            });
        }
        let mut body = vec![0u8; frag_length - PduHeader::SIZE];
        self.io.read_exact(&mut body).await?;
        trace!(
            packet_type = ?header.packet_type,
            call_id = header.call_id,
            frag_length,
            "received PDU"
        );
        Pdu::decode_body(header, &body)
    }
}

/// Writes whole PDUs to the send half of a transport
pub struct PduWriter<W> {
    io: W,
}

impl<W: AsyncWrite + Unpin> PduWriter<W> {
    pub fn new(io: W) -> Self {
        Self { io }
    }

    pub async fn write_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        let bytes = pdu.encode()?;
        trace!(
            packet_type = ?pdu.packet_type(),
            call_id = pdu.call_id,
            frag_length = bytes.len(),
            "sending PDU"
        );
        self.io.write_all(&bytes).await?;
        self.io.flush().await?;
        Ok(())
    }
}
