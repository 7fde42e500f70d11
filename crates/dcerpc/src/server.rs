//! Single-connection RPC server loop
//!
//! [`RpcServer::serve`] drives one transport: it answers bind and
//! alter-context negotiation, reassembles fragmented requests, runs the
//! dispatch table and streams fragmented responses back. Requests that
//! cannot be executed come back as faults with DID_NOT_EXECUTE set.
//!
//! Only anonymous peers are served; a bind proposing an authentication
//! trailer is refused.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::io::{ReadHalf, WriteHalf};
use tracing::{debug, warn};

use crate::error::{Result, RpcError};
use crate::fragment::{split_stub, Reassembler};
use crate::operation::DispatchTable;
use crate::pdu::{
    bind_nak_reason, fault_status, ndr_transfer_syntax, BindAckPdu, BindNakPdu, BindPdu,
    ContextResult, FaultPdu, Pdu, PduBody, PduHeader, PacketFlags, RequestPdu, ResponsePdu,
    SyntaxId,
};
use crate::transport::{PduReader, PduWriter, Transport, DEFAULT_MAX_FRAG};

/// alloc_hint + context_id + cancel_count + reserved
const RESPONSE_FIXED_SIZE: usize = 8;

/// Smallest fragment size a peer may propose; below this a header plus
/// a response body cannot fit in one PDU
const MIN_FRAG_SIZE: u16 = 64;

/// Serves one interface on one connection at a time
pub struct RpcServer {
    interface: SyntaxId,
    dispatch: DispatchTable,
    max_frag: u16,
}

impl RpcServer {
    pub fn new(interface: SyntaxId, dispatch: DispatchTable) -> Self {
        Self {
            interface,
            dispatch,
            max_frag: DEFAULT_MAX_FRAG,
        }
    }

    pub fn max_frag(mut self, max_frag: u16) -> Self {
        self.max_frag = max_frag;
        self
    }

    /// Run the request loop until the peer disconnects
    pub async fn serve<T: Transport + 'static>(&self, transport: T) -> Result<()> {
        let (rx, tx) = tokio::io::split(transport);
        let mut session = Session {
            server: self,
            reader: PduReader::new(rx, self.max_frag),
            writer: PduWriter::new(tx),
            contexts: HashMap::new(),
            assemblers: HashMap::new(),
            max_xmit: self.max_frag,
        };
        session.run().await
    }
}

struct Session<'a, T> {
    server: &'a RpcServer,
    reader: PduReader<ReadHalf<T>>,
    writer: PduWriter<WriteHalf<T>>,
    /// Presentation contexts accepted on this connection
    contexts: HashMap<u16, SyntaxId>,
    /// In-progress fragmented requests, keyed by call id
    assemblers: HashMap<u32, Reassembler>,
    /// Largest PDU the peer accepts, clamped at bind time
    max_xmit: u16,
}

impl<T: Transport> Session<'_, T> {
    async fn run(&mut self) -> Result<()> {
        loop {
            let pdu = match self.reader.read_pdu().await {
                Ok(pdu) => pdu,
                Err(RpcError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            let call_id = pdu.call_id;
            match pdu.body {
                PduBody::Bind(bind) => self.process_bind(call_id, bind, pdu.auth.is_some(), false).await?,
                PduBody::AlterContext(bind) => {
                    self.process_bind(call_id, bind, pdu.auth.is_some(), true).await?
                }
                PduBody::Request(req) => self.process_request(call_id, pdu.flags, req).await?,
                PduBody::Auth3 => {
                    // anonymous connections have no third leg; tolerate it
                    debug!(call_id, "ignoring auth3");
                }
                PduBody::Orphaned | PduBody::CancelRequest => {
                    debug!(call_id, "call abandoned by client");
                    self.assemblers.remove(&call_id);
                }
                PduBody::Ping => {}
                PduBody::Shutdown => return Ok(()),
                other => {
                    warn!(call_id, body = ?other, "unexpected PDU on server connection");
                    self.send_fault(call_id, 0, fault_status::PROTOCOL_ERROR).await?;
                }
            }
        }
    }

    async fn process_bind(
        &mut self,
        call_id: u32,
        bind: BindPdu,
        has_auth: bool,
        alter: bool,
    ) -> Result<()> {
        if has_auth {
            let nak = Pdu::new(
                call_id,
                PduBody::BindNak(BindNakPdu {
                    reason: bind_nak_reason::AUTH_TYPE_NOT_RECOGNIZED,
                    versions: vec![],
                }),
            );
            self.writer.write_pdu(&nak).await?;
            return Err(RpcError::Unsupported("authenticated bind"));
        }
        if bind.max_xmit_frag < MIN_FRAG_SIZE || bind.max_recv_frag < MIN_FRAG_SIZE {
            warn!(
                call_id,
                max_xmit = bind.max_xmit_frag,
                max_recv = bind.max_recv_frag,
                "rejecting bind with fragment size below minimum"
            );
            let nak = Pdu::new(
                call_id,
                PduBody::BindNak(BindNakPdu {
                    reason: bind_nak_reason::LOCAL_LIMIT_EXCEEDED,
                    versions: vec![],
                }),
            );
            self.writer.write_pdu(&nak).await?;
            return Err(RpcError::MalformedPdu("fragment size below minimum"));
        }

        let ndr = ndr_transfer_syntax();
        let mut results = Vec::with_capacity(bind.contexts.len());
        for ctx in &bind.contexts {
            let interface_ok = ctx.abstract_syntax == self.server.interface;
            let ndr_ok = ctx.transfer_syntaxes.contains(&ndr);
            if interface_ok && ndr_ok {
                debug!(context_id = ctx.context_id, interface = %ctx.abstract_syntax, "context accepted");
                self.contexts.insert(ctx.context_id, ctx.abstract_syntax);
                results.push(ContextResult::accepted(ndr));
            } else {
                debug!(context_id = ctx.context_id, interface = %ctx.abstract_syntax, "context rejected");
                results.push(ContextResult::provider_rejected(0));
            }
        }

        let max_xmit = bind.max_xmit_frag.min(self.server.max_frag);
        let max_recv = bind.max_recv_frag.min(self.server.max_frag);
        self.max_xmit = max_recv;
        let ack = BindAckPdu {
            max_xmit_frag: max_xmit,
            max_recv_frag: max_recv,
            assoc_group_id: if bind.assoc_group_id != 0 {
                bind.assoc_group_id
            } else {
                1
            },
            secondary_addr: String::new(),
            results,
        };
        let body = if alter {
            PduBody::AlterContextResponse(ack)
        } else {
            PduBody::BindAck(ack)
        };
        self.writer.write_pdu(&Pdu::new(call_id, body)).await
    }

    async fn process_request(
        &mut self,
        call_id: u32,
        flags: PacketFlags,
        req: RequestPdu,
    ) -> Result<()> {
        if !self.contexts.contains_key(&req.context_id) {
            warn!(call_id, context_id = req.context_id, "request on unbound context");
            self.assemblers.remove(&call_id);
            return self
                .send_fault(call_id, req.context_id, fault_status::CONTEXT_MISMATCH)
                .await;
        }

        // fast path: unfragmented request
        let stub = if flags.is_first() && flags.is_last() {
            req.stub
        } else {
            let assembler = self
                .assemblers
                .entry(call_id)
                .or_insert_with(|| Reassembler::new(call_id));
            match assembler.push(call_id, flags, req.context_id, &req.stub) {
                Ok(Some(stub)) => {
                    self.assemblers.remove(&call_id);
                    stub
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(call_id, error = %e, "dropping malformed fragment stream");
                    self.assemblers.remove(&call_id);
                    return self
                        .send_fault(call_id, req.context_id, fault_status::PROTOCOL_ERROR)
                        .await;
                }
            }
        };

        let Some(handler) = self.server.dispatch.handler(req.opnum) else {
            warn!(call_id, opnum = req.opnum, "opnum out of range");
            return self
                .send_fault(call_id, req.context_id, fault_status::OP_RNG_ERROR)
                .await;
        };

        debug!(call_id, opnum = req.opnum, stub_len = stub.len(), "dispatching request");
        match handler(stub).await {
            Ok(reply) => self.send_response(call_id, req.context_id, reply).await,
            Err(e) => {
                warn!(call_id, opnum = req.opnum, error = %e, "handler failed");
                self.send_fault(call_id, req.context_id, fault_status::UNSPECIFIED)
                    .await
            }
        }
    }

    async fn send_response(&mut self, call_id: u32, context_id: u16, stub: Bytes) -> Result<()> {
        let max_stub = (self.max_xmit as usize)
            .saturating_sub(PduHeader::SIZE + RESPONSE_FIXED_SIZE)
            .max(1);
        for frag in split_stub(stub, max_stub) {
            let mut pdu = Pdu::new(
                call_id,
                PduBody::Response(ResponsePdu {
                    alloc_hint: frag.alloc_hint,
                    context_id,
                    cancel_count: 0,
                    stub: frag.data,
                }),
            );
            pdu.flags = frag.flags;
            self.writer.write_pdu(&pdu).await?;
        }
        Ok(())
    }

    async fn send_fault(&mut self, call_id: u32, context_id: u16, status: u32) -> Result<()> {
        let mut pdu = Pdu::new(call_id, PduBody::Fault(FaultPdu::new(context_id, status)));
        pdu.flags.insert(PacketFlags::DID_NOT_EXECUTE);
        self.writer.write_pdu(&pdu).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::ContextElement;
    use uuid::Uuid;

    fn test_interface() -> SyntaxId {
        SyntaxId::new(Uuid::from_u128(0x0badf00d_0001_4000_8000_000000000001), 1, 0)
    }

    fn echo_dispatch() -> DispatchTable {
        let mut table = DispatchTable::new();
        table.register(0, |stub| async move { Ok(stub) });
        table
    }

    async fn bind(
        writer: &mut PduWriter<WriteHalf<tokio::io::DuplexStream>>,
        reader: &mut PduReader<ReadHalf<tokio::io::DuplexStream>>,
    ) {
        let pdu = Pdu::new(
            1,
            PduBody::Bind(BindPdu {
                max_xmit_frag: DEFAULT_MAX_FRAG,
                max_recv_frag: DEFAULT_MAX_FRAG,
                assoc_group_id: 0,
                contexts: vec![ContextElement::new(0, test_interface())],
            }),
        );
        writer.write_pdu(&pdu).await.unwrap();
        let ack = reader.read_pdu().await.unwrap();
        match ack.body {
            PduBody::BindAck(ack) => {
                assert_eq!(
                    ack.results[0].result,
                    crate::pdu::ContextResultCode::Acceptance
                );
                assert_eq!(ack.results[0].transfer_syntax, ndr_transfer_syntax());
            }
            other => panic!("expected bind_ack, got {other:?}"),
        }
    }

    fn spawn_server(transport: tokio::io::DuplexStream) -> tokio::task::JoinHandle<Result<()>> {
        let server = RpcServer::new(test_interface(), echo_dispatch());
        tokio::spawn(async move { server.serve(transport).await })
    }

    #[tokio::test]
    async fn test_bind_then_echo() {
        let (client, server) = tokio::io::duplex(16384);
        let task = spawn_server(server);

        let (rx, tx) = tokio::io::split(client);
        let mut writer = PduWriter::new(tx);
        let mut reader = PduReader::new(rx, DEFAULT_MAX_FRAG);
        bind(&mut writer, &mut reader).await;

        let req = Pdu::new(
            2,
            PduBody::Request(RequestPdu {
                alloc_hint: 5,
                context_id: 0,
                opnum: 0,
                object: None,
                stub: Bytes::from_static(b"hello"),
            }),
        );
        writer.write_pdu(&req).await.unwrap();
        let reply = reader.read_pdu().await.unwrap();
        match reply.body {
            PduBody::Response(resp) => assert_eq!(resp.stub.as_ref(), b"hello"),
            other => panic!("expected response, got {other:?}"),
        }

        drop(writer);
        drop(reader);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_opnum_faults() {
        let (client, server) = tokio::io::duplex(16384);
        let _task = spawn_server(server);

        let (rx, tx) = tokio::io::split(client);
        let mut writer = PduWriter::new(tx);
        let mut reader = PduReader::new(rx, DEFAULT_MAX_FRAG);
        bind(&mut writer, &mut reader).await;

        let req = Pdu::new(
            2,
            PduBody::Request(RequestPdu {
                alloc_hint: 0,
                context_id: 0,
                opnum: 42,
                object: None,
                stub: Bytes::new(),
            }),
        );
        writer.write_pdu(&req).await.unwrap();
        let reply = reader.read_pdu().await.unwrap();
        assert!(reply.flags.contains(PacketFlags::DID_NOT_EXECUTE));
        match reply.body {
            PduBody::Fault(fault) => assert_eq!(fault.status, fault_status::OP_RNG_ERROR),
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_without_bind_faults() {
        let (client, server) = tokio::io::duplex(16384);
        let _task = spawn_server(server);

        let (rx, tx) = tokio::io::split(client);
        let mut writer = PduWriter::new(tx);
        let mut reader = PduReader::new(rx, DEFAULT_MAX_FRAG);

        let req = Pdu::new(
            1,
            PduBody::Request(RequestPdu {
                alloc_hint: 0,
                context_id: 9,
                opnum: 0,
                object: None,
                stub: Bytes::new(),
            }),
        );
        writer.write_pdu(&req).await.unwrap();
        let reply = reader.read_pdu().await.unwrap();
        match reply.body {
            PduBody::Fault(fault) => assert_eq!(fault.status, fault_status::CONTEXT_MISMATCH),
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_interface_rejected() {
        let (client, server) = tokio::io::duplex(16384);
        let _task = spawn_server(server);

        let (rx, tx) = tokio::io::split(client);
        let mut writer = PduWriter::new(tx);
        let mut reader = PduReader::new(rx, DEFAULT_MAX_FRAG);

        let other_if = SyntaxId::new(Uuid::from_u128(0xdeadbeef), 1, 0);
        let pdu = Pdu::new(
            1,
            PduBody::Bind(BindPdu {
                max_xmit_frag: DEFAULT_MAX_FRAG,
                max_recv_frag: DEFAULT_MAX_FRAG,
                assoc_group_id: 0,
                contexts: vec![ContextElement::new(0, other_if)],
            }),
        );
        writer.write_pdu(&pdu).await.unwrap();
        let ack = reader.read_pdu().await.unwrap();
        match ack.body {
            PduBody::BindAck(ack) => {
                assert_eq!(
                    ack.results[0].result,
                    crate::pdu::ContextResultCode::ProviderRejection
                );
            }
            other => panic!("expected bind_ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bind_below_minimum_frag_size_rejected() {
        let (client, server) = tokio::io::duplex(16384);
        let task = spawn_server(server);

        let (rx, tx) = tokio::io::split(client);
        let mut writer = PduWriter::new(tx);
        let mut reader = PduReader::new(rx, DEFAULT_MAX_FRAG);

        // a receive limit this small cannot hold a response header
        let pdu = Pdu::new(
            1,
            PduBody::Bind(BindPdu {
                max_xmit_frag: DEFAULT_MAX_FRAG,
                max_recv_frag: 10,
                assoc_group_id: 0,
                contexts: vec![ContextElement::new(0, test_interface())],
            }),
        );
        writer.write_pdu(&pdu).await.unwrap();
        let reply = reader.read_pdu().await.unwrap();
        match reply.body {
            PduBody::BindNak(nak) => {
                assert_eq!(nak.reason, bind_nak_reason::LOCAL_LIMIT_EXCEEDED)
            }
            other => panic!("expected bind_nak, got {other:?}"),
        }
        // the serve task refuses the connection instead of panicking
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_fragmented_request_reassembled() {
        let (client, server) = tokio::io::duplex(65536);
        let _task = spawn_server(server);

        let (rx, tx) = tokio::io::split(client);
        let mut writer = PduWriter::new(tx);
        let mut reader = PduReader::new(rx, DEFAULT_MAX_FRAG);
        bind(&mut writer, &mut reader).await;

        let stub = Bytes::from(vec![9u8; 3000]);
        for frag in split_stub(stub.clone(), 1000) {
            let mut pdu = Pdu::new(
                2,
                PduBody::Request(RequestPdu {
                    alloc_hint: frag.alloc_hint,
                    context_id: 0,
                    opnum: 0,
                    object: None,
                    stub: frag.data,
                }),
            );
            pdu.flags = frag.flags;
            writer.write_pdu(&pdu).await.unwrap();
        }

        // echo of 3000 bytes comes back unfragmented (fits in 4280)
        let reply = reader.read_pdu().await.unwrap();
        match reply.body {
            PduBody::Response(resp) => assert_eq!(resp.stub, stub),
            other => panic!("expected response, got {other:?}"),
        }
    }
}
