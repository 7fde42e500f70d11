//! ORPC calls against an in-memory RPC server

use std::sync::Arc;

use bytes::Bytes;
use dcerpc::{ConnectionBuilder, DispatchTable, RpcServer, SyntaxId};
use dcom::{
    bind_ipid, marshal_interface, sorf, unmarshal_interface, DualStringArray, Ipid,
    ObjRef, ObjectIdentity, Oid, OrpcThat, OrpcThis, Oxid, StdObjRef,
};
use ndr::{NdrReader, NdrWriter};
use uuid::Uuid;

fn test_iid() -> Uuid {
    Uuid::from_u128(0x00000000_0000_0000_C000_000000000046)
}

fn test_identity() -> ObjectIdentity {
    ObjectIdentity {
        oxid: Oxid(0x11),
        oid: Oid(0x22),
        ipid: Ipid(Uuid::from_u128(0x33)),
        iid: test_iid(),
    }
}

/// Handler that checks the ORPC request header and answers with
/// ORPCTHAT followed by the causality id it saw
fn orpc_echo_dispatch() -> DispatchTable {
    let mut table = DispatchTable::new();
    table.register(0, |stub: Bytes| async move {
        let mut r = NdrReader::new(&stub);
        let this = OrpcThis::read(&mut r).map_err(|_| dcerpc::RpcError::MalformedPdu("orpcthis"))?;
        let payload = r.read_bytes(r.remaining()).map_err(dcerpc::RpcError::from)?.to_vec();

        let mut w = NdrWriter::new();
        OrpcThat::default().write(&mut w);
        w.flush_deferred().map_err(dcerpc::RpcError::from)?;
        w.write_uuid(&this.causality_id);
        w.write_bytes(&payload);
        Ok(w.finish().map_err(dcerpc::RpcError::from)?)
    });
    table
}

#[tokio::test]
async fn test_bound_client_round_trip() {
    let identity = test_identity();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = RpcServer::new(SyntaxId::new(identity.iid, 0, 0), orpc_echo_dispatch());
    tokio::spawn(async move { server.serve(server_io).await });

    let conn = Arc::new(ConnectionBuilder::new().attach(client_io));
    let client = bind_ipid(conn, identity).await.unwrap();

    let reply = client.invoke(0, Bytes::from_static(b"args")).await.unwrap();
    let mut r = NdrReader::new(&reply);
    let seen_causality = r.read_uuid().unwrap();
    assert_eq!(seen_causality, client.causality_id());
    assert_eq!(r.read_bytes(4).unwrap(), b"args");
}

#[tokio::test]
async fn test_causality_id_is_stable_across_calls() {
    let identity = test_identity();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = RpcServer::new(SyntaxId::new(identity.iid, 0, 0), orpc_echo_dispatch());
    tokio::spawn(async move { server.serve(server_io).await });

    let conn = Arc::new(ConnectionBuilder::new().attach(client_io));
    let client = bind_ipid(conn, identity).await.unwrap();

    let first = client.invoke(0, Bytes::new()).await.unwrap();
    let second = client.invoke(0, Bytes::new()).await.unwrap();
    let causality_of = |reply: &Bytes| NdrReader::new(reply).read_uuid().unwrap();
    assert_eq!(causality_of(&first), causality_of(&second));
    assert_eq!(causality_of(&first), client.causality_id());
}

/// Raw server half: answer the bind, then inspect the request header
/// fields a dispatch handler never sees.
#[tokio::test]
async fn test_request_is_addressed_at_the_ipid() {
    use dcerpc::{
        ndr_transfer_syntax, BindAckPdu, ContextResult, Pdu, PduBody, PduReader, PduWriter,
        ResponsePdu, DEFAULT_MAX_FRAG,
    };

    let identity = test_identity();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let (rx, tx) = tokio::io::split(server_io);
        let mut reader = PduReader::new(rx, DEFAULT_MAX_FRAG);
        let mut writer = PduWriter::new(tx);

        let bind = reader.read_pdu().await.unwrap();
        let ack = Pdu::new(
            bind.call_id,
            PduBody::BindAck(BindAckPdu {
                max_xmit_frag: DEFAULT_MAX_FRAG,
                max_recv_frag: DEFAULT_MAX_FRAG,
                assoc_group_id: 1,
                secondary_addr: String::new(),
                results: vec![ContextResult::accepted(ndr_transfer_syntax())],
            }),
        );
        writer.write_pdu(&ack).await.unwrap();

        let request = reader.read_pdu().await.unwrap();
        let PduBody::Request(req) = request.body else {
            panic!("expected request");
        };
        // the object uuid in the header is the IPID being called
        assert_eq!(req.object, Some(Uuid::from_u128(0x33)));
        // NdrReader/NdrWriter are not Send; keep them scoped so they are
        // dropped before the final await in this spawned task
        {
            let mut r = NdrReader::new(&req.stub);
            OrpcThis::read(&mut r).unwrap();
        }

        let stub = {
            let mut w = NdrWriter::new();
            OrpcThat::default().write(&mut w);
            w.finish().unwrap()
        };
        let reply = Pdu::new(
            request.call_id,
            PduBody::Response(ResponsePdu {
                alloc_hint: 0,
                context_id: req.context_id,
                cancel_count: 0,
                stub,
            }),
        );
        writer.write_pdu(&reply).await.unwrap();
    });

    let conn = Arc::new(ConnectionBuilder::new().attach(client_io));
    let client = bind_ipid(conn, identity).await.unwrap();
    let reply = client.invoke(7, Bytes::new()).await.unwrap();
    assert!(reply.is_empty());
    server.await.unwrap();
}

#[tokio::test]
async fn test_unmarshaled_objref_feeds_bind_ipid() {
    let std = StdObjRef {
        flags: sorf::NOPING,
        public_refs: 1,
        oxid: Oxid(0xA1),
        oid: Oid(0xB2),
        ipid: Ipid(Uuid::from_u128(0xC3)),
    };
    let objref = ObjRef::standard(
        test_iid(),
        std,
        DualStringArray::with_tcp_binding("127.0.0.1"),
    );

    // the reference travels as a conformant blob inside some payload
    let mut w = NdrWriter::new();
    marshal_interface(&mut w, &objref).unwrap();
    let wire = w.finish().unwrap();
    let mut r = NdrReader::new(&wire);
    let received = unmarshal_interface(&mut r).unwrap();
    let identity = received.identity().unwrap();
    assert_eq!(identity.ipid, Ipid(Uuid::from_u128(0xC3)));

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = RpcServer::new(SyntaxId::new(identity.iid, 0, 0), orpc_echo_dispatch());
    tokio::spawn(async move { server.serve(server_io).await });

    let conn = Arc::new(ConnectionBuilder::new().attach(client_io));
    let client = bind_ipid(conn, identity).await.unwrap();
    let reply = client.invoke(0, Bytes::from_static(b"hi")).await.unwrap();
    let mut r = NdrReader::new(&reply);
    r.read_uuid().unwrap();
    assert_eq!(r.read_bytes(2).unwrap(), b"hi");
}
