//! Connection-oriented DCE RPC (C706 / MS-RPCE)
//!
//! PDU codec, fragmentation, pluggable authentication and an async
//! client and server over any byte-stream transport.
//!
//! # Client
//!
//! ```no_run
//! use dcerpc::{ConnectionBuilder, SyntaxId};
//! use bytes::Bytes;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> dcerpc::Result<()> {
//!     let interface = SyntaxId::new(
//!         Uuid::parse_str("12345678-1234-1234-1234-123456789012").unwrap(),
//!         1,
//!         0,
//!     );
//!
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:12345").await?;
//!     let conn = ConnectionBuilder::new().attach(stream);
//!     let context_id = conn.bind(interface).await?;
//!
//!     let reply = conn.invoke(context_id, 0, None, Bytes::from("hello")).await?;
//!     assert_eq!(reply.as_ref(), b"hello");
//!     Ok(())
//! }
//! ```
//!
//! # Server
//!
//! ```no_run
//! use dcerpc::{DispatchTable, RpcServer, SyntaxId};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> dcerpc::Result<()> {
//!     let interface = SyntaxId::new(
//!         Uuid::parse_str("12345678-1234-1234-1234-123456789012").unwrap(),
//!         1,
//!         0,
//!     );
//!     let mut dispatch = DispatchTable::new();
//!     dispatch.register(0, |stub| async move { Ok(stub) });
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:12345").await?;
//!     let server = RpcServer::new(interface, dispatch);
//!     let (stream, _) = listener.accept().await?;
//!     server.serve(stream).await
//! }
//! ```

pub mod auth;
pub mod connection;
pub mod error;
pub mod fragment;
pub mod operation;
pub mod pdu;
pub mod server;
#[cfg(windows)]
pub mod sspi;
pub mod transport;

pub use auth::{
    AnonymousProvider, AuthLevel, AuthType, AuthVerifier, NegotiateStep, SecurityContext,
    SecurityProvider,
};
pub use connection::{Connection, ConnectionBuilder, ConnectionState, SubConnection};
pub use error::{Result, RpcError};
pub use fragment::{split_stub, Reassembler, StubFragment};
pub use operation::{call, call_prepared, DispatchTable, Operation, Prepare, StubHandler};
pub use pdu::{
    bind_nak_reason, fault_status, ndr_transfer_syntax, BindAckPdu, BindNakPdu, BindPdu,
    ContextElement, ContextResult, ContextResultCode, DataRepresentation, FaultPdu, PacketFlags,
    PacketType, Pdu, PduBody, PduHeader, RequestPdu, ResponsePdu, SyntaxId,
    NDR_TRANSFER_SYNTAX_UUID,
};
pub use server::RpcServer;
#[cfg(windows)]
pub use sspi::SspiProvider;
pub use transport::{PduReader, PduWriter, Transport, DEFAULT_MAX_FRAG};
