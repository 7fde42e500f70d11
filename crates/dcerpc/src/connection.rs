//! Client connection: binding state machine and pipelined calls
//!
//! A [`Connection`] owns both halves of a caller-supplied transport. A
//! background task reads PDUs and routes them by call id through a
//! demux table, so any number of calls can be in flight at once and
//! responses complete their callers regardless of arrival order.
//!
//! State machine: `Unbound → Binding → Bound`, with `AlteringContext`
//! as a transient while an additional presentation context is
//! negotiated, and `Closed` once the transport dies or `close` runs.
//!
//! When a security provider is configured, the first negotiation token
//! rides the bind PDU, continuation legs run over alter_context, and a
//! final one-way token goes out as auth3. After that, calls at
//! `PktIntegrity`/`PktPrivacy` are signed/sealed per fragment with the
//! security context locked across wrap+send so sequence numbers match
//! PDU order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex as SyncMutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::{AuthLevel, AuthVerifier, NegotiateStep, SecurityContext, SecurityProvider};
use crate::error::{Result, RpcError};
use crate::fragment::{split_stub, Reassembler};
use crate::pdu::{
    bind_nak_reason, BindAckPdu, BindPdu, ContextElement, ContextResultCode, PacketFlags, Pdu,
    PduBody, PduHeader, RequestPdu, SyntaxId,
};
use crate::transport::{PduReader, PduWriter, Transport, DEFAULT_MAX_FRAG};

const REQUEST_FIXED_SIZE: usize = 8;
const OBJECT_UUID_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unbound,
    Binding,
    Bound,
    AlteringContext,
    Closed,
}

impl ConnectionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Binding => "binding",
            Self::Bound => "bound",
            Self::AlteringContext => "altering context",
            Self::Closed => "closed",
        }
    }
}

/// What the reader task hands back for one call id
enum Reply {
    Stub(Bytes),
    Control(Box<Pdu>),
}

struct Pending {
    tx: oneshot::Sender<Result<Reply>>,
    assembler: Option<Reassembler>,
}

struct Shared {
    pending: SyncMutex<HashMap<u32, Pending>>,
    state: SyncMutex<ConnectionState>,
    security: Option<Mutex<SecurityContext>>,
}

impl Shared {
    fn complete(&self, call_id: u32, result: Result<Reply>) {
        let entry = self.pending.lock().remove(&call_id);
        match entry {
            Some(p) => {
                let _ = p.tx.send(result);
            }
            None => warn!(call_id, "reply for a call nobody is waiting on"),
        }
    }

    fn fail_all_pending(&self) {
        let mut pending = self.pending.lock();
        for (_, p) in pending.drain() {
            let _ = p.tx.send(Err(RpcError::ConnectionClosed));
        }
    }
}

struct Negotiated {
    max_xmit_frag: u16,
    max_recv_frag: u16,
    assoc_group_id: u32,
}

/// Configures and attaches a [`Connection`] to a transport
pub struct ConnectionBuilder {
    max_xmit_frag: u16,
    max_recv_frag: u16,
    call_timeout: Duration,
    security: Option<(Box<dyn SecurityProvider>, AuthLevel)>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            call_timeout: Duration::from_secs(30),
            security: None,
        }
    }

    pub fn frag_sizes(mut self, max_xmit: u16, max_recv: u16) -> Self {
        self.max_xmit_frag = max_xmit;
        self.max_recv_frag = max_recv;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn security(mut self, provider: Box<dyn SecurityProvider>, level: AuthLevel) -> Self {
        self.security = Some((provider, level));
        self
    }

    /// Attach to a transport and start the reader task. Must run inside
    /// a tokio runtime.
    pub fn attach<T: Transport + 'static>(self, transport: T) -> Connection {
        let boxed: Box<dyn Transport> = Box::new(transport);
        let (read_half, write_half) = tokio::io::split(boxed);
        let shared = Arc::new(Shared {
            pending: SyncMutex::new(HashMap::new()),
            state: SyncMutex::new(ConnectionState::Unbound),
            security: self
                .security
                .map(|(provider, level)| Mutex::new(SecurityContext::new(provider, level, 0))),
        });
        let reader = PduReader::new(read_half, self.max_recv_frag);
        let reader_task = tokio::spawn(reader_loop(reader, shared.clone()));
        Connection {
            writer: Mutex::new(PduWriter::new(write_half)),
            shared,
            call_id: AtomicU32::new(1),
            next_context: AtomicU16::new(0),
            contexts: SyncMutex::new(HashMap::new()),
            children: SyncMutex::new(Vec::new()),
            negotiated: SyncMutex::new(Negotiated {
                max_xmit_frag: self.max_xmit_frag,
                max_recv_frag: self.max_recv_frag,
                assoc_group_id: 0,
            }),
            call_timeout: self.call_timeout,
            reader_task,
        }
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound client connection
pub struct Connection {
    writer: Mutex<PduWriter<WriteHalf<Box<dyn Transport>>>>,
    shared: Arc<Shared>,
    call_id: AtomicU32,
    next_context: AtomicU16,
    contexts: SyncMutex<HashMap<u16, SyntaxId>>,
    /// Dedicated sub-connections, torn down with this connection
    children: SyncMutex<Vec<Arc<Connection>>>,
    negotiated: SyncMutex<Negotiated>,
    call_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.shared.state.lock() = state;
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<()> {
        let mut state = self.shared.state.lock();
        if *state != from {
            return Err(RpcError::InvalidState(state.name()));
        }
        *state = to;
        Ok(())
    }

    fn next_call_id(&self) -> u32 {
        self.call_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The association group assigned by the server at bind time
    pub fn assoc_group_id(&self) -> u32 {
        self.negotiated.lock().assoc_group_id
    }

    /// Bind the first presentation context. Returns its context id.
    pub async fn bind(&self, interface: SyntaxId) -> Result<u16> {
        self.transition(ConnectionState::Unbound, ConnectionState::Binding)?;
        match self.negotiate_context(interface, true).await {
            Ok(context_id) => {
                self.set_state(ConnectionState::Bound);
                debug!(context_id, %interface, "bind accepted");
                Ok(context_id)
            }
            Err(err) => {
                self.set_state(ConnectionState::Closed);
                Err(err)
            }
        }
    }

    /// Negotiate an additional presentation context on the live
    /// connection. Returns the new context id.
    pub async fn alter_context(&self, interface: SyntaxId) -> Result<u16> {
        self.transition(ConnectionState::Bound, ConnectionState::AlteringContext)?;
        let result = self.negotiate_context(interface, false).await;
        // a rejected context leaves the connection itself usable
        self.set_state(ConnectionState::Bound);
        if let Ok(context_id) = &result {
            debug!(context_id, %interface, "alter_context accepted");
        }
        result
    }

    /// Bind if unbound, otherwise add the interface via alter_context
    pub async fn bind_or_alter(&self, interface: SyntaxId) -> Result<u16> {
        match self.state() {
            ConnectionState::Unbound => self.bind(interface).await,
            ConnectionState::Bound => {
                // reuse an existing context for the same interface
                let existing = self
                    .contexts
                    .lock()
                    .iter()
                    .find(|(_, syntax)| **syntax == interface)
                    .map(|(id, _)| *id);
                match existing {
                    Some(id) => Ok(id),
                    None => self.alter_context(interface).await,
                }
            }
            other => Err(RpcError::InvalidState(other.name())),
        }
    }

    async fn negotiate_context(&self, interface: SyntaxId, is_bind: bool) -> Result<u16> {
        let context_id = self.next_context.fetch_add(1, Ordering::SeqCst);
        let call_id = self.next_call_id();
        let (max_xmit, max_recv, assoc_group) = {
            let n = self.negotiated.lock();
            (n.max_xmit_frag, n.max_recv_frag, n.assoc_group_id)
        };
        let body = BindPdu {
            max_xmit_frag: max_xmit,
            max_recv_frag: max_recv,
            assoc_group_id: if is_bind { 0 } else { assoc_group },
            contexts: vec![ContextElement::new(context_id, interface)],
        };
        let mut pdu = Pdu::new(
            call_id,
            if is_bind {
                PduBody::Bind(body)
            } else {
                PduBody::AlterContext(body)
            },
        );
        if is_bind {
            if let Some(security) = &self.shared.security {
                let mut sec = security.lock().await;
                let token = sec.provider_mut().initial_token().await?;
                if !token.is_empty() {
                    pdu.auth = Some(sec.negotiation_verifier(token));
                }
            }
        }

        let reply = self.send_and_wait(call_id, pdu).await?;
        let ctrl = match reply {
            Reply::Control(ctrl) => ctrl,
            Reply::Stub(_) => return Err(RpcError::MalformedPdu("stub reply to bind")),
        };
        let Pdu { body, auth, .. } = *ctrl;
        let ack = match body {
            PduBody::BindAck(ack) | PduBody::AlterContextResponse(ack) => ack,
            PduBody::BindNak(nak) => {
                return Err(RpcError::BindRejected(
                    bind_nak_reason::as_str(nak.reason).to_string(),
                ));
            }
            _ => return Err(RpcError::MalformedPdu("unexpected reply to bind")),
        };
        self.accept_ack(&ack, is_bind)?;
        if is_bind {
            self.run_negotiation_legs(auth).await?;
        }
        self.contexts.lock().insert(context_id, interface);
        Ok(context_id)
    }

    fn accept_ack(&self, ack: &BindAckPdu, is_bind: bool) -> Result<()> {
        let result = ack
            .results
            .first()
            .ok_or(RpcError::MalformedPdu("empty result list"))?;
        if result.result != ContextResultCode::Acceptance {
            return Err(RpcError::BindRejected(format!(
                "context {:?} (reason {})",
                result.result, result.reason
            )));
        }
        if is_bind {
            let mut n = self.negotiated.lock();
            if ack.max_xmit_frag != 0 {
                n.max_xmit_frag = n.max_xmit_frag.min(ack.max_xmit_frag);
            }
            if ack.max_recv_frag != 0 {
                n.max_recv_frag = n.max_recv_frag.min(ack.max_recv_frag);
            }
            n.assoc_group_id = ack.assoc_group_id;
        }
        Ok(())
    }

    /// Drive the remaining security legs after the bind_ack: continue
    /// tokens over alter_context, the final token as a one-way auth3.
    async fn run_negotiation_legs(&self, ack_auth: Option<AuthVerifier>) -> Result<()> {
        let security = match &self.shared.security {
            Some(s) => s,
            None => return Ok(()),
        };
        let mut peer_token = match ack_auth {
            Some(v) if !v.token.is_empty() => v.token,
            // server finished in one leg (or anonymous provider)
            _ => return Ok(()),
        };
        loop {
            let step = {
                let mut sec = security.lock().await;
                sec.provider_mut().step(&peer_token).await?
            };
            match step {
                NegotiateStep::Done(None) => {
                    debug!("security context established");
                    return Ok(());
                }
                NegotiateStep::Done(Some(token)) => {
                    let call_id = self.next_call_id();
                    let mut pdu = Pdu::new(call_id, PduBody::Auth3);
                    pdu.auth = Some(security.lock().await.negotiation_verifier(token));
                    self.writer.lock().await.write_pdu(&pdu).await?;
                    debug!("security context established (auth3 sent)");
                    return Ok(());
                }
                NegotiateStep::Continue(token) => {
                    let call_id = self.next_call_id();
                    let (max_xmit, max_recv, assoc_group) = {
                        let n = self.negotiated.lock();
                        (n.max_xmit_frag, n.max_recv_frag, n.assoc_group_id)
                    };
                    let mut pdu = Pdu::new(
                        call_id,
                        PduBody::AlterContext(BindPdu {
                            max_xmit_frag: max_xmit,
                            max_recv_frag: max_recv,
                            assoc_group_id: assoc_group,
                            contexts: Vec::new(),
                        }),
                    );
                    pdu.auth = Some(security.lock().await.negotiation_verifier(token));
                    let reply = self.send_and_wait(call_id, pdu).await?;
                    peer_token = match reply {
                        Reply::Control(ctrl) => match ctrl.auth {
                            Some(v) if !v.token.is_empty() => v.token,
                            _ => {
                                return Err(RpcError::Negotiation(
                                    "peer ended the exchange without a token".into(),
                                ))
                            }
                        },
                        Reply::Stub(_) => {
                            return Err(RpcError::MalformedPdu("stub reply to alter_context"))
                        }
                    };
                }
            }
        }
    }

    /// Issue a call. Safe to invoke concurrently: each call gets its own
    /// call id and completes when its response (or fault) arrives,
    /// whatever order the server answers in.
    pub async fn invoke(
        &self,
        context_id: u16,
        opnum: u16,
        object: Option<Uuid>,
        stub: Bytes,
    ) -> Result<Bytes> {
        {
            let state = self.state();
            if state != ConnectionState::Bound {
                return Err(RpcError::InvalidState(state.name()));
            }
        }
        if !self.contexts.lock().contains_key(&context_id) {
            return Err(RpcError::UnknownContext(context_id));
        }

        let call_id = self.next_call_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            call_id,
            Pending {
                tx,
                assembler: None,
            },
        );
        if let Err(err) = self
            .send_request(call_id, context_id, opnum, object, stub)
            .await
        {
            self.shared.pending.lock().remove(&call_id);
            return Err(err);
        }
        match self.await_reply(call_id, rx).await? {
            Reply::Stub(stub) => Ok(stub),
            Reply::Control(_) => Err(RpcError::MalformedPdu("control reply to request")),
        }
    }

    async fn send_request(
        &self,
        call_id: u32,
        context_id: u16,
        opnum: u16,
        object: Option<Uuid>,
        stub: Bytes,
    ) -> Result<()> {
        let max_xmit = self.negotiated.lock().max_xmit_frag as usize;
        let mut fixed = PduHeader::SIZE + REQUEST_FIXED_SIZE;
        if object.is_some() {
            fixed += OBJECT_UUID_SIZE;
        }
        let auth_overhead = match &self.shared.security {
            Some(security) => security.lock().await.per_pdu_overhead(),
            None => 0,
        };
        let max_stub = max_xmit.saturating_sub(fixed + auth_overhead).max(1);
        let fragments = split_stub(stub, max_stub);
        if fragments.len() > 1 {
            debug!(call_id, count = fragments.len(), "fragmenting request");
        }

        // writer held across all fragments so concurrent calls cannot
        // interleave, and so signing order matches send order
        let mut writer = self.writer.lock().await;
        for frag in fragments {
            let (data, auth) = match &self.shared.security {
                Some(security) => {
                    let mut sec = security.lock().await;
                    let mut stub = BytesMut::from(frag.data.as_ref());
                    let verifier = sec.protect(&mut stub)?;
                    (stub.freeze(), verifier)
                }
                None => (frag.data, None),
            };
            let mut pdu = Pdu::new(
                call_id,
                PduBody::Request(RequestPdu {
                    alloc_hint: frag.alloc_hint,
                    context_id,
                    opnum,
                    object,
                    stub: data,
                }),
            );
            pdu.flags = frag.flags;
            pdu.auth = auth;
            writer.write_pdu(&pdu).await?;
        }
        Ok(())
    }

    async fn send_and_wait(&self, call_id: u32, pdu: Pdu) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            call_id,
            Pending {
                tx,
                assembler: None,
            },
        );
        if let Err(err) = self.writer.lock().await.write_pdu(&pdu).await {
            self.shared.pending.lock().remove(&call_id);
            return Err(err);
        }
        self.await_reply(call_id, rx).await
    }

    async fn await_reply(
        &self,
        call_id: u32,
        rx: oneshot::Receiver<Result<Reply>>,
    ) -> Result<Reply> {
        match tokio::time::timeout(self.call_timeout, rx).await {
            Err(_) => {
                self.shared.pending.lock().remove(&call_id);
                Err(RpcError::Timeout)
            }
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// Open a sibling connection to the same endpoint, sharing the
    /// caller's credentials. Without a transport, or if its bind fails,
    /// falls back (with a warning) to multiplexing on this connection
    /// via alter_context; the returned handle behaves the same either
    /// way.
    pub async fn sub_connection<T: Transport + 'static>(
        self: &Arc<Self>,
        transport: Option<T>,
        security: Option<(Box<dyn SecurityProvider>, AuthLevel)>,
        interface: SyntaxId,
    ) -> Result<SubConnection> {
        if let Some(transport) = transport {
            let (max_xmit, max_recv) = {
                let n = self.negotiated.lock();
                (n.max_xmit_frag, n.max_recv_frag)
            };
            let mut builder = ConnectionBuilder::new()
                .frag_sizes(max_xmit, max_recv)
                .call_timeout(self.call_timeout);
            if let Some((provider, level)) = security {
                builder = builder.security(provider, level);
            }
            let conn = builder.attach(transport);
            match conn.bind(interface).await {
                Ok(context_id) => {
                    debug!(context_id, %interface, "sub-connection bound");
                    let conn = Arc::new(conn);
                    self.children.lock().push(conn.clone());
                    return Ok(SubConnection::Dedicated { conn, context_id });
                }
                Err(err) => {
                    warn!(error = %err, %interface,
                        "sub-connection bind failed; falling back to parent connection");
                }
            }
        } else {
            warn!(%interface, "no transport for sub-connection; falling back to parent connection");
        }
        let context_id = self.bind_or_alter(interface).await?;
        Ok(SubConnection::Shared {
            conn: self.clone(),
            context_id,
        })
    }

    /// Tear down: fail outstanding calls, close every dedicated
    /// sub-connection and stop the reader
    pub fn close(&self) {
        self.set_state(ConnectionState::Closed);
        self.shared.fail_all_pending();
        for child in self.children.lock().drain(..) {
            child.close();
        }
        self.reader_task.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// A call handle bound to one presentation context, either on its own
/// connection or multiplexed onto the parent after fallback
pub enum SubConnection {
    Dedicated { conn: Arc<Connection>, context_id: u16 },
    Shared { conn: Arc<Connection>, context_id: u16 },
}

impl SubConnection {
    pub fn context_id(&self) -> u16 {
        match self {
            Self::Dedicated { context_id, .. } | Self::Shared { context_id, .. } => *context_id,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        match self {
            Self::Dedicated { conn, .. } | Self::Shared { conn, .. } => conn,
        }
    }

    /// Whether this handle is multiplexed on the parent connection
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Shared { .. })
    }

    pub async fn invoke(&self, opnum: u16, object: Option<Uuid>, stub: Bytes) -> Result<Bytes> {
        self.connection()
            .invoke(self.context_id(), opnum, object, stub)
            .await
    }
}

async fn reader_loop(mut reader: PduReader<ReadHalf<Box<dyn Transport>>>, shared: Arc<Shared>) {
    loop {
        let pdu = match reader.read_pdu().await {
            Ok(pdu) => pdu,
            Err(err) => {
                match &err {
                    RpcError::ConnectionClosed => debug!("transport closed"),
                    other => warn!(error = %other, "receive failed; dropping connection"),
                }
                *shared.state.lock() = ConnectionState::Closed;
                shared.fail_all_pending();
                return;
            }
        };
        let Pdu {
            flags,
            call_id,
            drep,
            body,
            auth,
        } = pdu;
        match body {
            PduBody::Response(resp) => {
                // verify before the fragment is appended to the call; a
                // failed check means the receive sequence has slipped
                // and nothing after it can be trusted, so the whole
                // connection goes down
                let stub = match unprotect(&shared, resp.stub, auth.as_ref()).await {
                    Ok(stub) => stub,
                    Err(err) => {
                        warn!(call_id, error = %err, "response failed verification; dropping connection");
                        *shared.state.lock() = ConnectionState::Closed;
                        shared.complete(call_id, Err(err));
                        shared.fail_all_pending();
                        return;
                    }
                };
                let mut pending = shared.pending.lock();
                match pending.get_mut(&call_id) {
                    None => warn!(call_id, "response for a call nobody is waiting on"),
                    Some(p) => {
                        let asm = p
                            .assembler
                            .get_or_insert_with(|| Reassembler::new(call_id));
                        match asm.push(call_id, flags, resp.context_id, &stub) {
                            Ok(None) => {}
                            Ok(Some(full)) => {
                                if let Some(p) = pending.remove(&call_id) {
                                    let _ = p.tx.send(Ok(Reply::Stub(full)));
                                }
                            }
                            Err(err) => {
                                if let Some(p) = pending.remove(&call_id) {
                                    let _ = p.tx.send(Err(err));
                                }
                            }
                        }
                    }
                }
            }
            PduBody::Fault(fault) => {
                // a fault mid-reassembly also lands here: the pending
                // entry (and its assembler) is dropped with the fault
                let did_not_execute = flags.contains(PacketFlags::DID_NOT_EXECUTE);
                shared.complete(
                    call_id,
                    Err(RpcError::Fault {
                        status: fault.status,
                        did_not_execute,
                    }),
                );
            }
            body @ (PduBody::BindAck(_) | PduBody::BindNak(_) | PduBody::AlterContextResponse(_)) => {
                let rebuilt = Pdu {
                    flags,
                    call_id,
                    drep,
                    body,
                    auth,
                };
                shared.complete(call_id, Ok(Reply::Control(Box::new(rebuilt))));
            }
            PduBody::Shutdown => {
                debug!("server requested shutdown");
                *shared.state.lock() = ConnectionState::Closed;
                shared.fail_all_pending();
                return;
            }
            other => {
                warn!(call_id, body = ?other, "unexpected PDU on client connection");
            }
        }
    }
}

async fn unprotect(
    shared: &Shared,
    stub: Bytes,
    verifier: Option<&AuthVerifier>,
) -> Result<Bytes> {
    match (&shared.security, verifier) {
        (Some(security), Some(verifier)) => {
            let mut sec = security.lock().await;
            let mut buf = BytesMut::from(stub.as_ref());
            sec.verify(&mut buf, verifier)?;
            Ok(buf.freeze())
        }
        _ => Ok(stub),
    }
}
