//! Typed operations and server-side dispatch
//!
//! An [`Operation`] ties an opnum to its request and response types;
//! stubs are produced and consumed through the NDR marshal traits, so
//! call sites never touch raw bytes.
//!
//! Server dispatch is a flat table of per-opnum handlers. Interface
//! composition is table composition: start from a base table and lay
//! overrides on top with [`DispatchTable::overlay`]; there is no
//! inheritance chain to walk at call time.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use ndr::{NdrMarshal, NdrUnmarshal};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::Result;

/// One operation of an interface
pub trait Operation {
    const OPNUM: u16;
    type Request: NdrMarshal;
    type Response: NdrUnmarshal;
}

/// Call a typed operation on a bound connection
pub async fn call<O: Operation>(
    conn: &Connection,
    context_id: u16,
    object: Option<Uuid>,
    request: &O::Request,
) -> Result<O::Response> {
    let stub = ndr::to_bytes(request)?;
    let reply = conn.invoke(context_id, O::OPNUM, object, stub).await?;
    Ok(ndr::from_bytes(&reply)?)
}

/// Optional extension for operations that adjust their request just
/// before encoding. Selected statically through [`call_prepared`];
/// operations without the hook go through [`call`] unchanged.
pub trait Prepare: Operation {
    fn prepare(request: &mut Self::Request);
}

/// [`call`] for operations with a [`Prepare`] hook
pub async fn call_prepared<O: Prepare>(
    conn: &Connection,
    context_id: u16,
    object: Option<Uuid>,
    mut request: O::Request,
) -> Result<O::Response> {
    O::prepare(&mut request);
    call::<O>(conn, context_id, object, &request).await
}

/// Boxed async stub handler: raw request stub in, raw response stub out
pub type StubHandler =
    Arc<dyn Fn(Bytes) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send>> + Send + Sync>;

/// Opnum-indexed handler table for one presentation context
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: BTreeMap<u16, StubHandler>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn register<F, Fut>(&mut self, opnum: u16, handler: F)
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.handlers
            .insert(opnum, Arc::new(move |stub| Box::pin(handler(stub))));
    }

    /// Register a typed handler for one [`Operation`]
    pub fn register_op<O, F, Fut>(&mut self, handler: F)
    where
        O: Operation,
        O::Request: NdrUnmarshal,
        O::Response: NdrMarshal,
        F: Fn(O::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O::Response>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(O::OPNUM, move |stub: Bytes| {
            let handler = handler.clone();
            async move {
                let request: O::Request = ndr::from_bytes(&stub)?;
                let response = handler(request).await?;
                Ok(ndr::to_bytes(&response)?)
            }
        });
    }

    /// Compose: every handler from `overrides` wins over the same opnum
    /// in `base`
    pub fn overlay(base: &Self, overrides: Self) -> Self {
        let mut handlers = base.handlers.clone();
        handlers.extend(overrides.handlers);
        Self { handlers }
    }

    pub fn handler(&self, opnum: u16) -> Option<StubHandler> {
        self.handlers.get(&opnum).cloned()
    }

    /// One past the highest registered opnum; requests at or beyond it
    /// fault with the operation-range error
    pub fn opnum_limit(&self) -> u16 {
        self.handlers
            .keys()
            .next_back()
            .map(|op| op + 1)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
