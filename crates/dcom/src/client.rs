//! Calling a remote interface pointer
//!
//! [`bind_ipid`] takes an [`ObjectIdentity`] learned from an OBJREF,
//! negotiates a presentation context for its IID, and returns a
//! [`BoundClient`]. The client prepends ORPCTHIS to every request stub,
//! addresses the request at the IPID through the header object uuid,
//! and strips ORPCTHAT off every response.

use std::sync::Arc;

use bytes::Bytes;
use dcerpc::{Connection, SyntaxId};
use ndr::{NdrReader, NdrWriter};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::identity::ObjectIdentity;
use crate::orpc::{OrpcThat, OrpcThis};

/// A presentation context bound to one remote interface pointer
pub struct BoundClient {
    conn: Arc<Connection>,
    identity: ObjectIdentity,
    context_id: u16,
    /// One causality id per client, shared by all its calls
    causality_id: Uuid,
}

/// Bind (or alter-context) the identity's IID on `conn` and return a
/// client for ORPC calls against it.
pub async fn bind_ipid(conn: Arc<Connection>, identity: ObjectIdentity) -> Result<BoundClient> {
    let interface = SyntaxId::new(identity.iid, 0, 0);
    let context_id = conn.bind_or_alter(interface).await?;
    debug!(context_id, ipid = %identity.ipid, "interface pointer bound");
    Ok(BoundClient {
        conn,
        identity,
        context_id,
        causality_id: Uuid::new_v4(),
    })
}

impl BoundClient {
    pub fn identity(&self) -> &ObjectIdentity {
        &self.identity
    }

    pub fn context_id(&self) -> u16 {
        self.context_id
    }

    pub fn causality_id(&self) -> Uuid {
        self.causality_id
    }

    /// Call `opnum` on the bound interface pointer. `args` is the
    /// method payload; the ORPC headers are handled here.
    pub async fn invoke(&self, opnum: u16, args: Bytes) -> Result<Bytes> {
        let mut w = NdrWriter::new();
        OrpcThis::with_causality(self.causality_id).write(&mut w);
        w.flush_deferred()?;
        w.write_bytes(&args);
        let stub = w.finish()?;

        let response = self
            .conn
            .invoke(
                self.context_id,
                opnum,
                Some(self.identity.ipid.uuid()),
                stub,
            )
            .await?;

        let mut r = NdrReader::new(&response);
        let _that = OrpcThat::read(&mut r)?;
        Ok(response.slice(r.position()..))
    }
}
