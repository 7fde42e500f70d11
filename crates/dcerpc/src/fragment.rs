//! Stub fragmentation and reassembly
//!
//! A request or response whose stub exceeds the negotiated fragment
//! size is split across multiple PDUs: FIRST_FRAG on the first,
//! LAST_FRAG on the last, both on an unfragmented PDU. `alloc_hint`
//! carries the stub bytes still to come so receivers can size their
//! buffer once.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, RpcError};
use crate::pdu::PacketFlags;

/// One slice of a fragmented stub
#[derive(Debug, Clone)]
pub struct StubFragment {
    pub data: Bytes,
    pub flags: PacketFlags,
    /// Stub bytes remaining including this fragment
    pub alloc_hint: u32,
}

/// Split a stub into fragments of at most `max_stub` bytes. An empty
/// stub still produces one (empty, complete) fragment.
pub fn split_stub(stub: Bytes, max_stub: usize) -> Vec<StubFragment> {
    debug_assert!(max_stub > 0);
    let total = stub.len();
    if total <= max_stub {
        return vec![StubFragment {
            data: stub,
            flags: PacketFlags::complete(),
            alloc_hint: total as u32,
        }];
    }

    let mut fragments = Vec::with_capacity(total.div_ceil(max_stub));
    let mut offset = 0;
    while offset < total {
        let end = (offset + max_stub).min(total);
        let mut flags = PacketFlags::default();
        if offset == 0 {
            flags.insert(PacketFlags::FIRST_FRAG);
        }
        if end == total {
            flags.insert(PacketFlags::LAST_FRAG);
        }
        fragments.push(StubFragment {
            data: stub.slice(offset..end),
            flags,
            alloc_hint: (total - offset) as u32,
        });
        offset = end;
    }
    fragments
}

/// Reassembles the stub of one in-progress call from its fragments.
///
/// Enforced on every fragment: the call id must match, a FIRST_FRAG
/// must come first and only once, and all fragments must carry the
/// same presentation context.
#[derive(Debug)]
pub struct Reassembler {
    call_id: u32,
    context_id: Option<u16>,
    started: bool,
    buf: BytesMut,
}

impl Reassembler {
    pub fn new(call_id: u32) -> Self {
        Self {
            call_id,
            context_id: None,
            started: false,
            buf: BytesMut::new(),
        }
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Add one fragment. Returns the complete stub once LAST_FRAG
    /// arrives, `None` while more fragments are expected.
    pub fn push(
        &mut self,
        call_id: u32,
        flags: PacketFlags,
        context_id: u16,
        stub: &[u8],
    ) -> Result<Option<Bytes>> {
        if call_id != self.call_id {
            return Err(RpcError::CallIdMismatch {
                expected: self.call_id,
                got: call_id,
            });
        }
        if flags.is_first() {
            if self.started {
                return Err(RpcError::DuplicateFirstFragment);
            }
            self.started = true;
            self.context_id = Some(context_id);
            self.buf.reserve(stub.len());
        } else {
            if !self.started {
                return Err(RpcError::FragmentBeforeFirst);
            }
            let expected = self.context_id.unwrap_or_default();
            if expected != context_id {
                return Err(RpcError::ContextMismatch {
                    expected,
                    got: context_id,
                });
            }
        }
        self.buf.extend_from_slice(stub);
        if flags.is_last() {
            Ok(Some(std::mem::take(&mut self.buf).freeze()))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag_flags(first: bool, last: bool) -> PacketFlags {
        let mut flags = PacketFlags::default();
        if first {
            flags.insert(PacketFlags::FIRST_FRAG);
        }
        if last {
            flags.insert(PacketFlags::LAST_FRAG);
        }
        flags
    }

    #[test]
    fn test_small_stub_single_fragment() {
        let frags = split_stub(Bytes::from_static(b"tiny"), 1024);
        assert_eq!(frags.len(), 1);
        assert!(frags[0].flags.is_first() && frags[0].flags.is_last());
        assert_eq!(frags[0].alloc_hint, 4);
    }

    #[test]
    fn test_three_fragment_split_and_reassembly() {
        let stub = Bytes::from(vec![7u8; 2500]);
        let frags = split_stub(stub.clone(), 1000);
        assert_eq!(frags.len(), 3);
        assert!(frags[0].flags.is_first() && !frags[0].flags.is_last());
        assert!(!frags[1].flags.is_first() && !frags[1].flags.is_last());
        assert!(!frags[2].flags.is_first() && frags[2].flags.is_last());
        assert_eq!(frags[0].alloc_hint, 2500);
        assert_eq!(frags[1].alloc_hint, 1500);
        assert_eq!(frags[2].alloc_hint, 500);

        let mut asm = Reassembler::new(5);
        assert!(asm.push(5, frags[0].flags, 0, &frags[0].data).unwrap().is_none());
        assert!(asm.push(5, frags[1].flags, 0, &frags[1].data).unwrap().is_none());
        let full = asm
            .push(5, frags[2].flags, 0, &frags[2].data)
            .unwrap()
            .expect("complete");
        assert_eq!(full, stub);
    }

    #[test]
    fn test_duplicate_first_fragment_rejected() {
        let mut asm = Reassembler::new(1);
        asm.push(1, frag_flags(true, false), 0, b"a").unwrap();
        assert!(matches!(
            asm.push(1, frag_flags(true, false), 0, b"b"),
            Err(RpcError::DuplicateFirstFragment)
        ));
    }

    #[test]
    fn test_fragment_before_first_rejected() {
        let mut asm = Reassembler::new(1);
        assert!(matches!(
            asm.push(1, frag_flags(false, false), 0, b"a"),
            Err(RpcError::FragmentBeforeFirst)
        ));
    }

    #[test]
    fn test_call_id_mismatch_rejected() {
        let mut asm = Reassembler::new(1);
        assert!(matches!(
            asm.push(2, frag_flags(true, false), 0, b"a"),
            Err(RpcError::CallIdMismatch {
                expected: 1,
                got: 2
            })
        ));
    }

    #[test]
    fn test_context_mismatch_rejected() {
        let mut asm = Reassembler::new(1);
        asm.push(1, frag_flags(true, false), 3, b"a").unwrap();
        assert!(matches!(
            asm.push(1, frag_flags(false, true), 4, b"b"),
            Err(RpcError::ContextMismatch {
                expected: 3,
                got: 4
            })
        ));
    }

    #[test]
    fn test_empty_stub_still_fragments() {
        let frags = split_stub(Bytes::new(), 1024);
        assert_eq!(frags.len(), 1);
        assert!(frags[0].data.is_empty());
        assert!(frags[0].flags.is_first() && frags[0].flags.is_last());
    }
}
