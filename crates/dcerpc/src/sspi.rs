//! SSPI-backed security provider (Windows only)
//!
//! Bridges the platform Security Support Provider Interface into
//! [`SecurityProvider`], so NTLM, Kerberos and Negotiate contexts come
//! from the logged-on user's credentials. Token legs map onto
//! `InitializeSecurityContextW`; per-call protection maps onto
//! `MakeSignature` / `EncryptMessage`.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use windows::core::PCWSTR;
use windows::Win32::Foundation::{SEC_E_OK, SEC_I_CONTINUE_NEEDED};
use windows::Win32::Security::Authentication::Identity::{
    AcquireCredentialsHandleW, DecryptMessage, DeleteSecurityContext, EncryptMessage,
    FreeContextBuffer, FreeCredentialsHandle, InitializeSecurityContextW, MakeSignature,
    QueryContextAttributesW, VerifySignature, SecBuffer, SecBufferDesc, SecPkgContext_Sizes,
    ISC_REQ_ALLOCATE_MEMORY, ISC_REQ_CONFIDENTIALITY, ISC_REQ_INTEGRITY, ISC_REQ_REPLAY_DETECT,
    ISC_REQ_SEQUENCE_DETECT, SECBUFFER_DATA, SECBUFFER_TOKEN, SECBUFFER_VERSION,
    SECPKG_ATTR_SIZES, SECPKG_CRED_OUTBOUND,
};
use windows::Win32::Security::Credentials::SecHandle;

use crate::auth::{AuthLevel, AuthType, NegotiateStep, SecurityProvider};
use crate::error::{Result, RpcError};

fn package_name(auth_type: AuthType) -> Option<&'static str> {
    match auth_type {
        AuthType::Ntlm => Some("NTLM"),
        AuthType::GssKerberos => Some("Kerberos"),
        AuthType::GssNegotiate => Some("Negotiate"),
        AuthType::None => None,
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}

/// Client-side security provider backed by the platform SSPI
pub struct SspiProvider {
    cred: SecHandle,
    ctx: Option<SecHandle>,
    auth_type: AuthType,
    level: AuthLevel,
    /// Target service principal name; required for Kerberos
    target_spn: Option<String>,
    max_signature: usize,
    seal_trailer: usize,
    block_size: usize,
}

// SecHandle is a pair of plain words; the provider is only ever driven
// from behind the connection's security lock.
unsafe impl Send for SspiProvider {}
unsafe impl Sync for SspiProvider {}

impl SspiProvider {
    pub fn new(auth_type: AuthType, level: AuthLevel, target_spn: Option<&str>) -> Result<Self> {
        let package = package_name(auth_type)
            .ok_or(RpcError::Unsupported("auth type has no security package"))?;
        let package_wide = to_wide(package);
        let mut cred = SecHandle::default();
        let mut expiry = 0i64;
        let status = unsafe {
            AcquireCredentialsHandleW(
                PCWSTR::null(),
                PCWSTR(package_wide.as_ptr()),
                SECPKG_CRED_OUTBOUND,
                None,
                None,
                None,
                None,
                &mut cred,
                Some(&mut expiry),
            )
        };
        if status.is_err() {
            return Err(RpcError::Negotiation(format!(
                "AcquireCredentialsHandle({package}): {status:?}"
            )));
        }
        Ok(Self {
            cred,
            ctx: None,
            auth_type,
            level,
            target_spn: target_spn.map(str::to_owned),
            max_signature: 0,
            seal_trailer: 0,
            block_size: 0,
        })
    }

    fn context_requirements(&self) -> u32 {
        let mut req = ISC_REQ_ALLOCATE_MEMORY | ISC_REQ_REPLAY_DETECT | ISC_REQ_SEQUENCE_DETECT;
        if self.level >= AuthLevel::PktIntegrity {
            req |= ISC_REQ_INTEGRITY;
        }
        if self.level >= AuthLevel::PktPrivacy {
            req |= ISC_REQ_CONFIDENTIALITY;
        }
        req
    }

    fn context(&self) -> Result<&SecHandle> {
        self.ctx
            .as_ref()
            .ok_or(RpcError::InvalidState("security context not established"))
    }

    /// One `InitializeSecurityContextW` leg; `input` is empty on the
    /// first leg
    fn isc_leg(&mut self, input: &[u8]) -> Result<(Bytes, bool)> {
        let target_wide = self.target_spn.as_deref().map(to_wide);
        let target_ptr = target_wide
            .as_ref()
            .map(|w| w.as_ptr())
            .unwrap_or(std::ptr::null());

        let mut in_buffer = SecBuffer {
            cbBuffer: input.len() as u32,
            BufferType: SECBUFFER_TOKEN,
            pvBuffer: input.as_ptr() as *mut _,
        };
        let in_desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 1,
            pBuffers: &mut in_buffer,
        };

        let mut out_buffer = SecBuffer {
            cbBuffer: 0,
            BufferType: SECBUFFER_TOKEN,
            pvBuffer: std::ptr::null_mut(),
        };
        let mut out_desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 1,
            pBuffers: &mut out_buffer,
        };

        let mut new_ctx = SecHandle::default();
        let mut attrs = 0u32;
        let mut expiry = 0i64;
        let status = unsafe {
            InitializeSecurityContextW(
                Some(&self.cred as *const SecHandle),
                self.ctx.as_ref().map(|h| h as *const SecHandle),
                Some(target_ptr),
                self.context_requirements(),
                0,
                0,
                if input.is_empty() { None } else { Some(&in_desc) },
                0,
                Some(&mut new_ctx as *mut SecHandle),
                Some(&mut out_desc),
                &mut attrs,
                Some(&mut expiry),
            )
        };

        let token = if !out_buffer.pvBuffer.is_null() && out_buffer.cbBuffer > 0 {
            let slice = unsafe {
                std::slice::from_raw_parts(out_buffer.pvBuffer as *const u8, out_buffer.cbBuffer as usize)
            };
            let bytes = Bytes::copy_from_slice(slice);
            unsafe {
                let _ = FreeContextBuffer(out_buffer.pvBuffer);
            }
            bytes
        } else {
            Bytes::new()
        };

        self.ctx = Some(new_ctx);
        match status {
            SEC_E_OK => {
                self.query_sizes()?;
                Ok((token, false))
            }
            SEC_I_CONTINUE_NEEDED => Ok((token, true)),
            _ => Err(RpcError::Negotiation(format!(
                "InitializeSecurityContext: {status:?}"
            ))),
        }
    }

    fn query_sizes(&mut self) -> Result<()> {
        let ctx = self.context()?;
        let mut sizes = SecPkgContext_Sizes::default();
        let status = unsafe {
            QueryContextAttributesW(ctx, SECPKG_ATTR_SIZES, &mut sizes as *mut _ as *mut _)
        };
        if status.is_err() {
            return Err(RpcError::Negotiation(format!(
                "QueryContextAttributes(SIZES): {status:?}"
            )));
        }
        self.max_signature = sizes.cbMaxSignature as usize;
        self.seal_trailer = sizes.cbSecurityTrailer as usize;
        self.block_size = sizes.cbBlockSize as usize;
        Ok(())
    }
}

impl Drop for SspiProvider {
    fn drop(&mut self) {
        if let Some(ref mut ctx) = self.ctx {
            unsafe {
                let _ = DeleteSecurityContext(ctx);
            }
        }
        unsafe {
            let _ = FreeCredentialsHandle(&mut self.cred);
        }
    }
}

#[async_trait]
impl SecurityProvider for SspiProvider {
    fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    fn max_signature_len(&self) -> usize {
        // seal appends the full security trailer
        self.max_signature.max(self.seal_trailer)
    }

    async fn initial_token(&mut self) -> Result<Bytes> {
        let (token, _continue_needed) = self.isc_leg(&[])?;
        Ok(token)
    }

    async fn step(&mut self, peer_token: &[u8]) -> Result<NegotiateStep> {
        let (token, continue_needed) = self.isc_leg(peer_token)?;
        if continue_needed {
            Ok(NegotiateStep::Continue(token))
        } else if token.is_empty() {
            Ok(NegotiateStep::Done(None))
        } else {
            Ok(NegotiateStep::Done(Some(token)))
        }
    }

    fn wrap(&mut self, level: AuthLevel, sequence: u32, stub: &mut BytesMut) -> Result<Bytes> {
        let ctx = *self.context()?;
        if level >= AuthLevel::PktPrivacy {
            let mut sig = vec![0u8; self.seal_trailer];
            let mut buffers = [
                SecBuffer {
                    cbBuffer: sig.len() as u32,
                    BufferType: SECBUFFER_TOKEN,
                    pvBuffer: sig.as_mut_ptr() as *mut _,
                },
                SecBuffer {
                    cbBuffer: stub.len() as u32,
                    BufferType: SECBUFFER_DATA,
                    pvBuffer: stub.as_mut_ptr() as *mut _,
                },
            ];
            let mut desc = SecBufferDesc {
                ulVersion: SECBUFFER_VERSION,
                cBuffers: 2,
                pBuffers: buffers.as_mut_ptr(),
            };
            let status = unsafe { EncryptMessage(&ctx, 0, &mut desc, sequence) };
            if status.is_err() {
                return Err(RpcError::Negotiation(format!("EncryptMessage: {status:?}")));
            }
            sig.truncate(buffers[0].cbBuffer as usize);
            Ok(Bytes::from(sig))
        } else {
            let mut sig = vec![0u8; self.max_signature];
            let mut buffers = [
                SecBuffer {
                    cbBuffer: sig.len() as u32,
                    BufferType: SECBUFFER_TOKEN,
                    pvBuffer: sig.as_mut_ptr() as *mut _,
                },
                SecBuffer {
                    cbBuffer: stub.len() as u32,
                    BufferType: SECBUFFER_DATA,
                    pvBuffer: stub.as_ptr() as *mut _,
                },
            ];
            let mut desc = SecBufferDesc {
                ulVersion: SECBUFFER_VERSION,
                cBuffers: 2,
                pBuffers: buffers.as_mut_ptr(),
            };
            let status = unsafe { MakeSignature(&ctx, 0, &mut desc, sequence) };
            if status.is_err() {
                return Err(RpcError::Negotiation(format!("MakeSignature: {status:?}")));
            }
            sig.truncate(buffers[0].cbBuffer as usize);
            Ok(Bytes::from(sig))
        }
    }

    fn unwrap(
        &mut self,
        level: AuthLevel,
        sequence: u32,
        stub: &mut BytesMut,
        token: &[u8],
    ) -> Result<()> {
        let ctx = *self.context()?;
        let mut buffers = [
            SecBuffer {
                cbBuffer: token.len() as u32,
                BufferType: SECBUFFER_TOKEN,
                pvBuffer: token.as_ptr() as *mut _,
            },
            SecBuffer {
                cbBuffer: stub.len() as u32,
                BufferType: SECBUFFER_DATA,
                pvBuffer: stub.as_mut_ptr() as *mut _,
            },
        ];
        let mut desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 2,
            pBuffers: buffers.as_mut_ptr(),
        };
        if level >= AuthLevel::PktPrivacy {
            let status = unsafe { DecryptMessage(&ctx, &mut desc, sequence, None) };
            if status.is_err() {
                return Err(RpcError::IntegrityCheck);
            }
            stub.truncate(buffers[1].cbBuffer as usize);
        } else {
            let status = unsafe { VerifySignature(&ctx, &mut desc, sequence) };
            if status.is_err() {
                return Err(RpcError::IntegrityCheck);
            }
        }
        Ok(())
    }
}
