//! Per-connection realm authentication.
//!
//! A length-prefixed request/response exchange on a dedicated system
//! protocol binds each transport connection to a verified realm context.
//! The responder trusts the transport-layer identity for the remote's node
//! ID; the application-layer Ed25519 signature is carried on the wire and
//! verified only when strict mode is enabled.
//!
//! Failures never close the transport: an unauthenticated connection simply
//! never passes the protocol router's realm check.

use std::sync::{Mutex, Weak};
use std::time::Duration;

use bytes::Buf;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use dep2p_core::{Connection, ConnRealmContext, DynConnection, DynStream, NodeId, RealmId};

use crate::error::RealmError;

/// System protocol identifier of the realm-auth exchange.
pub const REALM_AUTH_PROTOCOL: &str = "/dep2p/sys/realm/auth/1.0.0";

/// Maximum frame payload.
pub const MAX_AUTH_PAYLOAD: usize = 4096;

/// Acceptance window for request timestamps, seconds either side of now.
pub const AUTH_FRESHNESS_WINDOW_SECS: i64 = 5 * 60;

/// Sanity cap on the realm string field.
const MAX_REALM_STR: usize = 256;

/// Sanity cap on signature fields.
const MAX_SIG_LEN: usize = 1024;

/// Frame message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMsgType {
    /// Initiator → responder.
    Request = 1,
    /// Responder → initiator.
    Response = 2,
}

impl TryFrom<u8> for AuthMsgType {
    type Error = RealmError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            other => Err(RealmError::Malformed(format!(
                "unknown auth message type {other}"
            ))),
        }
    }
}

/// Stable error codes carried in auth responses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthErrorCode {
    /// No error.
    #[default]
    None = 0,
    /// The responder does not consider the initiator a member.
    NotMember = 1,
    /// The responder does not know the realm.
    RealmNotFound = 2,
    /// A membership proof failed.
    InvalidProof = 3,
    /// The request timestamp was outside the freshness window.
    Expired = 4,
    /// A signature failed to verify.
    InvalidSignature = 5,
    /// The responder is joined to a different realm.
    RealmMismatch = 6,
    /// Internal responder error.
    Internal = 100,
}

impl AuthErrorCode {
    /// Parse a wire code; unknown codes map to `Internal`.
    pub fn from_wire(value: u32) -> Self {
        match value {
            0 => Self::None,
            1 => Self::NotMember,
            2 => Self::RealmNotFound,
            3 => Self::InvalidProof,
            4 => Self::Expired,
            5 => Self::InvalidSignature,
            6 => Self::RealmMismatch,
            _ => Self::Internal,
        }
    }
}

/// The initiator's half of the exchange.
///
/// Wire layout: `realmLen(u32 BE) | realm | timestamp(i64 BE) | sigLen(u32
/// BE) | sig`, where `realm` is the realm ID's opaque string form and the
/// signature (empty when the node has no identity key) covers
/// `realm || timestamp`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealmAuthRequest {
    /// The realm the initiator claims membership in.
    pub realm: RealmId,
    /// Creation time, Unix seconds.
    pub timestamp: i64,
    /// Ed25519 signature, or empty.
    pub signature: Vec<u8>,
}

impl RealmAuthRequest {
    /// Encode to the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let realm_str = self.realm.to_hex();
        let mut out = Vec::with_capacity(4 + realm_str.len() + 8 + 4 + self.signature.len());
        out.extend_from_slice(&(realm_str.len() as u32).to_be_bytes());
        out.extend_from_slice(realm_str.as_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&(self.signature.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.signature);
        out
    }

    /// Decode from the wire layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, RealmError> {
        let mut buf = bytes;
        let realm = read_realm(&mut buf)?;
        if buf.remaining() < 8 {
            return Err(truncated());
        }
        let timestamp = buf.get_i64();
        let signature = read_sig(&mut buf)?;
        if buf.has_remaining() {
            return Err(RealmError::Malformed("trailing bytes in request".to_string()));
        }
        Ok(Self {
            realm,
            timestamp,
            signature,
        })
    }

    /// The bytes the request signature covers.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = self.realm.to_hex().into_bytes();
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out
    }
}

/// The responder's half of the exchange.
///
/// Wire layout: `realmLen(u32 BE) | realm | verified(u8) | expiresAt(i64
/// BE) | errCode(u32 BE) | errMsgLen(u32 BE) | errMsg | sigLen(u32 BE) |
/// sig`, the signature covering `realm || verified || expiresAt ||
/// errCode`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealmAuthResponse {
    /// The realm the response concerns.
    pub realm: RealmId,
    /// Whether the initiator was accepted.
    pub verified: bool,
    /// Until when the context is valid, Unix seconds.
    pub expires_at: i64,
    /// Error code when not verified.
    pub err_code: AuthErrorCode,
    /// Human-readable error detail, possibly empty.
    pub err_msg: String,
    /// Ed25519 signature, or empty.
    pub signature: Vec<u8>,
}

impl RealmAuthResponse {
    /// A rejection carrying the given code.
    pub fn rejection(realm: RealmId, code: AuthErrorCode, msg: impl Into<String>) -> Self {
        Self {
            realm,
            verified: false,
            expires_at: 0,
            err_code: code,
            err_msg: msg.into(),
            signature: Vec::new(),
        }
    }

    /// Encode to the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let realm_str = self.realm.to_hex();
        let mut out = Vec::with_capacity(
            4 + realm_str.len() + 1 + 8 + 4 + 4 + self.err_msg.len() + 4 + self.signature.len(),
        );
        out.extend_from_slice(&(realm_str.len() as u32).to_be_bytes());
        out.extend_from_slice(realm_str.as_bytes());
        out.push(u8::from(self.verified));
        out.extend_from_slice(&self.expires_at.to_be_bytes());
        out.extend_from_slice(&(self.err_code as u32).to_be_bytes());
        out.extend_from_slice(&(self.err_msg.len() as u32).to_be_bytes());
        out.extend_from_slice(self.err_msg.as_bytes());
        out.extend_from_slice(&(self.signature.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.signature);
        out
    }

    /// Decode from the wire layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, RealmError> {
        let mut buf = bytes;
        let realm = read_realm(&mut buf)?;
        if buf.remaining() < 1 + 8 + 4 + 4 {
            return Err(truncated());
        }
        let verified = buf.get_u8() != 0;
        let expires_at = buf.get_i64();
        let err_code = AuthErrorCode::from_wire(buf.get_u32());

        let msg_len = buf.get_u32() as usize;
        if msg_len > MAX_AUTH_PAYLOAD || buf.remaining() < msg_len {
            return Err(truncated());
        }
        let err_msg = String::from_utf8(buf.copy_to_bytes(msg_len).to_vec())
            .map_err(|_| RealmError::Malformed("error message is not utf-8".to_string()))?;

        let signature = read_sig(&mut buf)?;
        if buf.has_remaining() {
            return Err(RealmError::Malformed(
                "trailing bytes in response".to_string(),
            ));
        }
        Ok(Self {
            realm,
            verified,
            expires_at,
            err_code,
            err_msg,
            signature,
        })
    }

    /// The bytes the response signature covers.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = self.realm.to_hex().into_bytes();
        out.push(u8::from(self.verified));
        out.extend_from_slice(&self.expires_at.to_be_bytes());
        out.extend_from_slice(&(self.err_code as u32).to_be_bytes());
        out
    }
}

fn truncated() -> RealmError {
    RealmError::Malformed("truncated auth message".to_string())
}

fn read_realm(buf: &mut &[u8]) -> Result<RealmId, RealmError> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let len = buf.get_u32() as usize;
    if len > MAX_REALM_STR || buf.remaining() < len {
        return Err(truncated());
    }
    let raw = buf.copy_to_bytes(len);
    let s = std::str::from_utf8(&raw)
        .map_err(|_| RealmError::Malformed("realm field is not utf-8".to_string()))?;
    RealmId::from_hex(s).map_err(|_| RealmError::Malformed("realm field is not a realm id".to_string()))
}

fn read_sig(buf: &mut &[u8]) -> Result<Vec<u8>, RealmError> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let len = buf.get_u32() as usize;
    if len > MAX_SIG_LEN || buf.remaining() < len {
        return Err(truncated());
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

// ============================================================
// Framing
// ============================================================

/// Write one framed message: `msgType(1) | length(u32 BE) | payload`.
pub async fn write_frame(
    stream: &mut DynStream,
    msg_type: AuthMsgType,
    payload: &[u8],
) -> Result<(), RealmError> {
    if payload.len() > MAX_AUTH_PAYLOAD {
        return Err(RealmError::MessageTooLarge {
            len: payload.len(),
            max: MAX_AUTH_PAYLOAD,
        });
    }
    stream.write_u8(msg_type as u8).await?;
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed message, enforcing the payload cap.
pub async fn read_frame(stream: &mut DynStream) -> Result<(AuthMsgType, Vec<u8>), RealmError> {
    let msg_type = AuthMsgType::try_from(stream.read_u8().await?)?;
    let len = stream.read_u32().await? as usize;
    if len > MAX_AUTH_PAYLOAD {
        return Err(RealmError::MessageTooLarge {
            len,
            max: MAX_AUTH_PAYLOAD,
        });
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((msg_type, payload))
}

// ============================================================
// Service
// ============================================================

/// The manager surface the auth protocol needs.
///
/// Implemented by the realm manager and held weakly so the protocol never
/// keeps the manager alive.
pub trait MembershipView: Send + Sync {
    /// The currently joined realm, if any.
    fn current_realm_id(&self) -> Option<RealmId>;

    /// Whether this node is a member of the given realm.
    fn is_member_of(&self, realm: &RealmId) -> bool;

    /// Record that a remote proved membership (feeds the cache and roster).
    fn note_verified_peer(&self, node: NodeId, realm: RealmId, valid_for: Duration);
}

/// Configuration of the auth exchange.
#[derive(Clone, Debug)]
pub struct RealmAuthConfig {
    /// Budget for one outbound handshake.
    pub timeout: Duration,
    /// Lifetime granted to a verified context.
    pub expiry: Duration,
    /// Verify application-layer signatures instead of trusting transport
    /// identity alone.
    pub strict_signatures: bool,
}

impl Default for RealmAuthConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            expiry: Duration::from_secs(24 * 60 * 60),
            strict_signatures: false,
        }
    }
}

/// Runs the realm-auth exchange on both ends.
pub struct RealmAuthService {
    local: NodeId,
    signing: Option<SigningKey>,
    view: Mutex<Option<Weak<dyn MembershipView>>>,
    config: RealmAuthConfig,
}

impl RealmAuthService {
    /// Create the service. `signing` is the node's identity key, if any;
    /// without one requests go out unsigned and the responder relies on
    /// transport identity.
    pub fn new(local: NodeId, signing: Option<SigningKey>, config: RealmAuthConfig) -> Self {
        Self {
            local,
            signing,
            view: Mutex::new(None),
            config,
        }
    }

    /// The local node identity.
    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Attach the membership view (held weakly).
    pub fn set_view(&self, view: Weak<dyn MembershipView>) {
        *self.view.lock().expect("view lock poisoned") = Some(view);
    }

    fn view(&self) -> Option<std::sync::Arc<dyn MembershipView>> {
        self.view
            .lock()
            .expect("view lock poisoned")
            .as_ref()
            .and_then(|weak| weak.upgrade())
    }

    /// Run the outbound handshake on a connection and stamp its context.
    ///
    /// Refuses to start while unjoined. Bounded by the configured timeout.
    pub async fn outbound(&self, conn: &DynConnection) -> Result<ConnRealmContext, RealmError> {
        let view = self.view().ok_or(RealmError::NotMember)?;
        let realm = view.current_realm_id().ok_or(RealmError::NotMember)?;

        let result = tokio::time::timeout(self.config.timeout, self.outbound_inner(conn, realm))
            .await
            .map_err(|_| RealmError::RealmAuthTimeout)?;

        if let Ok(ctx) = &result {
            let valid_for = (ctx.expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            view.note_verified_peer(conn.remote_peer(), realm, valid_for);
        }
        result
    }

    async fn outbound_inner(
        &self,
        conn: &DynConnection,
        realm: RealmId,
    ) -> Result<ConnRealmContext, RealmError> {
        let mut request = RealmAuthRequest {
            realm,
            timestamp: Utc::now().timestamp(),
            signature: Vec::new(),
        };
        if let Some(key) = &self.signing {
            request.signature = key.sign(&request.signed_bytes()).to_bytes().to_vec();
        }

        let mut stream = conn.open_stream(REALM_AUTH_PROTOCOL).await?;
        write_frame(&mut stream, AuthMsgType::Request, &request.encode()).await?;

        let (msg_type, payload) = read_frame(&mut stream).await?;
        if msg_type != AuthMsgType::Response {
            return Err(RealmError::Malformed("expected auth response".to_string()));
        }
        let response = RealmAuthResponse::decode(&payload)?;

        if !response.verified {
            debug!(
                peer = %conn.remote_peer().short_id(),
                code = ?response.err_code,
                msg = %response.err_msg,
                "Realm auth rejected by remote"
            );
            return Err(RealmError::RealmAuthFailed {
                reason: format!("{:?}: {}", response.err_code, response.err_msg),
            });
        }
        if response.realm != realm {
            return Err(RealmError::RealmMismatch);
        }
        if self.config.strict_signatures {
            verify_signature(
                conn.remote_peer(),
                &response.signed_bytes(),
                &response.signature,
            )?;
        }

        let expires_at = chrono::DateTime::from_timestamp(response.expires_at, 0)
            .ok_or_else(|| RealmError::Malformed("bad expiry timestamp".to_string()))?;
        let ctx = ConnRealmContext::verified(realm, expires_at);
        conn.set_realm_context(ctx.clone());

        debug!(
            peer = %conn.remote_peer().short_id(),
            realm = %realm.short_id(),
            "Outbound realm auth verified"
        );
        Ok(ctx)
    }

    /// Handle one inbound auth stream (responder side).
    ///
    /// The transport-layer identity of `conn` is taken as authoritative for
    /// the remote's node ID. I/O and codec failures are logged and
    /// swallowed; protocol-level failures are answered with an error code.
    pub async fn handle_inbound(&self, conn: DynConnection, mut stream: DynStream) {
        if let Err(err) = self.handle_inbound_inner(&conn, &mut stream).await {
            debug!(
                peer = %conn.remote_peer().short_id(),
                %err,
                "Inbound realm auth stream failed"
            );
        }
    }

    async fn handle_inbound_inner(
        &self,
        conn: &DynConnection,
        stream: &mut DynStream,
    ) -> Result<(), RealmError> {
        let (msg_type, payload) = read_frame(stream).await?;
        if msg_type != AuthMsgType::Request {
            return Err(RealmError::Malformed("expected auth request".to_string()));
        }
        let request = RealmAuthRequest::decode(&payload)?;
        let remote = conn.remote_peer();

        let response = self.evaluate(&request, remote);
        if response.verified {
            let expires_at = chrono::DateTime::from_timestamp(response.expires_at, 0)
                .unwrap_or_else(Utc::now);
            conn.set_realm_context(ConnRealmContext::verified(request.realm, expires_at));
            if let Some(view) = self.view() {
                view.note_verified_peer(remote, request.realm, self.config.expiry);
            }
            debug!(
                peer = %remote.short_id(),
                realm = %request.realm.short_id(),
                "Inbound realm auth verified"
            );
        }

        write_frame(stream, AuthMsgType::Response, &response.encode()).await
    }

    /// Decide the responder's verdict for a request.
    fn evaluate(&self, request: &RealmAuthRequest, remote: NodeId) -> RealmAuthResponse {
        let now = Utc::now().timestamp();
        if (now - request.timestamp).abs() > AUTH_FRESHNESS_WINDOW_SECS {
            return self.signed(RealmAuthResponse::rejection(
                request.realm,
                AuthErrorCode::Expired,
                "request timestamp outside freshness window",
            ));
        }

        let Some(view) = self.view() else {
            return self.signed(RealmAuthResponse::rejection(
                request.realm,
                AuthErrorCode::Internal,
                "responder not initialized",
            ));
        };
        if !view.is_member_of(&request.realm) {
            return self.signed(RealmAuthResponse::rejection(
                request.realm,
                AuthErrorCode::RealmMismatch,
                "responder is not a member of this realm",
            ));
        }

        if self.config.strict_signatures
            && verify_signature(remote, &request.signed_bytes(), &request.signature).is_err()
        {
            return self.signed(RealmAuthResponse::rejection(
                request.realm,
                AuthErrorCode::InvalidSignature,
                "request signature did not verify",
            ));
        }

        let expires_at = (Utc::now()
            + chrono::Duration::from_std(self.config.expiry)
                .unwrap_or_else(|_| chrono::Duration::hours(24)))
        .timestamp();
        self.signed(RealmAuthResponse {
            realm: request.realm,
            verified: true,
            expires_at,
            err_code: AuthErrorCode::None,
            err_msg: String::new(),
            signature: Vec::new(),
        })
    }

    fn signed(&self, mut response: RealmAuthResponse) -> RealmAuthResponse {
        if let Some(key) = &self.signing {
            response.signature = key.sign(&response.signed_bytes()).to_bytes().to_vec();
        }
        response
    }
}

/// Verify an Ed25519 signature where the signer's node ID is its verifying
/// key bytes.
fn verify_signature(node: NodeId, message: &[u8], signature: &[u8]) -> Result<(), RealmError> {
    let key = VerifyingKey::from_bytes(node.as_bytes())
        .map_err(|_| RealmError::InvalidSignature)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| RealmError::InvalidSignature)?;
    key.verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| {
            warn!(node = %node.short_id(), "Auth signature verification failed");
            RealmError::InvalidSignature
        })
}
