//! Unified error type for the realm layer.

use thiserror::Error;

use dep2p_core::{SwarmError, TransportError};
use dep2p_crypto::ProofError;

/// Result type alias for realm operations.
pub type Result<T> = std::result::Result<T, RealmError>;

/// Errors surfaced by realm membership, access control, authentication,
/// and roster sync.
#[derive(Debug, Error)]
pub enum RealmError {
    // ============================================================
    // Membership lifecycle
    // ============================================================
    /// Not currently a member of any realm (or of the named realm).
    #[error("not a member of this realm")]
    NotMember,

    /// A realm is already joined; leave it first.
    #[error("already joined a realm")]
    AlreadyJoined,

    /// `join_realm` requires a realm key option.
    #[error("realm key required")]
    RealmKeyRequired,

    /// The named realm is unknown here.
    #[error("realm not found: {0}")]
    RealmNotFound(String),

    /// An operation referenced a realm other than the joined one.
    #[error("realm mismatch")]
    RealmMismatch,

    // ============================================================
    // Access control
    // ============================================================
    /// The join key did not validate.
    #[error("invalid join key")]
    InvalidJoinKey,

    /// Access policy refused the operation.
    #[error("access denied")]
    AccessDenied,

    /// The invite envelope is invalid, already used, or unknown.
    #[error("invalid invite")]
    InvalidInvite,

    /// The invite exists but its deadline has passed.
    #[error("invite expired")]
    InviteExpired,

    /// The invite targets a different node.
    #[error("invite not issued for this node")]
    InviteNotForNode,

    // ============================================================
    // Connection authentication
    // ============================================================
    /// The remote refused or failed the realm-auth handshake.
    #[error("realm authentication failed: {reason}")]
    RealmAuthFailed { reason: String },

    /// The realm-auth handshake did not complete in time.
    #[error("realm authentication timed out")]
    RealmAuthTimeout,

    /// A signature failed to verify.
    #[error("invalid signature")]
    InvalidSignature,

    // ============================================================
    // Wire and protocol
    // ============================================================
    /// A frame or message exceeded its size cap.
    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },

    /// A wire message failed to parse.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A user protocol identifier is not acceptable.
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    /// An address could not be interpreted as `/.../p2p/<node>`.
    #[error("invalid full address: {0}")]
    InvalidFullAddress(String),

    // ============================================================
    // Collaborators
    // ============================================================
    /// No discovery service is configured.
    #[error("discovery unavailable")]
    DiscoveryUnavailable,

    /// A required service endpoint is not configured.
    #[error("endpoint unavailable")]
    EndpointUnavailable,

    // ============================================================
    // Wrapped lower layers
    // ============================================================
    /// A membership proof failed.
    #[error(transparent)]
    Proof(#[from] ProofError),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Connection-engine failure.
    #[error("swarm error: {0}")]
    Swarm(#[from] SwarmError),

    /// Stream I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
