//! Error types shared across the dep2p stack.

use thiserror::Error;

use crate::identity::NodeId;

/// Errors related to node and realm identifiers.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid identity format: {0}")]
    InvalidFormat(String),

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Errors from parsing peer addresses.
#[derive(Debug, Error)]
pub enum AddrError {
    #[error("malformed address: {0:?}")]
    Malformed(String),

    #[error("unknown address protocol: {0}")]
    UnknownProtocol(String),

    #[error("address protocol {0} is missing its value")]
    MissingValue(String),

    #[error("invalid value {value:?} for address protocol {protocol}")]
    InvalidValue { protocol: String, value: String },
}

/// Errors surfaced by transports, connections, and streams.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("dial timed out")]
    Timeout,

    #[error("remote peer mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: NodeId, actual: NodeId },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddrError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the liveness collaborator.
#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("protocol not supported")]
    ProtocolNotSupported,

    #[error("ping timed out")]
    Timeout,

    #[error("peer unreachable: {0}")]
    Unreachable(String),
}

impl LivenessError {
    /// Whether the remote simply does not speak the liveness protocol.
    ///
    /// Such peers are cached and skipped by health sweeps instead of being
    /// treated as dead.
    pub fn is_protocol_not_supported(&self) -> bool {
        match self {
            Self::ProtocolNotSupported => true,
            Self::Unreachable(msg) => msg.contains("protocol not supported"),
            _ => false,
        }
    }
}

/// Errors from the discovery collaborator.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery unavailable")]
    Unavailable,

    #[error("announce failed: {0}")]
    AnnounceFailed(String),

    #[error("lookup failed: {0}")]
    LookupFailed(String),
}

/// Composite error for a dial that exhausted every candidate path.
///
/// Carries the target peer and the ordered list of underlying attempt
/// errors; the source is the first of them.
#[derive(Debug, Error)]
#[error("failed to dial {peer}: {} attempts failed", errors.len())]
pub struct DialError {
    /// The peer the dial targeted.
    pub peer: NodeId,
    /// Underlying errors in attempt order.
    pub errors: Vec<TransportError>,
}

impl DialError {
    /// Create a composite dial error.
    pub fn new(peer: NodeId, errors: Vec<TransportError>) -> Self {
        Self { peer, errors }
    }

    /// The first underlying error, if any attempt was made at all.
    pub fn first(&self) -> Option<&TransportError> {
        self.errors.first()
    }
}

/// Errors surfaced by the connection engine.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("no connection to peer {0}")]
    NoConnection(NodeId),

    #[error("no addresses known for peer {0}")]
    NoAddresses(NodeId),

    #[error("no transport registered for address {0}")]
    NoTransport(String),

    #[error("dial timed out")]
    DialTimeout,

    #[error("cannot dial self")]
    DialToSelf,

    #[error("swarm is closed")]
    SwarmClosed,

    #[error("invalid full address: {0}")]
    InvalidFullAddress(String),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
