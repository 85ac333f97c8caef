//! Error types for realm key handling and membership proofs.

use thiserror::Error;

/// Errors from realm key construction.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid realm key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Errors from generating or verifying membership proofs.
///
/// Verification reports the first failed check in the fixed order
/// freshness → peer binding → realm match → MAC.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    /// The proof timestamp is outside the acceptance window.
    #[error("membership proof expired")]
    Expired,

    /// The proof was bound to a different verifier.
    #[error("membership proof bound to a different peer")]
    PeerIdMismatch,

    /// The proof names a realm this authenticator is not configured for.
    #[error("membership proof realm mismatch")]
    RealmMismatch,

    /// The MAC does not verify.
    #[error("invalid membership proof")]
    InvalidProof,

    /// The wire bytes do not parse.
    #[error("malformed membership proof: {0}")]
    Malformed(String),
}
