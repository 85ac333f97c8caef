//! # dep2p Crypto
//!
//! Realm identity derivation and PSK membership proofs.
//!
//! - [`RealmKey`]: the 32-byte shared secret of a realm
//! - [`derive_realm_id`] / [`derive_psk_key`]: one-way derivations
//! - [`PskAuthenticator`]: generates and verifies [`MembershipProof`]s
//!   bound to a single intended verifier

pub mod derive;
pub mod error;
pub mod key;
pub mod proof;

pub use derive::{PSK_SALT, REALM_ID_DOMAIN, derive_psk_key, derive_realm_id};
pub use error::{KeyError, ProofError};
pub use key::{REALM_KEY_LENGTH, RealmKey};
pub use proof::{
    FRESHNESS_WINDOW_SECS, MAC_LENGTH, MembershipProof, NONCE_LENGTH, PROOF_LENGTH,
    PskAuthenticator,
};
