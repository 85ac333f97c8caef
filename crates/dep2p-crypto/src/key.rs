//! The realm's shared secret key.

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::KeyError;

/// Length of a realm key in bytes.
pub const REALM_KEY_LENGTH: usize = 32;

/// The shared secret of a realm, the only ticket of membership.
///
/// The key is zeroized on drop and its `Debug` rendering is redacted; it
/// must never appear in logs or on the wire. Everything public about a
/// realm is derived from it one-way (see [`crate::derive`]).
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RealmKey([u8; REALM_KEY_LENGTH]);

impl RealmKey {
    /// Wrap existing key material.
    pub const fn new(bytes: [u8; REALM_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; REALM_KEY_LENGTH];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; REALM_KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: REALM_KEY_LENGTH,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// The raw key bytes. Handle with care; never log or transmit.
    pub fn as_bytes(&self) -> &[u8; REALM_KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for RealmKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RealmKey(..)")
    }
}
