//! One-way derivations from the realm key.
//!
//! Both functions are pure and deterministic: every member of a realm
//! derives the identical realm ID and PSK key from the shared secret, and
//! neither output reveals anything about the key.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use dep2p_core::RealmId;

use crate::key::RealmKey;

/// Domain separator for realm ID derivation.
pub const REALM_ID_DOMAIN: &[u8] = b"dep2p-realm-id-v1";

/// HKDF salt for the PSK membership key.
pub const PSK_SALT: &[u8] = b"dep2p-realm-membership-v1";

/// Derive the public realm identifier from the shared key.
///
/// `RealmId = SHA256(domain || SHA256(key))`. The inner hash keeps the key
/// itself out of the outer preimage; the domain tag separates realm IDs
/// from every other SHA-256 use in the stack.
pub fn derive_realm_id(key: &RealmKey) -> RealmId {
    let inner = Sha256::digest(key.as_bytes());
    let mut outer = Sha256::new();
    outer.update(REALM_ID_DOMAIN);
    outer.update(inner);
    let digest = outer.finalize();

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    RealmId::new(bytes)
}

/// Derive the 32-byte PSK MAC key from the shared key.
///
/// HKDF-SHA256 extract with the membership salt. The result is cached by
/// [`crate::proof::PskAuthenticator`] at construction.
pub fn derive_psk_key(key: &RealmKey) -> [u8; 32] {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(PSK_SALT), key.as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&prk);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> RealmKey {
        RealmKey::new([byte; 32])
    }

    #[test]
    fn test_realm_id_deterministic() {
        assert_eq!(derive_realm_id(&key(1)), derive_realm_id(&key(1)));
    }

    #[test]
    fn test_realm_id_differs_by_key() {
        assert_ne!(derive_realm_id(&key(1)), derive_realm_id(&key(2)));
    }

    #[test]
    fn test_realm_id_is_not_plain_hash_of_key() {
        let id = derive_realm_id(&key(1));
        let plain = Sha256::digest(key(1).as_bytes());
        assert_ne!(id.as_bytes().as_slice(), plain.as_slice());
    }

    #[test]
    fn test_psk_key_deterministic_and_distinct() {
        assert_eq!(derive_psk_key(&key(1)), derive_psk_key(&key(1)));
        assert_ne!(derive_psk_key(&key(1)), derive_psk_key(&key(2)));
    }

    #[test]
    fn test_psk_key_differs_from_realm_id() {
        let k = key(7);
        assert_ne!(&derive_psk_key(&k), derive_realm_id(&k).as_bytes());
    }
}
