//! PSK membership proofs.
//!
//! A proof demonstrates knowledge of the realm key to one specific peer:
//! the MAC binds the prover's node ID, the realm, the intended verifier,
//! a random nonce, and a timestamp. Proofs authenticate a single request
//! (a relay dial or a direct membership check); they are not session keys
//! and carry no confidentiality.

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use dep2p_core::{NodeId, RealmId};

use crate::derive::{derive_psk_key, derive_realm_id};
use crate::error::ProofError;
use crate::key::RealmKey;

type HmacSha256 = Hmac<Sha256>;

/// Nonce length in bytes.
pub const NONCE_LENGTH: usize = 16;

/// MAC length in bytes.
pub const MAC_LENGTH: usize = 32;

/// Encoded proof length: node + realm + peer + nonce + timestamp + mac.
pub const PROOF_LENGTH: usize = 32 + 32 + 32 + NONCE_LENGTH + 8 + MAC_LENGTH;

/// Acceptance window for proof timestamps, seconds either side of now.
pub const FRESHNESS_WINDOW_SECS: i64 = 5 * 60;

/// A one-shot proof of realm membership bound to a single verifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipProof {
    /// The proving node.
    pub node: NodeId,
    /// The realm membership is claimed in.
    pub realm: RealmId,
    /// The peer the proof is addressed to; anyone else must reject it.
    pub peer: NodeId,
    /// Random nonce.
    pub nonce: [u8; NONCE_LENGTH],
    /// Creation time, Unix seconds.
    pub timestamp: i64,
    /// HMAC-SHA256 over the canonical field concatenation.
    pub mac: [u8; MAC_LENGTH],
}

impl MembershipProof {
    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PROOF_LENGTH);
        out.extend_from_slice(self.node.as_bytes());
        out.extend_from_slice(self.realm.as_bytes());
        out.extend_from_slice(self.peer.as_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.mac);
        out
    }

    /// Decode from the fixed wire layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProofError> {
        if bytes.len() != PROOF_LENGTH {
            return Err(ProofError::Malformed(format!(
                "expected {PROOF_LENGTH} bytes, got {}",
                bytes.len()
            )));
        }
        let field = |range: std::ops::Range<usize>| &bytes[range];

        let node = NodeId::from_bytes(field(0..32))
            .map_err(|e| ProofError::Malformed(e.to_string()))?;
        let realm = RealmId::from_bytes(field(32..64))
            .map_err(|e| ProofError::Malformed(e.to_string()))?;
        let peer = NodeId::from_bytes(field(64..96))
            .map_err(|e| ProofError::Malformed(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(field(96..112));

        let timestamp = i64::from_be_bytes(
            field(112..120)
                .try_into()
                .map_err(|_| ProofError::Malformed("bad timestamp".to_string()))?,
        );

        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(field(120..152));

        Ok(Self {
            node,
            realm,
            peer,
            nonce,
            timestamp,
            mac,
        })
    }

    /// The canonical MAC input: `node ‖ realm ‖ peer ‖ nonce ‖ timestamp`.
    fn mac_input(&self) -> Vec<u8> {
        let mut input = Vec::with_capacity(PROOF_LENGTH - MAC_LENGTH);
        input.extend_from_slice(self.node.as_bytes());
        input.extend_from_slice(self.realm.as_bytes());
        input.extend_from_slice(self.peer.as_bytes());
        input.extend_from_slice(&self.nonce);
        input.extend_from_slice(&self.timestamp.to_be_bytes());
        input
    }
}

/// Generates and verifies membership proofs for one joined realm.
///
/// Holds the node identity, the derived realm ID, and the HKDF-derived MAC
/// key, all fixed at construction.
pub struct PskAuthenticator {
    node: NodeId,
    realm: RealmId,
    psk: [u8; 32],
}

impl PskAuthenticator {
    /// Build an authenticator for the given node and realm key.
    pub fn new(node: NodeId, realm_key: &RealmKey) -> Self {
        Self {
            node,
            realm: derive_realm_id(realm_key),
            psk: derive_psk_key(realm_key),
        }
    }

    /// The realm this authenticator proves membership in.
    pub fn realm_id(&self) -> RealmId {
        self.realm
    }

    /// The local node identity.
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Generate a proof addressed to `peer`.
    pub fn generate(&self, peer: NodeId) -> MembershipProof {
        let mut nonce = [0u8; NONCE_LENGTH];
        rand::rng().fill_bytes(&mut nonce);

        let mut proof = MembershipProof {
            node: self.node,
            realm: self.realm,
            peer,
            nonce,
            timestamp: Utc::now().timestamp(),
            mac: [0u8; MAC_LENGTH],
        };
        proof.mac = self.compute_mac(&proof);
        proof
    }

    /// Verify a proof addressed to `expected_peer`.
    ///
    /// Checks run in a fixed order so a forger learns nothing beyond the
    /// first public failure: freshness, peer binding, realm match, then the
    /// MAC under a constant-time comparison.
    pub fn verify(
        &self,
        proof: &MembershipProof,
        expected_peer: NodeId,
    ) -> Result<(), ProofError> {
        self.verify_at(proof, expected_peer, Utc::now().timestamp())
    }

    /// Verify against an explicit clock (for testing).
    pub fn verify_at(
        &self,
        proof: &MembershipProof,
        expected_peer: NodeId,
        now: i64,
    ) -> Result<(), ProofError> {
        if (now - proof.timestamp).abs() > FRESHNESS_WINDOW_SECS {
            return Err(ProofError::Expired);
        }
        if proof.peer != expected_peer {
            return Err(ProofError::PeerIdMismatch);
        }
        if proof.realm != self.realm {
            return Err(ProofError::RealmMismatch);
        }

        let mut mac = HmacSha256::new_from_slice(&self.psk)
            .expect("HMAC accepts any key length");
        mac.update(&proof.mac_input());
        mac.verify_slice(&proof.mac)
            .map_err(|_| ProofError::InvalidProof)
    }

    fn compute_mac(&self, proof: &MembershipProof) -> [u8; MAC_LENGTH] {
        let mut mac = HmacSha256::new_from_slice(&self.psk)
            .expect("HMAC accepts any key length");
        mac.update(&proof.mac_input());
        let digest = mac.finalize().into_bytes();

        let mut out = [0u8; MAC_LENGTH];
        out.copy_from_slice(&digest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId::new([byte; 32])
    }

    fn authenticator(node_byte: u8, key_byte: u8) -> PskAuthenticator {
        PskAuthenticator::new(node(node_byte), &RealmKey::new([key_byte; 32]))
    }

    #[test]
    fn test_generate_verify_roundtrip() {
        let alice = authenticator(1, 9);
        let bob = authenticator(2, 9);

        let proof = alice.generate(node(2));
        assert!(bob.verify(&proof, node(2)).is_ok());
    }

    #[test]
    fn test_peer_binding() {
        let alice = authenticator(1, 9);
        let bob = authenticator(2, 9);

        let proof = alice.generate(node(2));
        assert_eq!(
            bob.verify(&proof, node(3)),
            Err(ProofError::PeerIdMismatch)
        );
    }

    #[test]
    fn test_realm_mismatch_for_other_key() {
        let alice = authenticator(1, 9);
        let carol = authenticator(3, 8);

        let proof = alice.generate(node(3));
        assert_eq!(
            carol.verify(&proof, node(3)),
            Err(ProofError::RealmMismatch)
        );
    }

    #[test]
    fn test_tampering_invalidates_mac() {
        let alice = authenticator(1, 9);
        let bob = authenticator(2, 9);

        let mut proof = alice.generate(node(2));
        proof.nonce[0] ^= 0x01;
        assert_eq!(bob.verify(&proof, node(2)), Err(ProofError::InvalidProof));

        let mut proof = alice.generate(node(2));
        proof.mac[31] ^= 0x80;
        assert_eq!(bob.verify(&proof, node(2)), Err(ProofError::InvalidProof));
    }

    #[test]
    fn test_stale_proof_rejected() {
        let alice = authenticator(1, 9);
        let bob = authenticator(2, 9);

        let proof = alice.generate(node(2));
        let later = proof.timestamp + FRESHNESS_WINDOW_SECS + 1;
        assert_eq!(
            bob.verify_at(&proof, node(2), later),
            Err(ProofError::Expired)
        );

        // Future-dated proofs are equally stale.
        let earlier = proof.timestamp - FRESHNESS_WINDOW_SECS - 1;
        assert_eq!(
            bob.verify_at(&proof, node(2), earlier),
            Err(ProofError::Expired)
        );
    }

    #[test]
    fn test_wire_roundtrip() {
        let alice = authenticator(1, 9);
        let proof = alice.generate(node(2));

        let bytes = proof.encode();
        assert_eq!(bytes.len(), PROOF_LENGTH);
        assert_eq!(MembershipProof::decode(&bytes).unwrap(), proof);
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert!(matches!(
            MembershipProof::decode(&[0u8; 10]),
            Err(ProofError::Malformed(_))
        ));
    }

    #[test]
    fn test_altered_wire_bytes_fail_verification() {
        let alice = authenticator(1, 9);
        let bob = authenticator(2, 9);
        let proof = alice.generate(node(2));

        // Flip one byte anywhere in the MAC'd region.
        let mut bytes = proof.encode();
        bytes[40] ^= 0xff;
        let altered = MembershipProof::decode(&bytes).unwrap();
        assert!(bob.verify(&altered, node(2)).is_err());
    }
}
