//! Realm namespacing for DHT keys, topics, and protocol identifiers.
//!
//! Everything a realm touches on the shared substrate is prefixed with its
//! realm ID so that keys, topics, and protocols from different realms can
//! never collide or be confused: parsing any namespaced string yields at
//! most one realm.

use sha2::{Digest, Sha256};

use dep2p_core::{NodeId, RealmId};

use crate::error::RealmError;

/// Prefix of every application protocol carried for a realm.
pub const APP_PROTOCOL_PREFIX: &str = "/dep2p/app/";

/// Prefix of system protocols, exempt from realm-context checks.
pub const SYS_PROTOCOL_PREFIX: &str = "/dep2p/sys/";

/// Reserved prefix; user protocols may not claim it.
pub const REALM_PROTOCOL_PREFIX: &str = "/dep2p/realm/";

/// Discovery namespace for a realm's presence records.
pub fn realm_namespace(realm: &RealmId) -> String {
    format!("realm/{realm}")
}

/// Discovery namespace for one service within a realm.
pub fn realm_service_namespace(realm: &RealmId, service: &str) -> String {
    format!("realm/{realm}/{service}")
}

/// Pub/sub topic namespace for a realm topic.
pub fn realm_topic_namespace(realm: &RealmId, topic: &str) -> String {
    format!("realm/{realm}/topic/{topic}")
}

/// Extract the realm segment from a `realm/...` namespace string.
///
/// Accepts anything beginning with `realm/` and returns the segment up to
/// the next `/` (or the end of the string).
pub fn parse_realm_from_namespace(s: &str) -> Option<&str> {
    let rest = s.strip_prefix("realm/")?;
    let realm = rest.split('/').next().unwrap_or(rest);
    if realm.is_empty() { None } else { Some(realm) }
}

/// Whether a protocol identifier is a system protocol.
pub fn is_system_protocol(protocol: &str) -> bool {
    protocol.starts_with(SYS_PROTOCOL_PREFIX)
}

/// Check that a user-supplied protocol does not intrude on reserved space.
pub fn validate_user_protocol(protocol: &str) -> Result<(), RealmError> {
    if protocol.is_empty() {
        return Err(RealmError::InvalidProtocol("empty protocol".to_string()));
    }
    if protocol.starts_with(SYS_PROTOCOL_PREFIX) || protocol.starts_with(REALM_PROTOCOL_PREFIX) {
        return Err(RealmError::InvalidProtocol(format!(
            "{protocol} uses a reserved prefix"
        )));
    }
    Ok(())
}

/// The full on-wire identifier of a user protocol within a realm:
/// `/dep2p/app/<realm>/<protocol>`.
pub fn app_protocol(realm: &RealmId, protocol: &str) -> Result<String, RealmError> {
    validate_user_protocol(protocol)?;
    let protocol = protocol.strip_prefix('/').unwrap_or(protocol);
    Ok(format!("{APP_PROTOCOL_PREFIX}{realm}/{protocol}"))
}

/// Parse a full application protocol back into its realm and user parts.
pub fn extract_realm_id(full: &str) -> Result<(RealmId, String), RealmError> {
    let rest = full
        .strip_prefix(APP_PROTOCOL_PREFIX)
        .ok_or_else(|| RealmError::InvalidProtocol(format!("{full} is not an app protocol")))?;
    let (realm_part, proto_part) = rest
        .split_once('/')
        .ok_or_else(|| RealmError::InvalidProtocol(format!("{full} has no protocol suffix")))?;
    let realm = RealmId::from_hex(realm_part)
        .map_err(|_| RealmError::InvalidProtocol(format!("bad realm id in {full}")))?;
    if proto_part.is_empty() {
        return Err(RealmError::InvalidProtocol(format!(
            "{full} has an empty protocol suffix"
        )));
    }
    Ok((realm, proto_part.to_string()))
}

/// Realm-aware DHT key for a node's presence record.
///
/// Inside a realm: `SHA256("dep2p/v1/realm/<realm>/peer/<node>")`; outside:
/// `SHA256("dep2p/v1/sys/peer/<node>")`. The two namespaces can never
/// collide because the preimages differ structurally.
pub fn realm_dht_key(node: &NodeId, realm: Option<&RealmId>) -> [u8; 32] {
    let preimage = match realm {
        Some(realm) => format!("dep2p/v1/realm/{realm}/peer/{node}"),
        None => format!("dep2p/v1/sys/peer/{node}"),
    };
    let digest = Sha256::digest(preimage.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}
