//! # dep2p Realm
//!
//! Tenant isolation over a shared transport substrate.
//!
//! A realm is a business-level overlay network: many realms share the same
//! physical peers, discovery service, and relays, yet members of one realm
//! cannot discover, address, or exchange traffic with members of another.
//! This crate provides:
//!
//! - [`RealmManager`]: the single-realm lifecycle, peer roster, and
//!   background loops (announce, auth driver, sync)
//! - [`AccessController`]: Public/Protected/Private gating with join keys
//!   and single-use invites
//! - [`MembershipCache`]: short-TTL verified-membership lookups
//! - [`RealmAuthService`]: the per-connection authentication handshake
//! - [`SyncService`]: roster gossip on the realm-sync system protocol
//! - [`ProtocolRouter`]: stream dispatch refusing non-system traffic on
//!   unauthenticated connections
//! - [`namespace`]: DHT-key, topic, and protocol namespacing

pub mod access;
pub mod auth;
pub mod cache;
pub mod error;
pub mod manager;
pub mod namespace;
pub mod realm;
pub mod router;
pub mod sync;

pub use access::{AccessController, AccessLevel, INVITE_TTL, InviteEnvelope, RosterHook};
pub use auth::{
    AUTH_FRESHNESS_WINDOW_SECS, AuthErrorCode, AuthMsgType, MAX_AUTH_PAYLOAD, MembershipView,
    REALM_AUTH_PROTOCOL, RealmAuthConfig, RealmAuthRequest, RealmAuthResponse, RealmAuthService,
};
pub use cache::{CacheStats, DEFAULT_TTL, MembershipCache};
pub use error::{RealmError, Result};
pub use manager::{
    JoinOptions, ManagerConfig, PeerInfo, RealmManager, RealmManagerBuilder, RealmMetadata,
};
pub use namespace::{
    APP_PROTOCOL_PREFIX, SYS_PROTOCOL_PREFIX, app_protocol, extract_realm_id, is_system_protocol,
    parse_realm_from_namespace, realm_dht_key, realm_namespace, realm_service_namespace,
    realm_topic_namespace, validate_user_protocol,
};
pub use realm::{Realm, RealmDiscovery, RealmMessaging, RealmPubSub, RealmRelay, RealmStreams};
pub use router::{ProtocolRouter, StreamHandler};
pub use sync::{
    MAX_SYNC_PAYLOAD, MemberEntry, REALM_SYNC_PROTOCOL, RosterView, SyncConfig, SyncMessage,
    SyncMsgType, SyncService,
};
