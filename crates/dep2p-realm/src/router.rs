//! Inbound stream dispatch with realm-context enforcement.
//!
//! The router is installed as the engine's inbound stream handler. System
//! protocols (`/dep2p/sys/...`) are dispatched unconditionally; every other
//! stream requires the connection to carry a verified, unexpired realm
//! context matching the joined realm, and the stream's protocol to be
//! namespaced to that same realm. Streams failing either check are
//! refused: dropped without being handed to any handler.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use dep2p_core::{Connection, DynConnection, DynStream, InboundStreamHandler, Stream};

use crate::auth::{REALM_AUTH_PROTOCOL, RealmAuthService};
use crate::manager::RealmManager;
use crate::namespace::{extract_realm_id, is_system_protocol};
use crate::sync::{REALM_SYNC_PROTOCOL, SyncService};

/// Handler for streams of one protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Handle one stream. The handler owns the stream.
    async fn handle(&self, conn: DynConnection, stream: DynStream);
}

/// Routes inbound streams to protocol handlers, enforcing that non-system
/// traffic only flows on realm-authenticated connections.
pub struct ProtocolRouter {
    manager: Weak<RealmManager>,
    handlers: DashMap<String, Arc<dyn StreamHandler>>,
}

impl ProtocolRouter {
    /// Create a router bound to a manager.
    pub fn new(manager: Weak<RealmManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            handlers: DashMap::new(),
        })
    }

    /// Create a router with the realm-auth and sync system handlers
    /// pre-registered.
    pub fn with_system_handlers(
        manager: Weak<RealmManager>,
        auth: Arc<RealmAuthService>,
        sync: Arc<SyncService>,
    ) -> Arc<Self> {
        let router = Self::new(manager);
        router.register(REALM_AUTH_PROTOCOL, Arc::new(AuthStreamHandler(auth)));
        router.register(REALM_SYNC_PROTOCOL, Arc::new(SyncStreamHandler(sync)));
        router
    }

    /// Register a handler for a full protocol identifier.
    pub fn register(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        self.handlers.insert(protocol.to_string(), handler);
    }

    /// Remove a handler.
    pub fn unregister(&self, protocol: &str) {
        self.handlers.remove(protocol);
    }

    /// Whether a handler is registered for the protocol.
    pub fn has_handler(&self, protocol: &str) -> bool {
        self.handlers.contains_key(protocol)
    }

    /// Whether a stream on `protocol` would currently be admitted on
    /// `conn`. System protocols always pass; everything else needs a valid
    /// matching context.
    pub fn admits(&self, conn: &DynConnection, protocol: &str) -> bool {
        if is_system_protocol(protocol) {
            return true;
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let Some(current) = manager.current_realm_id() else {
            return false;
        };
        let context_ok = conn
            .realm_context()
            .map(|ctx| ctx.is_valid_for(&current))
            .unwrap_or(false);
        if !context_ok {
            return false;
        }
        // The protocol itself must be namespaced to the joined realm.
        matches!(extract_realm_id(protocol), Ok((realm, _)) if realm == current)
    }
}

#[async_trait]
impl InboundStreamHandler for ProtocolRouter {
    async fn handle_stream(&self, conn: DynConnection, stream: DynStream) {
        let protocol = stream.protocol().to_string();
        let peer = conn.remote_peer();

        if !self.admits(&conn, &protocol) {
            warn!(
                peer = %peer.short_id(),
                protocol = %protocol,
                "Refusing stream without valid realm context"
            );
            return;
        }

        match self.handlers.get(&protocol).map(|h| h.clone()) {
            Some(handler) => handler.handle(conn, stream).await,
            None => {
                debug!(peer = %peer.short_id(), protocol = %protocol, "No handler for protocol");
            }
        }
    }
}

struct AuthStreamHandler(Arc<RealmAuthService>);

#[async_trait]
impl StreamHandler for AuthStreamHandler {
    async fn handle(&self, conn: DynConnection, stream: DynStream) {
        self.0.handle_inbound(conn, stream).await;
    }
}

struct SyncStreamHandler(Arc<SyncService>);

#[async_trait]
impl StreamHandler for SyncStreamHandler {
    async fn handle(&self, conn: DynConnection, stream: DynStream) {
        self.0.handle_inbound(conn, stream).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;

    use dep2p_core::mock::MemoryHub;
    use dep2p_core::{
        ConnRealmContext, Listener, Network, NodeId, PeerAddr, RealmId, SwarmError, Transport,
    };
    use dep2p_crypto::{RealmKey, derive_realm_id};

    use crate::manager::JoinOptions;
    use crate::namespace::app_protocol;

    struct NullNetwork {
        local: NodeId,
    }

    #[async_trait]
    impl Network for NullNetwork {
        fn local_peer(&self) -> NodeId {
            self.local
        }

        async fn dial_peer(&self, peer: NodeId) -> Result<DynConnection, SwarmError> {
            Err(SwarmError::NoAddresses(peer))
        }

        fn connections(&self) -> Vec<DynConnection> {
            Vec::new()
        }

        fn connections_to(&self, _peer: &NodeId) -> Vec<DynConnection> {
            Vec::new()
        }

        fn add_address(&self, _peer: NodeId, _addr: PeerAddr) {}

        fn listen_addrs(&self) -> Vec<PeerAddr> {
            Vec::new()
        }
    }

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StreamHandler for CountingHandler {
        async fn handle(&self, _conn: DynConnection, _stream: DynStream) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn node(byte: u8) -> NodeId {
        NodeId::new([byte; 32])
    }

    async fn connected_pair() -> (DynConnection, DynConnection) {
        let hub = MemoryHub::new();
        let t_a = hub.transport(node(1));
        let t_b = hub.transport(node(2));
        let addr = hub.next_addr();
        let listener = t_b.listen(&addr).await.unwrap();
        let conn_a = t_a.dial(&addr, node(2)).await.unwrap();
        let conn_b = listener.accept().await.unwrap();
        (conn_a, conn_b)
    }

    async fn joined_manager(key_byte: u8) -> (Arc<RealmManager>, RealmId) {
        let manager = RealmManager::builder(
            node(1),
            Arc::new(NullNetwork { local: node(1) }),
        )
        .build();
        let key = RealmKey::new([key_byte; 32]);
        let realm = derive_realm_id(&key);
        manager
            .join_realm("test", JoinOptions::new().with_realm_key(key))
            .await
            .unwrap();
        (manager, realm)
    }

    #[tokio::test]
    async fn test_system_protocol_admitted_without_context() {
        let (manager, _) = joined_manager(1).await;
        let router = ProtocolRouter::new(Arc::downgrade(&manager));
        let (conn, _other) = connected_pair().await;

        assert!(router.admits(&conn, "/dep2p/sys/realm/auth/1.0.0"));
        assert!(router.admits(&conn, "/dep2p/sys/ping/1.0.0"));
    }

    #[tokio::test]
    async fn test_app_protocol_requires_valid_context() {
        let (manager, realm) = joined_manager(1).await;
        let router = ProtocolRouter::new(Arc::downgrade(&manager));
        let (conn, _other) = connected_pair().await;
        let protocol = app_protocol(&realm, "/chat/1.0.0").unwrap();

        // No context yet.
        assert!(!router.admits(&conn, &protocol));

        // Expired context.
        conn.set_realm_context(ConnRealmContext::verified(
            realm,
            Utc::now() - chrono::Duration::seconds(1),
        ));
        assert!(!router.admits(&conn, &protocol));

        // Valid context.
        conn.set_realm_context(ConnRealmContext::verified(
            realm,
            Utc::now() + chrono::Duration::hours(1),
        ));
        assert!(router.admits(&conn, &protocol));
    }

    #[tokio::test]
    async fn test_cross_realm_protocol_refused() {
        let (manager, realm) = joined_manager(1).await;
        let router = ProtocolRouter::new(Arc::downgrade(&manager));
        let (conn, _other) = connected_pair().await;

        conn.set_realm_context(ConnRealmContext::verified(
            realm,
            Utc::now() + chrono::Duration::hours(1),
        ));

        // A protocol namespaced to a different realm must be refused even
        // on an authenticated connection.
        let other_realm = derive_realm_id(&RealmKey::new([2u8; 32]));
        let foreign = app_protocol(&other_realm, "/chat/1.0.0").unwrap();
        assert!(!router.admits(&conn, &foreign));
    }

    #[tokio::test]
    async fn test_context_for_wrong_realm_refused() {
        let (manager, realm) = joined_manager(1).await;
        let router = ProtocolRouter::new(Arc::downgrade(&manager));
        let (conn, _other) = connected_pair().await;

        let other_realm = derive_realm_id(&RealmKey::new([2u8; 32]));
        conn.set_realm_context(ConnRealmContext::verified(
            other_realm,
            Utc::now() + chrono::Duration::hours(1),
        ));
        let protocol = app_protocol(&realm, "/chat/1.0.0").unwrap();
        assert!(!router.admits(&conn, &protocol));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_registered_handler() {
        let (manager, realm) = joined_manager(1).await;
        let router = ProtocolRouter::new(Arc::downgrade(&manager));
        let protocol = app_protocol(&realm, "/chat/1.0.0").unwrap();

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        router.register(&protocol, handler.clone());

        let (conn_a, conn_b) = connected_pair().await;
        conn_b.set_realm_context(ConnRealmContext::verified(
            realm,
            Utc::now() + chrono::Duration::hours(1),
        ));

        let _out = conn_a.open_stream(&protocol).await.unwrap();
        let stream = conn_b.accept_stream().await.unwrap();
        router.handle_stream(conn_b, stream).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unauthenticated_dispatch_is_dropped() {
        let (manager, realm) = joined_manager(1).await;
        let router = ProtocolRouter::new(Arc::downgrade(&manager));
        let protocol = app_protocol(&realm, "/chat/1.0.0").unwrap();

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        router.register(&protocol, handler.clone());

        let (conn_a, conn_b) = connected_pair().await;
        let _out = conn_a.open_stream(&protocol).await.unwrap();
        let stream = conn_b.accept_stream().await.unwrap();
        router.handle_stream(conn_b, stream).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
