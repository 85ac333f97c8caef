//! Full-stack realm behavior over the in-memory transport: the auth
//! handshake, the protocol router's enforcement, roster sync, and the
//! leave flow.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use dep2p_core::mock::{MemoryHub, MemoryPeerstore, MockLiveness};
use dep2p_core::{Connection, DynConnection, DynStream, Network, NodeId, PeerAddr};
use dep2p_crypto::{RealmKey, derive_realm_id};
use dep2p_realm::{
    JoinOptions, ProtocolRouter, RealmError, RealmManager, StreamHandler, app_protocol,
};
use dep2p_swarm::Swarm;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn node(byte: u8) -> NodeId {
    NodeId::new([byte; 32])
}

fn key(byte: u8) -> RealmKey {
    RealmKey::new([byte; 32])
}

struct TestNode {
    id: NodeId,
    swarm: Arc<Swarm>,
    manager: Arc<RealmManager>,
    router: Arc<ProtocolRouter>,
    listen_addr: PeerAddr,
}

impl TestNode {
    async fn spawn(hub: &Arc<MemoryHub>, byte: u8, liveness: Option<Arc<MockLiveness>>) -> Self {
        let id = node(byte);
        let swarm = Swarm::builder(id)
            .with_transport(hub.transport(id))
            .with_peerstore(MemoryPeerstore::new())
            .build();
        let listen_addr = swarm.listen(&hub.next_addr()).await.unwrap();

        let mut builder = RealmManager::builder(id, swarm.clone());
        if let Some(liveness) = liveness {
            builder = builder.with_liveness(liveness);
        }
        let manager = builder.build();
        manager.start();

        let router = ProtocolRouter::with_system_handlers(
            Arc::downgrade(&manager),
            manager.auth().clone(),
            manager.sync().clone(),
        );
        swarm.set_inbound_stream_handler(router.clone());

        Self {
            id,
            swarm,
            manager,
            router,
            listen_addr,
        }
    }

    fn knows(&self, other: &TestNode) {
        self.swarm
            .add_address(other.id, other.listen_addr.clone().with_p2p(other.id));
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

#[tokio::test]
async fn test_auth_handshake_stamps_both_ends() {
    init_tracing();
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, 1, None).await;
    let b = TestNode::spawn(&hub, 2, None).await;
    a.knows(&b);

    let realm = derive_realm_id(&key(9));
    a.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();
    b.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();

    let conn = a.swarm.dial_peer(b.id).await.unwrap();
    let ctx = a.manager.auth().outbound(&conn).await.unwrap();
    assert!(ctx.is_valid_for(&realm));
    assert_eq!(conn.realm_context().unwrap().realm, realm);

    // The responder stamped its end too, and fed its caches.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b_conns = b.swarm.connections_to(&a.id);
    assert_eq!(b_conns.len(), 1);
    assert!(b_conns[0]
        .realm_context()
        .map(|ctx| ctx.is_valid_for(&realm))
        .unwrap_or(false));
    assert!(b.manager.cache().is_member(&a.id, &realm));
    assert!(b.manager.realm_peers(&realm).contains(&a.id));
}

#[tokio::test]
async fn test_auth_driver_authenticates_connections() {
    init_tracing();
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, 1, None).await;
    let b = TestNode::spawn(&hub, 2, None).await;
    a.knows(&b);

    let realm = derive_realm_id(&key(9));
    a.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();
    b.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();

    let conn = a.swarm.dial_peer(b.id).await.unwrap();
    assert!(conn.realm_context().is_none());

    // One driver pass starts the outbound handshake.
    a.manager.drive_auth();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(conn
        .realm_context()
        .map(|ctx| ctx.is_valid_for(&realm))
        .unwrap_or(false));
}

#[tokio::test]
async fn test_cross_realm_auth_is_rejected() {
    init_tracing();
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, 1, None).await;
    let b = TestNode::spawn(&hub, 2, None).await;
    a.knows(&b);

    a.manager
        .join_realm("mine", JoinOptions::new().with_realm_key(key(1)))
        .await
        .unwrap();
    b.manager
        .join_realm("theirs", JoinOptions::new().with_realm_key(key(2)))
        .await
        .unwrap();

    let conn = a.swarm.dial_peer(b.id).await.unwrap();
    let err = a.manager.auth().outbound(&conn).await.unwrap_err();
    assert!(matches!(err, RealmError::RealmAuthFailed { .. }));

    // The failure marks nothing and closes nothing.
    assert!(conn.realm_context().is_none());
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_app_streams_flow_only_after_auth() {
    init_tracing();
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, 1, None).await;
    let b = TestNode::spawn(&hub, 2, None).await;
    a.knows(&b);

    let realm = derive_realm_id(&key(9));
    a.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();
    b.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();

    let protocol = app_protocol(&realm, "/chat/1.0.0").unwrap();
    let handler = Arc::new(CountingHandler {
        calls: AtomicUsize::new(0),
    });
    b.router.register(&protocol, handler.clone());

    let conn = a.swarm.dial_peer(b.id).await.unwrap();

    // Before auth: the stream is refused at B's router.
    let _refused = conn.open_stream(&protocol).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

    // After auth: it flows.
    a.manager.auth().outbound(&conn).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _stream = conn.open_stream(&protocol).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sync_pull_merges_roster() {
    init_tracing();
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, 1, None).await;
    let b = TestNode::spawn(&hub, 2, None).await;
    a.knows(&b);
    b.knows(&a);

    let realm = derive_realm_id(&key(9));
    a.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();
    b.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();

    // A knows about a third member that B has never seen.
    a.manager.add_realm_peer(
        &realm,
        node(7),
        vec![PeerAddr::parse("/memory/77").unwrap()],
    );

    // Authenticate, then pull.
    let conn = a.swarm.dial_peer(b.id).await.unwrap();
    a.manager.auth().outbound(&conn).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    b.manager.sync().pull_from(a.id).await.unwrap();
    assert!(b.manager.realm_peers(&realm).contains(&node(7)));
}

#[tokio::test]
async fn test_leave_sends_goodbyes() {
    init_tracing();
    let hub = MemoryHub::new();
    let liveness = MockLiveness::new();
    let a = TestNode::spawn(&hub, 1, Some(liveness.clone())).await;

    let realm = derive_realm_id(&key(9));
    a.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();
    a.manager.add_realm_peer(&realm, node(2), Vec::new());
    a.manager.add_realm_peer(&realm, node(3), Vec::new());

    a.manager.leave_realm().await.unwrap();

    let goodbyes = liveness.goodbyes();
    assert_eq!(goodbyes.len(), 2);
    assert!(goodbyes.iter().all(|(_, reason)| reason == "leaving"));
    assert!(!a.manager.is_member());
    assert_eq!(a.manager.realm_peer_count(&realm), 0);
}

#[tokio::test]
async fn test_realm_facade_namespaces_streams() {
    init_tracing();
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, 1, None).await;
    let b = TestNode::spawn(&hub, 2, None).await;
    a.knows(&b);

    let realm_id = derive_realm_id(&key(9));
    let realm = a
        .manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();
    b.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();

    let protocol = app_protocol(&realm_id, "/echo/1.0.0").unwrap();
    let handler = Arc::new(CountingHandler {
        calls: AtomicUsize::new(0),
    });
    b.router.register(&protocol, handler.clone());

    let conn = a.swarm.dial_peer(b.id).await.unwrap();
    a.manager.auth().outbound(&conn).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The facade prepends /dep2p/app/<realm>/ automatically.
    let _stream = realm.streams().open(b.id, "/echo/1.0.0").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    // Reserved prefixes are refused before anything hits the wire.
    let err = realm
        .streams()
        .open(b.id, "/dep2p/sys/realm/auth/1.0.0")
        .await
        .unwrap_err();
    assert!(matches!(err, RealmError::InvalidProtocol(_)));
}

#[tokio::test]
async fn test_bootstrap_peers_seed_the_roster() {
    init_tracing();
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, 1, None).await;
    let b = TestNode::spawn(&hub, 2, None).await;

    let realm = derive_realm_id(&key(9));
    b.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();

    // A joins knowing only B's bootstrap address.
    let bootstrap = b.listen_addr.clone().with_p2p(b.id);
    a.manager
        .join_realm(
            "biz",
            JoinOptions::new()
                .with_realm_key(key(9))
                .with_bootstrap_peers(vec![bootstrap]),
        )
        .await
        .unwrap();

    // The bootstrap task dials, authenticates, and pulls the roster.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.manager.realm_peers(&realm).contains(&b.id));
    let conns = a.swarm.connections_to(&b.id);
    assert_eq!(conns.len(), 1);
    assert!(conns[0]
        .realm_context()
        .map(|ctx| ctx.is_valid_for(&realm))
        .unwrap_or(false));
}

#[tokio::test]
async fn test_announce_lifecycle() {
    use dep2p_core::mock::MockDiscovery;
    use dep2p_realm::realm_namespace;

    init_tracing();
    let hub = MemoryHub::new();
    let id = node(1);
    let swarm = Swarm::builder(id)
        .with_transport(hub.transport(id))
        .with_peerstore(MemoryPeerstore::new())
        .build();
    let discovery = MockDiscovery::new();
    let manager = RealmManager::builder(id, swarm.clone())
        .with_discovery(discovery.clone())
        .build();
    manager.start();

    let realm = derive_realm_id(&key(9));
    manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();

    // The announce loop fires immediately on join.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let namespace = realm_namespace(&realm);
    assert!(discovery.active_namespaces().contains(&namespace));
    assert!(manager.last_announce().is_some());

    manager.leave_realm().await.unwrap();
    assert!(!discovery.active_namespaces().contains(&namespace));
}

#[tokio::test]
async fn test_skip_dht_registration() {
    use dep2p_core::mock::MockDiscovery;

    init_tracing();
    let hub = MemoryHub::new();
    let id = node(1);
    let swarm = Swarm::builder(id)
        .with_transport(hub.transport(id))
        .with_peerstore(MemoryPeerstore::new())
        .build();
    let discovery = MockDiscovery::new();
    let manager = RealmManager::builder(id, swarm.clone())
        .with_discovery(discovery.clone())
        .build();
    manager.start();

    manager
        .join_realm(
            "quiet",
            JoinOptions::new()
                .with_realm_key(key(9))
                .skip_dht_registration(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(discovery.announce_count(), 0);
}

#[tokio::test]
async fn test_unjoined_initiator_refuses_handshake() {
    init_tracing();
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, 1, None).await;
    let b = TestNode::spawn(&hub, 2, None).await;
    a.knows(&b);

    b.manager
        .join_realm("biz", JoinOptions::new().with_realm_key(key(9)))
        .await
        .unwrap();

    let conn = a.swarm.dial_peer(b.id).await.unwrap();
    let err = a.manager.auth().outbound(&conn).await.unwrap_err();
    assert!(matches!(err, RealmError::NotMember));
}
