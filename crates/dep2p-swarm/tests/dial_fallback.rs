//! End-to-end dial behavior over the in-memory transport: fallback order,
//! pooling, back-off, and the liveness sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use dep2p_core::mock::{
    MemoryHub, MemoryPeerstore, MockLiveness, PingBehavior, StaticConnManager,
};
use dep2p_core::{
    ConnManager, ConnType, Connection, DynConnection, DynStream, HolePuncher,
    InboundStreamHandler, NodeId, PeerAddr, Peerstore, RelayDialer, SwarmError, TransportError,
};
use dep2p_swarm::{PathHealthConfig, PathHealthManager, Swarm};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn node(byte: u8) -> NodeId {
    NodeId::new([byte; 32])
}

/// Relay client backed by the hub's circuit plumbing.
struct TestRelayDialer {
    hub: Arc<MemoryHub>,
    local: NodeId,
    relay: NodeId,
    used: AtomicBool,
}

impl TestRelayDialer {
    fn new(hub: Arc<MemoryHub>, local: NodeId, relay: NodeId) -> Arc<Self> {
        Arc::new(Self {
            hub,
            local,
            relay,
            used: AtomicBool::new(false),
        })
    }

    fn was_used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayDialer for TestRelayDialer {
    fn has_relay(&self) -> bool {
        true
    }

    fn relay_node(&self) -> Option<NodeId> {
        Some(self.relay)
    }

    async fn dial_through_relay(&self, target: NodeId) -> Result<DynConnection, TransportError> {
        self.used.store(true, Ordering::SeqCst);
        self.hub.relay_connect(self.local, self.relay, target).await
    }
}

/// Hole puncher that never produces a direct connection.
struct NoopPuncher;

#[async_trait]
impl HolePuncher for NoopPuncher {
    fn is_active(&self, _peer: &NodeId) -> bool {
        false
    }

    async fn direct_connect(&self, _peer: NodeId) -> Result<(), TransportError> {
        Ok(())
    }
}

struct Harness {
    peerstore: Arc<MemoryPeerstore>,
    swarm: Arc<Swarm>,
}

/// A swarm for `local` plus a listening target swarm for `remote`.
async fn two_nodes(local: NodeId, remote: NodeId) -> (Harness, PeerAddr) {
    init_tracing();
    let hub = MemoryHub::new();
    let peerstore = MemoryPeerstore::new();

    let swarm = Swarm::builder(local)
        .with_transport(hub.transport(local))
        .with_peerstore(peerstore.clone())
        .build();

    let remote_swarm = Swarm::builder(remote)
        .with_transport(hub.transport(remote))
        .build();
    let listen_addr = remote_swarm.listen(&hub.next_addr()).await.unwrap();
    // Keep the remote swarm alive for the test's duration.
    std::mem::forget(remote_swarm);

    drop(hub);
    (Harness { peerstore, swarm }, listen_addr)
}

#[tokio::test]
async fn test_direct_dial_and_pool_reuse() {
    let (harness, addr) = two_nodes(node(1), node(2)).await;
    harness.peerstore.add_addr(node(2), addr);

    let conn = harness.swarm.dial_peer(node(2)).await.unwrap();
    assert_eq!(conn.remote_peer(), node(2));
    assert_eq!(conn.conn_type(), ConnType::Direct);

    // Second dial reuses the pooled connection.
    let again = harness.swarm.dial_peer(node(2)).await.unwrap();
    assert_eq!(harness.swarm.stats().connections, 1);
    assert_eq!(again.remote_peer(), node(2));
}

#[tokio::test]
async fn test_dial_to_self_is_refused() {
    let (harness, _) = two_nodes(node(1), node(2)).await;
    assert!(matches!(
        harness.swarm.dial_peer(node(1)).await,
        Err(SwarmError::DialToSelf)
    ));
}

#[tokio::test]
async fn test_unknown_peer_has_no_addresses() {
    let (harness, _) = two_nodes(node(1), node(2)).await;
    assert!(matches!(
        harness.swarm.dial_peer(node(9)).await,
        Err(SwarmError::NoAddresses(_))
    ));
}

#[tokio::test]
async fn test_failing_direct_falls_back_to_relay_addr() {
    init_tracing();
    let hub = MemoryHub::new();
    let peerstore = MemoryPeerstore::new();

    let swarm = Swarm::builder(node(1))
        .with_transport(hub.transport(node(1)))
        .with_peerstore(peerstore.clone())
        .build();

    // Target listens; a relay node also listens so the circuit resolves.
    let target_swarm = Swarm::builder(node(2))
        .with_transport(hub.transport(node(2)))
        .build();
    let target_addr = target_swarm.listen(&hub.next_addr()).await.unwrap();
    let relay_swarm = Swarm::builder(node(3))
        .with_transport(hub.transport(node(3)))
        .build();
    let relay_addr = relay_swarm.listen(&hub.next_addr()).await.unwrap();

    // The direct address always fails; the circuit address works.
    let dead_direct = hub.next_addr();
    hub.fail_dialing(&dead_direct, "filtered");
    peerstore.add_addr(node(2), dead_direct);
    peerstore.add_addr(
        node(2),
        PeerAddr::circuit_through(relay_addr.with_p2p(node(3)), node(2)),
    );

    let conn = swarm.dial_peer(node(2)).await.unwrap();
    assert_eq!(conn.conn_type(), ConnType::Relayed);
    assert_eq!(conn.remote_peer(), node(2));
    assert!(conn.remote_addr().is_circuit());

    // Pool reuse applies to relayed connections too.
    let again = swarm.dial_peer(node(2)).await.unwrap();
    assert_eq!(again.conn_type(), ConnType::Relayed);
    assert_eq!(swarm.stats().connections, 1);

    std::mem::forget((target_swarm, relay_swarm, target_addr));
}

#[tokio::test]
async fn test_working_direct_never_invokes_relay_dialer() {
    init_tracing();
    let hub = MemoryHub::new();
    let peerstore = MemoryPeerstore::new();
    let relay_dialer = TestRelayDialer::new(hub.clone(), node(1), node(3));

    let swarm = Swarm::builder(node(1))
        .with_transport(hub.transport(node(1)))
        .with_peerstore(peerstore.clone())
        .with_relay_dialer(relay_dialer.clone())
        .build();

    let target_swarm = Swarm::builder(node(2))
        .with_transport(hub.transport(node(2)))
        .build();
    let addr = target_swarm.listen(&hub.next_addr()).await.unwrap();
    peerstore.add_addr(node(2), addr);

    let conn = swarm.dial_peer(node(2)).await.unwrap();
    assert_eq!(conn.conn_type(), ConnType::Direct);
    assert!(!relay_dialer.was_used());

    std::mem::forget(target_swarm);
}

#[tokio::test]
async fn test_configured_relay_fallback_without_addresses() {
    init_tracing();
    let hub = MemoryHub::new();
    let relay_dialer = TestRelayDialer::new(hub.clone(), node(1), node(3));

    let swarm = Swarm::builder(node(1))
        .with_transport(hub.transport(node(1)))
        .with_peerstore(MemoryPeerstore::new())
        .with_relay_dialer(relay_dialer.clone())
        .with_hole_puncher(Arc::new(NoopPuncher))
        .build();

    let target_swarm = Swarm::builder(node(2))
        .with_transport(hub.transport(node(2)))
        .build();
    let _addr = target_swarm.listen(&hub.next_addr()).await.unwrap();

    // No peerstore addresses at all: the configured relay carries it.
    let conn = swarm.dial_peer(node(2)).await.unwrap();
    assert_eq!(conn.conn_type(), ConnType::Relayed);
    assert!(relay_dialer.was_used());

    std::mem::forget(target_swarm);
}

#[tokio::test]
async fn test_relay_addr_failure_enters_backoff() {
    init_tracing();
    let hub = MemoryHub::new();
    let peerstore = MemoryPeerstore::new();

    let swarm = Swarm::builder(node(1))
        .with_transport(hub.transport(node(1)))
        .with_peerstore(peerstore.clone())
        .build();

    // A circuit address whose target is not listening anywhere.
    let relay_base = hub.next_addr();
    peerstore.add_addr(
        node(2),
        PeerAddr::circuit_through(relay_base.with_p2p(node(3)), node(2)),
    );

    let err = swarm.dial_peer(node(2)).await.unwrap_err();
    assert!(matches!(err, SwarmError::Dial(_)));
    assert!(swarm.backoff().in_backoff(&node(2), &node(3)));

    // While suppressed the circuit address is not even attempted, so the
    // dial now fails with no addresses at all.
    assert!(matches!(
        swarm.dial_peer(node(2)).await,
        Err(SwarmError::NoAddresses(_))
    ));
    assert_eq!(swarm.backoff().snapshot(&node(2), &node(3)).unwrap().failures, 1);
}

#[tokio::test]
async fn test_peer_id_mismatch_is_fatal_for_address() {
    init_tracing();
    let hub = MemoryHub::new();
    let peerstore = MemoryPeerstore::new();

    let swarm = Swarm::builder(node(1))
        .with_transport(hub.transport(node(1)))
        .with_peerstore(peerstore.clone())
        .build();

    // node(9) actually answers at this address, but we expect node(2).
    let imposter_swarm = Swarm::builder(node(9))
        .with_transport(hub.transport(node(9)))
        .build();
    let addr = imposter_swarm.listen(&hub.next_addr()).await.unwrap();
    peerstore.add_addr(node(2), addr);

    let err = swarm.dial_peer(node(2)).await.unwrap_err();
    match err {
        SwarmError::Dial(dial) => {
            assert!(dial.errors.iter().any(|e| matches!(
                e,
                TransportError::PeerIdMismatch { .. }
            )));
        }
        other => panic!("expected dial error, got {other:?}"),
    }
    assert_eq!(swarm.stats().connections, 0);

    std::mem::forget(imposter_swarm);
}

#[tokio::test]
async fn test_dead_paths_feed_health_manager() {
    init_tracing();
    let hub = MemoryHub::new();
    let peerstore = MemoryPeerstore::new();
    let health = Arc::new(PathHealthManager::new(PathHealthConfig::default()));

    let swarm = Swarm::builder(node(1))
        .with_transport(hub.transport(node(1)))
        .with_peerstore(peerstore.clone())
        .with_path_health(health.clone())
        .build();

    let dead = hub.next_addr();
    hub.fail_dialing(&dead, "filtered");
    peerstore.add_addr(node(2), dead.clone());

    for _ in 0..3 {
        let _ = swarm.dial_peer(node(2)).await;
    }
    assert_eq!(
        health.state(&node(2), &dead),
        dep2p_swarm::PathState::Dead
    );
}

#[tokio::test]
async fn test_inbound_streams_reach_handler() {
    use tokio::sync::mpsc;

    struct Capture {
        tx: mpsc::Sender<String>,
    }

    #[async_trait]
    impl InboundStreamHandler for Capture {
        async fn handle_stream(&self, _conn: DynConnection, stream: DynStream) {
            let _ = self.tx.send(stream.protocol().to_string()).await;
        }
    }

    init_tracing();
    let hub = MemoryHub::new();
    let peerstore = MemoryPeerstore::new();
    let swarm_a = Swarm::builder(node(1))
        .with_transport(hub.transport(node(1)))
        .with_peerstore(peerstore.clone())
        .build();
    let swarm_b = Swarm::builder(node(2))
        .with_transport(hub.transport(node(2)))
        .build();

    let (tx, mut rx) = mpsc::channel(4);
    swarm_b.set_inbound_stream_handler(Arc::new(Capture { tx }));

    let addr = swarm_b.listen(&hub.next_addr()).await.unwrap();
    peerstore.add_addr(node(2), addr);

    let conn = swarm_a.dial_peer(node(2)).await.unwrap();
    let _stream = conn.open_stream("/dep2p/sys/test/1.0.0").await.unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, "/dep2p/sys/test/1.0.0");
}

#[tokio::test]
async fn test_liveness_unsupported_peer_is_cached_until_close() {
    init_tracing();
    let hub = MemoryHub::new();
    let peerstore = MemoryPeerstore::new();
    let liveness = MockLiveness::new();

    let swarm = Swarm::builder(node(1))
        .with_transport(hub.transport(node(1)))
        .with_peerstore(peerstore.clone())
        .with_liveness(liveness.clone())
        .build();
    let target_swarm = Swarm::builder(node(2))
        .with_transport(hub.transport(node(2)))
        .build();
    let addr = target_swarm.listen(&hub.next_addr()).await.unwrap();
    peerstore.add_addr(node(2), addr);

    liveness.set_behavior(node(2), PingBehavior::ProtocolNotSupported);
    swarm.dial_peer(node(2)).await.unwrap();

    swarm.health_sweep().await;
    assert!(swarm.is_no_liveness_peer(&node(2)));
    assert_eq!(liveness.ping_count(&node(2)), 1);
    // The connection itself survives; only pinging stops.
    assert_eq!(swarm.stats().connections, 1);

    // Cached peers are skipped on subsequent sweeps.
    swarm.health_sweep().await;
    assert_eq!(liveness.ping_count(&node(2)), 1);

    // ClosePeer clears the cache.
    swarm.close_peer(&node(2)).await;
    assert!(!swarm.is_no_liveness_peer(&node(2)));

    std::mem::forget(target_swarm);
}

#[tokio::test]
async fn test_liveness_failure_closes_peer() {
    init_tracing();
    let hub = MemoryHub::new();
    let peerstore = MemoryPeerstore::new();
    let liveness = MockLiveness::new();

    let swarm = Swarm::builder(node(1))
        .with_transport(hub.transport(node(1)))
        .with_peerstore(peerstore.clone())
        .with_liveness(liveness.clone())
        .build();
    let target_swarm = Swarm::builder(node(2))
        .with_transport(hub.transport(node(2)))
        .build();
    let addr = target_swarm.listen(&hub.next_addr()).await.unwrap();
    peerstore.add_addr(node(2), addr);

    swarm.dial_peer(node(2)).await.unwrap();
    liveness.set_behavior(node(2), PingBehavior::Fail("unreachable".to_string()));

    swarm.health_sweep().await;
    assert_eq!(swarm.stats().connections, 0);

    std::mem::forget(target_swarm);
}

#[tokio::test]
async fn test_infrastructure_peers_skip_liveness() {
    init_tracing();
    let hub = MemoryHub::new();
    let peerstore = MemoryPeerstore::new();
    let liveness = MockLiveness::new();
    let conn_manager = StaticConnManager::new();

    let swarm = Swarm::builder(node(1))
        .with_transport(hub.transport(node(1)))
        .with_peerstore(peerstore.clone())
        .with_liveness(liveness.clone())
        .with_conn_manager(conn_manager.clone())
        .build();
    let target_swarm = Swarm::builder(node(2))
        .with_transport(hub.transport(node(2)))
        .build();
    let addr = target_swarm.listen(&hub.next_addr()).await.unwrap();
    peerstore.add_addr(node(2), addr);

    conn_manager.tag_peer(node(2), "relay");
    swarm.dial_peer(node(2)).await.unwrap();

    swarm.health_sweep().await;
    assert_eq!(liveness.ping_count(&node(2)), 0);

    std::mem::forget(target_swarm);
}

#[tokio::test]
async fn test_bandwidth_counter_sees_stream_bytes() {
    use dep2p_core::BandwidthCounter;
    use std::sync::atomic::AtomicU64;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct Meter {
        sent: AtomicU64,
    }

    impl BandwidthCounter for Meter {
        fn log_sent(&self, _peer: NodeId, bytes: u64) {
            self.sent.fetch_add(bytes, Ordering::SeqCst);
        }

        fn log_recv(&self, _peer: NodeId, _bytes: u64) {}
    }

    init_tracing();
    let hub = MemoryHub::new();
    let peerstore = MemoryPeerstore::new();
    let meter = Arc::new(Meter::default());

    let swarm = Swarm::builder(node(1))
        .with_transport(hub.transport(node(1)))
        .with_peerstore(peerstore.clone())
        .with_bandwidth_counter(meter.clone())
        .build();
    let target_swarm = Swarm::builder(node(2))
        .with_transport(hub.transport(node(2)))
        .build();
    let addr = target_swarm.listen(&hub.next_addr()).await.unwrap();
    peerstore.add_addr(node(2), addr);

    let conn = swarm.dial_peer(node(2)).await.unwrap();
    let mut stream = conn.open_stream("/dep2p/sys/test/1.0.0").await.unwrap();
    stream.write_all(b"sixteen byte body").await.unwrap();
    stream.flush().await.unwrap();

    assert_eq!(meter.sent.load(Ordering::SeqCst), 17);

    std::mem::forget(target_swarm);
}

#[tokio::test]
async fn test_closed_swarm_refuses_dials() {
    let (harness, addr) = two_nodes(node(1), node(2)).await;
    harness.peerstore.add_addr(node(2), addr);

    harness.swarm.close().await;
    assert!(matches!(
        harness.swarm.dial_peer(node(2)).await,
        Err(SwarmError::SwarmClosed)
    ));
    assert_eq!(harness.swarm.stats().connections, 0);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (harness, _) = two_nodes(node(1), node(2)).await;
    harness.swarm.close().await;
    harness.swarm.close().await;
}
