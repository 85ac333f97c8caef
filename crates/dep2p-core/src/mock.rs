//! In-memory transport and collaborator fakes for testing.
//!
//! Provides a complete [`Transport`] implementation over in-process
//! channels, plus simple implementations of the peerstore, conn-manager,
//! liveness, and discovery contracts. The [`MemoryHub`] wires nodes
//! together; dial failures can be scripted per address to exercise
//! fallback paths without real sockets.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{Mutex, mpsc, watch};

use crate::addr::{PeerAddr, Segment};
use crate::context::{ConnRealmContext, RealmContextCell};
use crate::error::{DiscoveryError, LivenessError, TransportError};
use crate::identity::NodeId;
use crate::traits::{
    ConnManager, ConnType, Connection, Discovery, DynConnection, DynStream, Listener, Liveness,
    Peerstore, Stream, Transport,
};

/// Buffer size of the in-memory byte pipes.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Depth of per-connection stream queues.
const STREAM_QUEUE: usize = 64;

// ============================================================
// Streams
// ============================================================

/// One half of an in-memory bidirectional stream.
pub struct MemoryStream {
    protocol: String,
    io: DuplexStream,
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl MemoryStream {
    fn pair(protocol: &str) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
        (
            Self {
                protocol: protocol.to_string(),
                io: a,
            },
            Self {
                protocol: protocol.to_string(),
                io: b,
            },
        )
    }
}

impl Stream for MemoryStream {
    fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

// ============================================================
// Connections
// ============================================================

/// One endpoint of an in-memory connection.
pub struct MemoryConnection {
    remote: NodeId,
    remote_addr: PeerAddr,
    conn_type: ConnType,
    outgoing: mpsc::Sender<MemoryStream>,
    incoming: Mutex<mpsc::Receiver<MemoryStream>>,
    closed: Arc<watch::Sender<bool>>,
    ctx: RealmContextCell,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("remote", &self.remote)
            .field("remote_addr", &self.remote_addr)
            .field("conn_type", &self.conn_type)
            .finish()
    }
}

impl MemoryConnection {
    /// Create a linked pair of connection endpoints.
    ///
    /// The first endpoint sees `remote_b` as its peer, the second sees
    /// `remote_a`.
    pub fn pair(
        remote_a: NodeId,
        addr_a: PeerAddr,
        remote_b: NodeId,
        addr_b: PeerAddr,
        conn_type: ConnType,
    ) -> (Arc<Self>, Arc<Self>) {
        let (tx_ab, rx_ab) = mpsc::channel(STREAM_QUEUE);
        let (tx_ba, rx_ba) = mpsc::channel(STREAM_QUEUE);
        let closed = Arc::new(watch::channel(false).0);

        let a = Arc::new(Self {
            remote: remote_b,
            remote_addr: addr_b,
            conn_type,
            outgoing: tx_ab,
            incoming: Mutex::new(rx_ba),
            closed: closed.clone(),
            ctx: RealmContextCell::new(),
        });
        let b = Arc::new(Self {
            remote: remote_a,
            remote_addr: addr_a,
            conn_type,
            outgoing: tx_ba,
            incoming: Mutex::new(rx_ab),
            closed,
            ctx: RealmContextCell::new(),
        });
        (a, b)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn remote_peer(&self) -> NodeId {
        self.remote
    }

    fn remote_addr(&self) -> PeerAddr {
        self.remote_addr.clone()
    }

    fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    async fn open_stream(&self, protocol: &str) -> Result<DynStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let (local, remote) = MemoryStream::pair(protocol);
        self.outgoing
            .send(remote)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(Box::new(local))
    }

    async fn accept_stream(&self) -> Result<DynStream, TransportError> {
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => Err(TransportError::ConnectionClosed),
            stream = incoming.recv() => match stream {
                Some(stream) => Ok(Box::new(stream) as DynStream),
                None => Err(TransportError::ConnectionClosed),
            },
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn realm_context(&self) -> Option<ConnRealmContext> {
        self.ctx.get()
    }

    fn set_realm_context(&self, ctx: ConnRealmContext) {
        self.ctx.set(ctx);
    }
}

// ============================================================
// Hub and transport
// ============================================================

struct ListenerEntry {
    node: NodeId,
    listen_addr: PeerAddr,
    tx: mpsc::Sender<DynConnection>,
}

/// Shared in-process switchboard connecting [`MemoryTransport`] instances.
#[derive(Default)]
pub struct MemoryHub {
    listeners: DashMap<String, ListenerEntry>,
    fail_addrs: DashMap<String, String>,
    next_id: AtomicU64,
}

impl MemoryHub {
    /// Create a new hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a fresh `/memory/<n>` address.
    pub fn next_addr(&self) -> PeerAddr {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        PeerAddr::from_segments(vec![Segment::Memory(id)])
    }

    /// Create a transport for a node attached to this hub.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            hub: self.clone(),
            node,
            local_addr: self.next_addr(),
        })
    }

    /// Script every dial of `addr` to fail with the given reason.
    pub fn fail_dialing(&self, addr: &PeerAddr, reason: &str) {
        self.fail_addrs
            .insert(memory_key(addr), reason.to_string());
    }

    /// Remove a scripted failure.
    pub fn heal(&self, addr: &PeerAddr) {
        self.fail_addrs.remove(&memory_key(addr));
    }

    /// Establish a relayed connection pair to a listening target, as the
    /// relay circuit protocol would.
    ///
    /// The returned endpoint is the dialer's half; the target's half is
    /// delivered through its listener.
    pub async fn relay_connect(
        &self,
        dialer: NodeId,
        relay: NodeId,
        target: NodeId,
    ) -> Result<DynConnection, TransportError> {
        let tx = self
            .listeners
            .iter()
            .find(|e| e.value().node == target)
            .map(|e| e.value().tx.clone())
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!(
                    "no route through relay to {}",
                    target.short_id()
                ))
            })?;

        let relay_base = self
            .listeners
            .iter()
            .find(|e| e.value().node == relay)
            .map(|e| e.value().listen_addr.clone())
            .unwrap_or_else(|| self.next_addr());

        let dialer_circuit = PeerAddr::circuit_through(relay_base.clone().with_p2p(relay), dialer);
        let target_circuit = PeerAddr::circuit_through(relay_base.with_p2p(relay), target);

        let (dial_half, accept_half) = MemoryConnection::pair(
            dialer,
            dialer_circuit,
            target,
            target_circuit,
            ConnType::Relayed,
        );
        tx.send(accept_half)
            .await
            .map_err(|_| TransportError::ConnectionFailed("listener closed".to_string()))?;
        Ok(dial_half)
    }

    fn register(
        &self,
        addr: &PeerAddr,
        node: NodeId,
        tx: mpsc::Sender<DynConnection>,
    ) -> Result<(), TransportError> {
        let key = memory_key(addr);
        if self.listeners.contains_key(&key) {
            return Err(TransportError::ListenFailed(format!(
                "address {addr} already bound"
            )));
        }
        self.listeners.insert(
            key,
            ListenerEntry {
                node,
                listen_addr: addr.clone(),
                tx,
            },
        );
        Ok(())
    }

    fn unregister(&self, addr: &PeerAddr) {
        self.listeners.remove(&memory_key(addr));
    }
}

/// The `/memory/<n>` portion of an address, used as the hub routing key.
fn memory_key(addr: &PeerAddr) -> String {
    addr.segments()
        .iter()
        .find_map(|s| match s {
            Segment::Memory(id) => Some(format!("/memory/{id}")),
            _ => None,
        })
        .unwrap_or_else(|| addr.to_string())
}

/// In-memory transport attached to a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    node: NodeId,
    local_addr: PeerAddr,
}

impl MemoryTransport {
    /// The synthetic address of this transport endpoint.
    pub fn local_addr(&self) -> PeerAddr {
        self.local_addr.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn protocols(&self) -> Vec<&'static str> {
        vec!["memory"]
    }

    async fn dial(&self, addr: &PeerAddr, _peer: NodeId) -> Result<DynConnection, TransportError> {
        let key = memory_key(addr);
        if let Some(reason) = self.hub.fail_addrs.get(&key) {
            return Err(TransportError::ConnectionFailed(reason.clone()));
        }
        if addr.is_circuit() {
            let relay = addr.relay_node().ok_or_else(|| {
                TransportError::ConnectionFailed("circuit address names no relay".to_string())
            })?;
            let target = addr.node_id().ok_or_else(|| {
                TransportError::ConnectionFailed("circuit address names no target".to_string())
            })?;
            return self.hub.relay_connect(self.node, relay, target).await;
        }
        let (listener_node, tx) = self
            .hub
            .listeners
            .get(&key)
            .map(|e| (e.node, e.tx.clone()))
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("nothing listening at {addr}"))
            })?;

        let dialer_addr = self.local_addr.clone().with_p2p(self.node);
        let (dial_half, accept_half) = MemoryConnection::pair(
            self.node,
            dialer_addr,
            listener_node,
            addr.clone(),
            ConnType::Direct,
        );
        tx.send(accept_half)
            .await
            .map_err(|_| TransportError::ConnectionFailed("listener closed".to_string()))?;
        Ok(dial_half)
    }

    async fn listen(&self, addr: &PeerAddr) -> Result<Arc<dyn Listener>, TransportError> {
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.hub.register(addr, self.node, tx)?;
        Ok(Arc::new(MemoryListener {
            hub: self.hub.clone(),
            addr: addr.clone(),
            incoming: Mutex::new(rx),
            closed: watch::channel(false).0,
        }))
    }
}

/// Listener half of the in-memory transport.
pub struct MemoryListener {
    hub: Arc<MemoryHub>,
    addr: PeerAddr,
    incoming: Mutex<mpsc::Receiver<DynConnection>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_addr(&self) -> PeerAddr {
        self.addr.clone()
    }

    async fn accept(&self) -> Result<DynConnection, TransportError> {
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => Err(TransportError::ConnectionClosed),
            conn = incoming.recv() => {
                conn.ok_or(TransportError::ConnectionClosed)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.send_replace(true);
        self.hub.unregister(&self.addr);
        Ok(())
    }
}

// ============================================================
// Collaborator fakes
// ============================================================

/// In-memory peerstore.
#[derive(Default)]
pub struct MemoryPeerstore {
    addrs: DashMap<NodeId, Vec<PeerAddr>>,
}

impl MemoryPeerstore {
    /// Create an empty peerstore.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Peerstore for MemoryPeerstore {
    fn addrs(&self, peer: &NodeId) -> Vec<PeerAddr> {
        self.addrs.get(peer).map(|a| a.clone()).unwrap_or_default()
    }

    fn add_addr(&self, peer: NodeId, addr: PeerAddr) {
        let mut entry = self.addrs.entry(peer).or_default();
        if !entry.contains(&addr) {
            entry.push(addr);
        }
    }

    fn remove_peer(&self, peer: &NodeId) {
        self.addrs.remove(peer);
    }
}

/// Tag-only connection manager.
#[derive(Default)]
pub struct StaticConnManager {
    tags: DashMap<NodeId, Vec<String>>,
}

impl StaticConnManager {
    /// Create an empty tag table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ConnManager for StaticConnManager {
    fn tags(&self, peer: &NodeId) -> Vec<String> {
        self.tags.get(peer).map(|t| t.clone()).unwrap_or_default()
    }

    fn tag_peer(&self, peer: NodeId, tag: &str) {
        let mut entry = self.tags.entry(peer).or_default();
        if !entry.iter().any(|t| t == tag) {
            entry.push(tag.to_string());
        }
    }
}

/// Scripted ping behavior for [`MockLiveness`].
#[derive(Clone, Debug)]
pub enum PingBehavior {
    /// Respond successfully with the given RTT.
    Success(Duration),
    /// The remote does not speak the liveness protocol.
    ProtocolNotSupported,
    /// The ping fails outright.
    Fail(String),
}

/// Scriptable liveness fake recording pings and goodbyes.
pub struct MockLiveness {
    behaviors: DashMap<NodeId, PingBehavior>,
    ping_counts: DashMap<NodeId, u64>,
    goodbyes: std::sync::Mutex<Vec<(NodeId, String)>>,
}

impl Default for MockLiveness {
    fn default() -> Self {
        Self {
            behaviors: DashMap::new(),
            ping_counts: DashMap::new(),
            goodbyes: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl MockLiveness {
    /// Create a fake where every ping succeeds quickly.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the ping behavior for one peer.
    pub fn set_behavior(&self, peer: NodeId, behavior: PingBehavior) {
        self.behaviors.insert(peer, behavior);
    }

    /// Number of pings issued to a peer.
    pub fn ping_count(&self, peer: &NodeId) -> u64 {
        self.ping_counts.get(peer).map(|c| *c).unwrap_or(0)
    }

    /// Recorded goodbye calls in order.
    pub fn goodbyes(&self) -> Vec<(NodeId, String)> {
        self.goodbyes.lock().expect("goodbye lock poisoned").clone()
    }
}

#[async_trait]
impl Liveness for MockLiveness {
    async fn ping(&self, peer: NodeId) -> Result<Duration, LivenessError> {
        *self.ping_counts.entry(peer).or_insert(0) += 1;
        match self
            .behaviors
            .get(&peer)
            .map(|b| b.clone())
            .unwrap_or(PingBehavior::Success(Duration::from_millis(10)))
        {
            PingBehavior::Success(rtt) => Ok(rtt),
            PingBehavior::ProtocolNotSupported => Err(LivenessError::ProtocolNotSupported),
            PingBehavior::Fail(reason) => Err(LivenessError::Unreachable(reason)),
        }
    }

    async fn goodbye(&self, peer: NodeId, reason: &str) -> Result<(), LivenessError> {
        self.goodbyes
            .lock()
            .expect("goodbye lock poisoned")
            .push((peer, reason.to_string()));
        Ok(())
    }
}

/// Discovery fake recording announcements and serving scripted peers.
#[derive(Default)]
pub struct MockDiscovery {
    active: DashMap<String, ()>,
    peers: DashMap<String, Vec<(NodeId, Vec<PeerAddr>)>>,
    announce_count: AtomicU64,
}

impl MockDiscovery {
    /// Create an empty discovery fake.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the peers returned for a namespace.
    pub fn set_peers(&self, namespace: &str, peers: Vec<(NodeId, Vec<PeerAddr>)>) {
        self.peers.insert(namespace.to_string(), peers);
    }

    /// Namespaces currently announced.
    pub fn active_namespaces(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Total announce calls, including re-announcements.
    pub fn announce_count(&self) -> u64 {
        self.announce_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn announce(&self, namespace: &str) -> Result<(), DiscoveryError> {
        self.announce_count.fetch_add(1, Ordering::Relaxed);
        self.active.insert(namespace.to_string(), ());
        Ok(())
    }

    async fn stop_announce(&self, namespace: &str) -> Result<(), DiscoveryError> {
        self.active.remove(namespace);
        Ok(())
    }

    async fn find_peers(
        &self,
        namespace: &str,
    ) -> Result<Vec<(NodeId, Vec<PeerAddr>)>, DiscoveryError> {
        Ok(self
            .peers
            .get(namespace)
            .map(|p| p.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn node(byte: u8) -> NodeId {
        NodeId::new([byte; 32])
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let hub = MemoryHub::new();
        let t_a = hub.transport(node(1));
        let t_b = hub.transport(node(2));

        let listen_addr = hub.next_addr();
        let listener = t_b.listen(&listen_addr).await.unwrap();

        let conn_a = t_a.dial(&listen_addr, node(2)).await.unwrap();
        let conn_b = listener.accept().await.unwrap();

        assert_eq!(conn_a.remote_peer(), node(2));
        assert_eq!(conn_b.remote_peer(), node(1));
        assert_eq!(conn_a.conn_type(), ConnType::Direct);
    }

    #[tokio::test]
    async fn test_stream_exchange() {
        let hub = MemoryHub::new();
        let t_a = hub.transport(node(1));
        let t_b = hub.transport(node(2));

        let listen_addr = hub.next_addr();
        let listener = t_b.listen(&listen_addr).await.unwrap();
        let conn_a = t_a.dial(&listen_addr, node(2)).await.unwrap();
        let conn_b = listener.accept().await.unwrap();

        let mut out = conn_a.open_stream("/test/1.0.0").await.unwrap();
        out.write_all(b"ping").await.unwrap();
        out.flush().await.unwrap();

        let mut inbound = conn_b.accept_stream().await.unwrap();
        assert_eq!(inbound.protocol(), "/test/1.0.0");
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let hub = MemoryHub::new();
        let t_a = hub.transport(node(1));
        let t_b = hub.transport(node(2));

        let listen_addr = hub.next_addr();
        let listener = t_b.listen(&listen_addr).await.unwrap();
        let conn_a = t_a.dial(&listen_addr, node(2)).await.unwrap();
        let conn_b = listener.accept().await.unwrap();

        let accepting = tokio::spawn(async move { conn_b.accept_stream().await });
        conn_a.close().await.unwrap();
        let result = accepting.await.unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_scripted_dial_failure() {
        let hub = MemoryHub::new();
        let t_a = hub.transport(node(1));
        let t_b = hub.transport(node(2));

        let listen_addr = hub.next_addr();
        let _listener = t_b.listen(&listen_addr).await.unwrap();
        hub.fail_dialing(&listen_addr, "link down");

        let err = t_a.dial(&listen_addr, node(2)).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));

        hub.heal(&listen_addr);
        assert!(t_a.dial(&listen_addr, node(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_relay_connect() {
        let hub = MemoryHub::new();
        let t_target = hub.transport(node(3));
        let listen_addr = hub.next_addr();
        let listener = t_target.listen(&listen_addr).await.unwrap();

        let conn = hub
            .relay_connect(node(1), node(2), node(3))
            .await
            .unwrap();
        assert_eq!(conn.conn_type(), ConnType::Relayed);
        assert_eq!(conn.remote_peer(), node(3));
        assert!(conn.remote_addr().is_circuit());

        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.remote_peer(), node(1));
        assert_eq!(accepted.conn_type(), ConnType::Relayed);
    }

    #[tokio::test]
    async fn test_mock_liveness_behaviors() {
        let liveness = MockLiveness::new();
        liveness.set_behavior(node(2), PingBehavior::ProtocolNotSupported);

        assert!(liveness.ping(node(1)).await.is_ok());
        let err = liveness.ping(node(2)).await.unwrap_err();
        assert!(err.is_protocol_not_supported());
        assert_eq!(liveness.ping_count(&node(2)), 1);

        liveness.goodbye(node(1), "leaving").await.unwrap();
        assert_eq!(liveness.goodbyes(), vec![(node(1), "leaving".to_string())]);
    }

    #[test]
    fn test_memory_peerstore_dedup() {
        let store = MemoryPeerstore::new();
        let addr = PeerAddr::parse("/memory/1").unwrap();
        store.add_addr(node(1), addr.clone());
        store.add_addr(node(1), addr);
        assert_eq!(store.addrs(&node(1)).len(), 1);

        store.remove_peer(&node(1));
        assert!(store.addrs(&node(1)).is_empty());
    }
}
