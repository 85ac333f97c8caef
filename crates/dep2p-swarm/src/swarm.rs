//! The connection engine.
//!
//! A registry of transports keyed by address tag, a per-peer connection
//! pool, listeners, and the dial fallback chain: pool reuse → ranked
//! direct fan-out → relay circuit addresses with per-relay back-off and
//! opportunistic hole-punch upgrade → configured hole-punch → configured
//! relay. Liveness is layered: transport keepalive is delegated, path
//! probes feed the health manager on every dial, and an application-level
//! ping sweep closes unresponsive peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use dep2p_core::{
    BandwidthCounter, ConnManager, ConnType, Connection, DialError, DynConnection, HolePuncher,
    InboundStreamHandler, Listener, Liveness, Network, NodeId, PeerAddr, Peerstore, RelayDialer,
    SwarmError, Transport, TransportError,
};

use crate::backoff::{RelayBackoff, RelayBackoffConfig};
use crate::config::SwarmConfig;
use crate::conn::{Direction, SwarmConn};
use crate::health::PathHealthManager;
use crate::notify::{SwarmEvent, SwarmNotifier};

/// Peers carrying any of these tags are infrastructure and exempt from
/// liveness sweeps.
pub const INFRASTRUCTURE_TAGS: [&str; 4] = ["relay", "bootstrap", "infrastructure", "dht-server"];

/// Point-in-time engine statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct SwarmStats {
    /// Peers with at least one pooled connection.
    pub peers: usize,
    /// Total pooled connections.
    pub connections: usize,
    /// Active listeners.
    pub listeners: usize,
    /// Peers cached as not speaking the liveness protocol.
    pub no_liveness_peers: usize,
}

/// Builder for [`Swarm`].
pub struct SwarmBuilder {
    local: NodeId,
    config: SwarmConfig,
    backoff: RelayBackoffConfig,
    transports: Vec<Arc<dyn Transport>>,
    peerstore: Option<Arc<dyn Peerstore>>,
    conn_manager: Option<Arc<dyn ConnManager>>,
    liveness: Option<Arc<dyn Liveness>>,
    path_health: Option<Arc<PathHealthManager>>,
    relay_dialer: Option<Arc<dyn RelayDialer>>,
    hole_puncher: Option<Arc<dyn HolePuncher>>,
    bandwidth: Option<Arc<dyn BandwidthCounter>>,
    notifiers: Vec<Arc<dyn SwarmNotifier>>,
}

impl SwarmBuilder {
    /// Override the engine configuration.
    pub fn with_config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the relay back-off parameters.
    pub fn with_backoff(mut self, config: RelayBackoffConfig) -> Self {
        self.backoff = config;
        self
    }

    /// Register a transport under every tag it reports.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Attach the peerstore.
    pub fn with_peerstore(mut self, peerstore: Arc<dyn Peerstore>) -> Self {
        self.peerstore = Some(peerstore);
        self
    }

    /// Attach the connection manager (peer tags).
    pub fn with_conn_manager(mut self, conn_manager: Arc<dyn ConnManager>) -> Self {
        self.conn_manager = Some(conn_manager);
        self
    }

    /// Attach the liveness service and enable the health loop.
    pub fn with_liveness(mut self, liveness: Arc<dyn Liveness>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Attach a path health manager.
    pub fn with_path_health(mut self, health: Arc<PathHealthManager>) -> Self {
        self.path_health = Some(health);
        self
    }

    /// Attach the relay client used for configured-relay fallback.
    pub fn with_relay_dialer(mut self, relay: Arc<dyn RelayDialer>) -> Self {
        self.relay_dialer = Some(relay);
        self
    }

    /// Attach the hole-punching collaborator.
    pub fn with_hole_puncher(mut self, puncher: Arc<dyn HolePuncher>) -> Self {
        self.hole_puncher = Some(puncher);
        self
    }

    /// Attach a bandwidth accounting sink.
    pub fn with_bandwidth_counter(mut self, counter: Arc<dyn BandwidthCounter>) -> Self {
        self.bandwidth = Some(counter);
        self
    }

    /// Pre-register a lifecycle observer.
    pub fn with_notifier(mut self, notifier: Arc<dyn SwarmNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Build the engine and start its background loops.
    pub fn build(self) -> Arc<Swarm> {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);
        let (handler_tx, _) = watch::channel(None);

        let transports = DashMap::new();
        for transport in &self.transports {
            for tag in transport.protocols() {
                transports.insert(tag.to_string(), transport.clone());
            }
        }

        let swarm = Arc::new_cyclic(|weak: &Weak<Swarm>| Swarm {
            weak_self: weak.clone(),
            local: self.local,
            config: self.config,
            transports,
            transport_list: self.transports,
            pool: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            notifiers: RwLock::new(self.notifiers),
            events,
            inbound_handler: handler_tx,
            peerstore: self.peerstore,
            conn_manager: self.conn_manager,
            liveness: self.liveness,
            path_health: self.path_health,
            relay_dialer: self.relay_dialer,
            hole_puncher: self.hole_puncher,
            bandwidth: self.bandwidth,
            backoff: RelayBackoff::new(self.backoff),
            dial_failures: DashMap::new(),
            no_liveness_peers: DashMap::new(),
            closed: AtomicBool::new(false),
            shutdown,
        });

        if swarm.liveness.is_some() {
            swarm.spawn_health_loop();
        }
        swarm.spawn_maintenance_loop();
        info!(node = %swarm.local.short_id(), "Swarm started");
        swarm
    }
}

/// The pluggable-transport connection engine.
pub struct Swarm {
    weak_self: Weak<Swarm>,
    local: NodeId,
    config: SwarmConfig,
    transports: DashMap<String, Arc<dyn Transport>>,
    transport_list: Vec<Arc<dyn Transport>>,
    pool: DashMap<NodeId, Vec<Arc<SwarmConn>>>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    notifiers: RwLock<Vec<Arc<dyn SwarmNotifier>>>,
    events: broadcast::Sender<SwarmEvent>,
    inbound_handler: watch::Sender<Option<Arc<dyn InboundStreamHandler>>>,
    peerstore: Option<Arc<dyn Peerstore>>,
    conn_manager: Option<Arc<dyn ConnManager>>,
    liveness: Option<Arc<dyn Liveness>>,
    path_health: Option<Arc<PathHealthManager>>,
    relay_dialer: Option<Arc<dyn RelayDialer>>,
    hole_puncher: Option<Arc<dyn HolePuncher>>,
    bandwidth: Option<Arc<dyn BandwidthCounter>>,
    backoff: RelayBackoff,
    dial_failures: DashMap<NodeId, u32>,
    no_liveness_peers: DashMap<NodeId, ()>,
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl Swarm {
    /// Start building an engine for the given node.
    pub fn builder(local: NodeId) -> SwarmBuilder {
        SwarmBuilder {
            local,
            config: SwarmConfig::default(),
            backoff: RelayBackoffConfig::default(),
            transports: Vec::new(),
            peerstore: None,
            conn_manager: None,
            liveness: None,
            path_health: None,
            relay_dialer: None,
            hole_puncher: None,
            bandwidth: None,
            notifiers: Vec::new(),
        }
    }

    /// The local node identity.
    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Whether the engine has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The relay back-off table.
    pub fn backoff(&self) -> &RelayBackoff {
        &self.backoff
    }

    /// The path health manager, if configured.
    pub fn path_health(&self) -> Option<&Arc<PathHealthManager>> {
        self.path_health.as_ref()
    }

    /// Whether a peer is cached as not speaking the liveness protocol.
    pub fn is_no_liveness_peer(&self, peer: &NodeId) -> bool {
        self.no_liveness_peers.contains_key(peer)
    }

    /// Register an additional transport at runtime.
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        for tag in transport.protocols() {
            self.transports.insert(tag.to_string(), transport.clone());
        }
    }

    /// Register a lifecycle observer.
    pub fn add_notifier(&self, notifier: Arc<dyn SwarmNotifier>) {
        self.notifiers
            .write()
            .expect("notifier lock poisoned")
            .push(notifier);
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }

    /// Install the inbound stream handler. Each pooled connection pumps
    /// its inbound streams through this handler from now on.
    pub fn set_inbound_stream_handler(&self, handler: Arc<dyn InboundStreamHandler>) {
        let _ = self.inbound_handler.send(Some(handler));
    }

    /// Engine statistics.
    pub fn stats(&self) -> SwarmStats {
        SwarmStats {
            peers: self.pool.len(),
            connections: self.pool.iter().map(|e| e.value().len()).sum(),
            listeners: self.listeners.lock().expect("listener lock poisoned").len(),
            no_liveness_peers: self.no_liveness_peers.len(),
        }
    }

    // ============================================================
    // Dialing
    // ============================================================

    /// Get or establish a connection to a peer, walking the fallback
    /// chain: pool → direct → relay addresses → hole-punch → configured
    /// relay.
    pub async fn dial_peer(&self, peer: NodeId) -> Result<DynConnection, SwarmError> {
        if self.is_closed() {
            return Err(SwarmError::SwarmClosed);
        }
        if peer == self.local {
            return Err(SwarmError::DialToSelf);
        }

        // 1. Reuse.
        if let Some(conn) = self.pooled_conn(&peer) {
            return Ok(conn);
        }
        if self.transport_list.is_empty() && self.relay_dialer.is_none() {
            return Err(SwarmError::NoTransport("no transports registered".to_string()));
        }

        let mut errors: Vec<TransportError> = Vec::new();
        let store_addrs = self
            .peerstore
            .as_ref()
            .map(|s| s.addrs(&peer))
            .unwrap_or_default();

        // 2. Direct dial over ranked addresses.
        let direct_addrs: Vec<PeerAddr> = store_addrs
            .iter()
            .filter(|a| !a.is_circuit() && !a.is_unspecified())
            .cloned()
            .collect();
        if !direct_addrs.is_empty() {
            let ranked = self.rank_direct_addrs(&peer, direct_addrs);
            let deadline = if ranked.iter().any(|a| a.is_private()) {
                self.config.dial_timeout_local
            } else {
                self.config.dial_timeout
            };
            match self.fan_out_direct(peer, ranked, deadline).await {
                Ok(raw) => {
                    let conn = self.add_conn(raw, Direction::Outbound);
                    self.dial_failures.remove(&peer);
                    return Ok(conn);
                }
                Err(mut attempt_errors) => {
                    errors.append(&mut attempt_errors);
                }
            }
        }

        // 3. Relay circuit addresses from the peerstore.
        for addr in store_addrs.iter().filter(|a| a.is_circuit()) {
            let Some(relay) = addr.relay_node() else {
                continue;
            };
            if relay == self.local || self.backoff.in_backoff(&peer, &relay) {
                continue;
            }
            match self.dial_addr(addr, peer).await {
                Ok(raw) => {
                    self.backoff.record_success(&peer, &relay);
                    let relay_conn = self.add_conn(raw, Direction::Outbound);
                    let conn = self.upgrade_or_keep(peer, relay_conn).await;
                    self.dial_failures.remove(&peer);
                    return Ok(conn);
                }
                Err(err) => {
                    self.backoff.record_failure(peer, relay, &err.to_string());
                    errors.push(err);
                }
            }
        }

        // 4./5. Configured relay, with hole-punch upgrade when available.
        if let Some(relay_dialer) = &self.relay_dialer
            && relay_dialer.has_relay()
        {
            match relay_dialer.dial_through_relay(peer).await {
                Ok(raw) => {
                    let relay_conn = self.add_conn(raw, Direction::Outbound);
                    let conn = self.upgrade_or_keep(peer, relay_conn).await;
                    self.dial_failures.remove(&peer);
                    return Ok(conn);
                }
                Err(err) => {
                    debug!(peer = %peer.short_id(), %err, "Configured relay dial failed");
                    errors.push(err);
                }
            }
        }

        // 6. Exhausted.
        let failures = {
            let mut count = self.dial_failures.entry(peer).or_insert(0);
            *count += 1;
            *count
        };
        if errors.is_empty() {
            if failures > self.config.failure_log_threshold {
                debug!(peer = %peer.short_id(), "No addresses for peer");
            }
            return Err(SwarmError::NoAddresses(peer));
        }
        if failures > self.config.failure_log_threshold {
            debug!(peer = %peer.short_id(), failures, "Dial failed (repeat)");
        } else {
            warn!(peer = %peer.short_id(), attempts = errors.len(), "Dial failed");
        }
        Err(DialError::new(peer, errors).into())
    }

    /// After a relay connection, opportunistically punch for a direct one
    /// and prefer it when it appears.
    async fn upgrade_or_keep(
        &self,
        peer: NodeId,
        relay_conn: DynConnection,
    ) -> DynConnection {
        if let Some(puncher) = &self.hole_puncher {
            if !puncher.is_active(&peer)
                && let Err(err) = puncher.direct_connect(peer).await
            {
                debug!(peer = %peer.short_id(), %err, "Hole punch failed");
            }
            if let Some(direct) = self.pooled_direct_conn(&peer) {
                debug!(peer = %peer.short_id(), "Upgraded relay connection to direct");
                return direct;
            }
        }
        relay_conn
    }

    fn pooled_conn(&self, peer: &NodeId) -> Option<DynConnection> {
        self.pool.get(peer).and_then(|conns| {
            conns
                .iter()
                .find(|c| !c.is_closed())
                .map(|c| c.clone() as DynConnection)
        })
    }

    fn pooled_direct_conn(&self, peer: &NodeId) -> Option<DynConnection> {
        self.pool.get(peer).and_then(|conns| {
            conns
                .iter()
                .find(|c| !c.is_closed() && c.conn_type() == ConnType::Direct)
                .map(|c| c.clone() as DynConnection)
        })
    }

    /// Static ranking (private > quic > tcp > other) refined by path
    /// health when a manager is attached.
    fn rank_direct_addrs(&self, peer: &NodeId, mut addrs: Vec<PeerAddr>) -> Vec<PeerAddr> {
        addrs.sort_by_key(|a| a.class());
        match &self.path_health {
            Some(health) => health.usable_addrs(peer, addrs),
            None => addrs,
        }
    }

    /// Fan-out dial: one concurrent attempt per address, first success
    /// wins and cancels the rest.
    async fn fan_out_direct(
        &self,
        peer: NodeId,
        addrs: Vec<PeerAddr>,
        deadline: Duration,
    ) -> Result<DynConnection, Vec<TransportError>> {
        let mut attempts = FuturesUnordered::new();
        for addr in addrs {
            attempts.push(async move {
                let result = self.dial_addr(&addr, peer).await;
                (addr, result)
            });
        }

        let mut errors = Vec::new();
        let race = async {
            while let Some((addr, result)) = attempts.next().await {
                match result {
                    Ok(conn) => return Some(conn),
                    Err(err) => {
                        debug!(peer = %peer.short_id(), %addr, %err, "Dial attempt failed");
                        errors.push(err);
                    }
                }
            }
            None
        };

        match tokio::time::timeout(deadline, race).await {
            Ok(Some(conn)) => Ok(conn),
            Ok(None) => Err(errors),
            Err(_) => {
                errors.push(TransportError::Timeout);
                Err(errors)
            }
        }
    }

    /// One dial attempt: select a transport by tag (falling back to any),
    /// dial, and verify the remote's identity. Outcomes feed path health.
    async fn dial_addr(
        &self,
        addr: &PeerAddr,
        peer: NodeId,
    ) -> Result<DynConnection, TransportError> {
        let transport = self.transport_for(addr).ok_or_else(|| {
            TransportError::ConnectionFailed(format!("no transport for {addr}"))
        })?;

        let started = Instant::now();
        match transport.dial(addr, peer).await {
            Ok(conn) => {
                let rtt = started.elapsed();
                let actual = conn.remote_peer();
                if actual != peer {
                    let _ = conn.close().await;
                    if let Some(health) = &self.path_health {
                        health.report_probe(peer, addr, None, Some("peer id mismatch"));
                    }
                    return Err(TransportError::PeerIdMismatch {
                        expected: peer,
                        actual,
                    });
                }
                if let Some(health) = &self.path_health {
                    health.report_probe(peer, addr, Some(rtt), None);
                }
                Ok(conn)
            }
            Err(err) => {
                if let Some(health) = &self.path_health {
                    health.report_probe(peer, addr, None, Some(&err.to_string()));
                }
                Err(err)
            }
        }
    }

    fn transport_for(&self, addr: &PeerAddr) -> Option<Arc<dyn Transport>> {
        if let Some(tag) = addr.transport_tag()
            && let Some(transport) = self.transports.get(tag)
        {
            return Some(transport.clone());
        }
        self.transport_list.first().cloned()
    }

    // ============================================================
    // Pool
    // ============================================================

    fn add_conn(&self, raw: DynConnection, direction: Direction) -> DynConnection {
        let conn = SwarmConn::new(raw, direction, self.bandwidth.clone());
        let peer = conn.remote_peer();
        self.pool.entry(peer).or_default().push(conn.clone());

        debug!(
            peer = %peer.short_id(),
            ?direction,
            conn_type = ?conn.conn_type(),
            "Connection added to pool"
        );
        self.notify_connected(&conn);
        self.spawn_stream_pump(conn.clone());
        conn
    }

    fn remove_conn(&self, conn: &Arc<SwarmConn>) {
        let peer = conn.remote_peer();
        let mut removed = false;
        if let Some(mut entry) = self.pool.get_mut(&peer) {
            let before = entry.len();
            entry.retain(|c| !Arc::ptr_eq(c, conn));
            removed = entry.len() < before;
        }
        self.pool.remove_if(&peer, |_, conns| conns.is_empty());

        // removeConn happens-before notifyDisconnected.
        if removed {
            self.notify_disconnected(conn);
        }
    }

    fn notify_connected(&self, conn: &Arc<SwarmConn>) {
        let _ = self.events.send(SwarmEvent::Connected {
            peer: conn.remote_peer(),
            addr: conn.remote_addr(),
            conn_type: conn.conn_type(),
        });
        let notifiers = self
            .notifiers
            .read()
            .expect("notifier lock poisoned")
            .clone();
        if notifiers.is_empty() {
            return;
        }
        let conn: DynConnection = conn.clone();
        tokio::spawn(async move {
            for notifier in notifiers {
                notifier.connected(&conn);
            }
        });
    }

    fn notify_disconnected(&self, conn: &Arc<SwarmConn>) {
        let _ = self.events.send(SwarmEvent::Disconnected {
            peer: conn.remote_peer(),
        });
        let notifiers = self
            .notifiers
            .read()
            .expect("notifier lock poisoned")
            .clone();
        if notifiers.is_empty() {
            return;
        }
        let conn: DynConnection = conn.clone();
        tokio::spawn(async move {
            for notifier in notifiers {
                notifier.disconnected(&conn);
            }
        });
    }

    /// Per-connection inbound stream pump. Waits until a handler is
    /// installed, then loops `accept_stream → handler`; an accept error on
    /// a live connection closes it and runs the disconnect notifiers.
    fn spawn_stream_pump(&self, conn: Arc<SwarmConn>) {
        let swarm = self.weak_self.clone();
        let mut handler_rx = self.inbound_handler.subscribe();

        tokio::spawn(async move {
            loop {
                let handler = handler_rx.borrow().clone();
                let Some(handler) = handler else {
                    if handler_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                };

                match conn.accept_stream().await {
                    Ok(stream) => {
                        let conn_dyn: DynConnection = conn.clone();
                        tokio::spawn(async move {
                            handler.handle_stream(conn_dyn, stream).await;
                        });
                    }
                    Err(_) => {
                        if !conn.is_closed() {
                            let _ = conn.close().await;
                        }
                        if let Some(swarm) = swarm.upgrade() {
                            swarm.remove_conn(&conn);
                        }
                        return;
                    }
                }
            }
        });
    }

    // ============================================================
    // Listening
    // ============================================================

    /// Bind a listener and start its accept loop. Returns the bound
    /// address.
    pub async fn listen(&self, addr: &PeerAddr) -> Result<PeerAddr, SwarmError> {
        if self.is_closed() {
            return Err(SwarmError::SwarmClosed);
        }
        let transport = self
            .transport_for(addr)
            .ok_or_else(|| SwarmError::NoTransport(addr.to_string()))?;
        let listener = transport.listen(addr).await?;
        let bound = listener.local_addr();

        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener.clone());
        self.spawn_accept_loop(listener);

        info!(addr = %bound, "Listening");
        Ok(bound)
    }

    fn spawn_accept_loop(&self, listener: Arc<dyn Listener>) {
        let swarm = self.weak_self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        let Some(swarm) = swarm.upgrade() else { break };
                        match result {
                            Ok(conn) => {
                                if conn.remote_peer() == swarm.local {
                                    debug!("Rejecting connection from self");
                                    let _ = conn.close().await;
                                    continue;
                                }
                                swarm.add_conn(conn, Direction::Inbound);
                            }
                            Err(TransportError::ConnectionClosed) => {
                                let _ = swarm.events.send(SwarmEvent::ListenerClosed {
                                    addr: listener.local_addr(),
                                });
                                break;
                            }
                            Err(err) => {
                                if swarm.is_closed() {
                                    break;
                                }
                                warn!(%err, "Listener accept failed; continuing");
                            }
                        }
                    }
                }
            }
        });
    }

    // ============================================================
    // Liveness sweep
    // ============================================================

    /// One liveness sweep: ping every pooled peer concurrently, skipping
    /// infrastructure-tagged peers and peers known not to speak the
    /// liveness protocol. Unresponsive peers are closed.
    pub async fn health_sweep(&self) {
        let Some(liveness) = self.liveness.clone() else {
            return;
        };
        let peers: Vec<NodeId> = self.pool.iter().map(|e| *e.key()).collect();

        let pings = peers.into_iter().filter_map(|peer| {
            if self.no_liveness_peers.contains_key(&peer) {
                return None;
            }
            if let Some(manager) = &self.conn_manager {
                let tags = manager.tags(&peer);
                if tags
                    .iter()
                    .any(|t| INFRASTRUCTURE_TAGS.contains(&t.as_str()))
                {
                    return None;
                }
            }
            let liveness = liveness.clone();
            let timeout = self.config.health_timeout;
            Some(async move {
                let outcome = tokio::time::timeout(timeout, liveness.ping(peer)).await;
                (peer, outcome)
            })
        });

        for (peer, outcome) in join_all(pings).await {
            match outcome {
                Ok(Ok(rtt)) => {
                    if let Some(health) = &self.path_health {
                        for conn in self.connections_to(&peer) {
                            health.report_probe(peer, &conn.remote_addr(), Some(rtt), None);
                        }
                    }
                }
                Ok(Err(err)) if err.is_protocol_not_supported() => {
                    debug!(peer = %peer.short_id(), "Peer has no liveness protocol; skipping future pings");
                    self.no_liveness_peers.insert(peer, ());
                }
                Ok(Err(err)) => {
                    warn!(peer = %peer.short_id(), %err, "Liveness ping failed; closing peer");
                    self.close_peer(&peer).await;
                }
                Err(_) => {
                    warn!(peer = %peer.short_id(), "Liveness ping timed out; closing peer");
                    self.close_peer(&peer).await;
                }
            }
        }
    }

    fn spawn_health_loop(&self) {
        let swarm = self.weak_self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = self.config.health_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so freshly built
            // engines do not sweep an empty pool.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let Some(swarm) = swarm.upgrade() else { break };
                        swarm.health_sweep().await;
                    }
                }
            }
            debug!("Health loop stopped");
        });
    }

    /// Periodic housekeeping: back-off GC and path-health reaping.
    fn spawn_maintenance_loop(&self) {
        let swarm = self.weak_self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let Some(swarm) = swarm.upgrade() else { break };
                        swarm.backoff.gc();
                        if let Some(health) = &swarm.path_health {
                            health.gc();
                        }
                    }
                }
            }
        });
    }

    // ============================================================
    // Teardown
    // ============================================================

    /// Close all connections to a peer and clear its no-liveness cache
    /// entry.
    pub async fn close_peer(&self, peer: &NodeId) {
        let conns = self.pool.remove(peer).map(|(_, v)| v).unwrap_or_default();
        self.no_liveness_peers.remove(peer);
        for conn in conns {
            let _ = conn.close().await;
            self.notify_disconnected(&conn);
        }
    }

    /// One-shot engine shutdown: stop loops, detach listeners and
    /// connections under lock, then close them outside the lock.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());

        let listeners: Vec<Arc<dyn Listener>> = self
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .drain(..)
            .collect();
        let conns: Vec<Arc<SwarmConn>> = {
            let mut all = Vec::new();
            for entry in self.pool.iter() {
                all.extend(entry.value().iter().cloned());
            }
            self.pool.clear();
            all
        };

        for listener in listeners {
            let _ = listener.close().await;
        }
        for conn in conns {
            let _ = conn
                .graceful_close(self.config.graceful_close_timeout)
                .await;
        }
        info!(node = %self.local.short_id(), "Swarm closed");
    }
}

#[async_trait]
impl Network for Swarm {
    fn local_peer(&self) -> NodeId {
        self.local
    }

    async fn dial_peer(&self, peer: NodeId) -> Result<DynConnection, SwarmError> {
        Swarm::dial_peer(self, peer).await
    }

    fn connections(&self) -> Vec<DynConnection> {
        self.pool
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|c| !c.is_closed())
                    .map(|c| c.clone() as DynConnection)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn connections_to(&self, peer: &NodeId) -> Vec<DynConnection> {
        self.pool
            .get(peer)
            .map(|conns| {
                conns
                    .iter()
                    .filter(|c| !c.is_closed())
                    .map(|c| c.clone() as DynConnection)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn add_address(&self, peer: NodeId, addr: PeerAddr) {
        if let Some(store) = &self.peerstore {
            store.add_addr(peer, addr);
        }
    }

    fn listen_addrs(&self) -> Vec<PeerAddr> {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .iter()
            .map(|l| l.local_addr())
            .collect()
    }
}
