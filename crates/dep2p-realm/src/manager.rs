//! Realm lifecycle management.
//!
//! The manager owns the single joined realm (`Unjoined → Joined →
//! Unjoined`), the per-realm peer roster, the membership cache, and the
//! background loops: periodic discovery announcements, the outbound
//! realm-auth driver, and roster sync. Background loops run on a
//! manager-owned root context so they survive the caller's start context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ed25519_dalek::SigningKey;
use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use dep2p_core::{
    Connection, Discovery, GoodbyeReason, Liveness, Messaging, Network, NodeId, PeerAddr, PubSub,
    RealmId, RelayDialer,
};
use dep2p_crypto::{PskAuthenticator, RealmKey, derive_realm_id};

use crate::access::{AccessController, RosterHook};
use crate::auth::{MembershipView, RealmAuthConfig, RealmAuthService};
use crate::cache::MembershipCache;
use crate::error::{RealmError, Result};
use crate::namespace::{realm_dht_key, realm_namespace};
use crate::realm::Realm;
use crate::sync::{MemberEntry, RosterView, SyncConfig, SyncService};

/// Default discovery announce period.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default outbound auth driver tick.
pub const DEFAULT_AUTH_TICK: Duration = Duration::from_millis(500);

/// Default budget for the goodbye broadcast on leave.
pub const DEFAULT_GOODBYE_BUDGET: Duration = Duration::from_secs(5);

/// Manager configuration.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Period of the re-announce loop.
    pub announce_interval: Duration,
    /// Tick of the outbound realm-auth driver.
    pub auth_tick: Duration,
    /// Realm-auth exchange parameters.
    pub auth: RealmAuthConfig,
    /// Budget for the goodbye broadcast when leaving.
    pub goodbye_budget: Duration,
    /// Roster sync parameters.
    pub sync: SyncConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            auth_tick: DEFAULT_AUTH_TICK,
            auth: RealmAuthConfig::default(),
            goodbye_budget: DEFAULT_GOODBYE_BUDGET,
            sync: SyncConfig::default(),
        }
    }
}

/// Options for joining a realm.
#[derive(Default)]
pub struct JoinOptions {
    realm_key: Option<RealmKey>,
    join_key: Option<Vec<u8>>,
    invite: Option<Vec<u8>>,
    bootstrap_peers: Vec<PeerAddr>,
    skip_dht_registration: bool,
}

impl JoinOptions {
    /// Start with no options set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The realm's shared key. Required.
    pub fn with_realm_key(mut self, key: RealmKey) -> Self {
        self.realm_key = Some(key);
        self
    }

    /// Join key for `Protected` realms.
    pub fn with_join_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.join_key = Some(key.into());
        self
    }

    /// Invite envelope for `Private` realms.
    pub fn with_invite(mut self, envelope: impl Into<Vec<u8>>) -> Self {
        self.invite = Some(envelope.into());
        self
    }

    /// Bootstrap addresses (each `/.../p2p/<node>`) dialed right after
    /// joining to seed the roster.
    pub fn with_bootstrap_peers(mut self, peers: Vec<PeerAddr>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    /// Do not announce presence on the shared discovery service.
    pub fn skip_dht_registration(mut self) -> Self {
        self.skip_dht_registration = true;
        self
    }
}

/// Metadata of the joined realm.
#[derive(Clone, Debug)]
pub struct RealmMetadata {
    /// Human-readable realm name (local, or learned via sync).
    pub display_name: String,
    /// When this node joined.
    pub joined_at: DateTime<Utc>,
}

/// Roster record for one realm peer.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Known dialing addresses.
    pub addrs: Vec<PeerAddr>,
    /// Last observed activity.
    pub last_seen: DateTime<Utc>,
    /// When the peer joined the realm, as far as we know.
    pub joined_at: DateTime<Utc>,
}

struct RealmState {
    realm_id: RealmId,
    #[allow(dead_code)]
    realm_key: RealmKey,
    metadata: RwLock<RealmMetadata>,
    psk: Arc<PskAuthenticator>,
    last_announce: RwLock<Option<DateTime<Utc>>>,
    // Cancels the realm-scoped loops (announce, bootstrap) on leave.
    shutdown: broadcast::Sender<()>,
}

/// Builder for [`RealmManager`].
pub struct RealmManagerBuilder {
    local: NodeId,
    network: Arc<dyn Network>,
    config: ManagerConfig,
    signing: Option<SigningKey>,
    discovery: Option<Arc<dyn Discovery>>,
    liveness: Option<Arc<dyn Liveness>>,
    pubsub: Option<Arc<dyn PubSub>>,
    messaging: Option<Arc<dyn Messaging>>,
    relay: Option<Arc<dyn RelayDialer>>,
}

impl RealmManagerBuilder {
    /// Override the configuration.
    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// The node's identity key, used to sign auth exchanges.
    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing = Some(key);
        self
    }

    /// Attach the shared discovery service.
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Attach the liveness service (goodbyes, kick notifications).
    pub fn with_liveness(mut self, liveness: Arc<dyn Liveness>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Attach the shared pub/sub engine.
    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Attach the shared messaging service.
    pub fn with_messaging(mut self, messaging: Arc<dyn Messaging>) -> Self {
        self.messaging = Some(messaging);
        self
    }

    /// Attach the relay client.
    pub fn with_relay(mut self, relay: Arc<dyn RelayDialer>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Build the manager.
    pub fn build(self) -> Arc<RealmManager> {
        let access = AccessController::new();
        let cache = MembershipCache::new();
        let auth = Arc::new(RealmAuthService::new(
            self.local,
            self.signing,
            self.config.auth.clone(),
        ));
        let sync = SyncService::new(self.local, self.network.clone(), self.config.sync.clone());
        let (shutdown, _) = broadcast::channel(1);

        Arc::new(RealmManager {
            local: self.local,
            config: self.config,
            network: self.network,
            discovery: self.discovery,
            liveness: self.liveness,
            pubsub: self.pubsub,
            messaging: self.messaging,
            relay: self.relay,
            access,
            cache,
            auth,
            sync,
            state: RwLock::new(None),
            current: RwLock::new(None),
            rosters: DashMap::new(),
            auth_inflight: Arc::new(DashMap::new()),
            started: AtomicBool::new(false),
            shutdown,
        })
    }
}

/// Owns the single joined realm and its background machinery.
pub struct RealmManager {
    local: NodeId,
    config: ManagerConfig,
    network: Arc<dyn Network>,
    discovery: Option<Arc<dyn Discovery>>,
    liveness: Option<Arc<dyn Liveness>>,
    pubsub: Option<Arc<dyn PubSub>>,
    messaging: Option<Arc<dyn Messaging>>,
    relay: Option<Arc<dyn RelayDialer>>,
    access: Arc<AccessController>,
    cache: Arc<MembershipCache>,
    auth: Arc<RealmAuthService>,
    sync: Arc<SyncService>,
    state: RwLock<Option<Arc<RealmState>>>,
    current: RwLock<Option<Arc<Realm>>>,
    rosters: DashMap<RealmId, Arc<DashMap<NodeId, PeerInfo>>>,
    // Outbound auth attempts in flight, per remote.
    auth_inflight: Arc<DashMap<NodeId, ()>>,
    started: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl RealmManager {
    /// Start building a manager for the given node and engine.
    pub fn builder(local: NodeId, network: Arc<dyn Network>) -> RealmManagerBuilder {
        RealmManagerBuilder {
            local,
            network,
            config: ManagerConfig::default(),
            signing: None,
            discovery: None,
            liveness: None,
            pubsub: None,
            messaging: None,
            relay: None,
        }
    }

    /// The local node identity.
    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// The access controller.
    pub fn access(&self) -> &Arc<AccessController> {
        &self.access
    }

    /// The membership cache.
    pub fn cache(&self) -> &Arc<MembershipCache> {
        &self.cache
    }

    /// The realm-auth service.
    pub fn auth(&self) -> &Arc<RealmAuthService> {
        &self.auth
    }

    /// The sync service.
    pub fn sync(&self) -> &Arc<SyncService> {
        &self.sync
    }

    /// Wire the weak views and spawn the background loops. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let view_arc: Arc<dyn MembershipView> = self.clone();
        let weak_view: Weak<dyn MembershipView> = Arc::downgrade(&view_arc);
        self.auth.set_view(weak_view);
        let roster_arc: Arc<dyn RosterView> = self.clone();
        let weak_roster: Weak<dyn RosterView> = Arc::downgrade(&roster_arc);
        self.sync.set_roster(weak_roster);
        let hook_arc: Arc<dyn RosterHook> = self.clone();
        let weak_hook: Weak<dyn RosterHook> = Arc::downgrade(&hook_arc);
        self.access.set_roster(weak_hook);
        if let Some(liveness) = &self.liveness {
            self.access.set_liveness(liveness.clone());
        }

        self.cache.spawn_sweeper();
        self.access.spawn_sweeper();
        self.sync.spawn_loop();
        self.spawn_auth_driver();

        info!(node = %self.local.short_id(), "Realm manager started");
    }

    /// Stop the background loops. Idempotent.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        self.cache.close();
        self.access.close();
        self.sync.close();
        info!(node = %self.local.short_id(), "Realm manager stopped");
    }

    // ============================================================
    // Join / leave
    // ============================================================

    /// Join a realm.
    ///
    /// Requires [`JoinOptions::with_realm_key`]; fails with
    /// `AlreadyJoined` while any realm is joined, regardless of target.
    pub async fn join_realm(
        self: &Arc<Self>,
        display_name: &str,
        opts: JoinOptions,
    ) -> Result<Arc<Realm>> {
        let realm_key = opts.realm_key.ok_or(RealmError::RealmKeyRequired)?;
        let realm_id = derive_realm_id(&realm_key);

        let state = {
            let mut slot = self.state.write().expect("state lock poisoned");
            // The single-realm guard comes first, regardless of target:
            // access checks must not run (and must not consume a
            // single-use invite) while a realm is joined.
            if slot.is_some() {
                return Err(RealmError::AlreadyJoined);
            }
            self.access.can_join(
                &realm_id,
                &self.local,
                opts.join_key.as_deref(),
                opts.invite.as_deref(),
            )?;
            let psk = Arc::new(PskAuthenticator::new(self.local, &realm_key));
            let (realm_shutdown, _) = broadcast::channel(1);
            let state = Arc::new(RealmState {
                realm_id,
                realm_key,
                metadata: RwLock::new(RealmMetadata {
                    display_name: display_name.to_string(),
                    joined_at: Utc::now(),
                }),
                psk,
                last_announce: RwLock::new(None),
                shutdown: realm_shutdown,
            });
            *slot = Some(state.clone());
            state
        };

        self.rosters.entry(realm_id).or_default();

        let realm = Arc::new(Realm::new(
            realm_id,
            display_name.to_string(),
            Arc::downgrade(self),
            self.network.clone(),
            self.discovery.clone(),
            self.pubsub.clone(),
            self.messaging.clone(),
            self.relay.clone(),
        ));
        *self.current.write().expect("current lock poisoned") = Some(realm.clone());

        info!(
            realm = %realm_id.short_id(),
            name = display_name,
            "Joined realm"
        );

        if !opts.skip_dht_registration {
            self.spawn_announce_loop(&state);
        }
        if !opts.bootstrap_peers.is_empty() {
            self.spawn_bootstrap(&state, opts.bootstrap_peers);
        }

        // Gossip our join to anyone already known.
        let entry = MemberEntry {
            node: self.local,
            joined_at: Utc::now().timestamp(),
            addrs: self.network.listen_addrs(),
        };
        self.sync.broadcast_join(entry).await;

        Ok(realm)
    }

    /// Leave the joined realm.
    ///
    /// Broadcasts goodbyes (best-effort, bounded), stops announcements,
    /// cancels the realm context, and clears state so a fresh join can
    /// follow.
    pub async fn leave_realm(&self) -> Result<()> {
        let state = self
            .state
            .write()
            .expect("state lock poisoned")
            .take()
            .ok_or(RealmError::NotMember)?;
        let realm_id = state.realm_id;

        let peers = self.realm_peers(&realm_id);
        let farewell = async {
            self.sync.broadcast_leave(realm_id, peers.clone()).await;
            if let Some(liveness) = &self.liveness {
                let reason = GoodbyeReason::Leaving.as_wire();
                let goodbyes = peers.iter().map(|peer| {
                    let liveness = liveness.clone();
                    let reason = reason.clone();
                    let peer = *peer;
                    async move {
                        if let Err(err) = liveness.goodbye(peer, &reason).await {
                            debug!(peer = %peer.short_id(), %err, "Goodbye failed");
                        }
                    }
                });
                join_all(goodbyes).await;
            }
        };
        if tokio::time::timeout(self.config.goodbye_budget, farewell)
            .await
            .is_err()
        {
            debug!("Goodbye broadcast exceeded its budget");
        }

        if let Some(discovery) = &self.discovery {
            let _ = discovery.stop_announce(&realm_namespace(&realm_id)).await;
        }

        let _ = state.shutdown.send(());
        self.rosters.remove(&realm_id);
        self.cache.clear();
        *self.current.write().expect("current lock poisoned") = None;

        info!(realm = %realm_id.short_id(), "Left realm");
        Ok(())
    }

    /// Whether any realm is joined.
    pub fn is_member(&self) -> bool {
        self.state.read().expect("state lock poisoned").is_some()
    }

    /// Whether the given realm is the joined one.
    pub fn is_member_of(&self, realm: &RealmId) -> bool {
        self.current_realm_id() == Some(*realm)
    }

    /// The currently joined realm's facade, if any.
    pub fn current_realm(&self) -> Option<Arc<Realm>> {
        self.current.read().expect("current lock poisoned").clone()
    }

    /// The currently joined realm's ID, if any.
    pub fn current_realm_id(&self) -> Option<RealmId> {
        self.state
            .read()
            .expect("state lock poisoned")
            .as_ref()
            .map(|s| s.realm_id)
    }

    /// The PSK authenticator for the joined realm, if any.
    pub fn psk_authenticator(&self) -> Option<Arc<PskAuthenticator>> {
        self.state
            .read()
            .expect("state lock poisoned")
            .as_ref()
            .map(|s| s.psk.clone())
    }

    /// Metadata of the joined realm, if any.
    pub fn metadata(&self) -> Option<RealmMetadata> {
        self.state
            .read()
            .expect("state lock poisoned")
            .as_ref()
            .map(|s| s.metadata.read().expect("metadata lock poisoned").clone())
    }

    /// When the last discovery announcement went out.
    pub fn last_announce(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .expect("state lock poisoned")
            .as_ref()
            .and_then(|s| *s.last_announce.read().expect("announce lock poisoned"))
    }

    // ============================================================
    // Roster
    // ============================================================

    /// Nodes on a realm's roster.
    pub fn realm_peers(&self, realm: &RealmId) -> Vec<NodeId> {
        self.rosters
            .get(realm)
            .map(|r| r.iter().map(|e| *e.key()).collect())
            .unwrap_or_default()
    }

    /// Roster entries with their records.
    pub fn realm_peer_infos(&self, realm: &RealmId) -> Vec<(NodeId, PeerInfo)> {
        self.rosters
            .get(realm)
            .map(|r| r.iter().map(|e| (*e.key(), e.value().clone())).collect())
            .unwrap_or_default()
    }

    /// Roster size.
    pub fn realm_peer_count(&self, realm: &RealmId) -> usize {
        self.rosters.get(realm).map(|r| r.len()).unwrap_or(0)
    }

    /// Add or refresh a roster entry, stamping `last_seen`.
    pub fn add_realm_peer(&self, realm: &RealmId, node: NodeId, addrs: Vec<PeerAddr>) {
        if node == self.local {
            return;
        }
        let roster = self.rosters.entry(*realm).or_default().clone();
        let now = Utc::now();
        roster
            .entry(node)
            .and_modify(|info| {
                for addr in &addrs {
                    if !info.addrs.contains(addr) {
                        info.addrs.push(addr.clone());
                    }
                }
                info.last_seen = now;
            })
            .or_insert_with(|| PeerInfo {
                addrs: addrs.clone(),
                last_seen: now,
                joined_at: now,
            });
        for addr in addrs {
            self.network.add_address(node, addr);
        }
    }

    /// Remove a roster entry.
    pub fn remove_realm_peer(&self, realm: &RealmId, node: &NodeId) {
        if let Some(roster) = self.rosters.get(realm) {
            roster.remove(node);
        }
        self.cache.remove(node);
    }

    /// Realm-aware DHT key for a node's presence record.
    pub fn realm_dht_key(&self, node: &NodeId, realm: Option<&RealmId>) -> [u8; 32] {
        realm_dht_key(node, realm)
    }

    // ============================================================
    // Filters
    // ============================================================

    /// The subset of `nodes` on the realm's roster.
    pub fn filter_by_realm(&self, nodes: &[NodeId], realm: &RealmId) -> Vec<NodeId> {
        let Some(roster) = self.rosters.get(realm) else {
            return Vec::new();
        };
        nodes
            .iter()
            .copied()
            .filter(|n| roster.contains_key(n))
            .collect()
    }

    /// The subset of `nodes` not on the realm's roster.
    pub fn filter_out_realm(&self, nodes: &[NodeId], realm: &RealmId) -> Vec<NodeId> {
        match self.rosters.get(realm) {
            Some(roster) => nodes
                .iter()
                .copied()
                .filter(|n| !roster.contains_key(n))
                .collect(),
            None => nodes.to_vec(),
        }
    }

    /// A discovery filter admitting only roster members of one realm.
    pub fn create_realm_discovery_filter(
        self: &Arc<Self>,
        realm: RealmId,
    ) -> impl Fn(&NodeId) -> bool + Send + Sync + use<> {
        let manager = Arc::downgrade(self);
        move |node| {
            manager
                .upgrade()
                .map(|m| {
                    m.rosters
                        .get(&realm)
                        .map(|r| r.contains_key(node))
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        }
    }

    /// A discovery filter admitting roster members of any listed realm.
    pub fn create_multi_realm_discovery_filter(
        self: &Arc<Self>,
        realms: Vec<RealmId>,
    ) -> impl Fn(&NodeId) -> bool + Send + Sync + use<> {
        let manager = Arc::downgrade(self);
        move |node| {
            manager
                .upgrade()
                .map(|m| {
                    realms.iter().any(|realm| {
                        m.rosters
                            .get(realm)
                            .map(|r| r.contains_key(node))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false)
        }
    }

    /// A discovery filter for private realms: roster membership plus a
    /// live cache verification.
    pub fn create_private_realm_discovery_filter(
        self: &Arc<Self>,
        realm: RealmId,
    ) -> impl Fn(&NodeId) -> bool + Send + Sync + use<> {
        let manager = Arc::downgrade(self);
        move |node| {
            manager
                .upgrade()
                .map(|m| {
                    let on_roster = m
                        .rosters
                        .get(&realm)
                        .map(|r| r.contains_key(node))
                        .unwrap_or(false);
                    on_roster && m.cache.is_member(node, &realm)
                })
                .unwrap_or(false)
        }
    }

    // ============================================================
    // Announcements
    // ============================================================

    /// Announce presence on the discovery service immediately.
    pub async fn announce_now(&self) -> Result<()> {
        let realm = self.current_realm_id().ok_or(RealmError::NotMember)?;
        let discovery = self
            .discovery
            .as_ref()
            .ok_or(RealmError::DiscoveryUnavailable)?;
        discovery
            .announce(&realm_namespace(&realm))
            .await
            .map_err(|_| RealmError::DiscoveryUnavailable)?;

        if let Some(state) = self.state.read().expect("state lock poisoned").as_ref() {
            *state.last_announce.write().expect("announce lock poisoned") = Some(Utc::now());
        }
        Ok(())
    }

    fn spawn_announce_loop(self: &Arc<Self>, state: &Arc<RealmState>) {
        let Some(discovery) = self.discovery.clone() else {
            debug!("No discovery service; skipping announcements");
            return;
        };
        let manager = Arc::downgrade(self);
        let state = state.clone();
        let mut realm_shutdown = state.shutdown.subscribe();
        let mut manager_shutdown = self.shutdown.subscribe();
        let interval = self.config.announce_interval;

        tokio::spawn(async move {
            let namespace = realm_namespace(&state.realm_id);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = realm_shutdown.recv() => break,
                    _ = manager_shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if manager.upgrade().is_none() {
                            break;
                        }
                        match discovery.announce(&namespace).await {
                            Ok(()) => {
                                *state.last_announce.write().expect("announce lock poisoned") =
                                    Some(Utc::now());
                            }
                            Err(err) => {
                                debug!(%err, "Discovery announce failed");
                            }
                        }
                    }
                }
            }
            debug!(realm = %state.realm_id.short_id(), "Announce loop stopped");
        });
    }

    fn spawn_bootstrap(self: &Arc<Self>, state: &Arc<RealmState>, peers: Vec<PeerAddr>) {
        let manager = Arc::downgrade(self);
        let realm_id = state.realm_id;
        let mut realm_shutdown = state.shutdown.subscribe();

        tokio::spawn(async move {
            for addr in peers {
                if realm_shutdown.try_recv().is_ok() {
                    break;
                }
                let Some(manager) = manager.upgrade() else { break };
                let Some(peer) = addr.node_id() else {
                    warn!(%addr, "Bootstrap address has no /p2p/<node> suffix");
                    continue;
                };
                if peer == manager.local {
                    continue;
                }
                manager.network.add_address(peer, addr.clone());

                match manager.network.dial_peer(peer).await {
                    Ok(conn) => {
                        if let Err(err) = manager.auth.outbound(&conn).await {
                            debug!(peer = %peer.short_id(), %err, "Bootstrap auth failed");
                            continue;
                        }
                        manager.add_realm_peer(&realm_id, peer, vec![addr]);
                        if let Err(err) = manager.sync.pull_from(peer).await {
                            debug!(peer = %peer.short_id(), %err, "Bootstrap sync failed");
                        }
                    }
                    Err(err) => {
                        debug!(peer = %peer.short_id(), %err, "Bootstrap dial failed");
                    }
                }
            }
        });
    }

    // ============================================================
    // Outbound auth driver
    // ============================================================

    /// One driver pass: start an outbound handshake on every connection
    /// lacking a valid context, deduplicated per remote.
    pub fn drive_auth(self: &Arc<Self>) {
        let Some(realm) = self.current_realm_id() else {
            return;
        };
        for conn in self.network.connections() {
            if conn.is_closed() {
                continue;
            }
            if conn
                .realm_context()
                .map(|ctx| ctx.is_valid_for(&realm))
                .unwrap_or(false)
            {
                continue;
            }
            let remote = conn.remote_peer();
            if self.auth_inflight.insert(remote, ()).is_some() {
                continue;
            }

            let auth = self.auth.clone();
            let inflight = self.auth_inflight.clone();
            tokio::spawn(async move {
                if let Err(err) = auth.outbound(&conn).await {
                    debug!(peer = %remote.short_id(), %err, "Outbound realm auth failed");
                }
                inflight.remove(&remote);
            });
        }
    }

    fn spawn_auth_driver(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let tick = self.config.auth_tick;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.drive_auth();
                    }
                }
            }
            debug!("Auth driver stopped");
        });
    }
}

impl MembershipView for RealmManager {
    fn current_realm_id(&self) -> Option<RealmId> {
        RealmManager::current_realm_id(self)
    }

    fn is_member_of(&self, realm: &RealmId) -> bool {
        RealmManager::is_member_of(self, realm)
    }

    fn note_verified_peer(&self, node: NodeId, realm: RealmId, valid_for: Duration) {
        let ttl = valid_for.min(self.cache.ttl());
        self.cache.add_with_expiry(node, realm, ttl);
        self.add_realm_peer(&realm, node, Vec::new());
    }
}

impl RosterView for RealmManager {
    fn current_realm_id(&self) -> Option<RealmId> {
        RealmManager::current_realm_id(self)
    }

    fn member_entries(&self, realm: &RealmId) -> Vec<MemberEntry> {
        self.realm_peer_infos(realm)
            .into_iter()
            .map(|(node, info)| MemberEntry {
                node,
                joined_at: info.joined_at.timestamp(),
                addrs: info.addrs,
            })
            .collect()
    }

    fn apply_member_join(&self, realm: &RealmId, entry: MemberEntry) {
        if entry.node == self.local {
            return;
        }
        let roster = self.rosters.entry(*realm).or_default().clone();
        let now = Utc::now();
        let joined_at = DateTime::from_timestamp(entry.joined_at, 0).unwrap_or(now);

        roster
            .entry(entry.node)
            .and_modify(|info| {
                // Keep the newest joined_at; always refresh addresses.
                if joined_at > info.joined_at {
                    info.joined_at = joined_at;
                }
                for addr in &entry.addrs {
                    if !info.addrs.contains(addr) {
                        info.addrs.push(addr.clone());
                    }
                }
                info.last_seen = now;
            })
            .or_insert_with(|| PeerInfo {
                addrs: entry.addrs.clone(),
                last_seen: now,
                joined_at,
            });
        for addr in entry.addrs {
            self.network.add_address(entry.node, addr);
        }
    }

    fn apply_member_leave(&self, realm: &RealmId, node: &NodeId) {
        self.remove_realm_peer(realm, node);
    }

    fn apply_metadata(&self, realm: &RealmId, from: &NodeId, payload: &[u8]) {
        let Ok(name) = std::str::from_utf8(payload) else {
            return;
        };
        if let Some(state) = self.state.read().expect("state lock poisoned").as_ref()
            && state.realm_id == *realm
        {
            state
                .metadata
                .write()
                .expect("metadata lock poisoned")
                .display_name = name.to_string();
        }
        self.touch_peer(realm, from);
    }

    fn touch_peer(&self, realm: &RealmId, node: &NodeId) {
        if let Some(roster) = self.rosters.get(realm)
            && let Some(mut info) = roster.get_mut(node)
        {
            info.last_seen = Utc::now();
        }
    }
}

impl RosterHook for RealmManager {
    fn remove_peer(&self, realm: &RealmId, node: &NodeId) {
        self.remove_realm_peer(realm, node);
    }
}
