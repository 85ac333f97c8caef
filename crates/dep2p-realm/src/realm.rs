//! The joined realm's service facade.
//!
//! A [`Realm`] wraps the shared collaborators (pub/sub, messaging,
//! discovery, streams, relay) behind accessors that prepend the realm
//! namespace to every topic, protocol, and discovery key, so realm code
//! can never address anything outside its tenancy. Accessors are created
//! lazily and cached; the realm holds only weak references back to the
//! manager.

use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use dep2p_core::{
    Discovery, DynConnection, DynStream, Messaging, Network, NodeId, PeerAddr, PubSub,
    PubSubMessage, RealmId, RelayDialer,
};

use crate::error::{RealmError, Result};
use crate::manager::RealmManager;
use crate::namespace::{app_protocol, realm_service_namespace, realm_topic_namespace};

/// A joined realm and its namespaced service accessors.
pub struct Realm {
    id: RealmId,
    name: String,
    manager: Weak<RealmManager>,
    network: Arc<dyn Network>,
    discovery: Option<Arc<dyn Discovery>>,
    pubsub: Option<Arc<dyn PubSub>>,
    messaging: Option<Arc<dyn Messaging>>,
    relay: Option<Arc<dyn RelayDialer>>,
    pubsub_facade: OnceLock<Arc<RealmPubSub>>,
    messaging_facade: OnceLock<Arc<RealmMessaging>>,
    discovery_facade: OnceLock<Arc<RealmDiscovery>>,
    streams_facade: OnceLock<Arc<RealmStreams>>,
    relay_facade: OnceLock<Arc<RealmRelay>>,
}

impl Realm {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: RealmId,
        name: String,
        manager: Weak<RealmManager>,
        network: Arc<dyn Network>,
        discovery: Option<Arc<dyn Discovery>>,
        pubsub: Option<Arc<dyn PubSub>>,
        messaging: Option<Arc<dyn Messaging>>,
        relay: Option<Arc<dyn RelayDialer>>,
    ) -> Self {
        Self {
            id,
            name,
            manager,
            network,
            discovery,
            pubsub,
            messaging,
            relay,
            pubsub_facade: OnceLock::new(),
            messaging_facade: OnceLock::new(),
            discovery_facade: OnceLock::new(),
            streams_facade: OnceLock::new(),
            relay_facade: OnceLock::new(),
        }
    }

    /// The realm's derived identifier.
    pub fn id(&self) -> RealmId {
        self.id
    }

    /// The local display name given at join.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Roster members.
    pub fn peers(&self) -> Vec<NodeId> {
        self.manager
            .upgrade()
            .map(|m| m.realm_peers(&self.id))
            .unwrap_or_default()
    }

    /// Roster size.
    pub fn peer_count(&self) -> usize {
        self.manager
            .upgrade()
            .map(|m| m.realm_peer_count(&self.id))
            .unwrap_or(0)
    }

    /// Topic-namespaced pub/sub.
    pub fn pubsub(&self) -> Result<Arc<RealmPubSub>> {
        let inner = self
            .pubsub
            .clone()
            .ok_or(RealmError::EndpointUnavailable)?;
        Ok(self
            .pubsub_facade
            .get_or_init(|| {
                Arc::new(RealmPubSub {
                    realm: self.id,
                    inner,
                })
            })
            .clone())
    }

    /// Protocol-namespaced messaging.
    pub fn messaging(&self) -> Result<Arc<RealmMessaging>> {
        let inner = self
            .messaging
            .clone()
            .ok_or(RealmError::EndpointUnavailable)?;
        Ok(self
            .messaging_facade
            .get_or_init(|| {
                Arc::new(RealmMessaging {
                    realm: self.id,
                    inner,
                })
            })
            .clone())
    }

    /// Namespace-scoped discovery.
    pub fn discovery(&self) -> Result<Arc<RealmDiscovery>> {
        let inner = self
            .discovery
            .clone()
            .ok_or(RealmError::DiscoveryUnavailable)?;
        Ok(self
            .discovery_facade
            .get_or_init(|| {
                Arc::new(RealmDiscovery {
                    realm: self.id,
                    inner,
                })
            })
            .clone())
    }

    /// Protocol-namespaced stream opening.
    pub fn streams(&self) -> Arc<RealmStreams> {
        self.streams_facade
            .get_or_init(|| {
                Arc::new(RealmStreams {
                    realm: self.id,
                    network: self.network.clone(),
                })
            })
            .clone()
    }

    /// Relay client passthrough.
    pub fn relay(&self) -> Result<Arc<RealmRelay>> {
        let inner = self.relay.clone().ok_or(RealmError::EndpointUnavailable)?;
        Ok(self
            .relay_facade
            .get_or_init(|| Arc::new(RealmRelay { inner }))
            .clone())
    }
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("id", &self.id.short_id())
            .field("name", &self.name)
            .finish()
    }
}

/// Pub/sub scoped to one realm's topic namespace.
pub struct RealmPubSub {
    realm: RealmId,
    inner: Arc<dyn PubSub>,
}

impl RealmPubSub {
    /// Publish to a realm topic.
    pub async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        let full = realm_topic_namespace(&self.realm, topic);
        self.inner.publish(&full, data).await.map_err(Into::into)
    }

    /// Subscribe to a realm topic.
    pub async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<PubSubMessage>> {
        let full = realm_topic_namespace(&self.realm, topic);
        self.inner.subscribe(&full).await.map_err(Into::into)
    }

    /// Drop a realm topic subscription.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let full = realm_topic_namespace(&self.realm, topic);
        self.inner.unsubscribe(&full).await.map_err(Into::into)
    }
}

/// Messaging scoped to one realm's protocol namespace.
pub struct RealmMessaging {
    realm: RealmId,
    inner: Arc<dyn Messaging>,
}

impl RealmMessaging {
    /// Send one message on a realm-scoped user protocol.
    pub async fn send(&self, peer: NodeId, protocol: &str, data: Bytes) -> Result<()> {
        let full = app_protocol(&self.realm, protocol)?;
        self.inner.send(peer, &full, data).await.map_err(Into::into)
    }
}

/// Discovery scoped to one realm's namespace.
pub struct RealmDiscovery {
    realm: RealmId,
    inner: Arc<dyn Discovery>,
}

impl RealmDiscovery {
    /// Announce a realm service.
    pub async fn announce(&self, service: &str) -> Result<()> {
        let full = realm_service_namespace(&self.realm, service);
        self.inner
            .announce(&full)
            .await
            .map_err(|_| RealmError::DiscoveryUnavailable)
    }

    /// Withdraw a realm service announcement.
    pub async fn stop_announce(&self, service: &str) -> Result<()> {
        let full = realm_service_namespace(&self.realm, service);
        self.inner
            .stop_announce(&full)
            .await
            .map_err(|_| RealmError::DiscoveryUnavailable)
    }

    /// Find peers announced under a realm service.
    pub async fn find_peers(&self, service: &str) -> Result<Vec<(NodeId, Vec<PeerAddr>)>> {
        let full = realm_service_namespace(&self.realm, service);
        self.inner
            .find_peers(&full)
            .await
            .map_err(|_| RealmError::DiscoveryUnavailable)
    }
}

/// Stream opening scoped to one realm's protocol namespace.
pub struct RealmStreams {
    realm: RealmId,
    network: Arc<dyn Network>,
}

impl RealmStreams {
    /// Open a stream to a peer on a realm-scoped user protocol.
    pub async fn open(&self, peer: NodeId, protocol: &str) -> Result<DynStream> {
        let full = app_protocol(&self.realm, protocol)?;
        self.network
            .open_stream(peer, &full)
            .await
            .map_err(Into::into)
    }
}

/// Relay client passthrough for realm members.
pub struct RealmRelay {
    inner: Arc<dyn RelayDialer>,
}

impl RealmRelay {
    /// Whether a relay reservation is available.
    pub fn has_relay(&self) -> bool {
        self.inner.has_relay()
    }

    /// The relay server in use, if any.
    pub fn relay_node(&self) -> Option<NodeId> {
        self.inner.relay_node()
    }

    /// Dial a peer through the configured relay.
    pub async fn connect(&self, peer: NodeId) -> Result<DynConnection> {
        Ok(self.inner.dial_through_relay(peer).await?)
    }
}
