//! Capability traits for the dep2p stack.
//!
//! Every external collaborator of the core (transports, peerstore, liveness,
//! discovery, relay client, hole-puncher, pub/sub, messaging) is consumed
//! through one of these narrow interfaces, so the connection engine and the
//! realm layer never assume a specific implementation. The in-memory
//! implementations in [`crate::mock`] back the test suites.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::addr::PeerAddr;
use crate::context::ConnRealmContext;
use crate::error::{DiscoveryError, LivenessError, SwarmError, TransportError};
use crate::identity::{NodeId, RealmId};

/// A shared handle to a connection.
pub type DynConnection = Arc<dyn Connection>;

/// An owned bidirectional stream.
pub type DynStream = Box<dyn Stream>;

/// How a connection reaches its remote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnType {
    /// A direct transport connection.
    Direct,
    /// A connection tunnelled through a relay circuit.
    Relayed,
}

/// A negotiated bidirectional byte stream.
///
/// The protocol identifier is agreed during stream setup and is available
/// for the lifetime of the stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {
    /// The protocol this stream was opened for.
    fn protocol(&self) -> &str;
}

/// A transport connection to a single remote peer.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// The authenticated identity of the remote.
    fn remote_peer(&self) -> NodeId;

    /// The address the connection was established over.
    fn remote_addr(&self) -> PeerAddr;

    /// Direct or relayed.
    fn conn_type(&self) -> ConnType;

    /// Open an outbound stream for the given protocol.
    async fn open_stream(&self, protocol: &str) -> Result<DynStream, TransportError>;

    /// Accept the next inbound stream.
    async fn accept_stream(&self) -> Result<DynStream, TransportError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;

    /// Close the connection, allowing in-flight streams to drain.
    ///
    /// Falls back to an immediate close where the transport has no
    /// graceful variant.
    async fn graceful_close(&self, _timeout: Duration) -> Result<(), TransportError> {
        self.close().await
    }

    /// Whether the connection has been closed (locally or by the remote).
    fn is_closed(&self) -> bool;

    /// The realm context stamped by the realm-auth handshake, if any.
    fn realm_context(&self) -> Option<ConnRealmContext>;

    /// Stamp the realm context.
    fn set_realm_context(&self, ctx: ConnRealmContext);
}

/// A listening socket producing inbound connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// The bound address.
    fn local_addr(&self) -> PeerAddr;

    /// Accept the next inbound connection.
    async fn accept(&self) -> Result<DynConnection, TransportError>;

    /// Stop accepting.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A wire transport (QUIC, TCP, in-memory, ...), selected by address tag.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The address tags this transport can dial (e.g. `"quic-v1"`, `"tcp"`).
    fn protocols(&self) -> Vec<&'static str>;

    /// Dial the address, expecting the given peer on the other end.
    async fn dial(&self, addr: &PeerAddr, peer: NodeId) -> Result<DynConnection, TransportError>;

    /// Bind a listener on the address.
    async fn listen(&self, addr: &PeerAddr) -> Result<Arc<dyn Listener>, TransportError>;
}

/// Address book for known peers.
pub trait Peerstore: Send + Sync {
    /// All known addresses for a peer.
    fn addrs(&self, peer: &NodeId) -> Vec<PeerAddr>;

    /// Record an address for a peer.
    fn add_addr(&self, peer: NodeId, addr: PeerAddr);

    /// Forget a peer entirely.
    fn remove_peer(&self, peer: &NodeId);
}

/// Connection-manager metadata: per-peer tags such as `relay` or
/// `bootstrap` used to exempt infrastructure peers from liveness sweeps.
pub trait ConnManager: Send + Sync {
    /// Tags currently attached to the peer.
    fn tags(&self, peer: &NodeId) -> Vec<String>;

    /// Attach a tag to a peer.
    fn tag_peer(&self, peer: NodeId, tag: &str);

    /// Whether the peer carries the given tag.
    fn has_tag(&self, peer: &NodeId, tag: &str) -> bool {
        self.tags(peer).iter().any(|t| t == tag)
    }
}

/// Bandwidth accounting sink.
///
/// The engine reports transferred bytes per peer; aggregation and
/// reporting live with the implementation.
pub trait BandwidthCounter: Send + Sync {
    /// Bytes written toward a peer.
    fn log_sent(&self, peer: NodeId, bytes: u64);

    /// Bytes read from a peer.
    fn log_recv(&self, peer: NodeId, bytes: u64);
}

/// Application-level liveness service (ping and goodbye).
#[async_trait]
pub trait Liveness: Send + Sync {
    /// Round-trip ping.
    async fn ping(&self, peer: NodeId) -> Result<Duration, LivenessError>;

    /// Inform the remote that this node is going away.
    async fn goodbye(&self, peer: NodeId, reason: &str) -> Result<(), LivenessError>;
}

/// Shared discovery service (DHT or rendezvous) addressed by namespace.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Announce presence under a namespace.
    async fn announce(&self, namespace: &str) -> Result<(), DiscoveryError>;

    /// Withdraw a previous announcement.
    async fn stop_announce(&self, namespace: &str) -> Result<(), DiscoveryError>;

    /// Find peers announced under a namespace.
    async fn find_peers(
        &self,
        namespace: &str,
    ) -> Result<Vec<(NodeId, Vec<PeerAddr>)>, DiscoveryError>;
}

/// Client side of the relay circuit protocol.
#[async_trait]
pub trait RelayDialer: Send + Sync {
    /// Whether a relay reservation is currently available.
    fn has_relay(&self) -> bool;

    /// The relay server in use, if any.
    fn relay_node(&self) -> Option<NodeId>;

    /// Establish a relayed connection to the target through the configured
    /// relay.
    async fn dial_through_relay(&self, target: NodeId)
    -> Result<DynConnection, TransportError>;
}

/// NAT hole-punching collaborator.
#[async_trait]
pub trait HolePuncher: Send + Sync {
    /// Whether a punch attempt for this peer is already in flight.
    fn is_active(&self, peer: &NodeId) -> bool;

    /// Coordinate a direct connection upgrade over an existing relayed
    /// connection. On success the new direct connection shows up in the
    /// engine's pool through the normal inbound path.
    async fn direct_connect(&self, peer: NodeId) -> Result<(), TransportError>;
}

/// A message received from a pub/sub subscription.
#[derive(Clone, Debug)]
pub struct PubSubMessage {
    /// The publishing peer.
    pub from: NodeId,
    /// The full (namespaced) topic the message arrived on.
    pub topic: String,
    /// The payload.
    pub data: Bytes,
}

/// Shared pub/sub engine, addressed by full topic string.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish to a topic.
    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), TransportError>;

    /// Subscribe to a topic.
    async fn subscribe(&self, topic: &str)
    -> Result<mpsc::Receiver<PubSubMessage>, TransportError>;

    /// Drop a subscription.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// Fire-and-forget datagram messaging over a named protocol.
#[async_trait]
pub trait Messaging: Send + Sync {
    /// Send one message to a peer on the given (full) protocol.
    async fn send(&self, peer: NodeId, protocol: &str, data: Bytes)
    -> Result<(), TransportError>;
}

/// Handler invoked for every inbound stream accepted by the engine.
#[async_trait]
pub trait InboundStreamHandler: Send + Sync {
    /// Dispatch one inbound stream. The handler owns the stream.
    async fn handle_stream(&self, conn: DynConnection, stream: DynStream);
}

/// The connection engine as seen by the realm layer.
///
/// Implemented by the swarm; consumed by the realm manager, the auth
/// driver, and the sync service so they can be tested against fakes.
#[async_trait]
pub trait Network: Send + Sync {
    /// This node's identity.
    fn local_peer(&self) -> NodeId;

    /// Get or establish a connection to a peer.
    async fn dial_peer(&self, peer: NodeId) -> Result<DynConnection, SwarmError>;

    /// All live connections.
    fn connections(&self) -> Vec<DynConnection>;

    /// Live connections to one peer.
    fn connections_to(&self, peer: &NodeId) -> Vec<DynConnection>;

    /// Record a dialing address for a peer (feeds the peerstore).
    fn add_address(&self, peer: NodeId, addr: PeerAddr);

    /// Addresses this node is currently listening on.
    fn listen_addrs(&self) -> Vec<PeerAddr>;

    /// Dial (or reuse) and open a stream in one step.
    async fn open_stream(
        &self,
        peer: NodeId,
        protocol: &str,
    ) -> Result<DynStream, SwarmError> {
        let conn = self.dial_peer(peer).await?;
        Ok(conn.open_stream(protocol).await?)
    }
}

/// Reasons carried by a goodbye call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GoodbyeReason {
    /// The node is leaving its realm.
    Leaving,
    /// The node was removed from a realm by an operator.
    Kicked(RealmId),
    /// The node is shutting down entirely.
    Shutdown,
}

impl GoodbyeReason {
    /// The wire rendering of the reason.
    pub fn as_wire(&self) -> String {
        match self {
            Self::Leaving => "leaving".to_string(),
            Self::Kicked(realm) => format!("kicked:{realm}"),
            Self::Shutdown => "shutdown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goodbye_reason_wire_forms() {
        assert_eq!(GoodbyeReason::Leaving.as_wire(), "leaving");
        assert_eq!(GoodbyeReason::Shutdown.as_wire(), "shutdown");

        let realm = RealmId::new([3u8; 32]);
        let wire = GoodbyeReason::Kicked(realm).as_wire();
        assert!(wire.starts_with("kicked:"));
        assert!(wire.contains(&realm.to_hex()));
    }
}
