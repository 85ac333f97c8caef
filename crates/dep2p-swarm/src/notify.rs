//! Connection event observers.

use dep2p_core::{ConnType, DynConnection, NodeId, PeerAddr};

/// Observer of connection lifecycle events.
///
/// Callbacks are dispatched from dedicated tasks, never under the engine's
/// locks, so implementations may call back into the engine freely.
pub trait SwarmNotifier: Send + Sync {
    /// A connection entered the pool.
    fn connected(&self, conn: &DynConnection);

    /// A connection left the pool.
    fn disconnected(&self, conn: &DynConnection);
}

/// Broadcast event stream of the engine.
#[derive(Clone, Debug)]
pub enum SwarmEvent {
    /// A connection entered the pool.
    Connected {
        /// The remote peer.
        peer: NodeId,
        /// The address the connection runs over.
        addr: PeerAddr,
        /// Direct or relayed.
        conn_type: ConnType,
    },
    /// A connection left the pool.
    Disconnected {
        /// The remote peer.
        peer: NodeId,
    },
    /// A listener stopped accepting.
    ListenerClosed {
        /// The listener's bound address.
        addr: PeerAddr,
    },
}
