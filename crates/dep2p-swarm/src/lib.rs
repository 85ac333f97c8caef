//! # dep2p Swarm
//!
//! The pluggable-transport connection engine of the dep2p fabric.
//!
//! - [`Swarm`]: connection pool, listeners, and the dial fallback chain
//!   (direct → relay circuit addresses → hole-punch → configured relay)
//! - [`PathHealthManager`]: per-path EWMA RTT, state machine, ranking,
//!   and switch decisions
//! - [`RelayBackoff`]: per-(peer, relay) dial suppression
//! - [`SwarmNotifier`] / [`SwarmEvent`]: lifecycle observation
//!
//! The engine consumes transports, the peerstore, liveness, relay, and
//! hole-punching through the capability traits in `dep2p-core`, and
//! implements `dep2p_core::Network` for the realm layer above it.

pub mod backoff;
pub mod config;
pub mod conn;
pub mod health;
pub mod notify;
pub mod swarm;

pub use backoff::{BackoffSnapshot, RelayBackoff, RelayBackoffConfig};
pub use config::SwarmConfig;
pub use conn::{Direction, SwarmConn};
pub use health::{
    PathHealthConfig, PathHealthManager, PathSnapshot, PathState, SwitchDecision, SwitchReason,
};
pub use notify::{SwarmEvent, SwarmNotifier};
pub use swarm::{INFRASTRUCTURE_TAGS, Swarm, SwarmBuilder, SwarmStats};
