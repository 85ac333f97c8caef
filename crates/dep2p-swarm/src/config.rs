//! Connection engine configuration.

use std::time::Duration;

/// Tunables of the [`crate::Swarm`].
#[derive(Clone, Debug)]
pub struct SwarmConfig {
    /// Fan-out deadline when dialing remote addresses.
    pub dial_timeout: Duration,
    /// Fan-out deadline when any candidate address is private.
    pub dial_timeout_local: Duration,
    /// Period of the liveness health loop.
    pub health_interval: Duration,
    /// Per-peer ping budget within a health sweep.
    pub health_timeout: Duration,
    /// Budget for graceful connection close during shutdown.
    pub graceful_close_timeout: Duration,
    /// Dial-failure count past which failure logs are demoted to debug.
    pub failure_log_threshold: u32,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(15),
            dial_timeout_local: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(10),
            graceful_close_timeout: Duration::from_secs(5),
            failure_log_threshold: 3,
        }
    }
}
