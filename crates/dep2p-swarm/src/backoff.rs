//! Per-relay-address dial back-off.
//!
//! Each `(peer, relayServer)` pair that fails to dial is suppressed for an
//! exponentially growing window so the engine does not hammer a broken
//! relay path. A success deletes the entry outright; stale entries are
//! garbage-collected.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use dep2p_core::NodeId;

/// Back-off tunables.
#[derive(Clone, Debug)]
pub struct RelayBackoffConfig {
    /// First-failure delay.
    pub base: Duration,
    /// Delay ceiling.
    pub max: Duration,
    /// Entries untouched for this long are dropped.
    pub gc_after: Duration,
}

impl Default for RelayBackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            max: Duration::from_secs(10 * 60),
            gc_after: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Clone, Debug)]
struct BackoffEntry {
    failures: u32,
    next_retry: Instant,
    last_failure: Instant,
    last_error: String,
}

/// Read-only view of one back-off entry.
#[derive(Clone, Debug)]
pub struct BackoffSnapshot {
    /// Consecutive failures so far.
    pub failures: u32,
    /// Time until the next attempt is allowed (zero if allowed now).
    pub retry_in: Duration,
    /// The most recent failure message.
    pub last_error: String,
}

/// Suppression table keyed by `(peer, relayServer)`.
pub struct RelayBackoff {
    entries: DashMap<(NodeId, NodeId), BackoffEntry>,
    config: RelayBackoffConfig,
}

impl Default for RelayBackoff {
    fn default() -> Self {
        Self::new(RelayBackoffConfig::default())
    }
}

impl RelayBackoff {
    /// Create a table with the given tunables.
    pub fn new(config: RelayBackoffConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// Whether attempts against this pair are currently suppressed.
    pub fn in_backoff(&self, peer: &NodeId, relay: &NodeId) -> bool {
        self.entries
            .get(&(*peer, *relay))
            .map(|e| Instant::now() < e.next_retry)
            .unwrap_or(false)
    }

    /// Record a failure, doubling the suppression window up to the cap.
    /// Returns the delay applied.
    pub fn record_failure(&self, peer: NodeId, relay: NodeId, error: &str) -> Duration {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry((peer, relay))
            .or_insert_with(|| BackoffEntry {
                failures: 0,
                next_retry: now,
                last_failure: now,
                last_error: String::new(),
            });

        entry.failures += 1;
        let exponent = (entry.failures - 1).min(16);
        let delay = self
            .config
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.config.max);
        entry.next_retry = now + delay;
        entry.last_failure = now;
        entry.last_error = error.to_string();

        debug!(
            peer = %peer.short_id(),
            relay = %relay.short_id(),
            failures = entry.failures,
            delay_secs = delay.as_secs(),
            "Relay path backed off"
        );
        delay
    }

    /// Record a success: the pair is no longer suppressed at all.
    pub fn record_success(&self, peer: &NodeId, relay: &NodeId) {
        self.entries.remove(&(*peer, *relay));
    }

    /// Inspect one entry.
    pub fn snapshot(&self, peer: &NodeId, relay: &NodeId) -> Option<BackoffSnapshot> {
        self.entries.get(&(*peer, *relay)).map(|e| BackoffSnapshot {
            failures: e.failures,
            retry_in: e.next_retry.saturating_duration_since(Instant::now()),
            last_error: e.last_error.clone(),
        })
    }

    /// Drop entries whose last failure is older than the GC horizon.
    pub fn gc(&self) -> usize {
        let horizon = self.config.gc_after;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.last_failure.elapsed() < horizon);
        before - self.entries.len()
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is suppressed or tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId::new([byte; 32])
    }

    #[test]
    fn test_failure_enters_backoff() {
        let backoff = RelayBackoff::default();
        assert!(!backoff.in_backoff(&node(1), &node(2)));

        backoff.record_failure(node(1), node(2), "refused");
        assert!(backoff.in_backoff(&node(1), &node(2)));
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = RelayBackoff::default();
        let d1 = backoff.record_failure(node(1), node(2), "refused");
        let d2 = backoff.record_failure(node(1), node(2), "refused");
        let d3 = backoff.record_failure(node(1), node(2), "refused");

        assert_eq!(d1, Duration::from_secs(10));
        assert_eq!(d2, Duration::from_secs(20));
        assert_eq!(d3, Duration::from_secs(40));

        // Drive it to the cap.
        for _ in 0..10 {
            backoff.record_failure(node(1), node(2), "refused");
        }
        let capped = backoff.record_failure(node(1), node(2), "refused");
        assert_eq!(capped, Duration::from_secs(10 * 60));
    }

    #[test]
    fn test_success_clears_entry() {
        let backoff = RelayBackoff::default();
        backoff.record_failure(node(1), node(2), "refused");
        backoff.record_success(&node(1), &node(2));

        assert!(!backoff.in_backoff(&node(1), &node(2)));
        assert!(backoff.is_empty());

        // The next failure starts over at the base delay.
        let delay = backoff.record_failure(node(1), node(2), "refused");
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn test_entries_are_per_pair() {
        let backoff = RelayBackoff::default();
        backoff.record_failure(node(1), node(2), "refused");

        assert!(backoff.in_backoff(&node(1), &node(2)));
        assert!(!backoff.in_backoff(&node(1), &node(3)));
        assert!(!backoff.in_backoff(&node(3), &node(2)));
    }

    #[test]
    fn test_snapshot() {
        let backoff = RelayBackoff::default();
        backoff.record_failure(node(1), node(2), "link down");

        let snap = backoff.snapshot(&node(1), &node(2)).unwrap();
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.last_error, "link down");
        assert!(snap.retry_in <= Duration::from_secs(10));
    }

    #[test]
    fn test_gc_reaps_old_entries() {
        let backoff = RelayBackoff::new(RelayBackoffConfig {
            gc_after: Duration::ZERO,
            ..Default::default()
        });
        backoff.record_failure(node(1), node(2), "refused");
        assert_eq!(backoff.gc(), 1);
        assert!(backoff.is_empty());
    }
}
