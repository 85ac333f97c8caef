//! Short-TTL membership cache.
//!
//! Maps a node to the realm it most recently proved membership in. The
//! cache is consulted at message-ingress checkpoints so that repeated
//! proofs are not required for every message; entries expire after a short
//! TTL and are re-established by the next successful handshake.
//!
//! Expired entries are invisible to readers immediately and physically
//! removed by a sweeper running at half the TTL.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use dep2p_core::{NodeId, RealmId};

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug)]
struct CacheEntry {
    realm: RealmId,
    verified: bool,
    expires_at: Instant,
}

/// Point-in-time cache statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live (unexpired) entries.
    pub entries: usize,
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
}

/// TTL-limited map from node to verified realm.
pub struct MembershipCache {
    entries: DashMap<NodeId, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper_running: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl MembershipCache {
    /// Create a cache with the default 5-minute TTL.
    pub fn new() -> Arc<Self> {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Create a cache with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweeper_running: AtomicBool::new(false),
            shutdown,
        })
    }

    /// The configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a verified membership with the default TTL.
    pub fn add(&self, node: NodeId, realm: RealmId) {
        self.add_with_expiry(node, realm, self.ttl);
    }

    /// Record a verified membership with an explicit lifetime.
    pub fn add_with_expiry(&self, node: NodeId, realm: RealmId, ttl: Duration) {
        self.entries.insert(
            node,
            CacheEntry {
                realm,
                verified: true,
                expires_at: Instant::now() + ttl,
            },
        );
        trace!(node = %node.short_id(), realm = %realm.short_id(), "Cached membership");
    }

    /// Drop a node's entry.
    pub fn remove(&self, node: &NodeId) {
        self.entries.remove(node);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Whether the node has a live, verified entry for the realm.
    pub fn is_member(&self, node: &NodeId, realm: &RealmId) -> bool {
        matches!(self.get(node), Some(r) if r == *realm)
    }

    /// The realm a node last proved membership in, if still live.
    pub fn get(&self, node: &NodeId) -> Option<RealmId> {
        let now = Instant::now();
        match self.entries.get(node) {
            Some(entry) if entry.verified && entry.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.realm)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// All nodes with live entries for the realm.
    pub fn members(&self, realm: &RealmId) -> Vec<NodeId> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.realm == *realm && e.verified && e.expires_at > now)
            .map(|e| *e.key())
            .collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Whether the cache holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Physically remove expired entries.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "Pruned expired membership entries");
        }
        removed
    }

    /// Start the background sweeper at `TTL/2`. Idempotent.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let cache = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let period = self.ttl / 2;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Membership cache sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.prune();
                    }
                }
            }
        });
    }

    /// Stop the sweeper.
    pub fn close(&self) {
        let _ = self.shutdown.send(());
        self.sweeper_running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId::new([byte; 32])
    }

    fn realm(byte: u8) -> RealmId {
        RealmId::new([byte; 32])
    }

    #[test]
    fn test_add_get_remove() {
        let cache = MembershipCache::new();
        cache.add(node(1), realm(9));

        assert_eq!(cache.get(&node(1)), Some(realm(9)));
        assert!(cache.is_member(&node(1), &realm(9)));
        assert!(!cache.is_member(&node(1), &realm(8)));

        cache.remove(&node(1));
        assert_eq!(cache.get(&node(1)), None);
    }

    #[test]
    fn test_expired_entry_invisible() {
        let cache = MembershipCache::new();
        cache.add_with_expiry(node(1), realm(9), Duration::ZERO);

        assert_eq!(cache.get(&node(1)), None);
        assert!(!cache.is_member(&node(1), &realm(9)));
        assert_eq!(cache.len(), 0);
        assert!(cache.members(&realm(9)).is_empty());
    }

    #[test]
    fn test_members_filters_by_realm() {
        let cache = MembershipCache::new();
        cache.add(node(1), realm(9));
        cache.add(node(2), realm(9));
        cache.add(node(3), realm(8));

        let mut members = cache.members(&realm(9));
        members.sort();
        assert_eq!(members, vec![node(1), node(2)]);
    }

    #[test]
    fn test_prune_removes_expired() {
        let cache = MembershipCache::new();
        cache.add_with_expiry(node(1), realm(9), Duration::ZERO);
        cache.add(node(2), realm(9));

        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear() {
        let cache = MembershipCache::new();
        cache.add(node(1), realm(9));
        cache.add(node(2), realm(8));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache = MembershipCache::new();
        cache.add(node(1), realm(9));

        let _ = cache.get(&node(1));
        let _ = cache.get(&node(2));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_sweeper_runs_and_stops() {
        let cache = MembershipCache::with_ttl(Duration::from_millis(20));
        cache.spawn_sweeper();
        cache.add_with_expiry(node(1), realm(9), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(50)).await;
        // The sweeper physically removed the entry, not just hid it.
        assert_eq!(cache.entries.len(), 0);
        cache.close();
    }
}
