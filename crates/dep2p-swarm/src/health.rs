//! Per-path health tracking and ranking.
//!
//! Every `(peer, address)` pair the engine has ever probed carries an EWMA
//! round-trip estimate, success counters, and a small state machine:
//! `Unknown → Healthy → Suspect → Dead`, with recovery to `Healthy` on any
//! successful probe. Scores feed address ranking during dials and the
//! switch decision for established connections.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;

use dep2p_core::{NodeId, PeerAddr};

/// Health tunables.
#[derive(Clone, Debug)]
pub struct PathHealthConfig {
    /// EWMA smoothing factor for RTT samples.
    pub ewma_alpha: f64,
    /// Consecutive failures before a path is declared dead.
    pub dead_threshold: u32,
    /// A successful probe slower than `factor * ewma` degrades a healthy
    /// path to suspect.
    pub rtt_climb_factor: f64,
    /// Score multiplier for direct paths.
    pub direct_bias: f64,
    /// Score multiplier for relay paths.
    pub relay_bias: f64,
    /// Minimum relative score improvement before switching paths.
    pub hysteresis: f64,
    /// How long a candidate must have been healthy before it can win a
    /// switch decision.
    pub stability_window: Duration,
    /// Paths unseen for this long are reaped.
    pub path_expiry: Duration,
    /// Assumed RTT for never-probed paths.
    pub default_rtt_ms: f64,
}

impl Default for PathHealthConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.25,
            dead_threshold: 3,
            rtt_climb_factor: 2.0,
            direct_bias: 0.8,
            relay_bias: 1.0,
            hysteresis: 0.10,
            stability_window: Duration::from_secs(30),
            path_expiry: Duration::from_secs(10 * 60),
            default_rtt_ms: 300.0,
        }
    }
}

/// Health state of one path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PathState {
    /// Never probed.
    #[default]
    Unknown,
    /// Probes succeed.
    Healthy,
    /// Degraded: recent failure or climbing RTT.
    Suspect,
    /// Repeated consecutive failures.
    Dead,
}

/// Why a switch was (or wasn't) recommended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SwitchReason {
    /// Stay where you are.
    #[default]
    None,
    /// The current path is dead; switch immediately.
    CurrentDead,
    /// A better path cleared the hysteresis and stability bars.
    BetterPath,
}

/// Outcome of a switch query.
#[derive(Clone, Debug, Default)]
pub struct SwitchDecision {
    /// Whether to switch.
    pub should_switch: bool,
    /// Why.
    pub reason: SwitchReason,
    /// The recommended target, when switching.
    pub target: Option<PeerAddr>,
    /// Score of the current path.
    pub current_score: f64,
    /// Score of the target path.
    pub target_score: f64,
}

/// Read-only view of one path's health.
#[derive(Clone, Debug)]
pub struct PathSnapshot {
    /// The address.
    pub addr: PeerAddr,
    /// Current state.
    pub state: PathState,
    /// Smoothed RTT in milliseconds, if probed.
    pub ewma_rtt_ms: Option<f64>,
    /// Fraction of probes that succeeded.
    pub success_rate: f64,
    /// Consecutive failures so far.
    pub consecutive_failures: u32,
    /// Ranking score (lower is better).
    pub score: f64,
}

#[derive(Clone, Debug)]
struct PathRecord {
    addr: PeerAddr,
    is_relay: bool,
    ewma_rtt_ms: Option<f64>,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    state: PathState,
    state_since: Instant,
    last_seen: Instant,
}

impl PathRecord {
    fn new(addr: PeerAddr) -> Self {
        let is_relay = addr.is_circuit();
        Self {
            addr,
            is_relay,
            ewma_rtt_ms: None,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            state: PathState::Unknown,
            state_since: Instant::now(),
            last_seen: Instant::now(),
        }
    }

    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }

    fn set_state(&mut self, state: PathState) {
        if self.state != state {
            self.state = state;
            self.state_since = Instant::now();
        }
    }
}

/// Tracks path health per `(peer, address)`.
pub struct PathHealthManager {
    paths: DashMap<(NodeId, String), PathRecord>,
    config: PathHealthConfig,
}

impl Default for PathHealthManager {
    fn default() -> Self {
        Self::new(PathHealthConfig::default())
    }
}

impl PathHealthManager {
    /// Create a manager with the given tunables.
    pub fn new(config: PathHealthConfig) -> Self {
        Self {
            paths: DashMap::new(),
            config,
        }
    }

    /// Record a probe outcome for a path.
    ///
    /// `rtt` is present for successes; `error` for failures.
    pub fn report_probe(
        &self,
        peer: NodeId,
        addr: &PeerAddr,
        rtt: Option<Duration>,
        error: Option<&str>,
    ) {
        let key = (peer, addr.to_string());
        let mut record = self
            .paths
            .entry(key)
            .or_insert_with(|| PathRecord::new(addr.clone()));
        record.last_seen = Instant::now();

        match error {
            None => {
                record.successes += 1;
                record.consecutive_failures = 0;

                let rtt_ms = rtt.map(|d| d.as_secs_f64() * 1000.0);
                let climbed = match (record.ewma_rtt_ms, rtt_ms) {
                    (Some(prev), Some(new)) => {
                        record.state == PathState::Healthy
                            && new > prev * self.config.rtt_climb_factor
                    }
                    _ => false,
                };
                if let Some(new) = rtt_ms {
                    record.ewma_rtt_ms = Some(match record.ewma_rtt_ms {
                        Some(prev) => {
                            prev + self.config.ewma_alpha * (new - prev)
                        }
                        None => new,
                    });
                }

                if climbed {
                    record.set_state(PathState::Suspect);
                } else {
                    record.set_state(PathState::Healthy);
                }
            }
            Some(error) => {
                record.failures += 1;
                record.consecutive_failures += 1;
                if record.consecutive_failures >= self.config.dead_threshold {
                    record.set_state(PathState::Dead);
                } else {
                    record.set_state(PathState::Suspect);
                }
                trace!(
                    peer = %peer.short_id(),
                    addr = %addr,
                    failures = record.consecutive_failures,
                    error,
                    "Path probe failed"
                );
            }
        }
    }

    /// Health state of one path (`Unknown` if never seen).
    pub fn state(&self, peer: &NodeId, addr: &PeerAddr) -> PathState {
        self.paths
            .get(&(*peer, addr.to_string()))
            .map(|r| r.state)
            .unwrap_or_default()
    }

    fn score_record(&self, record: &PathRecord) -> f64 {
        let rtt = record.ewma_rtt_ms.unwrap_or(self.config.default_rtt_ms);
        let base = rtt + (1.0 - record.success_rate()) * 1000.0;
        let bias = if record.is_relay {
            self.config.relay_bias
        } else {
            self.config.direct_bias
        };
        base * bias
    }

    /// Ranking score of a path; lower is better. Unprobed paths score at
    /// the configured default RTT.
    pub fn score(&self, peer: &NodeId, addr: &PeerAddr) -> f64 {
        match self.paths.get(&(*peer, addr.to_string())) {
            Some(record) => self.score_record(&record),
            None => {
                let bias = if addr.is_circuit() {
                    self.config.relay_bias
                } else {
                    self.config.direct_bias
                };
                self.config.default_rtt_ms * bias
            }
        }
    }

    /// Sort addresses by score, best first. The sort is stable, so
    /// equally-scored addresses keep their incoming order.
    pub fn rank_addrs(&self, peer: &NodeId, mut addrs: Vec<PeerAddr>) -> Vec<PeerAddr> {
        addrs.sort_by(|a, b| {
            self.score(peer, a)
                .partial_cmp(&self.score(peer, b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        addrs
    }

    /// Rank addresses and drop dead paths, unless every path is dead, in
    /// which case all are retried.
    pub fn usable_addrs(&self, peer: &NodeId, addrs: Vec<PeerAddr>) -> Vec<PeerAddr> {
        let ranked = self.rank_addrs(peer, addrs);
        let alive: Vec<PeerAddr> = ranked
            .iter()
            .filter(|a| self.state(peer, a) != PathState::Dead)
            .cloned()
            .collect();
        if alive.is_empty() { ranked } else { alive }
    }

    /// Whether the engine should move off the current path.
    pub fn should_switch(&self, peer: &NodeId, current: &PeerAddr) -> SwitchDecision {
        let current_state = self.state(peer, current);
        let current_score = self.score(peer, current);

        // Best alternative among known paths of this peer.
        let mut best: Option<(PathRecord, f64)> = None;
        for entry in self.paths.iter() {
            let (entry_peer, _) = entry.key();
            if entry_peer != peer || entry.addr == *current || entry.state == PathState::Dead {
                continue;
            }
            let score = self.score_record(&entry);
            if best.as_ref().map(|(_, s)| score < *s).unwrap_or(true) {
                best = Some((entry.clone(), score));
            }
        }

        if current_state == PathState::Dead {
            let (target, target_score) = match best {
                Some((record, score)) => (Some(record.addr), score),
                None => (None, 0.0),
            };
            return SwitchDecision {
                should_switch: target.is_some(),
                reason: SwitchReason::CurrentDead,
                target,
                current_score,
                target_score,
            };
        }

        if let Some((record, score)) = best {
            let improved = score < current_score * (1.0 - self.config.hysteresis);
            let stable = record.state == PathState::Healthy
                && record.state_since.elapsed() >= self.config.stability_window;
            if improved && stable {
                return SwitchDecision {
                    should_switch: true,
                    reason: SwitchReason::BetterPath,
                    target: Some(record.addr),
                    current_score,
                    target_score: score,
                };
            }
        }

        SwitchDecision {
            should_switch: false,
            reason: SwitchReason::None,
            target: None,
            current_score,
            target_score: 0.0,
        }
    }

    /// All tracked paths for a peer.
    pub fn snapshot(&self, peer: &NodeId) -> Vec<PathSnapshot> {
        self.paths
            .iter()
            .filter(|e| e.key().0 == *peer)
            .map(|e| PathSnapshot {
                addr: e.addr.clone(),
                state: e.state,
                ewma_rtt_ms: e.ewma_rtt_ms,
                success_rate: e.success_rate(),
                consecutive_failures: e.consecutive_failures,
                score: self.score_record(&e),
            })
            .collect()
    }

    /// Reap paths unseen past the expiry.
    pub fn gc(&self) -> usize {
        let expiry = self.config.path_expiry;
        let before = self.paths.len();
        self.paths.retain(|_, record| record.last_seen.elapsed() < expiry);
        before - self.paths.len()
    }

    /// Number of tracked paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
