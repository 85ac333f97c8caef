//! Realm access policy: levels, join keys, and single-use invites.
//!
//! Each realm carries an access level. `Public` admits anyone holding the
//! realm key, `Protected` additionally demands a join key, and `Private`
//! admits only nodes presenting an unexpired, unused invite issued for
//! them. Join keys are stored salted-and-MAC'd and validated in constant
//! time; invite validation never reveals which check failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tracing::{debug, info};

use dep2p_core::{GoodbyeReason, Liveness, NodeId, RealmId};

use crate::error::RealmError;

type HmacSha256 = Hmac<Sha256>;

/// Invite lifetime.
pub const INVITE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Period of the background invite sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Length of join-key salts.
const SALT_LENGTH: usize = 16;

/// Length of invite tokens.
pub const TOKEN_LENGTH: usize = 32;

/// Who may join a realm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccessLevel {
    /// Anyone holding the realm key.
    #[default]
    Public,
    /// Realm key plus a join key.
    Protected,
    /// Realm key plus a single-use invite.
    Private,
}

/// Removes kicked members from the realm roster.
///
/// Implemented by the realm manager; held weakly here so the controller
/// never keeps the manager alive.
pub trait RosterHook: Send + Sync {
    /// Drop the node from the realm's roster.
    fn remove_peer(&self, realm: &RealmId, node: &NodeId);
}

/// A parsed invite envelope.
///
/// Wire layout: `realmLen(u16 BE) | realm | target(32) | expiresAt(i64 BE,
/// Unix seconds) | token(32)`, where `realm` is the realm ID's opaque
/// string form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteEnvelope {
    /// The realm the invite admits to.
    pub realm: RealmId,
    /// The only node the invite is valid for.
    pub target: NodeId,
    /// Deadline, Unix seconds.
    pub expires_at: i64,
    /// Random single-use token.
    pub token: [u8; TOKEN_LENGTH],
}

impl InviteEnvelope {
    /// Encode to the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let realm_str = self.realm.to_hex();
        let mut out = Vec::with_capacity(2 + realm_str.len() + 32 + 8 + TOKEN_LENGTH);
        out.extend_from_slice(&(realm_str.len() as u16).to_be_bytes());
        out.extend_from_slice(realm_str.as_bytes());
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(&self.expires_at.to_be_bytes());
        out.extend_from_slice(&self.token);
        out
    }

    /// Decode from the wire layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, RealmError> {
        let malformed = || RealmError::Malformed("truncated invite envelope".to_string());

        if bytes.len() < 2 {
            return Err(malformed());
        }
        let realm_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let rest = &bytes[2..];
        if rest.len() != realm_len + 32 + 8 + TOKEN_LENGTH {
            return Err(malformed());
        }

        let realm_str = std::str::from_utf8(&rest[..realm_len])
            .map_err(|_| RealmError::Malformed("invite realm is not utf-8".to_string()))?;
        let realm = RealmId::from_hex(realm_str)
            .map_err(|_| RealmError::Malformed("invite realm is not a realm id".to_string()))?;

        let rest = &rest[realm_len..];
        let target = NodeId::from_bytes(&rest[..32])
            .map_err(|e| RealmError::Malformed(e.to_string()))?;
        let expires_at = i64::from_be_bytes(
            rest[32..40]
                .try_into()
                .map_err(|_| RealmError::Malformed("bad invite deadline".to_string()))?,
        );
        let mut token = [0u8; TOKEN_LENGTH];
        token.copy_from_slice(&rest[40..40 + TOKEN_LENGTH]);

        Ok(Self {
            realm,
            target,
            expires_at,
            token,
        })
    }

    /// Encode to the shareable text form.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.encode())
    }

    /// Parse from the shareable text form.
    pub fn from_base64(s: &str) -> Result<Self, RealmError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|_| RealmError::Malformed("invite is not valid base64".to_string()))?;
        Self::decode(&bytes)
    }
}

#[derive(Clone)]
struct StoredJoinKey {
    salt: [u8; SALT_LENGTH],
    mac: [u8; 32],
}

#[derive(Clone, Debug)]
struct InviteRecord {
    realm: RealmId,
    target: NodeId,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Per-realm access policy and invite store.
///
/// All state is process-local; persistence is out of scope.
pub struct AccessController {
    levels: DashMap<RealmId, AccessLevel>,
    join_keys: DashMap<RealmId, StoredJoinKey>,
    invites: DashMap<[u8; TOKEN_LENGTH], InviteRecord>,
    liveness: Mutex<Option<Arc<dyn Liveness>>>,
    roster: Mutex<Option<Weak<dyn RosterHook>>>,
    sweeper_running: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl Default for AccessController {
    fn default() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            levels: DashMap::new(),
            join_keys: DashMap::new(),
            invites: DashMap::new(),
            liveness: Mutex::new(None),
            roster: Mutex::new(None),
            sweeper_running: AtomicBool::new(false),
            shutdown,
        }
    }
}

impl AccessController {
    /// Create a controller with every realm defaulting to `Public`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach the liveness collaborator used for kick goodbyes.
    pub fn set_liveness(&self, liveness: Arc<dyn Liveness>) {
        *self.liveness.lock().expect("liveness lock poisoned") = Some(liveness);
    }

    /// Attach the roster hook (held weakly).
    pub fn set_roster(&self, roster: Weak<dyn RosterHook>) {
        *self.roster.lock().expect("roster lock poisoned") = Some(roster);
    }

    /// Set a realm's access level.
    pub fn set_access(&self, realm: RealmId, level: AccessLevel) {
        info!(realm = %realm.short_id(), ?level, "Access level changed");
        self.levels.insert(realm, level);
    }

    /// A realm's current access level (`Public` if never set).
    pub fn access_level(&self, realm: &RealmId) -> AccessLevel {
        self.levels.get(realm).map(|l| *l).unwrap_or_default()
    }

    /// Install a join key for a realm, replacing any previous one.
    ///
    /// Only a fresh salt and the salted MAC are retained; the key itself is
    /// not stored.
    pub fn set_join_key(&self, realm: RealmId, key: &[u8]) {
        let mut salt = [0u8; SALT_LENGTH];
        rand::rng().fill_bytes(&mut salt);
        let mac = salted_mac(&salt, key);
        self.join_keys.insert(realm, StoredJoinKey { salt, mac });
    }

    /// Remove a realm's join key.
    pub fn clear_join_key(&self, realm: &RealmId) {
        self.join_keys.remove(realm);
    }

    /// Validate a join-key candidate in constant time.
    ///
    /// Absent a stored key this returns `false`; only `Public` realms
    /// accept without one.
    pub fn validate_join_key(&self, realm: &RealmId, candidate: &[u8]) -> bool {
        let Some(stored) = self.join_keys.get(realm).map(|k| k.clone()) else {
            return false;
        };
        let mac = salted_mac(&stored.salt, candidate);
        bool::from(mac.ct_eq(&stored.mac))
    }

    /// Issue an invite for `target` to join `realm`.
    ///
    /// Only `Private` realms issue invites. The returned envelope is
    /// opaque; hand it to the target out of band.
    pub fn generate_invite(&self, realm: RealmId, target: NodeId) -> Result<Vec<u8>, RealmError> {
        if self.access_level(&realm) != AccessLevel::Private {
            return Err(RealmError::AccessDenied);
        }

        let mut token = [0u8; TOKEN_LENGTH];
        rand::rng().fill_bytes(&mut token);

        let now = Utc::now();
        let expires_at = now + INVITE_TTL;
        self.invites.insert(
            token,
            InviteRecord {
                realm,
                target,
                created_at: now,
                expires_at,
            },
        );

        debug!(
            realm = %realm.short_id(),
            target = %target.short_id(),
            "Issued invite"
        );
        Ok(InviteEnvelope {
            realm,
            target,
            expires_at: expires_at.timestamp(),
            token,
        }
        .encode())
    }

    /// Validate and consume an invite.
    ///
    /// Returns `true` at most once per issued invite: success deletes the
    /// stored token. Any mismatch returns `false` without revealing which
    /// check failed.
    pub fn validate_invite(&self, realm: &RealmId, envelope: &[u8], node: &NodeId) -> bool {
        match self.check_invite(realm, envelope, node) {
            Ok(()) => true,
            Err(err) => {
                debug!(realm = %realm.short_id(), node = %node.short_id(), %err, "Invite rejected");
                false
            }
        }
    }

    fn check_invite(
        &self,
        realm: &RealmId,
        envelope: &[u8],
        node: &NodeId,
    ) -> Result<(), RealmError> {
        let envelope = InviteEnvelope::decode(envelope).map_err(|_| RealmError::InvalidInvite)?;
        if envelope.realm != *realm {
            return Err(RealmError::InvalidInvite);
        }
        if envelope.target != *node {
            return Err(RealmError::InviteNotForNode);
        }
        if Utc::now().timestamp() > envelope.expires_at {
            return Err(RealmError::InviteExpired);
        }

        // Consume the token only when the stored record agrees with the
        // envelope; remove_if keeps check-and-delete atomic.
        let now = Utc::now();
        let removed = self.invites.remove_if(&envelope.token, |_, record| {
            record.realm == *realm && record.target == *node && now <= record.expires_at
        });
        match removed {
            Some(_) => Ok(()),
            None => Err(RealmError::InvalidInvite),
        }
    }

    /// Gatekeeper for a join attempt, dispatched by access level.
    pub fn can_join(
        &self,
        realm: &RealmId,
        node: &NodeId,
        join_key: Option<&[u8]>,
        invite: Option<&[u8]>,
    ) -> Result<(), RealmError> {
        match self.access_level(realm) {
            AccessLevel::Public => Ok(()),
            AccessLevel::Protected => match join_key {
                None => Err(RealmError::AccessDenied),
                Some(key) if self.validate_join_key(realm, key) => Ok(()),
                Some(_) => Err(RealmError::InvalidJoinKey),
            },
            AccessLevel::Private => match invite {
                None => Err(RealmError::AccessDenied),
                Some(envelope) if self.validate_invite(realm, envelope, node) => Ok(()),
                Some(_) => Err(RealmError::InvalidInvite),
            },
        }
    }

    /// Remove a member: best-effort goodbye, then roster removal.
    pub async fn kick_member(&self, realm: RealmId, node: NodeId) {
        let liveness = self
            .liveness
            .lock()
            .expect("liveness lock poisoned")
            .clone();
        if let Some(liveness) = liveness {
            let reason = GoodbyeReason::Kicked(realm).as_wire();
            if let Err(err) = liveness.goodbye(node, &reason).await {
                debug!(node = %node.short_id(), %err, "Kick goodbye failed");
            }
        }

        let roster = self.roster.lock().expect("roster lock poisoned").clone();
        if let Some(roster) = roster.and_then(|weak| weak.upgrade()) {
            roster.remove_peer(&realm, &node);
        }
        info!(realm = %realm.short_id(), node = %node.short_id(), "Member kicked");
    }

    /// Drop expired invites. Returns how many were removed.
    pub fn prune_invites(&self) -> usize {
        let now = Utc::now();
        let before = self.invites.len();
        self.invites.retain(|_, record| now <= record.expires_at);
        before - self.invites.len()
    }

    /// Number of outstanding invites.
    pub fn invite_count(&self) -> usize {
        self.invites.len()
    }

    /// Start the hourly invite sweeper. Idempotent.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let controller = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let removed = controller.prune_invites();
                        if removed > 0 {
                            debug!(removed, "Pruned expired invites");
                        }
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

fn salted_mac(salt: &[u8], key: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC accepts any key length");
    mac.update(key);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}
