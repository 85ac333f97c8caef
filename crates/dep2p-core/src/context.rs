//! Per-connection realm authentication context.
//!
//! Every connection carries an optional [`ConnRealmContext`] stamped by the
//! realm-auth handshake. A connection whose context is absent, unverified,
//! or expired must never carry non-system application traffic; the protocol
//! router enforces this at stream dispatch.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::RealmId;

/// Proof that a connection belongs to a realm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnRealmContext {
    /// The realm this connection was authenticated for.
    pub realm: RealmId,
    /// Whether the handshake completed successfully.
    pub verified: bool,
    /// When the authentication lapses.
    pub expires_at: DateTime<Utc>,
    /// Optional role assigned by the responder.
    pub role: Option<String>,
}

impl ConnRealmContext {
    /// Create a verified context expiring at the given instant.
    pub fn verified(realm: RealmId, expires_at: DateTime<Utc>) -> Self {
        Self {
            realm,
            verified: true,
            expires_at,
            role: None,
        }
    }

    /// Whether the context authorizes traffic at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.verified && now <= self.expires_at
    }

    /// Whether the context authorizes traffic right now.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Whether the context authorizes traffic for a specific realm.
    pub fn is_valid_for(&self, realm: &RealmId) -> bool {
        self.realm == *realm && self.is_valid()
    }
}

/// Shared storage for a connection's realm context.
///
/// Connection implementations embed one of these to satisfy the context
/// accessors on [`crate::traits::Connection`].
#[derive(Debug, Default)]
pub struct RealmContextCell {
    inner: Mutex<Option<ConnRealmContext>>,
}

impl RealmContextCell {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the current context, if any.
    pub fn get(&self) -> Option<ConnRealmContext> {
        self.inner.lock().expect("context lock poisoned").clone()
    }

    /// Replace the current context.
    pub fn set(&self, ctx: ConnRealmContext) {
        *self.inner.lock().expect("context lock poisoned") = Some(ctx);
    }

    /// Drop the current context.
    pub fn clear(&self) {
        *self.inner.lock().expect("context lock poisoned") = None;
    }
}
