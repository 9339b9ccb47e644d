use std::collections::HashMap;

use parking_lot::RwLock;

use linkup_core::ids::{ConnectionId, UserId};

/// Maps each user identity to its single live connection.
///
/// Both directions are kept under one lock so a connect racing a disconnect
/// can never observe a half-applied update. The reverse index makes
/// disconnect cleanup O(1) instead of a scan over every user.
///
/// Invariant: `by_connection[conn] == user` implies `by_user[user] == conn`.
pub struct PresenceRegistry {
    inner: RwLock<PresenceInner>,
}

#[derive(Default)]
struct PresenceInner {
    by_user: HashMap<UserId, ConnectionId>,
    by_connection: HashMap<ConnectionId, UserId>,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PresenceInner::default()),
        }
    }

    /// Idempotent upsert; last registration wins. Never fails.
    pub fn register(&self, user_id: &UserId, connection_id: &ConnectionId) {
        let mut inner = self.inner.write();

        // Last write wins: a re-join from a newer connection evicts the
        // older connection's claim on this user.
        if let Some(prev_conn) = inner
            .by_user
            .insert(user_id.clone(), connection_id.clone())
        {
            if &prev_conn != connection_id {
                inner.by_connection.remove(&prev_conn);
            }
        }

        // A connection holds at most one identity.
        if let Some(prev_user) = inner
            .by_connection
            .insert(connection_id.clone(), user_id.clone())
        {
            if &prev_user != user_id && inner.by_user.get(&prev_user) == Some(connection_id) {
                inner.by_user.remove(&prev_user);
            }
        }
    }

    /// Pure read: the live connection for a user, if any.
    pub fn lookup(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.inner.read().by_user.get(user_id).cloned()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.read().by_user.contains_key(user_id)
    }

    /// Remove every entry owned by this connection. Called on disconnect.
    /// A user who has since re-registered on a newer connection keeps their
    /// entry.
    pub fn unregister(&self, connection_id: &ConnectionId) {
        let mut inner = self.inner.write();
        if let Some(user) = inner.by_connection.remove(connection_id) {
            if inner.by_user.get(&user) == Some(connection_id) {
                inner.by_user.remove(&user);
            }
        }
    }

    /// Number of users currently online.
    pub fn online_count(&self) -> usize {
        self.inner.read().by_user.len()
    }
}
