//! Connection registry: identity to live-session mapping
//!
//! An identity may have several simultaneous sessions (multiple devices).
//! Both directions of the mapping live under one lock so a bind or unbind
//! is observed atomically by concurrent readers.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::warn;

use crate::protocol::messages::{Identity, SessionId};

#[derive(Debug, Default)]
struct RegistryInner {
    /// Identity -> live sessions bound to it
    by_identity: HashMap<Identity, HashSet<SessionId>>,
    /// Session -> the identity it is bound to
    by_session: HashMap<SessionId, Identity>,
}

/// Registry of which sessions belong to which identity
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    /// Cap on simultaneous sessions per identity, to bound memory growth
    /// under abusive clients
    max_sessions_per_identity: usize,
}

impl ConnectionRegistry {
    /// Create a registry with the given per-identity session cap
    pub fn new(max_sessions_per_identity: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            max_sessions_per_identity,
        }
    }

    /// Bind a session to an identity
    ///
    /// Idempotent for the same identity. A session already bound to a
    /// different identity is moved. Returns false when the identity is at
    /// its session cap; the event is dropped by the caller.
    pub async fn bind(&self, session: &str, identity: &str) -> bool {
        let mut inner = self.inner.write().await;

        match inner.by_session.get(session) {
            Some(current) if current == identity => return true,
            Some(current) => {
                // Re-bind with a different identity: detach from the old
                // entry first
                let current = current.clone();
                if let Some(sessions) = inner.by_identity.get_mut(&current) {
                    sessions.remove(session);
                    if sessions.is_empty() {
                        inner.by_identity.remove(&current);
                    }
                }
                inner.by_session.remove(session);
            }
            None => {}
        }

        let at_cap = inner
            .by_identity
            .get(identity)
            .is_some_and(|sessions| sessions.len() >= self.max_sessions_per_identity);
        if at_cap {
            warn!(
                "Identity {} at session cap ({}), refusing bind for session {}",
                identity, self.max_sessions_per_identity, session
            );
            return false;
        }

        inner
            .by_identity
            .entry(identity.to_string())
            .or_default()
            .insert(session.to_string());
        inner
            .by_session
            .insert(session.to_string(), identity.to_string());
        true
    }

    /// Remove a session from whatever identity holds it
    ///
    /// No-op for an unbound session. Returns the identity it was bound to.
    pub async fn unbind(&self, session: &str) -> Option<Identity> {
        let mut inner = self.inner.write().await;

        let identity = inner.by_session.remove(session)?;
        if let Some(sessions) = inner.by_identity.get_mut(&identity) {
            sessions.remove(session);
            if sessions.is_empty() {
                inner.by_identity.remove(&identity);
            }
        }
        Some(identity)
    }

    /// All live sessions bound to an identity; empty for unknown identities
    pub async fn sessions_of(&self, identity: &str) -> Vec<SessionId> {
        let inner = self.inner.read().await;
        inner
            .by_identity
            .get(identity)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The identity a session is bound to, if any
    pub async fn identity_of(&self, session: &str) -> Option<Identity> {
        let inner = self.inner.read().await;
        inner.by_session.get(session).cloned()
    }

    /// Number of identities with at least one bound session
    pub async fn identity_count(&self) -> usize {
        self.inner.read().await.by_identity.len()
    }
}
