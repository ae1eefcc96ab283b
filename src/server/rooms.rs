//! Room membership index
//!
//! Rooms are ephemeral presence groups keyed by conversation id. A room
//! exists exactly as long as it has members: the first join creates the
//! entry and the last leave drops it, so churn never accumulates state.
//! Membership is process-local and rebuilt from client joins after a
//! restart; the durable conversation entities live in the external store.
//!
//! Both directions of the membership relation sit under one lock, which is
//! what makes `leave_all` atomic: a concurrent `members_of` sees a
//! departing session either in every room it joined or in none.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::warn;

use crate::protocol::messages::{RoomKey, SessionId};

#[derive(Debug, Default)]
struct IndexInner {
    /// Room -> member sessions
    members: HashMap<RoomKey, HashSet<SessionId>>,
    /// Session -> rooms it has joined
    joined: HashMap<SessionId, HashSet<RoomKey>>,
}

/// Bidirectional index of room membership
#[derive(Debug)]
pub struct RoomIndex {
    inner: RwLock<IndexInner>,
    /// Cap on rooms per session, to bound memory growth under abusive
    /// clients
    max_rooms_per_session: usize,
}

impl RoomIndex {
    /// Create an index with the given per-session room cap
    pub fn new(max_rooms_per_session: usize) -> Self {
        Self {
            inner: RwLock::new(IndexInner::default()),
            max_rooms_per_session,
        }
    }

    /// Add a session to a room
    ///
    /// Re-joining is a no-op, not an error. Returns false when the session
    /// is at its room cap.
    pub async fn join(&self, room: &str, session: &str) -> bool {
        let mut inner = self.inner.write().await;

        let joined = inner.joined.entry(session.to_string()).or_default();
        if joined.contains(room) {
            return true;
        }
        if joined.len() >= self.max_rooms_per_session {
            warn!(
                "Session {} at room cap ({}), refusing join of {}",
                session, self.max_rooms_per_session, room
            );
            return false;
        }
        joined.insert(room.to_string());
        inner
            .members
            .entry(room.to_string())
            .or_default()
            .insert(session.to_string());
        true
    }

    /// Remove a session from a room; idempotent
    ///
    /// The room entry is dropped when its member set becomes empty.
    pub async fn leave(&self, room: &str, session: &str) -> bool {
        let mut inner = self.inner.write().await;

        let removed = match inner.members.get_mut(room) {
            Some(members) => members.remove(session),
            None => false,
        };
        if !removed {
            return false;
        }

        if inner.members.get(room).is_some_and(|m| m.is_empty()) {
            inner.members.remove(room);
        }
        if let Some(joined) = inner.joined.get_mut(session) {
            joined.remove(room);
            if joined.is_empty() {
                inner.joined.remove(session);
            }
        }
        true
    }

    /// Remove a session from every room it belongs to
    ///
    /// Used on disconnect. Returns the rooms it was removed from; empty and
    /// harmless on a repeat call.
    pub async fn leave_all(&self, session: &str) -> Vec<RoomKey> {
        let mut inner = self.inner.write().await;

        let rooms: Vec<RoomKey> = match inner.joined.remove(session) {
            Some(joined) => joined.into_iter().collect(),
            None => return Vec::new(),
        };

        for room in &rooms {
            if let Some(members) = inner.members.get_mut(room) {
                members.remove(session);
                if members.is_empty() {
                    inner.members.remove(room);
                }
            }
        }

        rooms
    }

    /// Member sessions of a room; empty for unknown rooms
    pub async fn members_of(&self, room: &str) -> Vec<SessionId> {
        let inner = self.inner.read().await;
        inner
            .members
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms a session has joined; empty for unknown sessions
    pub async fn rooms_of(&self, session: &str) -> Vec<RoomKey> {
        let inner = self.inner.read().await;
        inner
            .joined
            .get(session)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a session is in a room
    pub async fn is_member(&self, room: &str, session: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .members
            .get(room)
            .is_some_and(|members| members.contains(session))
    }

    /// Number of rooms with at least one member
    pub async fn room_count(&self) -> usize {
        self.inner.read().await.members.len()
    }
}
