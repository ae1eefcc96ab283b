//! Live session handles and the table that owns them
//!
//! A session exists from connection-accept to disconnect. The table is the
//! only owner of session handles; the registry and room index refer to
//! sessions by id and never hold a handle themselves.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::protocol::Frame;
use crate::protocol::messages::SessionId;

/// Handle for pushing outbound frames to one live connection
#[derive(Debug)]
pub struct SessionHandle {
    /// Session ID (uuid, generated at connection-accept)
    pub id: SessionId,
    /// Bounded outbound queue drained by the connection's writer task
    outbound: mpsc::Sender<Frame>,
}

impl SessionHandle {
    /// Create a handle with a fresh session id
    pub fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            outbound,
        }
    }

    /// Enqueue a frame for delivery, never blocking
    ///
    /// A full queue means the recipient is too slow to keep up; the frame is
    /// dropped so one stalled connection cannot hold up fanout to others. A
    /// closed queue means the session is mid-disconnect, which is not an
    /// error.
    pub fn push(&self, frame: Frame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full for session {}, dropping frame", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Outbound queue closed for session {}", self.id);
                false
            }
        }
    }
}

/// Table of live sessions indexed by session id
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionTable {
    /// Create an empty session table
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a session handle
    pub async fn insert(&self, handle: Arc<SessionHandle>) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(handle.id.clone(), handle);
    }

    /// Remove a session handle, returning it if it was present
    ///
    /// Returning None on a repeat call is what makes teardown idempotent.
    pub async fn remove(&self, session: &str) -> Option<Arc<SessionHandle>> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session)
    }

    /// Look up a session handle
    pub async fn get(&self, session: &str) -> Option<Arc<SessionHandle>> {
        let sessions = self.sessions.read().await;
        sessions.get(session).cloned()
    }

    /// Push a frame to a session if it is still live
    pub async fn push_to(&self, session: &str, frame: Frame) -> bool {
        let handle = {
            let sessions = self.sessions.read().await;
            sessions.get(session).cloned()
        };

        match handle {
            Some(handle) => handle.push(frame),
            None => false,
        }
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the table is empty
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameType;

    fn make_session(capacity: usize) -> (Arc<SessionHandle>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(SessionHandle::new(tx)), rx)
    }

    #[tokio::test]
    async fn test_insert_and_push() {
        let table = SessionTable::new();
        let (handle, mut rx) = make_session(4);
        let id = handle.id.clone();
        table.insert(handle).await;

        assert!(table.push_to(&id, Frame::empty(FrameType::Ping)).await);
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Ping);
    }

    #[tokio::test]
    async fn test_push_to_unknown_session() {
        let table = SessionTable::new();
        assert!(!table.push_to("nope", Frame::empty(FrameType::Ping)).await);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let table = SessionTable::new();
        let (handle, _rx) = make_session(4);
        let id = handle.id.clone();
        table.insert(handle).await;

        assert!(table.remove(&id).await.is_some());
        assert!(table.remove(&id).await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_push_drops_when_queue_full() {
        let (handle, _rx) = make_session(1);

        assert!(handle.push(Frame::empty(FrameType::Ping)));
        // Queue is full now; the frame is dropped, not blocked on
        assert!(!handle.push(Frame::empty(FrameType::Ping)));
    }

    #[tokio::test]
    async fn test_push_after_receiver_dropped() {
        let (handle, rx) = make_session(4);
        drop(rx);
        // Silently absorbed; a disconnecting peer is not an error
        assert!(!handle.push(Frame::empty(FrameType::Ping)));
    }
}
