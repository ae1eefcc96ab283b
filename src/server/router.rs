//! Event routing and session lifecycle
//!
//! `RelayCore` is the process-scoped object that owns the session table,
//! connection registry, and room index for the server's lifetime. The
//! router itself keeps no per-event state: every inbound event is resolved
//! against the registry and index, fanned out to the matching sessions, and
//! forgotten. Delivery is fire-and-forget; recipients that are offline or
//! behind simply miss the event.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::RelayConfig;
use crate::error::{RelayError, Result};
use crate::protocol::codec::Encodable;
use crate::protocol::frame::Frame;
use crate::protocol::messages::{
    Connected, Identity, MessageReceived, NewMessage, RoomKey, SessionId, StopTyping, Typing,
};
use crate::server::registry::ConnectionRegistry;
use crate::server::rooms::RoomIndex;
use crate::server::session::{SessionHandle, SessionTable};

/// Inbound events emitted by a connection's receive loop
///
/// Events from one connection are dispatched in receipt order, so a single
/// client's setup/join/typing sequence is never reordered.
#[derive(Debug)]
pub enum InboundEvent {
    /// Client declares its identity
    Setup { identity: String },

    /// Client enters a room
    JoinRoom { room: RoomKey },

    /// Client exits a room
    LeaveRoom { room: RoomKey },

    /// Client is composing a message
    Typing { room: RoomKey },

    /// Client stopped composing
    StopTyping { room: RoomKey },

    /// A persisted message relayed by the API layer for live delivery
    NewMessage { message: NewMessage },
}

/// Connection/room registry and event-fanout engine
#[derive(Debug)]
pub struct RelayCore {
    sessions: Arc<SessionTable>,
    registry: ConnectionRegistry,
    rooms: RoomIndex,
    outbound_buffer: usize,
}

impl RelayCore {
    /// Create the relay core from configuration
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            sessions: Arc::new(SessionTable::new()),
            registry: ConnectionRegistry::new(config.max_sessions_per_identity),
            rooms: RoomIndex::new(config.max_rooms_per_session),
            outbound_buffer: config.outbound_buffer,
        }
    }

    /// Get the session table
    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Get the connection registry
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Get the room index
    pub fn rooms(&self) -> &RoomIndex {
        &self.rooms
    }

    /// Register a new connection
    ///
    /// The session is addressable for outbound push immediately; identity
    /// and room membership arrive later through setup/join events. Returns
    /// the handle and the receiver end of its outbound queue, which the
    /// connection's writer task drains.
    pub async fn connect_session(&self) -> (Arc<SessionHandle>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        let handle = Arc::new(SessionHandle::new(tx));
        self.sessions.insert(Arc::clone(&handle)).await;
        debug!("Session {} connected", handle.id);
        (handle, rx)
    }

    /// Tear down a session on disconnect
    ///
    /// Removes the session from every room, unbinds it from its identity,
    /// and releases the handle, in that order. Safe to call more than once;
    /// only the first call does any work.
    pub async fn teardown_session(&self, session: &SessionId) {
        let rooms_left = self.rooms.leave_all(session).await;
        let identity = self.registry.unbind(session).await;

        if self.sessions.remove(session).await.is_some() {
            info!(
                "Session {} disconnected (identity: {:?}, rooms left: {})",
                session,
                identity,
                rooms_left.len()
            );
        }
    }

    /// Dispatch a single inbound event
    ///
    /// Malformed events are dropped with a diagnostic and never partially
    /// delivered; nothing is reported back to the client.
    pub async fn handle_event(&self, session: &SessionId, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Setup { identity } => self.handle_setup(session, identity).await,
            InboundEvent::JoinRoom { room } => self.handle_join(session, room).await,
            InboundEvent::LeaveRoom { room } => self.handle_leave(session, room).await,
            InboundEvent::Typing { room } => {
                self.handle_typing(session, room, TypingKind::Start).await
            }
            InboundEvent::StopTyping { room } => {
                self.handle_typing(session, room, TypingKind::Stop).await
            }
            InboundEvent::NewMessage { message } => self.handle_new_message(session, message).await,
        }
    }

    /// Bind the session to an identity and acknowledge
    async fn handle_setup(&self, session: &SessionId, identity: String) -> Result<()> {
        if identity.is_empty() {
            warn!("Dropping setup with empty identity from session {}", session);
            return Ok(());
        }

        if !self.registry.bind(session, &identity).await {
            warn!(
                "Dropping setup for identity {} from session {}: session cap reached",
                identity, session
            );
            return Ok(());
        }

        info!("Session {} bound to identity {}", session, identity);

        let ack = Connected {
            session_id: session.clone(),
        };
        self.sessions.push_to(session, encode(&ack)?).await;
        Ok(())
    }

    /// Record room membership; no fanout
    async fn handle_join(&self, session: &SessionId, room: RoomKey) -> Result<()> {
        if room.is_empty() {
            warn!("Dropping join with empty room key from session {}", session);
            return Ok(());
        }

        if self.rooms.join(&room, session).await {
            debug!("Session {} joined room {}", session, room);
        } else {
            warn!(
                "Dropping join of room {} from session {}: room cap reached",
                room, session
            );
        }
        Ok(())
    }

    /// Remove room membership; no fanout
    async fn handle_leave(&self, session: &SessionId, room: RoomKey) -> Result<()> {
        if room.is_empty() {
            warn!("Dropping leave with empty room key from session {}", session);
            return Ok(());
        }

        self.rooms.leave(&room, session).await;
        debug!("Session {} left room {}", session, room);
        Ok(())
    }

    /// Broadcast a typing indicator to the room, excluding the sending
    /// session
    ///
    /// Exclusion is by session, not identity: another device of the same
    /// user still sees the indicator. This is a presence signal, not a
    /// content echo, so that is acceptable.
    async fn handle_typing(
        &self,
        session: &SessionId,
        room: RoomKey,
        kind: TypingKind,
    ) -> Result<()> {
        if room.is_empty() {
            warn!(
                "Dropping typing indicator with empty room key from session {}",
                session
            );
            return Ok(());
        }

        let sender = self.registry.identity_of(session).await;
        let frame = match kind {
            TypingKind::Start => encode(&Typing {
                room: room.clone(),
                sender,
            })?,
            TypingKind::Stop => encode(&StopTyping {
                room: room.clone(),
                sender,
            })?,
        };

        for member in self.rooms.members_of(&room).await {
            if member == *session {
                continue;
            }
            self.sessions.push_to(&member, frame.clone()).await;
        }
        Ok(())
    }

    /// Deliver a message notification to every participant identity except
    /// the sender's
    ///
    /// Exclusion here is by identity: none of the sender's connected
    /// devices receive the echo. Recipients are addressed through the
    /// registry, not room membership, because the API layer resolves the
    /// participant list itself.
    async fn handle_new_message(&self, session: &SessionId, message: NewMessage) -> Result<()> {
        if message.conversation.id.is_empty() {
            warn!(
                "Dropping message event with empty conversation id from session {}",
                session
            );
            return Ok(());
        }

        let sender_identity = message.sender.identity.clone();
        if sender_identity.is_empty() {
            warn!(
                "Dropping message event with empty sender identity from session {}",
                session
            );
            return Ok(());
        }

        // Dedupe the participant list so no session receives the event twice
        let mut recipients: Vec<Identity> = message
            .conversation
            .participants
            .iter()
            .map(|p| p.identity.clone())
            .filter(|identity| !identity.is_empty() && *identity != sender_identity)
            .collect();
        recipients.sort_unstable();
        recipients.dedup();

        let conversation_id = message.conversation.id.clone();
        let frame = encode(&MessageReceived(message))?;

        let mut delivered = 0usize;
        for identity in &recipients {
            for recipient in self.registry.sessions_of(identity).await {
                if self.sessions.push_to(&recipient, frame.clone()).await {
                    delivered += 1;
                }
            }
        }

        debug!(
            "Message in conversation {} delivered to {} sessions",
            conversation_id, delivered
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum TypingKind {
    Start,
    Stop,
}

fn encode<T: Encodable>(msg: &T) -> Result<Frame> {
    msg.encode_frame()
        .map_err(|e| RelayError::serialization(format!("Failed to encode frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameType;
    use crate::protocol::codec::Decodable;
    use crate::protocol::messages::{Conversation, Participant};

    fn core() -> RelayCore {
        RelayCore::new(&RelayConfig::default())
    }

    async fn connect(core: &RelayCore) -> (SessionId, mpsc::Receiver<Frame>) {
        let (handle, rx) = core.connect_session().await;
        (handle.id.clone(), rx)
    }

    async fn setup(core: &RelayCore, session: &SessionId, identity: &str) {
        core.handle_event(
            session,
            InboundEvent::Setup {
                identity: identity.to_string(),
            },
        )
        .await
        .unwrap();
    }

    async fn join(core: &RelayCore, session: &SessionId, room: &str) {
        core.handle_event(
            session,
            InboundEvent::JoinRoom {
                room: room.to_string(),
            },
        )
        .await
        .unwrap();
    }

    fn message(conversation: &str, participants: &[&str], sender: &str) -> NewMessage {
        NewMessage {
            conversation: Conversation {
                id: conversation.to_string(),
                participants: participants.iter().map(|p| Participant::new(*p)).collect(),
                extra: serde_json::Map::new(),
            },
            sender: Participant::new(sender),
            content: "hi".to_string(),
            extra: serde_json::Map::new(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_setup_acknowledged() {
        let core = core();
        let (s1, mut rx1) = connect(&core).await;
        setup(&core, &s1, "alice").await;

        let frames = drain(&mut rx1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::Connected);
        let ack = Connected::decode_frame(&frames[0]).unwrap();
        assert_eq!(ack.session_id, s1);
    }

    #[tokio::test]
    async fn test_typing_excludes_sending_session() {
        let core = core();
        let (a1, mut rx_a1) = connect(&core).await;
        let (b1, mut rx_b1) = connect(&core).await;
        setup(&core, &a1, "alice").await;
        setup(&core, &b1, "bob").await;
        drain(&mut rx_a1);
        drain(&mut rx_b1);

        join(&core, &a1, "room-1").await;
        join(&core, &b1, "room-1").await;

        core.handle_event(
            &a1,
            InboundEvent::Typing {
                room: "room-1".to_string(),
            },
        )
        .await
        .unwrap();

        let b_frames = drain(&mut rx_b1);
        assert_eq!(b_frames.len(), 1);
        assert_eq!(b_frames[0].frame_type, FrameType::Typing);
        let typing = Typing::decode_frame(&b_frames[0]).unwrap();
        assert_eq!(typing.room, "room-1");
        assert_eq!(typing.sender, Some("alice".to_string()));

        // Never echoed to the sender itself
        assert!(drain(&mut rx_a1).is_empty());
    }

    #[tokio::test]
    async fn test_typing_reaches_senders_other_device() {
        let core = core();
        let (a1, mut rx_a1) = connect(&core).await;
        let (a2, mut rx_a2) = connect(&core).await;
        setup(&core, &a1, "alice").await;
        setup(&core, &a2, "alice").await;
        drain(&mut rx_a1);
        drain(&mut rx_a2);

        join(&core, &a1, "room-1").await;
        join(&core, &a2, "room-1").await;

        core.handle_event(
            &a1,
            InboundEvent::Typing {
                room: "room-1".to_string(),
            },
        )
        .await
        .unwrap();

        // Exclusion is per session: the other device of the same identity
        // still receives the presence signal
        assert_eq!(drain(&mut rx_a2).len(), 1);
        assert!(drain(&mut rx_a1).is_empty());
    }

    #[tokio::test]
    async fn test_new_message_excludes_sender_identity() {
        let core = core();
        let (a1, mut rx_a1) = connect(&core).await;
        let (a2, mut rx_a2) = connect(&core).await;
        let (b1, mut rx_b1) = connect(&core).await;
        setup(&core, &a1, "alice").await;
        setup(&core, &a2, "alice").await;
        setup(&core, &b1, "bob").await;
        drain(&mut rx_a1);
        drain(&mut rx_a2);
        drain(&mut rx_b1);

        core.handle_event(
            &a1,
            InboundEvent::NewMessage {
                message: message("room-1", &["alice", "bob"], "alice"),
            },
        )
        .await
        .unwrap();

        let b_frames = drain(&mut rx_b1);
        assert_eq!(b_frames.len(), 1);
        assert_eq!(b_frames[0].frame_type, FrameType::MessageReceived);
        let received = MessageReceived::decode_frame(&b_frames[0]).unwrap();
        assert_eq!(received.0.content, "hi");
        assert_eq!(received.0.sender.identity, "alice");

        // Neither of the sender's devices gets the echo
        assert!(drain(&mut rx_a1).is_empty());
        assert!(drain(&mut rx_a2).is_empty());
    }

    #[tokio::test]
    async fn test_new_message_reaches_all_recipient_devices_once() {
        let core = core();
        let (a1, _rx_a1) = connect(&core).await;
        let (b1, mut rx_b1) = connect(&core).await;
        let (b2, mut rx_b2) = connect(&core).await;
        setup(&core, &a1, "alice").await;
        setup(&core, &b1, "bob").await;
        setup(&core, &b2, "bob").await;
        drain(&mut rx_b1);
        drain(&mut rx_b2);

        // "bob" listed twice must not double-deliver
        core.handle_event(
            &a1,
            InboundEvent::NewMessage {
                message: message("room-1", &["alice", "bob", "bob"], "alice"),
            },
        )
        .await
        .unwrap();

        assert_eq!(drain(&mut rx_b1).len(), 1);
        assert_eq!(drain(&mut rx_b2).len(), 1);
    }

    #[tokio::test]
    async fn test_new_message_ignores_offline_participants() {
        let core = core();
        let (a1, _rx_a1) = connect(&core).await;
        let (b1, mut rx_b1) = connect(&core).await;
        setup(&core, &a1, "alice").await;
        setup(&core, &b1, "bob").await;
        drain(&mut rx_b1);

        core.handle_event(
            &a1,
            InboundEvent::NewMessage {
                message: message("room-1", &["alice", "bob", "carol"], "alice"),
            },
        )
        .await
        .unwrap();

        // carol is offline; delivery to bob is unaffected
        assert_eq!(drain(&mut rx_b1).len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_dropped() {
        let core = core();
        let (a1, _rx_a1) = connect(&core).await;
        let (b1, mut rx_b1) = connect(&core).await;
        setup(&core, &a1, "alice").await;
        setup(&core, &b1, "bob").await;
        drain(&mut rx_b1);

        // Empty conversation id: dropped, nothing delivered
        core.handle_event(
            &a1,
            InboundEvent::NewMessage {
                message: message("", &["alice", "bob"], "alice"),
            },
        )
        .await
        .unwrap();
        assert!(drain(&mut rx_b1).is_empty());

        // Empty sender identity: dropped, nothing delivered
        core.handle_event(
            &a1,
            InboundEvent::NewMessage {
                message: message("room-1", &["alice", "bob"], ""),
            },
        )
        .await
        .unwrap();
        assert!(drain(&mut rx_b1).is_empty());
    }

    #[tokio::test]
    async fn test_typing_empty_room_dropped() {
        let core = core();
        let (a1, mut rx_a1) = connect(&core).await;
        let (b1, mut rx_b1) = connect(&core).await;
        setup(&core, &a1, "alice").await;
        setup(&core, &b1, "bob").await;
        drain(&mut rx_a1);
        drain(&mut rx_b1);
        join(&core, &a1, "room-1").await;
        join(&core, &b1, "room-1").await;

        core.handle_event(
            &a1,
            InboundEvent::Typing {
                room: String::new(),
            },
        )
        .await
        .unwrap();

        assert!(drain(&mut rx_b1).is_empty());
    }

    #[tokio::test]
    async fn test_teardown_purges_rooms_and_registry() {
        let core = core();
        let (a1, mut rx_a1) = connect(&core).await;
        let (b1, mut rx_b1) = connect(&core).await;
        setup(&core, &a1, "alice").await;
        setup(&core, &b1, "bob").await;
        drain(&mut rx_a1);
        drain(&mut rx_b1);
        join(&core, &a1, "room-1").await;
        join(&core, &b1, "room-1").await;

        core.teardown_session(&b1).await;

        assert_eq!(core.rooms().members_of("room-1").await, vec![a1.clone()]);
        assert!(core.registry().sessions_of("bob").await.is_empty());
        assert!(core.sessions().get(&b1).await.is_none());

        // Teardown is idempotent
        core.teardown_session(&b1).await;

        // Fanout after teardown simply no longer includes the session
        core.handle_event(
            &a1,
            InboundEvent::Typing {
                room: "room-1".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(drain(&mut rx_b1).is_empty());
    }

    #[tokio::test]
    async fn test_full_scenario() {
        // alice/a1 and bob/b1 join room-1; typing reaches only b1; a
        // message reaches only b1; after bob disconnects the room holds a1
        let core = core();
        let (a1, mut rx_a1) = connect(&core).await;
        let (b1, mut rx_b1) = connect(&core).await;
        setup(&core, &a1, "alice").await;
        setup(&core, &b1, "bob").await;
        drain(&mut rx_a1);
        drain(&mut rx_b1);
        join(&core, &a1, "room-1").await;
        join(&core, &b1, "room-1").await;

        core.handle_event(
            &a1,
            InboundEvent::Typing {
                room: "room-1".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(drain(&mut rx_b1).len(), 1);
        assert!(drain(&mut rx_a1).is_empty());

        core.handle_event(
            &a1,
            InboundEvent::NewMessage {
                message: message("room-1", &["alice", "bob"], "alice"),
            },
        )
        .await
        .unwrap();
        let b_frames = drain(&mut rx_b1);
        assert_eq!(b_frames.len(), 1);
        assert_eq!(b_frames[0].frame_type, FrameType::MessageReceived);
        assert!(drain(&mut rx_a1).is_empty());

        core.teardown_session(&b1).await;
        assert_eq!(core.rooms().members_of("room-1").await, vec![a1]);
    }
}
