//! Event payload types for the relay protocol
//!
//! Each event kind carries an explicit serde schema; shape validation
//! happens when a frame payload is decoded into one of these types. The
//! message payload keeps unrecognized fields so the relayed copy matches
//! what the API layer handed in.

use serde::{Deserialize, Serialize};

/// Unique identifier types
///
/// All three are opaque keys owned by the external API layer: the identity
/// is the authenticated user key, the room key is a conversation id, and
/// the session id is generated per connection.
pub type Identity = String;
pub type SessionId = String;
pub type RoomKey = String;

// =============================================================================
// Control Messages (0x00 - 0x0F)
// =============================================================================

/// Client declares its identity after connecting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setup {
    /// Authenticated user key (validated by the API layer, opaque here)
    pub identity: Identity,
}

/// Server acknowledgment of a setup event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connected {
    /// Session ID assigned to this connection
    pub session_id: SessionId,
}

/// Ping message for keepalive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    /// Timestamp when ping was sent (for RTT measurement)
    pub timestamp: u64,
}

/// Pong response to Ping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    /// Echo back the timestamp from Ping
    pub timestamp: u64,
}

/// Graceful disconnect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goodbye {
    /// Reason for disconnect
    pub reason: String,
}

// =============================================================================
// Room Commands (0x10 - 0x1F) - Client -> Server
// =============================================================================

/// Join a conversation room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoom {
    /// Room key (conversation id) to join
    pub room: RoomKey,
}

/// Leave a conversation room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRoom {
    /// Room key to leave
    pub room: RoomKey,
}

// =============================================================================
// Presence Signals (0x20 - 0x2F) - Both directions
// =============================================================================

/// User is composing a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Typing {
    /// Room key
    pub room: RoomKey,
    /// Sender identity (filled by the server on outgoing copies)
    pub sender: Option<Identity>,
}

/// User stopped composing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTyping {
    /// Room key
    pub room: RoomKey,
    /// Sender identity (filled by the server on outgoing copies)
    pub sender: Option<Identity>,
}

// =============================================================================
// Message Relay (0x30 - 0x3F)
// =============================================================================

/// A conversation participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Participant identity
    pub identity: Identity,
    /// Opaque extra fields (display name, avatar, etc.)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Participant {
    pub fn new(identity: impl Into<Identity>) -> Self {
        Self {
            identity: identity.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Conversation metadata attached to a relayed message
///
/// The participant list is resolved by the API layer before the event
/// reaches the relay; no lookups happen here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation id (doubles as the room key)
    pub id: RoomKey,
    /// Fully resolved participant list
    pub participants: Vec<Participant>,
    /// Opaque extra fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A persisted message relayed by the API layer for live delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    /// Conversation with resolved participants
    pub conversation: Conversation,
    /// Message sender
    pub sender: Participant,
    /// Message content (opaque to the relay)
    pub content: String,
    /// Opaque extra fields (timestamps, ids, attachments, etc.)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Live-delivery copy of a message, pushed to recipient sessions
///
/// Carries the original payload unchanged; only the frame type differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageReceived(pub NewMessage);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_setup() {
        let msg = Setup {
            identity: "alice".to_string(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        let decoded: Setup = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.identity, "alice");
    }

    #[test]
    fn test_new_message_keeps_unknown_fields() {
        let json = r#"{
            "conversation": {
                "id": "room-1",
                "participants": [{"identity": "alice", "name": "Alice"}],
                "isGroupChat": false
            },
            "sender": {"identity": "alice"},
            "content": "hi",
            "createdAt": "2024-01-01T00:00:00Z"
        }"#;

        let msg: NewMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.conversation.id, "room-1");
        assert_eq!(msg.sender.identity, "alice");
        assert_eq!(msg.content, "hi");
        assert!(msg.extra.contains_key("createdAt"));
        assert!(msg.conversation.extra.contains_key("isGroupChat"));
        assert!(msg.conversation.participants[0].extra.contains_key("name"));

        // Round-trip keeps the opaque fields
        let reencoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(reencoded["createdAt"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_new_message_requires_participants() {
        let json = r#"{
            "conversation": {"id": "room-1"},
            "sender": {"identity": "alice"},
            "content": "hi"
        }"#;

        assert!(serde_json::from_str::<NewMessage>(json).is_err());
    }

    #[test]
    fn test_message_received_transparent() {
        let msg = NewMessage {
            conversation: Conversation {
                id: "room-1".to_string(),
                participants: vec![Participant::new("alice"), Participant::new("bob")],
                extra: serde_json::Map::new(),
            },
            sender: Participant::new("alice"),
            content: "hi".to_string(),
            extra: serde_json::Map::new(),
        };

        let inbound = serde_json::to_value(&msg).unwrap();
        let outbound = serde_json::to_value(MessageReceived(msg)).unwrap();
        assert_eq!(inbound, outbound);
    }

    #[test]
    fn test_typing_sender_optional() {
        // Clients omit the sender; the server fills it for outgoing copies
        let json = r#"{"room": "room-1", "sender": null}"#;
        let msg: Typing = serde_json::from_str(json).unwrap();
        assert_eq!(msg.room, "room-1");
        assert!(msg.sender.is_none());
    }
}
