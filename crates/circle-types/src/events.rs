use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Post};

/// A fan-out target. Personal rooms are named `user:<id>`, conversation
/// rooms carry the bare conversation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    User(Uuid),
    Conversation(Uuid),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{}", id),
            Self::Conversation(id) => write!(f, "{}", id),
        }
    }
}

/// Why a `friend:update` was sent, from the receiver's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendUpdateKind {
    Accepted,
    RequestSent,
    RequestReceived,
    Unfollow,
    Block,
    BlockedBy,
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeEvent {
    /// Server confirms successful authentication
    #[serde(rename = "ready")]
    Ready { user_id: Uuid, username: String },

    /// Friend counts or relationship state changed
    #[serde(rename = "friend:update")]
    FriendUpdate {
        kind: FriendUpdateKind,
        new_count: usize,
        other_id: Uuid,
    },

    /// Someone sent the receiver a follow request
    #[serde(rename = "friend:pending")]
    FriendPending { from_id: Uuid, new_count: usize },

    #[serde(rename = "new_message")]
    NewMessage { conversation_id: Uuid, message: Message },

    #[serde(rename = "new_post")]
    NewPost { post: Post },

    #[serde(rename = "joined")]
    Joined { conversation_id: Uuid },

    #[serde(rename = "left")]
    Left { conversation_id: Uuid },

    #[serde(rename = "error")]
    Error { message: String },
}

impl RealtimeEvent {
    /// Wire name of the event, as found in the `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::FriendUpdate { .. } => "friend:update",
            Self::FriendPending { .. } => "friend:pending",
            Self::NewMessage { .. } => "new_message",
            Self::NewPost { .. } => "new_post",
            Self::Joined { .. } => "joined",
            Self::Left { .. } => "left",
            Self::Error { .. } => "error",
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Start receiving `new_message` events for a conversation
    Join { conversation_id: Uuid },

    Leave { conversation_id: Uuid },
}
