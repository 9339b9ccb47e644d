use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, UserId};

/// Who authored a conversation turn.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for ChatRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown chat role: {other}")),
        }
    }
}

/// One role/content turn of prompt history, as sent to the generation provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A persisted conversation message. Immutable once written; `seq` is
/// monotonic within a conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub seq: i64,
    pub role: ChatRole,
    pub content: String,
    pub created_at: String,
}

impl ChatMessage {
    pub fn as_turn(&self) -> ChatTurn {
        ChatTurn {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// A presence-routed direct message. Transient: the realtime path does not
/// persist these.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: String,
}

impl DirectMessage {
    /// Stamp a new direct message with the current time.
    pub fn new(sender_id: UserId, recipient_id: UserId, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            recipient_id,
            content: content.into(),
            created_at: Utc::now().to_rfc3339(),
        }
    }
}
