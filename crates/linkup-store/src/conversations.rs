use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use linkup_core::ids::{ConversationId, MessageId, UserId};
use linkup_core::messages::{ChatMessage, ChatRole, ChatTurn};

use crate::database::Database;
use crate::error::StoreError;

/// A chat conversation between a platform user and the AI advisor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub owner_id: UserId,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new conversation.
    #[instrument(skip(self), fields(user_id = %owner_id))]
    pub fn create(
        &self,
        owner_id: &UserId,
        title: Option<&str>,
    ) -> Result<ConversationRow, StoreError> {
        let id = ConversationId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, owner_id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), owner_id.as_str(), title, now, now],
            )?;

            Ok(ConversationRow {
                id,
                owner_id: owner_id.clone(),
                title: title.map(str::to_string),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a conversation by ID.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, owner_id, title, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                [id.as_str()],
                row_to_conversation,
            )
            .map_err(|_| StoreError::NotFound(format!("conversation {id}")))
        })
    }

    /// List conversations for an owner, most recently updated first.
    #[instrument(skip(self), fields(user_id = %owner_id))]
    pub fn list_for_owner(
        &self,
        owner_id: &UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, title, created_at, updated_at
                 FROM conversations WHERE owner_id = ?1
                 ORDER BY updated_at DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(
                    rusqlite::params![owner_id.as_str(), limit, offset],
                    row_to_conversation,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Append a message to a conversation. The next `seq` is computed and
    /// inserted under the connection lock, so ordering is gap-free and
    /// monotonic even with concurrent appenders.
    #[instrument(skip(self, content), fields(conversation_id = %conversation_id, role = %role))]
    pub fn append_message(
        &self,
        conversation_id: &ConversationId,
        role: ChatRole,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        let id = MessageId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM conversations WHERE id = ?1",
                    [conversation_id.as_str()],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !exists {
                return Err(StoreError::NotFound(format!(
                    "conversation {conversation_id}"
                )));
            }

            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
                [conversation_id.as_str()],
                |row| row.get(0),
            )?;

            conn.execute(
                "INSERT INTO messages (id, conversation_id, seq, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    conversation_id.as_str(),
                    seq,
                    role.to_string(),
                    content,
                    now,
                ],
            )?;

            conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, conversation_id.as_str()],
            )?;

            Ok(ChatMessage {
                id,
                conversation_id: conversation_id.clone(),
                seq,
                role,
                content: content.to_string(),
                created_at: now.clone(),
            })
        })
    }

    /// List all messages of a conversation in seq order.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn list_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, seq, role, content, created_at
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map([conversation_id.as_str()], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Conversation history as prompt turns, oldest first.
    pub fn history_as_turns(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatTurn>, StoreError> {
        Ok(self
            .list_messages(conversation_id)?
            .iter()
            .map(ChatMessage::as_turn)
            .collect())
    }

    /// Count messages in a conversation.
    pub fn message_count(&self, conversation_id: &ConversationId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                [conversation_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Database(e.to_string()))
        })
    }

    /// Count all conversations.
    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
                .map_err(|e| StoreError::Database(e.to_string()))
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, rusqlite::Error> {
    Ok(ConversationRow {
        id: ConversationId::from_raw(row.get::<_, String>(0)?),
        owner_id: UserId::from_raw(row.get::<_, String>(1)?),
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ChatMessage, rusqlite::Error> {
    let role: String = row.get(3)?;
    Ok(ChatMessage {
        id: MessageId::from_raw(row.get::<_, String>(0)?),
        conversation_id: ConversationId::from_raw(row.get::<_, String>(1)?),
        seq: row.get(2)?,
        role: role.parse().unwrap_or(ChatRole::User),
        content: row.get(4)?,
        created_at: row.get(5)?,
    })
}
