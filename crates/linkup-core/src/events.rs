use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::UserId;
use crate::messages::DirectMessage;

/// Events a client may send over the bidirectional channel.
///
/// Wire shape is a JSON object with a `type` discriminator, e.g.
/// `{"type":"send_message","senderId":"...","recipientId":"...","content":"..."}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Register this connection's user identity in the presence registry.
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "userId")]
        user_id: UserId,
    },

    /// Route a direct message to a recipient (plus sender echo).
    #[serde(rename = "send_message")]
    SendMessage {
        #[serde(rename = "senderId")]
        sender_id: UserId,
        #[serde(rename = "recipientId")]
        recipient_id: UserId,
        content: String,
    },

    /// Push a notification payload to a single user, if online.
    #[serde(rename = "send_notification")]
    SendNotification {
        #[serde(rename = "userId")]
        user_id: UserId,
        notification: Value,
    },

    /// Subscribe this connection to the dashboard broadcast group.
    #[serde(rename = "join_dashboard")]
    JoinDashboard,
}

/// Events the server pushes to clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Delivered to the recipient and echoed to the sender.
    #[serde(rename = "receive_message")]
    ReceiveMessage(DirectMessage),

    #[serde(rename = "receive_notification")]
    ReceiveNotification {
        notification: Value,
        #[serde(rename = "createdAt")]
        created_at: String,
    },

    /// Aggregate snapshot pushed to the dashboard group. The payload must be
    /// an object (its fields are spread into the frame next to `type`);
    /// `to_wire` returns None for anything else.
    #[serde(rename = "dashboard-update")]
    DashboardUpdate(Value),
}

impl ServerEvent {
    /// Serialize for the wire.
    pub fn to_wire(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}
