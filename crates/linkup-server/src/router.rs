use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use linkup_core::events::ServerEvent;
use linkup_core::ids::{ConnectionId, UserId};
use linkup_core::messages::DirectMessage;

use crate::events::Delivery;
use crate::presence::PresenceRegistry;

/// Resolves recipients against the presence registry and fans a message out
/// to at most one recipient session plus the unconditional sender echo.
pub struct MessageRouter {
    presence: Arc<PresenceRegistry>,
}

impl MessageRouter {
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self { presence }
    }

    /// At-most-once delivery to the recipient, if online; the sender session
    /// always gets the same payload back so the client can render its own
    /// message regardless of delivery outcome. An offline recipient is a
    /// silent drop for the realtime path, never an error.
    pub fn route(
        &self,
        sender_conn: &ConnectionId,
        sender_id: UserId,
        recipient_id: UserId,
        content: String,
    ) -> Vec<Delivery> {
        let message = DirectMessage::new(sender_id, recipient_id.clone(), content);
        let event = ServerEvent::ReceiveMessage(message);

        let mut deliveries = Vec::with_capacity(2);
        if let Some(recipient_conn) = self.presence.lookup(&recipient_id) {
            deliveries.push(Delivery {
                target: recipient_conn,
                event: event.clone(),
            });
        }
        deliveries.push(Delivery {
            target: sender_conn.clone(),
            event,
        });
        deliveries
    }

    /// Push a notification payload to a single user, if online. No echo.
    pub fn notify(&self, user_id: &UserId, notification: Value) -> Vec<Delivery> {
        match self.presence.lookup(user_id) {
            Some(conn) => vec![Delivery {
                target: conn,
                event: ServerEvent::ReceiveNotification {
                    notification,
                    created_at: Utc::now().to_rfc3339(),
                },
            }],
            None => Vec::new(),
        }
    }
}
