use linkup_core::events::{ClientEvent, ServerEvent};
use linkup_core::ids::ConnectionId;

use crate::connection::ConnectionRegistry;
use crate::dashboard::DASHBOARD_GROUP;
use crate::presence::PresenceRegistry;
use crate::router::MessageRouter;

/// One outbound frame produced by event dispatch. The caller executes the
/// actual send, which keeps handlers testable without a live transport.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub target: ConnectionId,
    pub event: ServerEvent,
}

/// Dispatch one inbound client event.
///
/// Handlers mutate only the registries passed in and describe outbound
/// traffic as returned `Delivery` values. Malformed payloads never reach
/// this point — the event loop drops them at the parse step.
pub async fn dispatch(
    event: ClientEvent,
    connection_id: &ConnectionId,
    registry: &ConnectionRegistry,
    presence: &PresenceRegistry,
    router: &MessageRouter,
) -> Vec<Delivery> {
    match event {
        ClientEvent::Join { user_id } => {
            // Identity is set once per session; a conflicting re-join is
            // logged and ignored, leaving the original registration intact.
            if registry.bind_user(connection_id, &user_id).await {
                presence.register(&user_id, connection_id);
                tracing::info!(user_id = %user_id, connection_id = %connection_id, "user joined");
            } else {
                tracing::warn!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    "join ignored: session already bound to another identity"
                );
            }
            Vec::new()
        }

        ClientEvent::SendMessage {
            sender_id,
            recipient_id,
            content,
        } => router.route(connection_id, sender_id, recipient_id, content),

        ClientEvent::SendNotification { user_id, notification } => {
            router.notify(&user_id, notification)
        }

        ClientEvent::JoinDashboard => {
            registry.join_group(connection_id, DASHBOARD_GROUP).await;
            tracing::debug!(connection_id = %connection_id, "joined dashboard group");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use linkup_core::ids::UserId;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceRegistry>,
        router: MessageRouter,
    }

    fn harness() -> Harness {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let presence = Arc::new(PresenceRegistry::new());
        let router = MessageRouter::new(Arc::clone(&presence));
        Harness {
            registry,
            presence,
            router,
        }
    }

    fn user(s: &str) -> UserId {
        UserId::from_raw(s)
    }

    #[tokio::test]
    async fn join_registers_presence() {
        let h = harness();
        let (conn, _rx) = h.registry.register();

        let deliveries = dispatch(
            ClientEvent::Join { user_id: user("alice") },
            &conn,
            &h.registry,
            &h.presence,
            &h.router,
        )
        .await;

        assert!(deliveries.is_empty());
        assert_eq!(h.presence.lookup(&user("alice")), Some(conn));
    }

    #[tokio::test]
    async fn conflicting_join_keeps_first_identity() {
        let h = harness();
        let (conn, _rx) = h.registry.register();

        dispatch(
            ClientEvent::Join { user_id: user("alice") },
            &conn,
            &h.registry,
            &h.presence,
            &h.router,
        )
        .await;
        dispatch(
            ClientEvent::Join { user_id: user("mallory") },
            &conn,
            &h.registry,
            &h.presence,
            &h.router,
        )
        .await;

        assert_eq!(h.presence.lookup(&user("alice")), Some(conn));
        assert_eq!(h.presence.lookup(&user("mallory")), None);
    }

    #[tokio::test]
    async fn rejoin_same_identity_is_idempotent() {
        let h = harness();
        let (conn, _rx) = h.registry.register();

        for _ in 0..2 {
            dispatch(
                ClientEvent::Join { user_id: user("alice") },
                &conn,
                &h.registry,
                &h.presence,
                &h.router,
            )
            .await;
        }

        assert_eq!(h.presence.online_count(), 1);
    }

    #[tokio::test]
    async fn send_message_produces_fanout() {
        let h = harness();
        let (sender_conn, _rx1) = h.registry.register();
        let (recipient_conn, _rx2) = h.registry.register();
        h.presence.register(&user("alice"), &sender_conn);
        h.presence.register(&user("bob"), &recipient_conn);

        let deliveries = dispatch(
            ClientEvent::SendMessage {
                sender_id: user("alice"),
                recipient_id: user("bob"),
                content: "hi".into(),
            },
            &sender_conn,
            &h.registry,
            &h.presence,
            &h.router,
        )
        .await;

        assert_eq!(deliveries.len(), 2);
        let targets: Vec<_> = deliveries.iter().map(|d| d.target.clone()).collect();
        assert!(targets.contains(&recipient_conn));
        assert!(targets.contains(&sender_conn));
    }

    #[tokio::test]
    async fn join_dashboard_adds_group_membership() {
        let h = harness();
        let (conn, mut rx) = h.registry.register();

        let deliveries = dispatch(
            ClientEvent::JoinDashboard,
            &conn,
            &h.registry,
            &h.presence,
            &h.router,
        )
        .await;
        assert!(deliveries.is_empty());

        h.registry.broadcast_to_group(DASHBOARD_GROUP, "ping");
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn notification_dispatch_targets_online_user() {
        let h = harness();
        let (sender_conn, _rx1) = h.registry.register();
        let (target_conn, _rx2) = h.registry.register();
        h.presence.register(&user("bob"), &target_conn);

        let deliveries = dispatch(
            ClientEvent::SendNotification {
                user_id: user("bob"),
                notification: serde_json::json!({"kind": "idea_approved"}),
            },
            &sender_conn,
            &h.registry,
            &h.presence,
            &h.router,
        )
        .await;

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].target, target_conn);
    }
}
