use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use linkup_core::ids::{ConversationId, UserId};
use linkup_core::messages::ChatRole;
use linkup_store::StoreError;

use crate::server::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    pub owner_id: String,
    pub title: Option<String>,
}

#[derive(Deserialize)]
pub struct PostMessageBody {
    pub content: String,
}

#[derive(Deserialize)]
pub struct AiRequestBody {
    pub prompt: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    pub owner_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertUserBody {
    pub full_name: String,
    pub role: String,
    pub location: Option<String>,
}

fn store_error(e: StoreError) -> Response {
    let status = match &e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

/// GET /api/chat/conversations?ownerId=...
pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> Response {
    let owner = UserId::from_raw(query.owner_id);
    match state.conversations.list_for_owner(&owner, 100, 0) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /api/chat/conversations
pub async fn create_conversation(
    State(state): State<AppState>,
    Json(body): Json<CreateConversationBody>,
) -> Response {
    let owner = UserId::from_raw(body.owner_id);
    match state.conversations.create(&owner, body.title.as_deref()) {
        Ok(row) => {
            state.publish_snapshot();
            (StatusCode::CREATED, Json(row)).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// GET /api/chat/conversations/{id}
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.conversations.get(&ConversationId::from_raw(id)) {
        Ok(row) => Json(row).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /api/chat/conversations/{id}/messages
pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let conversation_id = ConversationId::from_raw(id);
    // Distinguish an unknown conversation from an empty one
    if let Err(e) = state.conversations.get(&conversation_id) {
        return store_error(e);
    }
    match state.conversations.list_messages(&conversation_id) {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /api/chat/conversations/{id}/message — append a user turn.
pub async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PostMessageBody>,
) -> Response {
    let conversation_id = ConversationId::from_raw(id);
    match state
        .conversations
        .append_message(&conversation_id, ChatRole::User, &body.content)
    {
        Ok(message) => {
            state.publish_snapshot();
            (StatusCode::CREATED, Json(message)).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// POST /api/chat/conversations/{id}/ai — stream an AI reply.
///
/// The response is `text/event-stream`: one `data:` frame per token,
/// terminated by `data: [END]` (or `data: [ERROR]` on upstream failure).
pub async fn ai_reply(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AiRequestBody>,
) -> Response {
    let conversation_id = ConversationId::from_raw(id);
    match state.bridge.stream_reply(conversation_id, body.prompt) {
        Ok(reply) => {
            let stream = ReceiverStream::new(reply.frames)
                .map(|frame| Ok::<_, Infallible>(Event::default().data(frame)));
            Sse::new(stream).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// PUT /api/users/{id} — upsert a directory entry. Signup and profile
/// management live outside this service; they sync the read model here.
pub async fn upsert_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpsertUserBody>,
) -> Response {
    let user_id = UserId::from_raw(id);
    match state.directory.upsert(
        &user_id,
        &body.full_name,
        &body.role,
        body.location.as_deref(),
    ) {
        Ok(row) => {
            state.publish_snapshot();
            Json(row).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// GET /api/users/{id}/status — resolve a user id to online status.
pub async fn user_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let user_id = UserId::from_raw(id);
    match state.directory.get(&user_id) {
        Ok(user) => {
            let online = state.presence.is_online(&user_id);
            Json(json!({
                "userId": user.id,
                "fullName": user.full_name,
                "role": user.role,
                "online": online,
            }))
            .into_response()
        }
        Err(e) => store_error(e),
    }
}

/// GET /api/dashboard — the same aggregate snapshot the broadcast pushes,
/// for dashboards that load before subscribing.
pub async fn dashboard_snapshot(State(state): State<AppState>) -> Json<Value> {
    Json(state.activity_snapshot())
}
