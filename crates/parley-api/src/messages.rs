use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parley_types::api::{Claims, EditMessageRequest, MessageListResponse, SendMessageRequest};
use parley_types::models::MessageDraft;

use crate::auth::AppState;
use crate::error::ApiError;

/// Any authenticated user may post to any group; membership lives with the
/// identity provider.
pub async fn send_message(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let draft = MessageDraft {
        group_id,
        author: claims.identity(),
        kind: req.kind,
        body: req.body,
        attachment: req.attachment,
        reply_to_id: req.reply_to_id,
    };

    let message = state.chat.messages().append(draft).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// The current live window, oldest first.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.chat.messages().recent(group_id).await?;

    Ok(Json(MessageListResponse {
        group_id,
        messages: snapshot.messages,
    }))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path((group_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .chat
        .messages()
        .edit(group_id, message_id, &req.body, claims.sub)
        .await?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path((group_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .chat
        .messages()
        .delete(group_id, message_id, claims.sub)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
