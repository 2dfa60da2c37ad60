use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

use parley_types::api::{Claims, ToggleReactionRequest};

use crate::auth::AppState;
use crate::error::ApiError;

/// Returns the emoji's aggregate after the toggle; `count == 0` means the
/// caller's vote was the last one and the reaction is gone.
pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path((group_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let aggregate = state
        .chat
        .reactions()
        .toggle(group_id, message_id, &req.emoji, claims.sub)
        .await?;

    Ok(Json(aggregate))
}
