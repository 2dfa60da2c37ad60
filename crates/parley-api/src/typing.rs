use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parley_types::api::{Claims, TypingRequest};

use crate::auth::AppState;
use crate::error::ApiError;

/// Callers signal only for themselves; the user id comes from the token.
pub async fn set_typing(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<TypingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .chat
        .presence()
        .signal(group_id, claims.sub, &claims.username, req.is_typing)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
