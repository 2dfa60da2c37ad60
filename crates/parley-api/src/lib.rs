//! REST surface over the chat core.

pub mod auth;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod reactions;
pub mod typing;

use axum::{
    Router,
    routing::{get, patch, post},
};

use crate::auth::AppState;
use crate::middleware::require_auth;

/// Authenticated group routes. The gateway route is mounted by the server.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/groups/{group_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/groups/{group_id}/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route(
            "/groups/{group_id}/messages/{message_id}/reactions",
            post(reactions::toggle_reaction),
        )
        .route("/groups/{group_id}/typing", post(typing::set_typing))
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}
