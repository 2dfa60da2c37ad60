use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use parley_chat::ChatError;
use parley_types::api::ErrorResponse;

/// A chat-core failure on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::NotAuthorized => StatusCode::FORBIDDEN,
            ChatError::AlreadyDeleted | ChatError::TransientConflict { .. } => StatusCode::CONFLICT,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NetworkUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ChatError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Storage details stay in the log.
        let message = if status.is_server_error() && !self.0.is_retryable() {
            error!("Request failed: {:#}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        let body = ErrorResponse {
            error: self.0.kind(),
            message,
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn maps_each_error_to_its_status() {
        let cases = [
            (ChatError::NotFound, StatusCode::NOT_FOUND),
            (ChatError::NotAuthorized, StatusCode::FORBIDDEN),
            (ChatError::AlreadyDeleted, StatusCode::CONFLICT),
            (ChatError::TransientConflict { attempts: 5 }, StatusCode::CONFLICT),
            (ChatError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ChatError::NetworkUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (ChatError::Timeout(Duration::from_secs(1)), StatusCode::GATEWAY_TIMEOUT),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
