use std::time::Duration;

use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message or group not found")]
    NotFound,

    #[error("only the author may change this message")]
    NotAuthorized,

    #[error("message has been deleted")]
    AlreadyDeleted,

    #[error("write conflict persisted after {attempts} attempts")]
    TransientConflict { attempts: u32 },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("subscription could not attach: {0}")]
    NetworkUnavailable(String),

    #[error("operation did not complete within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ChatError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the same call may succeed if simply tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientConflict { .. } | Self::Timeout(_) | Self::NetworkUnavailable(_)
        )
    }

    /// Stable machine-readable name, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::NotAuthorized => "not_authorized",
            Self::AlreadyDeleted => "already_deleted",
            Self::TransientConflict { .. } => "transient_conflict",
            Self::Validation(_) => "validation_error",
            Self::NetworkUnavailable(_) => "network_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Store(_) => "internal",
        }
    }
}

/// Run a mutation under a deadline. Expiry surfaces as the retryable
/// [`ChatError::Timeout`]; dropping the returned future cancels the call.
///
/// Every mutation already runs under `ChatConfig::mutation_timeout`; callers
/// that need a tighter per-call deadline wrap the call in this.
pub async fn within<T, F>(limit: Duration, fut: F) -> ChatResult<T>
where
    F: std::future::Future<Output = ChatResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ChatError::Timeout(limit)),
    }
}
