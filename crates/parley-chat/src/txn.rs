use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::models::Message;

use crate::error::{ChatError, ChatResult};
use crate::store::{ChatStore, blocking};

/// Optimistic read-modify-write on a single message document.
///
/// Reads the current version, lets `mutate` compute the next state, then
/// writes it conditionally on the version still matching. A lost race is
/// retried from a fresh read, up to `max_attempts` in total. Errors returned
/// by `mutate` abort immediately and are never retried.
pub(crate) async fn read_modify_write<S, T, F>(
    store: &Arc<S>,
    group_id: Uuid,
    message_id: Uuid,
    max_attempts: u32,
    mut mutate: F,
) -> ChatResult<T>
where
    S: ChatStore,
    F: FnMut(&Message, DateTime<Utc>) -> ChatResult<(Message, T)>,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let current = blocking(store, move |s| s.get_message(group_id, message_id))
            .await?
            .ok_or(ChatError::NotFound)?;

        let (next, out) = mutate(&current.value, store.now())?;
        let expected = current.version;
        let committed = blocking(store, move |s| s.replace_message(&next, expected)).await?;

        if committed {
            if attempt > 1 {
                debug!("Message {} committed on attempt {}", message_id, attempt);
            }
            return Ok(out);
        }

        debug!(
            "Write conflict on message {} (attempt {}/{})",
            message_id, attempt, max_attempts
        );
        if attempt < max_attempts {
            let jitter_ms = rand::rng().random_range(1..=5u64) * u64::from(attempt);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        }
    }

    warn!(
        "Giving up on message {} after {} conflicting attempts",
        message_id, max_attempts
    );
    Err(ChatError::TransientConflict {
        attempts: max_attempts,
    })
}
