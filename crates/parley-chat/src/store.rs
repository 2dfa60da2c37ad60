use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::error;
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::StoreChange;
use parley_types::models::{Message, MessageDraft, TypingPresence, Versioned};

use crate::error::{ChatError, ChatResult};

/// What the chat core needs from the document store.
///
/// Methods are blocking; the core runs them on the blocking pool. The
/// atomic read-modify-write capability is expressed as a versioned read
/// (`get_message`) plus a conditional write (`replace_message`).
pub trait ChatStore: Send + Sync + 'static {
    /// Server-side clock used for store-assigned timestamps.
    fn now(&self) -> DateTime<Utc>;

    /// Live change feed across all groups.
    fn watch(&self) -> broadcast::Receiver<StoreChange>;

    fn insert_message(&self, draft: &MessageDraft) -> Result<Message>;

    fn get_message(&self, group_id: Uuid, message_id: Uuid) -> Result<Option<Versioned<Message>>>;

    /// Write `message` only if the stored copy is still at `expected_version`.
    fn replace_message(&self, message: &Message, expected_version: i64) -> Result<bool>;

    /// Newest first.
    fn recent_messages(&self, group_id: Uuid, limit: usize) -> Result<Vec<Message>>;

    fn upsert_presence(&self, group_id: Uuid, user_id: Uuid, display_name: &str) -> Result<TypingPresence>;

    fn delete_presence(&self, group_id: Uuid, user_id: Uuid) -> Result<bool>;

    fn list_presence(&self, group_id: Uuid) -> Result<Vec<TypingPresence>>;

    fn prune_presence(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

impl ChatStore for Database {
    fn now(&self) -> DateTime<Utc> {
        Database::now(self)
    }

    fn watch(&self) -> broadcast::Receiver<StoreChange> {
        Database::watch(self)
    }

    fn insert_message(&self, draft: &MessageDraft) -> Result<Message> {
        Database::insert_message(self, draft)
    }

    fn get_message(&self, group_id: Uuid, message_id: Uuid) -> Result<Option<Versioned<Message>>> {
        Database::get_message(self, group_id, message_id)
    }

    fn replace_message(&self, message: &Message, expected_version: i64) -> Result<bool> {
        Database::replace_message(self, message, expected_version)
    }

    fn recent_messages(&self, group_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        Database::recent_messages(self, group_id, limit)
    }

    fn upsert_presence(&self, group_id: Uuid, user_id: Uuid, display_name: &str) -> Result<TypingPresence> {
        Database::upsert_presence(self, group_id, user_id, display_name)
    }

    fn delete_presence(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        Database::delete_presence(self, group_id, user_id)
    }

    fn list_presence(&self, group_id: Uuid) -> Result<Vec<TypingPresence>> {
        Database::list_presence(self, group_id)
    }

    fn prune_presence(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        Database::prune_presence(self, cutoff)
    }
}

/// Run a blocking store call off the async runtime.
pub(crate) async fn blocking<S, T, F>(store: &Arc<S>, f: F) -> ChatResult<T>
where
    S: ChatStore,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&*store))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ChatError::Store(anyhow!("storage task failed: {}", e))
        })?
        .map_err(ChatError::from)
}
