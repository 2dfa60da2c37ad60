use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use parley_types::models::{Attachment, DELETED_PLACEHOLDER, Message, MessageDraft, MessageKind};

use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult, within};
use crate::handle::CancelHandle;
use crate::notify::{Notification, NotificationDispatcher};
use crate::store::{ChatStore, blocking};
use crate::sync::{MessageSnapshot, SyncSubscriptionManager};
use crate::txn::read_modify_write;

/// Canonical per-group message log.
///
/// Mutations run under `ChatConfig::mutation_timeout`; wrap a call in
/// [`within`] for a tighter per-call deadline.
pub struct MessageStore<S> {
    store: Arc<S>,
    sync: SyncSubscriptionManager<S>,
    notifier: Arc<dyn NotificationDispatcher>,
    config: Arc<ChatConfig>,
}

impl<S> Clone for MessageStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            sync: self.sync.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: ChatStore> MessageStore<S> {
    pub fn new(
        store: Arc<S>,
        sync: SyncSubscriptionManager<S>,
        notifier: Arc<dyn NotificationDispatcher>,
        config: Arc<ChatConfig>,
    ) -> Self {
        Self {
            store,
            sync,
            notifier,
            config,
        }
    }

    /// Append a message. The store assigns id and `created_at`; on success
    /// the notification dispatcher is told about it.
    pub async fn append(&self, draft: MessageDraft) -> ChatResult<Message> {
        within(self.config.mutation_timeout, self.append_now(draft)).await
    }

    async fn append_now(&self, draft: MessageDraft) -> ChatResult<Message> {
        validate_body(draft.kind, &draft.body, self.config.max_body_chars)?;
        validate_attachment(draft.kind, draft.attachment.as_ref())?;

        let message = blocking(&self.store, move |s| s.insert_message(&draft)).await?;
        info!(
            "Message {} ({}) appended to group {} by {}",
            message.id,
            message.kind.as_str(),
            message.group_id,
            message.author_id
        );

        self.notifier.notify(Notification::for_message(&message));
        Ok(message)
    }

    /// Replace the body of a message. Only its author may do so, and never
    /// once it has been deleted.
    pub async fn edit(
        &self,
        group_id: Uuid,
        message_id: Uuid,
        new_body: &str,
        requesting_user: Uuid,
    ) -> ChatResult<Message> {
        if new_body.chars().count() > self.config.max_body_chars {
            return Err(too_long(self.config.max_body_chars));
        }
        let new_body = new_body.to_string();
        let max_chars = self.config.max_body_chars;

        let edit = read_modify_write(
            &self.store,
            group_id,
            message_id,
            self.config.write_attempts,
            move |current, now| {
                check_author_may_change(current, requesting_user)?;
                validate_body(current.kind, &new_body, max_chars)?;

                let mut next = current.clone();
                next.body = new_body.clone();
                next.edited_at = Some(now);
                Ok((next.clone(), next))
            },
        );
        let message = within(self.config.mutation_timeout, edit).await?;

        debug!("Message {} edited in group {}", message_id, group_id);
        Ok(message)
    }

    /// Soft-delete: the record stays, its content is replaced by a fixed
    /// placeholder. Deleting twice is an error, not a no-op.
    pub async fn delete(&self, group_id: Uuid, message_id: Uuid, requesting_user: Uuid) -> ChatResult<()> {
        let delete = read_modify_write(
            &self.store,
            group_id,
            message_id,
            self.config.write_attempts,
            move |current, now| {
                check_author_may_change(current, requesting_user)?;

                let mut next = current.clone();
                next.deleted = true;
                next.deleted_at = Some(now);
                next.body = DELETED_PLACEHOLDER.to_string();
                next.attachment = None;
                next.reactions.clear();
                Ok((next, ()))
            },
        );
        within(self.config.mutation_timeout, delete).await?;

        info!("Message {} deleted from group {}", message_id, group_id);
        Ok(())
    }

    /// Live, ascending window of the most recent messages. See
    /// [`SyncSubscriptionManager::subscribe`].
    pub fn subscribe<F>(&self, group_id: Uuid, on_snapshot: F) -> CancelHandle
    where
        F: Fn(Result<&MessageSnapshot, &ChatError>) + Send + Sync + 'static,
    {
        self.sync.subscribe(group_id, on_snapshot)
    }

    /// One-shot read of the current window.
    pub async fn recent(&self, group_id: Uuid) -> ChatResult<MessageSnapshot> {
        self.sync.load(group_id).await
    }
}

fn check_author_may_change(current: &Message, requesting_user: Uuid) -> ChatResult<()> {
    if current.deleted {
        return Err(ChatError::AlreadyDeleted);
    }
    if current.author_id != requesting_user {
        return Err(ChatError::NotAuthorized);
    }
    Ok(())
}

fn too_long(max_chars: usize) -> ChatError {
    ChatError::validation(format!("message body exceeds {max_chars} characters"))
}

fn validate_body(kind: MessageKind, body: &str, max_chars: usize) -> ChatResult<()> {
    if body.chars().count() > max_chars {
        return Err(too_long(max_chars));
    }
    if kind == MessageKind::Text && body.trim().is_empty() {
        return Err(ChatError::validation("message body is empty"));
    }
    Ok(())
}

fn validate_attachment(kind: MessageKind, attachment: Option<&Attachment>) -> ChatResult<()> {
    match (kind, attachment) {
        (MessageKind::Text, None) => Ok(()),
        (MessageKind::Text, Some(_)) => Err(ChatError::validation("text messages cannot carry an attachment")),
        (kind, None) => Err(ChatError::validation(format!(
            "{} messages require an attachment",
            kind.as_str()
        ))),
        (kind, Some(a)) if a.kind() != kind => Err(ChatError::validation(format!(
            "{} attachment on a {} message",
            a.kind().as_str(),
            kind.as_str()
        ))),
        (_, Some(Attachment::Image { url })) => {
            if url.trim().is_empty() {
                return Err(ChatError::validation("image reference is empty"));
            }
            Ok(())
        }
        (_, Some(Attachment::Location { latitude, longitude })) => {
            let valid = latitude.is_finite()
                && longitude.is_finite()
                && (-90.0..=90.0).contains(latitude)
                && (-180.0..=180.0).contains(longitude);
            if !valid {
                return Err(ChatError::validation("location coordinates out of range"));
            }
            Ok(())
        }
    }
}
