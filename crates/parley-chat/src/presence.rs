use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::events::StoreChange;
use parley_types::models::{TypingPresence, TypingUser};

use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult, within};
use crate::handle::CancelHandle;
use crate::store::{ChatStore, blocking};

/// Per-group ephemeral typing registry.
///
/// Entries expire by age alone: a reader never reports an entry whose last
/// signal is `typing_ttl` or more in the past, whether or not a stop signal
/// or removal event was ever seen.
pub struct PresenceTracker<S> {
    store: Arc<S>,
    config: Arc<ChatConfig>,
}

impl<S> Clone for PresenceTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: ChatStore> PresenceTracker<S> {
    pub fn new(store: Arc<S>, config: Arc<ChatConfig>) -> Self {
        Self { store, config }
    }

    /// `is_typing = true` refreshes the caller's entry; `false` removes it
    /// straight away. Only the user themselves should signal for their id.
    pub async fn signal(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        display_name: &str,
        is_typing: bool,
    ) -> ChatResult<()> {
        let display_name = display_name.to_string();
        let store = &self.store;
        let write = async move {
            if is_typing {
                blocking(store, move |s| s.upsert_presence(group_id, user_id, &display_name)).await?;
            } else {
                blocking(store, move |s| s.delete_presence(group_id, user_id)).await?;
            }
            Ok::<(), ChatError>(())
        };
        within(self.config.mutation_timeout, write).await
    }

    /// Who is typing right now, excluding `excluding_user`.
    pub async fn typing_users(&self, group_id: Uuid, excluding_user: Uuid) -> ChatResult<Vec<TypingUser>> {
        let entries = blocking(&self.store, move |s| s.list_presence(group_id)).await?;
        Ok(active_typists(&entries, self.store.now(), self.ttl(), excluding_user))
    }

    /// Observe who is typing. Delivers the current list straight away, then
    /// again whenever it changes. Staleness is re-checked on every presence
    /// event for the group and on a local timer, so expired entries drop out
    /// even if the store never pushes anything else.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, group_id: Uuid, excluding_user: Uuid, on_change: F) -> CancelHandle
    where
        F: Fn(Result<&[TypingUser], &ChatError>) + Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        tokio::spawn(run_presence_feed(
            self.clone(),
            group_id,
            excluding_user,
            token.clone(),
            on_change,
        ));

        CancelHandle::new(token, move || {
            debug!("Presence subscription for group {} cancelled", group_id);
        })
    }

    /// Remove entries that are already stale. Readers never depend on this;
    /// it only keeps the collection small.
    pub async fn prune_stale(&self) -> ChatResult<usize> {
        let cutoff = self.store.now() - self.ttl();
        let removed = blocking(&self.store, move |s| s.prune_presence(cutoff)).await?;
        if removed > 0 {
            info!("Pruned {} stale typing entries", removed);
        }
        Ok(removed)
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.typing_ttl).unwrap_or_else(|_| chrono::Duration::days(1))
    }
}

/// Entries younger than `ttl` at `now`, minus `excluding_user`, in a stable
/// order (display name, then id).
pub fn active_typists(
    entries: &[TypingPresence],
    now: DateTime<Utc>,
    ttl: chrono::Duration,
    excluding_user: Uuid,
) -> Vec<TypingUser> {
    let mut users: Vec<TypingUser> = entries
        .iter()
        .filter(|p| p.user_id != excluding_user)
        .filter(|p| now - p.last_signal_at < ttl)
        .map(TypingUser::from)
        .collect();
    users.sort_by(|a, b| {
        a.display_name
            .cmp(&b.display_name)
            .then(a.user_id.cmp(&b.user_id))
    });
    users
}

async fn run_presence_feed<S, F>(
    tracker: PresenceTracker<S>,
    group_id: Uuid,
    excluding_user: Uuid,
    token: CancellationToken,
    on_change: F,
) where
    S: ChatStore,
    F: Fn(Result<&[TypingUser], &ChatError>) + Send + Sync + 'static,
{
    let mut changes = tracker.store.watch();
    let mut recheck = tokio::time::interval(tracker.config.presence_recheck);
    recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let max_failures = tracker.config.subscribe_attempts.max(1);
    let mut failures = 0u32;
    let mut last: Option<Vec<TypingUser>> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = recheck.tick() => {}
            change = changes.recv() => match change {
                Ok(StoreChange::Presence { group_id: changed }) if changed == group_id => {}
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }

        match tracker.typing_users(group_id, excluding_user).await {
            Ok(users) => {
                failures = 0;
                if last.as_ref() == Some(&users) || token.is_cancelled() {
                    continue;
                }
                on_change(Ok(users.as_slice()));
                last = Some(users);
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "Presence read for group {} failed ({}/{}): {}",
                    group_id, failures, max_failures, e
                );
                if failures == max_failures && !token.is_cancelled() {
                    let err = ChatError::NetworkUnavailable(e.to_string());
                    on_change(Err(&err));
                    // Force a fresh delivery once reads recover.
                    last = None;
                }
            }
        }
    }

    debug!("Presence listener for group {} stopped", group_id);
}
