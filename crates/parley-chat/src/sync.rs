use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use parley_types::events::StoreChange;
use parley_types::models::Message;

use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::handle::CancelHandle;
use crate::store::{ChatStore, blocking};

/// Ordered view of a group's most recent messages, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSnapshot {
    pub group_id: Uuid,
    /// Bumped for every distinct snapshot a group feed produces.
    pub seq: u64,
    pub messages: Vec<Message>,
}

impl MessageSnapshot {
    pub fn empty(group_id: Uuid) -> Self {
        Self {
            group_id,
            seq: 0,
            messages: Vec::new(),
        }
    }

    /// Build from a newest-first store read: sorts ascending by
    /// `(created_at, id)`, drops duplicate ids and keeps the last `window`.
    pub fn from_recent(group_id: Uuid, seq: u64, recent: Vec<Message>, window: usize) -> Self {
        Self {
            group_id,
            seq,
            messages: normalize(recent, window),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn get(&self, message_id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    /// Best-effort lookup of the message `message` replies to. `None` when it
    /// has no reply target or the target left the live window.
    pub fn reply_target(&self, message: &Message) -> Option<&Message> {
        message.reply_to_id.and_then(|id| self.get(id))
    }
}

fn normalize(mut messages: Vec<Message>, window: usize) -> Vec<Message> {
    messages.sort_by_key(|m| m.order_key());
    messages.dedup_by_key(|m| m.id);
    if messages.len() > window {
        messages.drain(..messages.len() - window);
    }
    messages
}

type SnapshotCallback = Box<dyn Fn(Result<&MessageSnapshot, &ChatError>) + Send + Sync>;

struct Observer {
    token: CancellationToken,
    /// Highest seq handed to the callback. Held while the callback runs so a
    /// single observer never sees deliveries interleave or go backwards.
    delivered: Mutex<Option<u64>>,
    callback: SnapshotCallback,
}

impl Observer {
    fn deliver(&self, snapshot: &MessageSnapshot) {
        let mut delivered = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
        if self.token.is_cancelled() || delivered.is_some_and(|seq| seq >= snapshot.seq) {
            return;
        }
        *delivered = Some(snapshot.seq);
        (self.callback)(Ok(snapshot));
    }

    fn fail(&self, err: &ChatError) {
        let _delivered = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
        if !self.token.is_cancelled() {
            (self.callback)(Err(err));
        }
    }
}

/// One shared store listener per group, ref-counted by its observers.
struct GroupFeed {
    id: u64,
    token: CancellationToken,
    observers: HashMap<u64, Arc<Observer>>,
    latest: Option<Arc<MessageSnapshot>>,
}

struct SyncInner<S> {
    store: Arc<S>,
    config: Arc<ChatConfig>,
    feeds: Mutex<HashMap<Uuid, GroupFeed>>,
    next_id: AtomicU64,
}

/// Turns raw store change events into deduplicated, ordered snapshots and
/// fans them out to local observers.
///
/// Observers of the same group share a single underlying listener; it is
/// attached on the first `subscribe` and released when the last handle is
/// cancelled.
pub struct SyncSubscriptionManager<S> {
    inner: Arc<SyncInner<S>>,
}

impl<S> Clone for SyncSubscriptionManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: ChatStore> SyncSubscriptionManager<S> {
    pub fn new(store: Arc<S>, config: Arc<ChatConfig>) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                store,
                config,
                feeds: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Observe a group's live window. The callback first receives the
    /// current snapshot (possibly empty), then one call per distinct change.
    /// `Err` is delivered once when the store stays unreachable after the
    /// configured attempts; the feed keeps retrying on a backoff timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, group_id: Uuid, on_snapshot: F) -> CancelHandle
    where
        F: Fn(Result<&MessageSnapshot, &ChatError>) + Send + Sync + 'static,
    {
        let observer_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let observer = Arc::new(Observer {
            token: token.clone(),
            delivered: Mutex::new(None),
            callback: Box::new(on_snapshot),
        });

        let (latest, attach) = {
            let mut feeds = self.inner.lock_feeds();
            let feed = feeds.entry(group_id).or_insert_with(|| GroupFeed {
                id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                token: CancellationToken::new(),
                observers: HashMap::new(),
                latest: None,
            });
            let attach = feed.observers.is_empty().then(|| (feed.id, feed.token.clone()));
            feed.observers.insert(observer_id, observer.clone());
            (feed.latest.clone(), attach)
        };

        if let Some((feed_id, feed_token)) = attach {
            debug!("Attaching listener for group {}", group_id);
            tokio::spawn(run_feed(self.inner.clone(), group_id, feed_id, feed_token));
        }

        if let Some(snapshot) = latest {
            observer.deliver(&snapshot);
        }

        let weak: Weak<SyncInner<S>> = Arc::downgrade(&self.inner);
        CancelHandle::new(token, move || {
            if let Some(inner) = weak.upgrade() {
                inner.release(group_id, observer_id);
            }
        })
    }

    /// Most recent snapshot of an attached group feed.
    pub fn latest(&self, group_id: Uuid) -> Option<Arc<MessageSnapshot>> {
        self.inner
            .lock_feeds()
            .get(&group_id)
            .and_then(|feed| feed.latest.clone())
    }

    /// Number of live observers sharing the group's listener.
    pub fn observer_count(&self, group_id: Uuid) -> usize {
        self.inner
            .lock_feeds()
            .get(&group_id)
            .map_or(0, |feed| feed.observers.len())
    }

    /// One-shot read of the current window, bypassing the live feeds.
    pub async fn load(&self, group_id: Uuid) -> ChatResult<MessageSnapshot> {
        let window = self.inner.config.history_window;
        let recent = blocking(&self.inner.store, move |s| s.recent_messages(group_id, window)).await?;
        Ok(MessageSnapshot::from_recent(group_id, 0, recent, window))
    }
}

impl<S> SyncInner<S> {
    fn lock_feeds(&self) -> MutexGuard<'_, HashMap<Uuid, GroupFeed>> {
        self.feeds.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, group_id: Uuid, observer_id: u64) {
        let mut feeds = self.lock_feeds();
        let Some(feed) = feeds.get_mut(&group_id) else {
            return;
        };
        feed.observers.remove(&observer_id);
        if feed.observers.is_empty() {
            feed.token.cancel();
            feeds.remove(&group_id);
            debug!("Released listener for group {}", group_id);
        }
    }

    /// Observers of the feed `feed_id`, or `None` if that feed was released
    /// (a newer feed for the same group may exist).
    fn observers_of(&self, group_id: Uuid, feed_id: u64) -> Option<Vec<Arc<Observer>>> {
        self.lock_feeds()
            .get(&group_id)
            .filter(|feed| feed.id == feed_id)
            .map(|feed| feed.observers.values().cloned().collect())
    }

    fn publish(&self, group_id: Uuid, feed_id: u64, snapshot: &Arc<MessageSnapshot>) {
        let observers = {
            let mut feeds = self.lock_feeds();
            match feeds.get_mut(&group_id) {
                Some(feed) if feed.id == feed_id => {
                    feed.latest = Some(snapshot.clone());
                    feed.observers.values().cloned().collect::<Vec<_>>()
                }
                _ => return,
            }
        };

        trace!(
            "Delivering snapshot {} for group {} to {} observers",
            snapshot.seq,
            group_id,
            observers.len()
        );
        for observer in observers {
            observer.deliver(snapshot);
        }
    }
}

async fn run_feed<S: ChatStore>(
    inner: Arc<SyncInner<S>>,
    group_id: Uuid,
    feed_id: u64,
    token: CancellationToken,
) {
    // Watch before the first load so no change slips in between.
    let mut changes = inner.store.watch();
    let mut latest: Option<Arc<MessageSnapshot>> = None;
    let mut dirty = true;
    // Set after a reported failure so recovery is delivered even if unchanged.
    let mut failed = false;
    // Timer-driven reloads since the failure; no store change is needed to recover.
    let mut retries = 0u32;

    loop {
        if dirty {
            dirty = false;
            match load_with_backoff(&inner, group_id, &token).await {
                Some(Ok(messages)) => {
                    if !failed && latest.as_ref().is_some_and(|prev| prev.messages == messages) {
                        trace!("Skipping unchanged snapshot for group {}", group_id);
                    } else {
                        let seq = latest.as_ref().map_or(1, |prev| prev.seq + 1);
                        let snapshot = Arc::new(MessageSnapshot {
                            group_id,
                            seq,
                            messages,
                        });
                        inner.publish(group_id, feed_id, &snapshot);
                        latest = Some(snapshot);
                    }
                    failed = false;
                    retries = 0;
                }
                Some(Err(err)) if failed => {
                    debug!("Group {} still unavailable after {} retries: {}", group_id, retries, err);
                }
                Some(Err(err)) => {
                    warn!("Group {} subscription unavailable: {}", group_id, err);
                    for observer in inner.observers_of(group_id, feed_id).unwrap_or_default() {
                        observer.fail(&err);
                    }
                    failed = true;
                }
                None => break,
            }
        }

        let retry_in = inner.config.backoff_for(retries.saturating_add(1));
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(retry_in), if failed => {
                retries = retries.saturating_add(1);
                dirty = true;
            }
            change = changes.recv() => match change {
                Ok(StoreChange::Messages { group_id: changed }) if changed == group_id => dirty = true,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!("Change feed for group {} lagged by {} events, reloading", group_id, n);
                    dirty = true;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    debug!("Listener for group {} stopped", group_id);
}

/// `None` means the feed was cancelled while waiting.
async fn load_with_backoff<S: ChatStore>(
    inner: &Arc<SyncInner<S>>,
    group_id: Uuid,
    token: &CancellationToken,
) -> Option<ChatResult<Vec<Message>>> {
    let attempts = inner.config.subscribe_attempts.max(1);
    let window = inner.config.history_window;
    let mut last_err = String::new();

    for attempt in 1..=attempts {
        match blocking(&inner.store, move |s| s.recent_messages(group_id, window)).await {
            Ok(recent) => return Some(Ok(normalize(recent, window))),
            Err(e) => {
                warn!(
                    "Snapshot load for group {} failed (attempt {}/{}): {}",
                    group_id, attempt, attempts, e
                );
                last_err = e.to_string();
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(inner.config.backoff_for(attempt)) => {}
            }
        }
    }

    Some(Err(ChatError::NetworkUnavailable(last_err)))
}
