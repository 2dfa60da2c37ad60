use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use parley_db::Database;
use parley_types::clock::ManualClock;
use parley_types::events::StoreChange;
use parley_types::models::{Identity, Message, MessageDraft, MessageKind, TypingPresence, Versioned};

use crate::config::ChatConfig;
use crate::notify::{Notification, NotificationDispatcher};
use crate::service::ChatService;
use crate::store::ChatStore;

pub fn test_db() -> (Arc<Database>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let db = Database::open_in_memory().unwrap().with_clock(clock.clone());
    (Arc::new(db), clock)
}

/// Short timers so subscription tests finish quickly.
pub fn fast_config() -> ChatConfig {
    ChatConfig {
        presence_recheck: Duration::from_millis(20),
        subscribe_attempts: 3,
        subscribe_backoff: Duration::from_millis(1),
        subscribe_backoff_max: Duration::from_millis(5),
        ..ChatConfig::default()
    }
}

pub fn identity(name: &str) -> Identity {
    Identity {
        user_id: Uuid::new_v4(),
        display_name: name.to_string(),
        avatar: None,
    }
}

pub fn text_draft(group_id: Uuid, author: &Identity, body: &str) -> MessageDraft {
    MessageDraft {
        group_id,
        author: author.clone(),
        kind: MessageKind::Text,
        body: body.to_string(),
        attachment: None,
        reply_to_id: None,
    }
}

/// A stored-looking text message `minute_offset` minutes after a fixed base time.
pub fn message_fixture(group_id: Uuid, author: &Identity, body: &str, minute_offset: i64) -> Message {
    let base = DateTime::<Utc>::from_timestamp(1_767_268_800, 0).unwrap();
    Message {
        id: Uuid::new_v4(),
        group_id,
        author_id: author.user_id,
        author_name: author.display_name.clone(),
        author_avatar: author.avatar.clone(),
        kind: MessageKind::Text,
        body: body.to_string(),
        attachment: None,
        created_at: base + chrono::Duration::minutes(minute_offset),
        edited_at: None,
        reply_to_id: None,
        reactions: Default::default(),
        deleted: false,
        deleted_at: None,
    }
}

/// Next value from a test channel, failing the test after two seconds.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery channel closed")
}

#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.seen.lock().unwrap())
    }
}

impl NotificationDispatcher for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().unwrap().push(notification);
    }
}

pub fn test_service() -> (
    ChatService<Database>,
    Arc<Database>,
    Arc<ManualClock>,
    Arc<RecordingNotifier>,
) {
    let (db, clock) = test_db();
    let notes = Arc::new(RecordingNotifier::default());
    let chat = ChatService::new(db.clone(), notes.clone(), fast_config());
    (chat, db, clock, notes)
}

type ReplaceHook = Box<dyn FnOnce(&Database) + Send>;

/// A real database with knobs for injecting read failures and write conflicts.
pub struct FaultyStore {
    db: Database,
    fail_reads: AtomicBool,
    recent_calls: AtomicU32,
    replace_calls: AtomicU32,
    conflicts: AtomicU32,
    before_replace: Mutex<Option<ReplaceHook>>,
}

pub fn faulty_store() -> (Arc<FaultyStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let db = Database::open_in_memory().unwrap().with_clock(clock.clone());
    let store = FaultyStore {
        db,
        fail_reads: AtomicBool::new(false),
        recent_calls: AtomicU32::new(0),
        replace_calls: AtomicU32::new(0),
        conflicts: AtomicU32::new(0),
        before_replace: Mutex::new(None),
    };
    (Arc::new(store), clock)
}

pub fn service_over(store: Arc<FaultyStore>) -> ChatService<FaultyStore> {
    ChatService::new(store, Arc::new(RecordingNotifier::default()), fast_config())
}

impl FaultyStore {
    pub fn inner(&self) -> &Database {
        &self.db
    }

    /// Make `recent_messages` fail until switched back off.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn recent_calls(&self) -> u32 {
        self.recent_calls.load(Ordering::SeqCst)
    }

    pub fn replace_calls(&self) -> u32 {
        self.replace_calls.load(Ordering::SeqCst)
    }

    /// Report the next `n` conditional writes as lost races.
    pub fn conflict_next(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Run `hook` against the real database just before the next conditional write.
    pub fn before_next_replace(&self, hook: impl FnOnce(&Database) + Send + 'static) {
        *self.before_replace.lock().unwrap() = Some(Box::new(hook));
    }
}

impl ChatStore for FaultyStore {
    fn now(&self) -> DateTime<Utc> {
        self.db.now()
    }

    fn watch(&self) -> broadcast::Receiver<StoreChange> {
        self.db.watch()
    }

    fn insert_message(&self, draft: &MessageDraft) -> Result<Message> {
        self.db.insert_message(draft)
    }

    fn get_message(&self, group_id: Uuid, message_id: Uuid) -> Result<Option<Versioned<Message>>> {
        self.db.get_message(group_id, message_id)
    }

    fn replace_message(&self, message: &Message, expected_version: i64) -> Result<bool> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);

        let hook = self.before_replace.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.db);
        }

        let lost = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Ok(false);
        }
        self.db.replace_message(message, expected_version)
    }

    fn recent_messages(&self, group_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        self.recent_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("store offline"));
        }
        self.db.recent_messages(group_id, limit)
    }

    fn upsert_presence(&self, group_id: Uuid, user_id: Uuid, display_name: &str) -> Result<TypingPresence> {
        self.db.upsert_presence(group_id, user_id, display_name)
    }

    fn delete_presence(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.db.delete_presence(group_id, user_id)
    }

    fn list_presence(&self, group_id: Uuid) -> Result<Vec<TypingPresence>> {
        self.db.list_presence(group_id)
    }

    fn prune_presence(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.db.prune_presence(cutoff)
    }
}
