use std::sync::Arc;

use crate::config::ChatConfig;
use crate::messages::MessageStore;
use crate::notify::NotificationDispatcher;
use crate::presence::PresenceTracker;
use crate::reactions::ReactionAggregator;
use crate::store::ChatStore;
use crate::sync::SyncSubscriptionManager;

/// The chat core wired over one store. Cheap to clone; every clone shares
/// the same subscription registry.
pub struct ChatService<S> {
    inner: Arc<ServiceInner<S>>,
}

struct ServiceInner<S> {
    messages: MessageStore<S>,
    reactions: ReactionAggregator<S>,
    presence: PresenceTracker<S>,
}

impl<S> Clone for ChatService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: ChatStore> ChatService<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn NotificationDispatcher>, config: ChatConfig) -> Self {
        let config = Arc::new(config.normalized());
        let sync = SyncSubscriptionManager::new(store.clone(), config.clone());
        let messages = MessageStore::new(store.clone(), sync, notifier, config.clone());
        let reactions = ReactionAggregator::new(store.clone(), config.clone());
        let presence = PresenceTracker::new(store, config);

        Self {
            inner: Arc::new(ServiceInner {
                messages,
                reactions,
                presence,
            }),
        }
    }

    pub fn messages(&self) -> &MessageStore<S> {
        &self.inner.messages
    }

    pub fn reactions(&self) -> &ReactionAggregator<S> {
        &self.inner.reactions
    }

    pub fn presence(&self) -> &PresenceTracker<S> {
        &self.inner.presence
    }
}
