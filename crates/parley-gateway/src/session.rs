use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_chat::typing::{TypingDebouncer, TypingSignal};
use parley_chat::unread::ChatSubscriptionState;
use parley_chat::{CancelHandle, ChatService, ChatStore, MessageSnapshot};
use parley_types::events::{GatewayCommand, GatewayEvent};
use parley_types::models::{Identity, TypingUser};

/// Delivery from a subscription callback, queued for the connection loop.
#[derive(Debug)]
pub enum Update {
    Snapshot {
        group_id: Uuid,
        snapshot: Arc<MessageSnapshot>,
    },
    Typing {
        group_id: Uuid,
        users: Vec<TypingUser>,
    },
    Failed {
        group_id: Uuid,
        message: String,
    },
}

struct GroupSession {
    unread: ChatSubscriptionState,
    debouncer: TypingDebouncer,
    messages: CancelHandle,
    typing: CancelHandle,
}

impl GroupSession {
    fn cancel(&self) {
        self.messages.cancel();
        self.typing.cancel();
    }
}

/// Per-connection gateway state: which groups are subscribed, the local
/// read marker of each, and the typing debouncer of each.
///
/// Transport-free; the connection loop feeds it commands, queued updates
/// and clock ticks, and sends whatever events come back.
pub struct GatewaySession<S> {
    chat: ChatService<S>,
    identity: Identity,
    updates: mpsc::UnboundedSender<Update>,
    groups: HashMap<Uuid, GroupSession>,
}

impl<S: ChatStore> GatewaySession<S> {
    pub fn new(chat: ChatService<S>, identity: Identity) -> (Self, mpsc::UnboundedReceiver<Update>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let session = Self {
            chat,
            identity,
            updates,
            groups: HashMap::new(),
        };
        (session, rx)
    }

    pub fn ready(&self) -> GatewayEvent {
        GatewayEvent::Ready {
            user_id: self.identity.user_id,
            display_name: self.identity.display_name.clone(),
        }
    }

    pub fn is_subscribed(&self, group_id: Uuid) -> bool {
        self.groups.contains_key(&group_id)
    }

    /// Apply a client command. Returns an event to send back, if any.
    pub async fn handle_command(&mut self, cmd: GatewayCommand, now: Instant) -> Option<GatewayEvent> {
        match cmd {
            GatewayCommand::Subscribe { group_id } => {
                self.subscribe(group_id);
                None
            }

            GatewayCommand::Unsubscribe { group_id } => {
                if let Some(group) = self.groups.remove(&group_id) {
                    group.cancel();
                    self.stop_typing(group_id, group.debouncer).await;
                    debug!("{} unsubscribed from group {}", self.identity.user_id, group_id);
                }
                None
            }

            GatewayCommand::MarkRead { group_id } => {
                let group = self.groups.get_mut(&group_id)?;
                group.unread.mark_read();
                snapshot_event(group_id, &group.unread)
            }

            GatewayCommand::Typing { group_id, is_typing } => {
                let group = self.groups.get_mut(&group_id)?;
                let signal = if is_typing {
                    group.debouncer.keystroke(now)
                } else {
                    group.debouncer.sent()
                };
                if let Some(signal) = signal {
                    self.send_signal(group_id, signal).await;
                }
                None
            }
        }
    }

    /// Fold a subscription delivery into local state and render it.
    /// Deliveries for groups no longer subscribed are dropped.
    pub fn apply(&mut self, update: Update) -> Option<GatewayEvent> {
        match update {
            Update::Snapshot { group_id, snapshot } => {
                let group = self.groups.get_mut(&group_id)?;
                group.unread.apply(snapshot);
                snapshot_event(group_id, &group.unread)
            }
            Update::Typing { group_id, users } => {
                self.groups.contains_key(&group_id).then_some(GatewayEvent::Typing { group_id, users })
            }
            Update::Failed { group_id, message } => {
                self.groups
                    .contains_key(&group_id)
                    .then_some(GatewayEvent::SubscriptionError { group_id, message })
            }
        }
    }

    /// Earliest instant at which some group's typing state times out.
    pub fn next_typing_deadline(&self) -> Option<Instant> {
        self.groups
            .values()
            .filter_map(|g| g.debouncer.next_deadline())
            .min()
    }

    /// Send stop signals for every burst that has timed out by `now`.
    pub async fn poll_typing(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .groups
            .iter_mut()
            .filter_map(|(id, g)| g.debouncer.poll(now).map(|_| *id))
            .collect();
        for group_id in expired {
            self.send_signal(group_id, TypingSignal::Stop).await;
        }
    }

    /// Cancel every subscription and clear any typing state left behind.
    pub async fn close(&mut self) {
        let groups: Vec<(Uuid, GroupSession)> = self.groups.drain().collect();
        for (group_id, group) in groups {
            group.cancel();
            self.stop_typing(group_id, group.debouncer).await;
        }
    }

    fn subscribe(&mut self, group_id: Uuid) {
        if self.groups.contains_key(&group_id) {
            return;
        }
        info!("{} subscribing to group {}", self.identity.user_id, group_id);

        let tx = self.updates.clone();
        let messages = self.chat.messages().subscribe(group_id, move |delivery| {
            let update = match delivery {
                Ok(snapshot) => Update::Snapshot {
                    group_id,
                    snapshot: Arc::new(snapshot.clone()),
                },
                Err(e) => Update::Failed {
                    group_id,
                    message: e.to_string(),
                },
            };
            let _ = tx.send(update);
        });

        let tx = self.updates.clone();
        let typing = self
            .chat
            .presence()
            .subscribe(group_id, self.identity.user_id, move |delivery| {
                let update = match delivery {
                    Ok(users) => Update::Typing {
                        group_id,
                        users: users.to_vec(),
                    },
                    Err(e) => Update::Failed {
                        group_id,
                        message: e.to_string(),
                    },
                };
                let _ = tx.send(update);
            });

        self.groups.insert(
            group_id,
            GroupSession {
                unread: ChatSubscriptionState::new(self.identity.user_id),
                debouncer: TypingDebouncer::default(),
                messages,
                typing,
            },
        );
    }

    async fn stop_typing(&self, group_id: Uuid, mut debouncer: TypingDebouncer) {
        if let Some(signal) = debouncer.cancel() {
            self.send_signal(group_id, signal).await;
        }
    }

    async fn send_signal(&self, group_id: Uuid, signal: TypingSignal) {
        let result = self
            .chat
            .presence()
            .signal(
                group_id,
                self.identity.user_id,
                &self.identity.display_name,
                signal.is_typing(),
            )
            .await;
        if let Err(e) = result {
            warn!(
                "Typing {:?} for {} in group {} failed: {}",
                signal, self.identity.user_id, group_id, e
            );
        }
    }
}

fn snapshot_event(group_id: Uuid, state: &ChatSubscriptionState) -> Option<GatewayEvent> {
    let snapshot = state.snapshot()?;
    Some(GatewayEvent::Snapshot {
        group_id,
        messages: snapshot.messages.clone(),
        unread: state.unread(),
        last_read_id: state.last_read_id(),
    })
}
