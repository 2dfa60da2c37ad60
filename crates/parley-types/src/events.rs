use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, TypingUser};

/// Raw change notification pushed by the document store after a write.
/// Carries only the collection that changed; listeners re-read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    Messages { group_id: Uuid },
    Presence { group_id: Uuid },
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, display_name: String },

    /// Latest ordered window for a subscribed group
    Snapshot {
        group_id: Uuid,
        messages: Vec<Message>,
        unread: usize,
        last_read_id: Option<Uuid>,
    },

    /// Users currently typing in a subscribed group, excluding the receiver
    Typing { group_id: Uuid, users: Vec<TypingUser> },

    /// A group subscription could not attach after repeated attempts
    SubscriptionError { group_id: Uuid, message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Start receiving snapshots and typing updates for a group
    Subscribe { group_id: Uuid },

    /// Stop receiving updates for a group
    Unsubscribe { group_id: Uuid },

    /// Move the local read marker to the newest delivered message
    MarkRead { group_id: Uuid },

    /// A keystroke (`true`) or an explicit stop (`false`); the gateway
    /// debounces keystrokes into presence signals
    Typing { group_id: Uuid, is_typing: bool },
}
