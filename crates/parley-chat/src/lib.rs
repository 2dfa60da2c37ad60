//! Per-group real-time chat core: message log, reactions, typing presence,
//! live snapshot fan-out and unread tracking.

pub mod config;
pub mod error;
pub mod handle;
pub mod messages;
pub mod notify;
pub mod presence;
pub mod reactions;
pub mod service;
pub mod store;
pub mod sync;
pub mod typing;
pub mod unread;

mod txn;

#[cfg(test)]
mod test_support;

pub use config::ChatConfig;
pub use error::{ChatError, ChatResult, within};
pub use handle::CancelHandle;
pub use service::ChatService;
pub use store::ChatStore;
pub use sync::MessageSnapshot;
