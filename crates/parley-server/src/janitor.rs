use std::time::Duration;

use tracing::warn;

use parley_chat::{ChatService, ChatStore};

/// Background task that prunes stale typing entries.
///
/// Storage hygiene only: readers already ignore entries past the TTL, so a
/// missed or failed run changes nothing anyone sees.
pub async fn run_presence_janitor<S: ChatStore>(chat: ChatService<S>, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        if let Err(e) = chat.presence().prune_stale().await {
            warn!("Presence janitor error: {}", e);
        }
    }
}
