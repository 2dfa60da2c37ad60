use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::models::{Message, MessageKind};

const SUMMARY_MAX_CHARS: usize = 100;

/// Payload handed to the notification dispatcher after a successful append.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub author_name: String,
    pub summary: String,
    pub group_id: Uuid,
    pub message_id: Uuid,
    pub author_id: Uuid,
}

impl Notification {
    pub fn for_message(message: &Message) -> Self {
        Self {
            author_name: message.author_name.clone(),
            summary: summarize(message),
            group_id: message.group_id,
            message_id: message.id,
            author_id: message.author_id,
        }
    }
}

/// Push-notification collaborator. Fire-and-forget: implementations must
/// not block and their failures never affect the append that triggered them.
pub trait NotificationDispatcher: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Short human-readable text for a message, used as the notification body.
pub fn summarize(message: &Message) -> String {
    match message.kind {
        MessageKind::Image => "📷 Photo".to_string(),
        MessageKind::Location => "📍 Location".to_string(),
        MessageKind::Text => {
            let body = message.body.trim();
            if body.chars().count() <= SUMMARY_MAX_CHARS {
                body.to_string()
            } else {
                let mut cut: String = body.chars().take(SUMMARY_MAX_CHARS).collect();
                cut.push('…');
                cut
            }
        }
    }
}

/// Logs notifications instead of sending them. Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationDispatcher for TracingNotifier {
    fn notify(&self, n: Notification) {
        debug!(
            "Notify group {}: {} ({}): {}",
            n.group_id, n.author_name, n.message_id, n.summary
        );
    }
}

/// POSTs each notification as JSON to a push gateway.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl NotificationDispatcher for WebhookNotifier {
    fn notify(&self, notification: Notification) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to deliver notification for {}", notification.message_id);
            return;
        };

        let body = match serde_json::to_vec(&notification) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode notification {}: {}", notification.message_id, e);
                return;
            }
        };

        let client = self.client.clone();
        let url = self.url.clone();
        let message_id = notification.message_id;
        runtime.spawn(async move {
            let result = client
                .post(&url)
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());

            match result {
                Ok(_) => debug!("Notification for {} delivered", message_id),
                Err(e) => warn!("Notification for {} failed: {}", message_id, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{identity, message_fixture};
    use parley_types::models::Attachment;

    #[test]
    fn text_summary_is_trimmed_and_truncated() {
        let group = Uuid::new_v4();
        let ana = identity("ana");

        let short = message_fixture(group, &ana, "  hi there  ", 1);
        assert_eq!(summarize(&short), "hi there");

        let long = message_fixture(group, &ana, &"é".repeat(150), 2);
        let summary = summarize(&long);
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS + 1);
        assert!(summary.ends_with('…'));
    }

    #[test]
    fn media_summaries_use_placeholders() {
        let group = Uuid::new_v4();
        let mut msg = message_fixture(group, &identity("ana"), "", 1);
        msg.kind = MessageKind::Location;
        msg.attachment = Some(Attachment::Location {
            latitude: 52.37,
            longitude: 4.89,
        });

        let n = Notification::for_message(&msg);
        assert_eq!(n.summary, "📍 Location");
        assert_eq!(n.author_name, "ana");
        assert_eq!(n.message_id, msg.id);
    }
}
