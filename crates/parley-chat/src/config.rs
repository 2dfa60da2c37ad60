use std::time::Duration;

use tracing::warn;

/// Tunables for the chat core. `Default` matches production behaviour;
/// `from_env` lets a deployment override individual values.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// How many of the most recent messages a live subscription carries.
    pub history_window: usize,
    /// Body length limit, in characters.
    pub max_body_chars: usize,
    /// Emoji key length limit, in bytes.
    pub max_emoji_bytes: usize,
    /// Read-modify-write attempts (reaction toggles, edits, deletes) before
    /// giving up with `TransientConflict`.
    pub write_attempts: u32,
    /// A typing entry older than this is stale and never reported.
    pub typing_ttl: Duration,
    /// How often presence subscriptions re-check staleness without a store event.
    pub presence_recheck: Duration,
    /// Default deadline for a single mutation.
    pub mutation_timeout: Duration,
    /// Snapshot loads tried before a subscription reports `NetworkUnavailable`.
    pub subscribe_attempts: u32,
    pub subscribe_backoff: Duration,
    pub subscribe_backoff_max: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_window: 50,
            max_body_chars: 1000,
            max_emoji_bytes: 32,
            write_attempts: 5,
            typing_ttl: Duration::from_secs(5),
            presence_recheck: Duration::from_secs(1),
            mutation_timeout: Duration::from_secs(10),
            subscribe_attempts: 5,
            subscribe_backoff: Duration::from_millis(250),
            subscribe_backoff_max: Duration::from_secs(5),
        }
    }
}

impl ChatConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            history_window: env_parse("PARLEY_HISTORY_WINDOW").unwrap_or(defaults.history_window),
            max_body_chars: env_parse("PARLEY_MAX_BODY_CHARS").unwrap_or(defaults.max_body_chars),
            write_attempts: env_parse("PARLEY_WRITE_ATTEMPTS").unwrap_or(defaults.write_attempts),
            typing_ttl: env_parse("PARLEY_TYPING_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.typing_ttl),
            presence_recheck: env_parse("PARLEY_PRESENCE_RECHECK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.presence_recheck),
            mutation_timeout: env_parse("PARLEY_MUTATION_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.mutation_timeout),
            ..defaults
        }
        .normalized()
    }

    /// Clamp values that would stall or panic the core: zero attempts and
    /// zero-length timer periods.
    pub fn normalized(self) -> Self {
        let floor = Duration::from_millis(1);
        Self {
            history_window: self.history_window.max(1),
            write_attempts: self.write_attempts.max(1),
            subscribe_attempts: self.subscribe_attempts.max(1),
            presence_recheck: self.presence_recheck.max(floor),
            subscribe_backoff: self.subscribe_backoff.max(floor),
            subscribe_backoff_max: self.subscribe_backoff_max.max(floor),
            ..self
        }
    }

    /// Backoff before snapshot load attempt `attempt` (1-based) is retried.
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.subscribe_backoff
            .saturating_mul(factor)
            .min(self.subscribe_backoff_max)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}
