use std::time::{Duration, Instant};

/// Idle time after the last keystroke before typing is reported stopped.
pub const TYPING_IDLE: Duration = Duration::from_secs(1);
/// Longest continuous stretch reported as typing before an automatic stop.
pub const TYPING_MAX_BURST: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

impl TypingSignal {
    pub fn is_typing(self) -> bool {
        matches!(self, TypingSignal::Start)
    }
}

#[derive(Debug, Clone, Copy)]
struct Burst {
    started_at: Instant,
    idle_deadline: Instant,
}

/// Turns raw keystrokes into start/stop presence signals.
///
/// Owned by whoever signals presence (a composer, a gateway connection).
/// Holds deadlines only; the owner decides when to call [`poll`](Self::poll),
/// usually by sleeping until [`next_deadline`](Self::next_deadline).
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    idle: Duration,
    max_burst: Duration,
    burst: Option<Burst>,
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(TYPING_IDLE, TYPING_MAX_BURST)
    }
}

impl TypingDebouncer {
    pub fn new(idle: Duration, max_burst: Duration) -> Self {
        Self {
            idle,
            max_burst,
            burst: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.burst.is_some()
    }

    /// Record a keystroke. Returns `Start` only on the transition into
    /// typing; repeated keystrokes just push the idle deadline out. A
    /// keystroke past the burst cap ends the burst with `Stop`; the next
    /// one starts a fresh burst.
    pub fn keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        let Some(burst) = self.burst.as_mut() else {
            self.burst = Some(Burst {
                started_at: now,
                idle_deadline: now + self.idle,
            });
            return Some(TypingSignal::Start);
        };

        if now >= burst.started_at + self.max_burst {
            self.burst = None;
            return Some(TypingSignal::Stop);
        }
        burst.idle_deadline = now + self.idle;
        None
    }

    /// Check deadlines. Returns `Stop` once the idle deadline or the burst
    /// cap has passed.
    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        let deadline = self.next_deadline()?;
        if now >= deadline {
            self.burst = None;
            return Some(TypingSignal::Stop);
        }
        None
    }

    /// The earliest instant at which `poll` would report a stop.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.burst
            .map(|b| b.idle_deadline.min(b.started_at + self.max_burst))
    }

    /// The message was sent; typing is over.
    pub fn sent(&mut self) -> Option<TypingSignal> {
        self.stop()
    }

    /// The composer went away.
    pub fn cancel(&mut self) -> Option<TypingSignal> {
        self.stop()
    }

    fn stop(&mut self) -> Option<TypingSignal> {
        self.burst.take().map(|_| TypingSignal::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn start_is_emitted_once_per_burst() {
        let t0 = Instant::now();
        let mut debouncer = TypingDebouncer::default();

        assert_eq!(debouncer.keystroke(t0), Some(TypingSignal::Start));
        assert_eq!(debouncer.keystroke(t0 + ms(200)), None);
        assert_eq!(debouncer.keystroke(t0 + ms(400)), None);
        assert!(debouncer.is_typing());
    }

    #[test]
    fn idle_second_ends_typing() {
        let t0 = Instant::now();
        let mut debouncer = TypingDebouncer::default();
        debouncer.keystroke(t0);
        debouncer.keystroke(t0 + ms(500));

        // Each keystroke rearms the idle deadline.
        assert_eq!(debouncer.next_deadline(), Some(t0 + ms(1500)));
        assert_eq!(debouncer.poll(t0 + ms(1200)), None);
        assert_eq!(debouncer.poll(t0 + ms(1500)), Some(TypingSignal::Stop));
        assert_eq!(debouncer.poll(t0 + ms(2000)), None);

        assert_eq!(debouncer.keystroke(t0 + ms(2100)), Some(TypingSignal::Start));
    }

    #[test]
    fn continuous_typing_is_capped() {
        let t0 = Instant::now();
        let mut debouncer = TypingDebouncer::default();
        debouncer.keystroke(t0);

        let mut at = t0;
        for _ in 0..9 {
            at += ms(300);
            assert_eq!(debouncer.keystroke(at), None);
        }
        assert_eq!(debouncer.next_deadline(), Some(t0 + TYPING_MAX_BURST));
        assert_eq!(debouncer.poll(t0 + ms(3000)), Some(TypingSignal::Stop));
        assert!(!debouncer.is_typing());
    }

    #[test]
    fn keystroke_past_cap_stops_then_restarts() {
        let t0 = Instant::now();
        let mut debouncer = TypingDebouncer::new(ms(1000), ms(3000));
        debouncer.keystroke(t0);
        debouncer.keystroke(t0 + ms(900));
        debouncer.keystroke(t0 + ms(1800));
        debouncer.keystroke(t0 + ms(2700));

        assert_eq!(debouncer.keystroke(t0 + ms(3100)), Some(TypingSignal::Stop));
        assert_eq!(debouncer.keystroke(t0 + ms(3200)), Some(TypingSignal::Start));
    }

    #[test]
    fn send_and_cancel_stop_only_when_typing() {
        let t0 = Instant::now();
        let mut debouncer = TypingDebouncer::default();

        assert_eq!(debouncer.sent(), None);
        debouncer.keystroke(t0);
        assert_eq!(debouncer.sent(), Some(TypingSignal::Stop));
        assert_eq!(debouncer.cancel(), None);

        debouncer.keystroke(t0 + ms(10));
        assert_eq!(debouncer.cancel(), Some(TypingSignal::Stop));
        assert_eq!(debouncer.next_deadline(), None);
    }
}
