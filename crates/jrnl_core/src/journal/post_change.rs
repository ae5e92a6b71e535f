//! Debounced change notifications.

use std::time::{Duration, Instant};

/// Decides when an append should wake watchers.
///
/// Without an interval every change fires at once. With one, a change
/// fires only if the interval has passed since the last firing; otherwise
/// it is remembered and fires with the next change past the interval, or
/// when flushed.
#[derive(Debug, Clone)]
pub(crate) struct PostChange {
    interval: Option<Duration>,
    last_fire: Option<Instant>,
    pending: bool,
}

impl PostChange {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            last_fire: None,
            pending: false,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Records a change at `now` and returns `true` if it should fire.
    pub fn schedule(&mut self, now: Instant) -> bool {
        let due = match (self.interval, self.last_fire) {
            (None, _) | (Some(_), None) => true,
            (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
        };

        if due {
            self.fired(now);
        } else {
            self.pending = true;
        }
        due
    }

    /// Clears the pending change, returning `true` if there was one.
    pub fn take_pending(&mut self, now: Instant) -> bool {
        if !self.pending {
            return false;
        }
        self.fired(now);
        true
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    fn fired(&mut self, now: Instant) {
        self.last_fire = Some(now);
        self.pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_interval_always_fires() {
        let mut pc = PostChange::new(None);
        let now = Instant::now();

        assert!(pc.schedule(now));
        assert!(pc.schedule(now));
        assert!(!pc.is_pending());
    }

    #[test]
    fn interval_coalesces() {
        let mut pc = PostChange::new(Some(Duration::from_millis(250)));
        let start = Instant::now();

        assert!(pc.schedule(start));
        assert!(!pc.schedule(start + Duration::from_millis(10)));
        assert!(!pc.schedule(start + Duration::from_millis(20)));
        assert!(pc.is_pending());

        assert!(pc.schedule(start + Duration::from_millis(300)));
        assert!(!pc.is_pending());
    }

    #[test]
    fn flush_fires_pending_once() {
        let mut pc = PostChange::new(Some(Duration::from_secs(60)));
        let now = Instant::now();

        pc.schedule(now);
        assert!(!pc.take_pending(now));

        pc.schedule(now);
        assert!(pc.take_pending(now));
        assert!(!pc.take_pending(now));
    }
}
