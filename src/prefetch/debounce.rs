//! Time-based call collapsing.

use std::time::Duration;

use tokio::time::Instant;

/// Collapses bursts of triggers into at most one effective call per
/// `interval`. The first trigger of a burst fires immediately; callers that
/// want a trailing call can wait until [`Debouncer::next_ready_at`].
#[derive(Debug, Clone)]
pub struct Debouncer {
    interval: Duration,
    last_fired: Option<Instant>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Register a trigger. Returns `true` if the call should go through now.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last_fired {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                self.last_fired = Some(now);
                true
            }
        }
    }

    /// Earliest instant at which [`ready`](Self::ready) can return `true`.
    pub fn next_ready_at(&self) -> Instant {
        match self.last_fired {
            Some(at) => at + self.interval,
            None => Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.last_fired = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));

        let fired = (0..10).filter(|_| debouncer.ready()).count();
        assert_eq!(fired, 1);

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(!debouncer.ready());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(debouncer.ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_ready_at() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        let start = Instant::now();
        assert_eq!(debouncer.next_ready_at(), start);

        debouncer.ready();
        assert_eq!(debouncer.next_ready_at(), start + Duration::from_millis(50));

        debouncer.reset();
        assert!(debouncer.ready());
    }
}
