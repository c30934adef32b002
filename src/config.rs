use rand::Rng;
use std::time::Duration;

/// Delay between drain cycles of the processing loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How far a failed job is pushed back before it may run again.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3 * 60);

/// Tunables of a [`JobQueue`](crate::JobQueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Delay between drain cycles used by
    /// [`start_processing_default`](crate::JobQueue::start_processing_default).
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to every poll.
    pub jitter: Duration,
    /// Backoff applied when a job fails and has attempts left.
    pub retry_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: Duration::ZERO,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl QueueConfig {
    /// `delay` plus a random jitter in `0..=self.jitter`.
    pub(crate) fn sleep_duration_with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        delay + Duration::from_millis(random_jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.retry_backoff, Duration::from_secs(180));
    }

    #[test]
    fn no_jitter_keeps_delay() {
        let config = QueueConfig::default();
        let delay = Duration::from_millis(250);
        assert_eq!(config.sleep_duration_with_jitter(delay), delay);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let config = QueueConfig {
            jitter: Duration::from_millis(50),
            ..QueueConfig::default()
        };
        let delay = Duration::from_millis(100);
        for _ in 0..100 {
            let slept = config.sleep_duration_with_jitter(delay);
            assert!(slept >= delay);
            assert!(slept <= delay + Duration::from_millis(50));
        }
    }
}
