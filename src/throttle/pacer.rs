//! Fixed-cadence loop pacing with cancellation.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Schedules the next cycle `interval` after the previous one started,
/// never sleeping less than `floor`.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    interval: Duration,
    floor: Duration,
}

impl Pacer {
    pub fn new(interval: Duration, floor: Duration) -> Self {
        Self { interval, floor }
    }

    pub fn delay_after(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed).max(self.floor)
    }

    /// Sleep out the rest of a cycle started at `started`.
    /// Returns `false` if the token was cancelled first.
    pub async fn wait(&self, started: Instant, token: &CancellationToken) -> bool {
        let delay = self.delay_after(started.elapsed());
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn test_delay_subtracts_processing_time() {
        let pacer = Pacer::new(Duration::from_secs(1), Duration::from_millis(100));
        assert_eq!(pacer.delay_after(Duration::from_millis(300)), Duration::from_millis(700));
    }

    #[test]
    fn test_delay_never_below_floor() {
        let pacer = Pacer::new(Duration::from_secs(1), Duration::from_millis(100));
        assert_eq!(pacer.delay_after(Duration::from_millis(950)), Duration::from_millis(100));
        assert_eq!(pacer.delay_after(Duration::from_secs(5)), Duration::from_millis(100));

        let unfloored = Pacer::new(Duration::from_secs(2), Duration::ZERO);
        assert_eq!(unfloored.delay_after(Duration::from_secs(3)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_completes_after_remaining_interval() {
        let pacer = Pacer::new(Duration::from_secs(1), Duration::from_millis(100));
        let token = CancellationToken::new();
        let started = Instant::now();

        assert!(pacer.wait(started, &token).await);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let pacer = Pacer::new(Duration::from_secs(60), Duration::ZERO);
        let token = CancellationToken::new();

        let mut waiting = task::spawn(pacer.wait(Instant::now(), &token));
        assert_pending!(waiting.poll());

        token.cancel();
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), false);
    }
}
