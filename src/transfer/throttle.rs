//! Per-provider upload bandwidth throttle

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    started: Instant,
    bytes: u64,
}

/// Limits throughput to `limit` bytes per second using a one-second window
/// measured on the monotonic clock.
#[derive(Debug)]
pub struct BandwidthThrottle {
    limit: Option<u64>,
    window: Mutex<Window>,
}

impl BandwidthThrottle {
    /// `None` or `Some(0)` disables throttling
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit: limit.filter(|l| *l > 0),
            window: Mutex::new(Window {
                started: Instant::now(),
                bytes: 0,
            }),
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Bytes accounted in the current window, scaled to bytes per second
    pub fn usage(&self) -> u64 {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = window.started.elapsed();
        if elapsed >= WINDOW {
            0
        } else {
            window.bytes
        }
    }

    /// Account for `bytes` about to be sent, sleeping when the window budget
    /// is exceeded.
    pub async fn consume(&self, bytes: u64) {
        let Some(limit) = self.limit else {
            return;
        };

        let wait = {
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            if now.duration_since(window.started) >= WINDOW {
                window.started = now;
                window.bytes = 0;
            }
            window.bytes += bytes;

            if window.bytes > limit {
                let excess = window.bytes - limit;
                let elapsed = now.duration_since(window.started);
                let owed = Duration::from_secs_f64(excess as f64 / limit as f64);
                Some(WINDOW.saturating_sub(elapsed) + owed)
            } else {
                None
            }
        };

        if let Some(wait) = wait {
            debug!(limit, wait_ms = wait.as_millis() as u64, "Throttling upload");
            tokio::time::sleep(wait).await;
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            window.started = Instant::now();
            window.bytes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_sleeps() {
        let throttle = BandwidthThrottle::new(None);
        let start = Instant::now();
        throttle.consume(10_000_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_disables_throttle() {
        let throttle = BandwidthThrottle::new(Some(0));
        assert_eq!(throttle.limit(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_slows_transfer() {
        let throttle = BandwidthThrottle::new(Some(1000));
        let start = Instant::now();
        for _ in 0..3 {
            throttle.consume(1000).await;
        }
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_budget_is_immediate() {
        let throttle = BandwidthThrottle::new(Some(1000));
        let start = Instant::now();
        throttle.consume(400).await;
        throttle.consume(400).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(throttle.usage(), 800);
    }
}
