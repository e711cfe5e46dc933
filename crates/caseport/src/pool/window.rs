use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// "At most `requests` dispatches in any rolling `interval`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub requests: usize,
    pub interval: Duration,
}

impl RateWindow {
    /// Create a window. A request budget of zero is raised to one.
    pub fn new(requests: usize, interval: Duration) -> Self {
        Self {
            requests: requests.max(1),
            interval,
        }
    }
}

/// Sliding log of dispatch instants.
///
/// The mutex is held across the sleep: tokio's mutex queues waiters in FIFO
/// order, so callers are admitted in arrival order and none starves.
#[derive(Debug)]
pub(crate) struct SlidingWindow {
    limit: RateWindow,
    dispatched: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub(crate) fn new(limit: RateWindow) -> Self {
        Self {
            limit,
            dispatched: Mutex::new(VecDeque::with_capacity(limit.requests)),
        }
    }

    pub(crate) fn limit(&self) -> RateWindow {
        self.limit
    }

    /// Wait for a free slot and record a dispatch at the current instant.
    ///
    /// Returns how long the caller was held back.
    pub(crate) async fn acquire(&self) -> Duration {
        let started = Instant::now();
        let mut dispatched = self.dispatched.lock().await;

        loop {
            let now = Instant::now();
            while let Some(&oldest) = dispatched.front() {
                if now.duration_since(oldest) >= self.limit.interval {
                    dispatched.pop_front();
                } else {
                    break;
                }
            }

            if dispatched.len() < self.limit.requests {
                dispatched.push_back(now);
                return now.duration_since(started);
            }

            if let Some(&oldest) = dispatched.front() {
                tokio::time::sleep_until(oldest + self.limit.interval).await;
            }
        }
    }
}
