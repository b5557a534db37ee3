//! Sliding-window request limiter.
//!
//! Keeps the instants of the requests issued in the trailing window in a FIFO.
//! A caller that finds the window full sleeps exactly until the oldest entry
//! ages out, then records itself. The window sits behind a fair async mutex
//! that is held across the sleep, so waiting callers are served in arrival
//! order and the count can never exceed the budget.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    stamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// A limiter allowing `capacity` requests per `window`.
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window,
            stamps: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Wait for a free slot and claim it. Returns how long the caller waited.
    pub async fn acquire(&self) -> Duration {
        let mut stamps = self.stamps.lock().await;
        let started = Instant::now();

        loop {
            let now = Instant::now();
            while let Some(&oldest) = stamps.front() {
                if now.duration_since(oldest) >= self.window {
                    stamps.pop_front();
                } else {
                    break;
                }
            }

            if stamps.len() < self.capacity {
                stamps.push_back(now);
                return now.duration_since(started);
            }

            let Some(&oldest) = stamps.front() else {
                continue;
            };
            let deficit = (oldest + self.window).saturating_duration_since(now);
            debug!(
                "[rate-limit] window full ({} in {:?}), sleeping {:?}",
                stamps.len(),
                self.window,
                deficit
            );
            tokio::time::sleep(deficit).await;
        }
    }

    /// Requests currently counted in the window.
    pub async fn in_window(&self) -> usize {
        let stamps = self.stamps.lock().await;
        let now = Instant::now();
        stamps
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
