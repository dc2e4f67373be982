//! Request pacing
//!
//! Spaces requests evenly at `requests_per_second`; callers queue on an async
//! mutex and sleep until their slot comes up.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone)]
pub struct RateLimiter {
    spacing: Duration,
    next_slot: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        let spacing = Duration::from_secs(1) / requests_per_second.max(1);
        Self {
            spacing,
            next_slot: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Wait for the next free slot
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.spacing;
            slot
        };
        sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spacing() {
        assert_eq!(RateLimiter::new(10).spacing(), Duration::from_millis(100));
        // zero is treated as one request per second
        assert_eq!(RateLimiter::new(0).spacing(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_requests_are_spaced() {
        let limiter = RateLimiter::new(50);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        // first slot is immediate, the next two wait 20ms each
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_clones_share_schedule() {
        let a = RateLimiter::new(20);
        let b = a.clone();
        let start = Instant::now();
        a.acquire().await;
        b.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
