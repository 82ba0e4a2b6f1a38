use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Sliding-window limiter, global to one pipeline: at most `max_requests`
/// completed acquisitions per `window`. When the window is full the caller
/// sleeps until the oldest record expires; the lock is held across that
/// sleep so saturated acquirers drain in order.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) {
        let mut requests = self.requests.lock().await;
        let now = Instant::now();
        while let Some(front) = requests.front() {
            if now.duration_since(*front) >= self.window {
                requests.pop_front();
            } else {
                break;
            }
        }
        if requests.len() >= self.max_requests {
            if let Some(oldest) = requests.front().copied() {
                let wait = self.window.saturating_sub(oldest.elapsed());
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                requests.pop_front();
            }
        }
        requests.push_back(Instant::now());
    }

    pub async fn in_window(&self) -> usize {
        let requests = self.requests.lock().await;
        let now = Instant::now();
        requests
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_under_capacity_is_immediate() {
        let limiter = RateLimiter::new(5, Duration::from_millis(200));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(limiter.in_window().await, 5);
    }

    #[tokio::test]
    async fn test_saturated_window_waits_for_oldest() {
        let limiter = RateLimiter::new(2, Duration::from_millis(150));
        limiter.acquire().await;
        limiter.acquire().await;
        let start = Instant::now();
        limiter.acquire().await;
        // had to outwait the oldest record
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(limiter.in_window().await <= 2);
    }

    #[tokio::test]
    async fn test_window_drains_over_time() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        limiter.acquire().await;
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(30));
    }
}
