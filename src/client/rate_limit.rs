//! Sliding-window request limiter.
//!
//! The vendor enforces a per-minute call budget across the whole account, so
//! a single limiter instance is shared by everything that talks to the API.
//! Admissions are timestamps in a bounded deque; when the window is full the
//! caller sleeps until the oldest admission ages out.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    max_per_window: usize,
    admissions: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize) -> RateLimiter {
        RateLimiter {
            max_per_window: max_per_window.max(1),
            admissions: Mutex::new(VecDeque::with_capacity(max_per_window.max(1))),
        }
    }

    /// Admit one request, sleeping as long as the window is saturated.
    /// Safe for concurrent callers: the lock is never held across a sleep.
    pub async fn acquire(&self) {
        loop {
            match self.try_admit(Instant::now()) {
                None => return,
                Some(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Returns `None` when admitted, or the time to wait before retrying.
    fn try_admit(&self, now: Instant) -> Option<Duration> {
        let mut admissions = self.admissions.lock();
        while let Some(oldest) = admissions.front() {
            if now.duration_since(*oldest) >= WINDOW {
                admissions.pop_front();
            } else {
                break;
            }
        }
        if admissions.len() < self.max_per_window {
            admissions.push_back(now);
            return None;
        }
        let oldest = *admissions.front().expect("window is non-empty when full");
        Some(WINDOW.saturating_sub(now.duration_since(oldest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_budget_immediately() {
        let limiter = RateLimiter::new(5);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.try_admit(now).is_none());
        }
        assert!(limiter.try_admit(now).is_some());
    }

    #[test]
    fn oldest_admission_aging_out_frees_budget() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        assert!(limiter.try_admit(start).is_none());
        assert!(limiter.try_admit(start).is_none());

        // Still inside the window: blocked.
        let wait = limiter
            .try_admit(start + Duration::from_secs(30))
            .expect("window should be saturated");
        assert!(wait <= Duration::from_secs(30));

        // Past the window: the oldest entry expires and admission succeeds.
        assert!(limiter.try_admit(start + Duration::from_secs(61)).is_none());
    }

    #[tokio::test]
    async fn acquire_returns_without_sleep_under_budget() {
        let limiter = RateLimiter::new(3);
        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
