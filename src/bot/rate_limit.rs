//! Per-user add-rate limiter: at most `MAX_ADDS_PER_HOUR` successful adds
//! per user in any trailing sixty minutes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const MAX_ADDS_PER_HOUR: usize = 5;
const WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Default)]
pub struct RateLimiter {
    history: Mutex<HashMap<i64, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `user_id` may add another domain right now, and how many
    /// remain in the current window either way.
    pub fn check(&self, user_id: i64) -> (bool, usize) {
        let mut history = self.history.lock();
        let entries = history.entry(user_id).or_default();
        entries.retain(|t| t.elapsed() < WINDOW);
        let used = entries.len();
        (used < MAX_ADDS_PER_HOUR, MAX_ADDS_PER_HOUR.saturating_sub(used))
    }

    /// Record a successful add for `user_id`.
    pub fn record(&self, user_id: i64) {
        let mut history = self.history.lock();
        let entries = history.entry(user_id).or_default();
        entries.retain(|t| t.elapsed() < WINDOW);
        entries.push(Instant::now());
    }
}
