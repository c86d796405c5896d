//! Fixed-window rate limiting for the credential endpoints, keyed by
//! client network address. Windows live in memory; a periodic sweep
//! bounds the map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Window {
    count: u32,
    reset_at: Instant,
}

pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    limit: u32,
    period: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, period: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            limit,
            period,
        }
    }

    /// Whether a request from `key` is allowed in the current window.
    pub fn allow(&self, key: &str) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();

        match windows.get_mut(key) {
            Some(w) if now < w.reset_at => {
                w.count += 1;
                w.count <= self.limit
            }
            _ => {
                windows.insert(
                    key.to_string(),
                    Window {
                        count: 1,
                        reset_at: now + self.period,
                    },
                );
                true
            }
        }
    }

    /// Drop expired windows. Called periodically from the sweep thread.
    pub fn sweep(&self) {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        windows.retain(|_, w| now < w.reset_at);
    }
}
