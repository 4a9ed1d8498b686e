use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Injected so limiter behavior is testable without sleeping.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { reset_at_ms: u64 },
}

#[derive(Debug)]
struct WindowEntry {
    window_start_ms: u64,
    count: u32,
}

/// Fixed-window limiter over an explicit arena keyed by
/// `(endpoint, client_key)`. One component owns all of the mutable state;
/// callers only see `check_and_record`.
pub struct RateLimiter {
    window_ms: u64,
    max_requests: u32,
    clock: Arc<dyn Clock>,
    arena: Mutex<HashMap<(String, String), WindowEntry>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            max_requests: max_requests.max(1),
            clock,
            arena: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_and_record(&self, endpoint: &str, client_key: &str) -> Decision {
        let now = self.clock.now_ms();
        let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        let entry = arena
            .entry((endpoint.to_string(), client_key.to_string()))
            .or_insert(WindowEntry {
                window_start_ms: now,
                count: 0,
            });

        if now.saturating_sub(entry.window_start_ms) >= self.window_ms {
            entry.window_start_ms = now;
            entry.count = 0;
        }
        if entry.count >= self.max_requests {
            return Decision::Denied {
                reset_at_ms: entry.window_start_ms + self.window_ms,
            };
        }
        entry.count += 1;
        Decision::Allowed
    }
}
