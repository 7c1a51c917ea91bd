//! Per-address budget for emergency-stop reset attempts.
//!
//! A reset re-arms the stage, so guessing the bearer token has to be slow:
//! each client address gets `max_attempts` tries per window, counted from
//! its first try in that window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Attempts {
    count: u32,
    window_start: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    attempts: Arc<Mutex<HashMap<IpAddr, Attempts>>>,
    max_attempts: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self { attempts: Arc::new(Mutex::new(HashMap::new())), max_attempts, window }
    }

    /// Spend one attempt for `ip`. False once its budget for the current
    /// window is used up.
    pub async fn check_and_increment(&self, ip: IpAddr) -> bool {
        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let window = self.window;
        // Forget addresses whose window has long passed.
        attempts.retain(|_, a| now.duration_since(a.window_start) <= window * 2);

        let entry = attempts.entry(ip).or_insert(Attempts { count: 0, window_start: now });
        if now.duration_since(entry.window_start) > window {
            *entry = Attempts { count: 0, window_start: now };
        }
        if entry.count >= self.max_attempts {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Addresses currently tracked.
    pub async fn tracked(&self) -> usize {
        self.attempts.lock().await.len()
    }
}
