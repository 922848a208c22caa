//! Per-account send pacing.
//!
//! Providers throttle per phone number, so consecutive sends on one business
//! account are spaced by `send_delay`. Different accounts never wait on each
//! other.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spaces sends that share a business account.
pub struct SendPacer {
    delay: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl SendPacer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait until `account_id` may send again and reserve the following slot.
    pub async fn acquire(&self, account_id: &str) {
        if self.delay.is_zero() {
            return;
        }

        let wait_until = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots
                .get(account_id)
                .copied()
                .filter(|at| *at > now)
                .unwrap_or(now);
            slots.insert(account_id.to_string(), slot + self.delay);
            slot
        };

        tokio::time::sleep_until(wait_until).await;
    }
}
