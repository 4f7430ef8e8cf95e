use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

/// Minimum spacing between request starts for one client.
///
/// Each caller reserves the next slot while holding the lock and sleeps after
/// releasing it, so concurrent callers queue up in order and none of them
/// waits for an earlier request to finish.
#[derive(Clone, Debug)]
pub struct RequestThrottle {
    interval: Duration,
    next_allowed: Arc<Mutex<Option<Instant>>>,
}

impl RequestThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_allowed: Arc::new(Mutex::new(None)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for this caller's slot. The first call never waits.
    pub async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }

        let mut next_allowed = self.next_allowed.lock().await;
        let now = Instant::now();
        let wait_until = match *next_allowed {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        *next_allowed = Some(wait_until + self.interval);
        drop(next_allowed);

        let sleep_duration = wait_until.saturating_duration_since(now);
        if !sleep_duration.is_zero() {
            sleep(sleep_duration).await;
        }
    }
}
