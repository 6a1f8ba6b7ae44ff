use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;

/// Last rate-limit headers seen from the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSnapshot {
    pub remaining: i64,
    /// Epoch seconds.
    pub reset_at: i64,
}

impl RateSnapshot {
    pub fn reset_time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.reset_at, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Process-wide gate in front of every API call.
///
/// The mutex is held for the whole wait, so once the budget is seen as
/// exhausted every caller queues behind the first one until the reset.
#[derive(Clone, Default)]
pub struct RateGate {
    state: Arc<Mutex<Option<RateSnapshot>>>,
}

impl RateGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        let Some(snapshot) = *state else {
            return;
        };
        if snapshot.remaining > 1 {
            return;
        }
        let now = Utc::now().timestamp();
        if snapshot.reset_at > now {
            let wait = Duration::from_secs((snapshot.reset_at - now) as u64 + 1);
            log::warn!(
                "Rate limit nearly exhausted ({} left); sleeping {:?} until {}",
                snapshot.remaining,
                wait,
                snapshot.reset_time()
            );
            tokio::time::sleep(wait).await;
        }
        // The window has rolled over; the next response reports the new budget.
        *state = None;
    }

    /// Records the headers of a response. Missing headers leave the state alone.
    pub async fn observe(&self, remaining: Option<i64>, reset_at: Option<i64>) {
        if let (Some(remaining), Some(reset_at)) = (remaining, reset_at) {
            *self.state.lock().await = Some(RateSnapshot {
                remaining,
                reset_at,
            });
        }
    }

    pub async fn snapshot(&self) -> Option<RateSnapshot> {
        *self.state.lock().await
    }
}
