use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spaces client calls at a fixed rate.
#[derive(Debug)]
pub struct Pacer {
    period: Duration,
    next: Mutex<Option<Instant>>,
}

impl Pacer {
    /// `None` for a non-positive rate or one too small to express as a period.
    pub fn per_second(rate: f64) -> Option<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return None;
        }
        let period = Duration::try_from_secs_f64(1.0 / rate).ok()?;
        Some(Self { period, next: Mutex::new(None) })
    }

    pub fn period(&self) -> Duration { self.period }

    /// Wait for the next slot.
    pub async fn wait(&self) {
        let at = {
            let mut next = self.next.lock().await;
            let now = Instant::now();
            let at = next.map(|n| n.max(now)).unwrap_or(now);
            *next = Some(at.checked_add(self.period).unwrap_or(at));
            at
        };
        tokio::time::sleep_until(at).await;
    }
}
