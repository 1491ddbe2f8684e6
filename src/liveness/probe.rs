//! "Last served" stamp shared between the event server and the monitor

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Cheap to clone; all clones observe the same stamp
#[derive(Debug, Clone)]
pub struct LivenessProbe {
    origin: Instant,
    last_served_ms: Arc<AtomicU64>,
    served: Arc<AtomicU64>,
}

impl Default for LivenessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessProbe {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_served_ms: Arc::new(AtomicU64::new(0)),
            served: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record that an inbound call was handled, accepted or not
    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_served_ms.fetch_max(now, Ordering::AcqRel);
        self.served.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of calls handled so far
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Acquire)
    }

    /// Time since the last handled call, or since creation when none was
    pub fn since_last_served(&self) -> Duration {
        let last = Duration::from_millis(self.last_served_ms.load(Ordering::Acquire));
        self.origin.elapsed().saturating_sub(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_age() {
        let probe = LivenessProbe::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(probe.since_last_served(), Duration::from_secs(5));

        let clone = probe.clone();
        clone.touch();
        assert_eq!(probe.since_last_served(), Duration::ZERO);
        assert_eq!(probe.served(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(probe.since_last_served(), Duration::from_secs(2));
    }
}
