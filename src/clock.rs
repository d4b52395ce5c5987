use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;

/// Wall-clock time derived from the tokio monotonic clock, so that timer
/// waits and recorded timestamps agree even when tokio time is paused.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    started_mono: Instant,
    started_wall: DateTime<Utc>,
}

impl Clock {
    pub fn start() -> Self {
        Self::anchored_at(Utc::now())
    }

    pub fn anchored_at(wall: DateTime<Utc>) -> Self {
        Self {
            started_mono: Instant::now(),
            started_wall: wall,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.started_mono.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.started_wall + elapsed
    }

    /// Monotonic deadline matching a wall-clock instant; past instants map
    /// to "now".
    pub fn deadline_for(&self, at: DateTime<Utc>) -> Instant {
        let wait = (at - self.now()).to_std().unwrap_or_default();
        Instant::now() + wait
    }
}
