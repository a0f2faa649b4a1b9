//! Production implementation of RuntimeContext using Tokio.

use crate::RuntimeContext;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Production context backed by Tokio.
///
/// Wall-clock time is anchored once at construction and then advanced by the
/// tokio monotonic clock. This keeps scenario pacing immune to system clock
/// steps during a run, and lets `#[tokio::test(start_paused = true)]` drive
/// the wall clock deterministically.
pub struct TokioContext {
    /// Monotonic anchor
    start: Instant,

    /// Wall-clock time at `start`
    epoch: DateTime<Utc>,
}

impl TokioContext {
    /// Creates a new TokioContext anchored at the current system time.
    pub fn new() -> Self {
        Self::with_epoch(Utc::now())
    }

    /// Creates a context whose wall clock reads `epoch` right now.
    pub fn with_epoch(epoch: DateTime<Utc>) -> Self {
        Self {
            start: Instant::now(),
            epoch,
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.now()).unwrap_or(TimeDelta::MAX);
        self.epoch
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wallclock_follows_paused_time() {
        let epoch = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ctx = TokioContext::with_epoch(epoch);

        assert_eq!(ctx.system_time(), epoch);

        ctx.sleep(Duration::from_secs(90)).await;
        assert_eq!(ctx.system_time(), epoch + TimeDelta::seconds(90));
    }
}
