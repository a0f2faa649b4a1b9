//! Core runtime context trait for Lockstep kernels.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" clock so that the simulation kernel
/// can run in production (tokio + system clock) and in deterministic tests
/// (tokio with paused time).
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
///
/// # Offsets
///
/// `system_time()` is the *uncorrected* local clock. The kernel adds the
/// NTP-derived offset on top (see [`crate::now_corrected`]).
#[async_trait]
pub trait RuntimeContext: Send + Sync + 'static {
    /// Returns the monotonic time elapsed since context creation.
    ///
    /// Used for measuring durations (e.g. how long a run took).
    fn now(&self) -> Duration;

    /// Returns the local wall-clock time.
    fn system_time(&self) -> DateTime<Utc>;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    async fn sleep(&self, duration: Duration);
}
