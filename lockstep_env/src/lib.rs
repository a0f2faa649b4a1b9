//! Lockstep Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" boundary that lets the Lockstep clock
//! kernel run against a real broker and the real wall clock in production,
//! or against an in-process broker and paused tokio time in tests.
//!
//! # What is intercepted
//!
//! - Time (`system_time()`, `sleep()`), see [`RuntimeContext`]
//! - Messaging (`publish()`, `subscribe()`), see [`MessageTransport`]
//! - Clock discipline (NTP offset), see [`ClockOffsetEstimator`]
//!
//! The kernel never touches a socket or a global clock directly, so many
//! kernel instances can share one test binary.
//!
//! # Example
//!
//! ```ignore
//! use lockstep_env::{ClockOffsetEstimator, SntpTimeSource, TokioContext};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let ctx = TokioContext::shared();
//! let estimator = ClockOffsetEstimator::new(Arc::new(SntpTimeSource::default()), ctx.clone());
//! let offset = estimator
//!     .estimate_offset("pool.ntp.org", Duration::from_secs(5), 5)
//!     .await?;
//! ```

mod context;
mod error;
mod offset;
mod tokio_impl;
mod transport;
mod types;

pub use context::RuntimeContext;
pub use error::{EnvError, OffsetError};
pub use offset::{now_corrected, ClockOffsetEstimator, SntpTimeSource, TimeSource};
pub use tokio_impl::TokioContext;
pub use transport::{MessageHandler, MessageTransport};
pub use types::{routing_key_matches, Envelope, SubscriptionId};
