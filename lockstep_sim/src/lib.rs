//! Lockstep in-process scenario harness
//!
//! Runs a manager and any number of managed applications inside one tokio
//! runtime, connected by [`LocalBroker`] instead of a real message broker.
//! Every participant still owns its own kernel and paces itself from the
//! start command, exactly as separately deployed processes would.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       LocalBroker                        │
//! │        (router task, topic patterns, latency)            │
//! └──────▲─────────────────────▲─────────────────────▲───────┘
//!        │ init/start/          │ ready/time/mode     │
//!        │ update/stop          │ status              │
//!   ┌────┴─────┐          ┌─────┴────┐          ┌─────┴────┐
//!   │ Manager  │          │  app-1   │   ...    │  app-N   │
//!   │ kernel   │          │  kernel  │          │  kernel  │
//!   └──────────┘          └──────────┘          └──────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use lockstep_sim::{ScenarioId, ScenarioRunner};
//!
//! let result = ScenarioRunner::new(3).run(ScenarioId::Rescale).await;
//! assert!(result.passed);
//! ```

pub mod broker;
pub mod runner;
pub mod scenarios;

pub use broker::{BrokerStats, LocalBroker};
pub use runner::{
    AppOutcome, EarlyStop, RunnerError, ScenarioMetrics, ScenarioPlan, ScenarioResult,
    ScenarioRunner, SharedClockSource,
};
pub use scenarios::ScenarioId;
