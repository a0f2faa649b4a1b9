//! Lockstep Core - scenario clock kernel and coordination protocol
//!
//! Keeps independently deployed simulation participants in lockstep using
//! nothing but publish/subscribe messages:
//!
//! 1. **Kernel**: [`Simulator`] advances scenario time with a two-phase
//!    tick/tock barrier and paces it against the corrected wallclock, with
//!    rescaling at scheduled scenario times.
//! 2. **Notifier**: [`Observable`] / [`Observer`] broadcast committed changes
//!    in-process.
//! 3. **Protocol**: [`CommandHandlers`] apply init / start / stop / update /
//!    test-script commands; publishers turn kernel changes into heartbeats.
//! 4. **Roles**: [`Manager`] drives a test plan, [`ManagedApplication`]
//!    follows it.
//!
//! # Example
//!
//! ```ignore
//! use lockstep_core::{ExecutionParams, Simulator};
//! use lockstep_env::TokioContext;
//! use chrono::{TimeDelta, Utc};
//!
//! let sim = Simulator::shared(TokioContext::shared());
//! let params = ExecutionParams::new(Utc::now(), TimeDelta::seconds(10), TimeDelta::seconds(1))
//!     .with_time_scale_factor(2.0);
//! let summary = sim.execute(params).await?;
//! assert_eq!(summary.tocks, 10);
//! ```

pub mod application;
pub mod clock;
pub mod commands;
pub mod config;
pub mod entity;
pub mod error;
pub mod managed;
pub mod manager;
pub mod mode;
pub mod observer;
pub mod publishers;
pub mod schemas;
pub mod script;
pub mod simulator;
pub mod topics;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use application::Application;
pub use clock::ClockState;
pub use commands::{CommandHandlers, CommandRelay, HandlerSettings, ResolvedStart, StatusRoutes};
pub use config::{
    secs, ConnectionConfig, ExecConfig, ManagedConfig, ManagerConfig, OffsetMode, OffsetPolicy,
    TimeScaleUpdate,
};
pub use entity::{ClockEntity, Entity, EntityError, SharedEntity};
pub use error::{ApplicationError, KernelError, ValidationError};
pub use managed::ManagedApplication;
pub use manager::Manager;
pub use mode::Mode;
pub use observer::{Observable, Observer, Property, PropertyChange, PropertyValue, RecordingObserver};
pub use publishers::{
    IntervalClock, IntervalPublisher, ModeStatusPublisher, ShutDownObserver, StatusChannel,
    TimeStatusPublisher,
};
pub use schemas::{
    Command, InitCommand, ModeStatus, ReadyStatus, ScriptAction, ScriptEntry, StartCommand,
    StopCommand, TestScript, TimeStatus, UpdateCommand,
};
pub use script::TestScriptObserver;
pub use simulator::{ExecutionHandle, ExecutionParams, ExecutionSummary, Simulator};
pub use topics::{StatusKind, Topics};
