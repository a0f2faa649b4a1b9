//! Command protocol handlers.
//!
//! [`CommandHandlers`] turns validated init / start / stop / update /
//! test-script commands into kernel transitions. Each handler decodes the
//! whole command before touching the kernel, so a rejected command leaves
//! the simulator unchanged. [`CommandRelay`] is the sending side.

use crate::error::{ApplicationError, KernelError, ValidationError};
use crate::mode::Mode;
use crate::observer::Observer;
use crate::publishers::{ModeStatusPublisher, StatusChannel, TimeStatusPublisher};
use crate::schemas::{
    Command, InitCommand, StartCommand, StopCommand, TestScript, UpdateCommand,
    DEFAULT_PUBLISH_STEP_SECS,
};
use crate::script::TestScriptObserver;
use crate::simulator::{ExecutionHandle, ExecutionParams, ExecutionSummary, Simulator};
use crate::topics::Topics;
use chrono::{DateTime, TimeDelta, Utc};
use lockstep_env::{EnvError, MessageTransport};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// Publishes commands to `{prefix}.{manager}.{command}`.
#[derive(Clone)]
pub struct CommandRelay {
    transport: Arc<dyn MessageTransport>,
    topics: Topics,
    manager: String,
}

impl CommandRelay {
    pub fn new(transport: Arc<dyn MessageTransport>, topics: Topics, manager: impl Into<String>) -> Self {
        Self {
            transport,
            topics,
            manager: manager.into(),
        }
    }

    pub fn send<C: Command>(&self, command: &C) -> Result<(), EnvError> {
        let payload = command
            .encode()
            .map_err(|e| EnvError::SerializationError(e.to_string()))?;
        let routing_key = self.topics.command(&self.manager, C::TOPIC);
        info!("Sending {} command {}", C::TOPIC, payload);
        self.transport.publish(&routing_key, payload)
    }
}

/// Where an application publishes its own status.
#[derive(Clone)]
pub struct StatusRoutes {
    pub channel: StatusChannel,
    pub time: String,
    pub mode: String,
    /// Ready status; `None` for the manager
    pub ready: Option<String>,
}

/// Execution settings not carried by the start command.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSettings {
    /// Scenario time step
    pub time_step: TimeDelta,

    /// When set, the scenario step is `wallclock_step × timeScalingFactor`
    pub wallclock_step: Option<TimeDelta>,

    /// Heartbeat cadence used when the start command has no `publishStep`
    pub time_status_step: Option<TimeDelta>,

    /// First heartbeat point used when the start command has none
    pub time_status_init: Option<DateTime<Utc>>,

    /// Wallclock lead for a start command without `startTime`
    pub start_delay: TimeDelta,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            time_step: TimeDelta::seconds(1),
            wallclock_step: None,
            time_status_step: None,
            time_status_init: None,
            start_delay: TimeDelta::seconds(10),
        }
    }
}

/// Start command with every default resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStart {
    pub params: ExecutionParams,
    pub publish_step: TimeDelta,
    pub time_status_init: DateTime<Utc>,
}

#[derive(Default)]
struct HandlerState {
    bounds: Option<(DateTime<Utc>, DateTime<Utc>)>,
    execution: Option<ExecutionHandle>,
}

/// Applies protocol commands to one simulator.
pub struct CommandHandlers {
    simulator: Arc<Simulator>,
    settings: HandlerSettings,
    status: Option<StatusRoutes>,
    relay: Option<CommandRelay>,
    start_observers: Vec<Arc<dyn Observer<Simulator>>>,
    state: Mutex<HandlerState>,
}

impl CommandHandlers {
    pub fn new(simulator: Arc<Simulator>, settings: HandlerSettings) -> Self {
        Self {
            simulator,
            settings,
            status: None,
            relay: None,
            start_observers: Vec::new(),
            state: Mutex::new(HandlerState::default()),
        }
    }

    /// Publishes heartbeats, mode changes and ready statuses through `status`.
    pub fn with_status(mut self, status: StatusRoutes) -> Self {
        self.status = Some(status);
        self
    }

    /// Relays scripted commands to other applications.
    pub fn with_relay(mut self, relay: CommandRelay) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Attaches `observer` at every start, next to the status publishers.
    ///
    /// The simulator drops its observers when a run terminates.
    pub fn with_start_observer(mut self, observer: Arc<dyn Observer<Simulator>>) -> Self {
        self.start_observers.push(observer);
        self
    }

    pub fn simulator(&self) -> &Arc<Simulator> {
        &self.simulator
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    /// Scenario bounds stored by the last init command.
    pub fn bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.state.lock().bounds
    }

    // ------------------------------------------------------------------
    // Raw bodies
    // ------------------------------------------------------------------

    pub fn init(&self, body: &str) -> Result<InitCommand, ApplicationError> {
        let command = decode::<InitCommand>(body)?;
        self.apply_init(&command)?;
        Ok(command)
    }

    pub fn start(&self, body: &str) -> Result<StartCommand, ApplicationError> {
        let command = decode::<StartCommand>(body)?;
        self.apply_start(&command)?;
        Ok(command)
    }

    pub fn stop(&self, body: &str) -> Result<StopCommand, ApplicationError> {
        let command = decode::<StopCommand>(body)?;
        self.apply_stop(&command)?;
        Ok(command)
    }

    pub fn update(&self, body: &str) -> Result<UpdateCommand, ApplicationError> {
        let command = decode::<UpdateCommand>(body)?;
        self.apply_update(&command)?;
        Ok(command)
    }

    pub fn test_script(&self, body: &str) -> Result<Arc<TestScriptObserver>, ApplicationError> {
        let script = TestScript::decode(body).map_err(|e| {
            warn!("Rejected test script: {}", e);
            e
        })?;
        Ok(self.apply_test_script(script))
    }

    // ------------------------------------------------------------------
    // Typed commands
    // ------------------------------------------------------------------

    /// Stores the scenario bounds for the next start and signals ready.
    pub fn apply_init(&self, command: &InitCommand) -> Result<(), ApplicationError> {
        self.state.lock().bounds = Some((command.sim_start_time, command.sim_stop_time));
        info!(
            "Scenario bounds set to {} .. {}",
            command.sim_start_time, command.sim_stop_time
        );
        if let Some(status) = &self.status {
            if let Some(ready) = &status.ready {
                status.channel.publish_ready(ready)?;
            }
        }
        Ok(())
    }

    /// Fills in every default of a start command.
    pub fn resolve_start(&self, command: &StartCommand) -> Result<ResolvedStart, ValidationError> {
        let bounds = self.bounds();
        let sim_start_time = command
            .sim_start_time
            .or(bounds.map(|b| b.0))
            .ok_or_else(|| ValidationError::new("simStartTime", "required without a prior init"))?;
        let sim_stop_time = command
            .sim_stop_time
            .or(bounds.map(|b| b.1))
            .ok_or_else(|| ValidationError::new("simStopTime", "required without a prior init"))?;
        if sim_stop_time < sim_start_time {
            return Err(ValidationError::new("simStopTime", "precedes simStartTime"));
        }

        let factor = command.time_scaling_factor;
        let time_step = match self.settings.wallclock_step {
            Some(step) => TimeDelta::milliseconds((step.num_milliseconds() as f64 * factor).round() as i64),
            None => self.settings.time_step,
        };
        if time_step <= TimeDelta::zero() {
            return Err(ValidationError::new("timeScalingFactor", "yields a zero time step"));
        }
        let start_time = command
            .start_time
            .unwrap_or_else(|| self.simulator.wallclock_time() + self.settings.start_delay);

        Ok(ResolvedStart {
            params: ExecutionParams::new(sim_start_time, sim_stop_time - sim_start_time, time_step)
                .with_wallclock_epoch(start_time)
                .with_time_scale_factor(factor),
            publish_step: command
                .publish_step
                .or(self.settings.time_status_step)
                .unwrap_or(TimeDelta::seconds(DEFAULT_PUBLISH_STEP_SECS)),
            time_status_init: command
                .time_status_start_time
                .or(self.settings.time_status_init)
                .unwrap_or(sim_start_time),
        })
    }

    /// Attaches status publishers, initializes the simulator and spawns
    /// execution in the background.
    ///
    /// The simulator is INITIALIZED (or further) when this returns.
    pub fn apply_start(&self, command: &StartCommand) -> Result<ResolvedStart, ApplicationError> {
        let resolved = self.resolve_start(command)?;
        let mode = self.simulator.mode();
        if !matches!(mode, Mode::Undefined | Mode::Initialized | Mode::Terminated) {
            warn!("Rejected start: simulator is {}", mode);
            return Err(KernelError::IllegalTransition {
                operation: "start",
                mode,
            }
            .into());
        }

        if let Some(status) = &self.status {
            self.simulator.add_observer(Arc::new(TimeStatusPublisher::new(
                status.channel.clone(),
                status.time.clone(),
                Some(resolved.publish_step),
                Some(resolved.time_status_init),
            )));
            self.simulator.add_observer(Arc::new(ModeStatusPublisher::new(
                status.channel.clone(),
                status.mode.clone(),
            )));
        }
        for observer in &self.start_observers {
            self.simulator.add_observer(observer.clone());
        }

        let params = &resolved.params;
        if mode != Mode::Initialized {
            self.simulator
                .initialize(params.init_time, params.wallclock_epoch, params.time_scale_factor)?;
        }
        info!(
            "Starting execution from {} for {} s (scale {})",
            params.init_time,
            params.duration.num_seconds(),
            params.time_scale_factor
        );
        let handle = self.simulator.spawn_execute(resolved.params.clone());
        self.state.lock().execution = Some(handle);
        Ok(resolved)
    }

    pub fn apply_stop(&self, command: &StopCommand) -> Result<(), ApplicationError> {
        info!("Stop requested at {}", command.sim_stop_time);
        self.simulator.set_end_time(command.sim_stop_time)?;
        Ok(())
    }

    pub fn apply_update(&self, command: &UpdateCommand) -> Result<(), ApplicationError> {
        info!(
            "Update requested: scale {} at {}",
            command.time_scaling_factor, command.sim_update_time
        );
        self.simulator
            .set_time_scale_factor(command.time_scaling_factor, Some(command.sim_update_time))?;
        Ok(())
    }

    /// Registers a script observer on the simulator.
    pub fn apply_test_script(&self, script: TestScript) -> Arc<TestScriptObserver> {
        info!("Registering test script with {} entries", script.entries.len());
        let observer = match &self.relay {
            Some(relay) => TestScriptObserver::with_relay(script, relay.clone()),
            None => TestScriptObserver::new(script),
        };
        self.simulator.add_observer(observer.clone());
        observer
    }

    /// Returns true while a spawned execution is still running.
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .execution
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Waits for the spawned execution, if any.
    pub async fn join(&self) -> Option<Result<ExecutionSummary, KernelError>> {
        let handle = self.state.lock().execution.take()?;
        Some(handle.join().await)
    }
}

fn decode<C: Command>(body: &str) -> Result<C, ValidationError> {
    C::decode(body).map_err(|e| {
        warn!("Rejected {} command: {}", C::TOPIC, e);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackTransport;
    use chrono::TimeZone;
    use lockstep_env::TokioContext;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn handlers() -> (CommandHandlers, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let status = StatusRoutes {
            channel: StatusChannel::new(transport.clone(), "sat", None),
            time: "p.status.sat.time".into(),
            mode: "p.status.sat.mode".into(),
            ready: Some("p.status.sat.ready".into()),
        };
        let simulator = Simulator::shared(TokioContext::shared());
        let handlers = CommandHandlers::new(simulator, HandlerSettings::default()).with_status(status);
        (handlers, transport)
    }

    #[tokio::test]
    async fn test_init_stores_bounds_and_signals_ready() {
        let (handlers, transport) = handlers();
        handlers
            .init(r#"{"taskingParameters":{"simStartTime":"2024-01-01T00:00:00Z","simStopTime":"2024-01-01T00:00:10Z"}}"#)
            .unwrap();

        assert_eq!(handlers.bounds(), Some((t0(), t0() + TimeDelta::seconds(10))));
        assert_eq!(handlers.simulator().mode(), Mode::Undefined);
        let ready = transport.payloads("p.status.sat.ready");
        assert_eq!(ready[0]["properties"]["ready"], true);
    }

    #[tokio::test]
    async fn test_invalid_start_changes_nothing() {
        let (handlers, transport) = handlers();
        let err = handlers
            .start(r#"{"simStartTime":"2024-01-01T00:00:00Z","simStopTime":"2024-01-01T00:00:10Z","timeScalingFactor":"fast"}"#)
            .unwrap_err();

        assert!(matches!(err, ApplicationError::Validation(ref v) if v.field == "timeScalingFactor"));
        assert_eq!(handlers.simulator().mode(), Mode::Undefined);
        assert_eq!(handlers.simulator().observer_count(), 0);
        assert!(transport.published().is_empty());
        assert!(!handlers.is_running());
    }

    #[tokio::test]
    async fn test_start_requires_bounds() {
        let (handlers, _) = handlers();
        let err = handlers.start(r#"{"timeScalingFactor":2}"#).unwrap_err();
        assert!(matches!(err, ApplicationError::Validation(ref v) if v.field == "simStartTime"));
    }

    #[tokio::test]
    async fn test_resolve_start_defaults() {
        let (handlers, _) = handlers();
        handlers
            .init(r#"{"simStartTime":"2024-01-01T00:00:00Z","simStopTime":"2024-01-01T01:00:00Z"}"#)
            .unwrap();
        let before = handlers.simulator().wallclock_time();
        let resolved = handlers
            .resolve_start(&StartCommand::decode(r#"{"timeScalingFactor":60}"#).unwrap())
            .unwrap();

        assert_eq!(resolved.params.init_time, t0());
        assert_eq!(resolved.params.duration, TimeDelta::hours(1));
        assert_eq!(resolved.publish_step, TimeDelta::seconds(21_600));
        assert_eq!(resolved.time_status_init, t0());
        let epoch = resolved.params.wallclock_epoch.unwrap();
        assert!(epoch >= before + TimeDelta::seconds(10));
    }

    #[tokio::test]
    async fn test_wallclock_step_scales_time_step() {
        let simulator = Simulator::shared(TokioContext::shared());
        let settings = HandlerSettings {
            wallclock_step: Some(TimeDelta::seconds(2)),
            ..HandlerSettings::default()
        };
        let handlers = CommandHandlers::new(simulator, settings);
        let resolved = handlers
            .resolve_start(
                &StartCommand::decode(r#"{"simStartTime":"2024-01-01T00:00:00Z","simStopTime":"2024-01-01T00:10:00Z","timeScalingFactor":30}"#)
                    .unwrap(),
            )
            .unwrap();
        assert_eq!(resolved.params.time_step, TimeDelta::seconds(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_in_background_and_accepts_stop() {
        let (handlers, transport) = handlers();
        let now = handlers.simulator().wallclock_time();
        let start = format!(
            r#"{{"taskingParameters":{{"startTime":"{}","simStartTime":"2024-01-01T00:00:00Z","simStopTime":"2024-01-01T00:01:00Z","timeScalingFactor":10,"publishStep":10}}}}"#,
            now.to_rfc3339()
        );
        handlers.start(&start).unwrap();
        handlers.simulator().wait_for_mode(Mode::Executing).await;
        assert!(handlers.is_running());

        // Second start while executing is rejected
        assert!(matches!(
            handlers.start(&start),
            Err(ApplicationError::Kernel(KernelError::IllegalTransition { .. }))
        ));

        handlers
            .stop(r#"{"taskingParameters":{"simStopTime":"2024-01-01T00:00:20Z"}}"#)
            .unwrap();
        let summary = handlers.join().await.unwrap().unwrap();

        assert_eq!(summary.final_time, t0() + TimeDelta::seconds(20));
        assert!(!transport.payloads("p.status.sat.time").is_empty());
        let modes = transport.payloads("p.status.sat.mode");
        assert_eq!(modes.last().unwrap()["properties"]["mode"], "TERMINATED");
    }

    #[tokio::test]
    async fn test_stop_and_update_rejected_when_idle() {
        let (handlers, _) = handlers();
        assert!(matches!(
            handlers.stop(r#"{"simStopTime":"2024-01-01T00:00:20Z"}"#),
            Err(ApplicationError::Kernel(_))
        ));
        assert!(matches!(
            handlers.update(r#"{"simUpdateTime":"2024-01-01T00:00:20Z","timeScalingFactor":0}"#),
            Err(ApplicationError::Validation(_))
        ));
    }
}
