//! The manager role: the single clock authority of a scenario.
//!
//! The manager runs its own simulator and drives every managed application
//! by publishing init / start / update / stop commands. Its own time and
//! mode statuses go to `{prefix}.{manager}.{time|mode}`.

use crate::application::Application;
use crate::commands::{CommandHandlers, CommandRelay, ResolvedStart, StatusRoutes};
use crate::config::{secs, ManagerConfig};
use crate::error::{ApplicationError, KernelError};
use crate::mode::Mode;
use crate::schemas::{
    decode_status, InitCommand, ReadyStatus, StartCommand, StopCommand, TestScript, TimeStatus,
    UpdateCommand,
};
use crate::script::TestScriptObserver;
use crate::simulator::ExecutionSummary;
use crate::topics::StatusKind;
use crate::ShutDownObserver;
use chrono::{DateTime, TimeDelta, Utc};
use lockstep_env::Envelope;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Poll interval while waiting for ready statuses or a rescale.
const POLL: Duration = Duration::from_millis(50);

pub struct Manager {
    app: Application,
    config: ManagerConfig,
    relay: CommandRelay,
    handlers: CommandHandlers,
    ready: Arc<Mutex<HashMap<String, bool>>>,
}

impl Manager {
    pub fn new(app: Application, config: ManagerConfig) -> Self {
        let relay = CommandRelay::new(app.transport().clone(), app.topics().clone(), app.name());
        let status = StatusRoutes {
            channel: app.status_channel(),
            time: app.topics().manager_status(app.name(), StatusKind::Time),
            mode: app.topics().manager_status(app.name(), StatusKind::Mode),
            ready: None,
        };
        let mut handlers = CommandHandlers::new(app.simulator().clone(), config.handler_settings())
            .with_status(status)
            .with_relay(relay.clone());
        if config.shut_down_when_terminated {
            handlers = handlers.with_start_observer(Arc::new(ShutDownObserver::new(app.shut_down_hook())));
        }
        Self {
            app,
            config,
            relay,
            handlers,
            ready: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn app(&self) -> &Application {
        &self.app
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Corrects the wallclock and subscribes to ready and time statuses.
    pub async fn start_up(&self) -> Result<TimeDelta, ApplicationError> {
        let offset = self.app.start_up(&self.config.offset).await?;
        let topics = self.app.topics().clone();

        let ready = self.ready.clone();
        let ready_topics = topics.clone();
        self.app.subscribe(
            &topics.all_app_status(StatusKind::Ready),
            Arc::new(move |envelope: &Envelope| {
                let Some(app) = ready_topics.status_app(&envelope.routing_key) else {
                    return;
                };
                match decode_status::<ReadyStatus>(&envelope.payload) {
                    Ok(status) => {
                        let mut ready = ready.lock();
                        if let Some(flag) = ready.get_mut(app) {
                            *flag = status.properties.ready;
                            info!("Application {} ready: {}", app, status.properties.ready);
                        }
                    }
                    Err(e) => error!("Bad ready status from {}: {}", app, e),
                }
            }),
        )?;

        let simulator = self.app.simulator().clone();
        self.app.subscribe(
            &topics.all_app_status(StatusKind::Time),
            Arc::new(move |envelope: &Envelope| {
                let app = topics.status_app(&envelope.routing_key).unwrap_or("?");
                match decode_status::<TimeStatus>(&envelope.payload) {
                    Ok(status) => {
                        let scenario = simulator.time() - status.properties.sim_time;
                        let wallclock = simulator.wallclock_time() - status.properties.time;
                        info!(
                            "Application {} latency: {} ms (scenario), {} ms (wallclock)",
                            app,
                            scenario.num_milliseconds(),
                            wallclock.num_milliseconds()
                        );
                    }
                    Err(e) => error!("Bad time status from {}: {}", app, e),
                }
            }),
        )?;
        Ok(offset)
    }

    /// Names of required applications that have signalled ready.
    pub fn ready_apps(&self) -> Vec<String> {
        let mut apps: Vec<String> = self
            .ready
            .lock()
            .iter()
            .filter(|(_, ready)| **ready)
            .map(|(app, _)| app.clone())
            .collect();
        apps.sort();
        apps
    }

    pub fn all_ready(&self) -> bool {
        self.ready.lock().values().all(|ready| *ready)
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Publishes an init command and starts tracking `required_apps`.
    pub fn init(
        &self,
        sim_start_time: DateTime<Utc>,
        sim_stop_time: DateTime<Utc>,
        required_apps: &[String],
    ) -> Result<(), ApplicationError> {
        {
            let mut ready = self.ready.lock();
            ready.retain(|app, _| required_apps.contains(app));
            for app in required_apps {
                ready.entry(app.clone()).or_insert(false);
            }
        }
        let command = InitCommand {
            sim_start_time,
            sim_stop_time,
            required_apps: required_apps.to_vec(),
        };
        self.handlers.apply_init(&command)?;
        self.relay.send(&command)?;
        Ok(())
    }

    /// Publishes a start command and starts the local simulator.
    pub fn start(&self, command: &StartCommand) -> Result<ResolvedStart, ApplicationError> {
        let resolved = self.handlers.resolve_start(command)?;
        let mode = self.app.simulator().mode();
        if !matches!(mode, Mode::Undefined | Mode::Initialized | Mode::Terminated) {
            return Err(KernelError::IllegalTransition {
                operation: "start",
                mode,
            }
            .into());
        }
        // Everyone starts from the same resolved epoch
        let command = StartCommand {
            start_time: resolved.params.wallclock_epoch,
            sim_start_time: Some(resolved.params.init_time),
            sim_stop_time: Some(resolved.params.init_time + resolved.params.duration),
            ..command.clone()
        };
        self.relay.send(&command)?;
        self.handlers.apply_start(&command)
    }

    /// Publishes a stop command and moves the local end time.
    pub fn stop(&self, sim_stop_time: DateTime<Utc>) -> Result<(), ApplicationError> {
        let command = StopCommand { sim_stop_time };
        self.relay.send(&command)?;
        self.handlers.apply_stop(&command)
    }

    /// Publishes an update command and schedules the local rescale.
    pub fn update(&self, time_scale_factor: f64, sim_update_time: DateTime<Utc>) -> Result<(), ApplicationError> {
        let command = UpdateCommand {
            sim_update_time,
            time_scaling_factor: time_scale_factor,
        };
        self.relay.send(&command)?;
        self.handlers.apply_update(&command)
    }

    /// Registers a script whose commands are applied locally and relayed.
    pub fn test_script(&self, script: TestScript) -> Arc<TestScriptObserver> {
        self.handlers.apply_test_script(script)
    }

    /// Waits for the local execution started by [`Self::start`].
    pub async fn join(&self) -> Result<ExecutionSummary, ApplicationError> {
        match self.handlers.join().await {
            Some(result) => Ok(result?),
            None => Err(ApplicationError::NotStarted(self.app.name().to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Test plan
    // ------------------------------------------------------------------

    /// Runs the configured test plan to completion.
    ///
    /// 1. Issue init until every required application is ready (or the
    ///    retries run out, in which case the plan proceeds anyway).
    /// 2. Issue start `command_lead` ahead of the start time.
    /// 3. Issue each scheduled update `command_lead` ahead of its wallclock
    ///    instant and wait for it to take effect.
    /// 4. Issue stop `command_lead` ahead of the scenario end.
    pub async fn execute_test_plan(&self) -> Result<ExecutionSummary, ApplicationError> {
        let config = &self.config;
        let sim_start_time = config
            .sim_start_time
            .ok_or_else(|| ApplicationError::Config("sim_start_time is required".into()))?;
        let sim_stop_time = config
            .sim_stop_time
            .ok_or_else(|| ApplicationError::Config("sim_stop_time is required".into()))?;
        let simulator = self.app.simulator().clone();
        let lead = config.command_lead();

        self.await_ready(sim_start_time, sim_stop_time).await?;

        let start_time = config
            .start_time
            .unwrap_or_else(|| simulator.wallclock_time() + lead);
        self.sleep_until(start_time - lead, false).await;
        self.start(&StartCommand {
            start_time: Some(start_time),
            sim_start_time: Some(sim_start_time),
            sim_stop_time: Some(sim_stop_time),
            time_scaling_factor: config.time_scale_factor,
            publish_step: Some(secs(config.publish_step_secs)),
            time_status_start_time: config.time_status_init,
        })?;

        for update in &config.time_scale_updates {
            let update_time = simulator.wallclock_time_at_simulation_time(update.sim_update_time);
            self.sleep_until(update_time - lead, true).await;
            if simulator.mode() != Mode::Executing {
                break;
            }
            if let Err(e) = self.update(update.time_scale_factor, update.sim_update_time) {
                warn!("Scheduled update not applied: {}", e);
                continue;
            }
            while simulator.mode() == Mode::Executing
                && simulator.time_scale_factor() != update.time_scale_factor
            {
                simulator.context().sleep(POLL).await;
            }
        }

        let end_time = simulator.wallclock_time_at_simulation_time(simulator.end_time());
        self.sleep_until(end_time - lead, true).await;
        if simulator.mode() == Mode::Executing {
            if let Err(e) = self.stop(sim_stop_time) {
                warn!("Stop not applied: {}", e);
            }
        }

        self.join().await
    }

    async fn await_ready(
        &self,
        sim_start_time: DateTime<Utc>,
        sim_stop_time: DateTime<Utc>,
    ) -> Result<(), ApplicationError> {
        let required = &self.config.required_apps;
        let context = self.app.simulator().context().clone();
        let attempts = self.config.init_max_retry.max(1);

        for attempt in 1..=attempts {
            self.init(sim_start_time, sim_stop_time, required)?;
            if required.is_empty() {
                return Ok(());
            }
            let deadline = context.now() + self.config.init_retry_delay();
            while !self.all_ready() && context.now() < deadline {
                context.sleep(POLL.min(deadline.saturating_sub(context.now()))).await;
            }
            if self.all_ready() {
                info!("All required applications ready");
                return Ok(());
            }
            warn!(
                "Waiting for {:?} (attempt {}/{})",
                required
                    .iter()
                    .filter(|app| !self.ready_apps().contains(app))
                    .collect::<Vec<_>>(),
                attempt,
                attempts
            );
        }
        warn!("Proceeding without every required application");
        Ok(())
    }

    /// Sleeps until wallclock `target`, optionally returning early once the
    /// local run has terminated.
    async fn sleep_until(&self, target: DateTime<Utc>, while_running: bool) {
        let simulator = self.app.simulator();
        loop {
            if while_running && simulator.mode() == Mode::Terminated {
                return;
            }
            let remaining = target - simulator.wallclock_time();
            if remaining <= TimeDelta::zero() {
                return;
            }
            let chunk = remaining.to_std().unwrap_or(Duration::ZERO).min(Duration::from_secs(1));
            simulator.context().sleep(chunk).await;
        }
    }
}
