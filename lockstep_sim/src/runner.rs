//! Scenario runner - executes a manager and its managed applications
//! over an in-process broker.

use crate::broker::LocalBroker;
use crate::scenarios::ScenarioId;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use lockstep_core::{
    secs, ApplicationError, Application, ExecConfig, ManagedApplication, Manager, Mode,
    OffsetMode, OffsetPolicy, ScriptAction, ScriptEntry, StopCommand, TestScript,
    TimeScaleUpdate, UpdateCommand,
};
use lockstep_env::{EnvError, RuntimeContext, TimeSource, TokioContext};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Poll interval of the early-stop watcher.
const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Invalid scenario: {0}")]
    InvalidPlan(String),

    #[error(transparent)]
    Application(#[from] ApplicationError),
}

/// Time source for applications sharing one process clock.
///
/// Every participant reads the same clock, so the offset is always zero;
/// the estimator path is still exercised end to end.
#[derive(Debug, Default)]
pub struct SharedClockSource {
    queries: AtomicU64,
}

impl SharedClockSource {
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimeSource for SharedClockSource {
    async fn query_offset(&self, _host: &str) -> Result<TimeDelta, EnvError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(TimeDelta::zero())
    }
}

/// A manager-side stop issued once the manager reaches `at`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EarlyStop {
    pub at: DateTime<Utc>,
    pub sim_stop_time: DateTime<Utc>,
}

/// Everything needed to run one scenario and judge it.
#[derive(Debug, Clone)]
pub struct ScenarioPlan {
    pub name: String,
    pub config: ExecConfig,
    pub script: Option<TestScript>,
    pub early_stop: Option<EarlyStop>,

    /// Scenario time every kernel must terminate at
    pub expected_end: DateTime<Utc>,

    /// Time scale factor every kernel must end with
    pub expected_factor: f64,
}

/// 2024-01-01T00:00:00Z
fn scenario_start() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(1_704_067_200)
}

impl ScenarioPlan {
    /// Builds the plan of a named scenario for `apps` managed applications.
    pub fn for_scenario(scenario: ScenarioId, apps: usize) -> Self {
        let t0 = scenario_start();
        let mut config = ExecConfig::default();
        let manager = &mut config.manager;
        manager.sim_start_time = Some(t0);
        manager.command_lead_secs = 0.5;
        manager.init_retry_delay_secs = 1.0;
        manager.time_status_step_secs = Some(10.0);
        manager.publish_step_secs = 10.0;
        manager.required_apps = (1..=apps).map(|i| format!("app-{}", i)).collect();
        config.managed.time_status_step_secs = Some(10.0);

        let mut script = None;
        let mut early_stop = None;
        let (expected_end, expected_factor) = match scenario {
            ScenarioId::Nominal => {
                manager.sim_stop_time = Some(t0 + secs(60.0));
                manager.time_scale_factor = 30.0;
                (t0 + secs(60.0), 30.0)
            }
            ScenarioId::Rescale => {
                manager.sim_stop_time = Some(t0 + secs(60.0));
                manager.time_scale_factor = 20.0;
                manager.time_scale_updates = vec![TimeScaleUpdate {
                    sim_update_time: t0 + secs(30.0),
                    time_scale_factor: 60.0,
                }];
                (t0 + secs(60.0), 60.0)
            }
            ScenarioId::EarlyStop => {
                manager.sim_stop_time = Some(t0 + secs(120.0));
                manager.time_scale_factor = 30.0;
                early_stop = Some(EarlyStop {
                    at: t0 + secs(25.0),
                    sim_stop_time: t0 + secs(40.0),
                });
                (t0 + secs(40.0), 30.0)
            }
            ScenarioId::Scripted => {
                manager.sim_stop_time = Some(t0 + secs(90.0));
                manager.time_scale_factor = 20.0;
                // Triggers lead their effect so relayed commands arrive in time
                script = Some(TestScript {
                    entries: vec![
                        ScriptEntry {
                            action: ScriptAction::Update(UpdateCommand {
                                sim_update_time: t0 + secs(20.0),
                                time_scaling_factor: 60.0,
                            }),
                            trigger_time: t0 + secs(15.0),
                        },
                        ScriptEntry {
                            action: ScriptAction::Stop(StopCommand {
                                sim_stop_time: t0 + secs(50.0),
                            }),
                            trigger_time: t0 + secs(40.0),
                        },
                    ],
                });
                (t0 + secs(50.0), 60.0)
            }
        };

        Self {
            name: scenario.name().to_string(),
            config,
            script,
            early_stop,
            expected_end,
            expected_factor,
        }
    }

    /// Builds a plan from a configuration file's test plan.
    ///
    /// When no required applications are configured, `apps` managed
    /// applications named `app-1..` are created and required.
    pub fn from_config(mut config: ExecConfig, apps: usize) -> Result<Self, RunnerError> {
        config.validate()?;
        let manager = &mut config.manager;
        let expected_end = manager
            .sim_stop_time
            .ok_or_else(|| RunnerError::InvalidPlan("manager.sim_stop_time is required".into()))?;
        if manager.sim_start_time.is_none() {
            return Err(RunnerError::InvalidPlan("manager.sim_start_time is required".into()));
        }
        if manager.required_apps.is_empty() {
            manager.required_apps = (1..=apps).map(|i| format!("app-{}", i)).collect();
        }
        let expected_factor = manager
            .time_scale_updates
            .iter()
            .filter(|u| u.sim_update_time < expected_end)
            .max_by_key(|u| u.sim_update_time)
            .map_or(manager.time_scale_factor, |u| u.time_scale_factor);
        Ok(Self {
            name: "config".to_string(),
            config,
            script: None,
            early_stop: None,
            expected_end,
            expected_factor,
        })
    }

    pub fn app_names(&self) -> &[String] {
        &self.config.manager.required_apps
    }

    fn seconds_from_start(&self, time: DateTime<Utc>) -> f64 {
        let start = self.config.manager.sim_start_time.unwrap_or(time);
        (time - start).num_milliseconds() as f64 / 1000.0
    }
}

/// Outcome for one managed application.
#[derive(Debug, Clone, Serialize)]
pub struct AppOutcome {
    pub name: String,
    pub final_time_secs: Option<f64>,
    pub time_scale_factor: f64,
    pub tocks: u64,
    pub error: Option<String>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Messages published on the broker
    pub messages_published: u64,

    /// Handler invocations on the broker
    pub messages_delivered: u64,

    /// Manager steps committed
    pub manager_tocks: u64,

    /// Wallclock between the manager's epoch and its termination
    pub wallclock_elapsed_ms: i64,

    /// Offset queries answered at start-up
    pub offset_queries: u64,
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: String,

    /// Whether every kernel ended where the plan says
    pub passed: bool,

    pub expected_end_secs: f64,
    pub manager_final_secs: Option<f64>,
    pub ready_apps: Vec<String>,
    pub apps: Vec<AppOutcome>,

    /// Failure message if any
    pub failure_reason: Option<String>,

    pub metrics: ScenarioMetrics,
}

/// Runs scenarios.
pub struct ScenarioRunner {
    /// Number of managed applications
    num_apps: usize,

    /// Broker delivery latency
    latency: Duration,

    /// SNTP host to correct wallclocks against; `None` shares the process clock
    sntp_host: Option<String>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(num_apps: usize) -> Self {
        Self {
            num_apps: num_apps.max(1),
            latency: Duration::ZERO,
            sntp_host: None,
        }
    }

    /// Sets the broker delivery latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Corrects every application against a real SNTP server.
    pub fn with_sntp_host(mut self, host: impl Into<String>) -> Self {
        self.sntp_host = Some(host.into());
        self
    }

    pub fn num_apps(&self) -> usize {
        self.num_apps
    }

    /// Runs a named scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} ({})", scenario.name(), scenario.description());
        self.run_plan(ScenarioPlan::for_scenario(scenario, self.num_apps)).await
    }

    /// Runs an arbitrary plan and returns the result.
    pub async fn run_plan(&self, plan: ScenarioPlan) -> ScenarioResult {
        let broker = Arc::new(LocalBroker::with_latency(self.latency));
        let context = TokioContext::shared();
        let clock = Arc::new(SharedClockSource::default());
        let prefix = plan.config.prefix.clone();

        let build = |name: &str| {
            let app = Application::new(name, prefix.clone(), broker.clone(), context.clone());
            match &self.sntp_host {
                Some(_) => app,
                None => app.with_time_source(clock.clone()),
            }
        };
        let offset = match &self.sntp_host {
            Some(host) => OffsetPolicy {
                host: host.clone(),
                ..OffsetPolicy::default()
            },
            None => OffsetPolicy {
                mode: OffsetMode::BestEffort,
                retry_delay_secs: 0.0,
                max_retries: 1,
                ..OffsetPolicy::default()
            },
        };

        let mut failures = Vec::new();

        let mut managed = Vec::new();
        for name in plan.app_names() {
            let mut config = plan.config.managed.clone();
            config.manager = plan.config.manager.name.clone();
            config.offset = offset.clone();
            let app = ManagedApplication::new(build(name), config);
            if let Err(e) = app.start_up().await {
                failures.push(format!("{}: start-up failed: {}", name, e));
            }
            managed.push(app);
        }

        let mut manager_config = plan.config.manager.clone();
        manager_config.offset = offset;
        let manager_app = build(&manager_config.name);
        let manager_app = match &manager_config.description {
            Some(description) => manager_app.with_description(description.clone()),
            None => manager_app,
        };
        let manager = Manager::new(manager_app, manager_config);
        if let Err(e) = manager.start_up().await {
            failures.push(format!("manager start-up failed: {}", e));
        }
        if let Some(script) = &plan.script {
            manager.test_script(script.clone());
        }

        let (outcome, ()) = tokio::join!(
            manager.execute_test_plan(),
            stop_early(&manager, plan.early_stop)
        );

        let mut metrics = ScenarioMetrics::default();
        let manager_final = match outcome {
            Ok(summary) => {
                metrics.manager_tocks = summary.tocks;
                metrics.wallclock_elapsed_ms = summary.wallclock_elapsed.num_milliseconds();
                if summary.final_time != plan.expected_end {
                    failures.push(format!(
                        "manager ended at {} s, expected {} s",
                        plan.seconds_from_start(summary.final_time),
                        plan.seconds_from_start(plan.expected_end)
                    ));
                }
                Some(plan.seconds_from_start(summary.final_time))
            }
            Err(e) => {
                failures.push(format!("manager: {}", e));
                None
            }
        };

        let mut apps = Vec::new();
        for app in &managed {
            apps.push(judge(&plan, app, &mut failures).await);
        }

        let ready_apps = manager.ready_apps();
        if ready_apps.len() != plan.app_names().len() {
            failures.push(format!(
                "{} of {} applications signalled ready",
                ready_apps.len(),
                plan.app_names().len()
            ));
        }

        broker.flush().await;
        for app in &managed {
            app.shut_down();
        }
        manager.app().shut_down();

        metrics.messages_published = broker.stats().published();
        metrics.messages_delivered = broker.stats().delivered();
        metrics.offset_queries = clock.queries();
        debug!("{} leftover subscriptions", broker.subscription_count());

        let passed = failures.is_empty();
        if !passed {
            warn!("Scenario {} failed: {}", plan.name, failures.join("; "));
        }
        ScenarioResult {
            scenario: plan.name.clone(),
            passed,
            expected_end_secs: plan.seconds_from_start(plan.expected_end),
            manager_final_secs: manager_final,
            ready_apps,
            apps,
            failure_reason: (!passed).then(|| failures.join("; ")),
            metrics,
        }
    }
}

async fn judge(plan: &ScenarioPlan, app: &ManagedApplication, failures: &mut Vec<String>) -> AppOutcome {
    let name = app.app().name().to_string();
    let simulator = app.simulator();
    let mut outcome = AppOutcome {
        name: name.clone(),
        final_time_secs: None,
        time_scale_factor: simulator.time_scale_factor(),
        tocks: 0,
        error: None,
    };

    match app.join().await {
        Ok(summary) => {
            outcome.tocks = summary.tocks;
            outcome.final_time_secs = Some(plan.seconds_from_start(summary.final_time));
            outcome.time_scale_factor = simulator.time_scale_factor();
            if summary.final_time != plan.expected_end {
                failures.push(format!(
                    "{} ended at {} s, expected {} s",
                    name,
                    plan.seconds_from_start(summary.final_time),
                    plan.seconds_from_start(plan.expected_end)
                ));
            }
            if outcome.time_scale_factor != plan.expected_factor {
                failures.push(format!(
                    "{} ended at scale {}, expected {}",
                    name, outcome.time_scale_factor, plan.expected_factor
                ));
            }
            if simulator.mode() != Mode::Terminated {
                failures.push(format!("{} is {}", name, simulator.mode()));
            }
        }
        Err(e) => {
            failures.push(format!("{}: {}", name, e));
            outcome.error = Some(e.to_string());
        }
    }
    outcome
}

/// Stops the run early once the manager reaches `early.at`.
async fn stop_early(manager: &Manager, early: Option<EarlyStop>) {
    let Some(early) = early else {
        return;
    };
    let simulator = manager.app().simulator().clone();
    loop {
        match simulator.mode() {
            Mode::Terminated => return,
            Mode::Executing if simulator.time() >= early.at => {
                info!("Stopping early at {}", early.sim_stop_time);
                if let Err(e) = manager.stop(early.sim_stop_time) {
                    warn!("Early stop not applied: {}", e);
                }
                return;
            }
            _ => simulator.context().sleep(POLL).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_nominal_two_apps() {
        let result = ScenarioRunner::new(2).run(ScenarioId::Nominal).await;

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.manager_final_secs, Some(60.0));
        assert_eq!(result.ready_apps, vec!["app-1".to_string(), "app-2".to_string()]);
        for app in &result.apps {
            assert_eq!(app.final_time_secs, Some(60.0));
            assert_eq!(app.tocks, 60);
        }
        // 60 s at scale 30
        assert!((result.metrics.wallclock_elapsed_ms - 2_000).abs() <= 50);
        assert_eq!(result.metrics.offset_queries, 3);
        assert!(result.metrics.messages_delivered > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescale() {
        let result = ScenarioRunner::new(3).run(ScenarioId::Rescale).await;

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.apps.iter().all(|a| a.time_scale_factor == 60.0));
        // 30 s at scale 20, then 30 s at scale 60
        assert!((result.metrics.wallclock_elapsed_ms - 2_000).abs() <= 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_stop() {
        let result = ScenarioRunner::new(2).run(ScenarioId::EarlyStop).await;

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.manager_final_secs, Some(40.0));
        assert!(result.apps.iter().all(|a| a.final_time_secs == Some(40.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted() {
        let result = ScenarioRunner::new(2).run(ScenarioId::Scripted).await;

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result
            .apps
            .iter()
            .all(|a| a.final_time_secs == Some(50.0) && a.time_scale_factor == 60.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_latency_is_tolerated() {
        let result = ScenarioRunner::new(2)
            .with_latency(Duration::from_millis(100))
            .run(ScenarioId::EarlyStop)
            .await;

        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_plan_from_config() {
        let config = ExecConfig::from_json_str(
            r#"{
                "manager": {
                    "sim_start_time": "2024-01-01T00:00:00Z",
                    "sim_stop_time": "2024-01-01T00:01:00Z",
                    "time_scale_factor": 10.0,
                    "time_scale_updates": [
                        {"sim_update_time": "2024-01-01T00:00:20Z", "time_scale_factor": 20.0},
                        {"sim_update_time": "2024-01-01T00:00:40Z", "time_scale_factor": 40.0}
                    ]
                }
            }"#,
        )
        .unwrap();
        let plan = ScenarioPlan::from_config(config, 3).unwrap();

        assert_eq!(plan.expected_factor, 40.0);
        assert_eq!(plan.app_names().len(), 3);
        assert_eq!(plan.seconds_from_start(plan.expected_end), 60.0);
    }

    #[test]
    fn test_plan_from_config_requires_bounds() {
        let plan = ScenarioPlan::from_config(ExecConfig::default(), 1);
        assert!(matches!(plan, Err(RunnerError::InvalidPlan(_))));
    }
}
