//! Configuration for the application roles.
//!
//! Plain serde structs with defaults. Nothing here is global: every
//! application receives its configuration explicitly, so any number of
//! them can coexist in one process. Durations are stored as seconds.

use crate::commands::HandlerSettings;
use crate::error::ApplicationError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Converts fractional seconds to a [`TimeDelta`] at millisecond precision.
pub fn secs(seconds: f64) -> TimeDelta {
    TimeDelta::milliseconds((seconds * 1000.0).round() as i64)
}

/// Broker connection settings, handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            tls: false,
            username: None,
            password: None,
        }
    }
}

/// What to do about the wallclock offset at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetMode {
    /// Never query a time source
    Skip,
    /// Query; on failure log and run uncorrected
    #[default]
    BestEffort,
    /// Query; on failure abort start-up
    Required,
}

/// Clock offset policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetPolicy {
    pub mode: OffsetMode,
    /// NTP host
    pub host: String,
    pub retry_delay_secs: f64,
    /// Total number of attempts
    pub max_retries: u32,
}

impl OffsetPolicy {
    pub fn skip() -> Self {
        Self {
            mode: OffsetMode::Skip,
            ..Self::default()
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs.max(0.0))
    }
}

impl Default for OffsetPolicy {
    fn default() -> Self {
        Self {
            mode: OffsetMode::BestEffort,
            host: "pool.ntp.org".to_string(),
            retry_delay_secs: 5.0,
            max_retries: 5,
        }
    }
}

/// A time scale change scheduled by the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeScaleUpdate {
    pub sim_update_time: DateTime<Utc>,
    pub time_scale_factor: f64,
}

/// Test plan and behavior of the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Manager application name (topic word)
    pub name: String,
    pub description: Option<String>,

    /// Scenario start; required by the test plan
    pub sim_start_time: Option<DateTime<Utc>>,

    /// Scenario end; required by the test plan
    pub sim_stop_time: Option<DateTime<Utc>>,

    /// Wallclock start (default: now + command lead)
    pub start_time: Option<DateTime<Utc>>,

    pub time_step_secs: f64,

    /// When set, the scenario step is this wallclock step times the scale factor
    pub wallclock_step_secs: Option<f64>,

    pub time_scale_factor: f64,
    pub time_scale_updates: Vec<TimeScaleUpdate>,

    /// Scenario cadence of time status messages
    pub time_status_step_secs: Option<f64>,
    pub time_status_init: Option<DateTime<Utc>>,

    /// Wallclock lead with which commands are issued ahead of their effect
    pub command_lead_secs: f64,

    /// Applications that must answer init with a ready status
    pub required_apps: Vec<String>,
    pub init_retry_delay_secs: f64,
    pub init_max_retry: u32,

    /// Heartbeat cadence advertised in the start command
    pub publish_step_secs: f64,

    pub offset: OffsetPolicy,
    pub shut_down_when_terminated: bool,
}

impl ManagerConfig {
    pub fn time_step(&self) -> TimeDelta {
        secs(self.time_step_secs)
    }

    pub fn command_lead(&self) -> TimeDelta {
        secs(self.command_lead_secs)
    }

    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.init_retry_delay_secs.max(0.0))
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            time_step: self.time_step(),
            wallclock_step: self.wallclock_step_secs.map(secs),
            time_status_step: self.time_status_step_secs.map(secs),
            time_status_init: self.time_status_init,
            start_delay: self.command_lead(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: crate::topics::DEFAULT_MANAGER.to_string(),
            description: None,
            sim_start_time: None,
            sim_stop_time: None,
            start_time: None,
            time_step_secs: 1.0,
            wallclock_step_secs: None,
            time_scale_factor: 1.0,
            time_scale_updates: Vec::new(),
            time_status_step_secs: None,
            time_status_init: None,
            command_lead_secs: 0.0,
            required_apps: Vec::new(),
            init_retry_delay_secs: 5.0,
            init_max_retry: 5,
            publish_step_secs: crate::schemas::DEFAULT_PUBLISH_STEP_SECS as f64,
            offset: OffsetPolicy::default(),
            shut_down_when_terminated: false,
        }
    }
}

/// Behavior of a managed application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagedConfig {
    /// Name of the manager to follow
    pub manager: String,
    pub time_step_secs: f64,
    pub wallclock_step_secs: Option<f64>,
    pub time_status_step_secs: Option<f64>,
    pub time_status_init: Option<DateTime<Utc>>,
    pub offset: OffsetPolicy,
    pub shut_down_when_terminated: bool,
}

impl ManagedConfig {
    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            time_step: secs(self.time_step_secs),
            wallclock_step: self.wallclock_step_secs.map(secs),
            time_status_step: self.time_status_step_secs.map(secs),
            time_status_init: self.time_status_init,
            ..HandlerSettings::default()
        }
    }
}

impl Default for ManagedConfig {
    fn default() -> Self {
        Self {
            manager: crate::topics::DEFAULT_MANAGER.to_string(),
            time_step_secs: 1.0,
            wallclock_step_secs: None,
            time_status_step_secs: None,
            time_status_init: None,
            offset: OffsetPolicy::default(),
            shut_down_when_terminated: false,
        }
    }
}

/// Complete execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Scenario-wide topic prefix
    pub prefix: String,
    pub connection: ConnectionConfig,
    pub manager: ManagerConfig,
    pub managed: ManagedConfig,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            prefix: "lockstep".to_string(),
            connection: ConnectionConfig::default(),
            manager: ManagerConfig::default(),
            managed: ManagedConfig::default(),
        }
    }
}

impl ExecConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ApplicationError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ApplicationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ApplicationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ApplicationError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ApplicationError> {
        let fail = |msg: &str| Err(ApplicationError::Config(msg.to_string()));
        if self.prefix.is_empty() || self.prefix.contains(['*', '#']) {
            return fail("prefix must be a non-empty routing key without wildcards");
        }
        if self.manager.time_step_secs <= 0.0 || self.managed.time_step_secs <= 0.0 {
            return fail("time_step_secs must be positive");
        }
        if !(self.manager.time_scale_factor > 0.0) {
            return fail("time_scale_factor must be positive");
        }
        if self
            .manager
            .time_scale_updates
            .iter()
            .any(|u| !(u.time_scale_factor > 0.0))
        {
            return fail("time_scale_updates factors must be positive");
        }
        if let (Some(start), Some(stop)) = (self.manager.sim_start_time, self.manager.sim_stop_time) {
            if stop < start {
                return fail("sim_stop_time precedes sim_start_time");
            }
        }
        Ok(())
    }
}
