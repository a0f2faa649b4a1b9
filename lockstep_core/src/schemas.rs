//! Wire messages exchanged over the broker.
//!
//! Commands travel as `{"taskingParameters": {...}}`. Inbound commands are
//! also accepted as the bare parameter object. Decoding is field by field so
//! a rejection names the offending field; nothing is applied unless the
//! whole command decodes.

use crate::error::ValidationError;
use crate::mode::Mode;
use chrono::{DateTime, NaiveDateTime, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Default scenario cadence of time status messages, in seconds (6 hours).
pub const DEFAULT_PUBLISH_STEP_SECS: i64 = 21_600;

type Params = Map<String, Value>;

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Parses an RFC 3339 timestamp, or a naive ISO-8601 one taken as UTC.
pub fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| ValidationError::new(field, format!("'{}' is not an ISO-8601 timestamp", raw)))
}

/// Extracts the parameter object from a command body.
pub fn tasking_parameters(body: &str) -> Result<Params, ValidationError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ValidationError::new("body", format!("invalid JSON: {}", e)))?;
    let Value::Object(mut object) = value else {
        return Err(ValidationError::new("body", "expected a JSON object"));
    };
    match object.remove("taskingParameters") {
        Some(Value::Object(params)) => Ok(params),
        Some(_) => Err(ValidationError::new("taskingParameters", "expected an object")),
        None => Ok(object),
    }
}

fn optional_time(params: &Params, field: &str) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => parse_timestamp(field, raw).map(Some),
        Some(_) => Err(ValidationError::new(field, "expected a timestamp string")),
    }
}

fn required_time(params: &Params, field: &str) -> Result<DateTime<Utc>, ValidationError> {
    optional_time(params, field)?.ok_or_else(|| ValidationError::new(field, "required"))
}

fn optional_number(params: &Params, field: &str) -> Result<Option<f64>, ValidationError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| ValidationError::new(field, "not representable as a number")),
        // HTTP forms deliver numbers as strings
        Some(Value::String(raw)) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ValidationError::new(field, format!("'{}' is not a number", raw))),
        Some(_) => Err(ValidationError::new(field, "expected a number")),
    }
}

fn positive(field: &str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ValidationError::new(field, format!("must be positive, got {}", value)))
    }
}

fn optional_factor(params: &Params, field: &str) -> Result<Option<f64>, ValidationError> {
    optional_number(params, field)?
        .map(|v| positive(field, v))
        .transpose()
}

fn required_factor(params: &Params, field: &str) -> Result<f64, ValidationError> {
    optional_factor(params, field)?.ok_or_else(|| ValidationError::new(field, "required"))
}

fn optional_seconds(params: &Params, field: &str) -> Result<Option<TimeDelta>, ValidationError> {
    optional_number(params, field)?
        .map(|v| positive(field, v).map(|s| TimeDelta::milliseconds((s * 1000.0).round() as i64)))
        .transpose()
}

fn serialize_seconds<S: Serializer>(value: &Option<TimeDelta>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_f64(d.num_milliseconds() as f64 / 1000.0),
        None => serializer.serialize_none(),
    }
}

/// A command with a `taskingParameters` wire envelope.
pub trait Command: Serialize + Sized {
    /// Topic suffix under `{prefix}.{manager}`.
    const TOPIC: &'static str;

    /// Decodes the parameter object.
    fn from_parameters(params: &Params) -> Result<Self, ValidationError>;

    /// Decodes a full command body.
    fn decode(body: &str) -> Result<Self, ValidationError> {
        Self::from_parameters(&tasking_parameters(body)?)
    }

    /// Encodes the command with its envelope.
    fn encode(&self) -> Result<String, serde_json::Error> {
        let mut envelope = Map::new();
        envelope.insert("taskingParameters".to_string(), serde_json::to_value(self)?);
        serde_json::to_string(&Value::Object(envelope))
    }
}

/// Sets the scenario bounds for a future run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitCommand {
    pub sim_start_time: DateTime<Utc>,
    pub sim_stop_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_apps: Vec<String>,
}

impl Command for InitCommand {
    const TOPIC: &'static str = "init";

    fn from_parameters(params: &Params) -> Result<Self, ValidationError> {
        let sim_start_time = required_time(params, "simStartTime")?;
        let sim_stop_time = required_time(params, "simStopTime")?;
        if sim_stop_time < sim_start_time {
            return Err(ValidationError::new("simStopTime", "precedes simStartTime"));
        }
        let required_apps = match params.get("requiredApps") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(apps)) => apps
                .iter()
                .map(|a| {
                    a.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| ValidationError::new("requiredApps", "expected strings"))
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(ValidationError::new("requiredApps", "expected a list")),
        };
        Ok(Self {
            sim_start_time,
            sim_stop_time,
            required_apps,
        })
    }
}

/// Begins execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCommand {
    /// Wallclock time matching `sim_start_time`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sim_start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sim_stop_time: Option<DateTime<Utc>>,
    pub time_scaling_factor: f64,
    /// Scenario seconds between time status messages
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_seconds")]
    pub publish_step: Option<TimeDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_status_start_time: Option<DateTime<Utc>>,
}

impl Command for StartCommand {
    const TOPIC: &'static str = "start";

    fn from_parameters(params: &Params) -> Result<Self, ValidationError> {
        let command = Self {
            start_time: optional_time(params, "startTime")?,
            sim_start_time: optional_time(params, "simStartTime")?,
            sim_stop_time: optional_time(params, "simStopTime")?,
            time_scaling_factor: optional_factor(params, "timeScalingFactor")?.unwrap_or(1.0),
            publish_step: optional_seconds(params, "publishStep")?,
            time_status_start_time: optional_time(params, "timeStatusStartTime")?,
        };
        if let (Some(start), Some(stop)) = (command.sim_start_time, command.sim_stop_time) {
            if stop < start {
                return Err(ValidationError::new("simStopTime", "precedes simStartTime"));
            }
        }
        Ok(command)
    }
}

/// Moves the scenario end time of a running execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopCommand {
    pub sim_stop_time: DateTime<Utc>,
}

impl Command for StopCommand {
    const TOPIC: &'static str = "stop";

    fn from_parameters(params: &Params) -> Result<Self, ValidationError> {
        Ok(Self {
            sim_stop_time: required_time(params, "simStopTime")?,
        })
    }
}

/// Schedules a time scale change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCommand {
    pub sim_update_time: DateTime<Utc>,
    pub time_scaling_factor: f64,
}

impl Command for UpdateCommand {
    const TOPIC: &'static str = "update";

    fn from_parameters(params: &Params) -> Result<Self, ValidationError> {
        Ok(Self {
            sim_update_time: required_time(params, "simUpdateTime")?,
            time_scaling_factor: required_factor(params, "timeScalingFactor")?,
        })
    }
}

/// One scripted action.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptAction {
    Update(UpdateCommand),
    Stop(StopCommand),
}

/// A scripted action and the scenario time that triggers it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptEntry {
    pub action: ScriptAction,
    pub trigger_time: DateTime<Utc>,
}

/// Ordered list of scripted updates and stops.
///
/// Body: a JSON array (or `{"script": [...]}`) of
/// `{"type": "update"|"stop", "properties": {...}, "triggerTime"?: ...}`.
/// The trigger defaults to the action's own scenario time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TestScript {
    pub entries: Vec<ScriptEntry>,
}

impl TestScript {
    pub fn decode(body: &str) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| ValidationError::new("body", format!("invalid JSON: {}", e)))?;
        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut object) => match object.remove("script") {
                Some(Value::Array(items)) => items,
                _ => return Err(ValidationError::new("script", "expected a list")),
            },
            _ => return Err(ValidationError::new("body", "expected a list")),
        };

        let mut entries = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let field = |name: &str| format!("script[{}].{}", index, name);
            let Value::Object(item) = item else {
                return Err(ValidationError::new(format!("script[{}]", index), "expected an object"));
            };
            let empty = Params::new();
            let properties = match item.get("properties") {
                Some(Value::Object(p)) => p,
                None => &empty,
                Some(_) => return Err(ValidationError::new(field("properties"), "expected an object")),
            };
            let prefixed = |e: ValidationError| ValidationError::new(field(&e.field), e.reason);
            let action = match item.get("type").and_then(Value::as_str) {
                Some("update") => {
                    ScriptAction::Update(UpdateCommand::from_parameters(properties).map_err(prefixed)?)
                }
                Some("stop") => ScriptAction::Stop(StopCommand::from_parameters(properties).map_err(prefixed)?),
                _ => return Err(ValidationError::new(field("type"), "expected 'update' or 'stop'")),
            };
            let trigger_time = match optional_time(item, "triggerTime").map_err(prefixed)? {
                Some(t) => t,
                None => match &action {
                    ScriptAction::Update(update) => update.sim_update_time,
                    ScriptAction::Stop(stop) => stop.sim_stop_time,
                },
            };
            entries.push(ScriptEntry { action, trigger_time });
        }
        Ok(Self { entries })
    }
}

/// Heartbeat properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeStatusProperties {
    /// Current scenario time
    pub sim_time: DateTime<Utc>,
    /// Current wallclock time
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_scaling_factor: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub properties: TimeStatusProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeStatusProperties {
    pub mode: Mode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub properties: ModeStatusProperties,
}

fn default_ready() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyStatusProperties {
    #[serde(default = "default_ready")]
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub properties: ReadyStatusProperties,
}

/// Decodes a status message (time, mode or ready).
pub fn decode_status<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, ValidationError> {
    serde_json::from_str(body).map_err(|e| ValidationError::new("properties", e.to_string()))
}
