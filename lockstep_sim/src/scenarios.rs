//! Named coordination scenarios.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Start, run at a fixed scale, stop at the planned end
    Nominal,

    /// Scheduled time scale change halfway through
    Rescale,

    /// Stop command issued mid-run that shortens the scenario
    EarlyStop,

    /// Manager-side test script driving an update and an early stop
    Scripted,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Nominal,
            ScenarioId::Rescale,
            ScenarioId::EarlyStop,
            ScenarioId::Scripted,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Nominal => "nominal",
            ScenarioId::Rescale => "rescale",
            ScenarioId::EarlyStop => "early_stop",
            ScenarioId::Scripted => "scripted",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Nominal => "60 s scenario at scale 30, stopped at its planned end",
            ScenarioId::Rescale => "60 s scenario at scale 20, rescaled to 60 at t=30 s",
            ScenarioId::EarlyStop => "120 s scenario at scale 30, stopped at t=40 s by the manager",
            ScenarioId::Scripted => "90 s scenario at scale 20; script rescales at t=20 s and stops at t=50 s",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nominal" => Ok(ScenarioId::Nominal),
            "rescale" => Ok(ScenarioId::Rescale),
            "early_stop" | "earlystop" | "early-stop" => Ok(ScenarioId::EarlyStop),
            "scripted" | "script" => Ok(ScenarioId::Scripted),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert_eq!("Early-Stop".parse::<ScenarioId>(), Ok(ScenarioId::EarlyStop));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
