//! Kernel lifecycle modes.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`crate::Simulator`].
///
/// ```text
/// UNDEFINED ──initialize──► INITIALIZING ──► INITIALIZED ──execute──► EXECUTING
///     ▲                                                                  │
///     │ add/remove entity                                    end / terminate
///     │                                                                  ▼
/// TERMINATED ◄──────────────────────────────────────────────────── TERMINATING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// Not initialized (or invalidated by an entity change)
    Undefined,

    /// Entities are being initialized
    Initializing,

    /// Ready to execute
    Initialized,

    /// Main loop running
    Executing,

    /// Loop is winding down
    Terminating,

    /// Run finished; may be initialized again
    Terminated,
}

impl Mode {
    /// Returns the wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Undefined => "UNDEFINED",
            Mode::Initializing => "INITIALIZING",
            Mode::Initialized => "INITIALIZED",
            Mode::Executing => "EXECUTING",
            Mode::Terminating => "TERMINATING",
            Mode::Terminated => "TERMINATED",
        }
    }

    /// Returns true if entities may be added or removed in this mode.
    pub fn allows_entity_changes(&self) -> bool {
        !matches!(
            self,
            Mode::Initializing | Mode::Executing | Mode::Terminating
        )
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Undefined
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "UNDEFINED" => Ok(Mode::Undefined),
            "INITIALIZING" => Ok(Mode::Initializing),
            "INITIALIZED" => Ok(Mode::Initialized),
            "EXECUTING" => Ok(Mode::Executing),
            "TERMINATING" => Ok(Mode::Terminating),
            "TERMINATED" => Ok(Mode::Terminated),
            _ => Err(format!("Unknown mode: {}", s)),
        }
    }
}
