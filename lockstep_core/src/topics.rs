//! Routing keys used by the coordination layer.
//!
//! ```text
//! {prefix}.{manager}.{init|start|stop|update}   commands
//! {prefix}.{manager}.{time|mode}                manager broadcasts
//! {prefix}.status.{app}.{time|mode|ready}       per-application status
//! {prefix}.{app}.{topic}                        application messages
//! ```

/// Default manager application name.
pub const DEFAULT_MANAGER: &str = "manager";

/// Kind of status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Time,
    Mode,
    Ready,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Time => "time",
            StatusKind::Mode => "mode",
            StatusKind::Ready => "ready",
        }
    }
}

/// Builds routing keys under one scenario prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}.{manager}.{command}`
    pub fn command(&self, manager: &str, command: &str) -> String {
        format!("{}.{}.{}", self.prefix, manager, command)
    }

    /// Everything the manager publishes.
    pub fn manager_all(&self, manager: &str) -> String {
        format!("{}.{}.#", self.prefix, manager)
    }

    /// `{prefix}.{manager}.{time|mode}`
    pub fn manager_status(&self, manager: &str, kind: StatusKind) -> String {
        format!("{}.{}.{}", self.prefix, manager, kind.as_str())
    }

    /// `{prefix}.status.{app}.{kind}`
    pub fn app_status(&self, app: &str, kind: StatusKind) -> String {
        format!("{}.status.{}.{}", self.prefix, app, kind.as_str())
    }

    /// Matches `kind` status from every application.
    pub fn all_app_status(&self, kind: StatusKind) -> String {
        format!("{}.status.*.{}", self.prefix, kind.as_str())
    }

    /// `{prefix}.{app}.{topic}`
    pub fn app_message(&self, app: &str, topic: &str) -> String {
        format!("{}.{}.{}", self.prefix, app, topic)
    }

    /// Extracts the application name from a status routing key.
    pub fn status_app<'a>(&self, routing_key: &'a str) -> Option<&'a str> {
        let rest = routing_key.strip_prefix(self.prefix.as_str())?;
        let mut words = rest.strip_prefix(".status.")?.split('.');
        words.next().filter(|app| !app.is_empty())
    }

    /// Returns the last word of a routing key.
    pub fn last_word(routing_key: &str) -> &str {
        routing_key.rsplit('.').next().unwrap_or(routing_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_env::routing_key_matches;

    #[test]
    fn test_keys() {
        let topics = Topics::new("greenfield");
        assert_eq!(topics.command("manager", "init"), "greenfield.manager.init");
        assert_eq!(
            topics.app_status("sat", StatusKind::Ready),
            "greenfield.status.sat.ready"
        );
        assert_eq!(topics.app_message("sat", "location"), "greenfield.sat.location");
        assert!(routing_key_matches(
            &topics.all_app_status(StatusKind::Time),
            "greenfield.status.sat.time"
        ));
        assert!(routing_key_matches(
            &topics.manager_all("manager"),
            "greenfield.manager.time"
        ));
    }

    #[test]
    fn test_status_app() {
        let topics = Topics::new("greenfield");
        assert_eq!(topics.status_app("greenfield.status.sat.time"), Some("sat"));
        assert_eq!(topics.status_app("greenfield.sat.location"), None);
        assert_eq!(topics.status_app("other.status.sat.time"), None);
        assert_eq!(Topics::last_word("greenfield.manager.stop"), "stop");
    }
}
