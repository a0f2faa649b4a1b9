//! Common types for the Lockstep environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handle returned by [`crate::MessageTransport::subscribe`].
///
/// Uses UUID v4 so handles from different transports never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Creates a new random SubscriptionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A message as seen by subscribers.
///
/// The payload is an opaque JSON document; decoding it is the job of the
/// protocol layer in `lockstep_core`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Dot-separated routing key, e.g. `nost.manager.start`
    pub routing_key: String,

    /// JSON body
    pub payload: String,
}

impl Envelope {
    /// Creates a new envelope.
    pub fn new(routing_key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Returns the routing key split into its dot-separated words.
    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.routing_key.split('.')
    }
}

/// Matches a routing key against a topic-exchange style pattern.
///
/// - `*` matches exactly one word
/// - `#` matches zero or more words
///
/// ```
/// use lockstep_env::routing_key_matches;
///
/// assert!(routing_key_matches("nost.manager.#", "nost.manager.start"));
/// assert!(routing_key_matches("nost.status.*.time", "nost.status.sat.time"));
/// assert!(!routing_key_matches("nost.status.*.time", "nost.manager.time"));
/// ```
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => (word == "*" || word == first) && match_words(rest, key_rest),
            None => false,
        },
    }
}
