//! Error types for the Lockstep environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Transport send failed (broker gone, channel closed, etc.)
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Routing key or subscription pattern is not well formed
    #[error("Invalid routing key: {0}")]
    InvalidRoutingKey(String),

    /// Payload serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Time source answered with something unusable
    #[error("Time protocol error: {0}")]
    TimeProtocol(String),

    /// Socket-level failure while talking to a time source
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportError(msg.into())
    }

    /// Creates a time protocol error.
    pub fn time_protocol(msg: impl Into<String>) -> Self {
        Self::TimeProtocol(msg.into())
    }
}

/// Failure to establish a wallclock offset.
///
/// Returned instead of silently assuming a zero offset; the host decides
/// whether an uncorrected clock is acceptable.
#[derive(Debug, Error)]
pub enum OffsetError {
    /// Every attempt to query the time source failed
    #[error("No clock offset available from {host} after {attempts} attempt(s)")]
    NoOffsetAvailable { host: String, attempts: u32 },
}
