//! Broker transport abstraction for Lockstep applications.

use crate::error::EnvError;
use crate::types::{Envelope, SubscriptionId};
use std::sync::Arc;

/// Callback invoked for every message whose routing key matches a subscription.
pub type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Abstraction over a topic-routed publish/subscribe broker.
///
/// # Implementations
///
/// - **Production**: wraps an AMQP/MQTT client (supplied by the host process)
/// - **Simulation**: `lockstep_sim::LocalBroker`, an in-process router
///
/// # Message Flow
///
/// ```text
/// Manager                    Broker                   Managed app
///   |                           |                          |
///   |-- publish(key, body) ---->|                          |
///   |                           |-- [pattern match] ------>|
///   |                           |                          |-- handler(envelope)
/// ```
///
/// `publish` must not block: kernel observers call it inline from the
/// commit path of the execution loop.
pub trait MessageTransport: Send + Sync + 'static {
    /// Publishes a JSON body to a routing key.
    ///
    /// # Returns
    /// * `Ok(())` - Message queued for delivery
    /// * `Err(EnvError::TransportError)` - Immediate failure (e.g., broker gone)
    ///
    /// # Note
    /// Success does not guarantee delivery.
    fn publish(&self, routing_key: &str, payload: String) -> Result<(), EnvError>;

    /// Registers a handler for every routing key matching `pattern`.
    ///
    /// Handlers run on the transport's dispatch context and must not block.
    fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<SubscriptionId, EnvError>;

    /// Removes a subscription. Returns `false` if it was unknown.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}
