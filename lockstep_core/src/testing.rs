//! Test doubles shared by the unit tests.

use lockstep_env::{
    routing_key_matches, EnvError, Envelope, MessageHandler, MessageTransport, SubscriptionId,
};
use parking_lot::Mutex;
use serde_json::Value;

/// Transport that records every publish and delivers it synchronously to
/// matching subscribers.
#[derive(Default)]
pub struct LoopbackTransport {
    published: Mutex<Vec<Envelope>>,
    handlers: Mutex<Vec<(SubscriptionId, String, MessageHandler)>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Envelope> {
        self.published.lock().clone()
    }

    /// Payloads published to `routing_key`, parsed as JSON.
    pub fn payloads(&self, routing_key: &str) -> Vec<Value> {
        self.published
            .lock()
            .iter()
            .filter(|e| e.routing_key == routing_key)
            .map(|e| serde_json::from_str(&e.payload).unwrap())
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl MessageTransport for LoopbackTransport {
    fn publish(&self, routing_key: &str, payload: String) -> Result<(), EnvError> {
        let envelope = Envelope::new(routing_key, payload);
        self.published.lock().push(envelope.clone());
        let matching: Vec<MessageHandler> = self
            .handlers
            .lock()
            .iter()
            .filter(|(_, pattern, _)| routing_key_matches(pattern, routing_key))
            .map(|(_, _, handler)| handler.clone())
            .collect();
        for handler in matching {
            handler(&envelope);
        }
        Ok(())
    }

    fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<SubscriptionId, EnvError> {
        let id = SubscriptionId::new();
        self.handlers.lock().push((id, pattern.to_string(), handler));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(sub, _, _)| *sub != id);
        handlers.len() != before
    }
}
