//! In-process topic broker with optional delivery latency.

use lockstep_env::{
    routing_key_matches, EnvError, Envelope, MessageHandler, MessageTransport, SubscriptionId,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Internal message to the router task.
#[derive(Debug)]
struct RoutedMessage {
    envelope: Envelope,
    sent_at: Instant,
}

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: MessageHandler,
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct BrokerStats {
    published: AtomicU64,
    routed: AtomicU64,
    delivered: AtomicU64,
    unrouted: AtomicU64,
}

impl BrokerStats {
    /// Messages accepted by `publish`
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Messages the router has finished dispatching
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::SeqCst)
    }

    /// Handler invocations
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Messages that matched no subscription
    pub fn unrouted(&self) -> u64 {
        self.unrouted.load(Ordering::SeqCst)
    }
}

/// Topic-exchange broker living in the current tokio runtime.
///
/// `publish` only enqueues; a router task delivers messages in publish
/// order to every subscription whose pattern matches, each message no
/// earlier than `latency` after it was published. Handlers run on the
/// router task, so a handler that publishes never re-enters itself.
///
/// Must be created from within a tokio runtime.
pub struct LocalBroker {
    tx: mpsc::UnboundedSender<RoutedMessage>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    stats: Arc<BrokerStats>,
    idle: Arc<Notify>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Creates a broker that holds every message for `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(BrokerStats::default());
        let idle = Arc::new(Notify::new());
        tokio::spawn(route(
            rx,
            subscriptions.clone(),
            stats.clone(),
            idle.clone(),
            latency,
        ));
        Self {
            tx,
            subscriptions,
            stats,
            idle,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Waits until every message published so far has been dispatched.
    pub async fn flush(&self) {
        loop {
            let notified = self.idle.notified();
            if self.stats.routed() >= self.stats.published() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

async fn route(
    mut rx: mpsc::UnboundedReceiver<RoutedMessage>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    stats: Arc<BrokerStats>,
    idle: Arc<Notify>,
    latency: Duration,
) {
    while let Some(message) = rx.recv().await {
        if !latency.is_zero() {
            tokio::time::sleep_until(message.sent_at + latency).await;
        }
        let envelope = message.envelope;

        // Snapshot so handlers may subscribe or unsubscribe
        let handlers: Vec<MessageHandler> = subscriptions
            .lock()
            .iter()
            .filter(|s| routing_key_matches(&s.pattern, &envelope.routing_key))
            .map(|s| s.handler.clone())
            .collect();

        if handlers.is_empty() {
            trace!("No subscriber for {}", envelope.routing_key);
            stats.unrouted.fetch_add(1, Ordering::SeqCst);
        }
        for handler in &handlers {
            handler(&envelope);
        }
        stats.delivered.fetch_add(handlers.len() as u64, Ordering::SeqCst);
        stats.routed.fetch_add(1, Ordering::SeqCst);
        idle.notify_waiters();
    }
    debug!("Broker router stopped");
}

fn validate_key(key: &str, wildcards: bool) -> Result<(), EnvError> {
    let bad_word = key.split('.').any(|word| {
        word.is_empty() || (!wildcards && (word == "*" || word == "#"))
    });
    if bad_word || (!wildcards && key.contains(['*', '#'])) {
        return Err(EnvError::InvalidRoutingKey(key.to_string()));
    }
    Ok(())
}

impl MessageTransport for LocalBroker {
    fn publish(&self, routing_key: &str, payload: String) -> Result<(), EnvError> {
        validate_key(routing_key, false)?;
        let message = RoutedMessage {
            envelope: Envelope::new(routing_key, payload),
            sent_at: Instant::now(),
        };
        self.stats.published.fetch_add(1, Ordering::SeqCst);
        self.tx.send(message).map_err(|_| {
            self.stats.published.fetch_sub(1, Ordering::SeqCst);
            EnvError::transport("Broker router stopped")
        })
    }

    fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<SubscriptionId, EnvError> {
        validate_key(pattern, true)?;
        let id = SubscriptionId::new();
        self.subscriptions.lock().push(Subscription {
            id,
            pattern: pattern.to_string(),
            handler,
        });
        debug!("Subscribed {} to {}", id, pattern);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }
}
