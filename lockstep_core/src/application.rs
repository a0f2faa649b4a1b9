//! Application base shared by the manager and managed applications.
//!
//! An [`Application`] owns one simulator, a handle to the broker transport
//! and the subscriptions it made. It corrects its wallclock at start-up
//! according to an [`OffsetPolicy`] and tears its subscriptions down on
//! shut-down; the simulator itself owns no broker resources.

use crate::config::{OffsetMode, OffsetPolicy};
use crate::error::ApplicationError;
use crate::publishers::StatusChannel;
use crate::simulator::Simulator;
use crate::topics::{StatusKind, Topics};
use chrono::TimeDelta;
use lockstep_env::{
    ClockOffsetEstimator, Envelope, MessageHandler, MessageTransport, RuntimeContext,
    SntpTimeSource, SubscriptionId, TimeSource,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Subscriptions owned by an application, keyed by routing pattern.
type Subscriptions = Arc<Mutex<Vec<(String, SubscriptionId)>>>;

pub struct Application {
    name: String,
    description: Option<String>,
    topics: Topics,
    simulator: Arc<Simulator>,
    transport: Arc<dyn MessageTransport>,
    time_source: Arc<dyn TimeSource>,
    subscriptions: Subscriptions,
    started: Arc<AtomicBool>,
}

impl Application {
    /// Creates an application with its own simulator.
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        transport: Arc<dyn MessageTransport>,
        context: Arc<dyn RuntimeContext>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            topics: Topics::new(prefix),
            simulator: Simulator::shared(context),
            transport,
            time_source: Arc::new(SntpTimeSource::default()),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Replaces the default SNTP time source.
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn simulator(&self) -> &Arc<Simulator> {
        &self.simulator
    }

    pub fn transport(&self) -> &Arc<dyn MessageTransport> {
        &self.transport
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Status channel publishing under this application's name.
    pub fn status_channel(&self) -> StatusChannel {
        StatusChannel::new(self.transport.clone(), self.name.clone(), self.description.clone())
    }

    /// Establishes the wallclock offset and marks the application started.
    ///
    /// Returns the offset applied to the simulator.
    ///
    /// # Errors
    /// `ApplicationError::ClockSync` if the policy requires an offset and
    /// none could be obtained.
    pub async fn start_up(&self, policy: &OffsetPolicy) -> Result<TimeDelta, ApplicationError> {
        let offset = match policy.mode {
            OffsetMode::Skip => TimeDelta::zero(),
            OffsetMode::BestEffort | OffsetMode::Required => {
                let estimator = ClockOffsetEstimator::new(
                    self.time_source.clone(),
                    self.simulator.context().clone(),
                );
                match estimator
                    .estimate_offset(&policy.host, policy.retry_delay(), policy.max_retries)
                    .await
                {
                    Ok(offset) => offset,
                    Err(e) if policy.mode == OffsetMode::BestEffort => {
                        warn!("{}: {}; continuing with uncorrected wallclock", self.name, e);
                        TimeDelta::zero()
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        self.simulator.set_wallclock_offset(offset)?;
        self.started.store(true, Ordering::SeqCst);
        info!("Application {} started (wallclock offset {})", self.name, offset);
        Ok(offset)
    }

    fn ensure_started(&self) -> Result<(), ApplicationError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(ApplicationError::NotStarted(self.name.clone()))
        }
    }

    /// Subscribes `handler` to `pattern`, remembering the subscription for
    /// [`Self::shut_down`].
    pub fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<SubscriptionId, ApplicationError> {
        let id = self.transport.subscribe(pattern, handler)?;
        self.subscriptions.lock().push((pattern.to_string(), id));
        debug!("{} subscribed to {}", self.name, pattern);
        Ok(id)
    }

    /// Publishes a ready status.
    pub fn ready(&self) -> Result<(), ApplicationError> {
        self.ensure_started()?;
        let routing_key = self.topics.app_status(&self.name, StatusKind::Ready);
        self.status_channel().publish_ready(&routing_key)?;
        Ok(())
    }

    /// Publishes `payload` to `{prefix}.{name}.{app_topic}`.
    pub fn send_message(&self, app_topic: &str, payload: impl Into<String>) -> Result<(), ApplicationError> {
        self.ensure_started()?;
        let routing_key = self.topics.app_message(&self.name, app_topic);
        let payload = payload.into();
        debug!("{} sending {} to {}", self.name, payload, routing_key);
        self.transport.publish(&routing_key, payload)?;
        Ok(())
    }

    /// Registers `callback` for messages `app` sends on `app_topic`.
    pub fn add_message_callback(
        &self,
        app: &str,
        app_topic: &str,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, ApplicationError> {
        self.ensure_started()?;
        let pattern = self.topics.app_message(app, app_topic);
        self.subscribe(&pattern, Arc::new(callback))
    }

    /// Removes every callback registered for `app` / `app_topic`.
    ///
    /// Returns the number of callbacks removed.
    pub fn remove_message_callback(&self, app: &str, app_topic: &str) -> usize {
        let pattern = self.topics.app_message(app, app_topic);
        let removed: Vec<SubscriptionId> = {
            let mut subscriptions = self.subscriptions.lock();
            let (matching, kept) = subscriptions
                .drain(..)
                .partition::<Vec<_>, _>(|(p, _)| *p == pattern);
            *subscriptions = kept;
            matching.into_iter().map(|(_, id)| id).collect()
        };
        removed
            .into_iter()
            .filter(|id| self.transport.unsubscribe(*id))
            .count()
    }

    /// Callback that releases every subscription, for use by a
    /// [`crate::ShutDownObserver`].
    pub fn shut_down_hook(&self) -> impl Fn() + Send + Sync + 'static {
        let transport = self.transport.clone();
        let subscriptions = self.subscriptions.clone();
        let started = self.started.clone();
        let name = self.name.clone();
        move || release(&name, &*transport, &subscriptions, &started)
    }

    /// Requests termination of a running scenario and releases every
    /// subscription.
    pub fn shut_down(&self) {
        if self.simulator.mode() == crate::mode::Mode::Executing {
            if let Err(e) = self.simulator.terminate() {
                debug!("{}: {}", self.name, e);
            }
        }
        release(&self.name, &*self.transport, &self.subscriptions, &self.started);
    }
}

fn release(
    name: &str,
    transport: &dyn MessageTransport,
    subscriptions: &Mutex<Vec<(String, SubscriptionId)>>,
    started: &AtomicBool,
) {
    let drained: Vec<(String, SubscriptionId)> = subscriptions.lock().drain(..).collect();
    for (_, id) in &drained {
        transport.unsubscribe(*id);
    }
    started.store(false, Ordering::SeqCst);
    info!("Application {} shut down ({} subscriptions released)", name, drained.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackTransport;
    use async_trait::async_trait;
    use lockstep_env::{EnvError, TokioContext};
    use std::sync::atomic::AtomicU32;

    struct DeadSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TimeSource for DeadSource {
        async fn query_offset(&self, _host: &str) -> Result<TimeDelta, EnvError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EnvError::Timeout(2000))
        }
    }

    struct FixedSource(TimeDelta);

    #[async_trait]
    impl TimeSource for FixedSource {
        async fn query_offset(&self, _host: &str) -> Result<TimeDelta, EnvError> {
            Ok(self.0)
        }
    }

    fn app(transport: Arc<LoopbackTransport>) -> Application {
        Application::new("sat", "p", transport, TokioContext::shared())
    }

    fn policy(mode: OffsetMode) -> OffsetPolicy {
        OffsetPolicy {
            mode,
            max_retries: 2,
            ..OffsetPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_policies() {
        let dead = Arc::new(DeadSource { calls: AtomicU32::new(0) });
        let app = app(Arc::new(LoopbackTransport::new())).with_time_source(dead.clone());

        let err = app.start_up(&policy(OffsetMode::Required)).await.unwrap_err();
        assert!(matches!(err, ApplicationError::ClockSync(_)));
        assert!(!app.is_started());

        let offset = app.start_up(&policy(OffsetMode::BestEffort)).await.unwrap();
        assert_eq!(offset, TimeDelta::zero());
        assert!(app.is_started());

        app.start_up(&policy(OffsetMode::Skip)).await.unwrap();
        assert_eq!(dead.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_offset_applied_to_simulator() {
        let app = app(Arc::new(LoopbackTransport::new()))
            .with_time_source(Arc::new(FixedSource(TimeDelta::milliseconds(-1500))));
        app.start_up(&policy(OffsetMode::Required)).await.unwrap();
        assert_eq!(app.simulator().wallclock_offset(), TimeDelta::milliseconds(-1500));
    }

    #[tokio::test]
    async fn test_messaging_requires_start_up() {
        let transport = Arc::new(LoopbackTransport::new());
        let app = app(transport.clone());
        assert!(matches!(
            app.send_message("location", "{}"),
            Err(ApplicationError::NotStarted(_))
        ));
        assert!(app.ready().is_err());
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_message_callbacks() {
        let transport = Arc::new(LoopbackTransport::new());
        let app = app(transport.clone());
        app.start_up(&OffsetPolicy::skip()).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        app.add_message_callback("sat", "location", move |envelope| {
            sink.lock().push(envelope.payload.clone());
        })
        .unwrap();

        app.send_message("location", r#"{"lat":1}"#).unwrap();
        assert_eq!(transport.published()[0].routing_key, "p.sat.location");
        assert_eq!(seen.lock().len(), 1);

        assert_eq!(app.remove_message_callback("sat", "location"), 1);
        assert_eq!(app.remove_message_callback("sat", "location"), 0);
        app.send_message("location", "{}").unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_shut_down_releases_subscriptions() {
        let transport = Arc::new(LoopbackTransport::new());
        let app = app(transport.clone());
        app.start_up(&OffsetPolicy::skip()).await.unwrap();
        app.add_message_callback("gs", "contact", |_| {}).unwrap();
        app.add_message_callback("gs", "downlink", |_| {}).unwrap();
        assert_eq!(transport.subscription_count(), 2);

        app.shut_down_hook()();
        assert_eq!(transport.subscription_count(), 0);
        assert!(!app.is_started());
    }
}
