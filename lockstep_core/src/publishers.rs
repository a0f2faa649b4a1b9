//! Observers that turn kernel changes into broker messages.

use crate::mode::Mode;
use crate::observer::{Observer, Property, PropertyValue};
use crate::schemas::{
    ModeStatus, ModeStatusProperties, ReadyStatus, ReadyStatusProperties, TimeStatus,
    TimeStatusProperties,
};
use crate::simulator::Simulator;
use chrono::{DateTime, TimeDelta, Utc};
use lockstep_env::{EnvError, MessageTransport};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Publishes status messages on behalf of one application.
#[derive(Clone)]
pub struct StatusChannel {
    transport: Arc<dyn MessageTransport>,
    name: String,
    description: Option<String>,
}

impl StatusChannel {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            transport,
            name: name.into(),
            description,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Arc<dyn MessageTransport> {
        &self.transport
    }

    /// Serializes and publishes `message` to `routing_key`.
    pub fn publish<T: Serialize>(&self, routing_key: &str, message: &T) -> Result<(), EnvError> {
        let payload =
            serde_json::to_string(message).map_err(|e| EnvError::SerializationError(e.to_string()))?;
        debug!("Publishing {} to {}", payload, routing_key);
        self.transport.publish(routing_key, payload)
    }

    /// Publishes a time status for `simulator`.
    pub fn publish_time(&self, routing_key: &str, simulator: &Simulator) -> Result<(), EnvError> {
        let status = TimeStatus {
            name: self.name.clone(),
            description: self.description.clone(),
            properties: TimeStatusProperties {
                sim_time: simulator.time(),
                time: simulator.wallclock_time(),
                time_scaling_factor: Some(simulator.time_scale_factor()),
            },
        };
        self.publish(routing_key, &status)
    }

    pub fn publish_mode(&self, routing_key: &str, mode: Mode) -> Result<(), EnvError> {
        let status = ModeStatus {
            name: self.name.clone(),
            description: self.description.clone(),
            properties: ModeStatusProperties { mode },
        };
        self.publish(routing_key, &status)
    }

    pub fn publish_ready(&self, routing_key: &str) -> Result<(), EnvError> {
        let status = ReadyStatus {
            name: self.name.clone(),
            description: self.description.clone(),
            properties: ReadyStatusProperties { ready: true },
        };
        info!("{} is ready", self.name);
        self.publish(routing_key, &status)
    }
}

/// Clock an [`IntervalPublisher`] schedules against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalClock {
    /// Scenario time, looking one time step ahead of each committed time
    Scenario,
    /// Corrected wallclock time read at each committed time
    Wallclock,
}

/// Runs a callback on a fixed cadence of scenario or wallclock time.
///
/// Checked on every committed scenario time. When the horizon reaches the
/// next scheduled point the callback runs once and the schedule moves past
/// the horizon, so a step that crosses several points still fires once.
/// The schedule restarts whenever the simulator becomes INITIALIZED.
///
/// | clock     | first point (default)  | cadence (default)     | horizon          |
/// |-----------|------------------------|-----------------------|------------------|
/// | Scenario  | init time              | time step             | `t + time_step`  |
/// | Wallclock | wallclock at INITIALIZED | wallclock time step | wallclock now    |
///
/// An unpaced simulator has a zero wallclock time step, so a wallclock
/// publisher without an explicit cadence stays silent.
pub struct IntervalPublisher {
    clock: IntervalClock,
    step: Option<TimeDelta>,
    init: Option<DateTime<Utc>>,
    next: Mutex<Option<DateTime<Utc>>>,
    publish: Box<dyn Fn(&Simulator) + Send + Sync>,
}

impl IntervalPublisher {
    pub fn new(
        clock: IntervalClock,
        step: Option<TimeDelta>,
        init: Option<DateTime<Utc>>,
        publish: impl Fn(&Simulator) + Send + Sync + 'static,
    ) -> Self {
        Self {
            clock,
            step,
            init,
            next: Mutex::new(None),
            publish: Box::new(publish),
        }
    }

    pub fn scenario(
        step: Option<TimeDelta>,
        init: Option<DateTime<Utc>>,
        publish: impl Fn(&Simulator) + Send + Sync + 'static,
    ) -> Self {
        Self::new(IntervalClock::Scenario, step, init, publish)
    }

    pub fn wallclock(
        step: Option<TimeDelta>,
        init: Option<DateTime<Utc>>,
        publish: impl Fn(&Simulator) + Send + Sync + 'static,
    ) -> Self {
        Self::new(IntervalClock::Wallclock, step, init, publish)
    }

    pub fn clock(&self) -> IntervalClock {
        self.clock
    }

    /// Next scheduled point, on this publisher's clock.
    pub fn next_publish_time(&self) -> Option<DateTime<Utc>> {
        *self.next.lock()
    }

    fn first_point(&self, source: &Simulator) -> DateTime<Utc> {
        self.init.unwrap_or_else(|| match self.clock {
            IntervalClock::Scenario => source.init_time(),
            IntervalClock::Wallclock => source.wallclock_time(),
        })
    }

    fn cadence(&self, source: &Simulator) -> TimeDelta {
        self.step.unwrap_or_else(|| match self.clock {
            IntervalClock::Scenario => source.time_step(),
            IntervalClock::Wallclock => source.wallclock_time_step(),
        })
    }

    fn horizon(&self, source: &Simulator, time: DateTime<Utc>) -> DateTime<Utc> {
        match self.clock {
            IntervalClock::Scenario => time + source.time_step(),
            IntervalClock::Wallclock => source.wallclock_time(),
        }
    }

    /// Advances the schedule past `horizon`; true if a point was reached.
    fn advance(&self, horizon: DateTime<Utc>, step: TimeDelta) -> bool {
        let mut next = self.next.lock();
        match *next {
            Some(mut point) if point <= horizon && step > TimeDelta::zero() => {
                while point <= horizon {
                    point += step;
                }
                *next = Some(point);
                true
            }
            _ => false,
        }
    }
}

impl Observer<Simulator> for IntervalPublisher {
    fn on_change(&self, source: &Simulator, property: Property, _old: &PropertyValue, new: &PropertyValue) {
        match (property, new) {
            (Property::Mode, PropertyValue::Mode(Mode::Initialized)) => {
                let first = self.first_point(source);
                debug!("{:?} interval schedule starts at {}", self.clock, first);
                *self.next.lock() = Some(first);
            }
            (Property::Time, PropertyValue::Time(time)) => {
                let horizon = self.horizon(source, *time);
                if self.advance(horizon, self.cadence(source)) {
                    (self.publish)(source);
                }
            }
            _ => {}
        }
    }
}

/// Heartbeat on a fixed scenario-time cadence.
///
/// A scenario [`IntervalPublisher`] whose callback publishes a time status,
/// so it fires when `t + time_step` reaches each scheduled point.
pub struct TimeStatusPublisher {
    interval: IntervalPublisher,
}

impl TimeStatusPublisher {
    pub fn new(
        channel: StatusChannel,
        routing_key: impl Into<String>,
        step: Option<TimeDelta>,
        init: Option<DateTime<Utc>>,
    ) -> Self {
        let routing_key = routing_key.into();
        let interval = IntervalPublisher::scenario(step, init, move |source| {
            if let Err(e) = channel.publish_time(&routing_key, source) {
                error!("Failed to publish time status: {}", e);
            }
        });
        Self { interval }
    }

    /// Next scheduled publish point.
    pub fn next_publish_time(&self) -> Option<DateTime<Utc>> {
        self.interval.next_publish_time()
    }
}

impl Observer<Simulator> for TimeStatusPublisher {
    fn on_change(&self, source: &Simulator, property: Property, old: &PropertyValue, new: &PropertyValue) {
        self.interval.on_change(source, property, old, new);
    }
}

/// Publishes every mode transition.
pub struct ModeStatusPublisher {
    channel: StatusChannel,
    routing_key: String,
}

impl ModeStatusPublisher {
    pub fn new(channel: StatusChannel, routing_key: impl Into<String>) -> Self {
        Self {
            channel,
            routing_key: routing_key.into(),
        }
    }
}

impl Observer<Simulator> for ModeStatusPublisher {
    fn on_change(&self, _source: &Simulator, property: Property, _old: &PropertyValue, new: &PropertyValue) {
        if let (Property::Mode, Some(mode)) = (property, new.as_mode()) {
            if let Err(e) = self.channel.publish_mode(&self.routing_key, mode) {
                error!("Failed to publish mode status: {}", e);
            }
        }
    }
}

/// Runs a callback once the simulator reaches TERMINATED.
pub struct ShutDownObserver {
    callback: Box<dyn Fn() + Send + Sync>,
}

impl ShutDownObserver {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl Observer<Simulator> for ShutDownObserver {
    fn on_change(&self, _source: &Simulator, property: Property, _old: &PropertyValue, new: &PropertyValue) {
        if property == Property::Mode && new.as_mode() == Some(Mode::Terminated) {
            (self.callback)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::ExecutionParams;
    use crate::testing::LoopbackTransport;
    use chrono::TimeZone;
    use lockstep_env::TokioContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> (Arc<Simulator>, Arc<LoopbackTransport>, StatusChannel) {
        let transport = Arc::new(LoopbackTransport::new());
        let channel = StatusChannel::new(transport.clone(), "sat", None);
        (Simulator::shared(TokioContext::shared()), transport, channel)
    }

    fn sim_times(transport: &LoopbackTransport, key: &str) -> Vec<DateTime<Utc>> {
        transport
            .payloads(key)
            .iter()
            .map(|p| DateTime::parse_from_rfc3339(p["properties"]["simTime"].as_str().unwrap()).unwrap().with_timezone(&Utc))
            .collect()
    }

    #[tokio::test]
    async fn test_time_status_cadence() {
        let (sim, transport, channel) = setup();
        sim.add_observer(Arc::new(TimeStatusPublisher::new(
            channel,
            "p.status.sat.time",
            Some(TimeDelta::seconds(5)),
            None,
        )));

        sim.execute(ExecutionParams::new(t0(), TimeDelta::seconds(12), TimeDelta::seconds(1)).with_time_scale_factor(0.0))
            .await
            .unwrap();

        // Fires one step ahead of each 5 s point: 0 (at 1), 5 (at 4), 10 (at 9)
        let times = sim_times(&transport, "p.status.sat.time");
        let offsets: Vec<i64> = times.iter().map(|t| (*t - t0()).num_seconds()).collect();
        assert_eq!(offsets, vec![1, 4, 9]);
    }

    #[tokio::test]
    async fn test_time_status_every_step_by_default() {
        let (sim, transport, channel) = setup();
        sim.add_observer(Arc::new(TimeStatusPublisher::new(channel, "k", None, None)));

        sim.execute(ExecutionParams::new(t0(), TimeDelta::seconds(4), TimeDelta::seconds(1)).with_time_scale_factor(0.0))
            .await
            .unwrap();

        assert_eq!(sim_times(&transport, "k").len(), 4);
        let first = &transport.payloads("k")[0];
        assert_eq!(first["name"], "sat");
        assert_eq!(first["properties"]["timeScalingFactor"], 0.0);
    }

    fn recorder(clock: IntervalClock, step: Option<TimeDelta>) -> (Arc<IntervalPublisher>, Arc<Mutex<Vec<i64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let publisher = IntervalPublisher::new(clock, step, None, move |source| {
            sink.lock().push((source.time() - t0()).num_seconds());
        });
        (Arc::new(publisher), seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_wallclock_interval_paced() {
        let (sim, _, _) = setup();
        let (every_two, two_seen) = recorder(IntervalClock::Wallclock, Some(TimeDelta::seconds(2)));
        let (default_step, default_seen) = recorder(IntervalClock::Wallclock, None);
        sim.add_observer(every_two.clone());
        sim.add_observer(default_step);

        let started = sim.wallclock_time();
        sim.execute(ExecutionParams::new(t0(), TimeDelta::seconds(10), TimeDelta::seconds(1)).with_time_scale_factor(2.0))
            .await
            .unwrap();

        // Half a wallclock second per step: points at 0, 2 and 4 s of
        // wallclock land on scenario seconds 1, 4 and 8
        assert_eq!(*two_seen.lock(), vec![1, 4, 8]);
        assert_eq!(every_two.next_publish_time(), Some(started + TimeDelta::seconds(6)));
        assert_eq!(*default_seen.lock(), (1..=10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_wallclock_interval_silent_when_unpaced() {
        let (sim, _, _) = setup();
        let (publisher, seen) = recorder(IntervalClock::Wallclock, None);
        sim.add_observer(publisher);

        sim.execute(ExecutionParams::new(t0(), TimeDelta::seconds(5), TimeDelta::seconds(1)).with_time_scale_factor(0.0))
            .await
            .unwrap();
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_scenario_interval_restarts_on_initialize() {
        let (sim, _, _) = setup();
        let (publisher, seen) = recorder(IntervalClock::Scenario, Some(TimeDelta::seconds(3)));
        let params = ExecutionParams::new(t0(), TimeDelta::seconds(4), TimeDelta::seconds(1)).with_time_scale_factor(0.0);

        sim.add_observer(publisher.clone());
        sim.execute(params.clone()).await.unwrap();
        // Terminated drops observers; a rerun starts a fresh schedule
        sim.add_observer(publisher);
        sim.execute(params).await.unwrap();

        assert_eq!(*seen.lock(), vec![1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn test_mode_status_and_shutdown() {
        let (sim, transport, channel) = setup();
        let shut_down = Arc::new(AtomicUsize::new(0));
        let counter = shut_down.clone();
        sim.add_observer(Arc::new(ModeStatusPublisher::new(channel, "m")));
        sim.add_observer(Arc::new(ShutDownObserver::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        sim.execute(ExecutionParams::new(t0(), TimeDelta::seconds(2), TimeDelta::seconds(1)).with_time_scale_factor(0.0))
            .await
            .unwrap();

        let modes: Vec<String> = transport
            .payloads("m")
            .iter()
            .map(|p| p["properties"]["mode"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            modes,
            vec!["INITIALIZING", "INITIALIZED", "EXECUTING", "TERMINATING", "TERMINATED"]
        );
        assert_eq!(shut_down.load(Ordering::SeqCst), 1);
    }
}
