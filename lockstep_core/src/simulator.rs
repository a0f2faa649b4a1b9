//! The execution kernel.
//!
//! A [`Simulator`] advances scenario time in discrete steps, paced against
//! the (offset corrected) wallclock. Each step is a two-phase barrier:
//!
//! 1. **tick**: every entity proposes its next state from the last committed
//!    state, and the kernel proposes `next_time`.
//! 2. **tock**: every entity commits, then the kernel commits `duration`,
//!    `time_step` and `time` in that order, notifying observers after each
//!    changed value.
//!
//! Observers therefore never see a partially advanced scenario. Command
//! handlers running on other tasks only touch shadow values, which are
//! picked up at the next tock, or flip the mode to request termination.

use crate::clock::{is_paced, ClockState};
use crate::entity::SharedEntity;
use crate::error::KernelError;
use crate::mode::Mode;
use crate::observer::{Observable, Observer, Property, PropertyValue};
use chrono::{DateTime, TimeDelta, Utc};
use lockstep_env::{now_corrected, RuntimeContext};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest uninterrupted sleep while waiting on a wallclock deadline.
const MAX_SLEEP: Duration = Duration::from_secs(1);

/// Parameters of one execution run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionParams {
    /// Scenario time at which the run starts
    pub init_time: DateTime<Utc>,

    /// Scenario duration of the run
    pub duration: TimeDelta,

    /// Scenario time advanced per step
    pub time_step: TimeDelta,

    /// Wallclock time matching `init_time` (default: now)
    pub wallclock_epoch: Option<DateTime<Utc>>,

    /// Scenario seconds per wallclock second; `<= 0` runs unpaced
    pub time_scale_factor: f64,
}

impl ExecutionParams {
    pub fn new(init_time: DateTime<Utc>, duration: TimeDelta, time_step: TimeDelta) -> Self {
        Self {
            init_time,
            duration,
            time_step,
            wallclock_epoch: None,
            time_scale_factor: 1.0,
        }
    }

    pub fn with_wallclock_epoch(mut self, wallclock_epoch: DateTime<Utc>) -> Self {
        self.wallclock_epoch = Some(wallclock_epoch);
        self
    }

    pub fn with_time_scale_factor(mut self, time_scale_factor: f64) -> Self {
        self.time_scale_factor = time_scale_factor;
        self
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSummary {
    /// Number of committed steps
    pub tocks: u64,

    /// Scenario time at termination
    pub final_time: DateTime<Utc>,

    /// Wallclock time between the epoch and termination
    pub wallclock_elapsed: TimeDelta,
}

/// Handle to a run spawned with [`Simulator::spawn_execute`].
///
/// Cancelling is cooperative: it requests termination, and the run stops at
/// the next loop check.
pub struct ExecutionHandle {
    simulator: Arc<Simulator>,
    task: JoinHandle<Result<ExecutionSummary, KernelError>>,
}

impl ExecutionHandle {
    /// Requests termination of the run.
    pub fn cancel(&self) -> Result<(), KernelError> {
        self.simulator.terminate()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the run to finish.
    pub async fn join(self) -> Result<ExecutionSummary, KernelError> {
        self.task
            .await
            .map_err(|e| KernelError::ExecutionAborted(e.to_string()))?
    }
}

/// Outcome of waiting for the wallclock deadline of `next_time`.
enum TockWait {
    /// Deadline reached; commit the proposal
    Ready,
    /// Mode left EXECUTING while waiting
    Interrupted,
    /// A stop moved the end before `next_time`; proposal discarded
    Truncated,
}

/// Scenario clock and execution kernel.
///
/// All state lives behind one lock that is never held across an await or
/// while observers run.
pub struct Simulator {
    context: Arc<dyn RuntimeContext>,
    state: Mutex<ClockState>,
    entities: Mutex<Vec<SharedEntity>>,
    observable: Observable<Simulator>,
    wake: Notify,
    mode_tx: watch::Sender<Mode>,
}

impl Simulator {
    /// Creates a simulator with no wallclock offset.
    pub fn new(context: Arc<dyn RuntimeContext>) -> Self {
        Self::with_wallclock_offset(context, TimeDelta::zero())
    }

    pub fn with_wallclock_offset(context: Arc<dyn RuntimeContext>, offset: TimeDelta) -> Self {
        let (mode_tx, _) = watch::channel(Mode::Undefined);
        Self {
            context,
            state: Mutex::new(ClockState::new(offset)),
            entities: Mutex::new(Vec::new()),
            observable: Observable::new(),
            wake: Notify::new(),
            mode_tx,
        }
    }

    /// Creates a shared simulator.
    pub fn shared(context: Arc<dyn RuntimeContext>) -> Arc<Self> {
        Arc::new(Self::new(context))
    }

    pub fn context(&self) -> &Arc<dyn RuntimeContext> {
        &self.context
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn add_observer(&self, observer: Arc<dyn Observer<Simulator>>) {
        self.observable.add_observer(observer);
    }

    pub fn remove_observer(
        &self,
        observer: &Arc<dyn Observer<Simulator>>,
    ) -> Option<Arc<dyn Observer<Simulator>>> {
        self.observable.remove_observer(observer)
    }

    pub fn clear_observers(&self) {
        self.observable.clear_observers();
    }

    pub fn observer_count(&self) -> usize {
        self.observable.observer_count()
    }

    fn notify(&self, property: Property, old_value: PropertyValue, new_value: PropertyValue) {
        self.observable
            .notify_observers(self, property, old_value, new_value);
    }

    fn notify_mode(&self, old: Mode, new: Mode) {
        if old != new {
            self.mode_tx.send_replace(new);
            self.notify(Property::Mode, PropertyValue::Mode(old), PropertyValue::Mode(new));
        }
    }

    fn reject(&self, operation: &'static str, mode: Mode) -> KernelError {
        warn!("Rejected {}: simulator is {}", operation, mode);
        KernelError::IllegalTransition { operation, mode }
    }

    /// Moves to `to` if the current mode is one of `from`.
    fn transition(&self, operation: &'static str, from: &[Mode], to: Mode) -> Result<(), KernelError> {
        let old = {
            let mut state = self.state.lock();
            if !from.contains(&state.mode) {
                let mode = state.mode;
                drop(state);
                return Err(self.reject(operation, mode));
            }
            std::mem::replace(&mut state.mode, to)
        };
        info!("Simulator {} -> {}", old, to);
        self.notify_mode(old, to);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Adds an entity. Resets the mode to UNDEFINED.
    pub fn add_entity(&self, entity: SharedEntity) -> Result<(), KernelError> {
        let old = {
            let mut state = self.state.lock();
            if !state.mode.allows_entity_changes() {
                let mode = state.mode;
                drop(state);
                return Err(self.reject("add entity", mode));
            }
            self.entities.lock().push(entity);
            std::mem::replace(&mut state.mode, Mode::Undefined)
        };
        self.notify_mode(old, Mode::Undefined);
        Ok(())
    }

    /// Removes an entity by identity. Resets the mode to UNDEFINED if the
    /// entity was present.
    pub fn remove_entity(&self, entity: &SharedEntity) -> Result<Option<SharedEntity>, KernelError> {
        let (removed, old) = {
            let mut state = self.state.lock();
            if !state.mode.allows_entity_changes() {
                let mode = state.mode;
                drop(state);
                return Err(self.reject("remove entity", mode));
            }
            let mut entities = self.entities.lock();
            let target = Arc::as_ptr(entity) as *const ();
            match entities.iter().position(|e| Arc::as_ptr(e) as *const () == target) {
                Some(index) => {
                    let removed = entities.remove(index);
                    let old = std::mem::replace(&mut state.mode, Mode::Undefined);
                    (Some(removed), old)
                }
                None => (None, state.mode),
            }
        };
        if removed.is_some() {
            self.notify_mode(old, Mode::Undefined);
        }
        Ok(removed)
    }

    /// Snapshot of the entity list.
    pub fn entities(&self) -> Vec<SharedEntity> {
        self.entities.lock().clone()
    }

    /// Entities named `name`.
    ///
    /// Locks each entity in turn, so it must not be called from an observer
    /// of an entity while the kernel commits it.
    pub fn entities_by_name(&self, name: &str) -> Vec<SharedEntity> {
        self.entities()
            .into_iter()
            .filter(|e| e.lock().name() == Some(name))
            .collect()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Initializes the simulator and every entity at `init_time`.
    ///
    /// Legal from UNDEFINED or TERMINATED. The wallclock epoch defaults to
    /// the current corrected wallclock time.
    pub fn initialize(
        &self,
        init_time: DateTime<Utc>,
        wallclock_epoch: Option<DateTime<Utc>>,
        time_scale_factor: f64,
    ) -> Result<(), KernelError> {
        self.transition(
            "initialize",
            &[Mode::Undefined, Mode::Terminated],
            Mode::Initializing,
        )?;

        for entity in self.entities() {
            entity.lock().initialize(init_time);
        }

        let epoch = {
            let mut state = self.state.lock();
            let now = now_corrected(&*self.context, state.wallclock_offset);
            let epoch = wallclock_epoch.unwrap_or(now);
            state.time = init_time;
            state.next_time = init_time;
            state.init_time = init_time;
            state.simulation_epoch = Some(init_time);
            state.wallclock_epoch = Some(epoch);
            state.time_scale_factor = time_scale_factor;
            state.next_time_scale_factor = time_scale_factor;
            state.time_scale_change_time = None;
            state.mode = Mode::Initialized;
            epoch
        };
        info!(
            "Initialized simulator at {} (wallclock epoch {}, scale {})",
            init_time, epoch, time_scale_factor
        );
        self.notify_mode(Mode::Initializing, Mode::Initialized);
        Ok(())
    }

    /// Runs a scenario to completion.
    ///
    /// Initializes first unless already INITIALIZED, waits for the wallclock
    /// epoch, then steps until the end time is reached or termination is
    /// requested. An entity failure abandons the run; the simulator still
    /// ends TERMINATED and the error is returned.
    pub async fn execute(&self, params: ExecutionParams) -> Result<ExecutionSummary, KernelError> {
        if params.time_step <= TimeDelta::zero() {
            return Err(KernelError::invalid("time step must be positive"));
        }
        if params.duration < TimeDelta::zero() {
            return Err(KernelError::invalid("duration must not be negative"));
        }

        if self.mode() != Mode::Initialized {
            self.initialize(
                params.init_time,
                params.wallclock_epoch,
                params.time_scale_factor,
            )?;
        }
        self.enter_execution(params.duration, params.time_step)?;

        self.wait_for_epoch().await;
        let started = self.wallclock_time();
        let outcome = self.run_loop().await;
        self.finish();

        let tocks = outcome?;
        let summary = ExecutionSummary {
            tocks,
            final_time: self.time(),
            wallclock_elapsed: self.wallclock_time() - started,
        };
        info!(
            "Execution finished after {} steps at {} ({} ms wallclock)",
            summary.tocks,
            summary.final_time,
            summary.wallclock_elapsed.num_milliseconds()
        );
        Ok(summary)
    }

    /// Runs [`Self::execute`] on a background task.
    pub fn spawn_execute(self: &Arc<Self>, params: ExecutionParams) -> ExecutionHandle {
        let simulator = Arc::clone(self);
        let task = tokio::spawn(async move { simulator.execute(params).await });
        ExecutionHandle {
            simulator: Arc::clone(self),
            task,
        }
    }

    /// Commits duration and time step and moves INITIALIZED -> EXECUTING.
    fn enter_execution(&self, duration: TimeDelta, time_step: TimeDelta) -> Result<(), KernelError> {
        {
            let mut state = self.state.lock();
            if state.mode != Mode::Initialized {
                let mode = state.mode;
                drop(state);
                return Err(self.reject("execute", mode));
            }
            state.duration = duration;
            state.next_duration = duration;
            state.time_step = time_step;
            state.next_time_step = time_step;
            state.mode = Mode::Executing;
        }
        info!(
            "Executing simulator for {} s in {} s steps",
            duration.num_seconds(),
            time_step.num_seconds()
        );
        self.notify_mode(Mode::Initialized, Mode::Executing);
        Ok(())
    }

    /// Sleeps until the wallclock epoch, waking early on termination.
    async fn wait_for_epoch(&self) {
        loop {
            let remaining = {
                let state = self.state.lock();
                if state.mode != Mode::Executing {
                    return;
                }
                let now = now_corrected(&*self.context, state.wallclock_offset);
                state.wallclock_epoch.map(|epoch| epoch - now)
            };
            match remaining {
                Some(diff) if diff > TimeDelta::zero() => {
                    debug!("Waiting {} ms for wallclock epoch", diff.num_milliseconds());
                    self.interruptible_sleep(diff).await;
                }
                _ => return,
            }
        }
    }

    async fn run_loop(&self) -> Result<u64, KernelError> {
        let mut tocks = 0u64;
        loop {
            {
                let state = self.state.lock();
                if state.mode != Mode::Executing || state.time >= state.end_time() {
                    break;
                }
            }

            self.tick(self.time_step())?;
            if self.mode() != Mode::Executing {
                break;
            }

            match self.wait_for_tock().await {
                TockWait::Ready => {
                    if !self.tock()? {
                        continue;
                    }
                    tocks += 1;
                }
                TockWait::Truncated => continue,
                TockWait::Interrupted => break,
            }
            tokio::task::yield_now().await;
        }
        Ok(tocks)
    }

    /// Proposes the next step. Observers see nothing until [`Self::tock`],
    /// except a pending rescale whose change time the proposal passes.
    fn tick(&self, time_step: TimeDelta) -> Result<(), KernelError> {
        let step = {
            let state = self.state.lock();
            if state.mode == Mode::Terminating {
                return Ok(());
            }
            time_step
                .min(state.end_time() - state.time)
                .max(TimeDelta::zero())
        };

        for entity in self.entities() {
            entity.lock().tick(step)?;
        }

        let rescale = {
            let mut state = self.state.lock();
            if state.mode == Mode::Terminating {
                return Ok(());
            }
            state.next_time = state.time + step;
            let now = now_corrected(&*self.context, state.wallclock_offset);
            state.apply_pending_rescale(now)
        };
        self.announce_rescale(rescale);
        Ok(())
    }

    fn announce_rescale(&self, rescale: Option<(f64, f64)>) {
        if let Some((old, new)) = rescale {
            info!("Time scale factor changed from {} to {}", old, new);
            self.notify(
                Property::TimeScaleFactor,
                PropertyValue::Factor(old),
                PropertyValue::Factor(new),
            );
        }
    }

    /// Sleeps until the wallclock deadline of `next_time`.
    ///
    /// Re-checks mode, pending rescales and the end time after every wake.
    async fn wait_for_tock(&self) -> TockWait {
        loop {
            let mut rescale = None;
            let mut truncated = None;
            let remaining = {
                let mut state = self.state.lock();
                if state.mode != Mode::Executing {
                    return TockWait::Interrupted;
                }
                if state.next_end_time() < state.next_time {
                    truncated = Some(discard_proposal(&mut state));
                    TimeDelta::zero()
                } else {
                    let now = now_corrected(&*self.context, state.wallclock_offset);
                    rescale = state.apply_pending_rescale(now);
                    state.wallclock_time_at(state.next_time, now) - now
                }
            };

            if let Some((old, new)) = truncated {
                self.announce_truncation(old, new);
                return TockWait::Truncated;
            }
            self.announce_rescale(rescale);

            if remaining <= TimeDelta::zero() {
                return TockWait::Ready;
            }
            self.interruptible_sleep(remaining).await;
        }
    }

    fn announce_truncation(&self, old: TimeDelta, new: TimeDelta) {
        info!("Stop truncated duration to {} s", new.num_seconds());
        self.notify(
            Property::Duration,
            PropertyValue::Duration(old),
            PropertyValue::Duration(new),
        );
    }

    /// Commits the proposal: entities first, then duration, time step and
    /// time, notifying each changed value in that order.
    ///
    /// The committed values are fixed under the lock before any entity
    /// commits. A stop that landed after the deadline wait and falls below
    /// `next_time` discards the proposal instead and returns `false`;
    /// commands arriving while entities commit stay pending for the next
    /// step.
    fn tock(&self) -> Result<bool, KernelError> {
        let (duration, time_step, next_time) = {
            let mut state = self.state.lock();
            if state.mode == Mode::Terminating {
                return Ok(false);
            }
            if state.next_end_time() < state.next_time {
                let (old, new) = discard_proposal(&mut state);
                drop(state);
                self.announce_truncation(old, new);
                return Ok(false);
            }
            (state.next_duration, state.next_time_step, state.next_time)
        };

        for entity in self.entities() {
            entity.lock().tock()?;
        }

        let mut changes = Vec::with_capacity(3);
        {
            let mut state = self.state.lock();
            if state.duration != duration {
                changes.push((
                    Property::Duration,
                    PropertyValue::Duration(state.duration),
                    PropertyValue::Duration(duration),
                ));
                state.duration = duration;
            }
            if state.time_step != time_step {
                changes.push((
                    Property::TimeStep,
                    PropertyValue::Duration(state.time_step),
                    PropertyValue::Duration(time_step),
                ));
                state.time_step = time_step;
            }
            if state.time != next_time {
                changes.push((
                    Property::Time,
                    PropertyValue::Time(state.time),
                    PropertyValue::Time(next_time),
                ));
                state.time = next_time;
            }
        }

        for (property, old, new) in changes {
            debug!("Committed {}: {:?}", property, new);
            self.notify(property, old, new);
        }
        Ok(true)
    }

    /// EXECUTING/TERMINATING -> TERMINATED, then drops every observer.
    fn finish(&self) {
        let old = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.mode, Mode::Terminating)
        };
        self.notify_mode(old, Mode::Terminating);
        {
            self.state.lock().mode = Mode::Terminated;
        }
        info!("Simulator terminated at {}", self.time());
        self.notify_mode(Mode::Terminating, Mode::Terminated);
        self.clear_observers();
    }

    async fn interruptible_sleep(&self, remaining: TimeDelta) {
        let duration = remaining.to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP);
        tokio::select! {
            _ = self.context.sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }

    // ------------------------------------------------------------------
    // Commands (EXECUTING only)
    // ------------------------------------------------------------------

    /// Requests termination. Takes effect at the next loop check.
    pub fn terminate(&self) -> Result<(), KernelError> {
        self.transition("terminate", &[Mode::Executing], Mode::Terminating)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Schedules a new time scale factor at scenario time `at`
    /// (default: the current scenario time).
    pub fn set_time_scale_factor(
        &self,
        time_scale_factor: f64,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), KernelError> {
        if !is_paced(time_scale_factor) {
            return Err(KernelError::invalid(format!(
                "time scale factor must be positive, got {}",
                time_scale_factor
            )));
        }
        let change_time = self.update_executing("set time scale factor", |state| {
            let change_time = at.unwrap_or(state.time);
            state.next_time_scale_factor = time_scale_factor;
            state.time_scale_change_time = Some(change_time);
            change_time
        })?;
        info!(
            "Scheduled time scale factor {} at {}",
            time_scale_factor, change_time
        );
        Ok(())
    }

    /// Moves the scenario end time. Applied at the next tock.
    pub fn set_end_time(&self, end_time: DateTime<Utc>) -> Result<(), KernelError> {
        let init_time = self.init_time();
        if end_time < init_time {
            return Err(KernelError::invalid(format!(
                "end time {} precedes init time {}",
                end_time, init_time
            )));
        }
        self.set_duration(end_time - init_time)
    }

    /// Sets the scenario duration. Applied at the next tock.
    pub fn set_duration(&self, duration: TimeDelta) -> Result<(), KernelError> {
        if duration < TimeDelta::zero() {
            return Err(KernelError::invalid("duration must not be negative"));
        }
        self.update_executing("set duration", |state| state.next_duration = duration)?;
        info!("Scheduled duration {} s", duration.num_seconds());
        Ok(())
    }

    /// Sets the scenario time step. Applied at the next tock.
    pub fn set_time_step(&self, time_step: TimeDelta) -> Result<(), KernelError> {
        if time_step <= TimeDelta::zero() {
            return Err(KernelError::invalid("time step must be positive"));
        }
        self.update_executing("set time step", |state| state.next_time_step = time_step)?;
        Ok(())
    }

    /// Applies `update` to the shadow state if EXECUTING and wakes the loop.
    fn update_executing<T>(
        &self,
        operation: &'static str,
        update: impl FnOnce(&mut ClockState) -> T,
    ) -> Result<T, KernelError> {
        let result = {
            let mut state = self.state.lock();
            if state.mode != Mode::Executing {
                let mode = state.mode;
                drop(state);
                return Err(self.reject(operation, mode));
            }
            update(&mut state)
        };
        self.wake.notify_one();
        Ok(result)
    }

    /// Sets the correction applied to the local system clock.
    pub fn set_wallclock_offset(&self, offset: TimeDelta) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if state.mode == Mode::Terminating {
            let mode = state.mode;
            drop(state);
            return Err(self.reject("set wallclock offset", mode));
        }
        state.wallclock_offset = offset;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    /// Receiver that observes every mode change.
    pub fn subscribe_mode(&self) -> watch::Receiver<Mode> {
        self.mode_tx.subscribe()
    }

    /// Waits until the simulator reaches `mode` and returns the mode reached.
    ///
    /// Returns [`Mode::Terminated`] instead when a run ends without `mode`
    /// having been observed, so a waiter never outlives a skipped mode. A
    /// simulator that is already TERMINATED at the call waits for the next
    /// run.
    pub async fn wait_for_mode(&self, mode: Mode) -> Mode {
        let mut rx = self.mode_tx.subscribe();
        if *rx.borrow_and_update() == mode {
            return mode;
        }
        // The sender lives as long as `self`
        while rx.changed().await.is_ok() {
            let current = *rx.borrow_and_update();
            if current == mode || current == Mode::Terminated {
                return current;
            }
        }
        self.mode()
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.state.lock().time
    }

    pub fn init_time(&self) -> DateTime<Utc> {
        self.state.lock().init_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.state.lock().end_time()
    }

    pub fn duration(&self) -> TimeDelta {
        self.state.lock().duration
    }

    pub fn time_step(&self) -> TimeDelta {
        self.state.lock().time_step
    }

    pub fn time_scale_factor(&self) -> f64 {
        self.state.lock().time_scale_factor
    }

    pub fn wallclock_epoch(&self) -> Option<DateTime<Utc>> {
        self.state.lock().wallclock_epoch
    }

    pub fn simulation_epoch(&self) -> Option<DateTime<Utc>> {
        self.state.lock().simulation_epoch
    }

    pub fn wallclock_offset(&self) -> TimeDelta {
        self.state.lock().wallclock_offset
    }

    /// Current wallclock time, corrected by the wallclock offset.
    pub fn wallclock_time(&self) -> DateTime<Utc> {
        let offset = self.state.lock().wallclock_offset;
        now_corrected(&*self.context, offset)
    }

    /// Maps scenario time `t` to wallclock time with the current epoch pair.
    pub fn wallclock_time_at_simulation_time(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let state = self.state.lock();
        let now = now_corrected(&*self.context, state.wallclock_offset);
        state.wallclock_time_at(t, now)
    }

    /// Time step expressed in wallclock time.
    pub fn wallclock_time_step(&self) -> TimeDelta {
        self.state.lock().wallclock_time_step()
    }

    /// Copy of the full clock state, including shadow values.
    pub fn snapshot(&self) -> ClockState {
        self.state.lock().clone()
    }
}

/// Commits a pending stop that falls below the proposal and drops the
/// proposal. Returns the old and new duration.
fn discard_proposal(state: &mut ClockState) -> (TimeDelta, TimeDelta) {
    let old = state.duration;
    state.duration = state.next_duration;
    state.next_time = state.time;
    (old, state.duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{shared, ClockEntity, Entity, EntityError};
    use crate::observer::RecordingObserver;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;
    use lockstep_env::TokioContext;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn secs(s: i64) -> TimeDelta {
        TimeDelta::seconds(s)
    }

    fn simulator() -> Arc<Simulator> {
        Simulator::shared(TokioContext::shared())
    }

    /// Records the wallclock time of every committed scenario time.
    #[derive(Default)]
    struct Pacing {
        marks: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    }

    impl Observer<Simulator> for Pacing {
        fn on_change(&self, source: &Simulator, property: Property, _: &PropertyValue, new: &PropertyValue) {
            if let (Property::Time, Some(t)) = (property, new.as_time()) {
                self.marks.lock().push((t, source.wallclock_time()));
            }
        }
    }

    impl Pacing {
        fn wallclock_at(&self, t: DateTime<Utc>) -> DateTime<Utc> {
            self.marks
                .lock()
                .iter()
                .find(|(sim, _)| *sim == t)
                .map(|(_, wall)| *wall)
                .unwrap()
        }
    }

    struct Failing;

    impl Entity for Failing {
        fn initialize(&mut self, _: DateTime<Utc>) {}

        fn tick(&mut self, _: TimeDelta) -> Result<(), EntityError> {
            Err(EntityError::new("failing", "sensor offline"))
        }

        fn tock(&mut self) -> Result<(), EntityError> {
            Ok(())
        }
    }

    /// Initializes and enters EXECUTING without running the loop.
    fn executing(duration: TimeDelta, time_step: TimeDelta) -> Arc<Simulator> {
        let sim = simulator();
        sim.initialize(t0(), None, 1.0).unwrap();
        sim.enter_execution(duration, time_step).unwrap();
        sim
    }

    #[tokio::test]
    async fn test_initialize_sets_epoch_pair() {
        let sim = simulator();
        let epoch = t0() + TimeDelta::days(1);
        sim.initialize(t0(), Some(epoch), 2.0).unwrap();

        assert_eq!(sim.mode(), Mode::Initialized);
        assert_eq!(sim.time(), t0());
        assert_eq!(sim.simulation_epoch(), Some(t0()));
        assert_eq!(sim.wallclock_epoch(), Some(epoch));
        assert_eq!(sim.wallclock_time_at_simulation_time(t0() + secs(10)), epoch + secs(5));

        let err = sim.initialize(t0(), None, 1.0).unwrap_err();
        assert!(matches!(err, KernelError::IllegalTransition { mode: Mode::Initialized, .. }));
    }

    #[tokio::test]
    async fn test_add_entity_rejected_while_executing() {
        let sim = executing(secs(10), secs(1));
        let before = sim.entities().len();

        let err = sim.add_entity(shared(ClockEntity::named("late"))).unwrap_err();

        assert!(matches!(err, KernelError::IllegalTransition { mode: Mode::Executing, .. }));
        assert_eq!(sim.entities().len(), before);
        assert_eq!(sim.mode(), Mode::Executing);
    }

    #[tokio::test]
    async fn test_entity_changes_reset_mode() {
        let sim = simulator();
        let entity = shared(ClockEntity::named("gs-1"));
        sim.add_entity(entity.clone()).unwrap();
        sim.initialize(t0(), None, 1.0).unwrap();

        assert_eq!(sim.entities_by_name("gs-1").len(), 1);
        assert!(sim.entities_by_name("gs-2").is_empty());

        assert!(sim.remove_entity(&entity).unwrap().is_some());
        assert_eq!(sim.mode(), Mode::Undefined);
        assert!(sim.remove_entity(&entity).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commands_rejected_outside_execution() {
        let sim = simulator();
        assert!(sim.terminate().is_err());
        assert!(sim.set_end_time(t0() + secs(3)).is_err());
        assert!(sim.set_time_scale_factor(2.0, None).is_err());

        let sim = executing(secs(10), secs(1));
        assert!(matches!(
            sim.set_time_scale_factor(0.0, None),
            Err(KernelError::InvalidArgument(_))
        ));
        assert!(sim.set_time_step(TimeDelta::zero()).is_err());
        assert_eq!(sim.snapshot().time_scale_change_time, None);
    }

    #[tokio::test]
    async fn test_tock_commits_in_order() {
        let sim = executing(secs(10), secs(2));
        let recorder = Arc::new(RecordingObserver::new());
        sim.add_observer(recorder.clone());

        sim.set_duration(secs(8)).unwrap();
        sim.set_time_step(secs(3)).unwrap();
        sim.tick(sim.time_step()).unwrap();
        assert_eq!(sim.time(), t0());
        sim.tock().unwrap();

        let properties: Vec<Property> = recorder.changes().iter().map(|c| c.property).collect();
        assert_eq!(properties, vec![Property::Duration, Property::TimeStep, Property::Time]);
        assert_eq!(sim.time(), t0() + secs(2));
        assert_eq!(sim.time_step(), secs(3));
    }

    #[tokio::test]
    async fn test_tock_without_changes_is_silent() {
        let sim = executing(secs(10), secs(1));
        let recorder = Arc::new(RecordingObserver::new());
        sim.add_observer(recorder.clone());

        sim.tock().unwrap();
        assert!(recorder.changes().is_empty());
    }

    proptest! {
        #[test]
        fn prop_ticks_never_leak(ticks in proptest::collection::vec(1i64..600, 1..20)) {
            let sim = executing(secs(3600), secs(60));
            for step in ticks {
                sim.tick(secs(step)).unwrap();
                prop_assert_eq!(sim.time(), t0());
            }
        }

        #[test]
        fn prop_tock_is_monotonic_and_bounded(
            duration in 1i64..500,
            step in 1i64..100,
            rounds in 1usize..30,
        ) {
            let sim = executing(secs(duration), secs(step));
            for _ in 0..rounds {
                let before = sim.time();
                sim.tick(sim.time_step()).unwrap();
                sim.tock().unwrap();
                let after = sim.time();
                prop_assert!(after >= before);
                prop_assert_eq!(after, (before + secs(step)).min(sim.end_time()));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_paced_at_double_speed() {
        let sim = simulator();
        sim.add_entity(shared(ClockEntity::named("noop"))).unwrap();

        let summary = sim
            .execute(ExecutionParams::new(t0(), secs(10), secs(1)).with_time_scale_factor(2.0))
            .await
            .unwrap();

        assert_eq!(summary.tocks, 10);
        assert_eq!(summary.final_time, t0() + secs(10));
        assert_eq!(sim.mode(), Mode::Terminated);
        assert_abs_diff_eq!(
            summary.wallclock_elapsed.num_milliseconds() as f64 / 1000.0,
            5.0,
            epsilon = 0.05
        );
        assert_eq!(sim.observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_wallclock_epoch() {
        let sim = simulator();
        let epoch = sim.wallclock_time() + secs(3);
        let pacing = Arc::new(Pacing::default());
        sim.add_observer(pacing.clone());

        sim.execute(
            ExecutionParams::new(t0(), secs(2), secs(1)).with_wallclock_epoch(epoch),
        )
        .await
        .unwrap();

        let first = pacing.wallclock_at(t0() + secs(1));
        assert_abs_diff_eq!((first - epoch).num_milliseconds() as f64, 1000.0, epsilon = 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_rescales_remaining_scenario() {
        let sim = simulator();
        let epoch = sim.wallclock_time();
        let pacing = Arc::new(Pacing::default());
        sim.add_observer(pacing.clone());
        let scale = Arc::new(RecordingObserver::for_property(Property::TimeScaleFactor));
        sim.add_observer(scale.clone());

        let handle = sim.spawn_execute(
            ExecutionParams::new(t0(), secs(10), secs(1))
                .with_wallclock_epoch(epoch)
                .with_time_scale_factor(2.0),
        );
        sim.wait_for_mode(Mode::Executing).await;
        let before = sim.wallclock_time_at_simulation_time(t0() + secs(5));
        sim.set_time_scale_factor(4.0, Some(t0() + secs(5))).unwrap();
        handle.join().await.unwrap();

        let at_five = pacing.wallclock_at(t0() + secs(5));
        let at_ten = pacing.wallclock_at(t0() + secs(10));
        assert_abs_diff_eq!((at_five - epoch).num_milliseconds() as f64 / 1000.0, 2.5, epsilon = 0.05);
        assert_abs_diff_eq!((at_ten - at_five).num_milliseconds() as f64 / 1000.0, 1.25, epsilon = 0.05);

        // Epoch pair anchored at the change time keeps the mapping continuous
        assert_eq!(sim.simulation_epoch(), Some(t0() + secs(5)));
        assert_eq!(sim.wallclock_epoch(), Some(before));
        assert_eq!(scale.new_values(), vec![PropertyValue::Factor(4.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_truncates_at_next_boundary() {
        let sim = simulator();
        let entity = Arc::new(Mutex::new(ClockEntity::named("rover")));
        let entity_times = Arc::new(RecordingObserver::for_property(Property::Time));
        entity.lock().observable().add_observer(entity_times.clone());
        sim.add_entity(entity.clone()).unwrap();

        let handle = sim.spawn_execute(ExecutionParams::new(t0(), secs(20), secs(4)));
        sim.wait_for_mode(Mode::Executing).await;
        // Mid-way through the second step (4 s -> 8 s)
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(sim.time(), t0() + secs(4));
        sim.set_end_time(t0() + secs(6)).unwrap();

        let summary = handle.join().await.unwrap();
        assert_eq!(summary.final_time, t0() + secs(6));
        assert_eq!(sim.end_time(), t0() + secs(6));
        assert_eq!(entity.lock().time(), Some(t0() + secs(6)));
        assert!(entity_times
            .new_values()
            .iter()
            .all(|v| v.as_time().unwrap() <= t0() + secs(6)));
    }

    #[tokio::test]
    async fn test_stop_between_tick_and_tock_discards_proposal() {
        let sim = simulator();
        let entity = Arc::new(Mutex::new(ClockEntity::named("rover")));
        sim.add_entity(entity.clone()).unwrap();
        sim.initialize(t0(), None, 1.0).unwrap();
        sim.enter_execution(secs(10), secs(4)).unwrap();
        let durations = Arc::new(RecordingObserver::for_property(Property::Duration));
        sim.add_observer(durations.clone());

        sim.tick(sim.time_step()).unwrap();
        sim.set_end_time(t0() + secs(2)).unwrap();
        assert!(!sim.tock().unwrap());

        assert_eq!(sim.time(), t0());
        assert_eq!(sim.end_time(), t0() + secs(2));
        assert_eq!(entity.lock().time(), Some(t0()));
        assert_eq!(durations.new_values(), vec![PropertyValue::Duration(secs(2))]);

        // The next proposal is clamped to the new end
        sim.tick(sim.time_step()).unwrap();
        assert!(sim.tock().unwrap());
        assert_eq!(sim.time(), t0() + secs(2));
        assert_eq!(entity.lock().time(), Some(t0() + secs(2)));
    }

    #[tokio::test]
    async fn test_tock_commits_values_fixed_before_entities() {
        struct Retuner {
            simulator: Arc<Simulator>,
        }

        impl Entity for Retuner {
            fn initialize(&mut self, _: DateTime<Utc>) {}

            fn tick(&mut self, _: TimeDelta) -> Result<(), EntityError> {
                Ok(())
            }

            fn tock(&mut self) -> Result<(), EntityError> {
                self.simulator
                    .set_time_step(TimeDelta::seconds(5))
                    .map_err(|e| EntityError::new("retuner", e.to_string()))
            }
        }

        let sim = simulator();
        sim.add_entity(shared(Retuner { simulator: sim.clone() })).unwrap();
        sim.initialize(t0(), None, 1.0).unwrap();
        sim.enter_execution(secs(10), secs(1)).unwrap();

        sim.tick(sim.time_step()).unwrap();
        assert!(sim.tock().unwrap());
        assert_eq!(sim.time(), t0() + secs(1));
        assert_eq!(sim.time_step(), secs(1));
        assert_eq!(sim.snapshot().next_time_step, secs(5));

        sim.tick(sim.time_step()).unwrap();
        sim.tock().unwrap();
        assert_eq!(sim.time_step(), secs(5));
    }

    #[tokio::test]
    async fn test_entity_observer_reads_kernel_during_tock() {
        struct KernelReader {
            simulator: Arc<Simulator>,
            seen: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>, usize)>>,
        }

        impl Observer<ClockEntity> for KernelReader {
            fn on_change(&self, _: &ClockEntity, _: Property, _: &PropertyValue, new: &PropertyValue) {
                if let Some(t) = new.as_time() {
                    // Kernel time is committed after the entities
                    let kernel = self.simulator.time();
                    self.seen.lock().push((t, kernel, self.simulator.entities().len()));
                }
            }
        }

        let sim = simulator();
        let entity = Arc::new(Mutex::new(ClockEntity::named("rover")));
        let reader = Arc::new(KernelReader {
            simulator: sim.clone(),
            seen: Mutex::new(Vec::new()),
        });
        entity.lock().observable().add_observer(reader.clone());
        sim.add_entity(entity).unwrap();

        sim.execute(ExecutionParams::new(t0(), secs(2), secs(1)).with_time_scale_factor(0.0))
            .await
            .unwrap();

        assert_eq!(
            *reader.seen.lock(),
            vec![(t0() + secs(1), t0(), 1), (t0() + secs(2), t0() + secs(1), 1)]
        );
    }

    #[tokio::test]
    async fn test_wait_for_mode_returns_on_termination() {
        let sim = simulator();
        sim.initialize(t0(), None, 1.0).unwrap();
        let waiter = {
            let sim = sim.clone();
            tokio::spawn(async move { sim.wait_for_mode(Mode::Initializing).await })
        };
        tokio::task::yield_now().await;

        sim.execute(ExecutionParams::new(t0(), secs(3), secs(1)).with_time_scale_factor(0.0))
            .await
            .unwrap();
        assert_eq!(waiter.await.unwrap(), Mode::Terminated);

        // Already reached
        assert_eq!(sim.wait_for_mode(Mode::Terminated).await, Mode::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_interrupts_sleep() {
        let sim = simulator();
        let handle = sim.spawn_execute(ExecutionParams::new(t0(), secs(3600), secs(600)));
        sim.wait_for_mode(Mode::Executing).await;

        let started = tokio::time::Instant::now();
        handle.cancel().unwrap();
        let summary = handle.join().await.unwrap();

        assert_eq!(summary.tocks, 0);
        assert_eq!(sim.mode(), Mode::Terminated);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unpaced_runs_immediately() {
        let sim = simulator();
        let summary = sim
            .execute(ExecutionParams::new(t0(), secs(86_400), secs(60)).with_time_scale_factor(0.0))
            .await
            .unwrap();
        assert_eq!(summary.tocks, 1440);
        assert_eq!(summary.final_time, t0() + TimeDelta::days(1));
    }

    #[tokio::test]
    async fn test_entity_failure_ends_run() {
        let sim = simulator();
        sim.add_entity(shared(Failing)).unwrap();

        let err = sim
            .execute(ExecutionParams::new(t0(), secs(10), secs(1)).with_time_scale_factor(0.0))
            .await
            .unwrap_err();

        assert!(matches!(err, KernelError::Entity(_)));
        assert_eq!(sim.mode(), Mode::Terminated);
        assert_eq!(sim.time(), t0());
    }

    #[tokio::test]
    async fn test_can_rerun_after_termination() {
        let sim = simulator();
        let params = ExecutionParams::new(t0(), secs(3), secs(1)).with_time_scale_factor(0.0);
        sim.execute(params.clone()).await.unwrap();
        let summary = sim.execute(params).await.unwrap();
        assert_eq!(summary.tocks, 3);
    }
}
