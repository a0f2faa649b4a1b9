//! Clock state and the scenario/wallclock mapping.
//!
//! Committed fields are what observers see. The `next_*` shadow fields hold
//! proposals that only become visible when the kernel commits them at tock.

use crate::mode::Mode;
use chrono::{DateTime, TimeDelta, Utc};

/// Scales a scenario duration into a wallclock duration.
///
/// Returns the duration unchanged for a factor of 1 and zero for an
/// unpaced clock (factor <= 0 or non-finite).
pub fn scale_delta(scenario: TimeDelta, factor: f64) -> TimeDelta {
    if !is_paced(factor) {
        return TimeDelta::zero();
    }
    if factor == 1.0 {
        return scenario;
    }
    match scenario.num_nanoseconds() {
        Some(nanos) => TimeDelta::nanoseconds((nanos as f64 / factor).round() as i64),
        // Beyond ~292 years of nanoseconds, fall back to millisecond precision
        None => TimeDelta::milliseconds((scenario.num_milliseconds() as f64 / factor).round() as i64),
    }
}

/// Inverse of [`scale_delta`]: wallclock duration to scenario duration.
pub fn unscale_delta(wallclock: TimeDelta, factor: f64) -> TimeDelta {
    if !is_paced(factor) {
        return TimeDelta::zero();
    }
    match wallclock.num_nanoseconds() {
        Some(nanos) => TimeDelta::nanoseconds((nanos as f64 * factor).round() as i64),
        None => TimeDelta::milliseconds((wallclock.num_milliseconds() as f64 * factor).round() as i64),
    }
}

/// Returns true if `factor` paces execution against the wallclock.
pub fn is_paced(factor: f64) -> bool {
    factor.is_finite() && factor > 0.0
}

/// Kernel clock state. Owned exclusively by one [`crate::Simulator`].
#[derive(Debug, Clone)]
pub struct ClockState {
    pub mode: Mode,
    pub time: DateTime<Utc>,
    pub next_time: DateTime<Utc>,
    pub init_time: DateTime<Utc>,
    pub time_step: TimeDelta,
    pub next_time_step: TimeDelta,
    pub duration: TimeDelta,
    pub next_duration: TimeDelta,
    pub wallclock_epoch: Option<DateTime<Utc>>,
    pub simulation_epoch: Option<DateTime<Utc>>,
    pub time_scale_factor: f64,
    pub next_time_scale_factor: f64,
    /// Scenario time at which a pending rescale applies
    pub time_scale_change_time: Option<DateTime<Utc>>,
    /// Correction added to the local system clock
    pub wallclock_offset: TimeDelta,
}

impl ClockState {
    pub fn new(wallclock_offset: TimeDelta) -> Self {
        Self {
            mode: Mode::Undefined,
            time: DateTime::<Utc>::UNIX_EPOCH,
            next_time: DateTime::<Utc>::UNIX_EPOCH,
            init_time: DateTime::<Utc>::UNIX_EPOCH,
            time_step: TimeDelta::zero(),
            next_time_step: TimeDelta::zero(),
            duration: TimeDelta::zero(),
            next_duration: TimeDelta::zero(),
            wallclock_epoch: None,
            simulation_epoch: None,
            time_scale_factor: 1.0,
            next_time_scale_factor: 1.0,
            time_scale_change_time: None,
            wallclock_offset,
        }
    }

    /// Committed scenario end time.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.init_time + self.duration
    }

    /// End time implied by the shadow duration.
    pub fn next_end_time(&self) -> DateTime<Utc> {
        self.init_time + self.next_duration
    }

    /// Returns true while a rescale is scheduled but not yet applied.
    pub fn has_pending_rescale(&self) -> bool {
        self.time_scale_change_time.is_some()
    }

    /// Maps scenario time `t` to wallclock time using the committed epoch
    /// pair and scale factor.
    ///
    /// An unpaced or uninitialized clock maps every scenario time to `now`.
    pub fn wallclock_time_at(&self, t: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.wallclock_epoch, self.simulation_epoch) {
            (Some(wallclock_epoch), Some(simulation_epoch)) if is_paced(self.time_scale_factor) => {
                wallclock_epoch + scale_delta(t - simulation_epoch, self.time_scale_factor)
            }
            _ => now,
        }
    }

    /// Maps wallclock time `w` back to scenario time.
    pub fn simulation_time_at(&self, w: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.wallclock_epoch, self.simulation_epoch) {
            (Some(wallclock_epoch), Some(simulation_epoch)) if is_paced(self.time_scale_factor) => {
                Some(simulation_epoch + unscale_delta(w - wallclock_epoch, self.time_scale_factor))
            }
            _ => None,
        }
    }

    /// Moves the epoch pair to the pending change time and commits the
    /// pending factor, if the proposed `next_time` has passed it.
    ///
    /// Returns the (old, new) factor when a rescale was applied.
    pub fn apply_pending_rescale(&mut self, now: DateTime<Utc>) -> Option<(f64, f64)> {
        let change_time = self.time_scale_change_time?;
        if change_time >= self.next_time {
            return None;
        }
        // Anchor at the change time using the old scale, so the mapping is
        // continuous at `change_time`
        self.wallclock_epoch = Some(self.wallclock_time_at(change_time, now));
        self.simulation_epoch = Some(change_time);
        self.time_scale_change_time = None;
        let old = self.time_scale_factor;
        self.time_scale_factor = self.next_time_scale_factor;
        Some((old, self.time_scale_factor))
    }

    /// Scenario step expressed in wallclock time.
    pub fn wallclock_time_step(&self) -> TimeDelta {
        scale_delta(self.time_step, self.time_scale_factor)
    }
}
