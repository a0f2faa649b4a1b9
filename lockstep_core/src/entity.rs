//! Entities: participant-owned units of scenario state.
//!
//! The kernel drives every entity through a two-phase step. `tick` proposes
//! the next state from the last committed state, `tock` commits it. An
//! entity must never expose a proposed value before `tock`.

use crate::observer::{Observable, Property, PropertyValue};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Fatal failure raised by an entity during `tick` or `tock`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("entity {entity}: {reason}")]
pub struct EntityError {
    pub entity: String,
    pub reason: String,
}

impl EntityError {
    pub fn new(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

/// Two-phase step contract.
pub trait Entity: Send + 'static {
    /// Optional name used by [`crate::Simulator::entities_by_name`].
    fn name(&self) -> Option<&str> {
        None
    }

    /// Resets the entity to `init_time`.
    fn initialize(&mut self, init_time: DateTime<Utc>);

    /// Proposes the state after `time_step` of scenario time.
    fn tick(&mut self, time_step: TimeDelta) -> Result<(), EntityError>;

    /// Commits the proposal made by the last `tick`.
    fn tock(&mut self) -> Result<(), EntityError>;
}

/// Entity handle shared between the kernel and its owner.
pub type SharedEntity = Arc<Mutex<dyn Entity>>;

/// Wraps an entity into a [`SharedEntity`].
pub fn shared<E: Entity>(entity: E) -> SharedEntity {
    Arc::new(Mutex::new(entity))
}

/// Base entity that keeps its own scenario clock.
///
/// Notifies `time` to its observers on every committed change. Ticks are
/// ignored until the entity has been initialized. Notifications run inside
/// `tock`, with the entity locked by the kernel.
pub struct ClockEntity {
    name: Option<String>,
    init_time: Option<DateTime<Utc>>,
    time: Option<DateTime<Utc>>,
    next_time: Option<DateTime<Utc>>,
    observable: Observable<ClockEntity>,
}

impl ClockEntity {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            init_time: None,
            time: None,
            next_time: None,
            observable: Observable::new(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(Some(name.into()))
    }

    /// Current committed scenario time, if initialized.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    pub fn init_time(&self) -> Option<DateTime<Utc>> {
        self.init_time
    }

    /// Observers of this entity's `time`.
    pub fn observable(&self) -> &Observable<ClockEntity> {
        &self.observable
    }
}

impl Entity for ClockEntity {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn initialize(&mut self, init_time: DateTime<Utc>) {
        self.init_time = Some(init_time);
        self.time = Some(init_time);
        self.next_time = Some(init_time);
    }

    fn tick(&mut self, time_step: TimeDelta) -> Result<(), EntityError> {
        match self.time {
            Some(time) => self.next_time = Some(time + time_step),
            None => debug!("Entity {:?} not yet initialized, ignoring tick", self.name),
        }
        Ok(())
    }

    fn tock(&mut self) -> Result<(), EntityError> {
        if self.time != self.next_time {
            let prev = self.time;
            self.time = self.next_time;
            if let (Some(old), Some(new)) = (prev, self.time) {
                debug!("Entity {:?} updated time to {}", self.name, new);
                self.observable.notify_observers(
                    self,
                    Property::Time,
                    PropertyValue::Time(old),
                    PropertyValue::Time(new),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::RecordingObserver;
    use chrono::TimeZone;

    #[test]
    fn test_uninitialized_entity_ignores_tick() {
        let mut entity = ClockEntity::named("idle");
        entity.tick(TimeDelta::seconds(1)).unwrap();
        entity.tock().unwrap();
        assert_eq!(entity.time(), None);
    }

    #[test]
    fn test_tick_is_invisible_until_tock() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut entity = ClockEntity::named("sat-1");
        let recorder = Arc::new(RecordingObserver::new());
        entity.observable().add_observer(recorder.clone());

        entity.initialize(t0);
        entity.tick(TimeDelta::seconds(5)).unwrap();
        assert_eq!(entity.time(), Some(t0));
        assert!(recorder.changes().is_empty());

        entity.tock().unwrap();
        assert_eq!(entity.time(), Some(t0 + TimeDelta::seconds(5)));
        assert_eq!(
            recorder.new_values(),
            vec![PropertyValue::Time(t0 + TimeDelta::seconds(5))]
        );

        // Repeated tock without a new proposal commits nothing
        entity.tock().unwrap();
        assert_eq!(recorder.changes().len(), 1);
    }
}
