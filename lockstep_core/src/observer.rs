//! In-process change notification (Observable / Observer).
//!
//! A subject owns an ordered list of observers and informs each of them,
//! synchronously and in registration order, whenever a tracked property
//! changes value. Observers run inline on the notifying task, so they must
//! not block.

use crate::mode::Mode;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// The closed set of observable properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    /// Lifecycle mode
    Mode,

    /// Current scenario time
    Time,

    /// Scenario duration
    Duration,

    /// Scenario time step
    TimeStep,

    /// Scenario seconds per wallclock second
    TimeScaleFactor,
}

impl Property {
    /// Returns the property name.
    pub fn name(&self) -> &'static str {
        match self {
            Property::Mode => "mode",
            Property::Time => "time",
            Property::Duration => "duration",
            Property::TimeStep => "time_step",
            Property::TimeScaleFactor => "time_scale_factor",
        }
    }
}

impl std::fmt::Display for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Old or new value carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    Mode(Mode),
    Time(DateTime<Utc>),
    Duration(TimeDelta),
    Factor(f64),
}

impl PropertyValue {
    /// Returns the mode, if this is a mode value.
    pub fn as_mode(&self) -> Option<Mode> {
        match self {
            PropertyValue::Mode(m) => Some(*m),
            _ => None,
        }
    }

    /// Returns the timestamp, if this is a time value.
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            PropertyValue::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Returns the duration, if this is a duration value.
    pub fn as_duration(&self) -> Option<TimeDelta> {
        match self {
            PropertyValue::Duration(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the factor, if this is a scale factor value.
    pub fn as_factor(&self) -> Option<f64> {
        match self {
            PropertyValue::Factor(f) => Some(*f),
            _ => None,
        }
    }
}

/// Something that wants to hear about property changes on a source `S`.
///
/// `on_change` runs while the notifier still holds whatever lock guards
/// `source`. An observer of an entity is called with that entity locked by
/// the kernel, so it must not lock the same entity again, directly or
/// through [`crate::Simulator::entities_by_name`]. Reading the kernel and
/// issuing kernel commands is fine.
pub trait Observer<S: ?Sized>: Send + Sync {
    /// Called after `property` changed from `old_value` to `new_value`.
    fn on_change(
        &self,
        source: &S,
        property: Property,
        old_value: &PropertyValue,
        new_value: &PropertyValue,
    );
}

/// Ordered observer list for a source of type `S`.
///
/// Removing or dropping the observable never drops an observer that is
/// still referenced elsewhere.
pub struct Observable<S: ?Sized + 'static> {
    observers: Mutex<Vec<Arc<dyn Observer<S>>>>,
}

impl<S: ?Sized + 'static> Observable<S> {
    /// Creates an observable with no observers.
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Appends an observer.
    pub fn add_observer(&self, observer: Arc<dyn Observer<S>>) {
        self.observers.lock().push(observer);
    }

    /// Removes an observer by identity, returning it if it was registered.
    pub fn remove_observer(&self, observer: &Arc<dyn Observer<S>>) -> Option<Arc<dyn Observer<S>>> {
        let mut observers = self.observers.lock();
        let target = Arc::as_ptr(observer) as *const ();
        let index = observers
            .iter()
            .position(|o| Arc::as_ptr(o) as *const () == target)?;
        Some(observers.remove(index))
    }

    /// Removes every observer.
    pub fn clear_observers(&self) {
        self.observers.lock().clear();
    }

    /// Returns the number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Notifies every observer, in registration order, if the value changed.
    ///
    /// The list is snapshotted first, so observers may add or remove
    /// observers (including themselves) while being notified.
    pub fn notify_observers(
        &self,
        source: &S,
        property: Property,
        old_value: PropertyValue,
        new_value: PropertyValue,
    ) {
        if old_value == new_value {
            return;
        }
        let snapshot: Vec<Arc<dyn Observer<S>>> = self.observers.lock().clone();
        for observer in snapshot {
            observer.on_change(source, property, &old_value, &new_value);
        }
    }
}

impl<S: ?Sized + 'static> Default for Observable<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// A recorded property change.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub property: Property,
    pub old_value: PropertyValue,
    pub new_value: PropertyValue,
}

/// Observer that records changes, optionally filtered to one property.
///
/// Handy in tests and for post-run inspection.
#[derive(Default)]
pub struct RecordingObserver {
    filter: Option<Property>,
    changes: Mutex<Vec<PropertyChange>>,
}

impl RecordingObserver {
    /// Records every property.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records only `property`.
    pub fn for_property(property: Property) -> Self {
        Self {
            filter: Some(property),
            changes: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of the recorded changes.
    pub fn changes(&self) -> Vec<PropertyChange> {
        self.changes.lock().clone()
    }

    /// Returns the recorded new values, in order.
    pub fn new_values(&self) -> Vec<PropertyValue> {
        self.changes.lock().iter().map(|c| c.new_value).collect()
    }
}

impl<S: ?Sized> Observer<S> for RecordingObserver {
    fn on_change(
        &self,
        _source: &S,
        property: Property,
        old_value: &PropertyValue,
        new_value: &PropertyValue,
    ) {
        if self.filter.map_or(true, |f| f == property) {
            self.changes.lock().push(PropertyChange {
                property,
                old_value: *old_value,
                new_value: *new_value,
            });
        }
    }
}
