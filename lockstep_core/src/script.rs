//! Scripted updates and stops.

use crate::commands::CommandRelay;
use crate::observer::{Observer, Property, PropertyValue};
use crate::schemas::{ScriptAction, ScriptEntry, TestScript};
use crate::simulator::Simulator;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// Fires scripted update / stop commands as scenario time advances.
///
/// An entry fires on the first committed time `t` with
/// `t + time_step >= trigger_time`. Entries fire in order; once the script
/// is exhausted the observer detaches itself. Holds no reference to the
/// simulator it watches.
pub struct TestScriptObserver {
    entries: Mutex<VecDeque<ScriptEntry>>,
    relay: Option<CommandRelay>,
    me: Weak<TestScriptObserver>,
}

impl TestScriptObserver {
    /// Applies entries to the watched simulator only.
    pub fn new(script: TestScript) -> Arc<Self> {
        Self::build(script, None)
    }

    /// Also publishes each fired command through `relay`.
    pub fn with_relay(script: TestScript, relay: CommandRelay) -> Arc<Self> {
        Self::build(script, Some(relay))
    }

    fn build(script: TestScript, relay: Option<CommandRelay>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            entries: Mutex::new(script.entries.into()),
            relay,
            me: me.clone(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn fire(&self, source: &Simulator, entry: &ScriptEntry) {
        info!("Script trigger {} reached", entry.trigger_time);
        let applied = match &entry.action {
            ScriptAction::Update(update) => {
                source.set_time_scale_factor(update.time_scaling_factor, Some(update.sim_update_time))
            }
            ScriptAction::Stop(stop) => source.set_end_time(stop.sim_stop_time),
        };
        if let Err(e) = applied {
            warn!("Scripted command not applied: {}", e);
        }

        if let Some(relay) = &self.relay {
            let published = match &entry.action {
                ScriptAction::Update(update) => relay.send(update),
                ScriptAction::Stop(stop) => relay.send(stop),
            };
            if let Err(e) = published {
                warn!("Scripted command not published: {}", e);
            }
        }
    }
}

impl Observer<Simulator> for TestScriptObserver {
    fn on_change(&self, source: &Simulator, property: Property, _old: &PropertyValue, new: &PropertyValue) {
        let (Property::Time, Some(time)) = (property, new.as_time()) else {
            return;
        };
        let horizon = time + source.time_step();

        loop {
            let entry = {
                let mut entries = self.entries.lock();
                match entries.front() {
                    Some(entry) if entry.trigger_time <= horizon => entries.pop_front(),
                    _ => None,
                }
            };
            match entry {
                Some(entry) => self.fire(source, &entry),
                None => break,
            }
        }

        if self.is_exhausted() {
            if let Some(me) = self.me.upgrade() {
                let me: Arc<dyn Observer<Simulator>> = me;
                source.remove_observer(&me);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::{StopCommand, UpdateCommand};
    use crate::simulator::ExecutionParams;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use lockstep_env::TokioContext;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn secs(s: i64) -> TimeDelta {
        TimeDelta::seconds(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_script_drives_update_and_stop() {
        let sim = Simulator::shared(TokioContext::shared());
        let script = TestScript {
            entries: vec![
                ScriptEntry {
                    action: ScriptAction::Update(UpdateCommand {
                        sim_update_time: t0() + secs(4),
                        time_scaling_factor: 4.0,
                    }),
                    trigger_time: t0() + secs(4),
                },
                ScriptEntry {
                    action: ScriptAction::Stop(StopCommand {
                        sim_stop_time: t0() + secs(8),
                    }),
                    trigger_time: t0() + secs(6),
                },
            ],
        };
        let observer = TestScriptObserver::new(script);
        sim.add_observer(observer.clone());

        let summary = sim
            .execute(ExecutionParams::new(t0(), secs(20), secs(1)).with_time_scale_factor(2.0))
            .await
            .unwrap();

        assert_eq!(summary.final_time, t0() + secs(8));
        assert_eq!(sim.time_scale_factor(), 4.0);
        assert!(observer.is_exhausted());
        // 0 -> 4 at scale 2, then 4 -> 8 at scale 4
        let elapsed = summary.wallclock_elapsed.num_milliseconds();
        assert!((elapsed - 3_000).abs() <= 20, "elapsed {} ms", elapsed);
    }

    #[tokio::test]
    async fn test_stop_fires_one_step_ahead() {
        let sim = Simulator::shared(TokioContext::shared());
        let observer = TestScriptObserver::new(TestScript {
            entries: vec![ScriptEntry {
                action: ScriptAction::Stop(StopCommand {
                    sim_stop_time: t0() + secs(5),
                }),
                trigger_time: t0() + secs(5),
            }],
        });
        sim.add_observer(observer.clone());

        // Fires at t = 4, so the step to 6 is never committed
        let summary = sim
            .execute(ExecutionParams::new(t0(), secs(20), secs(2)).with_time_scale_factor(0.0))
            .await
            .unwrap();

        assert_eq!(summary.final_time, t0() + secs(5));
        assert_eq!(summary.tocks, 3);
        assert!(observer.is_exhausted());
    }

    #[tokio::test]
    async fn test_exhausted_script_detaches() {
        let sim = Simulator::shared(TokioContext::shared());
        let observer = TestScriptObserver::new(TestScript {
            entries: vec![ScriptEntry {
                action: ScriptAction::Stop(StopCommand {
                    sim_stop_time: t0() + secs(2),
                }),
                trigger_time: t0(),
            }],
        });
        sim.add_observer(observer.clone());
        assert_eq!(sim.observer_count(), 1);

        let handle = sim.spawn_execute(
            ExecutionParams::new(t0(), secs(10), secs(1)).with_time_scale_factor(0.0),
        );
        let summary = handle.join().await.unwrap();

        assert_eq!(summary.final_time, t0() + secs(2));
        assert_eq!(observer.remaining(), 0);
    }
}
