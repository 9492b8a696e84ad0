//! The global wake scheduler.
//!
//! Every alarm reports the set of wakes it currently wants; the scheduler keeps
//! the union and makes sure the single OS wake timer is armed for the earliest
//! one. All decisions happen under one lock, so "compute the minimum, re-arm if
//! it moved" is never interleaved between alarms.

mod timer;

pub use timer::{ManualWakeTimer, TokioWakeTimer, WakeTimer};

use crate::common::{AlarmId, WakeKind};
use crate::config::{RetryConfig, WakeclockConfig};
use crate::error::TimerError;
use crate::retry;
use crate::time::Clock;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

/// One pending wake for one alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledWake {
    pub alarm_id: AlarmId,
    pub kind: WakeKind,
    pub time: DateTime<Utc>,
}

impl ScheduledWake {
    fn order_key(&self) -> (DateTime<Utc>, AlarmId, WakeKind) {
        (self.time, self.alarm_id, self.kind)
    }
}

#[derive(Debug, Default)]
struct WakeSet {
    // At most one entry per (alarm, kind); a new schedule replaces the old one.
    wakes: BTreeMap<(AlarmId, WakeKind), DateTime<Utc>>,
    armed: Option<DateTime<Utc>>,
}

impl WakeSet {
    fn earliest(&self) -> Option<ScheduledWake> {
        self.wakes
            .iter()
            .map(|(&(alarm_id, kind), &time)| ScheduledWake {
                alarm_id,
                kind,
                time,
            })
            .min_by_key(ScheduledWake::order_key)
    }
}

pub struct Scheduler {
    state: Mutex<WakeSet>,
    timer: Arc<dyn WakeTimer>,
    clock: Arc<dyn Clock>,
    tolerance: Duration,
    retry: RetryConfig,
}

impl Scheduler {
    pub fn new(timer: Arc<dyn WakeTimer>, clock: Arc<dyn Clock>, config: &WakeclockConfig) -> Self {
        Self {
            state: Mutex::new(WakeSet::default()),
            timer,
            clock,
            tolerance: config.fire_tolerance(),
            retry: config.timer_retry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WakeSet> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces every wake held for `alarm_id` with `wakes`. An empty map
    /// withdraws the alarm from the schedule.
    ///
    /// An error means the OS timer could not be armed even after retrying.
    /// Every wake is still held, but the timer counts as unarmed until a later
    /// call succeeds, and [`armed_wake`](Self::armed_wake) reports nothing.
    pub fn schedule(
        &self,
        alarm_id: AlarmId,
        wakes: &BTreeMap<WakeKind, DateTime<Utc>>,
    ) -> Result<(), TimerError> {
        let mut set = self.lock();
        set.wakes.retain(|(id, _), _| *id != alarm_id);
        for (&kind, &time) in wakes {
            set.wakes.insert((alarm_id, kind), time);
        }
        debug!(alarm = %alarm_id, wakes = wakes.len(), total = set.wakes.len(), "schedule updated");
        self.rearm(&mut set, false)
    }

    pub fn cancel(&self, alarm_id: AlarmId) -> Result<(), TimerError> {
        self.schedule(alarm_id, &BTreeMap::new())
    }

    /// Handles the OS timer going off. Removes and returns every wake due by
    /// now (within the configured tolerance), ordered by time, then alarm id,
    /// then kind; the timer is re-armed for whatever remains.
    pub fn on_timer_fired(&self) -> Vec<ScheduledWake> {
        let mut set = self.lock();
        let now = self.clock.now();
        let horizon = now.checked_add_signed(self.tolerance).unwrap_or(now);

        let mut due: Vec<ScheduledWake> = set
            .wakes
            .iter()
            .filter(|(_, time)| **time <= horizon)
            .map(|(&(alarm_id, kind), &time)| ScheduledWake {
                alarm_id,
                kind,
                time,
            })
            .collect();
        for wake in &due {
            set.wakes.remove(&(wake.alarm_id, wake.kind));
        }
        due.sort_by_key(ScheduledWake::order_key);

        // A fired timer is spent: arm or cancel it even if the minimum is unchanged.
        if let Err(err) = self.rearm(&mut set, true) {
            error!(%err, "could not re-arm after timer fired");
        }
        info!(due = due.len(), remaining = set.wakes.len(), "wake timer fired");
        due
    }

    fn rearm(&self, set: &mut WakeSet, force: bool) -> Result<(), TimerError> {
        let target = set.wakes.values().min().copied();
        if target == set.armed && !force {
            return Ok(());
        }
        let result = match target {
            Some(at) => retry::blocking(self.retry, "arming wake timer", |_| true, || {
                self.timer.arm_at(at)
            }),
            None => retry::blocking(self.retry, "cancelling wake timer", |_| true, || {
                self.timer.cancel()
            }),
        };
        match result {
            Ok(()) => {
                debug!(armed = ?target, "wake timer updated");
                set.armed = target;
                Ok(())
            }
            Err(err) => {
                error!(
                    %err,
                    pending = set.wakes.len(),
                    "wake timer unavailable, schedule held until it can be armed"
                );
                set.armed = None;
                self.timer.cancel().ok();
                Err(err)
            }
        }
    }

    /// The globally earliest pending wake.
    pub fn next_wake(&self) -> Option<ScheduledWake> {
        self.lock().earliest()
    }

    pub fn wakes_for(&self, alarm_id: AlarmId) -> BTreeMap<WakeKind, DateTime<Utc>> {
        self.lock()
            .wakes
            .iter()
            .filter(|((id, _), _)| *id == alarm_id)
            .map(|(&(_, kind), &time)| (kind, time))
            .collect()
    }

    /// The earliest pending wake, but only while the OS timer is actually armed
    /// for it.
    pub fn armed_wake(&self) -> Option<ScheduledWake> {
        let set = self.lock();
        set.earliest().filter(|wake| set.armed == Some(wake.time))
    }

    /// What the scheduler believes the OS timer is armed for.
    pub fn armed_at(&self) -> Option<DateTime<Utc>> {
        self.lock().armed
    }

    pub fn len(&self) -> usize {
        self.lock().wakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    fn setup() -> (Scheduler, Arc<ManualWakeTimer>, Arc<ManualClock>) {
        let timer = Arc::new(ManualWakeTimer::new());
        let clock = Arc::new(ManualClock::new(at(6, 0)));
        let config = WakeclockConfig {
            timer_retry: RetryConfig {
                attempts: 3,
                interval_ms: 0,
            },
            ..WakeclockConfig::default()
        };
        let scheduler = Scheduler::new(timer.clone(), clock.clone(), &config);
        (scheduler, timer, clock)
    }

    fn wakes(entries: &[(WakeKind, DateTime<Utc>)]) -> BTreeMap<WakeKind, DateTime<Utc>> {
        entries.iter().copied().collect()
    }

    #[test]
    fn timer_tracks_the_global_minimum() {
        let (scheduler, timer, _) = setup();
        scheduler
            .schedule(AlarmId(1), &wakes(&[(WakeKind::Normal, at(8, 0))]))
            .unwrap();
        assert_eq!(timer.armed(), Some(at(8, 0)));

        scheduler
            .schedule(AlarmId(2), &wakes(&[(WakeKind::Normal, at(7, 0))]))
            .unwrap();
        assert_eq!(timer.armed(), Some(at(7, 0)));

        scheduler.cancel(AlarmId(2)).unwrap();
        assert_eq!(timer.armed(), Some(at(8, 0)));

        scheduler.cancel(AlarmId(1)).unwrap();
        assert_eq!(timer.armed(), None);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn unchanged_minimum_does_not_rearm() {
        let (scheduler, timer, _) = setup();
        scheduler
            .schedule(AlarmId(1), &wakes(&[(WakeKind::Normal, at(7, 0))]))
            .unwrap();
        scheduler
            .schedule(AlarmId(2), &wakes(&[(WakeKind::Normal, at(9, 0))]))
            .unwrap();
        scheduler
            .schedule(AlarmId(1), &wakes(&[(WakeKind::Normal, at(7, 0))]))
            .unwrap();
        assert_eq!(timer.arm_calls(), 1);
    }

    #[test]
    fn schedule_replaces_rather_than_accumulates() {
        let (scheduler, _, _) = setup();
        let id = AlarmId(4);
        scheduler
            .schedule(
                id,
                &wakes(&[(WakeKind::Prealarm, at(6, 30)), (WakeKind::Normal, at(7, 0))]),
            )
            .unwrap();
        scheduler
            .schedule(id, &wakes(&[(WakeKind::Normal, at(7, 30))]))
            .unwrap();
        assert_eq!(scheduler.wakes_for(id), wakes(&[(WakeKind::Normal, at(7, 30))]));
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn coinciding_wakes_fire_together_in_id_order() {
        let (scheduler, timer, clock) = setup();
        scheduler
            .schedule(AlarmId(3), &wakes(&[(WakeKind::Normal, at(7, 0))]))
            .unwrap();
        scheduler
            .schedule(
                AlarmId(1),
                &wakes(&[(WakeKind::Normal, at(7, 0)), (WakeKind::Snooze, at(6, 59))]),
            )
            .unwrap();
        scheduler
            .schedule(AlarmId(2), &wakes(&[(WakeKind::Normal, at(9, 0))]))
            .unwrap();

        clock.set(at(7, 0));
        let due = scheduler.on_timer_fired();
        let order: Vec<_> = due.iter().map(|w| (w.alarm_id, w.kind)).collect();
        assert_eq!(
            order,
            vec![
                (AlarmId(1), WakeKind::Snooze),
                (AlarmId(1), WakeKind::Normal),
                (AlarmId(3), WakeKind::Normal),
            ]
        );
        assert_eq!(timer.armed(), Some(at(9, 0)));
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn tolerance_includes_wakes_just_ahead() {
        let (scheduler, _, clock) = setup();
        let soon = at(7, 0) + Duration::milliseconds(400);
        scheduler
            .schedule(AlarmId(1), &wakes(&[(WakeKind::Normal, soon)]))
            .unwrap();
        clock.set(at(7, 0));
        assert_eq!(scheduler.on_timer_fired().len(), 1);
    }

    #[test]
    fn spurious_fire_rearms_for_the_same_instant() {
        let (scheduler, timer, _) = setup();
        scheduler
            .schedule(AlarmId(1), &wakes(&[(WakeKind::Normal, at(7, 0))]))
            .unwrap();
        assert!(scheduler.on_timer_fired().is_empty());
        assert_eq!(timer.arm_calls(), 2);
        assert_eq!(timer.armed(), Some(at(7, 0)));
    }

    #[test]
    fn transient_timer_failure_is_retried() {
        let (scheduler, timer, _) = setup();
        timer.fail_next(2);
        scheduler
            .schedule(AlarmId(1), &wakes(&[(WakeKind::Normal, at(7, 0))]))
            .unwrap();
        assert_eq!(timer.armed(), Some(at(7, 0)));
        assert_eq!(timer.arm_calls(), 3);
    }

    #[test]
    fn exhausted_retries_hold_every_wake_until_the_timer_returns() {
        let (scheduler, timer, _) = setup();
        scheduler
            .schedule(AlarmId(1), &wakes(&[(WakeKind::Normal, at(8, 0))]))
            .unwrap();
        timer.fail_next(3);
        let result = scheduler.schedule(AlarmId(2), &wakes(&[(WakeKind::Normal, at(7, 0))]));
        assert!(result.is_err());
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.armed_at(), None);
        assert_eq!(timer.armed(), None);
        assert_eq!(scheduler.armed_wake(), None);

        scheduler
            .schedule(AlarmId(3), &wakes(&[(WakeKind::Normal, at(9, 0))]))
            .unwrap();
        assert_eq!(timer.armed(), Some(at(7, 0)));
        assert_eq!(scheduler.armed_wake().map(|w| w.alarm_id), Some(AlarmId(2)));
        assert_eq!(scheduler.wakes_for(AlarmId(1)), wakes(&[(WakeKind::Normal, at(8, 0))]));
    }

    #[test]
    fn firing_the_last_wake_cancels_the_timer() {
        let (scheduler, timer, clock) = setup();
        scheduler
            .schedule(AlarmId(1), &wakes(&[(WakeKind::Normal, at(7, 0))]))
            .unwrap();
        clock.set(at(7, 0));
        assert_eq!(scheduler.on_timer_fired().len(), 1);
        assert_eq!(timer.armed(), None);
        assert_eq!(timer.cancel_calls(), 1);
        assert_eq!(scheduler.armed_at(), None);

        scheduler.cancel(AlarmId(1)).unwrap();
        assert_eq!(timer.cancel_calls(), 1);
    }

    #[test]
    fn huge_tolerance_does_not_overflow() {
        let timer = Arc::new(ManualWakeTimer::new());
        let clock = Arc::new(ManualClock::new(at(6, 0)));
        let config = WakeclockConfig {
            fire_tolerance_ms: u64::MAX,
            ..WakeclockConfig::default()
        };
        let scheduler = Scheduler::new(timer, clock, &config);
        scheduler
            .schedule(AlarmId(1), &wakes(&[(WakeKind::Normal, at(7, 0))]))
            .unwrap();
        // An unrepresentable horizon falls back to now.
        assert!(scheduler.on_timer_fired().is_empty());
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn next_wake_reports_kind_and_owner() {
        let (scheduler, _, _) = setup();
        scheduler
            .schedule(
                AlarmId(5),
                &wakes(&[(WakeKind::Prealarm, at(6, 30)), (WakeKind::Normal, at(7, 0))]),
            )
            .unwrap();
        assert_eq!(
            scheduler.next_wake(),
            Some(ScheduledWake {
                alarm_id: AlarmId(5),
                kind: WakeKind::Prealarm,
                time: at(6, 30),
            })
        );
    }
}
