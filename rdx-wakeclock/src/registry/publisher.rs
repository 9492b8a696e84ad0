use crate::alarm::Alarm;
use crate::common::{AlarmId, WakeKind};
use crate::events::{NextAlarm, ObserverEvent};
use crate::scheduler::Scheduler;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::trace;

/// Keeps the latest snapshot of every alarm and pushes observer events when
/// the aggregate list or the next wake actually changes.
pub struct Publisher {
    board: RwLock<BTreeMap<AlarmId, Alarm>>,
    scheduler: Arc<Scheduler>,
    sender: broadcast::Sender<ObserverEvent>,
    last: Mutex<Published>,
}

#[derive(Default)]
struct Published {
    alarms: Option<Vec<Alarm>>,
    next: Option<Option<NextAlarm>>,
}

impl Publisher {
    pub(crate) fn new(scheduler: Arc<Scheduler>, sender: broadcast::Sender<ObserverEvent>) -> Self {
        Self {
            board: RwLock::new(BTreeMap::new()),
            scheduler,
            sender,
            last: Mutex::new(Published::default()),
        }
    }

    pub(crate) fn record(&self, alarm: &Alarm) {
        self.board
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alarm.id, alarm.clone());
    }

    pub(crate) fn remove(&self, id: AlarmId) {
        self.board
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub(crate) fn get(&self, id: AlarmId) -> Option<Alarm> {
        self.board
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Every alarm, ordered by id.
    pub(crate) fn alarms(&self) -> Vec<Alarm> {
        self.board
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// The next wake the timer is really armed for. `None` while the timer is down.
    pub(crate) fn next_alarm(&self) -> Option<NextAlarm> {
        self.scheduler.armed_wake().map(|wake| NextAlarm {
            alarm_id: wake.alarm_id,
            at: wake.time,
            kind: wake.kind,
            is_prealarm: wake.kind == WakeKind::Prealarm,
        })
    }

    pub(crate) fn publish(&self) {
        // Held across the snapshot so concurrent publishers cannot reorder.
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);

        let alarms = self.alarms();
        if last.alarms.as_ref() != Some(&alarms) {
            trace!(count = alarms.len(), "alarm list changed");
            self.sender
                .send(ObserverEvent::AlarmsChanged(alarms.clone()))
                .ok();
            last.alarms = Some(alarms);
        }

        let next = self.next_alarm();
        if last.next != Some(next) {
            trace!(?next, "next alarm changed");
            self.sender.send(ObserverEvent::NextAlarmChanged(next)).ok();
            last.next = Some(next);
        }
    }
}
