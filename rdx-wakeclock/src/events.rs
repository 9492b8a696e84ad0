//! Defines all public event types broadcast by the Wakeclock engine.
//!
//! This module acts as the public API for the engine's event system. The UI,
//! audio and notification layers subscribe to these strongly-typed streams
//! instead of being called back directly.

use crate::alarm::Alarm;
use crate::common::{AlarmId, WakeKind};
use chrono::{DateTime, Utc};

/// What happened to an alarm, from the point of view of whoever renders it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyKind {
    /// The main alarm started ringing.
    Alert,
    /// The quieter pre-alarm started.
    Prealarm,
    /// The alarm was snoozed; a "snoozed until" notice should be shown.
    Snooze,
    /// Whatever was ringing for this alarm must stop.
    Dismiss,
    /// A pending snooze was withdrawn.
    CancelSnooze,
}

/// A fire-and-forget lifecycle notification. Emitted at most once per logical
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub alarm_id: AlarmId,
    pub kind: NotifyKind,
}

/// The next wake across all alarms, as shown by a "next alarm" indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextAlarm {
    pub alarm_id: AlarmId,
    pub at: DateTime<Utc>,
    pub kind: WakeKind,
    pub is_prealarm: bool,
}

/// Aggregate state pushed to observers whenever it changes.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// The full alarm list, ordered by id.
    AlarmsChanged(Vec<Alarm>),
    /// The globally earliest pending wake, or `None` when nothing is armed.
    NextAlarmChanged(Option<NextAlarm>),
}
