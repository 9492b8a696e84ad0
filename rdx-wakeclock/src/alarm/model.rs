//! The alarm record and the wall-clock math that turns it into instants.

use super::machine::AlarmState;
use crate::common::{AlarmId, DaysOfWeek};
use crate::error::WakeclockError;
use chrono::{DateTime, Datelike, Duration, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

pub const DEFAULT_ALERT: &str = "default";

/// A user-visible alarm.
///
/// `next_time`, `prealarm_time` and `snoozed_time` are derived values owned by
/// the alarm's lifecycle machine. They are replaced wholesale whenever the
/// schedule changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Alarm {
    pub id: AlarmId,
    pub hour: u32,
    pub minute: u32,
    pub days_of_week: DaysOfWeek,
    pub enabled: bool,
    pub is_prealarm: bool,
    pub vibrate: bool,
    pub label: String,
    /// `None` means the alarm is silent.
    pub alert_uri: Option<String>,
    pub next_time: DateTime<Utc>,
    pub prealarm_time: DateTime<Utc>,
    pub snoozed_time: DateTime<Utc>,
    pub is_snoozed: bool,
    pub state: AlarmState,
}

impl Alarm {
    /// A disabled, non-repeating alarm set to the current local time.
    pub fn new(now: DateTime<Utc>, tz: Tz) -> Self {
        let local = now.with_timezone(&tz);
        Self {
            id: AlarmId::UNASSIGNED,
            hour: local.hour(),
            minute: local.minute(),
            days_of_week: DaysOfWeek::NONE,
            enabled: false,
            is_prealarm: false,
            vibrate: true,
            label: String::new(),
            alert_uri: Some(DEFAULT_ALERT.to_string()),
            next_time: now,
            prealarm_time: now,
            snoozed_time: now,
            is_snoozed: false,
            state: AlarmState::Disabled,
        }
    }

    /// Starts an edit from the alarm's current user-editable fields.
    pub fn edit(&self) -> AlarmEdit {
        AlarmEdit {
            hour: self.hour,
            minute: self.minute,
            days_of_week: self.days_of_week,
            enabled: self.enabled,
            is_prealarm: self.is_prealarm,
            vibrate: self.vibrate,
            label: self.label.clone(),
            alert_uri: self.alert_uri.clone(),
        }
    }

    pub(crate) fn apply(&mut self, edit: &AlarmEdit) {
        self.hour = edit.hour;
        self.minute = edit.minute;
        self.days_of_week = edit.days_of_week;
        self.enabled = edit.enabled;
        self.is_prealarm = edit.is_prealarm;
        self.vibrate = edit.vibrate;
        self.label = edit.label.clone();
        self.alert_uri = edit.alert_uri.clone();
    }
}

/// The user-editable subset of an alarm, committed as one `CHANGE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmEdit {
    pub hour: u32,
    pub minute: u32,
    pub days_of_week: DaysOfWeek,
    pub enabled: bool,
    pub is_prealarm: bool,
    pub vibrate: bool,
    pub label: String,
    pub alert_uri: Option<String>,
}

impl AlarmEdit {
    #[must_use]
    pub fn at(self, hour: u32, minute: u32) -> Self {
        Self {
            hour,
            minute,
            ..self
        }
    }

    #[must_use]
    pub fn on_days(self, days_of_week: DaysOfWeek) -> Self {
        Self {
            days_of_week,
            ..self
        }
    }

    #[must_use]
    pub fn enabled(self, enabled: bool) -> Self {
        Self { enabled, ..self }
    }

    #[must_use]
    pub fn prealarm(self, is_prealarm: bool) -> Self {
        Self {
            is_prealarm,
            ..self
        }
    }

    #[must_use]
    pub fn labelled(self, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), WakeclockError> {
        validate_time_of_day(self.hour, self.minute)
    }
}

pub(crate) fn validate_time_of_day(hour: u32, minute: u32) -> Result<(), WakeclockError> {
    if hour > 23 || minute > 59 {
        return Err(WakeclockError::InvalidTime { hour, minute });
    }
    Ok(())
}

/// The first instant strictly after `after` at which `hour:minute` local time
/// falls on a day allowed by `days`. An empty mask allows any day.
pub fn next_occurrence(
    hour: u32,
    minute: u32,
    days: DaysOfWeek,
    after: DateTime<Utc>,
    tz: Tz,
) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), minute.min(59), 0).unwrap_or(NaiveTime::MIN);
    let today = after.with_timezone(&tz).date_naive();

    for offset in 0..=7 {
        let date = today + Duration::days(offset);
        if days.is_repeating() && !days.contains(date.weekday()) {
            continue;
        }
        let candidate = resolve_local(tz, date.and_time(time));
        if candidate > after {
            return candidate;
        }
    }
    // Eight consecutive days always contain an allowed weekday later than `after`.
    after + Duration::days(1)
}

/// Maps a local wall-clock time to an instant. Ambiguous times take the
/// earlier instant; times skipped by a DST jump move forward by the gap.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    if let Some(t) = tz.from_local_datetime(&local).earliest() {
        return t.with_timezone(&Utc);
    }
    let shifted = local + Duration::hours(1);
    tz.from_local_datetime(&shifted)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&shifted))
}
