//! Contains common, primitive types shared by every Wakeclock component.
//!
//! This module defines the identity and schedule primitives used across the
//! engine: alarm ids, wake kinds, the weekday repeat mask, and the key type
//! the state machine engine uses for its state table. Using distinct types
//! keeps alarm ids from being confused with any other integer in the system.

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::fmt;

new_key_type! {
    /// Identifies a registered state node inside a `StateMachine`.
    ///
    /// Keys are handed out when a state is added and are only meaningful for the
    /// machine that issued them.
    pub struct StateKey;
}

/// Stable identity of an alarm.
///
/// Assigned by the persistence layer on first insert and immutable thereafter.
/// A freshly constructed alarm carries [`AlarmId::UNASSIGNED`] until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmId(pub i64);

impl AlarmId {
    pub const UNASSIGNED: AlarmId = AlarmId(-1);

    pub fn is_assigned(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of a pending wake request.
///
/// The ordering is used as the last tie-break when several wakes of the same
/// alarm coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeKind {
    Normal,
    Prealarm,
    Snooze,
}

/// A 7-bit weekday repeat mask. Bit 0 is Monday, bit 6 is Sunday.
///
/// An empty mask means the alarm is a one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaysOfWeek(u8);

impl DaysOfWeek {
    pub const NONE: DaysOfWeek = DaysOfWeek(0);
    pub const EVERY_DAY: DaysOfWeek = DaysOfWeek(0x7f);

    /// Builds a mask from raw bits, discarding anything above bit 6.
    pub fn from_bits(bits: u8) -> Self {
        DaysOfWeek(bits & 0x7f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_repeating(self) -> bool {
        self.0 != 0
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    #[must_use]
    pub fn with(self, day: Weekday) -> Self {
        DaysOfWeek(self.0 | (1 << day.num_days_from_monday()))
    }

    /// Parses a comma separated list such as `mon,wed,fri`, or `daily` / `never`.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "" | "never" | "once" => return Some(DaysOfWeek::NONE),
            "daily" | "all" => return Some(DaysOfWeek::EVERY_DAY),
            _ => {}
        }
        text.split(',')
            .map(|part| part.trim().parse::<Weekday>().ok())
            .try_fold(DaysOfWeek::NONE, |mask, day| day.map(|d| mask.with(d)))
    }
}

impl fmt::Display for DaysOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_repeating() {
            return write!(f, "once");
        }
        let days = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ];
        let names: Vec<String> = days
            .iter()
            .filter(|d| self.contains(**d))
            .map(|d| d.to_string())
            .collect();
        write!(f, "{}", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monday_is_bit_zero() {
        let mask = DaysOfWeek::NONE.with(Weekday::Mon);
        assert_eq!(mask.bits(), 1);
        assert!(mask.contains(Weekday::Mon));
        assert!(!mask.contains(Weekday::Sun));
        assert!(mask.is_repeating());
    }

    #[test]
    fn parses_day_lists() {
        let mask = DaysOfWeek::parse("mon, wed,fri").unwrap();
        assert!(mask.contains(Weekday::Wed));
        assert!(!mask.contains(Weekday::Tue));
        assert_eq!(DaysOfWeek::parse("daily"), Some(DaysOfWeek::EVERY_DAY));
        assert_eq!(DaysOfWeek::parse("never"), Some(DaysOfWeek::NONE));
        assert_eq!(DaysOfWeek::parse("mon,funday"), None);
    }

    #[test]
    fn from_bits_drops_the_high_bit() {
        assert_eq!(DaysOfWeek::from_bits(0xff), DaysOfWeek::EVERY_DAY);
    }
}
