//! Error types surfaced by the Wakeclock library.

use crate::common::AlarmId;
use crate::hsm::MachineError;
use thiserror::Error;

/// Errors returned by `AlarmRegistry` operations.
#[derive(Debug, Clone, Error)]
pub enum WakeclockError {
    /// The alarm does not exist, or was deleted while the request was in flight.
    #[error("alarm {0} not found")]
    NotFound(AlarmId),

    /// The store handed out an id that already belongs to a live alarm.
    #[error("alarm id {0} was assigned twice")]
    DuplicateId(AlarmId),

    #[error("{hour:02}:{minute:02} is not a valid time of day")]
    InvalidTime { hour: u32, minute: u32 },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// A lifecycle machine was misconfigured or received a message it cannot handle.
    #[error("state machine error: {0}")]
    Machine(#[from] MachineError),

    /// The change was applied, but the wake timer could not be armed for it.
    /// The wake stays pending and is armed as soon as the timer accepts it.
    #[error("{0}")]
    Timer(#[from] TimerError),
}

/// Errors reported by an `AlarmStore`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backing store cannot be reached right now; the call may be retried.
    #[error("store temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("alarm {0} is not in the store")]
    MissingRow(AlarmId),

    #[error("corrupt store contents: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Errors reported by a `WakeTimer`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("wake timer unavailable: {0}")]
    Unavailable(String),
}
