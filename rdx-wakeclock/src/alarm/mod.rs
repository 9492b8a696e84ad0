//! One lifecycle machine per alarm.
//!
//! - `model` holds the alarm record and occurrence math.
//! - `machine` defines the alarm's state hierarchy and its handlers on top of
//!   the generic `hsm` engine.
//! - `actor` runs each machine on its own tokio task with a FIFO mailbox, so
//!   one alarm never processes two messages at once while distinct alarms
//!   proceed independently.

pub(crate) mod actor;
pub mod machine;
pub mod model;

pub use machine::{
    messages, restore, run_to_idle, start_new, AlarmBehavior, AlarmMachine, AlarmMessage,
    AlarmMsg, AlarmPayload, AlarmServices, AlarmState,
};
pub use model::{next_occurrence, Alarm, AlarmEdit};
