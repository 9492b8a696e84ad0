//! # Wakeclock
//!
//! A crash-safe alarm engine for Rust.
//!
//! Wakeclock keeps a set of user-defined alarms moving through their lifecycle
//! (enabled, set, pre-alarm, firing, snoozed, dismissed) and makes sure exactly
//! one underlying wake timer is armed for the earliest pending wake across all
//! of them. Alarm state is persisted so the whole picture can be rebuilt after
//! the process dies, without replaying notifications that already went out.
//!
//! ## Core Concepts
//!
//! - **Hierarchical state machines**: every alarm is driven by its own instance
//!   of a generic, message-driven HSM (`hsm`), processed strictly in order on a
//!   dedicated task.
//! - **One timer, many wakes**: the `Scheduler` holds every alarm's pending
//!   wakes and re-arms the single `WakeTimer` only when the global minimum moves.
//! - **Event-Driven**: lifecycle notifications (`LifecycleEvent`) and aggregate
//!   state (`ObserverEvent`) are broadcast on channels that the UI, audio and
//!   notification layers subscribe to.
//! - **Configuration-Driven**: durations, retry policies and the timezone come
//!   from a `WakeclockConfig`, often loaded from a file.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use wakeclock::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WakeclockConfig::default();
//!     let store = Arc::new(JsonFileStore::new(config.store_path.clone()));
//!     let registry = AlarmRegistry::with_system_timer(config, store).await?;
//!
//!     let mut events = registry.subscribe_lifecycle_events();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{:?}", event);
//!         }
//!     });
//!
//!     let id = registry.create_new_alarm().await?;
//!     registry.edit(id, |e| e.at(7, 0).enabled(true)).await?;
//!     tokio::signal::ctrl_c().await?;
//!     registry.flush().await;
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "Wakeclock";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod alarm;
pub mod common;
pub mod config;
pub mod error;
pub mod events;
pub mod hsm;
pub mod registry;
mod retry;
pub mod scheduler;
pub mod store;
pub mod time;

/// A prelude module for easy importing of the most common Wakeclock types.
pub mod prelude {
    pub use crate::alarm::{Alarm, AlarmEdit, AlarmState};
    pub use crate::common::{AlarmId, DaysOfWeek, WakeKind};
    pub use crate::config::{RetryConfig, WakeclockConfig};
    pub use crate::error::{StoreError, TimerError, WakeclockError};
    pub use crate::events::{LifecycleEvent, NextAlarm, NotifyKind, ObserverEvent};
    pub use crate::registry::AlarmRegistry;
    pub use crate::scheduler::{ManualWakeTimer, ScheduledWake, Scheduler, TokioWakeTimer, WakeTimer};
    pub use crate::store::{AlarmRow, AlarmStore, JsonFileStore, MemoryStore};
    pub use crate::time::{Clock, ManualClock, SystemClock};
}
