//! The persistence contract and the fire-and-forget writer in front of it.
//!
//! Reads happen once, at startup, with bounded retry. Writes are queued to a
//! single writer task and applied in submission order; a lifecycle machine
//! never waits for one to land.

mod json;
mod memory;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use crate::alarm::{Alarm, AlarmState};
use crate::common::{AlarmId, DaysOfWeek};
use crate::config::RetryConfig;
use crate::error::StoreError;
use crate::retry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// The persisted form of an alarm. `state` is the symbolic name of the
/// lifecycle leaf state, so the machine can be rebuilt exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRow {
    pub id: AlarmId,
    pub hour: u32,
    pub minute: u32,
    pub days_of_week: DaysOfWeek,
    pub enabled: bool,
    pub is_prealarm: bool,
    pub vibrate: bool,
    pub label: String,
    pub alert_uri: Option<String>,
    pub next_time: DateTime<Utc>,
    pub prealarm_time: DateTime<Utc>,
    pub snoozed_time: DateTime<Utc>,
    pub is_snoozed: bool,
    pub state: String,
}

impl From<&Alarm> for AlarmRow {
    fn from(alarm: &Alarm) -> Self {
        Self {
            id: alarm.id,
            hour: alarm.hour,
            minute: alarm.minute,
            days_of_week: alarm.days_of_week,
            enabled: alarm.enabled,
            is_prealarm: alarm.is_prealarm,
            vibrate: alarm.vibrate,
            label: alarm.label.clone(),
            alert_uri: alarm.alert_uri.clone(),
            next_time: alarm.next_time,
            prealarm_time: alarm.prealarm_time,
            snoozed_time: alarm.snoozed_time,
            is_snoozed: alarm.is_snoozed,
            state: alarm.state.as_str().to_string(),
        }
    }
}

impl AlarmRow {
    /// Converts back to an `Alarm`. The second value is the persisted leaf
    /// state, or `None` when the stored name is not a state a machine can be
    /// resumed in.
    pub fn into_alarm(self) -> (Alarm, Option<AlarmState>) {
        let restored = self
            .state
            .parse::<AlarmState>()
            .ok()
            .filter(|s| s.is_resumable());
        let alarm = Alarm {
            id: self.id,
            hour: self.hour,
            minute: self.minute,
            days_of_week: self.days_of_week,
            enabled: self.enabled,
            is_prealarm: self.is_prealarm,
            vibrate: self.vibrate,
            label: self.label,
            alert_uri: self.alert_uri,
            next_time: self.next_time,
            prealarm_time: self.prealarm_time,
            snoozed_time: self.snoozed_time,
            is_snoozed: self.is_snoozed,
            state: restored.unwrap_or(AlarmState::Disabled),
        };
        (alarm, restored)
    }
}

/// A backing store for alarms.
///
/// Calls are blocking; async callers go through `spawn_blocking`.
pub trait AlarmStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<AlarmRow>, StoreError>;

    /// Stores a new row and returns the id assigned to it. The row's own id is ignored.
    fn insert(&self, row: &AlarmRow) -> Result<AlarmId, StoreError>;

    fn update(&self, id: AlarmId, row: &AlarmRow) -> Result<(), StoreError>;

    fn delete(&self, id: AlarmId) -> Result<(), StoreError>;
}

/// A queued write.
#[derive(Debug)]
pub enum WriteOp {
    Update(AlarmRow),
    Delete(AlarmId),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle that queues writes for the writer task.
#[derive(Debug, Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
}

/// The receiving end of a `StoreWriter`, drained by [`WriteQueue::spawn`].
#[derive(Debug)]
pub struct WriteQueue {
    rx: mpsc::UnboundedReceiver<WriteOp>,
}

impl StoreWriter {
    pub fn channel() -> (StoreWriter, WriteQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StoreWriter { tx }, WriteQueue { rx })
    }

    pub fn update(&self, row: AlarmRow) {
        debug!(alarm = %row.id, state = %row.state, "queueing alarm write");
        if self.tx.send(WriteOp::Update(row)).is_err() {
            warn!("store writer is gone, alarm update dropped");
        }
    }

    pub fn delete(&self, id: AlarmId) {
        if self.tx.send(WriteOp::Delete(id)).is_err() {
            warn!(alarm = %id, "store writer is gone, alarm delete dropped");
        }
    }

    /// Resolves once every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriteOp::Flush(done)).is_ok() {
            wait.await.ok();
        }
    }
}

impl WriteQueue {
    /// Takes the next queued op without waiting. Useful when no writer task runs.
    pub fn try_next(&mut self) -> Option<WriteOp> {
        self.rx.try_recv().ok()
    }

    /// Spawns the writer task. Each write is retried per `retry`; a write that
    /// still fails is logged and skipped.
    pub fn spawn(mut self, store: Arc<dyn AlarmStore>, retry: RetryConfig) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(op) = self.rx.recv().await {
                match op {
                    WriteOp::Flush(done) => {
                        done.send(()).ok();
                    }
                    op => {
                        let store = store.clone();
                        let applied =
                            tokio::task::spawn_blocking(move || apply(store.as_ref(), retry, op))
                                .await;
                        if let Err(err) = applied {
                            error!(%err, "store write panicked");
                        }
                    }
                }
            }
            debug!("store writer stopped");
        })
    }
}

fn apply(store: &dyn AlarmStore, policy: RetryConfig, op: WriteOp) {
    let (id, result) = match &op {
        WriteOp::Update(row) => (
            row.id,
            retry::blocking(policy, "alarm update", StoreError::is_transient, || {
                store.update(row.id, row)
            }),
        ),
        WriteOp::Delete(id) => (
            *id,
            retry::blocking(policy, "alarm delete", StoreError::is_transient, || {
                store.delete(*id)
            }),
        ),
        WriteOp::Flush(_) => return,
    };
    if let Err(err) = result {
        error!(alarm = %id, %err, "alarm write skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Tz;

    fn sample_row() -> AlarmRow {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        AlarmRow::from(&Alarm::new(now, Tz::UTC))
    }

    #[test]
    fn unknown_state_names_are_not_resumable() {
        let mut row = sample_row();
        row.state = "RINGING_SIDEWAYS".to_string();
        let (alarm, restored) = row.into_alarm();
        assert_eq!(restored, None);
        assert_eq!(alarm.state, AlarmState::Disabled);
    }

    #[test]
    fn composite_state_names_are_not_resumable() {
        let mut row = sample_row();
        row.state = "FIRED".to_string();
        assert_eq!(row.into_alarm().1, None);
    }

    #[test]
    fn leaf_state_names_round_trip() {
        let mut row = sample_row();
        row.state = "SNOOZED_SET".to_string();
        assert_eq!(row.into_alarm().1, Some(AlarmState::SnoozedSet));
    }

    #[tokio::test]
    async fn writer_retries_transient_failures() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert(&sample_row()).unwrap();
        store.fail_next(2);

        let (writer, queue) = StoreWriter::channel();
        queue.spawn(
            store.clone(),
            RetryConfig {
                attempts: 3,
                interval_ms: 1,
            },
        );

        let mut row = sample_row();
        row.id = id;
        row.label = "gym".to_string();
        writer.update(row);
        writer.flush().await;

        assert_eq!(store.row(id).unwrap().label, "gym");
    }

    #[tokio::test]
    async fn writer_skips_writes_after_exhausting_retries() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert(&sample_row()).unwrap();
        store.fail_next(5);

        let (writer, queue) = StoreWriter::channel();
        queue.spawn(
            store.clone(),
            RetryConfig {
                attempts: 2,
                interval_ms: 1,
            },
        );

        let mut row = sample_row();
        row.id = id;
        row.label = "lost".to_string();
        writer.update(row);
        writer.delete(id);
        writer.flush().await;

        // The update gave up after two tries; the delete burned the remaining failures.
        assert!(store.row(id).is_some());
        assert_eq!(store.row(id).unwrap().label, "");
    }
}
