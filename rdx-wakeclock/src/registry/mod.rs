//! The alarm registry that orchestrates the whole Wakeclock system.

mod publisher;

pub(crate) use publisher::Publisher;

use crate::alarm::{self, actor, actor::Mailbox, messages, Alarm, AlarmEdit, AlarmMessage, AlarmServices};
use crate::common::AlarmId;
use crate::config::{RetryConfig, WakeclockConfig};
use crate::error::{StoreError, WakeclockError};
use crate::events::{LifecycleEvent, NextAlarm, ObserverEvent};
use crate::retry;
use crate::scheduler::{Scheduler, TokioWakeTimer, WakeTimer};
use crate::store::{AlarmRow, AlarmStore, StoreWriter};
use crate::time::{Clock, SystemClock};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The registry of live alarms.
///
/// This struct is the single point of control for alarms. It loads them at
/// startup, owns one lifecycle machine per alarm, routes user actions and timer
/// firings to the right machine, and republishes the aggregate state. It is
/// cheap to clone; every clone is a handle to the same running instance.
#[derive(Clone)]
pub struct AlarmRegistry {
    services: Arc<AlarmServices>,
    store: Arc<dyn AlarmStore>,
    alarms: Arc<RwLock<HashMap<AlarmId, Mailbox>>>,
    publisher: Arc<Publisher>,
    lifecycle_event_sender: broadcast::Sender<LifecycleEvent>,
    observer_event_sender: broadcast::Sender<ObserverEvent>,
}

// Core implementation block for internal logic.
impl AlarmRegistry {
    /// Boots a registry: loads every persisted alarm, resumes its machine
    /// silently, and publishes the resulting state.
    ///
    /// A store that stays unreadable past the load retry policy leaves the
    /// registry running with no alarms.
    pub async fn start(
        config: WakeclockConfig,
        store: Arc<dyn AlarmStore>,
        timer: Arc<dyn WakeTimer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (lifecycle_event_sender, _) = broadcast::channel(capacity);
        let (observer_event_sender, _) = broadcast::channel(capacity);

        let scheduler = Arc::new(Scheduler::new(timer, clock.clone(), &config));
        let (writer, queue) = StoreWriter::channel();
        queue.spawn(store.clone(), config.write_retry);
        let publisher = Arc::new(Publisher::new(
            scheduler.clone(),
            observer_event_sender.clone(),
        ));
        let services = Arc::new(AlarmServices {
            config,
            clock,
            scheduler,
            writer,
            notifier: lifecycle_event_sender.clone(),
        });

        let registry = Self {
            services,
            store,
            alarms: Arc::new(RwLock::new(HashMap::new())),
            publisher,
            lifecycle_event_sender,
            observer_event_sender,
        };

        let rows = registry.load_rows().await;
        for row in rows {
            let id = row.id;
            if !id.is_assigned() {
                warn!(alarm = %id, "skipping persisted alarm without an id");
                continue;
            }
            let attached = match alarm::restore(row, registry.services.clone()) {
                Ok(machine) => registry.attach(id, machine).await,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = attached {
                error!(alarm = %id, %err, "could not restore alarm");
            }
        }
        registry.publisher.publish();
        info!(
            alarms = registry.alarms.read().await.len(),
            wakes = registry.services.scheduler.len(),
            "alarm registry started"
        );
        registry
    }

    /// Boots a registry on the host clock with a tokio-backed wake timer, and
    /// spawns the task that turns timer firings into alarm events.
    pub async fn with_system_timer(
        config: WakeclockConfig,
        store: Arc<dyn AlarmStore>,
    ) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (timer, fired) = TokioWakeTimer::new(clock.clone())?;
        let registry = Self::start(config, store, Arc::new(timer), clock).await;
        registry.spawn_timer_listener(fired);
        Ok(registry)
    }

    #[doc(hidden)]
    async fn load_rows(&self) -> Vec<AlarmRow> {
        let policy = self.services.config.load_retry;
        match self.with_store(policy, "loading alarms", |store| store.load_all()).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(%err, "could not load alarms, starting with none");
                Vec::new()
            }
        }
    }

    /// Runs a blocking store call off the async workers, retrying transient failures.
    #[doc(hidden)]
    async fn with_store<T, F>(
        &self,
        policy: RetryConfig,
        what: &str,
        op: F,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&dyn AlarmStore) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        retry::backoff(policy, what, StoreError::is_transient, || {
            let store = self.store.clone();
            let op = op.clone();
            async move {
                tokio::task::spawn_blocking(move || (*op)(store.as_ref()))
                    .await
                    .unwrap_or_else(|err| Err(StoreError::Unavailable(err.to_string())))
            }
        })
        .await
    }

    #[doc(hidden)]
    async fn attach(&self, id: AlarmId, machine: alarm::AlarmMachine) -> Result<(), WakeclockError> {
        if self.alarms.read().await.contains_key(&id) {
            error!(alarm = %id, "alarm id assigned twice");
            return Err(WakeclockError::DuplicateId(id));
        }
        // Construction may wait on timer retries; the map stays unlocked meanwhile.
        let mailbox = actor::spawn(machine, self.publisher.clone())?;
        match self.alarms.write().await.entry(id) {
            Entry::Occupied(_) => {
                error!(alarm = %id, "alarm id assigned twice");
                Err(WakeclockError::DuplicateId(id))
            }
            Entry::Vacant(slot) => {
                slot.insert(mailbox);
                debug!(alarm = %id, "alarm attached");
                Ok(())
            }
        }
    }

    #[doc(hidden)]
    async fn mailbox(&self, id: AlarmId) -> Result<Mailbox, WakeclockError> {
        self.alarms
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(WakeclockError::NotFound(id))
    }

    #[doc(hidden)]
    async fn request(&self, id: AlarmId, msg: AlarmMessage) -> Result<Alarm, WakeclockError> {
        self.mailbox(id).await?.request(msg).await
    }
}

// Public API implementation block.
impl AlarmRegistry {
    /// Creates a disabled, non-repeating alarm at the current local time.
    ///
    /// The alarm is persisted first to obtain its id. If the store cannot take
    /// the insert, no alarm is created and the storage error is returned.
    pub async fn create_new_alarm(&self) -> Result<AlarmId, WakeclockError> {
        let mut alarm = Alarm::new(self.services.clock.now(), self.services.config.timezone);
        let row = AlarmRow::from(&alarm);
        let policy = self.services.config.write_retry;
        let id = self
            .with_store(policy, "inserting alarm", move |store| store.insert(&row))
            .await?;

        alarm.id = id;
        let machine = alarm::start_new(alarm, self.services.clone())?;
        self.attach(id, machine).await?;
        self.publisher.publish();
        info!(alarm = %id, "alarm created");
        Ok(id)
    }

    /// Turns an alarm on or off.
    pub async fn enable(&self, id: AlarmId, enabled: bool) -> Result<Alarm, WakeclockError> {
        self.request(id, messages::enable(enabled)).await
    }

    /// Commits an edit. The schedule is recomputed from the new fields.
    pub async fn change(&self, id: AlarmId, edit: AlarmEdit) -> Result<Alarm, WakeclockError> {
        edit.validate()?;
        self.request(id, messages::change(edit)).await
    }

    /// Builds an edit from the alarm's current fields and commits it.
    pub async fn edit(
        &self,
        id: AlarmId,
        update: impl FnOnce(AlarmEdit) -> AlarmEdit,
    ) -> Result<Alarm, WakeclockError> {
        let current = self.get_alarm(id)?;
        self.change(id, update(current.edit())).await
    }

    /// Snoozes a ringing alarm for the configured default duration.
    pub async fn snooze(&self, id: AlarmId) -> Result<Alarm, WakeclockError> {
        self.request(id, messages::snooze()).await
    }

    /// Snoozes a ringing alarm until the next `hour:minute` local time.
    pub async fn snooze_until(
        &self,
        id: AlarmId,
        hour: u32,
        minute: u32,
    ) -> Result<Alarm, WakeclockError> {
        alarm::model::validate_time_of_day(hour, minute)?;
        self.request(id, messages::snooze_until(hour, minute)).await
    }

    pub async fn dismiss(&self, id: AlarmId) -> Result<Alarm, WakeclockError> {
        self.request(id, messages::dismiss()).await
    }

    /// Deletes an alarm, withdrawing its wakes and removing its stored row.
    pub async fn delete(&self, id: AlarmId) -> Result<(), WakeclockError> {
        let mailbox = self
            .alarms
            .write()
            .await
            .remove(&id)
            .ok_or(WakeclockError::NotFound(id))?;
        mailbox.request(messages::delete()).await?;
        Ok(())
    }

    pub fn get_alarm(&self, id: AlarmId) -> Result<Alarm, WakeclockError> {
        self.publisher.get(id).ok_or(WakeclockError::NotFound(id))
    }

    /// Every live alarm, ordered by id.
    pub fn get_alarms_list(&self) -> Vec<Alarm> {
        self.publisher.alarms()
    }

    /// The globally earliest pending wake.
    pub fn next_alarm(&self) -> Option<NextAlarm> {
        self.publisher.next_alarm()
    }

    /// Delivers every wake that is due to its alarm, in time order, and waits
    /// until each alarm has processed it.
    pub async fn on_timer_fired(&self) {
        let due = self.services.scheduler.on_timer_fired();
        for wake in due {
            let delivered = match self.mailbox(wake.alarm_id).await {
                Ok(mailbox) => mailbox.request(messages::fired(wake.kind, wake.time)).await,
                Err(err) => Err(err),
            };
            match delivered {
                Ok(alarm) => debug!(alarm = %alarm.id, state = %alarm.state, "wake delivered"),
                Err(WakeclockError::Timer(err)) => {
                    warn!(alarm = %wake.alarm_id, %err, "wake delivered, timer not re-armed")
                }
                Err(WakeclockError::NotFound(id)) => {
                    warn!(alarm = %id, kind = ?wake.kind, "wake for a vanished alarm ignored")
                }
                Err(err) => error!(alarm = %wake.alarm_id, %err, "wake delivery failed"),
            }
        }
        self.publisher.publish();
    }

    /// Spawns a task that calls [`on_timer_fired`](Self::on_timer_fired) for
    /// every signal from a wake timer.
    pub fn spawn_timer_listener(&self, mut fired: mpsc::UnboundedReceiver<()>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            while fired.recv().await.is_some() {
                registry.on_timer_fired().await;
            }
            debug!("timer listener stopped");
        })
    }

    /// Waits until every persistence write queued so far has been attempted.
    pub async fn flush(&self) {
        self.services.writer.flush().await;
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.services.scheduler.clone()
    }

    pub fn config(&self) -> &WakeclockConfig {
        &self.services.config
    }

    /// Subscribes to the `LifecycleEvent` stream.
    pub fn subscribe_lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_event_sender.subscribe()
    }

    /// Subscribes to the `ObserverEvent` stream.
    pub fn subscribe_observer_events(&self) -> broadcast::Receiver<ObserverEvent> {
        self.observer_event_sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualWakeTimer;
    use crate::store::MemoryStore;
    use crate::time::ManualClock;
    use chrono::{TimeZone, Utc};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap(),
        ))
    }

    fn fast_config() -> WakeclockConfig {
        let quick = RetryConfig {
            attempts: 3,
            interval_ms: 1,
        };
        WakeclockConfig {
            load_retry: quick,
            write_retry: quick,
            timer_retry: quick,
            ..WakeclockConfig::default()
        }
    }

    struct FixedStore(Vec<AlarmRow>);

    impl AlarmStore for FixedStore {
        fn load_all(&self) -> Result<Vec<AlarmRow>, StoreError> {
            Ok(self.0.clone())
        }
        fn insert(&self, _row: &AlarmRow) -> Result<AlarmId, StoreError> {
            Err(StoreError::Unavailable("read-only".into()))
        }
        fn update(&self, _id: AlarmId, _row: &AlarmRow) -> Result<(), StoreError> {
            Ok(())
        }
        fn delete(&self, _id: AlarmId) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unknown_ids_are_reported_as_not_found() {
        let registry = AlarmRegistry::start(
            fast_config(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualWakeTimer::new()),
            clock(),
        )
        .await;
        let ghost = AlarmId(42);
        assert!(matches!(
            registry.enable(ghost, true).await,
            Err(WakeclockError::NotFound(id)) if id == ghost
        ));
        assert!(matches!(
            registry.delete(ghost).await,
            Err(WakeclockError::NotFound(_))
        ));
        assert!(registry.get_alarm(ghost).is_err());
    }

    #[tokio::test]
    async fn duplicate_persisted_ids_keep_the_first_row() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        let mut first = AlarmRow::from(&Alarm::new(now, chrono_tz::Tz::UTC));
        first.id = AlarmId(3);
        first.label = "first".into();
        let mut second = first.clone();
        second.label = "second".into();

        let registry = AlarmRegistry::start(
            fast_config(),
            Arc::new(FixedStore(vec![first, second])),
            Arc::new(ManualWakeTimer::new()),
            clock(),
        )
        .await;
        let alarms = registry.get_alarms_list();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].label, "first");
    }

    #[tokio::test]
    async fn failed_insert_creates_nothing() {
        let registry = AlarmRegistry::start(
            fast_config(),
            Arc::new(FixedStore(Vec::new())),
            Arc::new(ManualWakeTimer::new()),
            clock(),
        )
        .await;
        assert!(matches!(
            registry.create_new_alarm().await,
            Err(WakeclockError::Storage(StoreError::Unavailable(_)))
        ));
        assert!(registry.get_alarms_list().is_empty());
    }

    #[tokio::test]
    async fn invalid_times_are_rejected_before_reaching_the_alarm() {
        let registry = AlarmRegistry::start(
            fast_config(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualWakeTimer::new()),
            clock(),
        )
        .await;
        let id = registry.create_new_alarm().await.unwrap();
        assert!(matches!(
            registry.edit(id, |e| e.at(25, 0)).await,
            Err(WakeclockError::InvalidTime { hour: 25, .. })
        ));
        assert!(matches!(
            registry.snooze_until(id, 7, 61).await,
            Err(WakeclockError::InvalidTime { .. })
        ));
    }
}
