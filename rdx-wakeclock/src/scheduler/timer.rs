//! The one OS-level wake timer and its implementations.

use crate::error::TimerError;
use crate::time::Clock;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A single absolute-time wake timer. Arming replaces any previous arming.
///
/// When it fires it delivers one payload-free signal; working out which wakes
/// are due is the scheduler's job.
pub trait WakeTimer: Send + Sync {
    fn arm_at(&self, at: DateTime<Utc>) -> Result<(), TimerError>;

    fn cancel(&self) -> Result<(), TimerError>;
}

/// A wake timer backed by a tokio sleep task.
///
/// Each arming spawns a task that sleeps until the requested instant and then
/// signals the receiver returned from [`TokioWakeTimer::new`]. Re-arming aborts
/// the previous task. An instant already in the past fires immediately.
pub struct TokioWakeTimer {
    clock: Arc<dyn Clock>,
    runtime: Handle,
    fired_tx: mpsc::UnboundedSender<()>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TokioWakeTimer {
    /// Must be called from within a tokio runtime.
    pub fn new(clock: Arc<dyn Clock>) -> Result<(Self, mpsc::UnboundedReceiver<()>), TimerError> {
        let runtime =
            Handle::try_current().map_err(|err| TimerError::Unavailable(err.to_string()))?;
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let timer = Self {
            clock,
            runtime,
            fired_tx,
            pending: Mutex::new(None),
        };
        Ok((timer, fired_rx))
    }

    fn replace(&self, next: Option<JoinHandle<()>>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = std::mem::replace(&mut *pending, next) {
            previous.abort();
        }
    }
}

impl WakeTimer for TokioWakeTimer {
    fn arm_at(&self, at: DateTime<Utc>) -> Result<(), TimerError> {
        if self.fired_tx.is_closed() {
            return Err(TimerError::Unavailable("timer listener is gone".into()));
        }
        let delay = (at - self.clock.now()).to_std().unwrap_or_default();
        let fired_tx = self.fired_tx.clone();
        let task = self.runtime.spawn(async move {
            trace!(?delay, "wake timer sleeping");
            tokio::time::sleep(delay).await;
            trace!("wake timer fired");
            fired_tx.send(()).ok();
        });
        self.replace(Some(task));
        debug!(%at, ?delay, "wake timer armed");
        Ok(())
    }

    fn cancel(&self) -> Result<(), TimerError> {
        self.replace(None);
        debug!("wake timer cancelled");
        Ok(())
    }
}

impl Drop for TokioWakeTimer {
    fn drop(&mut self) {
        self.replace(None);
    }
}

/// A timer that only records what it was asked to do. Tests drive the firing
/// side themselves by calling `Scheduler::on_timer_fired`.
#[derive(Debug, Default)]
pub struct ManualWakeTimer {
    armed: Mutex<Option<DateTime<Utc>>>,
    arm_calls: AtomicU32,
    cancel_calls: AtomicU32,
    failures: AtomicU32,
}

impl ManualWakeTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The instant the timer is currently armed for.
    pub fn armed(&self) -> Option<DateTime<Utc>> {
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn arm_calls(&self) -> u32 {
        self.arm_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> u32 {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    /// Makes the next `n` `arm_at` calls fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl WakeTimer for ManualWakeTimer {
    fn arm_at(&self, at: DateTime<Utc>) -> Result<(), TimerError> {
        self.arm_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TimerError::Unavailable("injected failure".into()));
        }
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
        Ok(())
    }

    fn cancel(&self) -> Result<(), TimerError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;
    use std::time::Duration;

    #[tokio::test]
    async fn fires_once_the_instant_passes() {
        let (timer, mut fired) = TokioWakeTimer::new(Arc::new(SystemClock)).unwrap();
        timer
            .arm_at(Utc::now() + chrono::Duration::milliseconds(10))
            .unwrap();
        let signal = tokio::time::timeout(Duration::from_millis(500), fired.recv()).await;
        assert_eq!(signal.expect("timer did not fire"), Some(()));
    }

    #[tokio::test]
    async fn rearming_replaces_the_previous_arming() {
        let (timer, mut fired) = TokioWakeTimer::new(Arc::new(SystemClock)).unwrap();
        timer
            .arm_at(Utc::now() + chrono::Duration::milliseconds(20))
            .unwrap();
        timer
            .arm_at(Utc::now() + chrono::Duration::seconds(60))
            .unwrap();
        let signal = tokio::time::timeout(Duration::from_millis(100), fired.recv()).await;
        assert!(signal.is_err(), "the superseded arming fired");
    }

    #[tokio::test]
    async fn cancel_stops_a_pending_fire() {
        let (timer, mut fired) = TokioWakeTimer::new(Arc::new(SystemClock)).unwrap();
        timer
            .arm_at(Utc::now() + chrono::Duration::milliseconds(20))
            .unwrap();
        timer.cancel().unwrap();
        let signal = tokio::time::timeout(Duration::from_millis(100), fired.recv()).await;
        assert!(signal.is_err());
    }

    #[tokio::test]
    async fn past_instants_fire_immediately() {
        let (timer, mut fired) = TokioWakeTimer::new(Arc::new(SystemClock)).unwrap();
        timer
            .arm_at(Utc::now() - chrono::Duration::minutes(5))
            .unwrap();
        let signal = tokio::time::timeout(Duration::from_millis(100), fired.recv()).await;
        assert!(signal.is_ok());
    }
}
