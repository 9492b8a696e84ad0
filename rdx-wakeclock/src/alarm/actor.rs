//! Hosts each alarm machine on its own tokio task.
//!
//! A machine is owned by exactly one task and fed through an unbounded FIFO
//! channel, so its handlers never run concurrently with themselves. After each
//! message the task refreshes the alarm's entry on the shared board and lets
//! the publisher push whatever changed.

use super::machine::{run_to_idle, AlarmMachine, AlarmMessage};
use super::model::Alarm;
use crate::common::AlarmId;
use crate::error::WakeclockError;
use crate::registry::Publisher;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

type Reply = oneshot::Sender<Result<Alarm, WakeclockError>>;

#[derive(Debug)]
struct Envelope {
    msg: AlarmMessage,
    reply: Option<Reply>,
}

/// The sending side of an alarm's queue.
#[derive(Debug, Clone)]
pub struct Mailbox {
    id: AlarmId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Mailbox {
    /// Enqueues a message without waiting for it to be processed.
    pub fn post(&self, msg: AlarmMessage) {
        if self.tx.send(Envelope { msg, reply: None }).is_err() {
            debug!(alarm = %self.id, "alarm is gone, message dropped");
        }
    }

    /// Enqueues a message and waits until the machine has run it to completion.
    /// Resolves to the alarm as it stood afterwards.
    pub async fn request(&self, msg: AlarmMessage) -> Result<Alarm, WakeclockError> {
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(Envelope {
                msg,
                reply: Some(reply),
            })
            .map_err(|_| WakeclockError::NotFound(self.id))?;
        answer
            .await
            .map_err(|_| WakeclockError::NotFound(self.id))?
    }
}

/// Finishes constructing `machine` on the caller's task, then moves it onto a
/// task of its own.
///
/// Construction runs before this returns, so by then the alarm's wakes are in
/// the scheduler and the alarm is on the board.
pub(crate) fn spawn(
    mut machine: AlarmMachine,
    publisher: Arc<Publisher>,
) -> Result<Mailbox, WakeclockError> {
    let id = machine.behavior().alarm().id;
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let mailbox = Mailbox { id, tx };
    machine.behavior_mut().attach_mailbox(mailbox.clone());

    run_to_idle(&mut machine)?;
    if let Some(err) = machine.behavior_mut().take_timer_fault() {
        warn!(alarm = %id, %err, "alarm started without an armed timer");
    }
    publisher.record(machine.behavior().alarm());

    tokio::spawn(async move {
        while let Some(Envelope { msg, reply }) = rx.recv().await {
            let what = msg.what();
            machine.send(msg);
            let processed = run_to_idle(&mut machine);
            let fault = machine.behavior_mut().take_timer_fault();
            let outcome = processed
                .map_err(WakeclockError::from)
                .and_then(|()| fault.map_or(Ok(()), |err| Err(err.into())));
            if let Err(err) = &outcome {
                error!(alarm = %id, what, %err, "alarm message not fully applied");
            }

            let alarm = machine.behavior().alarm().clone();
            if machine.is_halted() {
                publisher.remove(id);
            } else {
                publisher.record(&alarm);
            }
            publisher.publish();

            if let Some(reply) = reply {
                reply.send(outcome.map(|()| alarm)).ok();
            }
            if machine.is_halted() {
                break;
            }
        }
        debug!(alarm = %id, machine = machine.name(), "alarm actor stopped");
    });
    Ok(mailbox)
}
