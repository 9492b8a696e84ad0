//! The alarm lifecycle, expressed as a `Behavior` on the generic engine.
//!
//! ```text
//! DISABLED
//! ENABLED
//! ├── SET
//! ├── PREALARM_SET
//! ├── SNOOZED_SET
//! └── RESCHEDULE      (complex: picks SET or PREALARM_SET on entry)
//! FIRED
//! ├── FIRED_PREALARM
//! ├── FIRED_NORMAL
//! └── FIRED_SNOOZED
//! ```
//!
//! Each leaf owns the set of wakes it wants armed. Entering a leaf hands that
//! set to the scheduler; resuming a leaf does the same without notifying
//! anyone. Leaving `FIRED` for anywhere else stops whatever was ringing.

use super::actor::Mailbox;
use super::model::{next_occurrence, Alarm, AlarmEdit};
use crate::common::{AlarmId, DaysOfWeek, WakeKind};
use crate::config::WakeclockConfig;
use crate::error::TimerError;
use crate::events::{LifecycleEvent, NotifyKind};
use crate::hsm::{Behavior, Context, Disposition, MachineError, Message, StateMachine};
use crate::scheduler::Scheduler;
use crate::store::{AlarmRow, StoreWriter};
use crate::time::Clock;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmState {
    Disabled,
    Enabled,
    Set,
    PrealarmSet,
    SnoozedSet,
    Reschedule,
    Fired,
    FiredPrealarm,
    FiredNormal,
    FiredSnoozed,
}

impl AlarmState {
    pub const ALL: [AlarmState; 10] = [
        AlarmState::Disabled,
        AlarmState::Enabled,
        AlarmState::Set,
        AlarmState::PrealarmSet,
        AlarmState::SnoozedSet,
        AlarmState::Reschedule,
        AlarmState::Fired,
        AlarmState::FiredPrealarm,
        AlarmState::FiredNormal,
        AlarmState::FiredSnoozed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AlarmState::Disabled => "DISABLED",
            AlarmState::Enabled => "ENABLED",
            AlarmState::Set => "SET",
            AlarmState::PrealarmSet => "PREALARM_SET",
            AlarmState::SnoozedSet => "SNOOZED_SET",
            AlarmState::Reschedule => "RESCHEDULE",
            AlarmState::Fired => "FIRED",
            AlarmState::FiredPrealarm => "FIRED_PREALARM",
            AlarmState::FiredNormal => "FIRED_NORMAL",
            AlarmState::FiredSnoozed => "FIRED_SNOOZED",
        }
    }

    pub fn parent(self) -> Option<AlarmState> {
        match self {
            AlarmState::Disabled | AlarmState::Enabled | AlarmState::Fired => None,
            AlarmState::Set
            | AlarmState::PrealarmSet
            | AlarmState::SnoozedSet
            | AlarmState::Reschedule => Some(AlarmState::Enabled),
            AlarmState::FiredPrealarm | AlarmState::FiredNormal | AlarmState::FiredSnoozed => {
                Some(AlarmState::Fired)
            }
        }
    }

    /// Whether a machine can be rebuilt with this state as its leaf.
    pub fn is_resumable(self) -> bool {
        !matches!(
            self,
            AlarmState::Enabled | AlarmState::Fired | AlarmState::Reschedule
        )
    }

    pub fn is_firing(self) -> bool {
        self.parent() == Some(AlarmState::Fired)
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmState {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlarmState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| MachineError::UnknownState(s.to_string()))
    }
}

/// Opcodes understood by an alarm machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AlarmMsg {
    Enable = 1,
    Change,
    Fired,
    Snooze,
    Dismiss,
    Delete,
    AutoSilence,
}

impl AlarmMsg {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => AlarmMsg::Enable,
            2 => AlarmMsg::Change,
            3 => AlarmMsg::Fired,
            4 => AlarmMsg::Snooze,
            5 => AlarmMsg::Dismiss,
            6 => AlarmMsg::Delete,
            7 => AlarmMsg::AutoSilence,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlarmPayload {
    Wake(WakeKind),
    SnoozeUntil { hour: u32, minute: u32 },
    Edit(AlarmEdit),
}

pub type AlarmMessage = Message<AlarmPayload>;

pub type AlarmMachine = StateMachine<AlarmBehavior>;

/// Constructors for every message an alarm machine accepts.
pub mod messages {
    use super::{AlarmMessage, AlarmMsg, AlarmPayload};
    use crate::alarm::AlarmEdit;
    use crate::common::WakeKind;
    use chrono::{DateTime, Utc};

    pub fn enable(on: bool) -> AlarmMessage {
        AlarmMessage::new(AlarmMsg::Enable.code()).with_arg(i64::from(on))
    }

    pub fn change(edit: AlarmEdit) -> AlarmMessage {
        AlarmMessage::new(AlarmMsg::Change.code()).with_payload(AlarmPayload::Edit(edit))
    }

    /// A wake of `kind` that was scheduled for `time`. The time lets the
    /// machine tell a current wake from one that was superseded in flight.
    pub fn fired(kind: WakeKind, time: DateTime<Utc>) -> AlarmMessage {
        AlarmMessage::new(AlarmMsg::Fired.code())
            .with_arg(time.timestamp_millis())
            .with_payload(AlarmPayload::Wake(kind))
    }

    pub fn snooze() -> AlarmMessage {
        AlarmMessage::new(AlarmMsg::Snooze.code())
    }

    pub fn snooze_until(hour: u32, minute: u32) -> AlarmMessage {
        AlarmMessage::new(AlarmMsg::Snooze.code())
            .with_payload(AlarmPayload::SnoozeUntil { hour, minute })
    }

    pub fn dismiss() -> AlarmMessage {
        AlarmMessage::new(AlarmMsg::Dismiss.code())
    }

    pub fn delete() -> AlarmMessage {
        AlarmMessage::new(AlarmMsg::Delete.code())
    }

    pub fn auto_silence(generation: i64) -> AlarmMessage {
        AlarmMessage::new(AlarmMsg::AutoSilence.code()).with_arg(generation)
    }
}

/// Collaborators shared by every alarm machine.
pub struct AlarmServices {
    pub config: WakeclockConfig,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<Scheduler>,
    pub writer: StoreWriter,
    pub notifier: broadcast::Sender<LifecycleEvent>,
}

/// The per-alarm half of the lifecycle: the alarm record plus the side
/// effects its states produce.
pub struct AlarmBehavior {
    alarm: Alarm,
    services: Arc<AlarmServices>,
    mailbox: Option<Mailbox>,
    armed: BTreeMap<WakeKind, DateTime<Utc>>,
    persisted: Option<AlarmRow>,
    silence_generation: i64,
    timer_fault: Option<TimerError>,
    deleted: bool,
}

impl AlarmBehavior {
    fn new(alarm: Alarm, services: Arc<AlarmServices>, persisted: Option<AlarmRow>) -> Self {
        Self {
            alarm,
            services,
            mailbox: None,
            armed: BTreeMap::new(),
            persisted,
            silence_generation: 0,
            timer_fault: None,
            deleted: false,
        }
    }

    pub fn alarm(&self) -> &Alarm {
        &self.alarm
    }

    /// The wakes this alarm last handed to the scheduler.
    pub fn armed(&self) -> &BTreeMap<WakeKind, DateTime<Utc>> {
        &self.armed
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn attach_mailbox(&mut self, mailbox: Mailbox) {
        self.mailbox = Some(mailbox);
    }

    /// The last wake timer failure since this was called, if any.
    pub(crate) fn take_timer_fault(&mut self) -> Option<TimerError> {
        self.timer_fault.take()
    }

    fn id(&self) -> AlarmId {
        self.alarm.id
    }

    fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    /// Records the machine's resting state on the alarm and queues a write
    /// if anything persisted changed.
    pub(crate) fn settle(&mut self, state: Option<AlarmState>) {
        if let Some(state) = state {
            self.alarm.state = state;
        }
        if self.deleted {
            return;
        }
        let row = AlarmRow::from(&self.alarm);
        if self.persisted.as_ref() != Some(&row) {
            self.services.writer.update(row.clone());
            self.persisted = Some(row);
        }
    }

    fn notify(&self, kind: NotifyKind) {
        debug!(alarm = %self.id(), ?kind, "lifecycle event");
        // No subscribers is not an error.
        let _ = self.services.notifier.send(LifecycleEvent {
            alarm_id: self.id(),
            kind,
        });
    }

    fn arm(&mut self, wakes: BTreeMap<WakeKind, DateTime<Utc>>) {
        match self.services.scheduler.schedule(self.id(), &wakes) {
            Ok(()) => self.armed = wakes,
            Err(err) => {
                // The scheduler still holds the wakes and arms them once the timer is back.
                error!(alarm = %self.id(), %err, "wake timer unavailable, alarm not armed yet");
                self.armed = wakes;
                self.timer_fault = Some(err);
            }
        }
    }

    fn arm_for(&mut self, state: AlarmState) {
        let wakes = self.wakes_for(state);
        self.arm(wakes);
    }

    fn main_wake_pending(&self, now: DateTime<Utc>) -> bool {
        self.alarm.next_time > now || self.alarm.days_of_week.is_repeating()
    }

    /// The wakes a leaf state keeps armed.
    fn wakes_for(&self, state: AlarmState) -> BTreeMap<WakeKind, DateTime<Utc>> {
        let now = self.now();
        let a = &self.alarm;
        let mut wakes = BTreeMap::new();
        match state {
            AlarmState::Set => {
                wakes.insert(WakeKind::Normal, a.next_time);
            }
            AlarmState::PrealarmSet => {
                wakes.insert(WakeKind::Prealarm, a.prealarm_time);
                wakes.insert(WakeKind::Normal, a.next_time);
            }
            AlarmState::SnoozedSet => {
                wakes.insert(WakeKind::Snooze, a.snoozed_time);
                if self.main_wake_pending(now) {
                    wakes.insert(WakeKind::Normal, a.next_time);
                    if a.is_prealarm && a.prealarm_time > now {
                        wakes.insert(WakeKind::Prealarm, a.prealarm_time);
                    }
                }
            }
            AlarmState::FiredPrealarm => {
                wakes.insert(WakeKind::Normal, a.next_time);
                if a.is_snoozed {
                    wakes.insert(WakeKind::Snooze, a.snoozed_time);
                }
            }
            AlarmState::FiredSnoozed => {
                if self.main_wake_pending(now) {
                    wakes.insert(WakeKind::Normal, a.next_time);
                }
            }
            _ => {}
        }
        wakes
    }

    fn clear_snooze(&mut self) {
        if self.alarm.is_snoozed {
            self.alarm.is_snoozed = false;
            self.notify(NotifyKind::CancelSnooze);
        }
    }

    fn compute_schedule(&mut self, now: DateTime<Utc>) {
        let config = &self.services.config;
        let next = next_occurrence(
            self.alarm.hour,
            self.alarm.minute,
            self.alarm.days_of_week,
            now,
            config.timezone,
        );
        self.alarm.next_time = next;
        self.alarm.prealarm_time = next - config.prealarm_duration();
    }

    fn start_silence_timer(&mut self) {
        self.silence_generation += 1;
        let generation = self.silence_generation;
        let Some(after) = self.services.config.auto_silence() else {
            return;
        };
        let Some(mailbox) = self.mailbox.clone() else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(after).await;
                    mailbox.post(messages::auto_silence(generation));
                });
            }
            Err(_) => warn!(alarm = %self.id(), "no runtime, auto-silence disabled"),
        }
    }

    /// Checks a FIRED message against what this alarm actually has armed.
    fn accept_wake(&self, msg: &AlarmMessage) -> Option<WakeKind> {
        let Some(AlarmPayload::Wake(kind)) = msg.payload() else {
            warn!(alarm = %self.id(), "fired message without a wake kind");
            return None;
        };
        let current = self
            .armed
            .get(kind)
            .is_some_and(|at| msg.arg() == Some(at.timestamp_millis()));
        if !current {
            warn!(alarm = %self.id(), ?kind, "ignoring stale wake");
            return None;
        }
        Some(*kind)
    }

    fn fire(&mut self, msg: &AlarmMessage, ctx: &mut Context<AlarmState, AlarmPayload>) {
        if let Some(kind) = self.accept_wake(msg) {
            info!(alarm = %self.id(), ?kind, "alarm fired");
            ctx.transition_to(match kind {
                WakeKind::Normal => AlarmState::FiredNormal,
                WakeKind::Prealarm => AlarmState::FiredPrealarm,
                WakeKind::Snooze => AlarmState::FiredSnoozed,
            });
        }
    }

    /// Applies an edit and picks where it leaves the alarm. Returns `None` when
    /// no transition is needed.
    fn apply_edit(&mut self, msg: &AlarmMessage) -> Option<AlarmState> {
        let Some(AlarmPayload::Edit(edit)) = msg.payload() else {
            warn!(alarm = %self.id(), "change message without an edit");
            return None;
        };
        if let Err(err) = edit.validate() {
            warn!(alarm = %self.id(), %err, "rejecting edit");
            return None;
        }
        self.alarm.apply(edit);
        Some(if self.alarm.enabled {
            AlarmState::Reschedule
        } else {
            AlarmState::Disabled
        })
    }

    fn set_snooze_time(&mut self, msg: &AlarmMessage) {
        let now = self.now();
        self.alarm.snoozed_time = match msg.payload() {
            Some(AlarmPayload::SnoozeUntil { hour, minute }) => next_occurrence(
                *hour,
                *minute,
                DaysOfWeek::NONE,
                now,
                self.services.config.timezone,
            ),
            _ => now + self.services.config.snooze_duration(),
        };
        // A repeating alarm whose occurrence already rang keeps its next one armed.
        if self.alarm.next_time <= now && self.alarm.days_of_week.is_repeating() {
            self.compute_schedule(now);
        }
        info!(alarm = %self.id(), until = %self.alarm.snoozed_time, "alarm snoozed");
    }

    fn finish_occurrence(&mut self, ctx: &mut Context<AlarmState, AlarmPayload>) {
        if self.alarm.days_of_week.is_repeating() {
            ctx.transition_to(AlarmState::Reschedule);
        } else {
            self.alarm.enabled = false;
            ctx.transition_to(AlarmState::Disabled);
        }
    }

    fn delete(&mut self, ctx: &mut Context<AlarmState, AlarmPayload>) {
        self.clear_snooze();
        self.arm(BTreeMap::new());
        self.services.writer.delete(self.id());
        self.deleted = true;
        info!(alarm = %self.id(), "alarm deleted");
        ctx.quit();
    }

    fn ignore(&self, what: AlarmMsg, state: AlarmState) -> Disposition {
        debug!(alarm = %self.id(), ?what, %state, "nothing to do");
        Disposition::Handled
    }

    fn on_disabled(
        &mut self,
        what: AlarmMsg,
        msg: &AlarmMessage,
        ctx: &mut Context<AlarmState, AlarmPayload>,
    ) -> Disposition {
        match what {
            AlarmMsg::Enable if msg.arg() == Some(1) => {
                self.alarm.enabled = true;
                ctx.transition_to(AlarmState::Reschedule);
            }
            AlarmMsg::Change => {
                if let Some(AlarmState::Reschedule) = self.apply_edit(msg) {
                    ctx.transition_to(AlarmState::Reschedule);
                }
            }
            AlarmMsg::Delete => self.delete(ctx),
            _ => return self.ignore(what, AlarmState::Disabled),
        }
        Disposition::Handled
    }

    fn on_enabled(
        &mut self,
        what: AlarmMsg,
        msg: &AlarmMessage,
        ctx: &mut Context<AlarmState, AlarmPayload>,
    ) -> Disposition {
        match what {
            AlarmMsg::Enable if msg.arg() == Some(0) => ctx.transition_to(AlarmState::Disabled),
            AlarmMsg::Change => {
                if let Some(next) = self.apply_edit(msg) {
                    ctx.transition_to(next);
                }
            }
            AlarmMsg::Fired => self.fire(msg, ctx),
            AlarmMsg::Delete => self.delete(ctx),
            _ => return self.ignore(what, AlarmState::Enabled),
        }
        Disposition::Handled
    }

    fn on_snoozed(
        &mut self,
        what: AlarmMsg,
        msg: &AlarmMessage,
        ctx: &mut Context<AlarmState, AlarmPayload>,
    ) -> Disposition {
        match what {
            AlarmMsg::Snooze => {
                self.set_snooze_time(msg);
                self.arm_for(AlarmState::SnoozedSet);
                self.notify(NotifyKind::Snooze);
            }
            AlarmMsg::Dismiss => {
                self.alarm.is_snoozed = false;
                self.notify(NotifyKind::Dismiss);
                self.finish_occurrence(ctx);
            }
            _ => return Disposition::NotHandled,
        }
        Disposition::Handled
    }

    fn on_fired(
        &mut self,
        state: AlarmState,
        what: AlarmMsg,
        msg: &AlarmMessage,
        ctx: &mut Context<AlarmState, AlarmPayload>,
    ) -> Disposition {
        match what {
            AlarmMsg::Enable if msg.arg() == Some(0) => ctx.transition_to(AlarmState::Disabled),
            AlarmMsg::Change => {
                if let Some(next) = self.apply_edit(msg) {
                    ctx.transition_to(next);
                }
            }
            AlarmMsg::Fired => self.fire(msg, ctx),
            AlarmMsg::Snooze => {
                self.set_snooze_time(msg);
                ctx.transition_to(AlarmState::SnoozedSet);
            }
            AlarmMsg::Dismiss => {
                // Leaving FIRED already tells listeners to stop ringing.
                self.alarm.is_snoozed = false;
                self.finish_occurrence(ctx);
            }
            AlarmMsg::AutoSilence => {
                if msg.arg() != Some(self.silence_generation) {
                    debug!(alarm = %self.id(), "stale auto-silence");
                } else if ctx.current() == Some(AlarmState::FiredPrealarm) {
                    info!(alarm = %self.id(), "pre-alarm silenced");
                    ctx.transition_to(if self.alarm.is_snoozed {
                        AlarmState::SnoozedSet
                    } else {
                        AlarmState::Set
                    });
                } else {
                    info!(alarm = %self.id(), "alarm silenced");
                    self.alarm.is_snoozed = false;
                    self.finish_occurrence(ctx);
                }
            }
            AlarmMsg::Delete => self.delete(ctx),
            _ => return self.ignore(what, state),
        }
        Disposition::Handled
    }
}

impl Behavior for AlarmBehavior {
    type State = AlarmState;
    type Payload = AlarmPayload;

    fn enter(&mut self, state: AlarmState, ctx: &mut Context<AlarmState, AlarmPayload>) {
        match state {
            AlarmState::Disabled => {
                self.clear_snooze();
                self.alarm.enabled = false;
                self.arm(BTreeMap::new());
            }
            AlarmState::Reschedule => {
                self.clear_snooze();
                let now = self.now();
                self.compute_schedule(now);
                let with_prealarm = self.alarm.is_prealarm && self.alarm.prealarm_time > now;
                ctx.transition_to(if with_prealarm {
                    AlarmState::PrealarmSet
                } else {
                    AlarmState::Set
                });
            }
            AlarmState::Set | AlarmState::PrealarmSet => self.arm_for(state),
            AlarmState::SnoozedSet => {
                self.alarm.is_snoozed = true;
                self.arm_for(state);
                self.notify(NotifyKind::Snooze);
            }
            AlarmState::FiredPrealarm => {
                self.arm_for(state);
                self.notify(NotifyKind::Prealarm);
                self.start_silence_timer();
            }
            AlarmState::FiredNormal | AlarmState::FiredSnoozed => {
                self.clear_snooze();
                self.arm_for(state);
                self.notify(NotifyKind::Alert);
                self.start_silence_timer();
            }
            AlarmState::Enabled | AlarmState::Fired => {}
        }
    }

    fn exit(&mut self, state: AlarmState) {
        if state == AlarmState::Fired {
            self.silence_generation += 1;
            self.notify(NotifyKind::Dismiss);
        }
    }

    fn resume(&mut self, state: AlarmState, _ctx: &mut Context<AlarmState, AlarmPayload>) {
        if state.parent().is_none() {
            return;
        }
        self.arm_for(state);
        if state.is_firing() {
            self.start_silence_timer();
        }
        debug!(alarm = %self.id(), %state, armed = self.armed.len(), "alarm resumed");
    }

    fn process(
        &mut self,
        state: AlarmState,
        msg: &AlarmMessage,
        ctx: &mut Context<AlarmState, AlarmPayload>,
    ) -> Disposition {
        let Some(what) = AlarmMsg::from_code(msg.what()) else {
            return Disposition::NotHandled;
        };
        match state {
            AlarmState::Disabled => self.on_disabled(what, msg, ctx),
            AlarmState::Enabled => self.on_enabled(what, msg, ctx),
            AlarmState::SnoozedSet => self.on_snoozed(what, msg, ctx),
            AlarmState::Fired => self.on_fired(state, what, msg, ctx),
            _ => Disposition::NotHandled,
        }
    }
}

fn assemble(
    alarm: Alarm,
    services: Arc<AlarmServices>,
    persisted: Option<AlarmRow>,
) -> Result<AlarmMachine, MachineError> {
    let name = format!("alarm{}", alarm.id);
    let mut machine = StateMachine::new(name, AlarmBehavior::new(alarm, services, persisted));
    for state in AlarmState::ALL {
        if state == AlarmState::Reschedule {
            machine.add_complex_state(state, state.parent())?;
        } else {
            machine.add_state(state, state.parent())?;
        }
    }
    Ok(machine)
}

/// Builds and starts the machine for an alarm that was just inserted.
pub fn start_new(alarm: Alarm, services: Arc<AlarmServices>) -> Result<AlarmMachine, MachineError> {
    let row = AlarmRow::from(&alarm);
    let mut machine = assemble(alarm, services, Some(row))?;
    machine.set_initial_state(AlarmState::Disabled)?;
    machine.start()?;
    Ok(machine)
}

/// Rebuilds the machine for a persisted alarm.
///
/// A usable persisted leaf is resumed silently. Anything else is re-derived
/// from the row's `enabled` flag through the normal entry path.
pub fn restore(row: AlarmRow, services: Arc<AlarmServices>) -> Result<AlarmMachine, MachineError> {
    let (alarm, restored) = row.clone().into_alarm();
    let enabled = alarm.enabled;
    let mut machine = assemble(alarm, services, Some(row.clone()))?;
    match restored {
        Some(state) => {
            machine.set_initial_state(state)?;
            machine.resume()?;
        }
        None => {
            warn!(alarm = %row.id, state = %row.state, "persisted state unusable, re-deriving");
            machine.set_initial_state(if enabled {
                AlarmState::Reschedule
            } else {
                AlarmState::Disabled
            })?;
            machine.start()?;
        }
    }
    Ok(machine)
}

/// Processes everything queued on `machine`, then records where it came to rest.
pub fn run_to_idle(machine: &mut AlarmMachine) -> Result<(), MachineError> {
    let result = machine.run_pending();
    let state = machine.current_state();
    machine.behavior_mut().settle(state);
    result
}
