use super::message::Message;
use crate::common::StateKey;
use slotmap::SlotMap;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Whether a state consumed a message or wants it offered to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    NotHandled,
}

/// Configuration errors. These indicate a bug in how a machine was built or
/// driven, never a runtime condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("state {0} is not registered")]
    UnknownState(String),

    #[error("state {state} already has parent {existing}, cannot re-parent under {requested}")]
    ParentConflict {
        state: String,
        existing: String,
        requested: String,
    },

    #[error("registering {0} would make it its own ancestor")]
    Cycle(String),

    #[error("no initial state was set before start")]
    NoInitialState,

    #[error("machine was already started")]
    AlreadyStarted,

    #[error("machine has not been started")]
    NotStarted,

    #[error("message {what} was not handled by any state in [{stack}]")]
    Unhandled { what: u32, stack: String },

    #[error("complex state {0} settled without transitioning")]
    ComplexStateSettled(String),
}

/// The per-machine logic: lifecycle hooks and message handlers, dispatched by
/// the state they are invoked for.
pub trait Behavior {
    type State: Copy + Eq + Hash + Debug;
    type Payload: Clone + Debug;

    fn enter(&mut self, _state: Self::State, _ctx: &mut Context<Self::State, Self::Payload>) {}

    fn exit(&mut self, _state: Self::State) {}

    /// Called instead of `enter` when the machine is rebuilt with `resume()`.
    fn resume(&mut self, _state: Self::State, _ctx: &mut Context<Self::State, Self::Payload>) {}

    fn process(
        &mut self,
        state: Self::State,
        msg: &Message<Self::Payload>,
        ctx: &mut Context<Self::State, Self::Payload>,
    ) -> Disposition;
}

/// Requests a handler can make of the engine. They are applied once the
/// handler returns.
#[derive(Debug)]
pub struct Context<S, P> {
    leaf: Option<S>,
    destination: Option<S>,
    deferred: Vec<Message<P>>,
    posted: Vec<Message<P>>,
    quit: bool,
}

impl<S: Copy, P: Clone> Context<S, P> {
    fn new(leaf: Option<S>) -> Self {
        Self {
            leaf,
            destination: None,
            deferred: Vec::new(),
            posted: Vec::new(),
            quit: false,
        }
    }

    /// The active leaf state at the time the handler was invoked.
    pub fn current(&self) -> Option<S> {
        self.leaf
    }

    /// Requests a transition. Only the last request made by a handler survives.
    pub fn transition_to(&mut self, state: S) {
        self.destination = Some(state);
    }

    /// Re-queues `msg` so the state active after this message completes sees it
    /// before anything that arrived later.
    pub fn defer(&mut self, msg: &Message<P>) {
        self.deferred.push(msg.clone());
    }

    /// Appends a message to the back of the machine's own queue.
    pub fn post(&mut self, msg: Message<P>) {
        self.posted.push(msg);
    }

    /// Exits every active state and halts the machine once the handler returns.
    pub fn quit(&mut self) {
        self.quit = true;
    }
}

#[derive(Debug)]
struct StateNode<S> {
    state: S,
    parent: Option<StateKey>,
    complex: bool,
    active: bool,
}

#[derive(Debug)]
enum Queued<P> {
    Init { resume: bool },
    Deliver(Message<P>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Building,
    Starting,
    Running,
    Halted,
}

/// A hierarchical state machine driving a `Behavior`.
///
/// The machine is single-threaded by construction: every message runs to
/// completion, including any chained transitions, before the next one is taken
/// off the queue.
pub struct StateMachine<B: Behavior> {
    name: String,
    behavior: B,
    nodes: SlotMap<StateKey, StateNode<B::State>>,
    index: HashMap<B::State, StateKey>,
    initial: Option<StateKey>,
    stack: Vec<StateKey>,
    queue: VecDeque<Queued<B::Payload>>,
    deferred: Vec<Message<B::Payload>>,
    phase: Phase,
}

impl<B: Behavior> StateMachine<B> {
    pub fn new(name: impl Into<String>, behavior: B) -> Self {
        Self {
            name: name.into(),
            behavior,
            nodes: SlotMap::with_key(),
            index: HashMap::new(),
            initial: None,
            stack: Vec::new(),
            queue: VecDeque::new(),
            deferred: Vec::new(),
            phase: Phase::Building,
        }
    }

    /// Registers `state` under `parent`. Parents that were never added are
    /// registered implicitly as roots.
    pub fn add_state(
        &mut self,
        state: B::State,
        parent: Option<B::State>,
    ) -> Result<StateKey, MachineError> {
        self.register(state, parent, false)
    }

    /// Registers a state whose only job is to pick a destination on entry.
    /// It must always call `transition_to` from `enter`.
    pub fn add_complex_state(
        &mut self,
        state: B::State,
        parent: Option<B::State>,
    ) -> Result<StateKey, MachineError> {
        self.register(state, parent, true)
    }

    fn register(
        &mut self,
        state: B::State,
        parent: Option<B::State>,
        complex: bool,
    ) -> Result<StateKey, MachineError> {
        if self.phase != Phase::Building {
            return Err(MachineError::AlreadyStarted);
        }
        let parent_key = match parent {
            Some(p) => Some(self.register_root_if_missing(p)),
            None => None,
        };
        let key = self.register_root_if_missing(state);

        if let Some(pk) = parent_key {
            if self.ancestors(pk).any(|k| k == key) {
                return Err(MachineError::Cycle(format!("{:?}", state)));
            }
        }

        match (self.nodes[key].parent, parent_key) {
            (Some(existing), Some(requested)) if existing != requested => {
                let err = MachineError::ParentConflict {
                    state: format!("{:?}", state),
                    existing: format!("{:?}", self.nodes[existing].state),
                    requested: format!("{:?}", self.nodes[requested].state),
                };
                error!(machine = %self.name, %err, "invalid state hierarchy");
                return Err(err);
            }
            (None, Some(requested)) => self.nodes[key].parent = Some(requested),
            _ => {}
        }
        self.nodes[key].complex |= complex;
        Ok(key)
    }

    fn register_root_if_missing(&mut self, state: B::State) -> StateKey {
        if let Some(key) = self.index.get(&state) {
            return *key;
        }
        let key = self.nodes.insert(StateNode {
            state,
            parent: None,
            complex: false,
            active: false,
        });
        self.index.insert(state, key);
        key
    }

    fn ancestors(&self, from: StateKey) -> impl Iterator<Item = StateKey> + '_ {
        std::iter::successors(Some(from), move |k| self.nodes[*k].parent)
    }

    fn key_of(&self, state: B::State) -> Result<StateKey, MachineError> {
        self.index
            .get(&state)
            .copied()
            .ok_or_else(|| MachineError::UnknownState(format!("{:?}", state)))
    }

    pub fn set_initial_state(&mut self, state: B::State) -> Result<(), MachineError> {
        self.initial = Some(self.key_of(state)?);
        Ok(())
    }

    /// Queues construction of the initial state stack with `enter()` calls.
    pub fn start(&mut self) -> Result<(), MachineError> {
        self.begin(false)
    }

    /// Queues construction of the initial state stack with `resume()` calls.
    pub fn resume(&mut self) -> Result<(), MachineError> {
        self.begin(true)
    }

    fn begin(&mut self, resume: bool) -> Result<(), MachineError> {
        if self.phase != Phase::Building {
            return Err(MachineError::AlreadyStarted);
        }
        if self.initial.is_none() {
            return Err(MachineError::NoInitialState);
        }
        self.phase = Phase::Starting;
        self.queue.push_front(Queued::Init { resume });
        Ok(())
    }

    /// Appends a message to the queue. Messages sent to a halted machine are dropped.
    pub fn send(&mut self, msg: Message<B::Payload>) {
        if self.phase == Phase::Halted {
            warn!(machine = %self.name, what = msg.what(), "machine halted, dropping message");
            return;
        }
        self.queue.push_back(Queued::Deliver(msg));
    }

    /// Processes queued work until the queue is empty or a configuration error
    /// occurs. Work after a failing message stays queued.
    pub fn run_pending(&mut self) -> Result<(), MachineError> {
        if self.phase == Phase::Building {
            return Err(MachineError::NotStarted);
        }
        while let Some(item) = self.queue.pop_front() {
            if self.phase == Phase::Halted {
                self.queue.clear();
                break;
            }
            match item {
                Queued::Init { resume } => self.initialize(resume)?,
                Queued::Deliver(msg) => self.dispatch(msg)?,
            }
        }
        Ok(())
    }

    fn initialize(&mut self, resume: bool) -> Result<(), MachineError> {
        let initial = self.initial.ok_or(MachineError::NoInitialState)?;
        let mut chain: Vec<StateKey> = self.ancestors(initial).collect();
        chain.reverse();

        let leaf = self.nodes[initial].state;
        let mut ctx = Context::new(Some(leaf));
        for key in chain {
            self.stack.push(key);
            let node = &mut self.nodes[key];
            node.active = true;
            let state = node.state;
            if resume {
                trace!(machine = %self.name, ?state, "resume");
                self.behavior.resume(state, &mut ctx);
            } else {
                trace!(machine = %self.name, ?state, "enter");
                self.behavior.enter(state, &mut ctx);
            }
        }
        self.phase = Phase::Running;
        debug!(machine = %self.name, ?leaf, resume, "machine constructed");
        self.complete(ctx)
    }

    fn dispatch(&mut self, msg: Message<B::Payload>) -> Result<(), MachineError> {
        let mut ctx = Context::new(self.current_state());
        let mut handled = false;
        for key in self.stack.iter().rev() {
            let state = self.nodes[*key].state;
            if self.behavior.process(state, &msg, &mut ctx) == Disposition::Handled {
                trace!(machine = %self.name, what = msg.what(), ?state, "handled");
                handled = true;
                break;
            }
        }
        if !handled {
            let err = MachineError::Unhandled {
                what: msg.what(),
                stack: self.describe_stack(),
            };
            error!(machine = %self.name, %err, "unhandled message");
            return Err(err);
        }
        self.complete(ctx)
    }

    /// Applies the requests collected while a message or init step ran.
    fn complete(&mut self, ctx: Context<B::State, B::Payload>) -> Result<(), MachineError> {
        let Context {
            destination,
            deferred,
            mut posted,
            quit,
            ..
        } = ctx;

        if quit {
            self.halt();
            return Ok(());
        }

        self.deferred.extend(deferred);
        if let Some(destination) = destination {
            let chained = self.perform_transitions(destination)?;
            posted.extend(chained);
            if self.phase == Phase::Halted {
                return Ok(());
            }
            // Deferred messages wait for a state change, then jump the queue.
            for msg in self.deferred.drain(..).rev() {
                self.queue.push_front(Queued::Deliver(msg));
            }
        }
        self.queue.extend(posted.into_iter().map(Queued::Deliver));
        self.ensure_settled()
    }

    fn ensure_settled(&self) -> Result<(), MachineError> {
        if let Some(&leaf) = self.stack.last() {
            let node = &self.nodes[leaf];
            if node.complex {
                let err = MachineError::ComplexStateSettled(format!("{:?}", node.state));
                error!(machine = %self.name, %err, "complex state did not transition");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Resolves a transition and any transitions requested by the states it
    /// enters. Returns messages posted from `enter()` along the way.
    fn perform_transitions(
        &mut self,
        first: B::State,
    ) -> Result<Vec<Message<B::Payload>>, MachineError> {
        let mut posted = Vec::new();
        let mut destination = Some(first);

        while let Some(target) = destination.take() {
            let target_key = self.key_of(target)?;

            let mut to_enter = vec![target_key];
            let mut cursor = self.nodes[target_key].parent;
            while let Some(k) = cursor {
                if self.nodes[k].active {
                    break;
                }
                to_enter.push(k);
                cursor = self.nodes[k].parent;
            }
            let common = cursor;

            while let Some(&top) = self.stack.last() {
                if Some(top) == common {
                    break;
                }
                self.stack.pop();
                let node = &mut self.nodes[top];
                node.active = false;
                let state = node.state;
                trace!(machine = %self.name, ?state, "exit");
                self.behavior.exit(state);
            }

            let mut ctx = Context::new(Some(target));
            for key in to_enter.into_iter().rev() {
                self.stack.push(key);
                let node = &mut self.nodes[key];
                node.active = true;
                let state = node.state;
                trace!(machine = %self.name, ?state, "enter");
                self.behavior.enter(state, &mut ctx);
            }
            debug!(machine = %self.name, ?target, "transitioned");

            if ctx.quit {
                self.halt();
                return Ok(posted);
            }
            posted.append(&mut ctx.posted);
            destination = ctx.destination;
        }
        Ok(posted)
    }

    fn halt(&mut self) {
        while let Some(key) = self.stack.pop() {
            let node = &mut self.nodes[key];
            node.active = false;
            let state = node.state;
            trace!(machine = %self.name, ?state, "exit");
            self.behavior.exit(state);
        }
        self.queue.clear();
        self.deferred.clear();
        self.phase = Phase::Halted;
        debug!(machine = %self.name, "machine halted");
    }

    fn describe_stack(&self) -> String {
        self.state_stack()
            .iter()
            .map(|s| format!("{:?}", s))
            .collect::<Vec<_>>()
            .join(" > ")
    }

    /// The active leaf state, if the machine has been constructed.
    pub fn current_state(&self) -> Option<B::State> {
        self.stack.last().map(|k| self.nodes[*k].state)
    }

    /// Active states from the root down to the leaf.
    pub fn state_stack(&self) -> Vec<B::State> {
        self.stack.iter().map(|k| self.nodes[*k].state).collect()
    }

    pub fn is_active(&self, state: B::State) -> bool {
        self.index
            .get(&state)
            .is_some_and(|k| self.nodes[*k].active)
    }

    pub fn is_halted(&self) -> bool {
        self.phase == Phase::Halted
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn behavior(&self) -> &B {
        &self.behavior
    }

    pub fn behavior_mut(&mut self) -> &mut B {
        &mut self.behavior
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A small door/lock machine:
    //
    //   Closed
    //     Locked
    //     Unlocked
    //   Open
    //   Deciding (complex)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Door {
        Closed,
        Locked,
        Unlocked,
        Open,
        Deciding,
    }

    const OPEN: u32 = 1;
    const CLOSE: u32 = 2;
    const LOCK: u32 = 3;
    const UNLOCK: u32 = 4;
    const KNOCK: u32 = 5;
    const DECIDE: u32 = 6;
    const BREAK: u32 = 7;
    const PING: u32 = 8;

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
        lock_after_close: bool,
    }

    impl Behavior for Recorder {
        type State = Door;
        type Payload = &'static str;

        fn enter(&mut self, state: Door, ctx: &mut Context<Door, &'static str>) {
            self.log.push(format!("enter {:?}", state));
            if state == Door::Deciding {
                ctx.transition_to(if self.lock_after_close {
                    Door::Locked
                } else {
                    Door::Unlocked
                });
            }
        }

        fn exit(&mut self, state: Door) {
            self.log.push(format!("exit {:?}", state));
        }

        fn resume(&mut self, state: Door, _ctx: &mut Context<Door, &'static str>) {
            self.log.push(format!("resume {:?}", state));
        }

        fn process(
            &mut self,
            state: Door,
            msg: &Message<&'static str>,
            ctx: &mut Context<Door, &'static str>,
        ) -> Disposition {
            match (state, msg.what()) {
                (Door::Unlocked, OPEN) => ctx.transition_to(Door::Open),
                (Door::Unlocked, LOCK) => ctx.transition_to(Door::Locked),
                (Door::Locked, UNLOCK) => ctx.transition_to(Door::Unlocked),
                (Door::Locked, OPEN) => ctx.defer(msg),
                (Door::Open, CLOSE) => ctx.transition_to(Door::Unlocked),
                (Door::Open, DECIDE) => ctx.transition_to(Door::Deciding),
                (Door::Closed, KNOCK) => {
                    self.log.push(format!("knock {}", msg.payload().copied().unwrap_or("")));
                }
                (Door::Closed, PING) => ctx.post(Message::new(KNOCK).with_payload("posted")),
                (_, BREAK) => ctx.quit(),
                _ => return Disposition::NotHandled,
            }
            Disposition::Handled
        }
    }

    fn door(initial: Door) -> StateMachine<Recorder> {
        let mut sm = StateMachine::new("door", Recorder::default());
        sm.add_state(Door::Locked, Some(Door::Closed)).unwrap();
        sm.add_state(Door::Unlocked, Some(Door::Closed)).unwrap();
        sm.add_state(Door::Open, None).unwrap();
        sm.add_complex_state(Door::Deciding, Some(Door::Closed)).unwrap();
        sm.set_initial_state(initial).unwrap();
        sm
    }

    fn take_log(sm: &mut StateMachine<Recorder>) -> Vec<String> {
        std::mem::take(&mut sm.behavior_mut().log)
    }

    #[test]
    fn start_enters_root_to_leaf() {
        let mut sm = door(Door::Locked);
        sm.start().unwrap();
        sm.run_pending().unwrap();
        assert_eq!(take_log(&mut sm), vec!["enter Closed", "enter Locked"]);
        assert_eq!(sm.state_stack(), vec![Door::Closed, Door::Locked]);
    }

    #[test]
    fn resume_suppresses_enter() {
        let mut sm = door(Door::Unlocked);
        sm.resume().unwrap();
        sm.run_pending().unwrap();
        assert_eq!(take_log(&mut sm), vec!["resume Closed", "resume Unlocked"]);
        assert_eq!(sm.current_state(), Some(Door::Unlocked));
    }

    #[test]
    fn sibling_transition_keeps_common_ancestor() {
        let mut sm = door(Door::Unlocked);
        sm.start().unwrap();
        sm.run_pending().unwrap();
        take_log(&mut sm);

        sm.send(Message::new(LOCK));
        sm.run_pending().unwrap();
        assert_eq!(take_log(&mut sm), vec!["exit Unlocked", "enter Locked"]);
        assert!(sm.is_active(Door::Closed));
    }

    #[test]
    fn transition_across_roots_exits_and_enters_whole_branches() {
        let mut sm = door(Door::Unlocked);
        sm.start().unwrap();
        sm.run_pending().unwrap();
        take_log(&mut sm);

        sm.send(Message::new(OPEN));
        sm.run_pending().unwrap();
        assert_eq!(take_log(&mut sm), vec!["exit Unlocked", "exit Closed", "enter Open"]);

        sm.send(Message::new(CLOSE));
        sm.run_pending().unwrap();
        assert_eq!(take_log(&mut sm), vec!["exit Open", "enter Closed", "enter Unlocked"]);
    }

    #[test]
    fn unhandled_message_falls_back_to_parent() {
        let mut sm = door(Door::Locked);
        sm.start().unwrap();
        sm.send(Message::new(KNOCK).with_payload("twice"));
        sm.run_pending().unwrap();
        assert!(take_log(&mut sm).contains(&"knock twice".to_string()));
    }

    #[test]
    fn message_nobody_handles_is_a_configuration_error() {
        let mut sm = door(Door::Open);
        sm.start().unwrap();
        sm.send(Message::new(KNOCK));
        let err = sm.run_pending().unwrap_err();
        assert_eq!(
            err,
            MachineError::Unhandled {
                what: KNOCK,
                stack: "Open".to_string()
            }
        );
    }

    #[test]
    fn deferred_message_is_replayed_before_later_messages() {
        let mut sm = door(Door::Locked);
        sm.start().unwrap();
        sm.run_pending().unwrap();
        take_log(&mut sm);

        // OPEN waits while locked. CLOSE arrived later and must not overtake it,
        // since nothing under Closed handles CLOSE.
        sm.send(Message::new(OPEN));
        sm.send(Message::new(UNLOCK));
        sm.send(Message::new(CLOSE));
        sm.run_pending().unwrap();

        assert_eq!(sm.current_state(), Some(Door::Unlocked));
        assert_eq!(
            take_log(&mut sm),
            vec![
                "exit Locked",
                "enter Unlocked",
                "exit Unlocked",
                "exit Closed",
                "enter Open",
                "exit Open",
                "enter Closed",
                "enter Unlocked",
            ]
        );
    }

    #[test]
    fn deferred_message_waits_for_a_transition() {
        let mut sm = door(Door::Locked);
        sm.start().unwrap();
        sm.send(Message::new(OPEN));
        sm.send(Message::new(KNOCK).with_payload("while deferred"));
        sm.run_pending().unwrap();

        assert_eq!(sm.current_state(), Some(Door::Locked));
        assert!(take_log(&mut sm).contains(&"knock while deferred".to_string()));

        sm.send(Message::new(UNLOCK));
        sm.run_pending().unwrap();
        assert_eq!(sm.current_state(), Some(Door::Open));
    }

    #[test]
    fn complex_state_redirects_on_entry() {
        let mut sm = door(Door::Open);
        sm.behavior_mut().lock_after_close = true;
        sm.start().unwrap();
        sm.run_pending().unwrap();
        take_log(&mut sm);

        sm.send(Message::new(DECIDE));
        sm.run_pending().unwrap();
        assert_eq!(sm.current_state(), Some(Door::Locked));
        assert_eq!(
            take_log(&mut sm),
            vec![
                "exit Open",
                "enter Closed",
                "enter Deciding",
                "exit Deciding",
                "enter Locked",
            ]
        );
    }

    #[test]
    fn complex_initial_state_resolves_during_start() {
        let mut sm = door(Door::Deciding);
        sm.start().unwrap();
        sm.run_pending().unwrap();
        assert_eq!(sm.current_state(), Some(Door::Unlocked));
    }

    #[test]
    fn reparenting_a_state_is_rejected() {
        let mut sm = door(Door::Open);
        let err = sm.add_state(Door::Locked, Some(Door::Open)).unwrap_err();
        assert!(matches!(err, MachineError::ParentConflict { .. }));
    }

    #[test]
    fn implicit_parent_can_be_placed_later() {
        let mut sm: StateMachine<Recorder> = StateMachine::new("door", Recorder::default());
        sm.add_state(Door::Locked, Some(Door::Closed)).unwrap();
        sm.add_state(Door::Closed, Some(Door::Open)).unwrap();
        sm.set_initial_state(Door::Locked).unwrap();
        sm.start().unwrap();
        sm.run_pending().unwrap();
        assert_eq!(sm.state_stack(), vec![Door::Open, Door::Closed, Door::Locked]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut sm: StateMachine<Recorder> = StateMachine::new("door", Recorder::default());
        sm.add_state(Door::Locked, Some(Door::Closed)).unwrap();
        let err = sm.add_state(Door::Closed, Some(Door::Locked)).unwrap_err();
        assert!(matches!(err, MachineError::Cycle(_)));
    }

    #[test]
    fn start_requires_initial_state() {
        let mut sm: StateMachine<Recorder> = StateMachine::new("door", Recorder::default());
        sm.add_state(Door::Open, None).unwrap();
        assert_eq!(sm.start(), Err(MachineError::NoInitialState));
        assert_eq!(sm.run_pending(), Err(MachineError::NotStarted));
    }

    #[test]
    fn messages_sent_before_start_wait_for_init() {
        let mut sm = door(Door::Unlocked);
        sm.send(Message::new(OPEN));
        sm.start().unwrap();
        sm.run_pending().unwrap();
        assert_eq!(sm.current_state(), Some(Door::Open));
    }

    #[test]
    fn posted_messages_run_after_the_current_one() {
        let mut sm = door(Door::Locked);
        sm.start().unwrap();
        sm.send(Message::new(PING));
        sm.run_pending().unwrap();
        assert!(take_log(&mut sm).contains(&"knock posted".to_string()));
    }

    #[test]
    fn quit_exits_everything_and_drops_later_messages() {
        let mut sm = door(Door::Locked);
        sm.start().unwrap();
        sm.run_pending().unwrap();
        take_log(&mut sm);

        sm.send(Message::new(BREAK));
        sm.send(Message::new(UNLOCK));
        sm.run_pending().unwrap();
        assert!(sm.is_halted());
        assert_eq!(take_log(&mut sm), vec!["exit Locked", "exit Closed"]);
        assert_eq!(sm.current_state(), None);

        sm.send(Message::new(UNLOCK));
        assert!(!sm.has_pending());
    }
}
