//! A generic hierarchical, message-driven state machine engine.
//!
//! States are plain values (usually a fieldless enum) registered into a parent
//! table when the machine is built. A `Behavior` implementation supplies the
//! enter/exit/resume hooks and message handlers by matching on the state it is
//! called for. The engine owns the single message queue, the active state
//! stack, deferred-message replay and transition resolution.
//!
//! ## Lifecycle
//!
//! - `start()` queues a synthetic init step that calls `enter()` on every state
//!   from the root down to the initial state.
//! - `resume()` does the same but calls `resume()` instead of `enter()`, which
//!   lets a machine be rebuilt from persisted state without replaying entry
//!   side effects.
//! - `transition_to()` requested from a handler takes effect after the handler
//!   returns. Exits run leaf-upward to the common ancestor, enters run
//!   ancestor-downward to the destination.
//! - Deferred messages are replayed, in their original order, right after the
//!   transition that followed the deferring handler.

mod machine;
mod message;

pub use machine::{Behavior, Context, Disposition, MachineError, StateMachine};
pub use message::Message;
