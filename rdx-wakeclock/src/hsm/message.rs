//! The envelope every state machine consumes.

/// An immutable message: an integer opcode, an optional numeric argument and
/// an optional payload.
///
/// Messages are built once and never mutated; the builder methods consume the
/// value and return a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<P> {
    what: u32,
    arg: Option<i64>,
    payload: Option<P>,
}

impl<P> Message<P> {
    pub fn new(what: u32) -> Self {
        Self {
            what,
            arg: None,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_arg(self, arg: i64) -> Self {
        Self {
            arg: Some(arg),
            ..self
        }
    }

    #[must_use]
    pub fn with_payload(self, payload: P) -> Self {
        Self {
            payload: Some(payload),
            ..self
        }
    }

    pub fn what(&self) -> u32 {
        self.what
    }

    pub fn arg(&self) -> Option<i64> {
        self.arg
    }

    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }
}
