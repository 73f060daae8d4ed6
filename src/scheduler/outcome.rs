//! `Outcome`: a result with a resolution acknowledgment. Every scheduler
//! control operation (`start`/`resume`/`throw`/`terminate`) returns one of
//! these instead of a plain `Result`, because the scheduler needs to know
//! whether the caller *acknowledged* a specific failure kind before
//! deciding whether to surface it at end of tick.

use crate::debug::Trace;
use crate::error::{ErrorKind, WispError};
use crate::task::{TaskId, Value};

/// Which control operation produced an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Resume,
    Throw,
    Terminate,
}

impl Action {
    fn name(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Resume => "resume",
            Action::Throw => "throw",
            Action::Terminate => "terminate",
        }
    }
}

/// The return value of every scheduler control operation.
pub struct Outcome {
    pub action: Action,
    pub task: TaskId,
    pub value: Option<Value>,
    pub exception: Option<WispError>,
    /// Capture-site trace for this control op specifically, distinct from
    /// the task's own debug ring.
    pub trace: Trace,
    resolved: Option<ErrorKind>,
}

impl Outcome {
    pub(crate) fn ok(action: Action, task: TaskId, value: Option<Value>) -> Self {
        Outcome {
            action,
            task,
            value,
            exception: None,
            trace: Trace::capture(action.name()),
            resolved: None,
        }
    }

    pub(crate) fn err(action: Action, task: TaskId, exception: WispError) -> Self {
        Outcome {
            action,
            task,
            value: None,
            exception: Some(exception),
            trace: Trace::capture(action.name()),
            resolved: None,
        }
    }

    pub fn is_err(&self) -> bool {
        self.exception.is_some()
    }

    /// Acknowledge that the caller expected and handled a failure of this
    /// kind; the scheduler's end-of-tick error surfacer will not report it.
    pub fn resolve(&mut self, kind: ErrorKind) {
        if let Some(exc) = &self.exception {
            if exc.kind == kind {
                self.resolved = Some(kind);
            }
        }
    }

    /// True if this outcome carries no exception, or its exception has been
    /// `resolve`d.
    pub fn is_handled(&self) -> bool {
        self.exception.is_none() || self.resolved.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    #[test]
    fn test_resolve_matching_kind_marks_handled() {
        let mut o = Outcome::err(Action::Throw, TaskId::next(), WispError::terminate());
        assert!(!o.is_handled());
        o.resolve(ErrorKind::Terminate);
        assert!(o.is_handled());
    }

    #[test]
    fn test_resolve_mismatched_kind_leaves_unhandled() {
        let mut o = Outcome::err(Action::Throw, TaskId::next(), WispError::terminate());
        o.resolve(ErrorKind::Timeout);
        assert!(!o.is_handled());
    }

    #[test]
    fn test_ok_outcome_always_handled() {
        let o = Outcome::ok(Action::Start, TaskId::next(), None);
        assert!(o.is_handled());
    }
}
