//! Suspendable tasks.
//!
//! A [`Task`] is a state machine driven by a stackful coroutine (via
//! `corosensei`). The observable contract -- state transitions, defers,
//! listeners -- is what matters to callers; the stack-switching
//! substrate underneath is an implementation detail.

mod context;
mod listener;

pub use context::{current, defer, suspend, Value};
pub use listener::{ListenerQueues, Priority as ListenerPriority};

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::debug::{Trace, TraceRing};
use crate::error::{ErrorKind, WispError};

/// 256 KiB coroutine stacks: generous because task bodies here may call
/// arbitrarily deep into user code (HTTP handlers, etc.) rather than a
/// constrained actor ABI.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Unique task identifier, assigned sequentially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The fixed id reserved for the main task.
    pub(crate) const MAIN: TaskId = TaskId(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// The execution state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created,
    Runnable,
    Running,
    Waiting,
    Dead,
}

/// What gets fed back into a suspended task on resume: either a value
/// (`resume`) or an exception to raise at the suspension point (`throw`).
pub(crate) enum Resumption {
    Value(Value),
    Exception(WispError),
}

type Entry = Box<dyn FnOnce() -> Result<Value, WispError>>;
type TaskCoroutine = Coroutine<Resumption, Value, Result<Value, WispError>>;

/// A suspendable unit of execution.
pub struct Task {
    id: TaskId,
    state: TaskState,
    entry: Option<Entry>,
    coro: Option<TaskCoroutine>,
    last_result: Option<Termination>,
    defers: Vec<Box<dyn FnOnce()>>,
    defers_executed: bool,
    pub(crate) trace: TraceRing,
    pub(crate) listeners: ListenerQueues,
    pending_fires: Vec<listener::Callback>,
    /// Set by the coroutine closure on first entry; read by `start`/
    /// `resume_with` to push this task's context frame before driving it.
    yielder_cell: context::YielderCell,
}

impl Task {
    /// Create a task in state `CREATED`, bound to the given entry closure.
    /// `max_traces` sizes the per-task debug ring (`Config::max_traces`).
    pub fn create<F>(entry: F, max_traces: usize) -> Self
    where
        F: FnOnce() -> Result<Value, WispError> + 'static,
    {
        Task {
            id: TaskId::next(),
            state: TaskState::Created,
            entry: Some(Box::new(entry)),
            coro: None,
            last_result: None,
            defers: Vec::new(),
            defers_executed: false,
            trace: TraceRing::new(max_traces),
            listeners: ListenerQueues::new(),
            pending_fires: Vec::new(),
            yielder_cell: Rc::new(Cell::new(None)),
        }
    }

    /// Construct the distinguished main-task singleton. Never transitions
    /// to `DEAD` during normal operation; callers model it as always
    /// `Running` while the runtime's outer `block_on` loop is active.
    pub fn main(max_traces: usize) -> Self {
        let mut t = Task::create(|| Ok(Value::unit()), max_traces);
        t.id = TaskId::MAIN;
        t.state = TaskState::Running;
        t
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn last_result(&self) -> Option<&Termination> {
        self.last_result.as_ref()
    }

    /// Register a defer, to run exactly once when this task reaches `DEAD`.
    /// Valid to call any time before termination; registration is not
    /// restricted to a particular state.
    pub fn defer<F: FnOnce() + 'static>(&mut self, f: F) {
        self.defers.push(Box::new(f));
    }

    fn run_defers(&mut self) {
        if self.defers_executed {
            return;
        }
        self.defers_executed = true;
        for defer in self.defers.drain(..) {
            defer();
        }
    }

    fn transition(&mut self, to: TaskState) {
        if self.state == to {
            return;
        }
        self.state = to;
        self.pending_fires.extend(self.listeners.fire(to));
    }

    /// Drain listener callbacks fired by the most recent transition(s).
    /// The scheduler runs each of these inside a freshly spawned task so a
    /// listener fault cannot corrupt the emitter's own stack.
    pub(crate) fn take_pending_fires(&mut self) -> Vec<listener::Callback> {
        std::mem::take(&mut self.pending_fires)
    }

    /// Valid only in `RUNNABLE`. Builds the coroutine from the bound entry
    /// and resumes it for the first time.
    pub fn start(&mut self) -> Result<StepOutcome, WispError> {
        if self.state != TaskState::Runnable {
            return Err(WispError::task_state("RUNNABLE", state_name(self.state)));
        }
        let entry = self
            .entry
            .take()
            .expect("RUNNABLE task must still hold its entry closure");

        let stack = DefaultStack::new(DEFAULT_STACK_SIZE)
            .map_err(|e| WispError::new(ErrorKind::Argument, format!("stack allocation failed: {e}")))?;

        let yielder_cell = self.yielder_cell.clone();
        let coro: TaskCoroutine = Coroutine::with_stack(stack, move |yielder, _first: Resumption| {
            yielder_cell.set(Some(yielder_erase(yielder)));
            entry()
        });
        self.coro = Some(coro);
        self.transition(TaskState::Running);
        self.trace.record(TaskState::Running, "start", Trace::capture("wisp::task::start"));
        // Safety: `self.defers` stays put for the duration of this call;
        // popped below before `self` could possibly move.
        unsafe { context::push_current(self.id, self.yielder_cell.clone(), &mut self.defers as *mut _) };
        let result = self.drive(|coro| coro.resume(Resumption::Value(Value::unit())));
        context::pop_current();
        result
    }

    /// Valid if currently `WAITING`. Resumes with a value.
    pub fn resume(&mut self, value: Value) -> Result<StepOutcome, WispError> {
        self.resume_with(Resumption::Value(value))
    }

    /// Valid if currently `WAITING`. Resumes by raising `exc` at the
    /// suspension point.
    pub fn throw(&mut self, exc: WispError) -> Result<StepOutcome, WispError> {
        self.resume_with(Resumption::Exception(exc))
    }

    fn resume_with(&mut self, input: Resumption) -> Result<StepOutcome, WispError> {
        if self.state != TaskState::Waiting {
            return Err(WispError::task_state("WAITING", state_name(self.state)));
        }
        self.transition(TaskState::Running);
        self.trace.record(TaskState::Running, "resume", Trace::capture("wisp::task::resume"));
        // Safety: see `start`.
        unsafe { context::push_current(self.id, self.yielder_cell.clone(), &mut self.defers as *mut _) };
        let result = self.drive(|coro| coro.resume(input));
        context::pop_current();
        result
    }

    fn drive(
        &mut self,
        step: impl FnOnce(&mut TaskCoroutine) -> CoroutineResult<Value, Result<Value, WispError>>,
    ) -> Result<StepOutcome, WispError> {
        let coro = self.coro.as_mut().expect("coroutine must exist while RUNNING");
        match step(coro) {
            CoroutineResult::Yield(value) => {
                self.transition(TaskState::Waiting);
                self.trace.record(TaskState::Waiting, "suspend", Trace::capture("wisp::task::suspend"));
                Ok(StepOutcome::Suspended(value))
            }
            CoroutineResult::Return(result) => {
                self.last_result = Some(match &result {
                    Ok(_) => Termination::Completed,
                    Err(e) => Termination::Failed(e.clone()),
                });
                self.transition(TaskState::Dead);
                self.trace.record(TaskState::Dead, "terminate", Trace::capture("wisp::task::terminate"));
                self.run_defers();
                Ok(StepOutcome::Terminated(result))
            }
        }
    }

    /// Valid only in `DEAD`. Clears all per-run state and rebinds a fresh
    /// entry, transitioning back to `CREATED`.
    pub fn recycle<F>(&mut self, entry: F) -> Result<(), WispError>
    where
        F: FnOnce() -> Result<Value, WispError> + 'static,
    {
        if self.state != TaskState::Dead {
            return Err(WispError::task_state("DEAD", state_name(self.state)));
        }
        self.listeners.clear();
        self.pending_fires.clear();
        self.defers.clear();
        self.defers_executed = false;
        self.last_result = None;
        self.trace.clear();
        self.coro = None;
        self.entry = Some(Box::new(entry));
        self.state = TaskState::Created;
        self.yielder_cell = Rc::new(Cell::new(None));
        Ok(())
    }

    /// Mark the task `RUNNABLE` (called by the scheduler's `enqueue`).
    pub(crate) fn mark_runnable(&mut self) {
        self.transition(TaskState::Runnable);
    }

    /// Whitebox test hook: force the state field directly, bypassing the
    /// normal transition machinery. Exists because a task is only ever
    /// actually `RUNNING` while it holds the Rust call stack (removed from
    /// the scheduler's task table for that whole synchronous span), so
    /// `scheduler`'s own tests have no other way to construct a `Task`
    /// that reports `RUNNING` while sitting in the table.
    #[cfg(test)]
    pub(crate) fn force_state_for_test(&mut self, state: TaskState) {
        self.state = state;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("defers", &self.defers.len())
            .finish()
    }
}

fn state_name(s: TaskState) -> &'static str {
    match s {
        TaskState::Created => "CREATED",
        TaskState::Runnable => "RUNNABLE",
        TaskState::Running => "RUNNING",
        TaskState::Waiting => "WAITING",
        TaskState::Dead => "DEAD",
    }
}

/// A lightweight summary of how a task terminated, kept for introspection
/// after the full result value has been moved out via `StepOutcome`.
#[derive(Debug, Clone)]
pub enum Termination {
    Completed,
    Failed(WispError),
}

/// What a single `start`/`resume`/`throw` step produced.
pub enum StepOutcome {
    Suspended(Value),
    Terminated(Result<Value, WispError>),
}

/// Erase the `Yielder`'s lifetime so it can live in a thread-local for the
/// duration of the coroutine body.
fn yielder_erase(y: &Yielder<Resumption, Value>) -> *const () {
    y as *const Yielder<Resumption, Value> as *const ()
}

impl Value {
    /// A unit value, used for the implicit first resume and for primitives
    /// that don't carry data across a suspension point.
    pub fn unit() -> Self {
        Value::new(())
    }
}

/// Allow wrapping arbitrary owned data for `suspend`/`resume`/`throw`.
pub trait AnyValue: Any {}
impl<T: Any> AnyValue for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_runs_to_completion() {
        let mut t = Task::create(|| Ok(Value::new(42i32)), 10);
        t.mark_runnable();
        let outcome = t.start().unwrap();
        match outcome {
            StepOutcome::Terminated(Ok(v)) => assert_eq!(*v.downcast::<i32>().unwrap(), 42),
            _ => panic!("expected immediate termination"),
        }
        assert_eq!(t.state(), TaskState::Dead);
    }

    #[test]
    fn test_task_suspend_resume() {
        let mut t = Task::create(
            || {
                let got = suspend(Value::new("hello"))?;
                Ok(Value::new(*got.downcast::<i32>().unwrap() + 1))
            },
            10,
        );
        t.mark_runnable();
        let outcome = t.start().unwrap();
        match outcome {
            StepOutcome::Suspended(v) => assert_eq!(*v.downcast::<&str>().unwrap(), "hello"),
            _ => panic!("expected suspension"),
        }
        assert_eq!(t.state(), TaskState::Waiting);
        let outcome = t.resume(Value::new(41i32)).unwrap();
        match outcome {
            StepOutcome::Terminated(Ok(v)) => assert_eq!(*v.downcast::<i32>().unwrap(), 42),
            _ => panic!("expected termination after resume"),
        }
    }

    #[test]
    fn test_task_throw_propagates() {
        let mut t = Task::create(
            || match suspend(Value::unit()) {
                Ok(_) => Ok(Value::unit()),
                Err(e) => Err(e),
            },
            10,
        );
        t.mark_runnable();
        t.start().unwrap();
        let outcome = t.throw(WispError::terminate()).unwrap();
        match outcome {
            StepOutcome::Terminated(Err(e)) => assert_eq!(e.kind, ErrorKind::Terminate),
            _ => panic!("expected terminated with error"),
        }
    }

    #[test]
    fn test_defers_run_once_on_death() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let mut t = Task::create(move || Ok(Value::unit()), 10);
        t.defer(move || log2.borrow_mut().push("deferred"));
        t.mark_runnable();
        t.start().unwrap();
        assert_eq!(*log.borrow(), vec!["deferred"]);
    }

    #[test]
    fn test_recycle_resets_state() {
        let mut t = Task::create(|| Ok(Value::unit()), 10);
        t.mark_runnable();
        t.start().unwrap();
        assert_eq!(t.state(), TaskState::Dead);
        t.recycle(|| Ok(Value::new(7i32))).unwrap();
        assert_eq!(t.state(), TaskState::Created);
        t.mark_runnable();
        let outcome = t.start().unwrap();
        match outcome {
            StepOutcome::Terminated(Ok(v)) => assert_eq!(*v.downcast::<i32>().unwrap(), 7),
            _ => panic!(),
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut t = Task::create(|| Ok(Value::unit()), 10);
        // start() on a CREATED task (not RUNNABLE) is invalid.
        let err = t.start().unwrap_err();
        assert_eq!(err.kind, ErrorKind::TaskState);
    }
}
