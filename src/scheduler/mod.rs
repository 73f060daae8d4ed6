//! The tick-driven scheduler.
//!
//! Owns a FIFO runnable queue, an ordered next-tick list, and the task
//! table -- direct ownership rather than a weak-map indirection, since a
//! single OS thread means there is never a second owner to race against.
//! See DESIGN.md.

mod outcome;

pub use outcome::{Action, Outcome};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::config::Config;
use crate::debug::{ErrorSink, StderrSink};
use crate::error::{ErrorKind, WispError};
use crate::reactor::Reactor;
use crate::task::{listener, StepOutcome, Task, TaskId, TaskState, Value};

type Report = Rc<RefCell<Outcome>>;

/// Owns every task, the runnable/next-tick queues, and the reactor.
pub struct Scheduler {
    config: Config,
    tasks: RefCell<FxHashMap<TaskId, Task>>,
    runnable: RefCell<VecDeque<TaskId>>,
    next_tick: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    pending_reports: RefCell<Vec<Report>>,
    reactor: RefCell<Box<dyn Reactor>>,
    sink: Box<dyn ErrorSink>,
}

impl Scheduler {
    pub fn new(config: Config, reactor: Box<dyn Reactor>) -> Self {
        Scheduler {
            config,
            tasks: RefCell::new(FxHashMap::default()),
            runnable: RefCell::new(VecDeque::new()),
            next_tick: RefCell::new(VecDeque::new()),
            pending_reports: RefCell::new(Vec::new()),
            reactor: RefCell::new(reactor),
            sink: Box::new(StderrSink),
        }
    }

    pub fn with_error_sink(mut self, sink: Box<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reactor(&self) -> &RefCell<Box<dyn Reactor>> {
        &self.reactor
    }

    /// Create a task bound to `entry` and mark it `RUNNABLE`.
    ///
    /// When `immediate` is true, `start` is called right now
    /// (synchronously, before `enqueue` returns); otherwise the task is
    /// appended to the runnable queue and started on the next drain.
    pub fn go<F>(&self, entry: F, immediate: bool) -> TaskId
    where
        F: FnOnce() -> Result<Value, WispError> + 'static,
    {
        let task = Task::create(entry, self.config.max_traces);
        let id = task.id();
        self.tasks.borrow_mut().insert(id, task);
        self.enqueue(id, immediate);
        id
    }

    /// Mark `id` runnable; either start it now or append it to the
    /// runnable queue.
    pub fn enqueue(&self, id: TaskId, immediate: bool) {
        if let Some(task) = self.tasks.borrow_mut().get_mut(&id) {
            task.mark_runnable();
        }
        self.spawn_listener_fires(id);
        if immediate {
            let _ = self.start(id);
        } else {
            self.runnable.borrow_mut().push_back(id);
        }
    }

    /// `Scheduler::start` -- installs the task, calls `Task::start`, and
    /// on termination removes it from the table after running defers
    /// (defers already ran inside `Task::start`/`drive`).
    ///
    /// The task is temporarily *removed* from the table for the duration
    /// of the coroutine step, rather than borrowed in place: a task body
    /// may itself call back into the scheduler before suspending again
    /// (a mutex unlock waking the next waiter, a channel send resuming a
    /// receiver), and that reentrant call needs to borrow `self.tasks`
    /// too. Holding the outer borrow across the coroutine switch would
    /// make any such wake-up panic with a double mutable borrow.
    pub fn start(&self, id: TaskId) -> Report {
        let mut task = match self.tasks.borrow_mut().remove(&id) {
            Some(t) => t,
            None => return self.report(Action::Start, id, Err(WispError::task_state("known task", "unknown"))),
        };
        let step = task.start();
        self.tasks.borrow_mut().insert(id, task);
        self.finish_step(Action::Start, id, step)
    }

    pub fn resume(&self, id: TaskId, value: Value) -> Report {
        let mut task = match self.tasks.borrow_mut().remove(&id) {
            Some(t) => t,
            None => return self.report(Action::Resume, id, Err(WispError::task_state("known task", "unknown"))),
        };
        let step = task.resume(value);
        self.tasks.borrow_mut().insert(id, task);
        self.finish_step(Action::Resume, id, step)
    }

    pub fn throw(&self, id: TaskId, exc: WispError) -> Report {
        let mut task = match self.tasks.borrow_mut().remove(&id) {
            Some(t) => t,
            None => return self.report(Action::Throw, id, Err(WispError::task_state("known task", "unknown"))),
        };
        let step = task.throw(exc);
        self.tasks.borrow_mut().insert(id, task);
        self.finish_step(Action::Throw, id, step)
    }

    /// If `id` is currently `RUNNING`, arm a high-priority one-shot
    /// `WAITING` listener that throws `Terminate` as soon as it suspends.
    /// Otherwise throw directly.
    pub fn terminate(&self, id: TaskId) -> Report {
        let is_running = self
            .tasks
            .borrow()
            .get(&id)
            .map(|t| t.state() == TaskState::Running)
            .unwrap_or(false);

        if is_running {
            if let Some(task) = self.tasks.borrow_mut().get_mut(&id) {
                task.listeners.on(
                    TaskState::Waiting,
                    listener::Priority::High,
                    Box::new(move || {
                        with_current(|sched| {
                            // This throw's own Report is unreachable by any
                            // caller (it runs inside a listener callback,
                            // not the `terminate()` call that armed it) --
                            // resolve it here so it never reaches the
                            // end-of-tick surfacer as an "unresolved" error
                            // even though termination is proceeding exactly
                            // as designed.
                            sched.throw(id, WispError::terminate()).borrow_mut().resolve(ErrorKind::Terminate);
                        });
                    }),
                );
            }
            self.report(Action::Terminate, id, Ok(None))
        } else {
            let report = self.throw(id, WispError::terminate());
            report.borrow_mut().resolve(ErrorKind::Terminate);
            report
        }
    }

    /// Append to the next-tick list; guaranteed to run before the next
    /// reactor poll.
    pub fn next_tick(&self, f: Box<dyn FnOnce()>) {
        self.next_tick.borrow_mut().push_back(f);
    }

    /// Child-side reset after `fork()`: COW gives the child its own copy
    /// of every task the parent had in flight, but only the tasks `fork`'s
    /// own caller spawns afterward should ever run in the child. Clears
    /// the task table, runnable queue, next-tick queue, and any pending
    /// unresolved-error reports; the reactor is reset separately via
    /// `Reactor::on_fork`.
    pub fn on_fork(&self) {
        self.tasks.borrow_mut().clear();
        self.runnable.borrow_mut().clear();
        self.next_tick.borrow_mut().clear();
        self.pending_reports.borrow_mut().clear();
    }

    fn finish_step(&self, action: Action, id: TaskId, step: Result<StepOutcome, WispError>) -> Report {
        match step {
            Ok(StepOutcome::Suspended(value)) => {
                self.spawn_listener_fires(id);
                self.report(action, id, Ok(Some(value)))
            }
            Ok(StepOutcome::Terminated(result)) => {
                self.spawn_listener_fires(id);
                self.tasks.borrow_mut().remove(&id);
                match result {
                    Ok(value) => self.report(action, id, Ok(Some(value))),
                    Err(e) => self.report(action, id, Err(e)),
                }
            }
            Err(e) => self.report(action, id, Err(e)),
        }
    }

    fn spawn_listener_fires(&self, id: TaskId) {
        let fires = self
            .tasks
            .borrow_mut()
            .get_mut(&id)
            .map(|t| t.take_pending_fires())
            .unwrap_or_default();
        for cb in fires {
            // Each listener runs inside a fresh task so a listener fault
            // cannot corrupt the emitter's own stack.
            self.go(
                move || {
                    cb();
                    Ok(Value::unit())
                },
                true,
            );
        }
    }

    fn report(&self, action: Action, id: TaskId, result: Result<Option<Value>, WispError>) -> Report {
        let outcome = match result {
            Ok(value) => Outcome::ok(action, id, value),
            Err(e) => Outcome::err(action, id, e),
        };
        let rc = Rc::new(RefCell::new(outcome));
        if rc.borrow().is_err() {
            self.pending_reports.borrow_mut().push(rc.clone());
        }
        rc
    }

    fn drain_next_tick(&self) -> Result<(), WispError> {
        let batch: Vec<_> = self.next_tick.borrow_mut().drain(..).collect();
        let mut first_err: Option<WispError> = None;
        for cb in batch {
            let result = catch_unwind(AssertUnwindSafe(cb));
            if let Err(panic) = result {
                if first_err.is_none() {
                    first_err = Some(WispError::new(ErrorKind::Argument, panic_message(panic)));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn drain_runnable(&self) {
        loop {
            let next = self.runnable.borrow_mut().pop_front();
            match next {
                Some(id) => {
                    if self
                        .tasks
                        .borrow()
                        .get(&id)
                        .map(|t| t.state() == TaskState::Runnable)
                        .unwrap_or(false)
                    {
                        self.start(id);
                    }
                }
                None => break,
            }
        }
    }

    fn flush_reports(&self) {
        let reports: Vec<_> = self.pending_reports.borrow_mut().drain(..).collect();
        for report in reports {
            let outcome = report.borrow();
            if !outcome.is_handled() {
                let exc = outcome.exception.as_ref().unwrap();
                let debug = self.config.debug;
                let trace_str = outcome.trace.render(debug);
                let task_trace = self
                    .tasks
                    .borrow()
                    .get(&outcome.task)
                    .map(|t| t.trace.to_string())
                    .unwrap_or_default();
                self.sink.report(&format!(
                    "unresolved {:?} on {}: {}\n{}{}",
                    outcome.action, outcome.task, exc, trace_str, task_trace
                ));
            }
        }
    }

    /// One quantum of the driver loop: next-tick, one reactor step,
    /// drain runnable, flush unresolved reports.
    pub fn step(&self) -> Result<(), WispError> {
        self.drain_next_tick()?;
        // Don't let the reactor block if there is already CPU work
        // waiting; only idle on I/O/timers when genuinely out of work.
        let non_blocking = !self.runnable.borrow().is_empty() || !self.next_tick.borrow().is_empty();
        let hint = if non_blocking { Some(std::time::Duration::ZERO) } else { None };
        self.reactor.borrow_mut().tick(hint)?;
        self.drain_runnable();
        self.flush_reports();
        Ok(())
    }

    /// True while there is still work: runnable tasks, pending next-tick
    /// callbacks, or an active reactor.
    pub fn has_work(&self) -> bool {
        !self.runnable.borrow().is_empty()
            || !self.next_tick.borrow().is_empty()
            || self.reactor.borrow().is_active()
    }

    /// Run `step()` until no work remains.
    pub fn run_to_completion(&self) -> Result<(), WispError> {
        while self.has_work() {
            self.step()?;
        }
        Ok(())
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.borrow().get(&id).map(|t| t.state())
    }

    pub fn runnable_len(&self) -> usize {
        self.runnable.borrow().len()
    }
}


fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in next-tick callback".to_string()
    }
}

// ---------------------------------------------------------------------------
// Thread-local "current scheduler" context: a single-OS-thread singleton
// (`RefCell`, no locking needed) since this runtime never runs two tasks
// concurrently.
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
}

pub(crate) fn install(scheduler: Rc<Scheduler>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(scheduler));
}

pub(crate) fn uninstall() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// Run `f` with the thread's current scheduler. Panics if no `Runtime` is
/// active on this thread.
pub fn with_current<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
    CURRENT.with(|c| {
        let borrow = c.borrow();
        let sched = borrow.as_ref().expect("no wisp runtime active on this thread");
        f(sched)
    })
}
