//! `wisp` -- a single-threaded cooperative concurrency runtime: a
//! user-space task scheduler, a reactor-style I/O event loop, and the
//! synchronization primitives built on top of them.
//!
//! ## Modules
//!
//! - [`task`]: suspendable tasks and the state machine they drive.
//! - [`scheduler`]: the tick-driven driver loop, owning tasks + reactor.
//! - [`reactor`]: readiness-based I/O multiplexing, signals, timers.
//! - [`sync`]: channel, mutex, waitgroup.
//! - [`time`]: `sleep`, one-shot `Timer`, periodic `Ticker`.
//! - [`ring`]: the power-of-two byte ring backing [`stream`].
//! - [`stream`]: a buffered, non-blocking byte stream over the reactor.
//! - [`process`]: `fork` / `wait` / `forked`, subordinate to the scheduler.
//! - [`pool`]: a fixed-size cache of idle worker tasks.
//! - [`config`]: environment-variable configuration, read once at init.
//! - [`debug`]: per-task trace rings and the unresolved-error sink.
//! - [`error`]: the runtime's single error type and its kinds.
//!
//! `Runtime` is the façade that owns the scheduler + reactor singletons
//! for one OS thread and exposes the entry points: `go` (here,
//! [`Runtime::spawn`]), `current`, `sleep`, `defer`, `suspend`, and `wait`
//! (here, [`Runtime::block_on`] / [`Runtime::run_to_completion`]).

pub mod config;
pub mod debug;
pub mod error;
pub mod pool;
pub mod process;
pub mod reactor;
pub mod ring;
pub mod scheduler;
pub mod stream;
pub mod sync;
pub mod task;
pub mod time;

pub use config::Config;
pub use error::{ErrorKind, Result, WispError};
pub use task::{current, defer, suspend, TaskId, Value};
pub use time::sleep;

use std::cell::RefCell;
use std::rc::Rc;

use config::ReactorBackend;
use debug::ErrorSink;
use reactor::{PollReactor, Reactor};
use scheduler::Scheduler;

/// Owns the scheduler + reactor singletons for one OS thread, and installs
/// them as the thread's "current runtime" for the duration of its own
/// lifetime (library code anywhere on the thread reaches them through
/// [`scheduler::with_current`] rather than an explicit handle).
pub struct Runtime {
    scheduler: Rc<Scheduler>,
}

impl Runtime {
    /// Build a runtime from `Config::from_env()`.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::from_env()?)
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Self::build(config, Box::new(debug::StderrSink))
    }

    /// Like [`Runtime::with_config`], but redirects unresolved-error
    /// reports to a caller-supplied sink (e.g. a buffer, for tests).
    pub fn with_config_and_sink(config: Config, sink: Box<dyn ErrorSink>) -> Result<Self> {
        Self::build(config, sink)
    }

    fn build(config: Config, sink: Box<dyn ErrorSink>) -> Result<Self> {
        let reactor: Box<dyn Reactor> = match config.reactor_backend {
            ReactorBackend::Poll => Box::new(PollReactor::new()?),
        };
        let scheduler = Rc::new(Scheduler::new(config, reactor).with_error_sink(sink));
        scheduler::install(scheduler.clone());
        Ok(Runtime { scheduler })
    }

    /// Spawn a task bound to `entry`, appended to the runnable queue
    /// (started on the next drain, not synchronously).
    pub fn spawn<F>(&self, entry: F) -> TaskId
    where
        F: FnOnce() -> Result<Value> + 'static,
    {
        self.scheduler.go(entry, false)
    }

    /// Run the driver loop until no work remains.
    pub fn run_to_completion(&self) -> Result<()> {
        self.scheduler.run_to_completion()
    }

    /// Spawn `entry` and drive the runtime to completion, returning
    /// whatever `entry` itself returned (or its escaped error).
    pub fn block_on<F>(&self, entry: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value> + 'static,
    {
        let outcome: Rc<RefCell<Option<Result<Value>>>> = Rc::new(RefCell::new(None));
        let outcome2 = outcome.clone();
        self.scheduler.go(
            move || {
                let r = entry();
                let for_task = match &r {
                    Ok(_) => Ok(Value::unit()),
                    Err(e) => Err(e.clone()),
                };
                *outcome2.borrow_mut() = Some(r);
                for_task
            },
            false,
        );
        self.run_to_completion()?;
        outcome
            .borrow_mut()
            .take()
            .unwrap_or_else(|| Err(WispError::new(ErrorKind::Argument, "block_on task never completed")))
    }

    pub fn config(&self) -> &Config {
        self.scheduler.config()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.scheduler.reactor().borrow_mut().stop();
        scheduler::uninstall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_on_returns_task_value() {
        let rt = Runtime::with_config(Config::default()).unwrap();
        let v = rt.block_on(|| Ok(Value::new(7i32))).unwrap();
        assert_eq!(*v.downcast::<i32>().unwrap(), 7);
    }

    #[test]
    fn test_block_on_propagates_error() {
        let rt = Runtime::with_config(Config::default()).unwrap();
        let err = rt.block_on(|| Err(WispError::terminate())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Terminate);
    }

    #[test]
    fn test_spawn_runs_alongside_block_on_task() {
        let rt = Runtime::with_config(Config::default()).unwrap();
        let log: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        rt.spawn(move || {
            log2.borrow_mut().push(1);
            Ok(Value::unit())
        });
        let log3 = log.clone();
        rt.block_on(move || {
            log3.borrow_mut().push(2);
            Ok(Value::unit())
        })
        .unwrap();
        let mut got = log.borrow().clone();
        got.sort();
        assert_eq!(got, vec![1, 2]);
    }
}
