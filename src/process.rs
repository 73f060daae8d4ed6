//! Process supervisor: `fork`, `wait(pid)`, `forked(hook)`, backed by a
//! lazily-installed SIGCHLD watcher on the reactor. Unix-only, and
//! subordinate to the scheduler rather than a general process-management
//! facility.

use std::cell::RefCell;
use std::rc::Rc;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork as nix_fork, ForkResult, Pid};
use rustc_hash::FxHashMap;

use crate::error::{ErrorKind, WispError};
use crate::reactor::ReadyCallback;
use crate::scheduler::with_current;
use crate::task::{current, suspend, TaskId, Value};

type PostForkHook = Rc<dyn Fn()>;

#[derive(Default)]
struct Supervisor {
    /// pid -> tasks waiting on it.
    pending: FxHashMap<i32, Vec<TaskId>>,
    /// pid -> exit code cached because it exited before anyone called
    /// `wait` on it (positive for normal exit, negative for signal).
    exited: FxHashMap<i32, i32>,
    hooks: Vec<PostForkHook>,
    watcher_installed: bool,
}

thread_local! {
    static SUPERVISOR: RefCell<Supervisor> = RefCell::new(Supervisor::default());
}

/// Register a hook that runs in the child immediately after `fork`,
/// before user code. Hooks run in registration order.
pub fn forked(hook: impl Fn() + 'static) {
    SUPERVISOR.with(|s| s.borrow_mut().hooks.push(Rc::new(hook)));
}

/// Spawn a child process running `f`. Called from inside a task, the fork
/// itself is deferred to the next scheduler tick (a safe point with no
/// coroutine mid-suspend); the caller suspends and is resumed with the
/// child pid once it has happened. Called outside any task (e.g. directly
/// from `main`), it forks immediately.
pub fn fork(f: impl FnOnce() + 'static) -> Result<i32, WispError> {
    match current() {
        Some(task_id) => {
            with_current(|sched| {
                sched.next_tick(Box::new(move || match do_fork(f) {
                    Ok(pid) => with_current(|s| {
                        s.resume(task_id, Value::new(pid));
                    }),
                    Err(e) => with_current(|s| {
                        s.throw(task_id, e);
                    }),
                }));
            });
            let v = suspend(Value::unit())?;
            Ok(*v.downcast::<i32>().unwrap_or_else(|_| panic!("fork resume value type mismatch")))
        }
        None => do_fork(f),
    }
}

fn do_fork(f: impl FnOnce()) -> Result<i32, WispError> {
    // Safety: this process is single-threaded at the OS level (the whole
    // point of this runtime); forking a single-threaded process is safe.
    match unsafe { nix_fork() }.map_err(|e| WispError::new(ErrorKind::Argument, format!("fork failed: {e}")))? {
        ForkResult::Parent { child } => Ok(child.as_raw()),
        ForkResult::Child => {
            with_current(|sched| {
                sched.on_fork();
                sched.reactor().borrow_mut().on_fork();
            });
            let hooks = SUPERVISOR.with(|s| {
                let mut sup = s.borrow_mut();
                sup.pending.clear();
                sup.exited.clear();
                sup.watcher_installed = false;
                sup.hooks.clone()
            });
            for hook in hooks {
                hook();
            }
            f();
            with_current(|sched| {
                let _ = sched.run_to_completion();
            });
            std::process::exit(0);
        }
    }
}

fn ensure_sigchld_watcher() {
    let already = SUPERVISOR.with(|s| s.borrow().watcher_installed);
    if already {
        return;
    }
    SUPERVISOR.with(|s| s.borrow_mut().watcher_installed = true);
    let cb: ReadyCallback = Box::new(reap_children);
    with_current(|sched| {
        // SIGCHLD is unix-only, matching `Reactor::watch_signal`'s
        // `cfg(unix)` implementation.
        let _ = sched.reactor().borrow_mut().watch_signal(Signal::SIGCHLD as i32, cb);
    });
}

fn maybe_teardown_watcher() {
    let empty = SUPERVISOR.with(|s| s.borrow().pending.values().all(|v| v.is_empty()));
    if empty {
        SUPERVISOR.with(|s| s.borrow_mut().watcher_installed = false);
        with_current(|sched| {
            sched.reactor().borrow_mut().unwatch_signal(Signal::SIGCHLD as i32);
        });
    }
}

/// Reap every exited/signaled child currently reapable without blocking,
/// dispatching the exit code to waiting subscribers or caching it.
fn reap_children() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => dispatch_exit(pid.as_raw(), code),
            Ok(WaitStatus::Signaled(pid, sig, _)) => dispatch_exit(pid.as_raw(), -(sig as i32)),
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(_) => continue,
        }
    }
    maybe_teardown_watcher();
}

fn dispatch_exit(pid: i32, code: i32) {
    let waiters = SUPERVISOR.with(|s| s.borrow_mut().pending.remove(&pid));
    match waiters {
        Some(tasks) if !tasks.is_empty() => {
            with_current(|sched| {
                for t in tasks {
                    sched.resume(t, Value::new(code));
                }
            });
        }
        _ => {
            SUPERVISOR.with(|s| {
                s.borrow_mut().exited.insert(pid, code);
            });
        }
    }
}

/// Suspend the current task until `pid` exits, returning its exit code
/// (positive for a normal exit, negative for a terminating signal).
/// Lazily installs the SIGCHLD watcher on first call; tears it down once
/// no subscribers remain.
pub fn wait(pid: i32) -> Result<i32, WispError> {
    if let Some(code) = SUPERVISOR.with(|s| s.borrow_mut().exited.remove(&pid)) {
        return Ok(code);
    }
    ensure_sigchld_watcher();
    // A non-blocking reap right after installing the watcher catches a
    // child that had already exited before we subscribed (no SIGCHLD left
    // to deliver once it has already been reaped by someone else, but the
    // common case is this is the first and only waiter).
    reap_children();
    if let Some(code) = SUPERVISOR.with(|s| s.borrow_mut().exited.remove(&pid)) {
        maybe_teardown_watcher();
        return Ok(code);
    }

    let me = current().expect("process::wait called outside a task");
    SUPERVISOR.with(|s| s.borrow_mut().pending.entry(pid).or_default().push(me));
    let v = suspend(Value::unit())?;
    Ok(*v.downcast::<i32>().unwrap_or_else(|_| panic!("wait resume value type mismatch")))
}

/// Deliver `sig` to `pid`.
pub fn signal(pid: i32, sig: i32) -> Result<(), WispError> {
    let signal = Signal::try_from(sig).map_err(|_| WispError::new(ErrorKind::Argument, format!("unknown signal {sig}")))?;
    signal::kill(Pid::from_raw(pid), signal).map_err(|e| WispError::new(ErrorKind::Argument, format!("kill failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::reactor::PollReactor;
    use crate::scheduler::{install, uninstall, Scheduler};
    use std::rc::Rc as StdRc;

    fn with_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
        let sched = StdRc::new(Scheduler::new(Config::default(), Box::new(PollReactor::new().unwrap())));
        install(sched);
        let r = with_current(f);
        uninstall();
        r
    }

    #[test]
    fn test_fork_and_wait_reports_exit_code() {
        with_scheduler(|sched| {
            let got = StdRc::new(RefCell::new(None));
            let g2 = got.clone();
            sched.go(
                move || {
                    let pid = fork(|| std::process::exit(42))?;
                    let code = wait(pid)?;
                    *g2.borrow_mut() = Some(code);
                    Ok(Value::unit())
                },
                true,
            );
            for _ in 0..50 {
                if got.borrow().is_some() {
                    break;
                }
                let _ = sched.step();
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
            assert_eq!(*got.borrow(), Some(42));
        });
    }

    #[test]
    fn test_unknown_signal_rejected() {
        with_scheduler(|_sched| {
            let err = signal(std::process::id() as i32, 9999).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Argument);
        });
    }
}
