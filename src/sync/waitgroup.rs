//! A counter that parks waiters until it reaches zero -- the same
//! FIFO-waiter shape as [`super::mutex::Mutex`], minus ownership.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{ErrorKind, WispError};
use crate::scheduler::with_current;
use crate::task::{current, suspend, TaskId, Value};

struct Inner {
    count: i64,
    waiters: VecDeque<TaskId>,
}

/// Mirrors a Go-style `sync.WaitGroup`: `add(n)` bumps the counter,
/// `done()` decrements it, `wait()` suspends until it reaches zero.
pub struct WaitGroup {
    inner: Rc<RefCell<Inner>>,
}

impl Clone for WaitGroup {
    fn clone(&self) -> Self {
        WaitGroup { inner: self.inner.clone() }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        WaitGroup {
            inner: Rc::new(RefCell::new(Inner {
                count: 0,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// `n` must be non-negative; a negative delta is an argument error --
    /// `add` only grows the count, `done()` is the sole way down.
    pub fn add(&self, n: i64) -> Result<(), WispError> {
        if n < 0 {
            return Err(WispError::new(
                ErrorKind::Argument,
                "WaitGroup::add called with a negative delta",
            ));
        }
        self.inner.borrow_mut().count += n;
        Ok(())
    }

    /// The counter must be greater than zero; decrements it by one and,
    /// if it reaches zero, wakes every current waiter.
    pub fn done(&self) -> Result<(), WispError> {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            if inner.count <= 0 {
                return Err(WispError::new(
                    ErrorKind::MutexMisuse,
                    "WaitGroup::done called with counter already at zero",
                ));
            }
            inner.count -= 1;
            if inner.count == 0 {
                std::mem::take(&mut inner.waiters)
            } else {
                VecDeque::new()
            }
        };
        if !waiters.is_empty() {
            with_current(|s| {
                for w in waiters {
                    s.resume(w, Value::unit());
                }
            });
        }
        Ok(())
    }

    /// Returns immediately if the counter is already zero; otherwise
    /// enqueues the current task and suspends.
    pub fn wait(&self) -> Result<(), WispError> {
        let must_wait = {
            let mut inner = self.inner.borrow_mut();
            if inner.count == 0 {
                false
            } else {
                let me = current().expect("WaitGroup::wait called outside a task");
                inner.waiters.push_back(me);
                true
            }
        };
        if must_wait {
            suspend(Value::unit())?;
        }
        Ok(())
    }

    pub fn count(&self) -> i64 {
        self.inner.borrow().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::reactor::PollReactor;
    use crate::scheduler::{install, uninstall, Scheduler};
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn with_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
        let sched = StdRc::new(Scheduler::new(Config::default(), Box::new(PollReactor::new().unwrap())));
        install(sched);
        let r = with_current(f);
        uninstall();
        r
    }

    #[test]
    fn test_wait_returns_immediately_at_zero() {
        with_scheduler(|sched| {
            let wg = WaitGroup::new();
            let done = StdRc::new(StdRefCell::new(false));
            let wg2 = wg.clone();
            let d2 = done.clone();
            sched.go(
                move || {
                    wg2.wait().unwrap();
                    *d2.borrow_mut() = true;
                    Ok(Value::unit())
                },
                true,
            );
            assert!(*done.borrow());
        });
    }

    #[test]
    fn test_waiters_wake_when_counter_hits_zero() {
        with_scheduler(|sched| {
            let wg = WaitGroup::new();
            wg.add(2).unwrap();
            let done = StdRc::new(StdRefCell::new(false));

            let wg2 = wg.clone();
            let d2 = done.clone();
            sched.go(
                move || {
                    wg2.wait().unwrap();
                    *d2.borrow_mut() = true;
                    Ok(Value::unit())
                },
                true,
            );
            assert!(!*done.borrow());

            let wg3 = wg.clone();
            sched.go(
                move || {
                    wg3.done().unwrap();
                    Ok(Value::unit())
                },
                true,
            );
            assert!(!*done.borrow());

            let wg4 = wg.clone();
            sched.go(
                move || {
                    wg4.done().unwrap();
                    Ok(Value::unit())
                },
                true,
            );
            sched.run_to_completion().unwrap();
            assert!(*done.borrow());
        });
    }

    #[test]
    fn test_done_without_add_fails() {
        with_scheduler(|sched| {
            let wg = WaitGroup::new();
            let err = StdRc::new(StdRefCell::new(false));
            let e2 = err.clone();
            sched.go(
                move || {
                    *e2.borrow_mut() = wg.done().is_err();
                    Ok(Value::unit())
                },
                true,
            );
            assert!(*err.borrow());
        });
    }

    #[test]
    fn test_negative_add_rejected() {
        let wg = WaitGroup::new();
        assert_eq!(wg.add(-1).unwrap_err().kind, ErrorKind::Argument);
    }
}
