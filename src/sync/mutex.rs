//! A non-reentrant, sticky-ownership advisory lock between tasks on one
//! thread -- the same FIFO-waiter shape as `Channel`, minus a payload.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::WispError;
use crate::scheduler::with_current;
use crate::task::{current, suspend, TaskId, Value};

struct Inner {
    owner: Option<TaskId>,
    waiters: VecDeque<TaskId>,
}

/// Serializes a logical critical section between cooperative tasks.
/// Re-entry by the current owner is a no-op, not a recursive lock: a
/// single `unlock()` releases regardless of how many times `lock()` was
/// called by the owner.
pub struct Mutex {
    inner: Rc<RefCell<Inner>>,
}

impl Clone for Mutex {
    fn clone(&self) -> Self {
        Mutex { inner: self.inner.clone() }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Mutex {
            inner: Rc::new(RefCell::new(Inner {
                owner: None,
                waiters: VecDeque::new(),
            })),
        }
    }

    pub fn lock(&self) -> Result<(), WispError> {
        let me = current().expect("Mutex::lock called outside a task");
        let must_wait = {
            let mut inner = self.inner.borrow_mut();
            match inner.owner {
                None => {
                    inner.owner = Some(me);
                    false
                }
                Some(owner) if owner == me => false,
                Some(_) => {
                    inner.waiters.push_back(me);
                    true
                }
            }
        };
        if must_wait {
            // Resumed by `unlock()` handing ownership to us directly.
            suspend(Value::unit())?;
        }
        Ok(())
    }

    /// True if already owned by the current task, or if it was free (and
    /// is now owned by the current task).
    pub fn try_lock(&self) -> bool {
        let me = match current() {
            Some(id) => id,
            None => return false,
        };
        let mut inner = self.inner.borrow_mut();
        match inner.owner {
            None => {
                inner.owner = Some(me);
                true
            }
            Some(owner) => owner == me,
        }
    }

    /// Owner-only. Hands ownership to the head waiter, if any, and
    /// resumes it directly (it then observes itself as owner inside its
    /// own `lock()` frame).
    pub fn unlock(&self) -> Result<(), WispError> {
        let me = current().expect("Mutex::unlock called outside a task");
        let next = {
            let mut inner = self.inner.borrow_mut();
            match inner.owner {
                Some(owner) if owner == me => {}
                _ => {
                    return Err(WispError::new(
                        crate::error::ErrorKind::MutexMisuse,
                        "unlock() called by a task that does not own the mutex",
                    ))
                }
            }
            let next = inner.waiters.pop_front();
            inner.owner = next;
            next
        };
        if let Some(next) = next {
            with_current(|s| {
                s.resume(next, Value::unit());
            });
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.borrow().owner.is_some()
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
    fn test_waiters_wake_in_fifo_order() {
        with_scheduler(|sched| {
            let m = Mutex::new();
            let log = StdRc::new(StdRefCell::new(Vec::new()));
            let mut ids = Vec::new();

            for i in 0..3 {
                let m2 = m.clone();
                let log2 = log.clone();
                let id = sched.go(
                    move || {
                        m2.lock().unwrap();
                        log2.borrow_mut().push(i);
                        crate::task::suspend(crate::task::Value::unit()).unwrap();
                        m2.unlock().unwrap();
                        Ok(crate::task::Value::unit())
                    },
                    true,
                );
                ids.push(id);
            }

            // The first task takes the lock, logs itself, then suspends
            // inside its own body; the other two queue as waiters in
            // submission order and haven't run their bodies at all yet.
            assert_eq!(*log.borrow(), vec![0]);

            // Resume task 0 so it can unlock and hand off to task 1, whose
            // own body then suspends in turn, and so on down the chain.
            for id in ids {
                sched.resume(id, crate::task::Value::unit());
            }
            sched.run_to_completion().unwrap();
            assert_eq!(*log.borrow(), vec![0, 1, 2]);
        });
    }

    #[test]
    fn test_try_lock_succeeds_when_free() {
        with_scheduler(|sched| {
            let m = Mutex::new();
            let result = StdRc::new(StdRefCell::new(false));
            let m2 = m.clone();
            let r2 = result.clone();
            sched.go(
                move || {
                    *r2.borrow_mut() = m2.try_lock();
                    Ok(crate::task::Value::unit())
                },
                true,
            );
            sched.run_to_completion().unwrap();
            assert!(*result.borrow());
        });
    }

    #[test]
    fn test_unlock_by_non_owner_fails() {
        with_scheduler(|sched| {
            let m = Mutex::new();
            let err = StdRc::new(StdRefCell::new(false));
            let m2 = m.clone();
            let e2 = err.clone();
            sched.go(
                move || {
                    // Never locked by this task; unlock must fail.
                    *e2.borrow_mut() = m2.unlock().is_err();
                    Ok(crate::task::Value::unit())
                },
                true,
            );
            sched.run_to_completion().unwrap();
            assert!(*err.borrow());
        });
    }
}
