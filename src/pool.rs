//! A fixed-size cache of idle worker tasks blocking on a user-supplied
//! process function. Pre-spawns `n` tasks that each loop on
//! `channel.receive()`; `submit` hands an item to whichever pooled task is
//! next to receive via the channel's own rendezvous semantics (capacity
//! 0) -- no separate queueing logic needed.

use crate::error::WispError;
use crate::scheduler::with_current;
use crate::sync::Channel;
use crate::task::Value;

/// A pool of `n` worker tasks, each repeatedly calling `process` on items
/// submitted through [`TaskPool::submit`].
pub struct TaskPool<T: 'static> {
    jobs: Channel<T>,
}

impl<T: 'static> TaskPool<T> {
    /// Spawns `n` worker tasks immediately. Each calls `process(item)` for
    /// every item it receives, forever, until the runtime shuts down.
    pub fn new<F>(n: usize, process: F) -> Self
    where
        F: Fn(T) + Clone + 'static,
    {
        let jobs: Channel<T> = Channel::new(0);
        for _ in 0..n {
            let worker_jobs = jobs.clone();
            let worker_process = process.clone();
            with_current(|sched| {
                sched.go(
                    move || {
                        while let Some(item) = worker_jobs.receive() {
                            worker_process(item);
                        }
                        Ok(Value::unit())
                    },
                    true,
                );
            });
        }
        TaskPool { jobs }
    }

    /// Hands `item` off to whichever pooled task is next to receive.
    /// Suspends the caller if every worker is currently busy -- exactly
    /// the capacity-0 channel contract, no separate queue depth to manage.
    pub fn submit(&self, item: T) -> Result<(), WispError> {
        self.jobs.send(item)
    }

    /// Non-suspending variant; returns the item back if every worker is
    /// busy right now.
    pub fn try_submit(&self, item: T) -> Result<(), crate::sync::TrySendError<T>> {
        self.jobs.try_send(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::reactor::PollReactor;
    use crate::scheduler::{install, uninstall, Scheduler};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn with_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
        let sched = Rc::new(Scheduler::new(Config::default(), Box::new(PollReactor::new().unwrap())));
        install(sched);
        let r = with_current(f);
        uninstall();
        r
    }

    #[test]
    fn test_pool_processes_submitted_items() {
        with_scheduler(|sched| {
            let results = Rc::new(RefCell::new(Vec::new()));
            let r2 = results.clone();
            let pool: TaskPool<i32> = TaskPool::new(2, move |item| {
                r2.borrow_mut().push(item);
            });

            for i in 0..4 {
                let jobs = pool.jobs.clone();
                sched.go(
                    move || {
                        jobs.send(i).unwrap();
                        Ok(Value::unit())
                    },
                    true,
                );
            }

            sched.run_to_completion().unwrap();
            let mut got = results.borrow().clone();
            got.sort();
            assert_eq!(got, vec![0, 1, 2, 3]);
        });
    }
}
