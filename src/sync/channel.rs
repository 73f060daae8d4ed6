//! A single-threaded, coroutine-aware channel.
//!
//! `TrySendError`/`TryRecvError` follow the naming idiom `crossbeam_channel`
//! uses, but the transport itself is a plain `VecDeque` guarded by
//! `RefCell`, not a lock-free cross-thread queue -- there is only ever
//! one task running at a time on this thread, and `send`/`receive`
//! suspend the task directly through the scheduler instead of blocking
//! an OS thread.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::WispError;
use crate::scheduler::with_current;
use crate::task::{current, suspend, TaskId, Value};

/// Mirrors `crossbeam_channel::TrySendError`: gives the value back to the
/// caller instead of dropping it.
#[derive(Debug)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

/// Mirrors `crossbeam_channel::TryRecvError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

struct Inner<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    waiting_senders: VecDeque<(TaskId, T)>,
    waiting_receivers: VecDeque<TaskId>,
    closed: bool,
}

/// A FIFO channel of capacity `N`. `N == 0` is a rendezvous channel: every
/// `send` blocks until a `receive` is ready to take the value directly.
pub struct Channel<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel { inner: self.inner.clone() }
    }
}

enum SendPlan<T> {
    Deliver(TaskId, T),
    Buffered,
    MustWait(T),
}

impl<T: 'static> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        Channel {
            inner: Rc::new(RefCell::new(Inner {
                capacity,
                buffer: VecDeque::new(),
                waiting_senders: VecDeque::new(),
                waiting_receivers: VecDeque::new(),
                closed: false,
            })),
        }
    }

    fn plan_send(inner: &mut Inner<T>, value: T) -> Result<SendPlan<T>, WispError> {
        if inner.closed {
            return Err(WispError::channel_closed());
        }
        if let Some(receiver) = inner.waiting_receivers.pop_front() {
            return Ok(SendPlan::Deliver(receiver, value));
        }
        if inner.buffer.len() < inner.capacity {
            inner.buffer.push_back(value);
            return Ok(SendPlan::Buffered);
        }
        Ok(SendPlan::MustWait(value))
    }

    /// Suspends the current task if the channel is unbuffered or full.
    pub fn send(&self, value: T) -> Result<(), WispError> {
        let plan = {
            let mut inner = self.inner.borrow_mut();
            Self::plan_send(&mut inner, value)?
        };
        match plan {
            SendPlan::Deliver(receiver, v) => {
                with_current(|s| {
                    s.resume(receiver, Value::new(v));
                });
                Ok(())
            }
            SendPlan::Buffered => Ok(()),
            SendPlan::MustWait(v) => {
                let me = current().expect("Channel::send called outside a task");
                self.inner.borrow_mut().waiting_senders.push_back((me, v));
                // Woken either because a receiver claimed our value (unit)
                // or because `close()` threw a closed-channel exception.
                suspend(Value::unit())?;
                Ok(())
            }
        }
    }

    /// Non-suspending. Returns the value back to the caller if it would
    /// have blocked.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(TrySendError::Closed(value));
        }
        if let Some(receiver) = inner.waiting_receivers.pop_front() {
            drop(inner);
            with_current(|s| {
                s.resume(receiver, Value::new(value));
            });
            return Ok(());
        }
        if inner.buffer.len() < inner.capacity {
            inner.buffer.push_back(value);
            return Ok(());
        }
        Err(TrySendError::Full(value))
    }

    /// Suspends the current task if the channel is empty. Returns `None`
    /// once the channel is closed and drained.
    pub fn receive(&self) -> Option<T> {
        loop {
            let mut inner = self.inner.borrow_mut();
            if let Some(v) = inner.buffer.pop_front() {
                let woken = inner.waiting_senders.pop_front();
                if let Some((sender, sval)) = woken {
                    inner.buffer.push_back(sval);
                    drop(inner);
                    with_current(|s| {
                        s.resume(sender, Value::unit());
                    });
                }
                return Some(v);
            }
            if let Some((sender, sval)) = inner.waiting_senders.pop_front() {
                drop(inner);
                with_current(|s| {
                    s.resume(sender, Value::unit());
                });
                return Some(sval);
            }
            if inner.closed {
                return None;
            }
            let me = current().expect("Channel::receive called outside a task");
            inner.waiting_receivers.push_back(me);
            drop(inner);
            match suspend(Value::unit()) {
                Ok(v) if v.is::<()>() => continue, // woken by close(); loop sees closed+empty
                Ok(v) => return Some(*v.downcast::<T>().unwrap_or_else(|_| panic!("channel resume value type mismatch"))),
                Err(_) => return None,
            }
        }
    }

    pub fn try_receive(&self) -> Result<T, TryRecvError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(v) = inner.buffer.pop_front() {
            let woken = inner.waiting_senders.pop_front();
            if let Some((sender, sval)) = woken {
                inner.buffer.push_back(sval);
                drop(inner);
                with_current(|s| {
                    s.resume(sender, Value::unit());
                });
            }
            return Ok(v);
        }
        if let Some((sender, sval)) = inner.waiting_senders.pop_front() {
            drop(inner);
            with_current(|s| {
                s.resume(sender, Value::unit());
            });
            return Ok(sval);
        }
        if inner.closed {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Idempotent. Wakes every waiting receiver with the closed/empty
    /// sentinel and fails every waiting sender with a closed-channel error.
    pub fn close(&self) {
        let (receivers, senders) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (
                std::mem::take(&mut inner.waiting_receivers),
                std::mem::take(&mut inner.waiting_senders),
            )
        };
        with_current(|s| {
            for r in receivers {
                s.resume(r, Value::unit());
            }
            for (id, _) in senders {
                s.throw(id, WispError::channel_closed());
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::config::Config;
    use crate::reactor::PollReactor;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn with_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
        let sched = StdRc::new(Scheduler::new(Config::default(), Box::new(PollReactor::new().unwrap())));
        crate::scheduler::install(sched.clone());
        let r = with_current(f);
        crate::scheduler::uninstall();
        r
    }

    #[test]
    fn test_buffered_send_then_receive() {
        with_scheduler(|sched| {
            let ch: Channel<i32> = Channel::new(3);
            let log = StdRc::new(StdRefCell::new(Vec::new()));

            let ch2 = ch.clone();
            sched.go(
                move || {
                    for v in 0..5 {
                        ch2.send(v).unwrap();
                    }
                    Ok(Value::unit())
                },
                true,
            );

            let ch3 = ch.clone();
            let log2 = log.clone();
            sched.go(
                move || {
                    for _ in 0..5 {
                        if let Some(v) = ch3.receive() {
                            log2.borrow_mut().push(v);
                        }
                    }
                    Ok(Value::unit())
                },
                true,
            );

            sched.run_to_completion().unwrap();
            assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
        });
    }

    #[test]
    fn test_rendezvous_channel_hands_off_directly() {
        with_scheduler(|sched| {
            let ch: Channel<&'static str> = Channel::new(0);
            let got = StdRc::new(StdRefCell::new(None));

            let ch2 = ch.clone();
            sched.go(move || {
                ch2.send("hi").unwrap();
                Ok(Value::unit())
            }, true);

            let ch3 = ch.clone();
            let got2 = got.clone();
            sched.go(move || {
                *got2.borrow_mut() = ch3.receive();
                Ok(Value::unit())
            }, true);

            sched.run_to_completion().unwrap();
            assert_eq!(*got.borrow(), Some("hi"));
        });
    }

    #[test]
    fn test_close_wakes_waiting_receiver_with_none() {
        with_scheduler(|sched| {
            let ch: Channel<i32> = Channel::new(0);
            let got = StdRc::new(StdRefCell::new(Some(99)));

            let ch2 = ch.clone();
            let got2 = got.clone();
            sched.go(move || {
                *got2.borrow_mut() = ch2.receive();
                Ok(Value::unit())
            }, true);

            ch.close();
            sched.run_to_completion().unwrap();
            assert_eq!(*got.borrow(), None);
        });
    }

    #[test]
    fn test_try_send_full_returns_value() {
        with_scheduler(|_sched| {
            let ch: Channel<i32> = Channel::new(1);
            ch.try_send(1).unwrap();
            match ch.try_send(2) {
                Err(TrySendError::Full(v)) => assert_eq!(v, 2),
                _ => panic!("expected Full"),
            }
        });
    }

    #[test]
    fn test_try_receive_empty() {
        with_scheduler(|_sched| {
            let ch: Channel<i32> = Channel::new(1);
            assert_eq!(ch.try_receive(), Err(TryRecvError::Empty));
        });
    }
}
