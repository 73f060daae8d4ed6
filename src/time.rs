//! `sleep`, one-shot [`Timer`], periodic [`Ticker`], and `after_func` --
//! all thin wrappers over `Reactor::timer` that suspend the calling task
//! (or, for `after_func`, invoke a plain callback from the reactor's own
//! tick) rather than blocking an OS thread.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::error::WispError;
use crate::reactor::TimerId;
use crate::scheduler::with_current;
use crate::sync::Channel;
use crate::task::{current, suspend, Value};

/// Suspend the current task for `dur`, then resume it.
pub fn sleep(dur: Duration) -> Result<(), WispError> {
    let me = current().expect("sleep() called outside a task");
    with_current(|sched| {
        sched.reactor().borrow_mut().timer(
            dur,
            None,
            Box::new(move || {
                with_current(|s| {
                    s.resume(me, Value::unit());
                });
            }),
        );
    });
    suspend(Value::unit())?;
    Ok(())
}

/// Arm a callback that fires once after `dur`, invoked directly from the
/// reactor's own tick (not inside a task). Returns a handle whose
/// `stop()` cancels it (idempotent).
pub fn after_func(dur: Duration, f: impl FnMut() + 'static) -> Timer {
    let id = with_current(|sched| sched.reactor().borrow_mut().timer(dur, None, Box::new(f)));
    Timer {
        id: Rc::new(Cell::new(Some(id))),
    }
}

/// A one-shot timer exposed as a value: `stop()` is idempotent, `reset()`
/// re-arms it. [`Timer::new`] additionally delivers the firing time on an
/// unbuffered channel exactly once, mirroring the source's `Timer` type.
#[derive(Clone)]
pub struct Timer {
    id: Rc<Cell<Option<TimerId>>>,
}

impl Timer {
    /// Arms a timer that, on firing, sends `()` on an unbuffered channel
    /// exactly once. The channel is returned so callers can `receive()` it
    /// from any task (not necessarily the one that created the timer).
    pub fn new(after: Duration) -> (Self, Channel<()>) {
        let chan: Channel<()> = Channel::new(0);
        let delivery = chan.clone();
        let timer_id = with_current(|sched| {
            sched.reactor().borrow_mut().timer(
                after,
                None,
                Box::new(move || {
                    // Fire-and-forget: if nobody is receiving, `try_send`
                    // simply drops the tick rather than suspending the
                    // reactor's own callback thread.
                    let _ = delivery.try_send(());
                }),
            )
        });
        (
            Timer {
                id: Rc::new(Cell::new(Some(timer_id))),
            },
            chan,
        )
    }

    /// Idempotent: cancelling an already-stopped (or already-fired)
    /// timer is a no-op.
    pub fn stop(&self) {
        if let Some(id) = self.id.take() {
            with_current(|sched| sched.reactor().borrow_mut().cancel_timer(id));
        }
    }

    /// Cancel any still-armed registration and re-arm with a fresh delay.
    pub fn reset(&self, after: Duration, mut on_fire: impl FnMut() + 'static) {
        self.stop();
        let new_id = with_current(|sched| sched.reactor().borrow_mut().timer(after, None, Box::new(move || on_fire())));
        self.id.set(Some(new_id));
    }
}

/// A periodic timer that delivers ticks on an *unbuffered* channel; a
/// tick with no waiting receiver is dropped silently -- a `Ticker` is not
/// a reliable queue, and callers should dedicate one task per ticker to
/// drain it promptly.
pub struct Ticker {
    id: Rc<Cell<Option<TimerId>>>,
    chan: Channel<()>,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        let chan: Channel<()> = Channel::new(0);
        let delivery = chan.clone();
        let id = with_current(|sched| {
            sched.reactor().borrow_mut().timer(
                Duration::ZERO,
                Some(period),
                Box::new(move || {
                    let _ = delivery.try_send(());
                }),
            )
        });
        Ticker {
            id: Rc::new(Cell::new(Some(id))),
            chan,
        }
    }

    pub fn channel(&self) -> Channel<()> {
        self.chan.clone()
    }

    pub fn stop(&self) {
        if let Some(id) = self.id.take() {
            with_current(|sched| sched.reactor().borrow_mut().cancel_timer(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::reactor::PollReactor;
    use crate::scheduler::{install, uninstall, Scheduler};
    use std::cell::RefCell;
    use std::rc::Rc as StdRc;

    fn with_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
        let sched = StdRc::new(Scheduler::new(Config::default(), Box::new(PollReactor::new().unwrap())));
        install(sched);
        let r = with_current(f);
        uninstall();
        r
    }

    #[test]
    fn test_sleep_resumes_task() {
        with_scheduler(|sched| {
            let done = StdRc::new(RefCell::new(false));
            let d2 = done.clone();
            sched.go(
                move || {
                    sleep(Duration::from_millis(1))?;
                    *d2.borrow_mut() = true;
                    Ok(Value::unit())
                },
                true,
            );
            sched.run_to_completion().unwrap();
            assert!(*done.borrow());
        });
    }

    #[test]
    fn test_timer_stop_is_idempotent() {
        with_scheduler(|_sched| {
            let (timer, _chan) = Timer::new(Duration::from_secs(10));
            timer.stop();
            timer.stop(); // second call must not panic
        });
    }

    #[test]
    fn test_ticker_delivers_on_channel() {
        with_scheduler(|sched| {
            let ticker = Ticker::new(Duration::from_millis(1));
            let chan = ticker.channel();
            let got = StdRc::new(RefCell::new(0));
            let g2 = got.clone();
            sched.go(
                move || {
                    for _ in 0..3 {
                        if chan.receive().is_some() {
                            *g2.borrow_mut() += 1;
                        }
                    }
                    Ok(Value::unit())
                },
                true,
            );
            for _ in 0..10 {
                std::thread::sleep(Duration::from_millis(2));
                sched.step().unwrap();
                if *got.borrow() >= 3 {
                    break;
                }
            }
            ticker.stop();
            assert!(*got.borrow() >= 3);
        });
    }
}
