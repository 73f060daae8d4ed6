//! The reactor: readiness-based I/O multiplexing, signal watching, and
//! timers, driven once per scheduler tick.
//!
//! A `mio::Poll` plus a binary-heap timer queue, ticked in phases: drain
//! pending requests, run expired timers, poll for I/O, dispatch.

mod timer;

pub use timer::TimerId;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{ErrorKind, WispError};
use crate::task::Value;
use timer::TimerWheel;

/// A callback re-invoked on every readiness notification, until the
/// watcher is explicitly removed.
pub type ReadyCallback = Box<dyn FnMut()>;

/// The reactor's public surface. Modeled as a trait so alternative
/// back-ends (an io_uring or kqueue-specific reactor) could be slotted in
/// later; only the portable `mio`-based `PollReactor` below is actually
/// implemented. Selecting any other `Config::reactor_backend` value
/// fails loudly at construction rather than silently falling back to
/// this one.
pub trait Reactor {
    /// Whether the reactor still has live watchers or pending timers.
    fn is_active(&self) -> bool;

    /// One poll/dispatch pass. `timeout` of `None` lets the reactor block
    /// up to its own nearest timer deadline (or indefinitely with no
    /// timers); `Some(Duration::ZERO)` polls without blocking, used by the
    /// scheduler when other work is already runnable.
    fn tick(&mut self, timeout: Option<Duration>) -> Result<(), WispError>;

    fn watch_read(&mut self, fd: RawFd, callback: ReadyCallback) -> Result<(), WispError>;
    fn watch_write(&mut self, fd: RawFd, callback: ReadyCallback) -> Result<(), WispError>;
    fn unwatch_read(&mut self, fd: RawFd) -> Result<(), WispError>;
    fn unwatch_write(&mut self, fd: RawFd) -> Result<(), WispError>;

    fn watch_signal(&mut self, signal: i32, callback: ReadyCallback) -> Result<(), WispError>;
    fn unwatch_signal(&mut self, signal: i32);

    /// Arm a timer; `repeat` re-arms it on a drift-minimizing schedule
    /// (each deadline computed from the previous deadline, not from
    /// `Instant::now()` at fire time) rather than a one-shot if set.
    fn timer(&mut self, delay: Duration, repeat: Option<Duration>, callback: ReadyCallback) -> TimerId;
    fn cancel_timer(&mut self, id: TimerId);

    /// Drop all watchers inherited from a parent process across `fork()`;
    /// the child's copy of the epoll/kqueue fd is independent of the
    /// parent's registrations and stale entries would otherwise leak.
    fn on_fork(&mut self);

    fn stop(&mut self);
}

/// A watcher registration shared via `Rc<RefCell<_>>` so dispatch can
/// clone the current registration list out, drop its borrow of `self.io`,
/// and then invoke each callback without holding any reactor-internal
/// borrow across the call (a callback may itself register or unregister
/// watchers on the same reactor).
type SharedCallback = Rc<RefCell<ReadyCallback>>;

/// Per-fd+direction watcher registrations. Plural because spec.md:97
/// allows more than one watcher on the same fd+direction, dispatched in
/// insertion order on each readiness notification -- not "last
/// registration wins".
#[derive(Default)]
struct IoEntry {
    read: Vec<SharedCallback>,
    write: Vec<SharedCallback>,
}

impl IoEntry {
    fn interest(&self) -> Option<Interest> {
        match (!self.read.is_empty(), !self.write.is_empty()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// The mandatory, portable reactor back-end: one `mio::Poll` for sockets
/// and pipes, a signal-hook source multiplexed onto the same poll, and a
/// binary-heap-backed timer wheel.
pub struct PollReactor {
    poll: Poll,
    events: Events,
    io: HashMap<RawFd, IoEntry>,
    signals: Option<SignalSource>,
    timers: TimerWheel,
    active: bool,
}

#[cfg(unix)]
struct SignalSource {
    source: signal_hook_mio::v0_8::Signals,
    callbacks: HashMap<i32, SharedCallback>,
}

#[cfg(unix)]
const SIGNAL_TOKEN: Token = Token(usize::MAX);

impl PollReactor {
    pub fn new() -> Result<Self, WispError> {
        let poll = Poll::new().map_err(|e| io_err("failed to create poll instance", e))?;
        Ok(PollReactor {
            poll,
            events: Events::with_capacity(1024),
            io: HashMap::new(),
            signals: None,
            timers: TimerWheel::new(),
            active: true,
        })
    }

    fn reregister(&mut self, fd: RawFd) -> Result<(), WispError> {
        let entry = match self.io.get(&fd) {
            Some(e) => e,
            None => return Ok(()),
        };
        let token = Token(fd as usize);
        let mut source = SourceFd(&fd);
        match entry.interest() {
            Some(interest) => {
                // `register` errors if already registered; try `reregister`
                // first since the common case is adding the write half to
                // an fd already watched for reads, or vice versa.
                if self.poll.registry().reregister(&mut source, token, interest).is_err() {
                    self.poll
                        .registry()
                        .register(&mut source, token, interest)
                        .map_err(|e| io_err("failed to register fd with reactor", e))?;
                }
                Ok(())
            }
            None => {
                let _ = self.poll.registry().deregister(&mut source);
                Ok(())
            }
        }
    }

    #[cfg(unix)]
    fn ensure_signal_source(&mut self) -> Result<(), WispError> {
        if self.signals.is_some() {
            return Ok(());
        }
        let mut source = signal_hook_mio::v0_8::Signals::new([])
            .map_err(|e| io_err("failed to create signal source", e))?;
        self.poll
            .registry()
            .register(&mut source, SIGNAL_TOKEN, Interest::READABLE)
            .map_err(|e| io_err("failed to register signal source", e))?;
        self.signals = Some(SignalSource {
            source,
            callbacks: HashMap::new(),
        });
        Ok(())
    }
}

impl Reactor for PollReactor {
    fn is_active(&self) -> bool {
        self.active
            && (!self.io.is_empty()
                || self.signals.as_ref().is_some_and(|s| !s.callbacks.is_empty())
                || self.timers.is_active())
    }

    fn tick(&mut self, timeout: Option<Duration>) -> Result<(), WispError> {
        let timeout = match timeout {
            Some(d) => Some(d),
            None => self.timers.next_timeout(),
        };

        self.poll
            .poll(&mut self.events, timeout)
            .map_err(|e| io_err("reactor poll failed", e))?;

        for event in self.events.iter() {
            let token = event.token();
            #[cfg(unix)]
            if token == SIGNAL_TOKEN {
                if let Some(signals) = &mut self.signals {
                    let pending: Vec<i32> = signals.source.pending().collect();
                    for sig in pending {
                        if let Some(cb) = signals.callbacks.get(&sig).cloned() {
                            // Each delivered signal runs its watcher inside
                            // its own go-scheduled task, so a slow handler
                            // can't delay draining the rest of this tick's
                            // signals (or the I/O dispatch below).
                            dispatch_in_task(cb);
                        }
                    }
                }
                continue;
            }
            let fd = token.0 as RawFd;
            if event.is_readable() {
                let cbs = self.io.get(&fd).map(|e| e.read.clone()).unwrap_or_default();
                for cb in cbs {
                    cb.borrow_mut()();
                }
            }
            if event.is_writable() {
                let cbs = self.io.get(&fd).map(|e| e.write.clone()).unwrap_or_default();
                for cb in cbs {
                    cb.borrow_mut()();
                }
            }
        }

        self.timers.run_expired();
        Ok(())
    }

    fn watch_read(&mut self, fd: RawFd, callback: ReadyCallback) -> Result<(), WispError> {
        self.io.entry(fd).or_default().read.push(Rc::new(RefCell::new(callback)));
        self.reregister(fd)
    }

    fn watch_write(&mut self, fd: RawFd, callback: ReadyCallback) -> Result<(), WispError> {
        self.io.entry(fd).or_default().write.push(Rc::new(RefCell::new(callback)));
        self.reregister(fd)
    }

    fn unwatch_read(&mut self, fd: RawFd) -> Result<(), WispError> {
        if let Some(entry) = self.io.get_mut(&fd) {
            entry.read.clear();
        }
        let empty = self.io.get(&fd).map(|e| e.interest().is_none()).unwrap_or(true);
        let result = self.reregister(fd);
        if empty {
            self.io.remove(&fd);
        }
        result
    }

    fn unwatch_write(&mut self, fd: RawFd) -> Result<(), WispError> {
        if let Some(entry) = self.io.get_mut(&fd) {
            entry.write.clear();
        }
        let empty = self.io.get(&fd).map(|e| e.interest().is_none()).unwrap_or(true);
        let result = self.reregister(fd);
        if empty {
            self.io.remove(&fd);
        }
        result
    }

    #[cfg(unix)]
    fn watch_signal(&mut self, signal: i32, callback: ReadyCallback) -> Result<(), WispError> {
        self.ensure_signal_source()?;
        let signals = self.signals.as_mut().unwrap();
        signals
            .source
            .add_signal(signal)
            .map_err(|e| io_err("failed to watch signal", e))?;
        signals.callbacks.insert(signal, Rc::new(RefCell::new(callback)));
        Ok(())
    }

    #[cfg(not(unix))]
    fn watch_signal(&mut self, _signal: i32, _callback: ReadyCallback) -> Result<(), WispError> {
        Err(WispError::new(ErrorKind::ReactorInvariant, "signal watching is unix-only"))
    }

    #[cfg(unix)]
    fn unwatch_signal(&mut self, signal: i32) {
        if let Some(signals) = &mut self.signals {
            signals.callbacks.remove(&signal);
        }
    }

    #[cfg(not(unix))]
    fn unwatch_signal(&mut self, _signal: i32) {}

    fn timer(&mut self, delay: Duration, repeat: Option<Duration>, callback: ReadyCallback) -> TimerId {
        self.timers.arm(delay, repeat, callback)
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    fn on_fork(&mut self) {
        self.io.clear();
        self.signals = None;
        if let Ok(poll) = Poll::new() {
            self.poll = poll;
        }
    }

    fn stop(&mut self) {
        self.active = false;
        self.io.clear();
        self.signals = None;
        self.timers.clear();
    }
}

fn io_err(message: &str, cause: io::Error) -> WispError {
    WispError::new(ErrorKind::ReactorInvariant, format!("{message}: {cause}"))
}

/// Run `cb` inside a freshly spawned, immediately-started task -- the same
/// fault-isolation pattern `Scheduler::spawn_listener_fires` uses for
/// state-transition listeners, applied here to signal watchers so a slow
/// or panicking handler can't delay the rest of this tick's dispatch.
fn dispatch_in_task(cb: SharedCallback) {
    crate::scheduler::with_current(|sched| {
        sched.go(
            move || {
                cb.borrow_mut()();
                Ok(Value::unit())
            },
            true,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_timer_fires_after_delay() {
        let mut reactor = PollReactor::new().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        reactor.timer(Duration::from_millis(1), None, Box::new(move || *f.borrow_mut() = true));
        std::thread::sleep(Duration::from_millis(5));
        reactor.tick(Some(Duration::ZERO)).unwrap();
        assert!(*fired.borrow());
        assert!(!reactor.is_active());
    }

    #[test]
    fn test_repeating_timer_rearms() {
        let mut reactor = PollReactor::new().unwrap();
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        reactor.timer(Duration::from_millis(1), Some(Duration::from_millis(1)), Box::new(move || *c.borrow_mut() += 1));
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(2));
            reactor.tick(Some(Duration::ZERO)).unwrap();
        }
        assert!(*count.borrow() >= 2);
        assert!(reactor.is_active());
    }

    #[test]
    fn test_cancel_timer_prevents_fire() {
        let mut reactor = PollReactor::new().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let id = reactor.timer(Duration::from_millis(1), None, Box::new(move || *f.borrow_mut() = true));
        reactor.cancel_timer(id);
        std::thread::sleep(Duration::from_millis(5));
        reactor.tick(Some(Duration::ZERO)).unwrap();
        assert!(!*fired.borrow());
    }

    #[test]
    fn test_stop_clears_all_watchers() {
        let mut reactor = PollReactor::new().unwrap();
        reactor.timer(Duration::from_secs(10), None, Box::new(|| {}));
        assert!(reactor.is_active());
        reactor.stop();
        assert!(!reactor.is_active());
    }
}
