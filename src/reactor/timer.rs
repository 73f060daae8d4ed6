//! Timer wheel backing `Reactor::timer`.
//!
//! A binary heap keyed by deadline, same shape as the Dune event loop's
//! `BTreeMap<Instant, Index>` timer queue, but supporting repeat intervals
//! with drift-minimizing re-arming: the next deadline is computed from the
//! timer's *previous* deadline, not from `Instant::now()` at fire time, so
//! a slow tick doesn't permanently shift a periodic timer's phase.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

pub type TimerId = u64;

struct Armed {
    repeat: Option<Duration>,
    callback: Box<dyn FnMut()>,
}

pub struct TimerWheel {
    next_id: TimerId,
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, Armed>,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel {
            next_id: 1,
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
        }
    }

    pub fn arm(&mut self, delay: Duration, repeat: Option<Duration>, callback: Box<dyn FnMut()>) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = Instant::now() + delay;
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(id, Armed { repeat, callback });
        id
    }

    /// Removing the table entry turns the heap slot into a tombstone;
    /// `prune` drops tombstones lazily rather than searching the heap.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.remove(&id);
    }

    pub fn is_active(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.entries.clear();
    }

    fn prune(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.entries.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Time until the nearest live deadline, or `None` if no timers are
    /// armed (the reactor then blocks indefinitely on I/O).
    pub fn next_timeout(&mut self) -> Option<Duration> {
        self.prune();
        self.heap
            .peek()
            .map(|Reverse((deadline, _))| deadline.saturating_duration_since(Instant::now()))
    }

    /// Run every timer whose deadline has passed, re-arming repeaters.
    pub fn run_expired(&mut self) {
        let now = Instant::now();
        loop {
            self.prune();
            match self.heap.peek() {
                Some(Reverse((deadline, _))) if *deadline <= now => {}
                _ => break,
            }
            let Reverse((deadline, id)) = self.heap.pop().unwrap();
            let Some(mut armed) = self.entries.remove(&id) else { continue };
            (armed.callback)();
            if let Some(repeat) = armed.repeat {
                let mut next_deadline = deadline + repeat;
                // Catch up rather than fire a storm of backlog ticks if the
                // process was stalled for longer than one whole interval.
                if next_deadline < now {
                    next_deadline = now + repeat;
                }
                self.heap.push(Reverse((next_deadline, id)));
                self.entries.insert(id, armed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l1 = log.clone();
        wheel.arm(Duration::from_millis(10), None, Box::new(move || l1.borrow_mut().push("b")));
        let l2 = log.clone();
        wheel.arm(Duration::from_millis(1), None, Box::new(move || l2.borrow_mut().push("a")));
        std::thread::sleep(Duration::from_millis(15));
        wheel.run_expired();
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut wheel = TimerWheel::new();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let id = wheel.arm(Duration::from_millis(1), None, Box::new(move || *f.borrow_mut() = true));
        wheel.cancel(id);
        std::thread::sleep(Duration::from_millis(5));
        wheel.run_expired();
        assert!(!*fired.borrow());
        assert!(!wheel.is_active());
    }

    #[test]
    fn test_next_timeout_reflects_nearest_deadline() {
        let mut wheel = TimerWheel::new();
        assert!(wheel.next_timeout().is_none());
        wheel.arm(Duration::from_millis(50), None, Box::new(|| {}));
        let timeout = wheel.next_timeout().unwrap();
        assert!(timeout <= Duration::from_millis(50));
    }
}
