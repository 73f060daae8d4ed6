//! Per-task listener queues. Every task keeps two FIFO queues of one-shot
//! callbacks keyed to a target state; `Task::transition` (private to
//! `task::mod`) fires the high-priority queue before the low-priority
//! one whenever the task reaches the matching state.

use std::collections::VecDeque;

use super::TaskState;

/// Listener dispatch priority. High-priority listeners for a given target
/// state run before low-priority ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

pub(crate) type Callback = Box<dyn FnOnce()>;

struct Listener {
    target: TaskState,
    priority: Priority,
    callback: Callback,
}

/// The pair of FIFO listener queues (high, low) attached to a task.
#[derive(Default)]
pub struct ListenerQueues {
    entries: VecDeque<Listener>,
}

impl ListenerQueues {
    pub fn new() -> Self {
        ListenerQueues {
            entries: VecDeque::new(),
        }
    }

    /// Register a one-shot listener for `target`, appended to the FIFO for
    /// its priority level.
    pub fn on(&mut self, target: TaskState, priority: Priority, callback: Callback) {
        self.entries.push_back(Listener {
            target,
            priority,
            callback,
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove and return every listener registered for `target`, high
    /// priority first, each queue in FIFO order -- the caller is
    /// responsible for invoking them (typically inside a fresh task, so a
    /// listener fault cannot corrupt the emitter's own stack).
    pub fn fire(&mut self, target: TaskState) -> Vec<Callback> {
        let mut high = Vec::new();
        let mut low = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.target == target {
                match entry.priority {
                    Priority::High => high.push(entry.callback),
                    Priority::Low => low.push(entry.callback),
                }
            } else {
                remaining.push_back(entry);
            }
        }
        self.entries = remaining;
        high.into_iter().chain(low).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_high_priority_fires_before_low() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = ListenerQueues::new();
        let l1 = log.clone();
        q.on(TaskState::Dead, Priority::Low, Box::new(move || l1.borrow_mut().push("low")));
        let l2 = log.clone();
        q.on(TaskState::Dead, Priority::High, Box::new(move || l2.borrow_mut().push("high")));
        for cb in q.fire(TaskState::Dead) {
            cb();
        }
        assert_eq!(*log.borrow(), vec!["high", "low"]);
    }

    #[test]
    fn test_only_matching_target_fires() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = ListenerQueues::new();
        let l1 = log.clone();
        q.on(TaskState::Waiting, Priority::High, Box::new(move || l1.borrow_mut().push("waiting")));
        let l2 = log.clone();
        q.on(TaskState::Dead, Priority::High, Box::new(move || l2.borrow_mut().push("dead")));
        for cb in q.fire(TaskState::Dead) {
            cb();
        }
        assert_eq!(*log.borrow(), vec!["dead"]);
        assert!(q.fire(TaskState::Waiting).is_empty());
    }

    #[test]
    fn test_fifo_within_same_priority() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = ListenerQueues::new();
        for i in 0..3 {
            let l = log.clone();
            q.on(TaskState::Dead, Priority::High, Box::new(move || l.borrow_mut().push(i)));
        }
        for cb in q.fire(TaskState::Dead) {
            cb();
        }
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }
}
