//! Synchronization primitives built on top of the task/scheduler pair:
//! a bounded FIFO [`channel::Channel`], a sticky-ownership [`mutex::Mutex`],
//! and a [`waitgroup::WaitGroup`]. All three suspend the current task
//! through [`crate::task::suspend`] rather than blocking an OS thread --
//! there is only ever one task running at a time.

pub mod channel;
pub mod mutex;
pub mod waitgroup;

pub use channel::{Channel, TryRecvError, TrySendError};
pub use mutex::Mutex;
pub use waitgroup::WaitGroup;
