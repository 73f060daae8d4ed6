//! Error kinds for the runtime.
//!
//! Plain enums with hand-written `Display`/`source()` impls -- no
//! `thiserror` or `anyhow`.

use std::fmt;

/// The kind of failure a [`WispError`] represents.
///
/// `Outcome::resolve` takes one of these so a caller can acknowledge a
/// specific expected failure category without swallowing others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation invoked on a task in a state where it is not defined.
    TaskState,
    /// Cooperative cancellation via `Scheduler::terminate`.
    Terminate,
    /// Stream closed, read/write failure, SSL failure, overflow, timeout.
    Connection,
    /// Send on a closed channel.
    ChannelClosed,
    /// Unlock by non-owner, `done()` without a matching `add()`.
    MutexMisuse,
    /// Registering on a closed or unknown watcher.
    ReactorInvariant,
    /// Invalid capacity, invalid ring-buffer size, malformed argument.
    Argument,
    /// Injected by a timer into a suspended caller.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TaskState => "task state",
            ErrorKind::Terminate => "terminate",
            ErrorKind::Connection => "connection",
            ErrorKind::ChannelClosed => "channel closed",
            ErrorKind::MutexMisuse => "mutex misuse",
            ErrorKind::ReactorInvariant => "reactor invariant",
            ErrorKind::Argument => "argument",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// The runtime's single error type.
///
/// Carries a [`ErrorKind`] plus a message, and optionally the expected vs.
/// actual task state for `ErrorKind::TaskState`.
#[derive(Debug, Clone)]
pub struct WispError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<Box<WispError>>,
}

impl WispError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        WispError {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(kind: ErrorKind, message: impl Into<String>, cause: WispError) -> Self {
        WispError {
            kind,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn task_state(expected: &str, actual: &str) -> Self {
        WispError::new(
            ErrorKind::TaskState,
            format!("expected task in state {expected}, got {actual}"),
        )
    }

    pub fn terminate() -> Self {
        WispError::new(ErrorKind::Terminate, "task terminated")
    }

    pub fn channel_closed() -> Self {
        WispError::new(ErrorKind::ChannelClosed, "send on closed channel")
    }

    pub fn timeout(what: &str) -> Self {
        WispError::new(ErrorKind::Timeout, format!("{what} timed out"))
    }
}

impl fmt::Display for WispError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for WispError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type Result<T> = std::result::Result<T, WispError>;
