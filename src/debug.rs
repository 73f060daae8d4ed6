//! Per-task debug trace ring and the end-of-tick error sink.
//!
//! Every task keeps a bounded ring of `(time, state, event, frames)` entries.
//! When the scheduler surfaces an unresolved `Outcome` at end of tick, it
//! pairs the failing task's ring with the control op's own capture-site
//! trace and hands both to the error sink.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use crate::task::TaskState;

/// Coarse classification of a single stack frame, used to suppress noise
/// in diagnostic dumps when `Config::debug` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Inside this crate's own scheduler/reactor/primitive code.
    Runtime,
    /// Inside a third-party dependency.
    Vendor,
    /// Inside the embedder's own task bodies.
    User,
}

/// A single classified stack frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub symbol: String,
}

impl Frame {
    pub fn new(symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        let kind = classify(&symbol);
        Frame { kind, symbol }
    }
}

/// Classify a symbol by module-path prefix.
///
/// This is a heuristic, not a guarantee: anything rooted at `wisp::` is
/// `Runtime`, anything under a known vendor crate prefix is `Vendor`,
/// everything else is assumed to be `User` code.
fn classify(symbol: &str) -> FrameKind {
    const VENDOR_PREFIXES: &[&str] = &["corosensei::", "mio::", "nix::", "core::", "std::"];
    if symbol.starts_with("wisp::") {
        FrameKind::Runtime
    } else if VENDOR_PREFIXES.iter().any(|p| symbol.starts_with(p)) {
        FrameKind::Vendor
    } else {
        FrameKind::User
    }
}

/// A capture-site trace: the sequence of frames at the moment a fault
/// (or a scheduler control op) was recorded.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub frames: Vec<Frame>,
}

impl Trace {
    pub fn capture(site: &str) -> Self {
        Trace {
            frames: vec![Frame::new(site)],
        }
    }

    pub fn push(&mut self, symbol: impl Into<String>) {
        self.frames.push(Frame::new(symbol));
    }

    /// Render the trace, dropping non-`User` frames unless `debug` is set.
    pub fn render(&self, debug: bool) -> String {
        let mut out = String::new();
        for frame in &self.frames {
            if !debug && frame.kind != FrameKind::User {
                continue;
            }
            out.push_str(&format!("  at {} [{:?}]\n", frame.symbol, frame.kind));
        }
        out
    }
}

/// One entry in a task's debug ring.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub at: Instant,
    pub state: TaskState,
    pub event: &'static str,
    pub frames: Trace,
}

/// A bounded ring of trace entries, one per task.
#[derive(Debug, Clone)]
pub struct TraceRing {
    capacity: usize,
    entries: VecDeque<TraceEntry>,
}

impl TraceRing {
    pub fn new(capacity: usize) -> Self {
        TraceRing {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn record(&mut self, state: TaskState, event: &'static str, frames: Trace) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TraceEntry {
            at: Instant::now(),
            state,
            event,
            frames,
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for TraceRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "[{:?}] {}", entry.state, entry.event)?;
        }
        Ok(())
    }
}

/// A line-oriented sink for unresolved-error reports.
///
/// The default writes directly to stderr with `eprintln!` -- no
/// `log`/`tracing` facade, just a plain trait embedders can swap out.
pub trait ErrorSink {
    fn report(&self, line: &str);
}

/// Default sink: one `eprintln!` per report.
pub struct StderrSink;

impl ErrorSink for StderrSink {
    fn report(&self, line: &str) {
        eprintln!("{line}");
    }
}

/// A sink that appends to an in-memory buffer, for tests.
#[derive(Default)]
pub struct BufferSink {
    pub lines: std::sync::Mutex<Vec<String>>,
}

impl ErrorSink for BufferSink {
    fn report(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_bounded() {
        let mut ring = TraceRing::new(2);
        ring.record(TaskState::Runnable, "a", Trace::default());
        ring.record(TaskState::Running, "b", Trace::default());
        ring.record(TaskState::Waiting, "c", Trace::default());
        assert_eq!(ring.len(), 2);
        let events: Vec<_> = ring.iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["b", "c"]);
    }

    #[test]
    fn test_frame_classification() {
        assert_eq!(classify("wisp::scheduler::tick"), FrameKind::Runtime);
        assert_eq!(classify("corosensei::Coroutine::resume"), FrameKind::Vendor);
        assert_eq!(classify("my_app::handler"), FrameKind::User);
    }

    #[test]
    fn test_render_suppresses_non_user_unless_debug() {
        let mut trace = Trace::default();
        trace.push("wisp::scheduler::tick");
        trace.push("my_app::handler");
        let quiet = trace.render(false);
        assert!(!quiet.contains("scheduler"));
        assert!(quiet.contains("my_app::handler"));
        let verbose = trace.render(true);
        assert!(verbose.contains("scheduler"));
    }

    #[test]
    fn test_buffer_sink_collects() {
        let sink = BufferSink::default();
        sink.report("line one");
        sink.report("line two");
        assert_eq!(sink.lines.lock().unwrap().len(), 2);
    }
}
