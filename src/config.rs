//! Environment-variable configuration.
//!
//! Read directly with `std::env::var` at a single init point -- no
//! config-file parser.

use crate::error::{ErrorKind, WispError};

const DEFAULT_MAX_TRACES: usize = 20;
const DEFAULT_WRITE_BUFFER_SIZE: usize = 32 * 1024;
const DEFAULT_WRITE_BUFFER_MAX: usize = 1024 * 1024;
const DEFAULT_WRITE_CHUNK_SIZE: usize = 60 * 1024;

/// Which reactor back-end to use.
///
/// Only `Poll` (the portable back-end) is actually implemented. Others
/// could be modeled by the `Reactor` trait in the future but have no
/// implementation in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorBackend {
    Poll,
}

impl ReactorBackend {
    fn parse(s: &str) -> Result<Self, WispError> {
        match s {
            "poll" => Ok(ReactorBackend::Poll),
            other => Err(WispError::new(
                ErrorKind::Argument,
                format!("unknown reactor backend {other:?} (only \"poll\" is implemented)"),
            )),
        }
    }
}

/// Runtime configuration, read once from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-task debug trace ring capacity.
    pub max_traces: usize,
    /// Whether to include runtime/vendor frames in diagnostic dumps.
    pub debug: bool,
    /// Initial write-buffer size for a buffered stream.
    pub write_buffer_size: usize,
    /// Soft cap on a stream's write buffer; exceeding it is an overflow error.
    pub write_buffer_max: usize,
    /// Largest single write attempted per flush iteration.
    pub write_chunk_size: usize,
    /// Selected reactor back-end.
    pub reactor_backend: ReactorBackend,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_traces: DEFAULT_MAX_TRACES,
            debug: false,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            write_buffer_max: DEFAULT_WRITE_BUFFER_MAX,
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
            reactor_backend: ReactorBackend::Poll,
        }
    }
}

impl Config {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable (except the reactor
    /// backend selector, which is validated strictly).
    pub fn from_env() -> Result<Self, WispError> {
        let mut cfg = Config::default();

        if let Ok(v) = std::env::var("WISP_MAX_TRACES") {
            if let Ok(n) = v.parse() {
                cfg.max_traces = n;
            }
        }
        if let Ok(v) = std::env::var("WISP_DEBUG") {
            cfg.debug = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("WISP_WRITE_BUFFER_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.write_buffer_size = n;
            }
        }
        if let Ok(v) = std::env::var("WISP_WRITE_BUFFER_MAX") {
            if let Ok(n) = v.parse() {
                cfg.write_buffer_max = n;
            }
        }
        if let Ok(v) = std::env::var("WISP_WRITE_CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.write_chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("WISP_REACTOR_BACKEND") {
            cfg.reactor_backend = ReactorBackend::parse(&v)?;
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.max_traces, DEFAULT_MAX_TRACES);
        assert!(!cfg.debug);
        assert_eq!(cfg.reactor_backend, ReactorBackend::Poll);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = ReactorBackend::parse("epoll_direct").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Argument);
    }
}
