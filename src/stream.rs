//! Buffered, non-blocking byte stream: a ring-buffered write side plus
//! reactor-driven readiness, layered over any endpoint that supports
//! non-blocking I/O and exposes a raw fd for reactor registration.
//!
//! Follows the non-blocking-write-then-watch-writable pattern used
//! elsewhere in this crate's reactor (retry on `WouldBlock`, then arm a
//! write-ready watcher), with [`crate::ring::RingBuffer`] underneath for
//! the write-side buffering.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::error::{ErrorKind, WispError};
use crate::ring::RingBuffer;
use crate::scheduler::with_current;
use crate::task::{current, suspend, TaskId, Value};

/// Which half (or both) of a duplex endpoint to half-close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

/// Tunable stream knobs; defaults mirror [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub write_buffer_size: usize,
    pub write_buffer_max: usize,
    pub write_chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            write_buffer_size: 32 * 1024,
            write_buffer_max: 1024 * 1024,
            write_chunk_size: 60 * 1024,
        }
    }
}

impl From<&crate::config::Config> for StreamConfig {
    fn from(c: &crate::config::Config) -> Self {
        StreamConfig {
            write_buffer_size: c.write_buffer_size,
            write_buffer_max: c.write_buffer_max,
            write_chunk_size: c.write_chunk_size,
        }
    }
}

/// A non-blocking byte endpoint a [`Stream`] can wrap: plain
/// `Read + Write + AsRawFd` plus a half-close. Implemented for anything
/// satisfying the bounds (e.g. `mio::net::TcpStream`) via the blanket impl
/// below, using `nix::sys::socket::shutdown` directly on the fd so the
/// trait doesn't need to know the endpoint's concrete type.
pub trait Endpoint: Read + Write + AsRawFd {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let fd = self.as_raw_fd();
        let how = match how {
            Shutdown::Read => nix::sys::socket::Shutdown::Read,
            Shutdown::Write => nix::sys::socket::Shutdown::Write,
            Shutdown::Both => nix::sys::socket::Shutdown::Both,
        };
        nix::sys::socket::shutdown(fd, how).map_err(|e| io::Error::from_raw_os_error(e as i32))
    }
}

impl<T: Read + Write + AsRawFd> Endpoint for T {}

/// The data a [`Stream`] owns: the endpoint itself, the write-side ring
/// buffer, and the handful of flags tracking half-close / suspension
/// state. Plain data plus the reactor-free operations (`read`,
/// `write_async`, `flush_once`, `shutdown`, `close`); the operations that
/// need to re-enter through the reactor (`write_all`, `flush`) live on
/// [`SharedStream`], which is the only owner that can hand the watcher
/// callback a handle back to itself.
pub struct Stream<T: Endpoint> {
    endpoint: T,
    config: StreamConfig,
    write_buf: RingBuffer,
    closed: bool,
    rd_closed: bool,
    wr_closed: bool,
    /// The task suspended inside `flush`/`write_all`, if any -- woken (or
    /// thrown into) when the buffer drains, a timeout fires, or `close()`
    /// tears the stream down from under it.
    suspended_flusher: Option<TaskId>,
    write_watcher_active: bool,
    read_watcher_active: bool,
}

impl<T: Endpoint + 'static> Stream<T> {
    pub fn new(endpoint: T, config: StreamConfig) -> Self {
        let write_buf = RingBuffer::new(config.write_buffer_size).expect("default write buffer size is valid");
        Stream {
            endpoint,
            config,
            write_buf,
            closed: false,
            rd_closed: false,
            wr_closed: false,
            suspended_flusher: None,
            write_watcher_active: false,
            read_watcher_active: false,
        }
    }

    fn fd(&self) -> RawFd {
        self.endpoint.as_raw_fd()
    }

    pub fn endpoint(&self) -> &T {
        &self.endpoint
    }

    pub fn endpoint_mut(&mut self) -> &mut T {
        &mut self.endpoint
    }

    /// Non-blocking read up to `n` bytes. Returns an empty vec on a
    /// would-block (not EOF); an empty vec paired with `Ok` is
    /// ambiguous with true EOF only if the caller also checks
    /// [`Stream::read_closed`].
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>, WispError> {
        if self.closed || self.rd_closed {
            return Err(conn_err("read on a closed stream"));
        }
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; n];
        match self.endpoint.read(&mut buf) {
            Ok(0) => {
                self.rd_closed = true;
                Ok(Vec::new())
            }
            Ok(read) => {
                buf.truncate(read);
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(conn_err_cause("stream read failed", e)),
        }
    }

    /// Enqueue without blocking; overflow rules match `write_all`. Does not
    /// install a watcher -- the caller drains opportunistically via
    /// [`Stream::flush_once`].
    pub fn write_async(&mut self, bytes: &[u8]) -> Result<(), WispError> {
        if self.closed || self.wr_closed {
            return Err(conn_err("write on a closed stream"));
        }
        if self.write_buf.len() + bytes.len() > self.config.write_buffer_max {
            return Err(conn_err("write buffer overflow"));
        }
        self.write_buf.write(bytes).map_err(|e| conn_err(&e.to_string()))
    }

    /// Non-suspending: while the buffer is non-empty and the endpoint is
    /// write-ready, peek up to `write_chunk_size`, attempt a write, and
    /// consume the written prefix. Stops on a short write or zero
    /// progress; never waits.
    pub fn flush_once(&mut self) -> Result<(), WispError> {
        loop {
            if self.write_buf.is_empty() {
                return Ok(());
            }
            let chunk = self.write_buf.peek(self.config.write_chunk_size);
            match self.endpoint.write(&chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    self.write_buf.consume(n);
                    if n < chunk.len() {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(conn_err_cause("stream write failed", e)),
            }
        }
    }

    /// `how` selects which half to half-close; each half is idempotent.
    /// Write-shutdown flushes best-effort first.
    pub fn shutdown(&mut self, how: Shutdown) -> Result<(), WispError> {
        match how {
            Shutdown::Write => {
                if !self.wr_closed {
                    let _ = self.flush_once();
                    self.write_watcher_active = false;
                    let _ = self.endpoint.shutdown(Shutdown::Write);
                    self.wr_closed = true;
                }
            }
            Shutdown::Read => {
                if !self.rd_closed {
                    self.read_watcher_active = false;
                    let _ = self.endpoint.shutdown(Shutdown::Read);
                    self.rd_closed = true;
                }
            }
            Shutdown::Both => {
                self.shutdown(Shutdown::Write)?;
                self.shutdown(Shutdown::Read)?;
            }
        }
        Ok(())
    }

    /// Interface only: no real handshake is implemented. Always reports a
    /// connection error rather than silently succeeding, so callers can't
    /// mistake this for a real handshake.
    pub fn enable_ssl(&mut self, _method: &str, _timeout: Option<Duration>) -> Result<(), WispError> {
        Err(conn_err("TLS handshake is not implemented in this build (interface only)"))
    }

    /// Idempotent. Closes the underlying endpoint (half-close both
    /// directions) and fails any suspended flusher. Does not itself
    /// deregister reactor watchers -- callers going through
    /// [`SharedStream::close`] get that too.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.write_watcher_active = false;
        self.read_watcher_active = false;
        let _ = self.endpoint.shutdown(Shutdown::Both);
        if let Some(task) = self.suspended_flusher.take() {
            with_current(|s| {
                s.throw(task, conn_err("stream closed"));
            });
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn read_closed(&self) -> bool {
        self.closed || self.rd_closed
    }

    pub fn write_closed(&self) -> bool {
        self.closed || self.wr_closed
    }

    pub fn pending_write_bytes(&self) -> usize {
        self.write_buf.len()
    }
}

/// A [`Stream`] shared via `Rc<RefCell<_>>` so that a reactor write-ready
/// watcher can hold a [`Weak`] handle back into it and keep draining the
/// write buffer across ticks -- `write_all`/`flush` are only meaningful
/// with a real watcher behind them, so they live here rather than on the
/// bare [`Stream`].
pub struct SharedStream<T: Endpoint + 'static>(Rc<RefCell<Stream<T>>>);

impl<T: Endpoint + 'static> Clone for SharedStream<T> {
    fn clone(&self) -> Self {
        SharedStream(self.0.clone())
    }
}

impl<T: Endpoint + 'static> SharedStream<T> {
    pub fn new(endpoint: T, config: StreamConfig) -> Self {
        SharedStream(Rc::new(RefCell::new(Stream::new(endpoint, config))))
    }

    fn fd(&self) -> RawFd {
        self.0.borrow().fd()
    }

    pub fn read(&self, n: usize) -> Result<Vec<u8>, WispError> {
        self.0.borrow_mut().read(n)
    }

    pub fn write_async(&self, bytes: &[u8]) -> Result<(), WispError> {
        self.0.borrow_mut().write_async(bytes)
    }

    pub fn flush_once(&self) -> Result<(), WispError> {
        self.0.borrow_mut().flush_once()
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<(), WispError> {
        let fd = self.fd();
        let result = self.0.borrow_mut().shutdown(how);
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            with_current(|sched| {
                let _ = sched.reactor().borrow_mut().unwatch_write(fd);
            });
        }
        result
    }

    pub fn enable_ssl(&self, method: &str, timeout: Option<Duration>) -> Result<(), WispError> {
        self.0.borrow_mut().enable_ssl(method, timeout)
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().is_closed()
    }

    pub fn read_closed(&self) -> bool {
        self.0.borrow().read_closed()
    }

    pub fn write_closed(&self) -> bool {
        self.0.borrow().write_closed()
    }

    pub fn pending_write_bytes(&self) -> usize {
        self.0.borrow().pending_write_bytes()
    }

    /// Idempotent. Cancels the live write watcher (if any), then defers to
    /// [`Stream::close`] for the rest.
    pub fn close(&self) {
        let fd = self.fd();
        self.0.borrow_mut().close();
        with_current(|sched| {
            let _ = sched.reactor().borrow_mut().unwatch_write(fd);
        });
    }

    /// Write `bytes`, blocking the calling task (via suspend, not the OS
    /// thread) until the whole payload has been handed to the endpoint or
    /// `timeout` elapses.
    pub fn write_all(&self, bytes: &[u8], timeout: Option<Duration>) -> Result<usize, WispError> {
        if bytes.is_empty() {
            let s = self.0.borrow();
            if s.closed || s.wr_closed {
                return Err(conn_err("write on a closed stream"));
            }
            return Ok(0);
        }

        {
            let mut s = self.0.borrow_mut();
            if s.closed || s.wr_closed {
                return Err(conn_err("write on a closed stream"));
            }

            let mut written = 0;
            if s.write_buf.is_empty() {
                match s.endpoint.write(bytes) {
                    Ok(n) => written = n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(conn_err_cause("stream write failed", e)),
                }
            }
            if written == bytes.len() {
                return Ok(written);
            }

            let remainder = &bytes[written..];
            if s.write_buf.len() + remainder.len() > s.config.write_buffer_max {
                return Err(conn_err("write buffer overflow"));
            }
            s.write_buf.write(remainder).map_err(|e| conn_err(&e.to_string()))?;
        }

        self.flush(timeout)?;
        Ok(bytes.len())
    }

    /// Subscribe a write-ready watcher that drains the buffer
    /// chunk-by-chunk, resuming the caller when it empties; arms a
    /// `timeout` timer (if positive) that throws a timeout error into the
    /// caller instead. Always releases both on exit.
    pub fn flush(&self, timeout: Option<Duration>) -> Result<(), WispError> {
        self.flush_once()?;
        if self.0.borrow().write_buf.is_empty() {
            return Ok(());
        }

        let me = current().expect("Stream::flush called outside a task");
        self.0.borrow_mut().suspended_flusher = Some(me);
        self.install_write_watcher()?;

        let timer_id = timeout.filter(|d| *d > Duration::ZERO).map(|d| {
            with_current(|sched| {
                sched.reactor().borrow_mut().timer(
                    d,
                    None,
                    Box::new(move || {
                        with_current(|s| {
                            s.throw(me, WispError::timeout("stream write"));
                        });
                    }),
                )
            })
        });

        let result = suspend(Value::unit());

        self.0.borrow_mut().suspended_flusher = None;
        self.remove_write_watcher();
        if let Some(id) = timer_id {
            with_current(|sched| sched.reactor().borrow_mut().cancel_timer(id));
        }
        result.map(|_| ())
    }

    /// Arms a real reactor write-ready watcher holding a [`Weak`] handle
    /// back to this stream. On each readiness notification it drains as
    /// much of the buffer as it can; once empty, it resumes whichever task
    /// is parked in `flush`.
    fn install_write_watcher(&self) -> Result<(), WispError> {
        if self.0.borrow().write_watcher_active {
            return Ok(());
        }
        self.0.borrow_mut().write_watcher_active = true;
        let fd = self.fd();
        let weak: Weak<RefCell<Stream<T>>> = Rc::downgrade(&self.0);
        with_current(|sched| {
            sched.reactor().borrow_mut().watch_write(
                fd,
                Box::new(move || {
                    let Some(strong) = weak.upgrade() else { return };
                    let (drained, flusher) = {
                        let mut s = strong.borrow_mut();
                        let _ = s.flush_once();
                        (s.write_buf.is_empty(), s.suspended_flusher)
                    };
                    if drained {
                        if let Some(task) = flusher {
                            with_current(|sched| {
                                sched.resume(task, Value::unit());
                            });
                        }
                    }
                }),
            )
        })
    }

    fn remove_write_watcher(&self) {
        if !self.0.borrow().write_watcher_active {
            return;
        }
        self.0.borrow_mut().write_watcher_active = false;
        let fd = self.fd();
        with_current(|sched| {
            let _ = sched.reactor().borrow_mut().unwatch_write(fd);
        });
    }
}

fn conn_err(msg: &str) -> WispError {
    WispError::new(ErrorKind::Connection, msg)
}

fn conn_err_cause(msg: &str, cause: io::Error) -> WispError {
    WispError::new(ErrorKind::Connection, format!("{msg}: {cause}"))
}
