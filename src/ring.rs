//! Power-of-two sized byte ring buffer with growth, compaction, and peek.
//!
//! Pure data structure (no scheduler/reactor dependency) used by
//! [`crate::stream::Stream`] to buffer the write side of a non-blocking
//! endpoint. Bulk-copies each of the at most two contiguous segments with
//! `copy_from_slice` rather than looping byte-at-a-time.

use crate::error::{ErrorKind, WispError};

const MIN_CAPACITY: usize = 1024; // 1 KiB
const MAX_CAPACITY: usize = 16 * 1024 * 1024; // 16 MiB
const GROWTH_FACTOR: f64 = 1.5;
/// Below this fraction of capacity, a wrapped buffer is compacted back to
/// a contiguous `[0, length)` region on read.
const COMPACT_THRESHOLD: f64 = 0.25;

fn next_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// A power-of-two sized byte ring with two cursors (`read`, `write`) and
/// a live `length`. `read == write` with `length == 0` means empty;
/// `length == capacity` means full.
pub struct RingBuffer {
    data: Vec<u8>,
    read: usize,
    write: usize,
    length: usize,
}

impl RingBuffer {
    /// `capacity` is rounded up to a power of two and clamped to
    /// `[1 KiB, 16 MiB]`. Invalid (zero, or over the cap after rounding)
    /// capacities are rejected rather than silently clamped, since that
    /// would silently change how much memory the caller thinks they asked
    /// for.
    pub fn new(capacity: usize) -> Result<Self, WispError> {
        if capacity == 0 {
            return Err(WispError::new(ErrorKind::Argument, "ring buffer capacity must be non-zero"));
        }
        let capacity = next_power_of_two(capacity).clamp(MIN_CAPACITY, MAX_CAPACITY);
        Ok(RingBuffer {
            data: vec![0u8; capacity],
            read: 0,
            write: 0,
            length: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_full(&self) -> bool {
        self.length == self.data.len()
    }

    /// Append `bytes` to the ring, growing capacity (by `1.5x`, rounded up
    /// to the next power of two, capped at 16 MiB) as needed. A zero-length
    /// write is a no-op. Errors if `bytes` would not fit even after growing
    /// to the cap.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), WispError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let needed = self.length + bytes.len();
        if needed > self.data.len() {
            self.grow_to_fit(needed)?;
        }
        let cap = self.data.len();
        let first_len = bytes.len().min(cap - self.write);
        self.data[self.write..self.write + first_len].copy_from_slice(&bytes[..first_len]);
        let remaining = &bytes[first_len..];
        if !remaining.is_empty() {
            self.data[..remaining.len()].copy_from_slice(remaining);
        }
        self.write = (self.write + bytes.len()) % cap;
        self.length += bytes.len();
        Ok(())
    }

    fn grow_to_fit(&mut self, needed: usize) -> Result<(), WispError> {
        let mut cap = self.data.len();
        while cap < needed {
            let grown = (cap as f64 * GROWTH_FACTOR).ceil() as usize;
            cap = next_power_of_two(grown.max(cap + 1));
            if cap > MAX_CAPACITY {
                return Err(WispError::new(
                    ErrorKind::Argument,
                    format!("ring buffer cannot grow past {MAX_CAPACITY} bytes (needed {needed})"),
                ));
            }
        }
        let mut bigger = vec![0u8; cap];
        let (a, b) = self.contiguous_segments();
        bigger[..a.len()].copy_from_slice(a);
        bigger[a.len()..a.len() + b.len()].copy_from_slice(b);
        self.data = bigger;
        self.read = 0;
        self.write = self.length;
        Ok(())
    }

    /// The live data as at most two contiguous byte slices (second is
    /// empty unless the data wraps past the end of the backing array).
    fn contiguous_segments(&self) -> (&[u8], &[u8]) {
        if self.length == 0 {
            return (&[], &[]);
        }
        let cap = self.data.len();
        if self.read < self.write || (self.read == self.write && self.length == 0) {
            (&self.data[self.read..self.read + self.length], &[])
        } else if self.read + self.length <= cap {
            (&self.data[self.read..self.read + self.length], &[])
        } else {
            let first = &self.data[self.read..cap];
            let second = &self.data[..self.length - first.len()];
            (first, second)
        }
    }

    /// Copy up to `n` bytes out without consuming them.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        if n == 0 {
            return Vec::new();
        }
        let n = n.min(self.length);
        let (a, b) = self.contiguous_segments();
        let mut out = Vec::with_capacity(n);
        if n <= a.len() {
            out.extend_from_slice(&a[..n]);
        } else {
            out.extend_from_slice(a);
            out.extend_from_slice(&b[..n - a.len()]);
        }
        out
    }

    /// Consume and return up to `n` bytes. A zero-length read is a no-op.
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        let out = self.peek(n);
        self.consume(out.len());
        out
    }

    /// Drop `n` bytes from the front without copying them out (used by
    /// the stream's flush loop after a successful write of a peeked
    /// chunk).
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.length);
        if n == 0 {
            return;
        }
        let cap = self.data.len();
        self.read = (self.read + n) % cap;
        self.length -= n;
        self.maybe_compact();
    }

    /// If the buffer has wrapped and dropped below a quarter of capacity,
    /// reorder the live data back to `[0, length)` so later writes don't
    /// need to special-case the wrap on a buffer that is mostly empty.
    fn maybe_compact(&mut self) {
        if self.read == 0 {
            return;
        }
        let wrapped = self.read + self.length > self.data.len();
        if wrapped && (self.length as f64) < COMPACT_THRESHOLD * self.data.len() as f64 {
            self.compact();
        }
    }

    pub fn compact(&mut self) {
        if self.read == 0 {
            return;
        }
        let (a, b) = self.contiguous_segments();
        let mut tmp = Vec::with_capacity(self.length);
        tmp.extend_from_slice(a);
        tmp.extend_from_slice(b);
        self.data[..tmp.len()].copy_from_slice(&tmp);
        self.read = 0;
        self.write = tmp.len() % self.data.len().max(1);
        if tmp.len() == self.data.len() {
            self.write = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        let r = RingBuffer::new(1000).unwrap();
        assert_eq!(r.capacity(), 1024);
        let r2 = RingBuffer::new(1024).unwrap();
        assert_eq!(r2.capacity(), 1024);
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let mut r = RingBuffer::new(64).unwrap();
        r.write(b"hello world").unwrap();
        assert_eq!(r.read(11), b"hello world");
        assert_eq!(r.len(), 0);
    }

    #[test]
    fn test_zero_length_ops_are_noops() {
        let mut r = RingBuffer::new(64).unwrap();
        r.write(b"").unwrap();
        assert_eq!(r.len(), 0);
        assert_eq!(r.read(0), Vec::<u8>::new());
        assert_eq!(r.peek(0), Vec::<u8>::new());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut r = RingBuffer::new(64).unwrap();
        r.write(b"abc").unwrap();
        assert_eq!(r.peek(3), b"abc");
        assert_eq!(r.len(), 3);
        assert_eq!(r.read(3), b"abc");
    }

    #[test]
    fn test_grow_past_initial_capacity() {
        let mut r = RingBuffer::new(8).unwrap();
        r.write(&[1u8; 20]).unwrap();
        assert!(r.capacity() >= 20);
        assert_eq!(r.len(), 20);
    }

    #[test]
    fn test_wrap_and_compact() {
        // capacity 1024, write 700, read 600, write 340 (wraps), read 200.
        let mut r = RingBuffer::new(1024).unwrap();
        let seq: Vec<u8> = (0..1040u32).map(|i| (i % 256) as u8).collect();
        r.write(&seq[0..700]).unwrap();
        r.read(600);
        r.write(&seq[700..1040]).unwrap();
        let rest = r.read(200);
        assert_eq!(rest, &seq[600..800]);
        // After draining below the compaction threshold the read cursor
        // resets to 0 whenever the data was wrapped.
        let remaining = r.read(r.len());
        assert_eq!(remaining, &seq[800..1040]);
    }

    #[test]
    fn test_invalid_capacity_rejected() {
        assert_eq!(RingBuffer::new(0).unwrap_err().kind, ErrorKind::Argument);
    }
}
