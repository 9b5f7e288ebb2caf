//! Byte pipe
//!
//! Power-of-two ring buffer with blocking and non-blocking endpoints. The
//! blocking variants move one byte per critical section and wait for the
//! next tick while the ring is empty (readers) or full (writers); the
//! non-blocking variants transfer as much as they can under a single
//! critical section and return the count, which may be zero.

use alloc::boxed::Box;
use alloc::vec;

use crate::critical::{critical_section, CsCell};
use crate::error::{fatal, KernelError, KernelResult};
use crate::task;

struct PipeInner {
    buf: Box<[u8]>,
    mask: usize,
    head: usize,
    tail: usize,
    used: usize,
    active: bool,
}

impl PipeInner {
    #[inline]
    fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.used == self.mask + 1
    }

    #[inline]
    fn get_byte(&mut self) -> u8 {
        let val = self.buf[self.head];
        self.head = (self.head + 1) & self.mask;
        self.used -= 1;
        val
    }

    #[inline]
    fn put_byte(&mut self, c: u8) {
        self.buf[self.tail] = c;
        self.tail = (self.tail + 1) & self.mask;
        self.used += 1;
    }
}

/// Byte stream over a power-of-two ring buffer.
pub struct Pipe {
    inner: CsCell<PipeInner>,
}

impl Pipe {
    /// Create a pipe of at least `size` bytes; the capacity is rounded up
    /// to a power of two (minimum 2).
    pub fn new(size: u16) -> KernelResult<Pipe> {
        let capacity = (size.max(2) as usize).next_power_of_two();
        Ok(Pipe {
            inner: CsCell::new(PipeInner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                mask: capacity - 1,
                head: 0,
                tail: 0,
                used: 0,
                active: true,
            }),
        })
    }

    fn check_active(&self) {
        let active = critical_section(|cs| self.inner.get(cs).active);
        if !active {
            fatal(KernelError::SemOperation);
        }
    }

    fn wait_until_readable(&self) {
        loop {
            let readable =
                critical_section(|cs| !self.inner.get(cs).is_empty());
            if readable {
                return;
            }
            // Nothing to read; give the CPU away until the next tick.
            task::task_wfi();
        }
    }

    fn wait_until_writable(&self) {
        loop {
            let writable =
                critical_section(|cs| !self.inner.get(cs).is_full());
            if writable {
                return;
            }
            task::task_wfi();
        }
    }

    /// Read exactly `dst.len()` bytes, blocking while the pipe is empty.
    pub fn read(&self, dst: &mut [u8]) -> KernelResult<usize> {
        if dst.is_empty() {
            return Err(KernelError::Fail);
        }
        self.check_active();

        for slot in dst.iter_mut() {
            self.wait_until_readable();
            *slot = critical_section(|cs| self.inner.get(cs).get_byte());
        }
        Ok(dst.len())
    }

    /// Write all of `src`, blocking while the pipe is full.
    pub fn write(&self, src: &[u8]) -> KernelResult<usize> {
        if src.is_empty() {
            return Err(KernelError::Fail);
        }
        self.check_active();

        for &byte in src {
            self.wait_until_writable();
            critical_section(|cs| self.inner.get(cs).put_byte(byte));
        }
        Ok(src.len())
    }

    /// Read whatever is available, up to `dst.len()` bytes. Returns the
    /// count; 0 is legal.
    pub fn nbread(&self, dst: &mut [u8]) -> usize {
        self.check_active();
        critical_section(|cs| {
            let p = self.inner.get(cs);
            let mut n = 0;
            while n < dst.len() && !p.is_empty() {
                dst[n] = p.get_byte();
                n += 1;
            }
            n
        })
    }

    /// Write as much of `src` as fits. Returns the count; 0 is legal.
    pub fn nbwrite(&self, src: &[u8]) -> usize {
        self.check_active();
        critical_section(|cs| {
            let p = self.inner.get(cs);
            let mut n = 0;
            while n < src.len() && !p.is_full() {
                p.put_byte(src[n]);
                n += 1;
            }
            n
        })
    }

    /// Discard everything buffered.
    pub fn flush(&self) {
        critical_section(|cs| {
            let p = self.inner.get(cs);
            p.head = 0;
            p.tail = 0;
            p.used = 0;
        });
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        critical_section(|cs| self.inner.get(cs).used)
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total byte capacity (a power of two).
    pub fn capacity(&self) -> usize {
        critical_section(|cs| self.inner.get(cs).mask + 1)
    }

    /// Tear the pipe down; afterwards any endpoint use is fatal.
    pub fn destroy(&self) -> KernelResult<()> {
        critical_section(|cs| {
            let p = self.inner.get(cs);
            if !p.active {
                return Err(KernelError::Fail);
            }
            p.active = false;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(Pipe::new(0).unwrap().capacity(), 2);
        assert_eq!(Pipe::new(5).unwrap().capacity(), 8);
        assert_eq!(Pipe::new(8).unwrap().capacity(), 8);
        assert_eq!(Pipe::new(100).unwrap().capacity(), 128);
    }

    #[test]
    fn nonblocking_round_trip_with_wraparound() {
        let p = Pipe::new(8).unwrap();

        assert_eq!(p.nbwrite(b"HELLOHEL"), 8);
        assert_eq!(p.len(), 8);
        // Ring is full: further writes transfer nothing.
        assert_eq!(p.nbwrite(b"X"), 0);

        let mut buf = [0u8; 3];
        assert_eq!(p.nbread(&mut buf), 3);
        assert_eq!(&buf, b"HEL");
        assert_eq!(p.len(), 5);

        // Space for exactly three more bytes; the head has wrapped.
        assert_eq!(p.nbwrite(b"LOW"), 3);
        assert_eq!(p.len(), 8);

        let mut rest = [0u8; 8];
        assert_eq!(p.nbread(&mut rest), 8);
        assert_eq!(&rest, b"LOHELLOW");
        assert!(p.is_empty());
    }

    #[test]
    fn nbread_on_empty_returns_zero() {
        let p = Pipe::new(4).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(p.nbread(&mut buf), 0);
    }

    #[test]
    fn flush_discards_buffered_bytes() {
        let p = Pipe::new(8).unwrap();
        p.nbwrite(b"abc");
        p.flush();
        assert!(p.is_empty());
        assert_eq!(p.nbwrite(b"defgh"), 5);
        assert_eq!(p.len(), 5);
    }

    #[test]
    fn blocking_write_and_read_without_contention() {
        let p = Pipe::new(8).unwrap();
        assert_eq!(p.write(b"HELLO"), Ok(5));
        let mut buf = [0u8; 5];
        assert_eq!(p.read(&mut buf), Ok(5));
        assert_eq!(&buf, b"HELLO");
    }

    #[test]
    fn empty_buffers_are_rejected() {
        let p = Pipe::new(8).unwrap();
        assert_eq!(p.write(b""), Err(KernelError::Fail));
        let mut empty: [u8; 0] = [];
        assert_eq!(p.read(&mut empty), Err(KernelError::Fail));
    }

    #[test]
    #[should_panic(expected = "kernel halted")]
    fn use_after_destroy_is_fatal() {
        let p = Pipe::new(8).unwrap();
        p.destroy().unwrap();
        p.nbwrite(b"x");
    }
}
