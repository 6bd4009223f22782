//! Bounded mailboxes: fixed-size messages in a pre-allocated ring buffer.
//!
//! Senders sleep while the ring is full, receivers while it is empty, each
//! on their own wait list (the shape of a pipe, with messages instead of
//! bytes). Destroying a mailbox wakes every waiter with `-EINVAL`.

use core::ptr::NonNull;

use crate::error::{KernelError, Result};
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::page::{Page, PGSIZE};
use crate::param::ORDER_MAX;
use crate::wchan::WaitChannel;

/// Cursor arithmetic over a raw ring of `capacity` messages of `msg_size`
/// bytes each. Pure bookkeeping; the locking lives in `Mailbox`.
pub struct MboxRing {
    buf: NonNull<u8>,
    msg_size: usize,
    capacity: usize,
    size: usize,
    read_pos: usize,
    write_pos: usize,
}

unsafe impl Send for MboxRing {}

impl MboxRing {
    /// # Safety
    ///
    /// `buf` must point to `msg_size * capacity` bytes owned by the ring.
    pub unsafe fn from_raw(buf: *mut u8, msg_size: usize, capacity: usize) -> Self {
        Self {
            buf: unsafe { NonNull::new_unchecked(buf) },
            msg_size,
            capacity,
            size: 0,
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.size == self.capacity
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn slot(&self, pos: usize) -> *mut u8 {
        unsafe { self.buf.as_ptr().add(pos * self.msg_size) }
    }

    /// Copies one message in; the caller has checked `!is_full()`.
    fn push(&mut self, msg: &[u8]) {
        debug_assert!(!self.is_full());
        debug_assert_eq!(msg.len(), self.msg_size);
        unsafe {
            core::ptr::copy_nonoverlapping(msg.as_ptr(), self.slot(self.write_pos), self.msg_size)
        };
        self.write_pos = (self.write_pos + 1) % self.capacity;
        self.size += 1;
    }

    /// Copies one message out; the caller has checked `!is_empty()`.
    fn pop(&mut self, out: &mut [u8]) {
        debug_assert!(!self.is_empty());
        debug_assert_eq!(out.len(), self.msg_size);
        unsafe {
            core::ptr::copy_nonoverlapping(self.slot(self.read_pos), out.as_mut_ptr(), self.msg_size)
        };
        self.read_pos = (self.read_pos + 1) % self.capacity;
        self.size -= 1;
    }
}

struct MboxInner {
    ring: MboxRing,
    /// Cleared by `destroy`; every later operation fails with `Inval`.
    alive: bool,
    /// Page order backing the ring, for the final free.
    order: usize,
}

pub struct Mailbox {
    inner: Spinlock<MboxInner>,
    /// Senders sleeping on a full ring.
    senders: WaitChannel,
    /// Receivers sleeping on an empty ring.
    receivers: WaitChannel,
}

impl Mailbox {
    /// Allocates the ring and builds an empty mailbox.
    pub fn new(msg_size: usize, capacity: usize) -> Result<Mailbox> {
        if msg_size == 0 || capacity == 0 {
            return Err(KernelError::Inval);
        }
        let bytes = msg_size.checked_mul(capacity).ok_or(KernelError::Inval)?;
        let mut order = 0;
        while PGSIZE << order < bytes {
            order += 1;
            if order > ORDER_MAX {
                return Err(KernelError::TooBig);
            }
        }
        let page = kernel()
            .kmem()
            .lock()
            .alloc_order(order)
            .ok_or(KernelError::NoMem)?;
        let buf = page.into_usize() as *mut u8;

        Ok(Mailbox {
            inner: Spinlock::new(
                "mbox",
                MboxInner {
                    // SAFETY: the ring owns the page group allocated above.
                    ring: unsafe { MboxRing::from_raw(buf, msg_size, capacity) },
                    alive: true,
                    order,
                },
            ),
            senders: unsafe { WaitChannel::new() },
            receivers: unsafe { WaitChannel::new() },
        })
    }

    /// Initializes the wait lists. Call once, after the mailbox has reached
    /// its final location (the lists are address-based).
    pub fn init(&self) {
        self.senders.init();
        self.receivers.init();
    }

    /// Copies `msg` in without blocking, or fails with `Again` when full.
    pub fn try_send(&self, msg: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check(&inner, msg.len())?;
        if inner.ring.is_full() {
            return Err(KernelError::Again);
        }
        let was_empty = inner.ring.is_empty();
        inner.ring.push(msg);
        if was_empty {
            self.receivers.wakeup_one(0);
        }
        Ok(())
    }

    /// Sends, sleeping while the ring is full. `timeout` in ticks, 0 = none.
    pub fn timed_send(&self, msg: &[u8], timeout: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            self.check(&inner, msg.len())?;
            if !inner.ring.is_full() {
                let was_empty = inner.ring.is_empty();
                inner.ring.push(msg);
                if was_empty {
                    self.receivers.wakeup_one(0);
                }
                return Ok(());
            }
            let r = if timeout == 0 {
                self.senders.sleep(&mut inner)
            } else {
                self.senders.sleep_timeout(&mut inner, timeout)
            };
            if r != 0 {
                return Err(KernelError::from_sleep_result(r));
            }
        }
    }

    /// Receives one message without blocking, or fails with `Again`.
    pub fn try_receive(&self, out: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check(&inner, out.len())?;
        if inner.ring.is_empty() {
            return Err(KernelError::Again);
        }
        let was_full = inner.ring.is_full();
        inner.ring.pop(out);
        if was_full {
            self.senders.wakeup_one(0);
        }
        Ok(())
    }

    /// Receives, sleeping while the ring is empty. `timeout` in ticks.
    pub fn timed_receive(&self, out: &mut [u8], timeout: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            self.check(&inner, out.len())?;
            if !inner.ring.is_empty() {
                let was_full = inner.ring.is_full();
                inner.ring.pop(out);
                if was_full {
                    self.senders.wakeup_one(0);
                }
                return Ok(());
            }
            let r = if timeout == 0 {
                self.receivers.sleep(&mut inner)
            } else {
                self.receivers.sleep_timeout(&mut inner, timeout)
            };
            if r != 0 {
                return Err(KernelError::from_sleep_result(r));
            }
        }
    }

    /// Tears the mailbox down: wakes every waiter with `-EINVAL` and
    /// returns the ring pages. The mailbox stays dead afterwards.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return;
        }
        inner.alive = false;
        let buf = inner.ring.buf.as_ptr() as usize;
        let order = inner.order;
        self.senders.wakeup_all(KernelError::Inval.errno());
        self.receivers.wakeup_all(KernelError::Inval.errno());
        drop(inner);
        // SAFETY: allocated in `new`, owned by this mailbox, freed once.
        kernel()
            .kmem()
            .lock()
            .free(unsafe { Page::from_usize(buf, order) });
    }

    fn check(&self, inner: &MboxInner, len: usize) -> Result<()> {
        if !inner.alive || len != inner.ring.msg_size {
            return Err(KernelError::Inval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(msg_size: usize, capacity: usize) -> (MboxRing, std::vec::Vec<u8>) {
        let mut buf = std::vec![0u8; msg_size * capacity];
        let ring = unsafe { MboxRing::from_raw(buf.as_mut_ptr(), msg_size, capacity) };
        (ring, buf)
    }

    #[test]
    fn send_then_receive_round_trips_bytes() {
        let (mut r, _buf) = ring(4, 3);
        r.push(b"abcd");
        let mut out = [0u8; 4];
        r.pop(&mut out);
        assert_eq!(&out, b"abcd");
        assert!(r.is_empty());
        assert_eq!(r.read_pos, r.write_pos);
    }

    #[test]
    fn fill_and_drain_meets_the_cursor_law() {
        let (mut r, _buf) = ring(2, 3);
        for m in [b"aa", b"bb", b"cc"] {
            r.push(m);
        }
        assert!(r.is_full());
        let mut out = [0u8; 2];
        for expect in [b"aa", b"bb", b"cc"] {
            r.pop(&mut out);
            assert_eq!(&out, expect);
        }
        assert_eq!(r.size(), 0);
        assert_eq!(r.read_pos, r.write_pos);
    }

    #[test]
    fn wrap_around_preserves_fifo() {
        // Capacity 3: send A,B,C; receive A; send D; receive B,C,D.
        let (mut r, _buf) = ring(1, 3);
        r.push(b"A");
        r.push(b"B");
        r.push(b"C");
        let mut out = [0u8; 1];
        r.pop(&mut out);
        assert_eq!(&out, b"A");
        r.push(b"D");
        for expect in [b"B", b"C", b"D"] {
            r.pop(&mut out);
            assert_eq!(&out, expect);
        }
        // Both cursors wrapped exactly once.
        assert_eq!(r.read_pos, 1);
        assert_eq!(r.write_pos, 1);
        assert!(r.is_empty());
    }
}
