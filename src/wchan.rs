//! Wait channels.
//!
//! A wait channel is a bare list of sleeping tasks: the condition-variable
//! surrogate everything above the scheduler sleeps on. No predicate is
//! stored; the caller retests its condition after waking.

use crate::kernel::kernel;
use crate::list::List;
use crate::lock::Waitable;
use crate::task::Task;

pub struct WaitChannel {
    waiters: List<Task>,
}

impl WaitChannel {
    /// # Safety
    ///
    /// Call `init` before use.
    pub const unsafe fn new() -> Self {
        Self {
            waiters: unsafe { List::new() },
        }
    }

    pub fn init(&self) {
        self.waiters.init();
    }

    /// Atomically releases the caller's lock and sleeps on this channel.
    /// Reacquires the lock when awakened; returns the waker's result code.
    pub fn sleep<W: Waitable>(&self, lk: &mut W) -> i32 {
        kernel().sched.sleep(Some(&self.waiters), lk, 0)
    }

    /// Like `sleep`, with a timeout in ticks. Returns `-ETIMEDOUT` if the
    /// timer fired first.
    pub fn sleep_timeout<W: Waitable>(&self, lk: &mut W, timeout: u64) -> i32 {
        kernel().sched.sleep(Some(&self.waiters), lk, timeout)
    }

    /// Wakes the highest-priority sleeper with `result`.
    /// Returns false if nobody was waiting.
    pub fn wakeup_one(&self, result: i32) -> bool {
        let sched = &kernel().sched;
        sched.acquire();
        let woke = unsafe { sched.wakeup_one(&self.waiters, result) };
        sched.unlock();
        woke
    }

    /// Wakes every sleeper with `result`.
    pub fn wakeup_all(&self, result: i32) {
        let sched = &kernel().sched;
        sched.acquire();
        unsafe { sched.wakeup_all(&self.waiters, result) };
        sched.unlock();
    }
}
