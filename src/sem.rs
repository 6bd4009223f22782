//! Counting semaphores.

use crate::error::{KernelError, Result};
use crate::lock::Spinlock;
use crate::wchan::WaitChannel;

pub struct Semaphore {
    count: Spinlock<usize>,
    waiters: WaitChannel,
}

impl Semaphore {
    /// # Safety
    ///
    /// Call `init` before use.
    pub const unsafe fn new(count: usize) -> Self {
        Self {
            count: Spinlock::new("sem", count),
            waiters: unsafe { WaitChannel::new() },
        }
    }

    pub fn init(&self) {
        self.waiters.init();
    }

    /// Resets the counter. Only for reinitializing a recycled semaphore
    /// that has no waiters.
    pub fn reset(&self, count: usize) {
        *self.count.lock() = count;
    }

    /// Takes one token, sleeping while the counter is zero. `timeout` is in
    /// ticks; 0 means wait forever. On timeout the counter is untouched and
    /// `TimedOut` is returned.
    pub fn get(&self, timeout: u64) -> Result<()> {
        let mut count = self.count.lock();
        loop {
            if *count > 0 {
                *count -= 1;
                return Ok(());
            }
            let r = if timeout == 0 {
                self.waiters.sleep(&mut count)
            } else {
                self.waiters.sleep_timeout(&mut count, timeout)
            };
            if r != 0 {
                return Err(KernelError::from_sleep_result(r));
            }
        }
    }

    /// Takes one token only if one is available right now.
    pub fn try_get(&self) -> Result<()> {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            Ok(())
        } else {
            Err(KernelError::Again)
        }
    }

    /// Posts one token; wakes one sleeper if the counter was zero.
    pub fn put(&self) {
        let mut count = self.count.lock();
        *count += 1;
        if *count == 1 {
            self.waiters.wakeup_one(0);
        }
    }
}
