//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion,
//! and traits that express their behaviors.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

mod spinlock;

pub use spinlock::RawSpinlock;

/// Locks that busy wait (spin).
pub type Spinlock<T> = Lock<RawSpinlock, T>;
/// Guards of `Spinlock<T>`.
pub type SpinlockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

/// The raw locking discipline under a `Lock`.
pub trait RawLock {
    #[track_caller]
    fn acquire(&self);
    fn release(&self);
    /// Check whether this cpu is holding the lock.
    fn holding(&self) -> bool;
}

/// Lock guards the scheduler's sleep protocol can temporarily release.
pub trait Waitable {
    /// Releases the underlying lock.
    ///
    /// # Safety
    ///
    /// Must be paired with `raw_acquire`; do not touch the protected data in
    /// between.
    unsafe fn raw_release(&mut self);

    /// Reacquires the underlying lock.
    ///
    /// # Safety
    ///
    /// Must be paired with a preceding `raw_release`.
    unsafe fn raw_acquire(&mut self);
}

/// A sleeper with nothing to release. Satisfies the sleep protocol for
/// callers that hold no lock of their own.
pub struct NoLock;

impl Waitable for NoLock {
    unsafe fn raw_release(&mut self) {}
    unsafe fn raw_acquire(&mut self) {}
}

/// A lock that owns its `RawLock` and the `data: T` it protects.
pub struct Lock<R, T> {
    lock: R,
    data: UnsafeCell<T>,
}

unsafe impl<R: RawLock, T: Send> Sync for Lock<R, T> {}

/// # Safety
///
/// While a `Guard` exists, its lock is held by this CPU.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
    _marker: PhantomData<*const ()>,
}

impl<R: RawLock, T> Lock<R, T> {
    /// Acquires the lock and returns the lock guard.
    #[track_caller]
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Returns a mutable pointer to the inner data.
    /// The caller must ensure that accessing the pointer does not incur race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns a mutable reference to the inner data.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Unlocks the lock.
    ///
    /// # Safety
    ///
    /// Use only when the lock was acquired but its guard was forgotten.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }

    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<T> Spinlock<T> {
    /// Returns a new `Spinlock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            data: UnsafeCell::new(data),
        }
    }
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock, runs `f`, and reacquires it.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }
}

impl<R: RawLock, T> Waitable for Guard<'_, R, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the lock is held and the guard is unique.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
