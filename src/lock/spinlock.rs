//! Spin locks.

use core::cell::Cell;
use core::hint::spin_loop;
use core::panic::Location;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use array_macro::array;

use super::RawLock;
use crate::cpu::{self, Cpu};
use crate::param::NLOCKPC;
use crate::println;

/// Mutual exclusion lock that busy waits (spin).
///
/// Acquiring disables interrupts on this CPU (nested, via `push_off`) before
/// spinning; recursive acquisition by the same CPU is a kernel bug and
/// panics, after dumping the remembered acquisition sites.
pub struct RawSpinlock {
    /// Name of lock, for diagnostics.
    name: &'static str,

    /// If the lock is held, the `Cpu` holding it. Otherwise null.
    locked: AtomicPtr<Cpu>,

    /// Ring of the last few acquisition sites.
    pcs: [Cell<Option<&'static Location<'static>>>; NLOCKPC],
    pc_next: Cell<usize>,
}

// The pcs ring is only written by the owner while the lock is held.
unsafe impl Sync for RawSpinlock {}

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicPtr::new(ptr::null_mut()),
            pcs: array![_ => Cell::new(None); NLOCKPC],
            pc_next: Cell::new(0),
        }
    }

    fn record_site(&self, loc: &'static Location<'static>) {
        let i = self.pc_next.get();
        self.pcs[i % NLOCKPC].set(Some(loc));
        self.pc_next.set(i.wrapping_add(1));
    }

    fn dump_sites(&self) {
        println!("lock {}: recent acquisition sites:", self.name);
        for cell in self.pcs.iter() {
            if let Some(loc) = cell.get() {
                println!("  {}:{}", loc.file(), loc.line());
            }
        }
    }
}

impl RawLock for RawSpinlock {
    /// Acquires the lock. Loops (spins) until the lock is acquired.
    ///
    /// An atomic exchange with `Acquire` ordering here pairs with the
    /// `Release` store in `release()`, so all stores done in one critical
    /// section are visible to the loads of the next one.
    #[track_caller]
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock with the IRQ path.
        unsafe { cpu::push_off() };
        if self.holding() {
            self.dump_sites();
            panic!("acquire {}", self.name);
        }

        while self
            .locked
            .compare_exchange(
                ptr::null_mut(),
                cpu::current_raw(),
                Ordering::Acquire,
                // Okay to use `Relaxed` ordering: on failure we never enter
                // the critical section.
                Ordering::Relaxed,
            )
            .is_err()
        {
            spin_loop();
        }

        self.record_site(Location::caller());
    }

    /// Releases the lock.
    fn release(&self) {
        if !self.holding() {
            self.dump_sites();
            panic!("release {}", self.name);
        }

        self.locked.store(ptr::null_mut(), Ordering::Release);
        unsafe { cpu::pop_off() };
    }

    /// Check whether this cpu is holding the lock.
    /// Interrupts must be off.
    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == cpu::current_raw()
    }
}
