//! Per-CPU state.

use core::cell::UnsafeCell;

use array_macro::array;

use crate::arch::{Arch, Context, ContextOps, TargetArch};
use crate::kernel::kernel;
use crate::param::NCPU;
use crate::task::Task;

/// Per-CPU state.
///
/// Only the owning CPU touches its `Cpu`, and only with interrupts disabled,
/// which is why shared access through raw pointers is sound.
pub struct Cpu {
    /// swtch() here to enter the scheduler.
    pub context: Context,

    /// The task running on this cpu, or null.
    pub current: *mut Task,

    /// Depth of push_off() nesting.
    pub noff: u32,

    /// Were interrupts enabled before push_off()?
    pub interrupt_enabled: bool,

    /// How deep this CPU currently is in nested interrupt handlers.
    pub isr_depth: u32,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            context: Context::ZERO,
            current: core::ptr::null_mut(),
            noff: 0,
            interrupt_enabled: false,
            isr_depth: 0,
        }
    }
}

// Each CPU only accesses its own element; see `Cpu`.
pub struct Cpus([UnsafeCell<Cpu>; NCPU]);

unsafe impl Sync for Cpus {}

impl Cpus {
    pub const fn new() -> Self {
        Self(array![_ => UnsafeCell::new(Cpu::new()); NCPU])
    }

    /// Return this CPU's cpu struct.
    ///
    /// It is safe to call this with interrupts enabled, but the result may
    /// then refer to a CPU the caller has already migrated away from.
    pub fn current_raw(&self) -> *mut Cpu {
        self.0[cpuid()].get()
    }
}

/// Return this CPU's ID.
pub fn cpuid() -> usize {
    TargetArch::cpu_id()
}

/// Return this CPU's cpu struct.
pub fn current_raw() -> *mut Cpu {
    kernel().cpus.current_raw()
}

/// The task currently running on this CPU, or null from the scheduler loop.
pub fn current_task() -> *mut Task {
    unsafe { (*current_raw()).current }
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
pub unsafe fn push_off() {
    let old = TargetArch::intr_get();
    TargetArch::intr_off();

    let cpu = current_raw();
    unsafe {
        if (*cpu).noff == 0 {
            (*cpu).interrupt_enabled = old;
        }
        (*cpu).noff += 1;
    }
}

/// pop_off() should be paired with push_off().
pub unsafe fn pop_off() {
    assert!(!TargetArch::intr_get(), "pop_off: interruptible");
    let cpu = current_raw();
    unsafe {
        assert!((*cpu).noff >= 1, "pop_off");
        (*cpu).noff -= 1;
        if (*cpu).noff == 0 && (*cpu).interrupt_enabled {
            TargetArch::intr_on();
        }
    }
}
