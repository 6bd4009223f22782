//! The system tick.
//!
//! The per-core hardware timer fires `TIMER_IRQ`; its handler advances the
//! global tick counter and lets the scheduler expire due sleep timers. Sleep
//! timeouts everywhere in the kernel are expressed in these ticks.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{Arch, TargetArch};
use crate::error::Result;
use crate::intr;
use crate::kernel::kernel;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
pub fn now() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

fn tick_handler(_arg: usize) -> bool {
    TargetArch::timer_rearm();
    // Every core's private timer lands here; only the boot core advances
    // the clock and expires sleepers.
    if crate::cpu::cpuid() == 0 {
        let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
        kernel().sched.clock_tick(now);
    }
    true
}

/// Routes the tick interrupt. Called once, from the boot CPU.
pub fn init() -> Result<()> {
    intr::attach(TargetArch::TIMER_IRQ, tick_handler, 0)
}

/// Per-core timer bring-up.
///
/// # Safety
///
/// Call once per core during boot.
pub unsafe fn init_core() {
    TargetArch::irq_setup(TargetArch::TIMER_IRQ);
    unsafe { TargetArch::timer_init_core() };
}
