//! The per-core virtual generic timer, programmed as a one-shot tick source.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::asm;

/// Scheduler ticks per second.
const TICK_HZ: usize = 100;

static INTERVAL: AtomicUsize = AtomicUsize::new(0);

/// # Safety
///
/// Call once per core; the GIC must already route the timer PPI here.
pub unsafe fn init_core() {
    let interval = asm::cntfrq() / TICK_HZ;
    INTERVAL.store(interval, Ordering::Relaxed);
    asm::set_cntv_tval(interval);
    asm::set_cntv_ctl(1);
}

/// Writing TVAL clears the timer condition and schedules the next tick.
pub fn rearm() {
    asm::set_cntv_tval(INTERVAL.load(Ordering::Relaxed));
}
