//! Interrupt dispatch.
//!
//! Hard-IRQ handlers run in ISR context with the line masked and EOI'd. A
//! handler returns whether the line should be unmasked right away; if not,
//! that duty passes to whoever finishes the work (for threaded handlers,
//! the bottom-half task).
//!
//! Threaded attachment creates the bottom-half task up front, parked on a
//! private semaphore. The hard-IRQ stub just posts the semaphore, so the
//! real handler runs as an ordinary kernel task and may take sleeps and
//! locks like anybody else.

use crate::arch::{Arch, TargetArch};
use crate::cpu;
use crate::error::{KernelError, Result};
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::param::{NBOTTOMHALF, NIRQ};
use crate::println;
use crate::sem::Semaphore;
use crate::task;

/// An interrupt handler: gets its attachment argument, returns true if the
/// line should be unmasked on return.
pub type IrqHandler = fn(usize) -> bool;

#[derive(Copy, Clone)]
enum IrqSlot {
    Free,
    /// Runs entirely in hard-IRQ context.
    Direct { handler: IrqHandler, arg: usize },
    /// Hard-IRQ stub posts the bottom half's semaphore.
    Threaded { bh: *mut BottomHalf },
}

// Slot pointers are only dereferenced while the table lock is held or from
// the bottom half that owns them.
unsafe impl Send for IrqSlot {}

/// State shared between a threaded handler's hard-IRQ stub and its task.
pub struct BottomHalf {
    sem: Semaphore,
    irq: usize,
    handler: IrqHandler,
    arg: usize,
}

pub fn bottom_half_ctor(bh: *mut BottomHalf) {
    unsafe {
        core::ptr::write(
            core::ptr::addr_of_mut!((*bh).sem),
            Semaphore::new(0),
        );
        (*bh).sem.init();
    }
}

pub struct IrqTable {
    slots: Spinlock<[IrqSlot; NIRQ]>,
}

impl IrqTable {
    pub const fn new() -> Self {
        Self {
            slots: Spinlock::new("irq", [IrqSlot::Free; NIRQ]),
        }
    }

    fn install(&self, irq: usize, slot: IrqSlot) -> Result<()> {
        if irq >= NIRQ {
            return Err(KernelError::Inval);
        }
        let mut slots = self.slots.lock();
        if !matches!(slots[irq], IrqSlot::Free) {
            return Err(KernelError::Again);
        }
        slots[irq] = slot;
        drop(slots);
        TargetArch::irq_setup(irq);
        Ok(())
    }
}

/// Installs a handler that runs entirely in hard-IRQ context.
pub fn attach(irq: usize, handler: IrqHandler, arg: usize) -> Result<()> {
    kernel().irqs.install(irq, IrqSlot::Direct { handler, arg })
}

/// Installs a threaded handler: the hard IRQ merely posts a semaphore and
/// leaves the line masked; a dedicated task of priority `prio` runs
/// `handler(arg)` and unmasks the line when the handler asks for it.
pub fn attach_thread(irq: usize, handler: IrqHandler, arg: usize, prio: u8) -> Result<()> {
    let k = kernel();
    if k.bh_pool.live() >= NBOTTOMHALF {
        return Err(KernelError::Again);
    }
    let bh = k.bh_pool.get(k.kmem())?;
    unsafe {
        (*bh).sem.reset(0);
        (*bh).irq = irq;
        (*bh).handler = handler;
        (*bh).arg = arg;
    }
    if let Err(e) = task::spawn(bottom_half_entry, bh as usize, prio) {
        k.bh_pool.put(bh);
        return Err(e);
    }
    if let Err(e) = k.irqs.install(irq, IrqSlot::Threaded { bh }) {
        // The parked task is leaked on this path; attach failures at boot
        // are fatal upstream anyway.
        return Err(e);
    }
    Ok(())
}

fn bottom_half_entry(arg: usize) {
    let bh = arg as *mut BottomHalf;
    loop {
        // SAFETY: the bottom half outlives its task; see attach_thread.
        unsafe {
            let _ = (*bh).sem.get(0);
            if ((*bh).handler)((*bh).arg) {
                TargetArch::irq_unmask((*bh).irq);
            }
        }
    }
}

/// The arch IRQ vector lands here. Reads the pending IRQ id, masks and
/// acknowledges the line, runs the installed handler, and performs the
/// delayed-preemption check when the outermost handler finishes.
///
/// # Safety
///
/// Called only from the arch trap path, with interrupts disabled.
pub unsafe fn dispatch() {
    let cpu = cpu::current_raw();
    unsafe { (*cpu).isr_depth += 1 };

    if let Some(irq) = TargetArch::irq_fetch() {
        TargetArch::irq_mask(irq);
        TargetArch::irq_eoi(irq);

        let slot = if irq < NIRQ {
            *kernel().irqs.slots.lock().get(irq).unwrap_or(&IrqSlot::Free)
        } else {
            IrqSlot::Free
        };
        match slot {
            IrqSlot::Direct { handler, arg } => {
                if handler(arg) {
                    TargetArch::irq_unmask(irq);
                }
            }
            IrqSlot::Threaded { bh } => {
                // Leave the line masked; the bottom half unmasks it.
                unsafe { (*bh).sem.put() };
            }
            IrqSlot::Free => {
                println!("spurious interrupt {}", irq);
            }
        }
    }

    unsafe {
        assert!((*cpu).isr_depth >= 1, "isr_exit: depth underflow");
        (*cpu).isr_depth -= 1;
        if (*cpu).isr_depth == 0 {
            kernel().sched.isr_exit();
        }
    }
}
