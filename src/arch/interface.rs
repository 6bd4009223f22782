//! The contract every supported architecture fulfills for the portable core.

use crate::kalloc::Kmem;
use crate::lock::Spinlock;

/// Saved callee-save register set. A task or a CPU's scheduler loop parks
/// here while something else runs.
pub trait ContextOps: Copy {
    const ZERO: Self;

    /// Where execution resumes on the first switch into this context.
    fn set_return_addr(&mut self, pc: usize);

    /// The stack the context runs on.
    fn set_stack(&mut self, sp: usize);
}

/// Register snapshot taken at the user/kernel boundary, kept at the top of a
/// task's kernel stack.
pub trait TrapFrameOps: Copy {
    const ZERO: Self;

    /// Entry point for the next return to user mode.
    fn set_pc(&mut self, pc: usize);

    /// User stack pointer.
    fn set_sp(&mut self, sp: usize);

    /// Value of the syscall-return register.
    fn set_ret(&mut self, val: usize);

    /// The `n`th syscall argument register.
    fn arg(&self, n: usize) -> usize;

    /// The syscall number register.
    fn syscall_num(&self) -> usize;

    /// Resets the frame for the first entry into a fresh user image:
    /// user mode, interrupts enabled, all general registers zero.
    fn init_user(&mut self);
}

pub trait Arch {
    type Context: ContextOps;
    type TrapFrame: TrapFrameOps;

    /// Which core is this?
    fn cpu_id() -> usize;

    /// Enable device interrupts on this core.
    ///
    /// # Safety
    ///
    /// The caller must not hold any spinlock.
    unsafe fn intr_on();

    /// Disable device interrupts on this core.
    fn intr_off();

    /// Are device interrupts enabled on this core?
    fn intr_get() -> bool;

    /// Idle until the next interrupt.
    fn wait_for_interrupt();

    /// Save the callee-saves into `old`, load them from `new`, continue there.
    ///
    /// # Safety
    ///
    /// Both pointers must refer to valid contexts; `new` must have been
    /// filled either by a previous switch or by task creation.
    unsafe fn context_switch(old: *mut Self::Context, new: *mut Self::Context);

    /// Activate the user translation table rooted at `root`, or the kernel's
    /// own mappings for `None`.
    ///
    /// # Safety
    ///
    /// `root` must be a live table that maps the current kernel text.
    unsafe fn switch_address_space(root: Option<usize>);

    /// Resume the user context recorded in `tf`. Does not return.
    ///
    /// # Safety
    ///
    /// `tf` must be the trap frame at the top of the current task's kernel
    /// stack, filled with a runnable user state.
    unsafe fn return_to_user(tf: *mut Self::TrapFrame) -> !;

    // Interrupt controller.
    unsafe fn intr_init();
    unsafe fn intr_init_core();

    /// Acknowledge and return the pending IRQ id, if any.
    fn irq_fetch() -> Option<usize>;
    fn irq_mask(irq: usize);
    fn irq_unmask(irq: usize);
    fn irq_eoi(irq: usize);
    /// Route `irq` to this core and enable it at the controller.
    fn irq_setup(irq: usize);

    /// The IRQ id of the per-core tick timer.
    const TIMER_IRQ: usize;
    unsafe fn timer_init_core();
    /// Re-arm the one-shot tick source from its handler.
    fn timer_rearm();

    /// Boot-core MMU bring-up: builds the kernel mappings and turns
    /// translation on.
    ///
    /// # Safety
    ///
    /// Call once, before any user address space exists.
    unsafe fn vm_init(kmem: &Spinlock<Kmem>);

    /// Secondary-core MMU bring-up.
    ///
    /// # Safety
    ///
    /// `vm_init` must have completed.
    unsafe fn vm_init_core();

    unsafe fn console_init();
    fn console_putc(c: u8);

    /// The RAM window available to the page allocator.
    fn ram_window() -> (usize, usize);

    /// Releases the secondary cores into the kernel entry point.
    ///
    /// # Safety
    ///
    /// Call once, from the boot core, when the kernel can take company.
    unsafe fn boot_secondaries();

    fn poweroff(code: u16) -> !;
}
