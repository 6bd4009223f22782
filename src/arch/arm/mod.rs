//! ARMv7-A (A32) support: QEMU `virt`, GIC v2, PL011, generic timer.

mod asm;
mod context;
mod gic;
pub mod memlayout;
mod start;
mod timer;
mod trap;
mod uart;
pub mod user_blob;
pub mod vm;

pub use vm::UserTable;

use crate::arch::interface::Arch;

pub struct Armv7;

impl Arch for Armv7 {
    type Context = context::Context;
    type TrapFrame = context::TrapFrame;

    fn cpu_id() -> usize {
        asm::cpu_id()
    }

    unsafe fn intr_on() {
        unsafe { asm::intr_on() };
    }

    fn intr_off() {
        asm::intr_off();
    }

    fn intr_get() -> bool {
        asm::intr_get()
    }

    fn wait_for_interrupt() {
        asm::wfi();
    }

    unsafe fn context_switch(old: *mut Self::Context, new: *mut Self::Context) {
        unsafe { context::swtch(old, new) };
    }

    unsafe fn switch_address_space(root: Option<usize>) {
        let root = root.unwrap_or_else(vm::kernel_root);
        unsafe { asm::set_ttbr0(root) };
    }

    unsafe fn return_to_user(tf: *mut Self::TrapFrame) -> ! {
        unsafe { trap::user_ret(tf) }
    }

    unsafe fn intr_init() {}

    unsafe fn intr_init_core() {
        unsafe { trap::trap_init_core() };
        gic::init();
    }

    fn irq_fetch() -> Option<usize> {
        gic::fetch()
    }

    fn irq_mask(irq: usize) {
        gic::mask(irq);
    }

    fn irq_unmask(irq: usize) {
        gic::unmask(irq);
    }

    fn irq_eoi(irq: usize) {
        gic::finish(irq);
    }

    fn irq_setup(irq: usize) {
        gic::setup(irq);
    }

    const TIMER_IRQ: usize = memlayout::TIMER0_IRQ;

    unsafe fn timer_init_core() {
        unsafe { timer::init_core() };
    }

    fn timer_rearm() {
        timer::rearm();
    }

    unsafe fn vm_init(kmem: &crate::lock::Spinlock<crate::kalloc::Kmem>) {
        unsafe { vm::init(kmem) };
    }

    unsafe fn vm_init_core() {
        unsafe { vm::enable_core() };
    }

    unsafe fn console_init() {
        unsafe { uart::init() };
    }

    fn console_putc(c: u8) {
        uart::putc(c);
    }

    fn ram_window() -> (usize, usize) {
        // SAFETY: taking the address of a linker symbol.
        let start = unsafe { memlayout::end.as_ptr() as usize };
        (start, memlayout::PHYSTOP)
    }

    unsafe fn boot_secondaries() {
        unsafe { start::boot_secondaries() };
    }

    fn poweroff(_code: u16) -> ! {
        asm::psci_system_off()
    }
}
