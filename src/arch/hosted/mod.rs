//! Build-machine stand-in for the architecture layer.
//!
//! Lets the portable core be type-checked and unit tested on the development
//! host. There is exactly one pretend CPU; the interrupt flag is a process
//! global, context switching and user return are unreachable.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::interface::{Arch, ContextOps, TrapFrameOps};
use crate::error::Result;
use crate::kalloc::Kmem;
use crate::lock::Spinlock;
use crate::page::PGSIZE;

pub struct Hosted;

static INTR_ENABLED: AtomicBool = AtomicBool::new(false);

#[derive(Copy, Clone)]
#[repr(C)]
pub struct Context {
    pub pc: usize,
    pub sp: usize,
}

impl ContextOps for Context {
    const ZERO: Self = Self { pc: 0, sp: 0 };

    fn set_return_addr(&mut self, pc: usize) {
        self.pc = pc;
    }

    fn set_stack(&mut self, sp: usize) {
        self.sp = sp;
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
pub struct TrapFrame {
    pub r: [usize; 8],
    pub sp: usize,
    pub pc: usize,
}

impl TrapFrameOps for TrapFrame {
    const ZERO: Self = Self {
        r: [0; 8],
        sp: 0,
        pc: 0,
    };

    fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    fn set_sp(&mut self, sp: usize) {
        self.sp = sp;
    }

    fn set_ret(&mut self, val: usize) {
        self.r[0] = val;
    }

    fn arg(&self, n: usize) -> usize {
        self.r[n]
    }

    fn syscall_num(&self) -> usize {
        self.r[7]
    }

    fn init_user(&mut self) {
        *self = Self::ZERO;
    }
}

/// 1 MiB of pretend RAM so `kernel_main` type-checks end to end.
#[repr(align(32768))]
struct HostedRam([u8; 256 * PGSIZE]);
static mut HOSTED_RAM: HostedRam = HostedRam([0; 256 * PGSIZE]);

impl Arch for Hosted {
    type Context = Context;
    type TrapFrame = TrapFrame;

    fn cpu_id() -> usize {
        0
    }

    unsafe fn intr_on() {
        INTR_ENABLED.store(true, Ordering::SeqCst);
    }

    fn intr_off() {
        INTR_ENABLED.store(false, Ordering::SeqCst);
    }

    fn intr_get() -> bool {
        INTR_ENABLED.load(Ordering::SeqCst)
    }

    fn wait_for_interrupt() {
        core::hint::spin_loop();
    }

    unsafe fn context_switch(_old: *mut Context, _new: *mut Context) {
        unreachable!("context switch on the hosted target");
    }

    unsafe fn switch_address_space(_root: Option<usize>) {}

    unsafe fn return_to_user(_tf: *mut TrapFrame) -> ! {
        unreachable!("user mode on the hosted target");
    }

    unsafe fn intr_init() {}
    unsafe fn intr_init_core() {}

    fn irq_fetch() -> Option<usize> {
        None
    }

    fn irq_mask(_irq: usize) {}
    fn irq_unmask(_irq: usize) {}
    fn irq_eoi(_irq: usize) {}
    fn irq_setup(_irq: usize) {}

    const TIMER_IRQ: usize = 27;
    unsafe fn timer_init_core() {}
    fn timer_rearm() {}

    unsafe fn vm_init(_kmem: &Spinlock<Kmem>) {}
    unsafe fn vm_init_core() {}

    unsafe fn console_init() {}

    fn console_putc(_c: u8) {}

    fn ram_window() -> (usize, usize) {
        let base = unsafe { HOSTED_RAM.0.as_ptr() as usize };
        (base, base + unsafe { HOSTED_RAM.0.len() })
    }

    unsafe fn boot_secondaries() {}

    fn poweroff(_code: u16) -> ! {
        crate::utils::spin_forever()
    }
}

/// No-op stand-in for the hardware translation table.
pub struct UserTable;

impl UserTable {
    pub fn new(_kmem: &Spinlock<Kmem>) -> Result<Self> {
        Ok(Self)
    }

    pub fn root(&self) -> usize {
        0
    }

    pub fn map(
        &mut self,
        _va: usize,
        _pa: usize,
        _writable: bool,
        _kmem: &Spinlock<Kmem>,
    ) -> Result<()> {
        Ok(())
    }

    pub fn unmap(&mut self, _va: usize) {}

    pub fn free(self, _kmem: &Spinlock<Kmem>) {}
}
