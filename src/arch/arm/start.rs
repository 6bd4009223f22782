//! The very first instructions: one boot stack per core, then Rust.

use core::arch::global_asm;

use super::asm;
use crate::page::PGSIZE;
use crate::param::NCPU;

#[repr(align(4096))]
struct BootStacks([[u8; PGSIZE]; NCPU]);

/// Referenced from the boot assembly below.
#[no_mangle]
static mut BOOT_STACKS: BootStacks = BootStacks([[0; PGSIZE]; NCPU]);

// Every core enters here (core 0 from the loader, the others via PSCI
// CPU_ON): pick the per-core boot stack, mask interrupts, call kernel_main.
global_asm!(
    r#"
.section .text.boot
.global _start
_start:
    cpsid   if
    mrc     p15, 0, r0, c0, c0, 5   @ MPIDR
    and     r0, r0, #3
    add     r0, r0, #1
    ldr     r1, =BOOT_STACKS
    add     sp, r1, r0, lsl #12
    bl      kernel_main
1:  wfe
    b       1b
"#
);

extern "C" {
    fn _start();
}

/// Kicks the secondary cores into `_start` through PSCI.
///
/// # Safety
///
/// Call once, from core 0, after the kernel is ready for company.
pub unsafe fn boot_secondaries() {
    for core in 1..NCPU {
        unsafe { asm::psci_cpu_on(core, _start as usize) };
    }
}
