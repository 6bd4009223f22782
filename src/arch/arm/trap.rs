//! Exception vectors and the kernel side of every trap.
//!
//! All exceptions funnel into SVC mode and build a `TrapFrame` on the
//! trapped task's kernel stack: r0-r12, banked user sp/lr, return pc, spsr
//! (the layout of `context::TrapFrame`).

use core::arch::global_asm;

use super::asm;
use super::context::TrapFrame;

global_asm!(
    r#"
.section .text
.align 5
.global vectors
vectors:
    b   .                       @ reset: never taken after boot
    b   bad_entry               @ undefined instruction
    b   svc_entry               @ supervisor call
    b   abort_entry             @ prefetch abort
    b   abort_entry             @ data abort
    b   .                       @ reserved
    b   irq_entry               @ IRQ
    b   .                       @ FIQ: unused

svc_entry:
    srsdb   sp!, #19            @ push return pc + spsr onto the SVC stack
    sub     sp, sp, #60
    stmia   sp, {{r0 - r12}}
    add     r0, sp, #52
    stmia   r0, {{sp, lr}}^     @ banked user sp/lr
    mov     r0, sp
    bl      svc_trap
    b       trap_return

irq_entry:
    sub     lr, lr, #4
    srsdb   sp!, #19            @ onto the SVC stack of the interrupted thread
    cps     #19
    sub     sp, sp, #60
    stmia   sp, {{r0 - r12}}
    add     r0, sp, #52
    stmia   r0, {{sp, lr}}^
    mov     r0, sp
    bl      irq_trap
    b       trap_return

abort_entry:
    sub     lr, lr, #8
    srsdb   sp!, #19
    cps     #19
    sub     sp, sp, #60
    stmia   sp, {{r0 - r12}}
    add     r0, sp, #52
    stmia   r0, {{sp, lr}}^
    mov     r0, sp
    bl      abort_trap
    b       trap_return

bad_entry:
    srsdb   sp!, #19
    cps     #19
    sub     sp, sp, #60
    stmia   sp, {{r0 - r12}}
    mov     r0, sp
    bl      bad_trap
    b       trap_return

.global trap_return
trap_return:
    cpsid   i                   @ no interrupts over the restore sequence
    add     r0, sp, #52
    ldmia   r0, {{sp, lr}}^     @ restore user sp/lr
    ldmia   sp, {{r0 - r12}}
    add     sp, sp, #60
    rfeia   sp!                 @ restore pc + cpsr

.global user_ret
user_ret:
    mov     sp, r0              @ sp = trap frame
    b       trap_return
"#
);

extern "C" {
    pub static vectors: [u8; 0];
    /// Resume the user context in the given trap frame. Does not return.
    pub fn user_ret(tf: *mut TrapFrame) -> !;
}

/// Installs the vector table on this core.
///
/// # Safety
///
/// Call once per core, before interrupts are enabled.
pub unsafe fn trap_init_core() {
    unsafe { asm::set_vbar(&vectors as *const _ as usize) };
}

#[no_mangle]
extern "C" fn svc_trap(tf: *mut TrapFrame) {
    unsafe { crate::syscall::syscall(tf as *mut crate::arch::TrapFrame) };
}

#[no_mangle]
extern "C" fn irq_trap(_tf: *mut TrapFrame) {
    unsafe { crate::intr::dispatch() };
}

#[no_mangle]
extern "C" fn abort_trap(tf: *mut TrapFrame) {
    let addr = asm::dfar();
    let status = asm::dfsr();
    unsafe { crate::proc::handle_fault(tf as *mut crate::arch::TrapFrame, addr, status) };
}

#[no_mangle]
extern "C" fn bad_trap(tf: *mut TrapFrame) {
    panic!("undefined instruction at {:#x}", unsafe { (*tf).pc });
}
