//! Saved register sets and the context switch primitive.

use core::arch::global_asm;

use crate::arch::interface::{ContextOps, TrapFrameOps};

/// Callee-save registers of a parked kernel thread.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Context {
    pub r4: usize,
    pub r5: usize,
    pub r6: usize,
    pub r7: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub sp: usize,
    pub lr: usize,
}

impl ContextOps for Context {
    const ZERO: Self = Self {
        r4: 0,
        r5: 0,
        r6: 0,
        r7: 0,
        r8: 0,
        r9: 0,
        r10: 0,
        r11: 0,
        sp: 0,
        lr: 0,
    };

    fn set_return_addr(&mut self, pc: usize) {
        self.lr = pc;
    }

    fn set_stack(&mut self, sp: usize) {
        self.sp = sp;
    }
}

// Save current callee-saves into *r0, load them from *r1, continue there.
// On first entry into a task, execution begins at whatever `lr` the creator
// stored: the task trampoline.
global_asm!(
    r#"
.section .text
.global swtch
swtch:
    stmia   r0, {{r4 - r11, sp, lr}}
    ldmia   r1, {{r4 - r11, sp, lr}}
    bx      lr
"#
);

extern "C" {
    pub fn swtch(old: *mut Context, new: *mut Context);
}

/// Register snapshot taken at the user/kernel boundary. The layout is fixed
/// by the entry/return assembly in `trap.rs`.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct TrapFrame {
    /// r0-r12.
    pub r: [usize; 13],
    /// User-mode sp.
    pub sp: usize,
    /// User-mode lr.
    pub lr: usize,
    /// Where the trap returns to.
    pub pc: usize,
    /// Saved program status.
    pub spsr: usize,
}

/// CPSR value for user mode with IRQs enabled.
const SPSR_USER: usize = 0x10;

impl TrapFrameOps for TrapFrame {
    const ZERO: Self = Self {
        r: [0; 13],
        sp: 0,
        lr: 0,
        pc: 0,
        spsr: 0,
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

    /// EABI convention: syscall number in r7.
    fn syscall_num(&self) -> usize {
        self.r[7]
    }

    fn init_user(&mut self) {
        *self = Self::ZERO;
        self.spsr = SPSR_USER;
    }
}
