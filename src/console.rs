//! Console output and the panic path.

use core::fmt;

use crate::arch::{Arch, TargetArch};
use crate::kernel::kernel;

/// Sink for formatted kernel output; serialized by the kernel's printer
/// spinlock so concurrent printlns do not interleave.
pub struct Printer;

impl fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            TargetArch::console_putc(b);
        }
        Ok(())
    }
}

/// Raw console write for `sys_cwrite` and friends.
pub fn write_bytes(bytes: &[u8]) {
    let k = kernel();
    if k.is_panicked() {
        for &b in bytes {
            TargetArch::console_putc(b);
        }
        return;
    }
    let _printer = k.printer.lock();
    for &b in bytes {
        TargetArch::console_putc(b);
    }
}

/// print! macro prints to the console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        let _ = $crate::kernel::kernel().printer_write_fmt(format_args!($($arg)*));
    }};
}

/// println! macro prints to the console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Handles panic: freeze the other CPUs' printing, report, halt.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    kernel().set_panicked();
    println!("{}", info);
    crate::utils::spin_forever()
}
