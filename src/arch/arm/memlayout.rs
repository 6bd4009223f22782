//! Physical memory layout of the QEMU `virt` machine (32-bit ARM).

/// GIC v2 distributor.
pub const GICD_BASE: usize = 0x0800_0000;

/// GIC v2 per-CPU interface.
pub const GICC_BASE: usize = 0x0801_0000;

/// PL011 UART registers.
pub const UART0: usize = 0x0900_0000;

/// RAM starts here; the kernel is linked at the bottom of it.
pub const RAM_BASE: usize = 0x4000_0000;

/// The kernel expects RAM for its own use up to here.
pub const PHYSTOP: usize = RAM_BASE + 128 * 1024 * 1024;

/// Virtual timer PPI.
pub const TIMER0_IRQ: usize = 27;

/// PL011 SPI.
pub const UART0_IRQ: usize = 32 + 1;

extern "C" {
    // First address after the kernel image. Defined by kernel.ld.
    pub static mut end: [u8; 0];
}
