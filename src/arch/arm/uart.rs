//! PL011 serial console.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::{
    register_structs,
    registers::{ReadOnly, ReadWrite},
};

use super::memlayout::UART0;

register_structs! {
  #[allow(non_snake_case)]
  Pl011Block {
    (0x000 => DR: ReadWrite<u32>),
    (0x004 => _reserved_0),
    (0x018 => FR: ReadOnly<u32>),
    (0x01c => _reserved_1),
    (0x024 => IBRD: ReadWrite<u32>),
    (0x028 => FBRD: ReadWrite<u32>),
    (0x02c => LCRH: ReadWrite<u32>),
    (0x030 => CR: ReadWrite<u32>),
    (0x034 => _reserved_2),
    (0x038 => IMSC: ReadWrite<u32>),
    (0x03c => _reserved_3),
    (0x1000 => @END),
  }
}

/// Transmit FIFO full.
const FR_TXFF: u32 = 1 << 5;
/// 8 bit words, FIFOs on.
const LCRH_WLEN8_FEN: u32 = (0b11 << 5) | (1 << 4);
/// UART, TX and RX enable.
const CR_UARTEN_TXE_RXE: u32 = (1 << 0) | (1 << 8) | (1 << 9);

struct Pl011 {
    base_addr: usize,
}

impl core::ops::Deref for Pl011 {
    type Target = Pl011Block;

    fn deref(&self) -> &Self::Target {
        unsafe { &*(self.base_addr as *const Pl011Block) }
    }
}

static UART: Pl011 = Pl011 { base_addr: UART0 };

/// # Safety
///
/// Call once, before the first `putc`.
pub unsafe fn init() {
    UART.CR.set(0);
    UART.IMSC.set(0);
    UART.LCRH.set(LCRH_WLEN8_FEN);
    UART.CR.set(CR_UARTEN_TXE_RXE);
}

/// Spins until the transmit FIFO has room, then sends one byte.
pub fn putc(c: u8) {
    while UART.FR.get() & FR_TXFF != 0 {
        core::hint::spin_loop();
    }
    UART.DR.set(c as u32);
}
