//! ARMv7-A short-descriptor translation tables.
//!
//! The kernel runs identity-mapped out of a section-mapped template table;
//! every user table starts as a copy of that template and grows 4 KiB small
//! pages for user regions. One TTBR0 table per process, swapped on context
//! switch.

use core::sync::atomic::{AtomicUsize, Ordering};

use arrayvec::ArrayVec;

use super::asm;
use super::memlayout::{PHYSTOP, RAM_BASE};
use crate::error::{KernelError, Result};
use crate::kalloc::Kmem;
use crate::lock::Spinlock;
use crate::page::{Page, PGSIZE};

const L1_ENTRIES: usize = 4096;
const L2_ENTRIES: usize = 256;
/// L1 tables are 16 KiB: an order-2 page group.
pub const L1_ORDER: usize = 2;
/// L2 tables per user table; bounds the kernel memory a process can pin.
const NL2: usize = 64;

// Short descriptor encodings.
const L1_COARSE: usize = 0b01;
const L1_SECTION: usize = 0b10;
const L2_SMALL: usize = 0b10;
/// Cacheable, bufferable.
const CB: usize = 0b11 << 2;
const SECTION_CB: usize = 0b11 << 2;

/// AP[1:0]: privileged RW, user no access.
const AP_KERNEL: usize = 0b01;
/// AP[1:0]: privileged RW, user read-only.
const AP_USER_RO: usize = 0b10;
/// AP[1:0]: full access.
const AP_USER_RW: usize = 0b11;

static KERNEL_L1: AtomicUsize = AtomicUsize::new(0);

fn l1_section(pa: usize, ap: usize, cacheable: bool) -> usize {
    (pa & 0xfff0_0000) | (ap << 10) | if cacheable { SECTION_CB } else { 0 } | L1_SECTION
}

fn l2_small(pa: usize, ap: usize) -> usize {
    (pa & 0xffff_f000) | (ap << 4) | CB | L2_SMALL
}

/// Builds the kernel's identity-mapped template table and turns the MMU on.
///
/// # Safety
///
/// Call once on the boot core before any user table exists; secondary cores
/// only call `enable_core`.
pub unsafe fn init(kmem: &Spinlock<Kmem>) {
    let root = kmem
        .lock()
        .alloc_order(L1_ORDER)
        .expect("mmu: no memory for the kernel table")
        .into_usize();
    let l1 = root as *mut usize;
    for i in 0..L1_ENTRIES {
        let va = i << 20;
        let entry = if (RAM_BASE..PHYSTOP).contains(&va) {
            l1_section(va, AP_KERNEL, true)
        } else if va < RAM_BASE {
            // Device window: GIC, UART and friends. Strongly ordered.
            l1_section(va, AP_KERNEL, false)
        } else {
            0
        };
        unsafe { l1.add(i).write(entry) };
    }
    KERNEL_L1.store(root, Ordering::Release);
    unsafe { enable_core() };
}

/// Points this core at the kernel template and enables the MMU and caches.
///
/// # Safety
///
/// `init` must have run.
pub unsafe fn enable_core() {
    let root = KERNEL_L1.load(Ordering::Acquire);
    assert_ne!(root, 0, "mmu: template missing");
    unsafe {
        asm::set_ttbr0(root);
        asm::enable_mmu();
    }
}

pub fn kernel_root() -> usize {
    KERNEL_L1.load(Ordering::Acquire)
}

/// A per-process translation table.
pub struct UserTable {
    root: usize,
    l2_pages: ArrayVec<usize, NL2>,
}

impl UserTable {
    /// A fresh table that maps only the kernel.
    pub fn new(kmem: &Spinlock<Kmem>) -> Result<Self> {
        let root = kmem
            .lock()
            .alloc_order(L1_ORDER)
            .ok_or(KernelError::NoMem)?
            .into_usize();
        let template = kernel_root() as *const usize;
        let l1 = root as *mut usize;
        if !template.is_null() {
            for i in 0..L1_ENTRIES {
                unsafe { l1.add(i).write(template.add(i).read()) };
            }
        }
        Ok(Self {
            root,
            l2_pages: ArrayVec::new(),
        })
    }

    pub fn root(&self) -> usize {
        self.root
    }

    /// Installs a user mapping va -> pa.
    pub fn map(
        &mut self,
        va: usize,
        pa: usize,
        writable: bool,
        kmem: &Spinlock<Kmem>,
    ) -> Result<()> {
        let l1 = self.root as *mut usize;
        let l1i = va >> 20;
        let entry = unsafe { l1.add(l1i).read() };
        let l2_base = if entry & 0b11 == L1_COARSE {
            entry & 0xffff_fc00
        } else if entry == 0 {
            // A fresh page holds the 1 KiB coarse table; the rest is unused.
            if self.l2_pages.is_full() {
                return Err(KernelError::NoMem);
            }
            let page = kmem.lock().alloc().ok_or(KernelError::NoMem)?.into_usize();
            self.l2_pages.push(page);
            unsafe { l1.add(l1i).write((page & 0xffff_fc00) | L1_COARSE) };
            page
        } else {
            // Refusing to shadow a kernel section.
            return Err(KernelError::Inval);
        };

        let ap = if writable { AP_USER_RW } else { AP_USER_RO };
        let l2 = l2_base as *mut usize;
        let l2i = (va >> 12) & (L2_ENTRIES - 1);
        unsafe { l2.add(l2i).write(l2_small(pa, ap)) };
        asm::dsb();
        Ok(())
    }

    /// Drops the user mapping at `va`, if present.
    pub fn unmap(&mut self, va: usize) {
        let l1 = self.root as *mut usize;
        let entry = unsafe { l1.add(va >> 20).read() };
        if entry & 0b11 == L1_COARSE {
            let l2 = (entry & 0xffff_fc00) as *mut usize;
            unsafe { l2.add((va >> 12) & (L2_ENTRIES - 1)).write(0) };
            asm::dsb();
        }
    }

    /// Returns every page backing this table.
    pub fn free(self, kmem: &Spinlock<Kmem>) {
        let mut kmem = kmem.lock();
        for page in &self.l2_pages {
            // SAFETY: allocated in `map` and owned by this table.
            kmem.free(unsafe { Page::from_usize(*page, 0) });
        }
        // SAFETY: allocated in `new` and owned by this table.
        kmem.free(unsafe { Page::from_usize(self.root, L1_ORDER) });
    }
}

static_assertions::const_assert_eq!(L1_ENTRIES * core::mem::size_of::<u32>(), 4 * PGSIZE);
