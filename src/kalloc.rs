//! Physical page-frame allocator, for user pages, kernel stacks, slab page
//! groups and translation tables. Allocates whole 4096-byte pages, or
//! naturally-aligned contiguous groups of `1 << order` pages.
//!
//! Free memory is kept as a list of runs sorted by address; adjacent runs are
//! coalesced on free, and an order-`n` allocation carves an aligned block out
//! of the first run that can hold one.

use core::ptr;

use crate::page::{pgrounddown, pgroundup, Page, PGSIZE};
use crate::param::ORDER_MAX;

/// A run of free pages, stored in the pages themselves.
struct Run {
    npages: usize,
    next: *mut Run,
}

/// # Safety
///
/// - The list has no cycle and is sorted by ascending address.
/// - Every run covers `npages` pages of memory nothing else uses.
/// - Runs never touch: a run's end is strictly below the next run's start
///   (touching runs are coalesced).
pub struct Kmem {
    head: *mut Run,
}

// The raw list is only reached through a Spinlock<Kmem>.
unsafe impl Send for Kmem {}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// Donates the memory between `start` and `end` to the allocator.
    ///
    /// # Safety
    ///
    /// The range must be unused RAM, and must not overlap any range donated
    /// earlier.
    pub unsafe fn init(&mut self, start: usize, end: usize) {
        let pa_start = pgroundup(start);
        let pa_end = pgrounddown(end);
        for pa in num_iter::range_step(pa_start, pa_end, PGSIZE) {
            // SAFETY: pa is a page inside the donated range.
            self.free(unsafe { Page::from_usize(pa, 0) });
        }
    }

    /// Allocates one zeroed page.
    pub fn alloc(&mut self) -> Option<Page> {
        self.alloc_order(0)
    }

    /// Allocates a zeroed, naturally-aligned group of `1 << order` pages.
    pub fn alloc_order(&mut self, order: usize) -> Option<Page> {
        assert!(order <= ORDER_MAX, "alloc_order");
        let npages = 1 << order;
        let align = PGSIZE << order;

        let mut prevp: *mut *mut Run = &mut self.head;
        let mut r = self.head;
        while !r.is_null() {
            let base = r as usize;
            let run_pages = unsafe { (*r).npages };
            let aligned = (base + align - 1) & !(align - 1);
            let head_pages = (aligned - base) / PGSIZE;
            if head_pages + npages <= run_pages {
                let next = unsafe { (*r).next };
                let tail_pages = run_pages - head_pages - npages;

                // Rebuild the surrounding runs around the carved block.
                let mut link = next;
                if tail_pages > 0 {
                    let tail = (aligned + npages * PGSIZE) as *mut Run;
                    unsafe {
                        (*tail).npages = tail_pages;
                        (*tail).next = next;
                    }
                    link = tail;
                }
                if head_pages > 0 {
                    unsafe {
                        (*r).npages = head_pages;
                        (*r).next = link;
                    }
                } else {
                    unsafe { *prevp = link };
                }

                unsafe { ptr::write_bytes(aligned as *mut u8, 0, npages * PGSIZE) };
                // SAFETY: the carved block is aligned and no longer on the list.
                return Some(unsafe { Page::from_usize(aligned, order) });
            }
            prevp = unsafe { &mut (*r).next };
            r = unsafe { (*r).next };
        }
        None
    }

    /// Returns a page group to the allocator.
    pub fn free(&mut self, page: Page) {
        let npages = 1 << page.order();
        let base = page.into_usize();
        debug_assert_eq!(base % PGSIZE, 0, "Kmem::free");

        // Find the insertion point that keeps the list address-sorted.
        let mut prev: *mut Run = ptr::null_mut();
        let mut r = self.head;
        while !r.is_null() && (r as usize) < base {
            prev = r;
            r = unsafe { (*r).next };
        }

        let run = base as *mut Run;
        unsafe {
            (*run).npages = npages;
            (*run).next = r;
            if prev.is_null() {
                self.head = run;
            } else {
                (*prev).next = run;
            }

            // Coalesce with the successor, then with the predecessor.
            if !r.is_null() && base + (*run).npages * PGSIZE == r as usize {
                (*run).npages += (*r).npages;
                (*run).next = (*r).next;
            }
            if !prev.is_null() && prev as usize + (*prev).npages * PGSIZE == base {
                (*prev).npages += (*run).npages;
                (*prev).next = (*run).next;
            }
        }
    }

    /// Total free pages, for diagnostics.
    pub fn free_pages(&self) -> usize {
        let mut n = 0;
        let mut r = self.head;
        while !r.is_null() {
            n += unsafe { (*r).npages };
            r = unsafe { (*r).next };
        }
        n
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::alloc::{alloc, Layout};

    /// Leaks a page-aligned arena and returns its range.
    pub fn test_arena(npages: usize) -> (usize, usize) {
        let layout = Layout::from_size_align(npages * PGSIZE, PGSIZE << ORDER_MAX).unwrap();
        let p = unsafe { alloc(layout) } as usize;
        assert_ne!(p, 0);
        (p, p + npages * PGSIZE)
    }

    pub fn test_kmem(npages: usize) -> Kmem {
        let (start, end) = test_arena(npages);
        let mut kmem = Kmem::new();
        unsafe { kmem.init(start, end) };
        kmem
    }

    #[test]
    fn single_pages_cycle() {
        let mut kmem = test_kmem(8);
        assert_eq!(kmem.free_pages(), 8);
        let a = kmem.alloc().unwrap();
        let b = kmem.alloc().unwrap();
        assert_ne!(a.addr(), b.addr());
        assert!(a.as_slice().iter().all(|&c| c == 0));
        assert_eq!(kmem.free_pages(), 6);
        kmem.free(a);
        kmem.free(b);
        assert_eq!(kmem.free_pages(), 8);
    }

    #[test]
    fn order_allocations_are_aligned() {
        let mut kmem = test_kmem(16);
        let single = kmem.alloc().unwrap();
        let group = kmem.alloc_order(2).unwrap();
        assert_eq!(group.addr() % (PGSIZE << 2), 0);
        assert_eq!(group.len(), 4 * PGSIZE);
        kmem.free(single);
        kmem.free(group);
        assert_eq!(kmem.free_pages(), 16);
    }

    #[test]
    fn coalescing_rebuilds_large_runs() {
        let mut kmem = test_kmem(8);
        let pages: std::vec::Vec<Page> = (0..8).map(|_| kmem.alloc().unwrap()).collect();
        assert!(kmem.alloc().is_none());
        // Free in scrambled order; coalescing must rebuild one big run.
        for p in pages {
            kmem.free(p);
        }
        let big = kmem.alloc_order(2).unwrap();
        kmem.free(big);
        assert_eq!(kmem.free_pages(), 8);
    }
}
