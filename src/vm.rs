//! Per-process user memory.
//!
//! An address space is a small set of typed regions, each spanning whole
//! pages. Every page is backed by a `Frame` with a share count: `clone`
//! (fork) makes both spaces reference the same frames write-protected, and
//! the first write through either side materializes a private copy. The
//! kernel reaches user memory through software translation here; the
//! hardware table is mirrored through `arch::UserTable`.

use arrayvec::ArrayVec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KernelError, Result};
use crate::kalloc::Kmem;
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::page::{pgrounddown, pgroundup, Page, PGSIZE};
use crate::param::{NREGION, NREGIONPAGE};

bitflags! {
    pub struct RegionPerm: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// A shared physical page. Lives in the frame pool; the last address space
/// to drop its reference frees the page.
pub struct Frame {
    pub page: usize,
    pub refs: AtomicU32,
    /// Write-protected because it is shared with another address space.
    pub cow: AtomicU32,
}

pub fn frame_ctor(f: *mut Frame) {
    unsafe {
        (*f).page = 0;
        (*f).refs = AtomicU32::new(0);
        (*f).cow = AtomicU32::new(0);
    }
}

struct Region {
    /// Page-aligned start address.
    start: usize,
    npages: usize,
    perm: RegionPerm,
    frames: ArrayVec<*mut Frame, NREGIONPAGE>,
}

impl Region {
    fn end(&self) -> usize {
        self.start + self.npages * PGSIZE
    }

    fn contains(&self, va: usize) -> bool {
        (self.start..self.end()).contains(&va)
    }
}

pub struct UserMemory {
    regions: ArrayVec<Region, NREGION>,
    table: crate::arch::UserTable,
}

// Regions hold raw frame pointers; sharing is mediated by atomic refcounts.
unsafe impl Send for UserMemory {}

impl UserMemory {
    /// An empty address space with a fresh translation table.
    pub fn new(kmem: &Spinlock<Kmem>) -> Result<Self> {
        Ok(Self {
            regions: ArrayVec::new(),
            table: crate::arch::UserTable::new(kmem)?,
        })
    }

    pub fn table_root(&self) -> usize {
        self.table.root()
    }

    /// Reserves `va..va+len` (page-rounded) with fresh zeroed pages.
    pub fn reserve(&mut self, va: usize, len: usize, perm: RegionPerm, kmem: &Spinlock<Kmem>) -> Result<()> {
        if len == 0 {
            return Err(KernelError::Inval);
        }
        let start = pgrounddown(va);
        let end = pgroundup(va.checked_add(len).ok_or(KernelError::Inval)?);
        let npages = (end - start) / PGSIZE;
        if npages > NREGIONPAGE {
            return Err(KernelError::TooBig);
        }
        if self.regions.is_full() {
            return Err(KernelError::NoMem);
        }
        for r in self.regions.iter() {
            if start < r.end() && r.start < end {
                return Err(KernelError::Inval);
            }
        }

        let mut region = Region {
            start,
            npages,
            perm,
            frames: ArrayVec::new(),
        };
        let writable = perm.contains(RegionPerm::WRITE);
        for i in 0..npages {
            let r = self.new_frame(kmem).and_then(|f| {
                region.frames.push(f);
                self.table
                    .map(start + i * PGSIZE, unsafe { (*f).page }, writable, kmem)
            });
            if let Err(e) = r {
                // Unwind the pages allocated so far.
                for f in region.frames.drain(..) {
                    unref_frame(f, kmem);
                }
                return Err(e);
            }
        }
        self.regions.push(region);
        Ok(())
    }

    fn new_frame(&mut self, kmem: &Spinlock<Kmem>) -> Result<*mut Frame> {
        let page = kmem.lock().alloc().ok_or(KernelError::NoMem)?;
        let f = match kernel().frame_pool.get(kmem) {
            Ok(f) => f,
            Err(e) => {
                kmem.lock().free(page);
                return Err(e);
            }
        };
        unsafe {
            (*f).page = page.into_usize();
            (*f).refs.store(1, Ordering::Relaxed);
            (*f).cow.store(0, Ordering::Relaxed);
        }
        Ok(f)
    }

    fn translate(&self, va: usize) -> Option<(usize, usize, usize)> {
        for (ri, r) in self.regions.iter().enumerate() {
            if r.contains(va) {
                let off = va - r.start;
                return Some((ri, off / PGSIZE, off % PGSIZE));
            }
        }
        None
    }

    /// Makes the page holding `va` privately writable, copying a shared
    /// frame if needed. This is the page-fault upgrade path.
    fn ensure_writable(&mut self, ri: usize, pi: usize, kmem: &Spinlock<Kmem>) -> Result<()> {
        let r = &self.regions[ri];
        if !r.perm.contains(RegionPerm::WRITE) {
            return Err(KernelError::Inval);
        }
        let va = r.start + pi * PGSIZE;
        let f = r.frames[pi];
        unsafe {
            if (*f).refs.load(Ordering::Acquire) == 1 {
                // Sole owner again; drop the write protection.
                if (*f).cow.swap(0, Ordering::Relaxed) != 0 {
                    self.table.map(va, (*f).page, true, kmem)?;
                }
                return Ok(());
            }

            // Shared: materialize a private copy.
            let nf = self.new_frame(kmem)?;
            core::ptr::copy_nonoverlapping(
                (*f).page as *const u8,
                (*nf).page as *mut u8,
                PGSIZE,
            );
            self.regions[ri].frames[pi] = nf;
            self.table.map(va, (*nf).page, true, kmem)?;
            unref_frame(f, kmem);
        }
        Ok(())
    }

    /// Copies `src` into user memory at `va`, materializing private pages
    /// along the way.
    pub fn copy_out(&mut self, va: usize, src: &[u8], kmem: &Spinlock<Kmem>) -> Result<()> {
        let mut done = 0;
        while done < src.len() {
            let (ri, pi, off) = self.translate(va + done).ok_or(KernelError::Inval)?;
            self.ensure_writable(ri, pi, kmem)?;
            let n = (PGSIZE - off).min(src.len() - done);
            let f = self.regions[ri].frames[pi];
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr().add(done),
                    ((*f).page + off) as *mut u8,
                    n,
                );
            }
            done += n;
        }
        Ok(())
    }

    /// Copies user memory at `va` into `dst`.
    pub fn copy_in(&self, va: usize, dst: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < dst.len() {
            let (ri, pi, off) = self.translate(va + done).ok_or(KernelError::Inval)?;
            let n = (PGSIZE - off).min(dst.len() - done);
            let f = self.regions[ri].frames[pi];
            unsafe {
                core::ptr::copy_nonoverlapping(
                    ((*f).page + off) as *const u8,
                    dst.as_mut_ptr().add(done),
                    n,
                );
            }
            done += n;
        }
        Ok(())
    }

    /// Copies a NUL-terminated user string into `buf`; returns its length
    /// (without the NUL). Fails with `TooBig` if `buf` fills up first.
    pub fn copy_in_str(&self, va: usize, buf: &mut [u8]) -> Result<usize> {
        for i in 0..buf.len() {
            let mut byte = [0u8; 1];
            self.copy_in(va + i, &mut byte)?;
            buf[i] = byte[0];
            if byte[0] == 0 {
                return Ok(i);
            }
        }
        Err(KernelError::TooBig)
    }

    /// Clones this address space for fork: both sides end up referencing the
    /// same frames, write-protected; writes later split them.
    pub fn clone_for_fork(&mut self, kmem: &Spinlock<Kmem>) -> Result<UserMemory> {
        let mut child = UserMemory::new(kmem)?;
        for r in self.regions.iter() {
            let mut cr = Region {
                start: r.start,
                npages: r.npages,
                perm: r.perm,
                frames: ArrayVec::new(),
            };
            let share_cow = r.perm.contains(RegionPerm::WRITE);
            for (i, &f) in r.frames.iter().enumerate() {
                let va = r.start + i * PGSIZE;
                unsafe {
                    let _ = (*f).refs.fetch_add(1, Ordering::AcqRel);
                    let mut res = Ok(());
                    if share_cow {
                        (*f).cow.store(1, Ordering::Relaxed);
                        // Downgrade the parent's mapping too.
                        res = self.table.map(va, (*f).page, false, kmem);
                    }
                    if res.is_ok() {
                        res = child.table.map(va, (*f).page, false, kmem);
                    }
                    if let Err(e) = res {
                        let _ = (*f).refs.fetch_sub(1, Ordering::AcqRel);
                        cr.frames.drain(..).for_each(|f| unref_frame(f, kmem));
                        child.free(kmem);
                        return Err(e);
                    }
                }
                cr.frames.push(f);
            }
            child.regions.push(cr);
        }
        Ok(child)
    }

    /// The hardware told us a user access faulted at `va`. Returns Ok if it
    /// was a write to a write-protected shared page that is now split.
    pub fn handle_fault(&mut self, va: usize, kmem: &Spinlock<Kmem>) -> Result<()> {
        let (ri, pi, _) = self.translate(va).ok_or(KernelError::Inval)?;
        self.ensure_writable(ri, pi, kmem)
    }

    /// Releases every frame and the translation table.
    pub fn free(mut self, kmem: &Spinlock<Kmem>) {
        for r in self.regions.drain(..) {
            for f in r.frames {
                unref_frame(f, kmem);
            }
        }
        self.table.free(kmem);
    }
}

/// Drops one reference; the last one frees the page and the frame.
fn unref_frame(f: *mut Frame, kmem: &Spinlock<Kmem>) {
    unsafe {
        if (*f).refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let page = (*f).page;
            kmem.lock().free(Page::from_usize(page, 0));
            kernel().frame_pool.put(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_kernel;

    fn mem(k: &'static crate::kernel::Kernel) -> UserMemory {
        UserMemory::new(k.kmem()).unwrap()
    }

    #[test]
    fn reserve_copy_round_trip() {
        let k = test_kernel();
        let mut m = mem(k);
        m.reserve(0x1000, 2 * PGSIZE, RegionPerm::READ | RegionPerm::WRITE, k.kmem())
            .unwrap();

        // Fresh pages read back zero.
        let mut buf = [0xffu8; 16];
        m.copy_in(0x1800, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);

        // Bytes written across a page boundary come back intact.
        let msg = b"hello across the boundary";
        m.copy_out(0x2000 - 8, msg, k.kmem()).unwrap();
        let mut back = [0u8; 25];
        m.copy_in(0x2000 - 8, &mut back).unwrap();
        assert_eq!(&back, msg);

        // Out-of-region access fails.
        assert!(m.copy_in(0x4000, &mut buf).is_err());
        m.free(k.kmem());
    }

    #[test]
    fn overlapping_reserve_is_rejected() {
        let k = test_kernel();
        let mut m = mem(k);
        m.reserve(0x1000, PGSIZE, RegionPerm::READ, k.kmem()).unwrap();
        assert_eq!(
            m.reserve(0x1800, PGSIZE, RegionPerm::READ, k.kmem()),
            Err(KernelError::Inval)
        );
        m.free(k.kmem());
    }

    #[test]
    fn fork_shares_then_splits_pages() {
        let k = test_kernel();
        let live_before = k.frame_pool.live();
        let mut parent = mem(k);
        parent
            .reserve(0x1000, PGSIZE, RegionPerm::READ | RegionPerm::WRITE, k.kmem())
            .unwrap();
        parent.copy_out(0x1100, b"shared", k.kmem()).unwrap();

        let mut child = parent.clone_for_fork(k.kmem()).unwrap();

        // Every readable byte matches right after the clone.
        let mut a = [0u8; 6];
        let mut b = [0u8; 6];
        parent.copy_in(0x1100, &mut a).unwrap();
        child.copy_in(0x1100, &mut b).unwrap();
        assert_eq!(a, b);
        // And it is the same physical frame.
        assert_eq!(parent.regions[0].frames[0], child.regions[0].frames[0]);

        // Writing different bytes from each side yields two distinct pages.
        parent.copy_out(0x1100, b"parent", k.kmem()).unwrap();
        child.copy_out(0x1100, b"child!", k.kmem()).unwrap();
        assert_ne!(parent.regions[0].frames[0], child.regions[0].frames[0]);
        parent.copy_in(0x1100, &mut a).unwrap();
        child.copy_in(0x1100, &mut b).unwrap();
        assert_eq!(&a, b"parent");
        assert_eq!(&b, b"child!");

        parent.free(k.kmem());
        child.free(k.kmem());
        // Every frame went back to the pool.
        assert_eq!(k.frame_pool.live(), live_before);
    }

    #[test]
    fn read_only_regions_refuse_writes() {
        let k = test_kernel();
        let mut m = mem(k);
        m.reserve(0x1000, PGSIZE, RegionPerm::READ, k.kmem()).unwrap();
        assert_eq!(
            m.copy_out(0x1000, b"x", k.kmem()),
            Err(KernelError::Inval)
        );
        m.free(k.kmem());
    }
}
