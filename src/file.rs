//! Open files.
//!
//! A `File` is a refcounted, pool-allocated object shared by every
//! descriptor that `dup` or `fork` produced from the same `open`; in
//! particular the read offset is shared. Refcounts and offsets are guarded
//! by the table lock.

use crate::bootfs::{self, RcInode};
use crate::console;
use crate::error::{KernelError, Result};
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::param::NFILE;
use crate::pool::Pool;

pub enum FileKind {
    /// The console device.
    Console,
    /// A bootfs inode; `dir` files serve `getdents`.
    Inode { inode: RcInode, dir: bool },
}

pub struct File {
    pub kind: FileKind,
    pub readable: bool,
    pub writable: bool,
    /// Byte offset for images, entry index for directories.
    off: usize,
    refs: u32,
}

pub struct FileTable {
    /// Guards every `File`'s refs and offset.
    lock: Spinlock<()>,
    pool: Pool<File>,
}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            lock: Spinlock::new("ftable", ()),
            pool: unsafe { Pool::new("file", None, None) },
        }
    }

    pub fn init(&'static self) {
        self.pool.init();
    }

    /// Allocates a file object with one reference.
    pub fn alloc(&self, kind: FileKind, readable: bool, writable: bool) -> Result<*mut File> {
        if self.pool.live() >= NFILE {
            return Err(KernelError::Again);
        }
        let f = self.pool.get(kernel().kmem())?;
        unsafe {
            // The old kind is garbage or a stale value without Drop glue.
            core::ptr::write(core::ptr::addr_of_mut!((*f).kind), kind);
            (*f).readable = readable;
            (*f).writable = writable;
            (*f).off = 0;
            (*f).refs = 1;
        }
        Ok(f)
    }

    /// Adds a reference for a new descriptor.
    pub fn dup(&self, f: *mut File) -> *mut File {
        let _guard = self.lock.lock();
        unsafe { (*f).refs += 1 };
        f
    }

    /// Drops one reference; the last close releases the inode and the
    /// object.
    pub fn close(&self, f: *mut File) {
        let guard = self.lock.lock();
        let gone = unsafe {
            (*f).refs -= 1;
            (*f).refs == 0
        };
        drop(guard);
        if gone {
            unsafe {
                if let FileKind::Inode { inode, .. } =
                    core::ptr::read(core::ptr::addr_of!((*f).kind))
                {
                    bootfs::get().iput(inode);
                }
            }
            self.pool.put(f);
        }
    }

    /// Reads from the shared offset into `dst`.
    pub fn read(&self, f: *mut File, dst: &mut [u8]) -> Result<usize> {
        let _guard = self.lock.lock();
        unsafe {
            if !(*f).readable {
                return Err(KernelError::BadFd);
            }
            match &(*f).kind {
                FileKind::Console => Err(KernelError::Inval),
                FileKind::Inode { dir: true, .. } => Err(KernelError::Inval),
                FileKind::Inode { inode, .. } => {
                    let data = bootfs::get().image(inode.ino())?;
                    let at = (*f).off.min(data.len());
                    let n = dst.len().min(data.len() - at);
                    dst[..n].copy_from_slice(&data[at..at + n]);
                    (*f).off += n;
                    Ok(n)
                }
            }
        }
    }

    /// Writes `src` at the file. Only the console is writable here; the
    /// boot filesystem is immutable.
    pub fn write(&self, f: *mut File, src: &[u8]) -> Result<usize> {
        unsafe {
            if !(*f).writable {
                return Err(KernelError::BadFd);
            }
            match &(*f).kind {
                FileKind::Console => {
                    console::write_bytes(src);
                    Ok(src.len())
                }
                FileKind::Inode { .. } => Err(KernelError::Inval),
            }
        }
    }

    /// Emits directory records into `buf` from the file's position.
    pub fn getdents(&self, f: *mut File, buf: &mut [u8]) -> Result<usize> {
        let _guard = self.lock.lock();
        unsafe {
            match &(*f).kind {
                FileKind::Inode { dir: true, .. } => {
                    let mut pos = (*f).off;
                    let n = bootfs::get().getdents(&mut pos, buf)?;
                    (*f).off = pos;
                    Ok(n)
                }
                _ => Err(KernelError::Inval),
            }
        }
    }
}
