//! ELF loading and image replacement.

use core::mem::MaybeUninit;

use crate::arch::{Arch, TargetArch, TrapFrameOps};
use crate::bootfs;
use crate::cpu;
use crate::elf::{read_struct, ElfHdr, ProgHdr};
use crate::error::{KernelError, Result};
use crate::kalloc::Kmem;
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::page::PGSIZE;
use crate::param::{USTACK_PAGES, USTACK_TOP};
use crate::proc::current_process;
use crate::vm::{RegionPerm, UserMemory};

/// Walks an ELF32 image and populates `mem`: every PT_LOAD segment is
/// reserved at `vaddr..vaddr+memsz` (the tail past `filesz` stays zero),
/// then the user stack is reserved under `USTACK_TOP`. Returns the entry
/// point.
pub fn load_binary(mem: &mut UserMemory, image: &[u8], kmem: &Spinlock<Kmem>) -> Result<u32> {
    let elf: ElfHdr = read_struct(image, 0)?;
    if !elf.is_valid() {
        return Err(KernelError::Inval);
    }
    if elf.phentsize as usize != core::mem::size_of::<ProgHdr>() {
        return Err(KernelError::Inval);
    }

    for i in 0..elf.phnum as usize {
        let off = elf.phoff as usize + i * elf.phentsize as usize;
        let ph: ProgHdr = read_struct(image, off)?;
        if !ph.is_prog_load() {
            continue;
        }
        if ph.filesz > ph.memsz {
            return Err(KernelError::Inval);
        }
        if ph.memsz == 0 {
            continue;
        }
        mem.reserve(
            ph.vaddr as usize,
            ph.memsz as usize,
            RegionPerm::READ | RegionPerm::WRITE | RegionPerm::EXEC,
            kmem,
        )?;
        let start = ph.off as usize;
        let end = start.checked_add(ph.filesz as usize).ok_or(KernelError::Inval)?;
        let src = image.get(start..end).ok_or(KernelError::Inval)?;
        mem.copy_out(ph.vaddr as usize, src, kmem)?;
    }

    mem.reserve(
        USTACK_TOP - USTACK_PAGES * PGSIZE,
        USTACK_PAGES * PGSIZE,
        RegionPerm::READ | RegionPerm::WRITE,
        kmem,
    )?;
    Ok(elf.entry)
}

/// Replaces the calling process's image with the named boot image. On any
/// failure the old image is untouched; on success the task re-enters user
/// mode at the new entry point with an empty stack and zeroed registers.
pub fn exec(path: &str) -> Result<usize> {
    let k = kernel();
    let p = current_process();
    assert!(!p.is_null(), "exec: no process");

    let fs = bootfs::get();
    let path = bootfs::absolutize(path)?;
    let ino = fs.lookup(path.as_str())?;
    if fs.is_dir(ino) {
        return Err(KernelError::Inval);
    }
    let image = fs.image(ino)?;

    let mem = UserMemory::new(k.kmem())?;
    let mut mem = scopeguard::guard(mem, |m| m.free(k.kmem()));
    let entry = load_binary(&mut mem, image, k.kmem())?;

    // Commit to the new image.
    unsafe {
        let t = cpu::current_task();
        let mem = scopeguard::ScopeGuard::into_inner(mem);

        let old = core::mem::replace(&mut (*p).mem, MaybeUninit::new(mem));
        let root = (*(*p).mem.as_ptr()).table_root();
        (*t).vm_root = root;
        TargetArch::switch_address_space(Some(root));
        old.assume_init().free(k.kmem());

        let tf = (*t).trap_frame;
        (*tf).init_user();
        (*tf).set_pc(entry as usize);
        (*tf).set_sp(USTACK_TOP);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::tests::make_image;
    use crate::kernel::test_kernel;

    #[test]
    fn load_binary_places_segments_and_stack() {
        let k = test_kernel();
        let image = make_image(0x11000, 0x2000, b"\xde\xad\xbe\xef");
        let mut mem = UserMemory::new(k.kmem()).unwrap();
        let entry = load_binary(&mut mem, &image, k.kmem()).unwrap();
        assert_eq!(entry, 0x11000);

        // filesz bytes copied, the rest of memsz implicitly zero.
        let mut buf = [0u8; 8];
        mem.copy_in(0x11000, &mut buf).unwrap();
        assert_eq!(&buf[..4], b"\xde\xad\xbe\xef");
        assert_eq!(&buf[4..], &[0; 4]);
        let mut tail = [0xaau8; 4];
        mem.copy_in(0x11000 + 0x1ff0, &mut tail).unwrap();
        assert_eq!(tail, [0; 4]);

        // The stack region exists and is writable.
        mem.copy_out(USTACK_TOP - 16, b"stack", k.kmem()).unwrap();

        mem.free(k.kmem());
    }

    #[test]
    fn load_binary_rejects_bad_images() {
        let k = test_kernel();

        // Bad magic.
        let mut image = make_image(0x11000, 0x1000, b"x");
        image[0] = 0;
        let mut mem = UserMemory::new(k.kmem()).unwrap();
        assert_eq!(
            load_binary(&mut mem, &image, k.kmem()),
            Err(KernelError::Inval)
        );
        mem.free(k.kmem());

        // filesz > memsz.
        let image = make_image(0x11000, 2, b"too big for memsz");
        let mut mem = UserMemory::new(k.kmem()).unwrap();
        assert_eq!(
            load_binary(&mut mem, &image, k.kmem()),
            Err(KernelError::Inval)
        );
        mem.free(k.kmem());

        // Truncated file contents.
        let mut image = make_image(0x11000, 0x1000, b"payload");
        image.truncate(image.len() - 3);
        let mut mem = UserMemory::new(k.kmem()).unwrap();
        assert_eq!(
            load_binary(&mut mem, &image, k.kmem()),
            Err(KernelError::Inval)
        );
        mem.free(k.kmem());
    }
}
