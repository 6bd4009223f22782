//! The boot filesystem: program images linked into the kernel, presented as
//! one read-only root directory.
//!
//! This is the whole filesystem surface the task/process core needs: a cwd
//! handle to hold, images for `exec` to load, and a directory stream for
//! `ls` to read. Inode 0 is the root directory; image `i` is inode `i + 1`.

use arrayvec::{ArrayString, ArrayVec};
use spin::Once;
use zerocopy::AsBytes;

use crate::error::{KernelError, Result};
use crate::lock::Spinlock;
use crate::param::{MAXNAME, MAXPATH};

/// Images the root directory can hold.
pub const NIMAGE: usize = 15;

pub const ROOT_INO: u32 = 0;

#[derive(Copy, Clone)]
pub struct BootImage {
    pub name: &'static str,
    pub data: &'static [u8],
}

pub struct BootFs {
    images: ArrayVec<BootImage, NIMAGE>,
    /// Reference counts, indexed by inode number.
    refs: Spinlock<[u32; NIMAGE + 1]>,
}

/// A counted reference to a bootfs inode. Release with `BootFs::iput`;
/// deliberately neither `Copy` nor `Clone`.
pub struct RcInode {
    ino: u32,
}

impl RcInode {
    pub fn ino(&self) -> u32 {
        self.ino
    }
}

static BOOTFS: Once<BootFs> = Once::new();

pub fn init(images: ArrayVec<BootImage, NIMAGE>) {
    BOOTFS.call_once(|| BootFs {
        images,
        refs: Spinlock::new("bootfs", [0; NIMAGE + 1]),
    });
}

pub fn get() -> &'static BootFs {
    BOOTFS.get().expect("bootfs: not initialized")
}

impl BootFs {
    /// Resolves a path to an inode. Only the root directory exists, so every
    /// path is a name in it; `/` and the empty path are the root itself.
    pub fn lookup(&self, path: &str) -> Result<u32> {
        let name = path.trim_start_matches('/');
        if name.is_empty() {
            return Ok(ROOT_INO);
        }
        if name.contains('/') {
            return Err(KernelError::NoEnt);
        }
        for (i, img) in self.images.iter().enumerate() {
            if img.name == name {
                return Ok(i as u32 + 1);
            }
        }
        Err(KernelError::NoEnt)
    }

    pub fn is_dir(&self, ino: u32) -> bool {
        ino == ROOT_INO
    }

    /// The bytes of an image inode.
    pub fn image(&self, ino: u32) -> Result<&'static [u8]> {
        self.images
            .get(ino.wrapping_sub(1) as usize)
            .map(|img| img.data)
            .ok_or(KernelError::Inval)
    }

    /// Takes a counted reference to `ino`.
    pub fn iget(&self, ino: u32) -> RcInode {
        let mut refs = self.refs.lock();
        refs[ino as usize] += 1;
        RcInode { ino }
    }

    /// Takes another reference to the inode behind an existing one.
    pub fn idup(&self, inode: &RcInode) -> RcInode {
        self.iget(inode.ino)
    }

    /// Releases a counted reference.
    pub fn iput(&self, inode: RcInode) {
        let mut refs = self.refs.lock();
        let r = &mut refs[inode.ino as usize];
        assert!(*r > 0, "bootfs: iput without iget");
        *r -= 1;
    }

    pub fn refcount(&self, ino: u32) -> u32 {
        self.refs.lock()[ino as usize]
    }

    /// Emits directory records starting at entry index `*pos` into `buf`.
    /// Advances `*pos` past the emitted entries and returns the bytes
    /// written; 0 means end of directory.
    pub fn getdents(&self, pos: &mut usize, buf: &mut [u8]) -> Result<usize> {
        let mut w = DirentWriter::new(buf);
        // Entries: ".", "..", then one per image.
        let total = 2 + self.images.len();
        let mut emitted_any = false;
        while *pos < total {
            let (ino, name) = match *pos {
                0 => (ROOT_INO, "."),
                1 => (ROOT_INO, ".."),
                i => (i as u32 - 1, self.images[i - 2].name),
            };
            match w.push(ino, name) {
                Ok(()) => {
                    *pos += 1;
                    emitted_any = true;
                }
                Err(KernelError::TooBig) if emitted_any => break,
                Err(e) => return Err(e),
            }
        }
        Ok(w.written())
    }
}

/// Fixed header of a directory record; the name (NUL-terminated) follows,
/// and the whole record is padded to a 4-byte boundary.
#[derive(AsBytes)]
#[repr(C)]
pub struct Dirent {
    pub d_ino: u32,
    pub d_reclen: u16,
    pub d_namelen: u16,
}

/// Packs directory records into a caller-supplied buffer, refusing anything
/// that does not fit.
pub struct DirentWriter<'a> {
    buf: &'a mut [u8],
    off: usize,
}

impl<'a> DirentWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, off: 0 }
    }

    pub fn written(&self) -> usize {
        self.off
    }

    pub fn push(&mut self, ino: u32, name: &str) -> Result<()> {
        let name = name.as_bytes();
        if name.len() > MAXNAME {
            return Err(KernelError::TooBig);
        }
        let header = core::mem::size_of::<Dirent>();
        let reclen = (header + name.len() + 1 + 3) & !3;
        if self.off + reclen > self.buf.len() {
            return Err(KernelError::TooBig);
        }
        let rec = Dirent {
            d_ino: ino,
            d_reclen: reclen as u16,
            d_namelen: name.len() as u16,
        };
        self.buf[self.off..self.off + header].copy_from_slice(rec.as_bytes());
        let name_at = self.off + header;
        self.buf[name_at..name_at + name.len()].copy_from_slice(name);
        // NUL terminator and padding.
        for b in &mut self.buf[name_at + name.len()..self.off + reclen] {
            *b = 0;
        }
        self.off += reclen;
        Ok(())
    }
}

/// A bounded path builder. Components are appended with explicit overflow
/// reporting; nothing is ever silently truncated.
pub struct PathBuf {
    s: ArrayString<MAXPATH>,
}

impl PathBuf {
    pub fn root() -> Self {
        let mut s = ArrayString::new();
        s.push('/');
        Self { s }
    }

    pub fn from(base: &str) -> Result<Self> {
        let mut s = ArrayString::new();
        s.try_push_str(base).map_err(|_| KernelError::TooBig)?;
        Ok(Self { s })
    }

    /// Appends one component, inserting a separator as needed.
    pub fn push(&mut self, component: &str) -> Result<()> {
        if !self.s.ends_with('/') {
            self.s.try_push('/').map_err(|_| KernelError::TooBig)?;
        }
        self.s
            .try_push_str(component)
            .map_err(|_| KernelError::TooBig)
    }

    pub fn as_str(&self) -> &str {
        &self.s
    }
}

/// Turns a user-supplied path into an absolute one, rooted at `/` (the only
/// directory this filesystem has). Overflow is an error, never truncation.
pub fn absolutize(path: &str) -> Result<PathBuf> {
    if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        let mut p = PathBuf::root();
        if !path.is_empty() {
            p.push(path)?;
        }
        Ok(p)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        use crate::arch::arm_user_blob;

        /// The user programs the build linked into the kernel image.
        pub fn linked_images() -> ArrayVec<BootImage, NIMAGE> {
            let mut v = ArrayVec::new();
            v.push(BootImage { name: "init", data: arm_user_blob::init() });
            v.push(BootImage { name: "sh", data: arm_user_blob::sh() });
            v.push(BootImage { name: "ls", data: arm_user_blob::ls() });
            v
        }
    } else {
        /// A do-nothing ELF for hosted builds: one PT_LOAD page whose entry
        /// spins on a syscall-free loop (`b .`).
        #[rustfmt::skip]
        static HOSTED_INIT: [u8; 88] = [
            // ELF header: ELF32, LSB, exec, ARM, entry 0x10000, phoff 52.
            0x7f, b'E', b'L', b'F', 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            2, 0, 40, 0, 1, 0, 0, 0, 0x00, 0x00, 0x01, 0x00, 52, 0, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 0, 52, 0, 32, 0, 1, 0, 0, 0,
            0, 0, 0, 0,
            // Program header: PT_LOAD, off 84, va 0x10000, 4/4 bytes, RWX.
            1, 0, 0, 0, 84, 0, 0, 0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00,
            4, 0, 0, 0, 4, 0, 0, 0, 7, 0, 0, 0, 0x00, 0x10, 0, 0,
            // Payload: b . (0xeafffffe)
            0xfe, 0xff, 0xff, 0xea,
        ];

        pub fn linked_images() -> ArrayVec<BootImage, NIMAGE> {
            let mut v = ArrayVec::new();
            v.push(BootImage { name: "init", data: &HOSTED_INIT[..] });
            v
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryInto;

    #[test]
    fn dirent_records_are_aligned_and_sized() {
        let mut buf = [0u8; 64];
        let mut w = DirentWriter::new(&mut buf);
        w.push(1, "init").unwrap();
        w.push(2, "sh").unwrap();
        let n = w.written();
        assert_eq!(n % 4, 0);

        // Walk the stream back.
        let reclen = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        let namelen = u16::from_le_bytes([buf[6], buf[7]]) as usize;
        assert_eq!(namelen, 4);
        assert_eq!(&buf[8..12], b"init");
        assert_eq!(buf[8 + namelen], 0);
        let second = reclen;
        assert_eq!(u32::from_le_bytes(buf[second..second + 4].try_into().unwrap()), 2);
    }

    #[test]
    fn dirent_writer_refuses_overflow() {
        let mut buf = [0u8; 16];
        let mut w = DirentWriter::new(&mut buf);
        w.push(1, "ok").unwrap();
        assert_eq!(w.push(2, "does-not-fit"), Err(KernelError::TooBig));
        // The first record is still intact.
        assert!(w.written() > 0);
    }

    #[test]
    fn path_builder_reports_overflow() {
        let mut p = PathBuf::root();
        p.push("bin").unwrap();
        p.push("ls").unwrap();
        assert_eq!(p.as_str(), "/bin/ls");

        let long = "x".repeat(MAXPATH);
        assert_eq!(p.push(&long), Err(KernelError::TooBig));
        // Failed pushes leave the previous path usable.
        assert!(p.as_str().starts_with("/bin/ls"));

        assert!(PathBuf::from(&long).is_err());
    }

    #[test]
    fn absolutize_roots_relative_paths() {
        assert_eq!(absolutize("ls").unwrap().as_str(), "/ls");
        assert_eq!(absolutize("/init").unwrap().as_str(), "/init");
        assert_eq!(absolutize("").unwrap().as_str(), "/");
        assert!(absolutize(&"x".repeat(MAXPATH + 1)).is_err());
    }

    #[test]
    fn lookup_and_refcounts() {
        let fs = BootFs {
            images: linked_images(),
            refs: Spinlock::new("bootfs", [0; NIMAGE + 1]),
        };
        assert_eq!(fs.lookup("/"), Ok(ROOT_INO));
        assert_eq!(fs.lookup("init"), Ok(1));
        assert_eq!(fs.lookup("/init"), Ok(1));
        assert_eq!(fs.lookup("nope"), Err(KernelError::NoEnt));
        assert_eq!(fs.lookup("a/b"), Err(KernelError::NoEnt));

        let a = fs.iget(1);
        let b = fs.idup(&a);
        assert_eq!(fs.refcount(1), 2);
        fs.iput(a);
        fs.iput(b);
        assert_eq!(fs.refcount(1), 0);
    }

    #[test]
    fn getdents_streams_the_whole_directory() {
        let fs = BootFs {
            images: linked_images(),
            refs: Spinlock::new("bootfs", [0; NIMAGE + 1]),
        };
        // A buffer too small for everything forces a resumed stream.
        let mut pos = 0;
        let mut names = std::vec::Vec::new();
        loop {
            let mut buf = [0u8; 24];
            let n = fs.getdents(&mut pos, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            let mut at = 0;
            while at < n {
                let reclen = u16::from_le_bytes([buf[at + 4], buf[at + 5]]) as usize;
                let namelen = u16::from_le_bytes([buf[at + 6], buf[at + 7]]) as usize;
                names.push(
                    core::str::from_utf8(&buf[at + 8..at + 8 + namelen])
                        .unwrap()
                        .to_string(),
                );
                at += reclen;
            }
        }
        assert_eq!(names[0], ".");
        assert_eq!(names[1], "..");
        assert!(names.contains(&"init".to_string()));
    }
}
