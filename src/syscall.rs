//! The system call surface (ARM EABI: number in r7, arguments in r0-r3,
//! result in r0).

use crate::error::{syscall_ret, KernelError, Result};
use crate::file::FileKind;
use crate::kernel::kernel;
use crate::param::MAXPATH;
use crate::println;
use crate::proc::current_process;
use crate::arch::{TrapFrame, TrapFrameOps};
use crate::bootfs;
use crate::console;
use crate::lock::NoLock;

pub const SYS_EXIT: usize = 1;
pub const SYS_FORK: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_EXEC: usize = 4;
pub const SYS_CWRITE: usize = 5;
pub const SYS_GETPID: usize = 6;
pub const SYS_SLEEP: usize = 7;
pub const SYS_OPEN: usize = 8;
pub const SYS_CLOSE: usize = 9;
pub const SYS_DUP: usize = 10;
pub const SYS_READ: usize = 11;
pub const SYS_WRITE: usize = 12;
pub const SYS_GETDENTS: usize = 13;

/// Dispatches the trap frame's syscall and stores the result register.
///
/// # Safety
///
/// `tf` is the current task's trap frame.
pub unsafe fn syscall(tf: *mut TrapFrame) {
    let num = unsafe { (*tf).syscall_num() };
    let r = unsafe { dispatch(num, tf) };
    unsafe { (*tf).set_ret(syscall_ret(r)) };
}

unsafe fn dispatch(num: usize, tf: *mut TrapFrame) -> Result<usize> {
    let arg = |n| unsafe { (*tf).arg(n) };
    match num {
        SYS_EXIT => kernel().procs.exit_current(arg(0) as i32),
        SYS_FORK => kernel().procs.fork().map(|pid| pid as usize),
        SYS_WAIT => sys_wait(arg(0) as i32, arg(1), arg(2) as i32),
        SYS_EXEC => sys_exec(arg(0)),
        SYS_CWRITE => sys_cwrite(arg(0), arg(1)),
        SYS_GETPID => unsafe { Ok((*current_process()).pid as usize) },
        SYS_SLEEP => sys_sleep(arg(0) as u64),
        SYS_OPEN => sys_open(arg(0)),
        SYS_CLOSE => sys_close(arg(0)),
        SYS_DUP => sys_dup(arg(0)),
        SYS_READ => sys_read(arg(0), arg(1), arg(2)),
        SYS_WRITE => sys_write(arg(0), arg(1), arg(2)),
        SYS_GETDENTS => sys_getdents(arg(0), arg(1), arg(2)),
        _ => {
            println!("unknown sys call {}", num);
            Err(KernelError::NoSys)
        }
    }
}

/// Copies a NUL-terminated user string into `buf`.
fn fetch_str<'a>(va: usize, buf: &'a mut [u8]) -> Result<&'a str> {
    let p = current_process();
    let n = unsafe { (*p).mem.assume_init_ref().copy_in_str(va, buf)? };
    core::str::from_utf8(&buf[..n]).map_err(|_| KernelError::Inval)
}

fn sys_wait(pid: i32, status_va: usize, options: i32) -> Result<usize> {
    let (pid, status) = kernel().procs.wait(pid, options)?;
    if pid > 0 && status_va != 0 {
        let p = current_process();
        unsafe {
            (*p).mem.assume_init_mut().copy_out(
                status_va,
                &status.to_ne_bytes(),
                kernel().kmem(),
            )?;
        }
    }
    Ok(pid as usize)
}

fn sys_exec(path_va: usize) -> Result<usize> {
    let mut buf = [0u8; MAXPATH];
    let path = fetch_str(path_va, &mut buf)?;
    crate::exec::exec(path)
}

/// Console write: the user buffer goes out through the console device,
/// chunked through a kernel bounce buffer.
fn sys_cwrite(va: usize, n: usize) -> Result<usize> {
    let p = current_process();
    let mut done = 0;
    let mut chunk = [0u8; 64];
    while done < n {
        let len = chunk.len().min(n - done);
        unsafe {
            (*p).mem
                .assume_init_ref()
                .copy_in(va + done, &mut chunk[..len])?;
        }
        console::write_bytes(&chunk[..len]);
        done += len;
    }
    Ok(n)
}

fn sys_sleep(ticks: u64) -> Result<usize> {
    if ticks == 0 {
        return Ok(0);
    }
    // Sleeping on no queue: only the timer can wake us, and its firing is
    // the expected outcome, not an error.
    let r = kernel().sched.sleep(None, &mut NoLock, ticks);
    if r == KernelError::TimedOut.errno() || r == 0 {
        Ok(0)
    } else {
        Err(KernelError::from_sleep_result(r))
    }
}

fn sys_open(path_va: usize) -> Result<usize> {
    let mut buf = [0u8; MAXPATH];
    let path = bootfs::absolutize(fetch_str(path_va, &mut buf)?)?;
    let fs = bootfs::get();
    let ino = fs.lookup(path.as_str())?;
    let dir = fs.is_dir(ino);
    let f = kernel().ftable.alloc(
        FileKind::Inode {
            inode: fs.iget(ino),
            dir,
        },
        true,
        false,
    )?;
    let p = current_process();
    match unsafe { (*p).fd_alloc(f) } {
        Ok(fd) => Ok(fd),
        Err(e) => {
            kernel().ftable.close(f);
            Err(e)
        }
    }
}

fn sys_close(fd: usize) -> Result<usize> {
    let p = current_process();
    let f = unsafe { (*p).fd_take(fd)? };
    kernel().ftable.close(f);
    Ok(0)
}

fn sys_dup(fd: usize) -> Result<usize> {
    let p = current_process();
    unsafe {
        let f = (*p).fd_get(fd)?;
        let f = kernel().ftable.dup(f);
        match (*p).fd_alloc(f) {
            Ok(nfd) => Ok(nfd),
            Err(e) => {
                kernel().ftable.close(f);
                Err(e)
            }
        }
    }
}

fn sys_read(fd: usize, va: usize, n: usize) -> Result<usize> {
    let p = current_process();
    let f = unsafe { (*p).fd_get(fd)? };
    let mut done = 0;
    let mut chunk = [0u8; 64];
    while done < n {
        let want = chunk.len().min(n - done);
        let got = kernel().ftable.read(f, &mut chunk[..want])?;
        if got == 0 {
            break;
        }
        unsafe {
            (*p).mem
                .assume_init_mut()
                .copy_out(va + done, &chunk[..got], kernel().kmem())?;
        }
        done += got;
        if got < want {
            break;
        }
    }
    Ok(done)
}

fn sys_write(fd: usize, va: usize, n: usize) -> Result<usize> {
    let p = current_process();
    let f = unsafe { (*p).fd_get(fd)? };
    let mut done = 0;
    let mut chunk = [0u8; 64];
    while done < n {
        let len = chunk.len().min(n - done);
        unsafe {
            (*p).mem
                .assume_init_ref()
                .copy_in(va + done, &mut chunk[..len])?;
        }
        done += kernel().ftable.write(f, &chunk[..len])?;
    }
    Ok(done)
}

/// Fills the user buffer with directory records; returns the bytes
/// produced, 0 at end of directory.
fn sys_getdents(fd: usize, va: usize, n: usize) -> Result<usize> {
    let p = current_process();
    let f = unsafe { (*p).fd_get(fd)? };
    let mut chunk = [0u8; 256];
    let want = chunk.len().min(n);
    let got = kernel().ftable.getdents(f, &mut chunk[..want])?;
    unsafe {
        (*p).mem
            .assume_init_mut()
            .copy_out(va, &chunk[..got], kernel().kmem())?;
    }
    Ok(got)
}
