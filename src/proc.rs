//! Processes: a user-visible job stacked on a single kernel task.
//!
//! A process owns its task, an address space, an open-file table, a cwd
//! reference, credentials, and its children. The parent→children direction
//! owns storage; child→parent is a weak back edge, valid only under the
//! process-tree lock and rewritten to point at init on reparenting.
//!
//! Lock map: the tree lock guards parent/children links, pgid, zombie and
//! exit_code; the PID hash has its own lock; everything a task does to its
//! *own* process (fd table, memory) needs no lock, processes being
//! single-threaded.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use array_macro::array;
use itertools::izip;

use crate::arch::{Arch, TargetArch, TrapFrameOps};
use crate::bootfs::{self, RcInode};
use crate::cpu;
use crate::error::{KernelError, Result};
use crate::file::File;
use crate::kernel::kernel;
use crate::list::{List, ListEntry};
use crate::list_node;
use crate::lock::Spinlock;
use crate::param::{NOFILE, NPIDBUCKET, PRIO_DEFAULT, WNOHANG};
use crate::println;
use crate::task::{self, Task};
use crate::vm::UserMemory;
use crate::wchan::WaitChannel;

pub type Pid = i32;

#[derive(Copy, Clone)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    pub umask: u32,
}

impl Cred {
    /// Fresh processes start as root with no umask.
    const ROOT: Cred = Cred {
        uid: 0,
        gid: 0,
        euid: 0,
        egid: 0,
        umask: 0,
    };
}

/// Tag selecting a `Process`'s PID-hash membership.
pub struct HashTag;

pub struct Process {
    /// Link in the parent's children list.
    pub sibling: ListEntry,
    /// Link in its PID-hash bucket.
    pub hash_link: ListEntry,

    pub task: *mut Task,
    pub mem: MaybeUninit<UserMemory>,

    pub files: [*mut File; NOFILE],
    pub cwd: Option<RcInode>,
    pub cred: Cred,

    pub pid: Pid,
    pub pgid: Pid,

    /// Weak back edge; read or written only under the tree lock.
    pub parent: *mut Process,
    pub children: List<Process>,

    pub zombie: bool,
    pub exit_code: i32,

    /// Where this process sleeps while waiting for its children.
    pub wait_q: WaitChannel,
}

list_node!(Process, sibling);
list_node!(Process, hash_link, HashTag);

unsafe impl Send for Process {}

pub fn process_ctor(p: *mut Process) {
    unsafe {
        (*p).sibling.init();
        (*p).hash_link.init();
        (*p).children.init();
        (*p).wait_q.init();
    }
}

/// Matches a `wait` PID selector against one child.
/// sel > 0: that exact PID; sel == 0: the caller's process group;
/// sel == -1: any child; sel < -1: process group `-sel`.
fn selector_matches(sel: Pid, pid: Pid, pgid: Pid, caller_pgid: Pid) -> bool {
    match sel {
        -1 => true,
        0 => pgid == caller_pgid,
        s if s > 0 => pid == s,
        s => pgid == -s,
    }
}

/// The process subsystem: PID allocation, the PID hash, the process tree.
pub struct Procs {
    next_pid: AtomicI32,
    /// Guards parent/children links, pgid, zombie, exit_code.
    tree: Spinlock<()>,
    /// Guards the hash buckets.
    hash: Spinlock<()>,
    buckets: [List<Process, HashTag>; NPIDBUCKET],
    /// The init process, once created.
    init_proc: AtomicUsize,
}

impl Procs {
    pub const fn new() -> Self {
        Self {
            next_pid: AtomicI32::new(1),
            tree: Spinlock::new("ptree", ()),
            hash: Spinlock::new("pid_hash", ()),
            buckets: array![_ => unsafe { List::new() }; NPIDBUCKET],
            init_proc: AtomicUsize::new(0),
        }
    }

    pub fn init(&self) {
        for b in self.buckets.iter() {
            b.init();
        }
    }

    fn allocpid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        assert!(pid < Pid::MAX, "pid overflow");
        pid
    }

    fn init_proc(&self) -> *mut Process {
        self.init_proc.load(Ordering::Acquire) as *mut Process
    }

    fn bucket(&self, pid: Pid) -> &List<Process, HashTag> {
        &self.buckets[pid as usize % NPIDBUCKET]
    }

    fn hash_insert(&self, p: *mut Process) {
        let _guard = self.hash.lock();
        unsafe { self.bucket((*p).pid).push_front(&*p) };
    }

    fn hash_remove(&self, p: *mut Process) {
        let _guard = self.hash.lock();
        unsafe { (*p).hash_link.remove() };
    }

    /// Finds a live process by PID.
    pub fn lookup(&self, pid: Pid) -> Option<*mut Process> {
        let _guard = self.hash.lock();
        // SAFETY: hashed processes are live while the hash lock is held.
        unsafe {
            for p in self.bucket(pid).iter_unchecked() {
                if p.pid == pid {
                    return Some(p as *const _ as *mut Process);
                }
            }
        }
        None
    }

    /// Allocates a process with a bound kernel task and a registered PID.
    /// The address space and image are still the caller's job.
    fn alloc(&self) -> Result<*mut Process> {
        let k = kernel();
        let p = k.proc_pool.get(k.kmem())?;
        unsafe {
            (*p).task = core::ptr::null_mut();
            (*p).files = [core::ptr::null_mut(); NOFILE];
            (*p).cwd = None;
            (*p).cred = Cred::ROOT;
            (*p).parent = core::ptr::null_mut();
            (*p).children.init();
            (*p).wait_q.init();
            (*p).zombie = false;
            (*p).exit_code = 0;

            let t = match task::new(p, user_task_entry, 0, PRIO_DEFAULT) {
                Ok(t) => t,
                Err(e) => {
                    k.proc_pool.put(p);
                    return Err(e);
                }
            };
            (*p).task = t;
            (*p).pid = self.allocpid();
            (*p).pgid = (*p).pid;
        }
        self.hash_insert(p);
        Ok(p)
    }

    /// Undoes `alloc` for a process whose task never ran.
    unsafe fn unwind_alloc(&self, p: *mut Process) {
        self.hash_remove(p);
        unsafe {
            if let Some(cwd) = (*p).cwd.take() {
                bootfs::get().iput(cwd);
            }
            // Suspended and never scheduled, so reaping directly is fine.
            task::reap((*p).task);
        }
        kernel().proc_pool.put(p);
    }

    /// Creates a process from an ELF image and resumes it: alloc, address
    /// space, load, trap-frame setup. Any failing step unwinds the ones
    /// before it. The very first process created becomes init.
    pub fn create(&self, image: &[u8]) -> Result<Pid> {
        let k = kernel();
        let p = self.alloc()?;
        let mut p = scopeguard::guard(p, |p| unsafe { self.unwind_alloc(p) });

        let mem = UserMemory::new(k.kmem())?;
        let mut mem = scopeguard::guard(mem, |m| m.free(k.kmem()));
        let entry = crate::exec::load_binary(&mut mem, image, k.kmem())?;

        unsafe {
            let t = (*(*p)).task;
            let tf = (*t).trap_frame;
            (*tf).init_user();
            (*tf).set_pc(entry as usize);
            (*tf).set_sp(crate::param::USTACK_TOP);

            let mem = scopeguard::ScopeGuard::into_inner(mem);
            (*t).vm_root = mem.table_root();
            (*(*p)).mem = MaybeUninit::new(mem);
            (*(*p)).cwd = Some(bootfs::get().iget(bootfs::ROOT_INO));
        }

        let p = scopeguard::ScopeGuard::into_inner(p);
        let pid = unsafe { (*p).pid };

        // The caller's process (if any) becomes the parent; the first
        // process ever created is init, the reparent target for orphans.
        let cur = current_process();
        if cur.is_null() {
            let prev = self.init_proc.swap(p as usize, Ordering::AcqRel);
            assert_eq!(prev, 0, "init created twice");
        } else {
            let _tree = self.tree.lock();
            unsafe {
                (*p).parent = cur;
                (*p).pgid = (*cur).pgid;
                (*cur).children.push_back(&*p);
            }
        }

        unsafe { task::resume((*p).task)? };
        Ok(pid)
    }

    /// Creates a child copying the caller: address space (copy-on-write),
    /// file descriptors, credentials, cwd, trap frame. The child's syscall
    /// returns 0, the parent's returns the child PID.
    pub fn fork(&self) -> Result<Pid> {
        let k = kernel();
        let parent = current_process();
        assert!(!parent.is_null(), "fork: no process");

        let child = self.alloc()?;
        let mut child = scopeguard::guard(child, |c| unsafe { self.unwind_alloc(c) });

        unsafe {
            // Clone the address space; parent pages become copy-on-write.
            let mem = (*parent).mem.assume_init_mut().clone_for_fork(k.kmem())?;

            let ct = (*(*child)).task;
            let pt = (*parent).task;
            *(*ct).trap_frame = *(*pt).trap_frame;
            // Fork returns 0 in the child.
            (*(*ct).trap_frame).set_ret(0);
            (*ct).vm_root = mem.table_root();
            (*(*child)).mem = MaybeUninit::new(mem);

            // Duplicate every open descriptor; offsets stay shared.
            for (cf, pf) in izip!((*(*child)).files.iter_mut(), (*parent).files.iter()) {
                if !pf.is_null() {
                    *cf = k.ftable.dup(*pf);
                }
            }

            (*(*child)).cred = (*parent).cred;
            if let Some(cwd) = (*parent).cwd.as_ref() {
                (*(*child)).cwd = Some(bootfs::get().idup(cwd));
            }
        }

        let child = scopeguard::ScopeGuard::into_inner(child);
        let pid = unsafe { (*child).pid };
        {
            let _tree = self.tree.lock();
            unsafe {
                (*child).parent = parent;
                (*child).pgid = (*parent).pgid;
                (*parent).children.push_back(&*child);
            }
        }

        unsafe { task::resume((*child).task)? };
        Ok(pid)
    }

    /// Exits the calling process: releases everything but the descriptor
    /// and exit code, hands children to init, wakes the parent, and never
    /// returns. An exited process stays a zombie until its parent waits.
    pub fn exit_current(&self, status: i32) -> ! {
        let k = kernel();
        let t = cpu::current_task();
        let p = unsafe { (*t).process };
        assert!(!p.is_null(), "exit: no process");
        assert!(p != self.init_proc(), "init exiting");

        self.hash_remove(p);

        unsafe {
            // Stop using the dying address space, then tear it down.
            TargetArch::switch_address_space(None);
            (*t).vm_root = 0;
            core::mem::replace(&mut (*p).mem, MaybeUninit::uninit())
                .assume_init()
                .free(k.kmem());

            // Close every open file.
            for f in (*p).files.iter_mut() {
                if !f.is_null() {
                    k.ftable.close(*f);
                    *f = core::ptr::null_mut();
                }
            }

            // Release the cwd.
            if let Some(cwd) = (*p).cwd.take() {
                bootfs::get().iput(cwd);
            }

            // Give all children to init; wake init if it already has a
            // zombie to reap.
            let tree = self.tree.lock();
            let init = self.init_proc();
            let mut orphan_zombie = false;
            while let Some(c) = (*p).children.pop_front() {
                let c = c as *mut Process;
                (*c).parent = init;
                (*init).children.push_back(&*c);
                if (*c).zombie {
                    orphan_zombie = true;
                }
            }
            if orphan_zombie {
                (*init).wait_q.wakeup_all(0);
            }

            (*p).zombie = true;
            (*p).exit_code = status;

            // Parent might be sleeping in wait().
            let parent = (*p).parent;
            if !parent.is_null() {
                (*parent).wait_q.wakeup_all(0);
            }
            drop(tree);
        }

        task::exit()
    }

    /// Waits for a child selected by `sel` to exit; reaps it and returns
    /// its PID and exit code. With `WNOHANG`, returns PID 0 instead of
    /// sleeping.
    pub fn wait(&self, sel: Pid, options: i32) -> Result<(Pid, i32)> {
        let me = current_process();
        assert!(!me.is_null(), "wait: no process");

        let mut tree = self.tree.lock();
        loop {
            let mut have_kids = false;
            let mut found: *mut Process = core::ptr::null_mut();
            unsafe {
                let my_pgid = (*me).pgid;
                for c in (*me).children.iter_unchecked() {
                    if selector_matches(sel, c.pid, c.pgid, my_pgid) {
                        have_kids = true;
                        if c.zombie {
                            found = c as *const _ as *mut Process;
                            break;
                        }
                    }
                }

                if !found.is_null() {
                    (*found).sibling.remove();
                    let pid = (*found).pid;
                    let status = (*found).exit_code;
                    drop(tree);
                    // Zombies hold nothing but their descriptor; the task
                    // was reclaimed by the scheduler at exit.
                    kernel().proc_pool.put(found);
                    return Ok((pid, status));
                }
            }

            // No point waiting without a matching child.
            if !have_kids {
                return Err(KernelError::NoChild);
            }
            if options & WNOHANG != 0 {
                return Ok((0, 0));
            }

            let r = unsafe { (*me).wait_q.sleep(&mut tree) };
            if r != 0 {
                return Err(KernelError::from_sleep_result(r));
            }
        }
    }
}

/// The process of the task running on this CPU, or null.
pub fn current_process() -> *mut Process {
    let t = cpu::current_task();
    if t.is_null() {
        core::ptr::null_mut()
    } else {
        unsafe { (*t).process }
    }
}

/// First entry of a process task: drop into user mode through the trap
/// frame prepared by create/fork.
fn user_task_entry(_arg: usize) {
    let t = cpu::current_task();
    unsafe { TargetArch::return_to_user((*t).trap_frame) }
}

/// File-descriptor helpers. The fd table is private to the process's own
/// task, so no lock is needed.
impl Process {
    pub fn fd_alloc(&mut self, f: *mut File) -> Result<usize> {
        for (fd, slot) in self.files.iter_mut().enumerate() {
            if slot.is_null() {
                *slot = f;
                return Ok(fd);
            }
        }
        Err(KernelError::TooBig)
    }

    pub fn fd_get(&self, fd: usize) -> Result<*mut File> {
        match self.files.get(fd) {
            Some(f) if !f.is_null() => Ok(*f),
            _ => Err(KernelError::BadFd),
        }
    }

    pub fn fd_take(&mut self, fd: usize) -> Result<*mut File> {
        let f = self.fd_get(fd)?;
        self.files[fd] = core::ptr::null_mut();
        Ok(f)
    }
}

/// A data abort arrived from user code: give the copy-on-write path a
/// chance, otherwise kill the process.
///
/// # Safety
///
/// Called from the arch trap path on the faulting task's stack.
pub unsafe fn handle_fault(_tf: *mut crate::arch::TrapFrame, addr: usize, status: usize) {
    let p = current_process();
    if p.is_null() {
        panic!("kernel fault at {:#x} (status {:#x})", addr, status);
    }
    let fixed = unsafe {
        (*p).mem
            .assume_init_mut()
            .handle_fault(addr, kernel().kmem())
    };
    if fixed.is_err() {
        unsafe {
            println!("pid {}: fault at {:#x}, killed", (*p).pid, addr);
        }
        kernel().procs.exit_current(KernelError::Inval.errno());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_semantics() {
        // Exact PID.
        assert!(selector_matches(7, 7, 3, 1));
        assert!(!selector_matches(7, 8, 3, 1));
        // Any child.
        assert!(selector_matches(-1, 42, 9, 1));
        // Caller's group.
        assert!(selector_matches(0, 5, 4, 4));
        assert!(!selector_matches(0, 5, 4, 2));
        // Explicit group.
        assert!(selector_matches(-4, 5, 4, 1));
        assert!(!selector_matches(-4, 5, 3, 1));
    }
}
