//! Kernel tasks: the unit of CPU scheduling.
//!
//! A task owns a one-page kernel stack and a saved callee-save context. Its
//! scheduling fields (`state`, `flags`, list links, `sleep_result`, ...) are
//! all guarded by the scheduler lock and reached through raw pointers while
//! that lock is held.

use bitflags::bitflags;

use crate::arch::{Context, ContextOps, TrapFrame};
use crate::cpu::{self, Cpu};
use crate::error::{KernelError, Result};
use crate::kernel::kernel;
use crate::list::ListEntry;
use crate::list_node;
use crate::page::{Page, PGSIZE};
use crate::proc::Process;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TaskState {
    /// Created but not yet told to run.
    Suspended,
    /// Linked into its priority runqueue.
    Ready,
    /// Pointed to by exactly one CPU's `current`.
    Running,
    /// Parked on a wait list (or none, if only waiting for a timer).
    Sleeping,
    /// Finished; storage reclaimed by the next scheduler loop that sees it.
    Destroyed,
}

bitflags! {
    pub struct TaskFlags: u32 {
        /// A higher-priority task became ready while preemption was
        /// forbidden; reschedule at the next safe point.
        const RESCHEDULE = 1 << 0;
    }
}

/// Tag selecting the sleep-timer list membership of a `Task`.
pub struct TimerTag;

pub struct Task {
    /// Runqueue or wait-list link. On at most one such list at a time.
    pub link: ListEntry,
    /// Armed sleep-timer link, independent of `link`.
    pub timer_link: ListEntry,

    pub state: TaskState,
    pub flags: TaskFlags,
    /// Smaller value = higher priority.
    pub prio: u8,

    pub entry: fn(usize),
    pub arg: usize,

    /// Saved callee-save registers; swtch() here to run the task.
    pub context: Context,

    /// Bottom of the task's kernel stack page.
    pub kstack: usize,

    /// What the current or last sleep returned: 0 or a negative errno.
    pub sleep_result: i32,

    /// Tick at which an armed sleep times out.
    pub deadline: u64,

    /// The CPU this task runs on, while Running.
    pub cpu: *mut Cpu,

    /// The enclosing process, or null for bare kernel tasks.
    pub process: *mut Process,

    /// Root of the process translation table, or 0 for kernel tasks.
    pub vm_root: usize,

    /// User trap frame carved from the top of the kernel stack, or null.
    pub trap_frame: *mut TrapFrame,
}

list_node!(Task, link);
list_node!(Task, timer_link, TimerTag);

// Tasks move between CPUs; all shared fields are scheduler-lock guarded.
unsafe impl Send for Task {}

/// Pool constructor: runs once when a task object first enters the pool.
pub fn task_ctor(t: *mut Task) {
    unsafe {
        (*t).link.init();
        (*t).timer_link.init();
    }
}

/// Allocates a task and its kernel stack. The first resume lands in an
/// internal trampoline that releases the scheduler lock, enables interrupts,
/// calls `entry(arg)` and then exits. Initial state: Suspended.
pub fn new(process: *mut Process, entry: fn(usize), arg: usize, prio: u8) -> Result<*mut Task> {
    assert!((prio as usize) < crate::param::NPRIO, "task: bad priority");
    let k = kernel();
    let t = k.task_pool.get(k.kmem())?;
    let kstack = match k.kmem().lock().alloc() {
        Some(page) => page.into_usize(),
        None => {
            k.task_pool.put(t);
            return Err(KernelError::NoMem);
        }
    };

    unsafe {
        (*t).state = TaskState::Suspended;
        (*t).flags = TaskFlags::empty();
        (*t).prio = prio;
        (*t).entry = entry;
        (*t).arg = arg;
        (*t).kstack = kstack;
        (*t).sleep_result = 0;
        (*t).deadline = 0;
        (*t).cpu = core::ptr::null_mut();
        (*t).process = process;
        (*t).vm_root = 0;

        let mut sp = kstack + PGSIZE;
        if process.is_null() {
            (*t).trap_frame = core::ptr::null_mut();
        } else {
            sp -= core::mem::size_of::<TrapFrame>();
            (*t).trap_frame = sp as *mut TrapFrame;
            // The callee stack starts below the frame, ABI-aligned.
            sp &= !7;
        }

        (*t).context = Context::ZERO;
        (*t).context.set_stack(sp);
        (*t).context.set_return_addr(task_start as usize);
    }
    Ok(t)
}

/// Makes a Suspended task runnable; fails for any other state.
pub fn resume(t: *mut Task) -> Result<()> {
    let sched = &kernel().sched;
    sched.acquire();
    let r = unsafe {
        if (*t).state == TaskState::Suspended {
            sched.enqueue(t);
            sched.may_yield(t);
            Ok(())
        } else {
            Err(KernelError::Inval)
        }
    };
    sched.unlock();
    r
}

/// Creates and resumes a bare kernel task.
pub fn spawn(entry: fn(usize), arg: usize, prio: u8) -> Result<*mut Task> {
    let t = new(core::ptr::null_mut(), entry, arg, prio)?;
    resume(t)?;
    Ok(t)
}

/// Gives up the CPU to any other ready task, staying runnable.
pub fn yield_now() {
    let sched = &kernel().sched;
    sched.acquire();
    unsafe {
        let t = cpu::current_task();
        sched.enqueue(t);
        sched.yield_to_scheduler();
    }
    sched.unlock();
}

/// Terminates the calling task. The scheduler loop that observes the
/// Destroyed state frees the stack and the task object.
pub fn exit() -> ! {
    let sched = &kernel().sched;
    sched.acquire();
    unsafe {
        let t = cpu::current_task();
        (*t).state = TaskState::Destroyed;
        sched.yield_to_scheduler();
    }
    unreachable!("exit: destroyed task rescheduled");
}

/// Frees a Destroyed task's stack and object.
///
/// # Safety
///
/// The task must be Destroyed and no CPU may still be executing on its
/// stack; only the scheduler loop satisfies this, after switching away.
pub unsafe fn reap(t: *mut Task) {
    let k = kernel();
    unsafe {
        let kstack = (*t).kstack;
        k.kmem().lock().free(Page::from_usize(kstack, 0));
        k.task_pool.put(t);
    }
}

// The user trap frame is carved from the stack page; leave real room below.
static_assertions::const_assert!(core::mem::size_of::<TrapFrame>() <= PGSIZE / 8);

/// A new task's very first scheduling by swtch() lands here,
/// still holding the scheduler lock from the yielding side.
unsafe extern "C" fn task_start() {
    let sched = &kernel().sched;
    // Releasing the lock also re-enables interrupts (noff drops to zero).
    unsafe { sched.unlock_raw() };

    let t = cpu::current_task();
    let (entry, arg) = unsafe { ((*t).entry, (*t).arg) };
    entry(arg);
    exit();
}
