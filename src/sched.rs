//! The scheduler.
//!
//! Per-priority FIFO runqueues under one global scheduler spinlock. The lock
//! guards the queues, the sleep-timer list and every task's scheduling
//! fields. Each CPU runs `scheduler()` on a dedicated context; tasks switch
//! into that context whenever they yield.
//!
//! Preemption is delayed, not immediate: a wakeup that should preempt the
//! running task either switches right away (when the scheduler lock is the
//! outermost lock and we are not inside an interrupt handler) or sets the
//! task's RESCHEDULE flag, honored at the outermost scheduler unlock or at
//! interrupt exit, whichever comes first.

use array_macro::array;

use crate::arch::{Arch, TargetArch};
use crate::cpu;
use crate::error::KernelError;
use crate::list::List;
use crate::lock::{RawLock, RawSpinlock, Waitable};
use crate::param::NPRIO;
use crate::task::{self, Task, TaskFlags, TaskState, TimerTag};
use crate::timer;

pub struct Sched {
    lock: RawSpinlock,

    /// runqueue[p] holds the Ready tasks of priority p, FIFO.
    runqueue: [List<Task>; NPRIO],

    /// Sleeping tasks with an armed timeout, in no particular order.
    timers: List<Task, TimerTag>,
}

impl Sched {
    pub const fn new() -> Self {
        Self {
            lock: RawSpinlock::new("sched"),
            runqueue: array![_ => unsafe { List::new() }; NPRIO],
            timers: unsafe { List::new() },
        }
    }

    pub fn init(&self) {
        for q in self.runqueue.iter() {
            q.init();
        }
        self.timers.init();
    }

    #[track_caller]
    pub fn acquire(&self) {
        self.lock.acquire();
    }

    /// Releases the scheduler lock. At the outermost lock level, first
    /// honors a pending delayed preemption.
    pub fn unlock(&self) {
        let cpu = cpu::current_raw();
        unsafe {
            if (*cpu).noff == 1 && (*cpu).isr_depth == 0 {
                let cur = (*cpu).current;
                if !cur.is_null() && (*cur).flags.contains(TaskFlags::RESCHEDULE) {
                    (*cur).flags.remove(TaskFlags::RESCHEDULE);
                    self.enqueue(cur);
                    self.yield_to_scheduler();
                }
            }
        }
        self.lock.release();
    }

    /// Releases the scheduler lock without the preemption check.
    ///
    /// # Safety
    ///
    /// Only for paths that must not reschedule, such as the task trampoline.
    pub unsafe fn unlock_raw(&self) {
        self.lock.release();
    }

    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    /// Marks `t` Ready and appends it to its priority runqueue.
    ///
    /// # Safety
    ///
    /// The scheduler lock must be held; `t` must not be Running on any CPU
    /// and must be off every runqueue and wait list.
    pub unsafe fn enqueue(&self, t: *mut Task) {
        debug_assert!(self.holding(), "enqueue");
        unsafe {
            (*t).state = TaskState::Ready;
            (*t).cpu = core::ptr::null_mut();
            self.runqueue[(*t).prio as usize].push_back(&*t);
        }
    }

    /// Dequeues the highest-priority ready task.
    unsafe fn pick(&self) -> Option<*mut Task> {
        for q in self.runqueue.iter() {
            if let Some(t) = q.pop_front() {
                return Some(t as *mut Task);
            }
        }
        None
    }

    /// Switch to this CPU's scheduler context. The caller holds the
    /// scheduler lock, has already changed the task's state, and gets the
    /// lock back (possibly on another CPU) when the task next runs.
    ///
    /// Saves and restores `interrupt_enabled` because it is a property of
    /// this kernel thread, not of the CPU.
    ///
    /// # Safety
    ///
    /// Scheduler lock held, exactly once; current task's state already
    /// changed away from Running.
    pub unsafe fn yield_to_scheduler(&self) {
        let t = cpu::current_task();
        assert!(!t.is_null(), "yield: no task");
        assert!(self.holding(), "yield: lock");
        assert!(!TargetArch::intr_get(), "yield: interruptible");
        unsafe {
            let cpu = cpu::current_raw();
            assert_eq!((*cpu).noff, 1, "yield: locks held");
            assert_ne!((*t).state, TaskState::Running, "yield: running");

            let intena = (*cpu).interrupt_enabled;
            TargetArch::context_switch(&mut (*t).context, &mut (*cpu).context);
            // swtch may have moved this thread to another CPU.
            let cpu = cpu::current_raw();
            (*cpu).interrupt_enabled = intena;
        }
    }

    /// A task of priority `cand` just became Ready; preempt the running
    /// task if it is strictly lower priority. The switch happens now only
    /// when it is safe (no ISR nesting, scheduler lock outermost);
    /// otherwise it is recorded in RESCHEDULE.
    ///
    /// # Safety
    ///
    /// The scheduler lock must be held.
    pub unsafe fn may_yield(&self, cand: *const Task) {
        unsafe {
            let cpu = cpu::current_raw();
            let cur = (*cpu).current;
            if cur.is_null() || (*cand).prio >= (*cur).prio {
                return;
            }
            if (*cpu).isr_depth == 0 && (*cpu).noff == 1 {
                self.enqueue(cur);
                self.yield_to_scheduler();
            } else {
                (*cur).flags.insert(TaskFlags::RESCHEDULE);
            }
        }
    }

    /// The interrupt dispatcher calls this at the outermost ISR exit.
    pub fn isr_exit(&self) {
        let cur = cpu::current_task();
        if cur.is_null() {
            return;
        }
        // Unlocked peek: the flag is only set for this CPU's current task.
        if unsafe { !(*cur).flags.contains(TaskFlags::RESCHEDULE) } {
            return;
        }
        self.lock.acquire();
        unsafe {
            if (*cur).flags.contains(TaskFlags::RESCHEDULE) {
                (*cur).flags.remove(TaskFlags::RESCHEDULE);
                self.enqueue(cur);
                self.yield_to_scheduler();
            }
            self.unlock_raw();
        }
    }

    /// Atomically releases the caller's lock and sleeps, optionally on
    /// `queue` and optionally with a timeout in ticks (0 = none). The
    /// scheduler lock is taken before the caller's lock is released, so a
    /// wakeup racing with this sleep cannot be lost. Returns with the
    /// caller's lock reacquired, yielding the recorded sleep result:
    /// 0, or a negative errno such as timeout.
    pub fn sleep<W: Waitable>(&self, queue: Option<&List<Task>>, lk: &mut W, timeout: u64) -> i32 {
        self.lock.acquire();
        // SAFETY: reacquired below, after waking.
        unsafe { lk.raw_release() };

        let t = cpu::current_task();
        assert!(!t.is_null(), "sleep: no task");
        let r = unsafe {
            (*t).state = TaskState::Sleeping;
            (*t).sleep_result = 0;
            if let Some(q) = queue {
                q.push_back(&*t);
            }
            if timeout > 0 {
                (*t).deadline = timer::now() + timeout;
                self.timers.push_back(&*t);
            }

            self.yield_to_scheduler();

            // Awake again, scheduler lock held. Disarm the timer; the waker
            // already unlinked us from the wait list.
            if timeout > 0 {
                (*t).timer_link.remove();
                (*t).deadline = 0;
            }
            (*t).sleep_result
        };
        self.lock.release();
        // SAFETY: pairs with the release above.
        unsafe { lk.raw_acquire() };
        r
    }

    /// Wakes every task on `queue` with the given sleep result.
    ///
    /// # Safety
    ///
    /// The scheduler lock must be held.
    pub unsafe fn wakeup_all(&self, queue: &List<Task>, result: i32) {
        debug_assert!(self.holding(), "wakeup_all");
        while let Some(t) = queue.pop_front() {
            unsafe { self.wake_task(t as *mut Task, result) };
        }
    }

    /// Wakes the highest-priority sleeper on `queue` (FIFO among equals).
    /// Returns false if the queue was empty.
    ///
    /// # Safety
    ///
    /// The scheduler lock must be held.
    pub unsafe fn wakeup_one(&self, queue: &List<Task>, result: i32) -> bool {
        debug_assert!(self.holding(), "wakeup_one");
        let mut best: *const Task = core::ptr::null();
        unsafe {
            for t in queue.iter_unchecked() {
                if best.is_null() || t.prio < (*best).prio {
                    best = t;
                }
            }
            if best.is_null() {
                return false;
            }
            (*best).link.remove();
            self.wake_task(best as *mut Task, result);
        }
        true
    }

    unsafe fn wake_task(&self, t: *mut Task, result: i32) {
        unsafe {
            debug_assert_eq!((*t).state, TaskState::Sleeping, "wake_task");
            (*t).sleep_result = result;
            (*t).timer_link.remove();
            self.enqueue(t);
            self.may_yield(t);
        }
    }

    /// The timer interrupt advanced the clock: expire due sleep timers.
    /// Runs in ISR context, so preemption requests become RESCHEDULE.
    pub fn clock_tick(&self, now: u64) {
        self.lock.acquire();
        unsafe {
            self.timers.for_each(|t| {
                let t = t as *mut Task;
                if (*t).deadline <= now && (*t).state == TaskState::Sleeping {
                    (*t).timer_link.remove();
                    (*t).link.remove();
                    (*t).sleep_result = KernelError::TimedOut.errno();
                    self.enqueue(t);
                    self.may_yield(t);
                }
            });
        }
        self.unlock();
    }

    /// Per-CPU scheduler main loop; never returns. Picks the
    /// highest-priority ready task, loads its address space, runs it, and
    /// reclaims it if it came back Destroyed.
    ///
    /// # Safety
    ///
    /// Called exactly once per CPU, on the boot stack, after kernel init.
    pub unsafe fn scheduler(&self) -> ! {
        let cpu = cpu::current_raw();
        unsafe {
            (*cpu).current = core::ptr::null_mut();
            loop {
                // Devices must be able to interrupt while we look for work.
                TargetArch::intr_on();
                self.lock.acquire();
                match self.pick() {
                    None => {
                        self.lock.release();
                        TargetArch::wait_for_interrupt();
                    }
                    Some(t) => {
                        if (*t).vm_root != 0 {
                            TargetArch::switch_address_space(Some((*t).vm_root));
                        }
                        (*t).state = TaskState::Running;
                        (*t).cpu = cpu;
                        (*cpu).current = t;

                        TargetArch::context_switch(&mut (*cpu).context, &mut (*t).context);

                        // The task is done for now; it changed its state
                        // before switching back.
                        (*cpu).current = core::ptr::null_mut();
                        (*t).cpu = core::ptr::null_mut();
                        if (*t).vm_root != 0 {
                            TargetArch::switch_address_space(None);
                        }
                        let destroyed = (*t).state == TaskState::Destroyed;
                        self.lock.release();
                        if destroyed {
                            task::reap(t);
                        }
                    }
                }
            }
        }
    }
}
