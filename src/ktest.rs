//! In-kernel scenario tests (`kern-test` feature).
//!
//! Run as a kernel thread spawned before init, exercising the scheduler
//! paths that cannot run on the hosted build: real context switches,
//! preemption, blocking sleeps and timeouts.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::KernelError;
use crate::mbox::Mailbox;
use crate::println;
use crate::sem::Semaphore;
use crate::task;

static MARKER: AtomicUsize = AtomicUsize::new(0);

fn preempt_helper(arg: usize) {
    MARKER.store(arg, Ordering::SeqCst);
}

fn sem_put_helper(arg: usize) {
    let sem = arg as *const Semaphore;
    unsafe { (*sem).put() };
}

/// Spins (yielding) until `MARKER` becomes `want`.
fn await_marker(want: usize, what: &str) {
    let mut spins = 0u32;
    while MARKER.load(Ordering::SeqCst) != want {
        task::yield_now();
        spins += 1;
        assert!(spins < 1_000_000, "ktest: {} never ran", what);
    }
}

/// A task made Ready at strictly higher priority runs by the next scheduler
/// decision; a lower-priority one only once we stop hogging the CPU.
fn test_priority_preemption() {
    MARKER.store(0, Ordering::SeqCst);
    // Higher priority (5 < 10): resume preempts us right away.
    task::spawn(preempt_helper, 1, 5).expect("spawn");
    await_marker(1, "high-prio task");

    MARKER.store(0, Ordering::SeqCst);
    // Lower priority (20 > 10): runs after we sleep.
    task::spawn(preempt_helper, 2, 20).expect("spawn");
    let sem = unsafe { Semaphore::new(0) };
    sem.init();
    assert_eq!(sem.get(3), Err(KernelError::TimedOut));
    await_marker(2, "low-prio task");
    println!("ktest: priority preemption ok");
}

/// Rendezvous: get() blocks on a zero counter until put() posts a token,
/// and the token is consumed by the wakeup.
fn test_semaphore_rendezvous() {
    let sem = unsafe { Semaphore::new(0) };
    sem.init();
    // The helper is lower priority, so it only runs once we block.
    task::spawn(sem_put_helper, &sem as *const _ as usize, 20).expect("spawn");
    sem.get(0).expect("rendezvous");
    // The posted token is gone.
    assert_eq!(sem.try_get(), Err(KernelError::Again));
    println!("ktest: semaphore rendezvous ok");
}

/// A timed get on an empty semaphore comes back with a timeout, counter
/// untouched.
fn test_sleep_timeout() {
    let sem = unsafe { Semaphore::new(0) };
    sem.init();
    assert_eq!(sem.get(3), Err(KernelError::TimedOut));
    assert_eq!(sem.try_get(), Err(KernelError::Again));
    println!("ktest: sleep timeout ok");
}

fn mbox_producer(arg: usize) {
    let mbox = arg as *const Mailbox;
    unsafe {
        (*mbox).timed_send(b"D", 0).expect("send");
    }
}

/// The capacity-3 wrap-around sequence, with the last send coming from
/// another task while we block in receive.
fn test_mailbox_wraparound() {
    let mbox = Mailbox::new(1, 3).expect("mbox");
    mbox.init();
    for m in [b"A", b"B", b"C"] {
        mbox.try_send(m).expect("send");
    }
    assert_eq!(mbox.try_send(b"X"), Err(KernelError::Again));

    let mut out = [0u8; 1];
    mbox.try_receive(&mut out).expect("receive");
    assert_eq!(&out, b"A");

    task::spawn(mbox_producer, &mbox as *const _ as usize, 20).expect("spawn");
    for expect in [b"B", b"C", b"D"] {
        mbox.timed_receive(&mut out, 10).expect("receive");
        assert_eq!(&out, expect);
    }
    assert_eq!(mbox.try_receive(&mut out), Err(KernelError::Again));
    mbox.destroy();
    assert_eq!(mbox.try_send(b"X"), Err(KernelError::Inval));
    println!("ktest: mailbox wrap-around ok");
}

fn ktest_main(_arg: usize) {
    println!("ktest: starting");
    test_priority_preemption();
    test_semaphore_rendezvous();
    test_sleep_timeout();
    test_mailbox_wraparound();
    crate::pool::dump();
    println!("ktest: all tests passed");
}

pub fn spawn() {
    task::spawn(ktest_main, 0, crate::param::PRIO_DEFAULT - 6).expect("ktest spawn");
}
