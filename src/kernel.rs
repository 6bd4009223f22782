//! The kernel singleton and the boot path.

use core::fmt;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{Arch, TargetArch};
use crate::bootfs;
use crate::console::Printer;
use crate::cpu::{self, Cpus};
use crate::file::FileTable;
use crate::intr::{self, BottomHalf, IrqTable};
use crate::kalloc::Kmem;
use crate::lock::Spinlock;
use crate::pool::Pool;
use crate::println;
use crate::proc::{self, Process, Procs};
use crate::sched::Sched;
use crate::task::{self, Task};
use crate::timer;
use crate::vm::{self, Frame};

/// The kernel.
static mut KERNEL: Kernel = Kernel::zero();

/// After initialization the kernel is safe to access immutably from
/// anywhere.
#[inline]
pub fn kernel() -> &'static Kernel {
    unsafe { &KERNEL }
}

pub struct Kernel {
    panicked: AtomicBool,

    pub printer: Spinlock<Printer>,

    kmem: Spinlock<Kmem>,

    pub cpus: Cpus,

    pub sched: Sched,

    /// The process subsystem: PID hash and process tree.
    pub procs: Procs,

    pub ftable: FileTable,

    pub irqs: IrqTable,

    // Object pools backing the core structures.
    pub task_pool: Pool<Task>,
    pub proc_pool: Pool<Process>,
    pub frame_pool: Pool<Frame>,
    pub bh_pool: Pool<BottomHalf>,
}

impl Kernel {
    const fn zero() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            printer: Spinlock::new("println", Printer),
            kmem: Spinlock::new("kmem", Kmem::new()),
            cpus: Cpus::new(),
            sched: Sched::new(),
            procs: Procs::new(),
            ftable: FileTable::new(),
            irqs: IrqTable::new(),
            task_pool: unsafe { Pool::new("task", Some(task::task_ctor), None) },
            proc_pool: unsafe { Pool::new("proc", Some(proc::process_ctor), None) },
            frame_pool: unsafe { Pool::new("frame", Some(vm::frame_ctor), None) },
            bh_pool: unsafe { Pool::new("bh", Some(intr::bottom_half_ctor), None) },
        }
    }

    pub fn kmem(&self) -> &Spinlock<Kmem> {
        &self.kmem
    }

    pub fn set_panicked(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Prints the given formatted string with the printer. After a panic
    /// the lock is bypassed so a wedged CPU cannot block the report.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        use fmt::Write;
        if self.is_panicked() {
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            let mut printer = self.printer.lock();
            printer.write_fmt(args)
        }
    }
}

/// One-time initialization shared by the boot core and the hosted tests.
unsafe fn init_core_structures(k: &'static Kernel) {
    let (start, end) = TargetArch::ram_window();
    unsafe { k.kmem.lock().init(start, end) };

    k.sched.init();
    k.procs.init();
    k.task_pool.init();
    k.proc_pool.init();
    k.frame_pool.init();
    k.bh_pool.init();
    k.ftable.init();

    bootfs::init(bootfs::linked_images());
}

/// The boot assembly lands every CPU here, on its own boot stack.
///
/// # Safety
///
/// Called exactly once per CPU at boot.
#[no_mangle]
pub unsafe extern "C" fn kernel_main() -> ! {
    static STARTED: AtomicBool = AtomicBool::new(false);

    if cpu::cpuid() == 0 {
        let k = kernel();

        unsafe { TargetArch::console_init() };
        println!();
        println!("argon kernel is booting");
        println!();

        unsafe {
            init_core_structures(k);
            TargetArch::vm_init(k.kmem());
            TargetArch::intr_init();
            TargetArch::intr_init_core();
            timer::init_core();
        }
        timer::init().expect("timer irq");

        #[cfg(feature = "kern-test")]
        crate::ktest::spawn();

        // First user process.
        let init_image = bootfs::get()
            .lookup("init")
            .and_then(|ino| bootfs::get().image(ino))
            .expect("init image");
        let pid = k.procs.create(init_image).expect("create init");
        assert_eq!(pid, 1, "init must be pid 1");

        STARTED.store(true, Ordering::Release);
        unsafe { TargetArch::boot_secondaries() };
    } else {
        while !STARTED.load(Ordering::Acquire) {
            spin_loop();
        }
        println!("cpu {} starting", cpu::cpuid());
        unsafe {
            TargetArch::vm_init_core();
            TargetArch::intr_init_core();
            timer::init_core();
        }
    }

    unsafe { kernel().sched.scheduler() }
}

/// Hands the unit tests an initialized kernel on the hosted arch.
#[cfg(test)]
pub fn test_kernel() -> &'static Kernel {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe { init_core_structures(kernel()) });
    kernel()
}
