/// Maximum number of CPUs.
pub const NCPU: usize = 4;

/// Number of scheduler priority levels. Smaller value = higher priority.
pub const NPRIO: usize = 32;

/// Priority assigned to freshly created user processes.
pub const PRIO_DEFAULT: u8 = 16;

/// Priority of interrupt bottom-half threads.
pub const PRIO_BOTTOM_HALF: u8 = 4;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Interrupt lines the dispatcher can route.
pub const NIRQ: usize = 64;

/// Threaded interrupt handlers per system.
pub const NBOTTOMHALF: usize = 16;

/// Buckets in the global PID hash.
pub const NPIDBUCKET: usize = 64;

/// Regions per user address space.
pub const NREGION: usize = 8;

/// Pages per user region.
pub const NREGIONPAGE: usize = 64;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Maximum length of a directory entry name.
pub const MAXNAME: usize = 60;

/// Acquisition sites remembered per spinlock.
pub const NLOCKPC: usize = 4;

/// Largest page-group order the allocators will request
/// (1 << ORDER_MAX pages in one contiguous group).
pub const ORDER_MAX: usize = 3;

/// Top of the user stack; the stack grows down from here.
pub const USTACK_TOP: usize = 0x8000_0000;

/// Pages reserved for the user stack.
pub const USTACK_PAGES: usize = 4;

/// wait() option: do not block if no child has exited yet.
pub const WNOHANG: i32 = 1;
