//! Kernel error values.
//!
//! Fallible kernel routines return `Result<T>`; the syscall layer and the
//! sleep/wakeup protocol flatten errors into the small negative integers of
//! the POSIX taxonomy.

/// Errors a kernel operation can report to its caller.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum KernelError {
    /// No such file or directory.
    NoEnt,
    /// Argument list or record too long.
    TooBig,
    /// Bad file descriptor.
    BadFd,
    /// No child processes.
    NoChild,
    /// Operation would block.
    Again,
    /// Out of memory; callers must unwind.
    NoMem,
    /// Bad argument, malformed image, or destroyed object.
    Inval,
    /// Unknown system call.
    NoSys,
    /// A timed sleep expired.
    TimedOut,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl KernelError {
    /// The negative errno this error presents at the user ABI
    /// and in `sleep_result` slots.
    pub const fn errno(self) -> i32 {
        match self {
            KernelError::NoEnt => -2,
            KernelError::TooBig => -7,
            KernelError::BadFd => -9,
            KernelError::NoChild => -10,
            KernelError::Again => -11,
            KernelError::NoMem => -12,
            KernelError::Inval => -22,
            KernelError::NoSys => -38,
            KernelError::TimedOut => -110,
        }
    }

    /// Maps a nonzero `sleep_result` code back into an error.
    pub fn from_sleep_result(r: i32) -> KernelError {
        match r {
            -110 => KernelError::TimedOut,
            _ => KernelError::Inval,
        }
    }
}

/// Flattens a syscall result into the single register returned to user mode.
pub fn syscall_ret(r: Result<usize>) -> usize {
    match r {
        Ok(v) => v,
        Err(e) => e.errno() as isize as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_follow_posix() {
        assert_eq!(KernelError::NoMem.errno(), -12);
        assert_eq!(KernelError::Inval.errno(), -22);
        assert_eq!(KernelError::NoChild.errno(), -10);
        assert_eq!(KernelError::Again.errno(), -11);
        assert_eq!(KernelError::TimedOut.errno(), -110);
    }

    #[test]
    fn sleep_result_round_trips() {
        assert_eq!(
            KernelError::from_sleep_result(KernelError::TimedOut.errno()),
            KernelError::TimedOut
        );
        assert_eq!(
            KernelError::from_sleep_result(KernelError::Inval.errno()),
            KernelError::Inval
        );
    }

    #[test]
    fn syscall_ret_sign_extends() {
        assert_eq!(syscall_ret(Ok(7)), 7);
        assert_eq!(syscall_ret(Err(KernelError::BadFd)) as isize, -9);
    }
}
