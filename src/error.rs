//! Error taxonomy
//!
//! Two tiers: recoverable API misuse returns a negative error code through
//! [`KernelResult`]; invariant breaches go through [`fatal`], which logs the
//! code and halts the machine.

use crate::port;

/// Kernel error codes. The integer values are stable and negative; `Ok(..)`
/// stands in for the 0 ("no error") code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(i32)]
pub enum KernelError {
    /// Generic failure
    Fail = -1,
    /// Object is busy (waiters present, owner alive, queue full)
    TaskBusy = -2,
    /// No task with the given id
    TaskNotFound = -3,
    /// Task cannot be cancelled (running, or the caller itself)
    TaskCantRemove = -4,
    /// Task cannot be suspended in its current state
    TaskCantSuspend = -5,
    /// Task is not suspended
    TaskCantResume = -6,
    /// Priority is not one of the eight named levels
    TaskInvalidPrio = -7,
    /// Semaphore/sync object protocol violation
    SemOperation = -8,
    /// Caller does not own the mutex
    NotOwner = -9,
    /// Timed wait expired
    Timeout = -10,
    /// Message queue is not empty
    MqNotEmpty = -11,
    /// Stack canary mismatch
    StackCheck = -12,
    /// Task stack allocation failed
    StackAlloc = -13,
    /// Task control block allocation failed
    TcbAlloc = -14,
    /// Kernel control block allocation failed
    KcbAlloc = -15,
    /// Scheduler found no ready task
    NoTasks = -16,
    /// Unclassified fatal error
    Unknown = -17,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Stable integer form of the code.
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Short human-readable description, used by the panic path.
    pub const fn description(self) -> &'static str {
        match self {
            KernelError::Fail => "general failure",
            KernelError::TaskBusy => "object busy",
            KernelError::TaskNotFound => "task not found",
            KernelError::TaskCantRemove => "task cannot be removed",
            KernelError::TaskCantSuspend => "task cannot be suspended",
            KernelError::TaskCantResume => "task cannot be resumed",
            KernelError::TaskInvalidPrio => "invalid task priority",
            KernelError::SemOperation => "sync object protocol violation",
            KernelError::NotOwner => "caller is not the owner",
            KernelError::Timeout => "operation timed out",
            KernelError::MqNotEmpty => "message queue not empty",
            KernelError::StackCheck => "stack corruption detected",
            KernelError::StackAlloc => "stack allocation failed",
            KernelError::TcbAlloc => "control block allocation failed",
            KernelError::KcbAlloc => "kernel state allocation failed",
            KernelError::NoTasks => "no task ready to run",
            KernelError::Unknown => "unknown error",
        }
    }
}

/// Halt the system with a coded reason.
///
/// Disables interrupts, emits the code and a short description over the
/// logging channel, and hands control to the platform halt. Never returns.
pub fn fatal(code: KernelError) -> ! {
    port::irq_disable();
    crate::error!(
        "KERNEL PANIC ({=i32}): {=str}",
        code.code(),
        code.description()
    );
    port::panic_halt()
}
