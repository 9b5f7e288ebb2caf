//! kestrel — a preemptive RTOS kernel for 32-bit single-core RISC-V
//!
//! A small real-time kernel providing:
//! - Weighted round-robin scheduling (preemptive or cooperative) with an
//!   optional real-time scheduler hook
//! - Tick-driven delays and software timers
//! - Synchronization primitives (semaphores, mutexes, condition variables,
//!   message queues, byte pipes) with direct token-passing wakeup
//! - Context switching over a callee-saved register frame
//!
//! The kernel consumes a heap through the `GlobalAlloc` contract: the
//! application installs an allocator before calling [`kernel::run`].
//! Allocation never blocks; allocation failure while spawning a task is
//! fatal.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// ============ Critical Section ============

#[cfg(target_arch = "riscv32")]
mod cs_impl {
    use critical_section::{set_impl, Impl, RawRestoreState};

    struct SingleHartCriticalSection;
    set_impl!(SingleHartCriticalSection);

    unsafe impl Impl for SingleHartCriticalSection {
        unsafe fn acquire() -> RawRestoreState {
            let was_active = riscv::register::mstatus::read().mie();
            riscv::interrupt::disable();
            was_active
        }

        unsafe fn release(was_active: RawRestoreState) {
            if was_active {
                unsafe { riscv::interrupt::enable() }
            }
        }
    }
}

// ============ Modules ============

pub mod log;
mod lang_items;

pub mod config;
pub mod critical;
pub mod error;
pub mod kernel;
pub mod port;
mod sched;
pub mod sync;
pub mod task;
pub mod timer;
pub mod types;

// ============ Re-exports ============

pub use error::{KernelError, KernelResult};
pub use kernel::{run, set_rt_sched, tick_interrupt, ticks, uptime};
pub use sync::cond::Condvar;
pub use sync::mqueue::MessageQueue;
pub use sync::mutex::Mutex;
pub use sync::pipe::Pipe;
pub use sync::sem::Semaphore;
pub use task::{
    task_cancel, task_count, task_delay, task_id, task_idref, task_priority,
    task_resume, task_rt_priority, task_spawn, task_suspend, task_wfi,
    task_yield, TaskEntry,
};
pub use timer::{
    timer_cancel, timer_create, timer_destroy, timer_start, TimerCallback,
};
pub use types::{Priority, TaskId, TaskState, Ticks, TimerId, TimerMode};

// ============ Test support ============

/// Host tests share the global kernel state; they serialize on this lock and
/// re-run [`kernel::init`] before touching it.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static LOCK: Mutex<()> = Mutex::new(());

    pub fn kernel_guard() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
