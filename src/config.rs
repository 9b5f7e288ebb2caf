//! Compile-time configuration
//!
//! These constants control the behavior and resource limits of the kernel.

use crate::types::Ticks;

/// System tick rate in Hz (one tick per hardware compare period).
pub const TICK_RATE_HZ: u32 = 1000;

/// Safety limit for scheduler iterations to prevent livelock.
pub const SCHED_ITER_MAX: usize = 500;

/// Minimum task stack size in bytes.
pub const MIN_STACK_SIZE: usize = 256;

/// Default task stack size in bytes (used for the idle task).
pub const DEFAULT_STACK_SIZE: usize = 4096;

/// Stack canary checking frequency - check every N context switches to
/// reduce overhead.
pub const STACK_CHECK_INTERVAL: u32 = 32;

/// Magic word written to both ends of a task's stack for corruption
/// detection.
pub const STACK_CANARY: u32 = 0x3333_3333;

/// Ceiling for a semaphore's token count; posts beyond it are absorbed.
pub const SEM_MAX_COUNT: i32 = 0x7FFF_FFFF;

/// Maximum software timers fired per tick; bounds ISR latency.
pub const TIMER_BATCH_MAX: usize = 8;

/// First software timer id; ids grow monotonically from here.
pub const TIMER_ID_BASE: u16 = 0x6000;

/// Convert a period in milliseconds to scheduler ticks.
#[inline]
pub const fn ms_to_ticks(ms: u32) -> Ticks {
    ((ms as u64 * TICK_RATE_HZ as u64) / 1000) as Ticks
}
