//! Global kernel state and boot sequence
//!
//! The kernel control block is a process-wide singleton guarded by the
//! interrupt-masking critical section; word-sized counters that are read
//! without the lock (the tick counter, the running flag) live in a separate
//! block of atomics.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use alloc::vec::Vec;

use crate::config::DEFAULT_STACK_SIZE;
use crate::critical::{critical_section, CsCell};
use crate::error::{fatal, KernelError};
use crate::port;
use crate::sched;
use crate::task::{self, TaskTable};
use crate::timer;
use crate::types::{Priority, TaskId, TaskState, Ticks, TimerId};

/// Optional real-time scheduler hook. Returning a task id bypasses the
/// round-robin selection. The hook runs with the kernel locked and must not
/// call back into the kernel API.
pub type RtSchedHook = fn() -> Option<TaskId>;

// ============ Lock-free kernel flags ============

/// Kernel counters readable without the kernel lock.
pub(crate) struct KernelState {
    running: AtomicBool,
    preemptive: AtomicBool,
    int_nesting: AtomicU8,
    ticks: AtomicU32,
}

impl KernelState {
    const fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            preemptive: AtomicBool::new(true),
            int_nesting: AtomicU8::new(0),
            ticks: AtomicU32::new(0),
        }
    }

    pub(crate) fn reset(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.preemptive.store(true, Ordering::SeqCst);
        self.int_nesting.store(0, Ordering::SeqCst);
        self.ticks.store(0, Ordering::SeqCst);
    }

    #[inline(always)]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn set_running(&self, val: bool) {
        self.running.store(val, Ordering::SeqCst);
    }

    #[inline(always)]
    pub(crate) fn preemptive(&self) -> bool {
        self.preemptive.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn set_preemptive(&self, val: bool) {
        self.preemptive.store(val, Ordering::SeqCst);
    }

    /// Monotonic tick counter; read without a lock.
    #[inline(always)]
    pub(crate) fn tick_get(&self) -> Ticks {
        self.ticks.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn tick_advance(&self) -> Ticks {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline(always)]
    pub(crate) fn int_enter(&self) {
        self.int_nesting.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn int_exit(&self) {
        let nesting = self.int_nesting.load(Ordering::Relaxed);
        if nesting > 0 {
            self.int_nesting.store(nesting - 1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub(crate) fn int_nesting(&self) -> u8 {
        self.int_nesting.load(Ordering::Relaxed)
    }
}

/// Global kernel flags instance.
pub(crate) static KERNEL: KernelState = KernelState::new();

// ============ Kernel control block ============

/// Kernel control block: task table, scheduler cursor, and the active timer
/// list. Only touched inside critical sections.
pub(crate) struct Kcb {
    /// Arena of task control blocks; the circular scheduling order is the
    /// slot order.
    pub tasks: TaskTable,
    /// Slot of the currently running task.
    pub current: Option<usize>,
    /// Monotonically increasing id for the next new task.
    pub next_tid: TaskId,
    /// Cached count of live tasks.
    pub task_count: u16,
    /// Last slot a ready task was found at; the next search starts here.
    pub last_ready_hint: Option<usize>,
    /// Optional real-time scheduler hook.
    pub rt_sched: Option<RtSchedHook>,
    /// Armed software timers, ordered by absolute deadline ascending.
    pub active_timers: Vec<(Ticks, TimerId)>,
    /// Context switches since the last stack canary sweep.
    pub stack_check_counter: u32,
    /// Saved context of the boot thread, established before the first task
    /// launch.
    pub boot_context: port::Context,
}

impl Kcb {
    const fn new() -> Self {
        Self {
            tasks: TaskTable::new(),
            current: None,
            next_tid: 1,
            task_count: 0,
            last_ready_hint: None,
            rt_sched: None,
            active_timers: Vec::new(),
            stack_check_counter: 0,
            boot_context: port::Context::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.tasks.clear();
        self.current = None;
        self.next_tid = 1;
        self.task_count = 0;
        self.last_ready_hint = None;
        self.rt_sched = None;
        self.active_timers.clear();
        self.stack_check_counter = 0;
    }
}

/// Global kernel control block instance.
pub(crate) static KCB: CsCell<Kcb> = CsCell::new(Kcb::new());

// ============ Public API ============

/// Reset the kernel to its power-on state.
///
/// Called by [`run`]; host tests call it directly between cases.
pub fn init() {
    critical_section(|cs| {
        KERNEL.reset();
        KCB.get(cs).reset();
        timer::reset(cs);
    });
}

/// Current value of the system tick counter.
#[inline]
pub fn ticks() -> Ticks {
    KERNEL.tick_get()
}

/// System uptime in milliseconds.
#[inline]
pub fn uptime() -> u64 {
    port::read_us() / 1000
}

/// True while executing in interrupt context.
#[inline]
pub fn in_interrupt() -> bool {
    KERNEL.int_nesting() > 0
}

/// Install or clear the real-time scheduler hook.
pub fn set_rt_sched(hook: Option<RtSchedHook>) {
    critical_section(|cs| {
        KCB.get(cs).rt_sched = hook;
    });
}

/// The main entry from the tick interrupt: advance the tick counter, fire
/// expired software timers, then reschedule.
pub fn tick_interrupt() {
    if !KERNEL.is_running() {
        return;
    }

    KERNEL.int_enter();
    KERNEL.tick_advance();
    timer::process_tick();
    KERNEL.int_exit();

    sched::dispatch();
}

/// Boot the kernel and never return.
///
/// `app_main` spawns the initial tasks and picks the scheduling mode:
/// `true` for preemptive, `false` for cooperative. The caller must have
/// installed a global allocator first; the kernel spawns the idle task
/// itself and then launches the first spawned task.
pub fn run(app_main: fn() -> bool) -> ! {
    port::hardware_init();
    init();

    let preemptive = app_main();
    KERNEL.set_preemptive(preemptive);
    crate::info!(
        "scheduler mode: {=str}",
        if preemptive { "preemptive" } else { "cooperative" }
    );

    let idle_id = task::task_spawn(idle_task, DEFAULT_STACK_SIZE);
    let _ = task::task_priority(idle_id, Priority::IDLE);

    // The first successful spawn set the scheduler cursor; if it is still
    // unset, app_main never created a task.
    let first_ctx = critical_section(|cs| {
        let kcb = KCB.get(cs);
        let slot = match kcb.current {
            Some(slot) => slot,
            None => fatal(KernelError::NoTasks),
        };
        let tcb = kcb
            .tasks
            .get_mut(slot)
            .unwrap_or_else(|| fatal(KernelError::NoTasks));
        tcb.state = TaskState::Running;
        &tcb.context as *const port::Context
    });

    // Formality: establish a base execution context before handing the CPU
    // to the first task.
    critical_section(|cs| {
        let kcb = KCB.get(cs);
        unsafe { port::save_context(&mut kcb.boot_context) };
    });

    KERNEL.set_running(true);
    unsafe { port::dispatch_init(first_ctx, preemptive) }
}

fn idle_task() -> ! {
    loop {
        task::task_wfi();
    }
}
