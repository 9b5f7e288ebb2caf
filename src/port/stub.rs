//! Stub port for non-RISC-V targets (host testing)
//!
//! Context switches are no-ops here: a "switch" returns straight to the
//! caller, so tests assert on kernel state machines rather than on real
//! concurrency. Each simulated switch advances the tick counter by one so
//! that timed waits make progress in single-threaded tests.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::task::TaskEntry;

/// Mirrors the real port's trap-frame red zone.
pub const ISR_FRAME_SIZE: usize = 128;

/// Saved interrupt-enable state.
pub type IrqState = bool;

static IRQ_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn irq_save() -> IrqState {
    IRQ_ENABLED.swap(false, Ordering::SeqCst)
}

pub unsafe fn irq_restore(state: IrqState) {
    IRQ_ENABLED.store(state, Ordering::SeqCst);
}

pub fn irq_disable() {
    IRQ_ENABLED.store(false, Ordering::SeqCst);
}

/// Saved context stand-in; remembers only the entry point so first-run
/// detection behaves like the real port.
#[derive(Clone, Copy)]
pub struct Context {
    entry: usize,
}

impl Context {
    pub const fn new() -> Self {
        Context { entry: 0 }
    }

    pub fn resumes_at(&self, entry: usize) -> bool {
        self.entry == entry
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

pub unsafe fn save_context(_ctx: *mut Context) -> u32 {
    0
}

pub unsafe fn restore_context(_ctx: *const Context, _val: u32) -> ! {
    panic!("restore_context is not available on this platform");
}

pub unsafe fn switch_context(_save: *mut Context, _restore: *const Context) {
    // No real switch on the host; nudge time forward instead.
    crate::kernel::KERNEL.tick_advance();
}

pub unsafe fn context_init(
    ctx: &mut Context,
    _stack_base: *mut u8,
    _stack_size: usize,
    entry: TaskEntry,
) {
    ctx.entry = entry as usize;
}

pub unsafe fn dispatch_init(_ctx: *const Context, _preemptive: bool) -> ! {
    panic!("dispatch_init is not available on this platform");
}

pub fn interrupt_tick(_first_run: bool) {}

pub fn hardware_init() {}

pub fn timer_enable() {}

pub fn timer_disable() {}

pub fn read_us() -> u64 {
    crate::kernel::ticks() as u64
        * (1_000_000 / crate::config::TICK_RATE_HZ as u64)
}

pub fn cpu_idle() {
    crate::kernel::KERNEL.tick_advance();
}

pub fn panic_halt() -> ! {
    panic!("kernel halted");
}
