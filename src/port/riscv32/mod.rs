//! RV32 port for the QEMU `virt` machine
//!
//! Context switching over the RISC-V callee-saved register frame, plus the
//! CLINT machine timer as the tick source. The trap trampoline and vectoring
//! come from `riscv-rt`; this module only provides the machine-timer hook.

#![allow(clippy::missing_safety_doc)]

use core::arch::naked_asm;

use crate::config::TICK_RATE_HZ;
use crate::task::TaskEntry;

/// Core clock of the QEMU `virt` CLINT timebase.
pub const CPU_HZ: u32 = 10_000_000;

/// Size of the full trap frame saved by the trap trampoline. This space is
/// reserved at the top of every task's stack (a "red zone") so that an
/// interrupt taken at peak stack usage cannot overflow the allocation.
pub const ISR_FRAME_SIZE: usize = 128;

const MSTATUS_MIE: u32 = 1 << 3;
const MSTATUS_MPP_MACH: u32 = 3 << 11;

// ============ Interrupt state ============

/// Saved interrupt-enable state.
pub type IrqState = bool;

/// Mask interrupts, returning the previous enable state.
#[inline(always)]
pub fn irq_save() -> IrqState {
    let was_active = riscv::register::mstatus::read().mie();
    riscv::interrupt::disable();
    was_active
}

/// Restore a state previously returned by [`irq_save`].
///
/// # Safety
/// Must pair with the matching `irq_save` in LIFO order.
#[inline(always)]
pub unsafe fn irq_restore(state: IrqState) {
    if state {
        unsafe { riscv::interrupt::enable() }
    }
}

/// Mask interrupts unconditionally.
#[inline(always)]
pub fn irq_disable() {
    riscv::interrupt::disable();
}

// ============ Saved context ============

/// Saved execution context: the RISC-V callee-saved registers, the essential
/// pointers, and the CSRs needed to resume with the correct interrupt state.
///
/// This is distinct from the full trap frame saved by the trap trampoline;
/// a context switch only needs to preserve what a C-ABI function call
/// preserves.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Context {
    s: [u32; 12], // s0-s11, offsets 0..=44
    gp: u32,      // 48
    tp: u32,      // 52
    sp: u32,      // 56
    ra: u32,      // 60
    mcause: u32,  // 64, kept for debugging
    mepc: u32,    // 68, kept for debugging
    mstatus: u32, // 72
}

impl Context {
    pub const fn new() -> Self {
        Context {
            s: [0; 12],
            gp: 0,
            tp: 0,
            sp: 0,
            ra: 0,
            mcause: 0,
            mepc: 0,
            mstatus: 0,
        }
    }

    /// True while the context still points at the task's entry: the task has
    /// never run.
    #[inline]
    pub fn resumes_at(&self, entry: usize) -> bool {
        self.ra == entry as u32
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Record the callee-saved registers, stack pointer, return address, and the
/// interrupt-enable bit into `ctx`. Returns 0 when called directly; a later
/// [`restore_context`] makes this call site appear to return the restored
/// value.
///
/// The saved mstatus is reconstructed so that MIE reflects the pre-trap
/// state (MPIE) when saving from inside the tick trap.
#[unsafe(naked)]
pub unsafe extern "C" fn save_context(ctx: *mut Context) -> u32 {
    naked_asm!(
        "sw  s0,   0(a0)",
        "sw  s1,   4(a0)",
        "sw  s2,   8(a0)",
        "sw  s3,  12(a0)",
        "sw  s4,  16(a0)",
        "sw  s5,  20(a0)",
        "sw  s6,  24(a0)",
        "sw  s7,  28(a0)",
        "sw  s8,  32(a0)",
        "sw  s9,  36(a0)",
        "sw  s10, 40(a0)",
        "sw  s11, 44(a0)",
        "sw  gp,  48(a0)",
        "sw  tp,  52(a0)",
        "sw  sp,  56(a0)",
        "sw  ra,  60(a0)",
        "csrr t0, mcause",
        "sw   t0, 64(a0)",
        "csrr t0, mepc",
        "sw   t0, 68(a0)",
        // Move MPIE (bit 7) into the MIE position (bit 3) so the restored
        // context re-enables interrupts iff they were enabled pre-trap.
        "csrr t0, mstatus",
        "srli t1, t0, 4",
        "andi t1, t1, 8",
        "li   t2, -9",
        "and  t0, t0, t2",
        "or   t0, t0, t1",
        "sw   t0, 72(a0)",
        "li   a0, 0",
        "ret",
    );
}

/// Resume a context saved by [`save_context`]. Never returns to the caller;
/// execution continues at the saved call site, which observes `val`
/// (coerced to 1 if 0).
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(ctx: *const Context, val: u32) -> ! {
    naked_asm!(
        // mstatus first, so the interrupt state is correct before any other
        // register is live again.
        "lw  t0, 72(a0)",
        "csrw mstatus, t0",
        "lw  s0,   0(a0)",
        "lw  s1,   4(a0)",
        "lw  s2,   8(a0)",
        "lw  s3,  12(a0)",
        "lw  s4,  16(a0)",
        "lw  s5,  20(a0)",
        "lw  s6,  24(a0)",
        "lw  s7,  28(a0)",
        "lw  s8,  32(a0)",
        "lw  s9,  36(a0)",
        "lw  s10, 40(a0)",
        "lw  s11, 44(a0)",
        "lw  gp,  48(a0)",
        "lw  tp,  52(a0)",
        "lw  sp,  56(a0)",
        "lw  ra,  60(a0)",
        "bnez a1, 2f",
        "li   a1, 1",
        "2:",
        "mv  a0, a1",
        "ret",
    );
}

/// Cooperative switch: save into `save`, resume `restore`. Returns (much
/// later) when some other context restores `save`.
#[inline]
pub unsafe fn switch_context(save: *mut Context, restore: *const Context) {
    if unsafe { save_context(save) } == 0 {
        unsafe { restore_context(restore, 1) }
    }
}

/// Seed `ctx` so that a first restore lands on `entry` with a fresh stack.
///
/// The top [`ISR_FRAME_SIZE`] bytes of the stack are left unused as the trap
/// red zone, the seeded stack pointer is 16-byte aligned per the RISC-V ABI,
/// and the saved mstatus has interrupts pending-enabled.
pub unsafe fn context_init(
    ctx: &mut Context,
    stack_base: *mut u8,
    stack_size: usize,
    entry: TaskEntry,
) {
    debug_assert!(stack_size > ISR_FRAME_SIZE + 64);

    let base = stack_base as usize;
    let top = (base + stack_size - ISR_FRAME_SIZE) & !0xF;

    *ctx = Context::new();
    ctx.sp = top as u32;
    ctx.ra = entry as usize as u32;
    ctx.mstatus = MSTATUS_MIE | MSTATUS_MPP_MACH;
}

/// Launch the first task. Enables the tick source in preemptive mode, then
/// restores the task's initial context. Never returns.
pub unsafe fn dispatch_init(ctx: *const Context, preemptive: bool) -> ! {
    if preemptive {
        timer_enable();
    }
    unsafe {
        riscv::interrupt::enable();
        restore_context(ctx, 1)
    }
}

/// Scheduler-post-switch hook: on the very first entry into a task, global
/// interrupts are enabled here so the tick can preempt it from the start.
#[inline]
pub fn interrupt_tick(first_run: bool) {
    if first_run {
        unsafe { riscv::interrupt::enable() }
    }
}

// ============ CLINT timer (QEMU virt) ============

const CLINT_BASE: usize = 0x0200_0000;
const MTIMECMP_L: *mut u32 = (CLINT_BASE + 0x4000) as *mut u32;
const MTIMECMP_H: *mut u32 = (CLINT_BASE + 0x4004) as *mut u32;
const MTIME_L: *const u32 = (CLINT_BASE + 0xBFF8) as *const u32;
const MTIME_H: *const u32 = (CLINT_BASE + 0xBFFC) as *const u32;

const TICK_CYCLES: u64 = (CPU_HZ / TICK_RATE_HZ) as u64;

/// Consistent 64-bit read of mtime on RV32: retry if the high word rolls
/// over between the two half reads.
fn mtime_r() -> u64 {
    loop {
        let hi = unsafe { MTIME_H.read_volatile() };
        let lo = unsafe { MTIME_L.read_volatile() };
        if hi == unsafe { MTIME_H.read_volatile() } {
            return (hi as u64) << 32 | lo as u64;
        }
    }
}

fn mtimecmp_r() -> u64 {
    loop {
        let hi = unsafe { MTIMECMP_H.read_volatile() };
        let lo = unsafe { MTIMECMP_L.read_volatile() };
        if hi == unsafe { MTIMECMP_H.read_volatile() } {
            return (hi as u64) << 32 | lo as u64;
        }
    }
}

/// Write mtimecmp without triggering a spurious interrupt mid-update: park
/// the low word at an impassable value, set the high word, then the real
/// low word.
fn mtimecmp_w(val: u64) {
    let mtie_was_set = riscv::register::mie::read().mtimer();
    unsafe {
        riscv::register::mie::clear_mtimer();
        MTIMECMP_L.write_volatile(u32::MAX);
        MTIMECMP_H.write_volatile((val >> 32) as u32);
        MTIMECMP_L.write_volatile(val as u32);
        if mtie_was_set {
            riscv::register::mie::set_mtimer();
        }
    }
}

/// Bring up the tick source: program the first compare. Subsequent compares
/// are programmed by the trap handler.
pub fn hardware_init() {
    mtimecmp_w(mtime_r() + TICK_CYCLES);
}

/// Enable the machine timer interrupt.
pub fn timer_enable() {
    mtimecmp_w(mtime_r() + TICK_CYCLES);
    unsafe { riscv::register::mie::set_mtimer() }
}

/// Disable the machine timer interrupt.
pub fn timer_disable() {
    unsafe { riscv::register::mie::clear_mtimer() }
}

/// Microseconds since boot.
pub fn read_us() -> u64 {
    mtime_r() / (CPU_HZ as u64 / 1_000_000)
}

/// Low-power wait for the next interrupt.
#[inline]
pub fn cpu_idle() {
    riscv::asm::wfi();
}

/// Unrecoverable halt: mask interrupts, attempt a clean QEMU shutdown, then
/// park the hart.
pub fn panic_halt() -> ! {
    irq_disable();
    // QEMU virt test finisher device.
    unsafe { (0x0010_0000 as *mut u32).write_volatile(0x5555) };
    loop {
        riscv::asm::wfi();
    }
}

/// Machine timer trap: reprogram the compare relative to the previous
/// target (not the current time) so the nominal tick frequency stays
/// constant despite interrupt latency, then run the dispatcher.
#[riscv_rt::core_interrupt(riscv::interrupt::Interrupt::MachineTimer)]
fn machine_timer() {
    mtimecmp_w(mtimecmp_r() + TICK_CYCLES);
    crate::kernel::tick_interrupt();
}
