//! Critical section handling
//!
//! Every access to kernel state or to a sync object's internals happens
//! inside a critical section. On a single hart the mutual exclusion
//! mechanism is the interrupt-enable bit: while it is masked, the tick ISR
//! cannot run and so cannot reenter the scheduler. The saved IRQ state makes
//! sections nestable.
//!
//! Blocking primitives rely on a hand-over-hand property: a task that
//! blocks context-switches away while still inside its critical section,
//! and the interrupt state is re-established by the context restore of
//! whichever task runs next (the interrupt-enable bit is part of the saved
//! context). The guard the blocked task still holds is then dropped when it
//! eventually resumes and unwinds.

use core::cell::UnsafeCell;

use crate::port;

/// RAII guard for critical sections
///
/// Entering saves the current interrupt-enable state and masks interrupts;
/// dropping restores the saved state.
pub struct CriticalSection {
    saved: port::IrqState,
}

impl CriticalSection {
    /// Enter a critical section by masking interrupts.
    #[inline(always)]
    pub fn enter() -> Self {
        CriticalSection {
            saved: port::irq_save(),
        }
    }
}

impl Drop for CriticalSection {
    #[inline(always)]
    fn drop(&mut self) {
        unsafe { port::irq_restore(self.saved) }
    }
}

/// Execute a closure with interrupts masked
///
/// The closure receives a reference to the critical section guard, which
/// unlocks [`CsCell`]-protected data.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let cs = CriticalSection::enter();
    f(&cs)
}

/// A cell that may only be accessed within a critical section.
pub struct CsCell<T>(UnsafeCell<T>);

unsafe impl<T> Sync for CsCell<T> {}

impl<T> CsCell<T> {
    /// Create a new CsCell
    #[inline(always)]
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Get a mutable reference to the inner value
    #[inline(always)]
    pub fn get(&self, _cs: &CriticalSection) -> &mut T {
        unsafe { &mut *self.0.get() }
    }

    /// Get a mutable reference without a guard.
    ///
    /// # Safety
    /// Interrupts must already be masked and no other reference to the
    /// contents may be live.
    #[inline(always)]
    pub unsafe fn get_unchecked(&self) -> &mut T {
        unsafe { &mut *self.0.get() }
    }
}
