//! Tick-driven software timers
//!
//! Two lists: a master store of every created timer, kept sorted by id for
//! lookup, and the active list in the kernel control block, sorted by
//! absolute deadline. Each tick pops expired entries from the head of the
//! active list - at most [`TIMER_BATCH_MAX`](crate::config::TIMER_BATCH_MAX)
//! per tick to bound ISR latency - and runs their callbacks after draining.

use alloc::vec::Vec;

use crate::config::{ms_to_ticks, TIMER_BATCH_MAX, TIMER_ID_BASE};
use crate::critical::{critical_section, CriticalSection, CsCell};
use crate::error::{KernelError, KernelResult};
use crate::kernel::{Kcb, KCB, KERNEL};
use crate::types::{Ticks, TimerId, TimerMode};

/// Timer expiry callback. Runs in interrupt context with interrupts
/// masked: it must not block, yield, or allocate. The argument is the
/// opaque word registered at creation.
pub type TimerCallback = fn(usize);

struct Timer {
    id: TimerId,
    callback: TimerCallback,
    arg: usize,
    period_ms: u32,
    deadline: Ticks,
    mode: TimerMode,
}

struct TimerStore {
    /// All created timers, sorted by id (ids are handed out in order).
    timers: Vec<Timer>,
    next_id: TimerId,
}

impl TimerStore {
    const fn new() -> Self {
        Self {
            timers: Vec::new(),
            next_id: TIMER_ID_BASE,
        }
    }

    fn find_mut(&mut self, id: TimerId) -> Option<&mut Timer> {
        let idx = self.timers.binary_search_by_key(&id, |t| t.id).ok()?;
        Some(&mut self.timers[idx])
    }
}

static TIMERS: CsCell<TimerStore> = CsCell::new(TimerStore::new());

/// Insert into the active list, keeping deadlines ascending; equal
/// deadlines keep arrival order.
fn activate(kcb: &mut Kcb, deadline: Ticks, id: TimerId) {
    let pos = kcb
        .active_timers
        .iter()
        .position(|&(d, _)| deadline < d)
        .unwrap_or(kcb.active_timers.len());
    kcb.active_timers.insert(pos, (deadline, id));
}

fn deactivate(kcb: &mut Kcb, id: TimerId) {
    kcb.active_timers.retain(|&(_, t)| t != id);
}

/// Reset the timer subsystem; the active list is cleared with the KCB.
pub(crate) fn reset(cs: &CriticalSection) {
    let store = TIMERS.get(cs);
    store.timers.clear();
    store.next_id = TIMER_ID_BASE;
}

/// Register a timer with a callback, a period in milliseconds, and an
/// opaque callback argument. The timer starts out disarmed.
pub fn timer_create(
    callback: TimerCallback,
    period_ms: u32,
    arg: usize,
) -> KernelResult<TimerId> {
    if period_ms == 0 {
        return Err(KernelError::Fail);
    }

    critical_section(|cs| {
        let store = TIMERS.get(cs);
        let id = store.next_id;
        store.next_id = store.next_id.wrapping_add(1);
        if store.timers.try_reserve(1).is_err() {
            return Err(KernelError::Fail);
        }
        store.timers.push(Timer {
            id,
            callback,
            arg,
            period_ms,
            deadline: 0,
            mode: TimerMode::Disabled,
        });
        Ok(id)
    })
}

/// Arm a timer in one-shot or auto-reload mode. Re-arming an armed timer
/// restarts its deadline from now.
pub fn timer_start(id: TimerId, mode: TimerMode) -> KernelResult<()> {
    if mode == TimerMode::Disabled {
        return Err(KernelError::Fail);
    }

    critical_section(|cs| {
        let store = TIMERS.get(cs);
        let t = store.find_mut(id).ok_or(KernelError::Fail)?;
        let kcb = KCB.get(cs);
        if t.mode != TimerMode::Disabled {
            deactivate(kcb, id);
        }
        t.mode = mode;
        t.deadline = KERNEL.tick_get() + ms_to_ticks(t.period_ms);
        activate(kcb, t.deadline, id);
        Ok(())
    })
}

/// Disarm a timer; fails if it is not armed.
pub fn timer_cancel(id: TimerId) -> KernelResult<()> {
    critical_section(|cs| {
        let store = TIMERS.get(cs);
        let t = store.find_mut(id).ok_or(KernelError::Fail)?;
        if t.mode == TimerMode::Disabled {
            return Err(KernelError::Fail);
        }
        t.mode = TimerMode::Disabled;
        deactivate(KCB.get(cs), id);
        Ok(())
    })
}

/// Remove a timer entirely, disarming it first if needed.
pub fn timer_destroy(id: TimerId) -> KernelResult<()> {
    critical_section(|cs| {
        let store = TIMERS.get(cs);
        let idx = store
            .timers
            .binary_search_by_key(&id, |t| t.id)
            .map_err(|_| KernelError::Fail)?;
        if store.timers[idx].mode != TimerMode::Disabled {
            deactivate(KCB.get(cs), id);
        }
        store.timers.remove(idx);
        Ok(())
    })
}

/// Per-tick expiry pass, run from the tick interrupt with interrupts
/// masked: drain up to [`TIMER_BATCH_MAX`] due timers off the head of the
/// active list, then invoke their callbacks. Auto-reload timers re-arm
/// relative to the firing moment; one-shot timers retire.
pub(crate) fn process_tick() {
    let now = KERNEL.tick_get();

    let mut batch: heapless::Vec<TimerId, TIMER_BATCH_MAX> =
        heapless::Vec::new();
    {
        let kcb = unsafe { KCB.get_unchecked() };
        while let Some(&(deadline, id)) = kcb.active_timers.first() {
            if deadline > now || batch.is_full() {
                break;
            }
            kcb.active_timers.remove(0);
            let _ = batch.push(id);
        }
    }

    for id in batch {
        let fire = {
            let store = unsafe { TIMERS.get_unchecked() };
            store.find_mut(id).map(|t| (t.callback, t.arg))
        };
        let Some((callback, arg)) = fire else {
            continue;
        };

        // No kernel borrow is held while user code runs; the callback may
        // legally cancel or destroy timers.
        callback(arg);

        let store = unsafe { TIMERS.get_unchecked() };
        if let Some(t) = store.find_mut(id) {
            match t.mode {
                TimerMode::AutoReload => {
                    t.deadline = now + ms_to_ticks(t.period_ms);
                    let deadline = t.deadline;
                    let kcb = unsafe { KCB.get_unchecked() };
                    activate(kcb, deadline, id);
                }
                TimerMode::OneShot => t.mode = TimerMode::Disabled,
                TimerMode::Disabled => {}
            }
        }
    }
}
