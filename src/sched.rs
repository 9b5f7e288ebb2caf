//! Scheduler and dispatcher
//!
//! Weighted round-robin: each ready task carries a countdown counter that is
//! decremented as the circular walk passes over it; the first task whose
//! counter reaches zero runs, and its counter reloads from the base weight.
//! Priority is therefore expressed by how often a task's counter hits zero,
//! not by reordering the task list.
//!
//! Two switch paths share the selection logic: [`yield_now`] for voluntary
//! (cooperative) switches and [`dispatch`] for the preemptive tick.

use crate::config::{SCHED_ITER_MAX, STACK_CHECK_INTERVAL};
use crate::critical::CriticalSection;
use crate::error::{fatal, KernelError};
use crate::kernel::{self, Kcb, KCB, KERNEL};
use crate::port;
use crate::sync::WaitQueue;
use crate::task;
use crate::types::{TaskId, TaskState};

/// Find the next ready task in the circular slot order.
///
/// The search starts from the last-ready hint when it is still valid, else
/// from the successor of the current task. Tasks that are not READY or that
/// belong to the real-time hook are skipped. A hard iteration cap guards
/// against livelock.
fn find_next_ready(kcb: &mut Kcb) -> Option<usize> {
    // Hint fast path: immediately eligible and not claimed by the RT hook.
    if let Some(hint) = kcb.last_ready_hint {
        match kcb.tasks.get_mut(hint) {
            Some(t)
                if t.state == TaskState::Ready
                    && t.rt_hook.is_none()
                    && t.prio.counter() == 0 =>
            {
                t.prio.reload();
                return Some(hint);
            }
            Some(_) => {}
            None => kcb.last_ready_hint = None,
        }
    }

    let mut slot = kcb.current?;
    for _ in 0..SCHED_ITER_MAX {
        slot = kcb.tasks.next_slot(slot)?;
        let Some(t) = kcb.tasks.get_mut(slot) else {
            continue;
        };
        if t.state != TaskState::Ready || t.rt_hook.is_some() {
            continue;
        }
        if t.prio.tick() {
            t.prio.reload();
            kcb.last_ready_hint = Some(slot);
            return Some(slot);
        }
    }

    kcb.last_ready_hint = None;
    None
}

/// Demote the running task to READY, pick the next task, mark it RUNNING.
/// Returns the chosen slot. Exhausting the search is fatal.
fn schedule_next(kcb: &mut Kcb) -> usize {
    let cur = match kcb.current {
        Some(slot) => slot,
        None => fatal(KernelError::NoTasks),
    };
    match kcb.tasks.get_mut(cur) {
        Some(t) if t.state == TaskState::Running => t.state = TaskState::Ready,
        Some(_) => {}
        None => fatal(KernelError::NoTasks),
    }

    // The real-time hook short-circuits the round-robin.
    if let Some(hook) = kcb.rt_sched {
        if let Some(id) = hook() {
            if let Some(slot) = kcb.tasks.slot_of(id) {
                kcb.current = Some(slot);
                if let Some(t) = kcb.tasks.get_mut(slot) {
                    t.state = TaskState::Running;
                }
                return slot;
            }
        }
    }

    let next = match find_next_ready(kcb) {
        Some(slot) => slot,
        None => fatal(KernelError::NoTasks),
    };
    kcb.current = Some(next);
    if let Some(t) = kcb.tasks.get_mut(next) {
        t.state = TaskState::Running;
    }
    next
}

/// Age every pending delay by one pass; a delay hitting zero readies its
/// task, or flags the wakeup if the task is currently suspended.
fn age_delays(kcb: &mut Kcb) {
    for t in kcb.tasks.iter_mut() {
        if t.delay == 0 {
            continue;
        }
        let waiting = t.state == TaskState::Blocked
            || (t.state == TaskState::Suspended
                && t.suspended_from == TaskState::Blocked);
        if !waiting {
            continue;
        }
        t.delay -= 1;
        if t.delay == 0 {
            if t.state == TaskState::Blocked {
                t.state = TaskState::Ready;
            } else {
                t.wake_pending = true;
            }
        }
    }
}

/// Amortized stack integrity check: every [`STACK_CHECK_INTERVAL`] switches,
/// verify the running task's canaries. A mismatch is fatal.
fn stack_check(kcb: &mut Kcb) {
    kcb.stack_check_counter += 1;
    if kcb.stack_check_counter < STACK_CHECK_INTERVAL {
        return;
    }
    kcb.stack_check_counter = 0;

    let tcb = match kcb.current.and_then(|s| kcb.tasks.get(s)) {
        Some(t) => t,
        None => fatal(KernelError::StackCheck),
    };
    if !tcb.stack.canaries_intact() {
        crate::error!(
            "stack corruption: task {=u16}, {=usize} byte stack",
            tcb.id,
            tcb.stack.size()
        );
        fatal(KernelError::StackCheck);
    }
}

/// Cooperative context switch: suspend the caller and resume the next ready
/// task. Returns when the caller is scheduled again. In cooperative mode
/// this is also where delays age.
pub(crate) fn yield_now() {
    if !KERNEL.is_running() || kernel::in_interrupt() {
        return;
    }

    let cs = CriticalSection::enter();
    let mut switch: Option<(*mut port::Context, *const port::Context)> = None;
    {
        let kcb = unsafe { KCB.get_unchecked() };
        if kcb.current.is_none() {
            return;
        }
        stack_check(kcb);
        if !KERNEL.preemptive() {
            age_delays(kcb);
        }
        let cur = kcb.current.unwrap_or_else(|| fatal(KernelError::NoTasks));
        let next = schedule_next(kcb);
        if next != cur {
            let restore = &kcb
                .tasks
                .get(next)
                .unwrap_or_else(|| fatal(KernelError::NoTasks))
                .context as *const port::Context;
            let save = &mut kcb
                .tasks
                .get_mut(cur)
                .unwrap_or_else(|| fatal(KernelError::NoTasks))
                .context as *mut port::Context;
            switch = Some((save, restore));
        }
    }
    if let Some((save, restore)) = switch {
        // The switch carries the interrupt state with it; our guard is
        // dropped when the caller is eventually resumed and unwinds.
        unsafe { port::switch_context(save, restore) };
    }
    drop(cs);
}

/// Preemptive switch path, entered from the tick interrupt: age delays,
/// verify the stack, reschedule, and resume the chosen task.
pub(crate) fn dispatch() {
    if !KERNEL.is_running() {
        return;
    }

    let cs = CriticalSection::enter();
    let mut switch: Option<(*mut port::Context, *const port::Context)> = None;
    let first_run;
    {
        let kcb = unsafe { KCB.get_unchecked() };
        if kcb.current.is_none() {
            fatal(KernelError::NoTasks);
        }
        stack_check(kcb);
        age_delays(kcb);
        let cur = kcb.current.unwrap_or_else(|| fatal(KernelError::NoTasks));
        let next = schedule_next(kcb);
        {
            let nt = kcb
                .tasks
                .get(next)
                .unwrap_or_else(|| fatal(KernelError::NoTasks));
            first_run = nt.context.resumes_at(nt.entry as usize);
        }
        if next != cur {
            let restore = &kcb
                .tasks
                .get(next)
                .unwrap_or_else(|| fatal(KernelError::NoTasks))
                .context as *const port::Context;
            let save = &mut kcb
                .tasks
                .get_mut(cur)
                .unwrap_or_else(|| fatal(KernelError::NoTasks))
                .context as *mut port::Context;
            switch = Some((save, restore));
        }
    }
    port::interrupt_tick(first_run);
    if let Some((save, restore)) = switch {
        unsafe { port::switch_context(save, restore) };
    }
    drop(cs);
}

/// Atomically block the calling task on a wait queue and reschedule.
///
/// This is the basis of every blocking primitive: enqueue the caller, mark
/// it BLOCKED, and switch away - all under the caller's critical section,
/// so the tick ISR can never observe a task that is RUNNING but already on
/// a wait set. The critical section is not released here; the context
/// restore of the next task re-establishes the interrupt state.
pub(crate) fn block_current(q: &mut WaitQueue) {
    let id = {
        let kcb = unsafe { KCB.get_unchecked() };
        let id = task::current_id(kcb);
        if id == 0 {
            fatal(KernelError::SemOperation);
        }
        id
    };
    if q.push(id).is_err() {
        fatal(KernelError::SemOperation);
    }
    {
        let kcb = unsafe { KCB.get_unchecked() };
        if let Some(t) = kcb.tasks.find_mut(id) {
            t.state = TaskState::Blocked;
        }
    }
    yield_now();
}

/// Wake the oldest waiter on a queue, FIFO order. Must be called inside a
/// critical section.
///
/// Ids that no longer resolve (the task was cancelled while waiting) are
/// skipped. A waiter found BLOCKED transitions directly to READY - the
/// caller's token passes to it. A waiter that is suspended, or that is
/// polling a timed wait, gets its pending-wake flag set instead. Any other
/// state is a protocol violation and fatal.
pub(crate) fn wake_one(q: &mut WaitQueue) -> Option<TaskId> {
    let kcb = unsafe { KCB.get_unchecked() };
    while let Some(id) = q.pop() {
        if let Some(t) = kcb.tasks.find_mut(id) {
            match t.state {
                TaskState::Blocked => {
                    t.state = TaskState::Ready;
                    t.delay = 0;
                    return Some(id);
                }
                TaskState::Suspended
                    if t.suspended_from == TaskState::Blocked =>
                {
                    t.wake_pending = true;
                    return Some(id);
                }
                TaskState::Ready | TaskState::Running => {
                    t.wake_pending = true;
                    return Some(id);
                }
                _ => fatal(KernelError::SemOperation),
            }
        }
    }
    None
}

/// Wake every waiter on a queue. Returns the number woken.
pub(crate) fn wake_all(q: &mut WaitQueue) -> usize {
    let mut woken = 0;
    while wake_one(q).is_some() {
        woken += 1;
    }
    woken
}
