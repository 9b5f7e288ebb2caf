//! Task management
//!
//! Task control blocks live in an arena of slots indexed by position; the
//! circular scheduling order is the slot order. Wait sets elsewhere in the
//! kernel hold task ids, never pointers, so a cancelled task can simply be
//! dropped: wakeup paths re-validate ids against this table and skip any
//! that no longer resolve.

use core::ptr::NonNull;

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::vec::Vec;

use crate::config::{MIN_STACK_SIZE, STACK_CANARY};
use crate::critical::critical_section;
use crate::error::{fatal, KernelError, KernelResult};
use crate::kernel::{Kcb, KCB, KERNEL};
use crate::port;
use crate::sched;
use crate::types::{Priority, TaskId, TaskState};

/// Task entry point type: no arguments, never returns.
pub type TaskEntry = fn() -> !;

// ============ Task stack ============

/// Owned, 16-byte aligned stack region with a canary word stamped at both
/// ends.
pub(crate) struct TaskStack {
    ptr: NonNull<u8>,
    size: usize,
}

impl TaskStack {
    fn layout(size: usize) -> Layout {
        // Size is 16-byte aligned by the spawn path, so this cannot fail.
        Layout::from_size_align(size, 16)
            .unwrap_or_else(|_| fatal(KernelError::StackAlloc))
    }

    fn alloc(size: usize) -> Option<TaskStack> {
        let ptr = unsafe { alloc(Self::layout(size)) };
        let stack = TaskStack {
            ptr: NonNull::new(ptr)?,
            size,
        };
        unsafe {
            stack.lo_canary_ptr().write(STACK_CANARY);
            stack.hi_canary_ptr().write(STACK_CANARY);
        }
        Some(stack)
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    fn lo_canary_ptr(&self) -> *mut u32 {
        self.ptr.as_ptr().cast()
    }

    fn hi_canary_ptr(&self) -> *mut u32 {
        unsafe { self.ptr.as_ptr().add(self.size - 4).cast() }
    }

    /// True while both canary words are unclobbered.
    pub(crate) fn canaries_intact(&self) -> bool {
        unsafe {
            self.lo_canary_ptr().read() == STACK_CANARY
                && self.hi_canary_ptr().read() == STACK_CANARY
        }
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), Self::layout(self.size)) }
    }
}

// ============ Task control block ============

/// Per-task state: saved context, stack, identity, and scheduling fields.
pub(crate) struct Tcb {
    /// Saved CPU context for task switching.
    pub context: port::Context,
    /// Owned stack region.
    pub stack: TaskStack,
    /// Entry point function.
    pub entry: TaskEntry,
    /// Weighted round-robin priority (base weight + countdown counter).
    pub prio: Priority,
    /// Ticks remaining for a timed sleep while `state == Blocked`.
    pub delay: u16,
    /// Unique id, assigned by the kernel on creation.
    pub id: TaskId,
    /// Lifecycle state.
    pub state: TaskState,
    /// State the task was in when it was suspended; meaningful only while
    /// `state == Suspended`.
    pub suspended_from: TaskState,
    /// A wakeup (signal, handoff, delay expiry) arrived while the task was
    /// suspended or polling a timed wait.
    pub wake_pending: bool,
    /// Opaque hook data for the real-time scheduler; tasks carrying it are
    /// skipped by the round-robin.
    pub rt_hook: Option<NonNull<()>>,
}

// ============ Task table ============

/// Arena of TCB slots. Freed slots are reused; ids stay unique.
pub(crate) struct TaskTable {
    slots: Vec<Option<Tcb>>,
}

impl TaskTable {
    pub(crate) const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }

    /// Store a TCB, reusing the first free slot. Returns the slot index.
    pub(crate) fn insert(&mut self, tcb: Tcb) -> usize {
        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(tcb);
            return slot;
        }
        if self.slots.try_reserve(1).is_err() {
            fatal(KernelError::TcbAlloc);
        }
        self.slots.push(Some(tcb));
        self.slots.len() - 1
    }

    pub(crate) fn remove(&mut self, slot: usize) -> Option<Tcb> {
        self.slots.get_mut(slot)?.take()
    }

    #[inline]
    pub(crate) fn get(&self, slot: usize) -> Option<&Tcb> {
        self.slots.get(slot)?.as_ref()
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut Tcb> {
        self.slots.get_mut(slot)?.as_mut()
    }

    pub(crate) fn slot_of(&self, id: TaskId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(t) if t.id == id))
    }

    pub(crate) fn find_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        self.slots
            .iter_mut()
            .filter_map(Option::as_mut)
            .find(|t| t.id == id)
    }

    pub(crate) fn find_by_entry(&self, entry: TaskEntry) -> Option<&Tcb> {
        self.slots
            .iter()
            .filter_map(Option::as_ref)
            .find(|t| core::ptr::fn_addr_eq(t.entry, entry))
    }

    /// Next occupied slot after `from`, wrapping around. May return `from`
    /// itself when it is the only occupied slot.
    pub(crate) fn next_slot(&self, from: usize) -> Option<usize> {
        let len = self.slots.len();
        if len == 0 {
            return None;
        }
        let mut slot = from;
        for _ in 0..len {
            slot = (slot + 1) % len;
            if self.slots[slot].is_some() {
                return Some(slot);
            }
        }
        None
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tcb> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }
}

/// Id of the running task as seen from inside a held critical section.
pub(crate) fn current_id(kcb: &Kcb) -> TaskId {
    kcb.current
        .and_then(|slot| kcb.tasks.get(slot))
        .map(|t| t.id)
        .unwrap_or(0)
}

// ============ Task API ============

/// Create and start a new task.
///
/// The stack is allocated from the heap, sized at least [`MIN_STACK_SIZE`]
/// bytes and rounded up to a 16-byte multiple. Returns the new task's id;
/// allocation failure is fatal.
pub fn task_spawn(entry: TaskEntry, stack_size: usize) -> TaskId {
    let mut size = stack_size.max(MIN_STACK_SIZE);
    size = (size + 0xF) & !0xF;

    let stack = TaskStack::alloc(size)
        .unwrap_or_else(|| fatal(KernelError::StackAlloc));

    let mut tcb = Tcb {
        context: port::Context::new(),
        stack,
        entry,
        prio: Priority::NORMAL.eager(),
        delay: 0,
        id: 0,
        state: TaskState::Stopped,
        suspended_from: TaskState::Ready,
        wake_pending: false,
        rt_hook: None,
    };
    unsafe {
        port::context_init(&mut tcb.context, tcb.stack.base(), size, entry);
    }

    let id = critical_section(|cs| {
        let kcb = KCB.get(cs);
        tcb.id = kcb.next_tid;
        kcb.next_tid = kcb.next_tid.wrapping_add(1);
        if kcb.next_tid == 0 {
            kcb.next_tid = 1;
        }
        let id = tcb.id;
        tcb.state = TaskState::Ready;
        let slot = kcb.tasks.insert(tcb);
        kcb.task_count += 1;
        if kcb.current.is_none() {
            kcb.current = Some(slot);
        }
        id
    });

    crate::debug!("task {=u16}: spawned, stack {=usize} bytes", id, size);
    id
}

/// Cancel and remove a task. A task cannot cancel itself, and a RUNNING
/// task cannot be cancelled.
pub fn task_cancel(id: TaskId) -> KernelResult<()> {
    if id == 0 || id == task_id() {
        return Err(KernelError::TaskCantRemove);
    }

    let removed = critical_section(|cs| {
        let kcb = KCB.get(cs);
        let slot = kcb.tasks.slot_of(id).ok_or(KernelError::TaskNotFound)?;
        let state = kcb.tasks.get(slot).map(|t| t.state);
        if state == Some(TaskState::Running) {
            return Err(KernelError::TaskCantRemove);
        }
        if kcb.last_ready_hint == Some(slot) {
            kcb.last_ready_hint = None;
        }
        let tcb = kcb.tasks.remove(slot).ok_or(KernelError::TaskNotFound)?;
        kcb.task_count -= 1;
        Ok(tcb)
    })?;

    // Stack and TCB are freed outside the critical section.
    drop(removed);
    Ok(())
}

/// Voluntarily yield the CPU.
#[inline]
pub fn task_yield() {
    sched::yield_now();
}

/// Block the calling task for `ticks` scheduler ticks.
pub fn task_delay(ticks: u16) {
    if ticks == 0 {
        return;
    }

    critical_section(|cs| {
        let kcb = KCB.get(cs);
        if let Some(tcb) = kcb.current.and_then(|s| kcb.tasks.get_mut(s)) {
            tcb.delay = ticks;
            tcb.state = TaskState::Blocked;
        }
    });

    sched::yield_now();
}

/// Suspend a task, excluding it from scheduling until resumed. A task may
/// suspend itself.
pub fn task_suspend(id: TaskId) -> KernelResult<()> {
    if id == 0 {
        return Err(KernelError::TaskNotFound);
    }

    let is_current = critical_section(|cs| {
        let kcb = KCB.get(cs);
        let slot = kcb.tasks.slot_of(id).ok_or(KernelError::TaskNotFound)?;
        let tcb = kcb.tasks.get_mut(slot).ok_or(KernelError::TaskNotFound)?;
        match tcb.state {
            TaskState::Ready | TaskState::Running | TaskState::Blocked => {}
            _ => return Err(KernelError::TaskCantSuspend),
        }
        tcb.suspended_from = tcb.state;
        tcb.state = TaskState::Suspended;
        if kcb.last_ready_hint == Some(slot) {
            kcb.last_ready_hint = None;
        }
        Ok(kcb.current == Some(slot))
    })?;

    if is_current {
        sched::yield_now();
    }
    Ok(())
}

/// Resume a previously suspended task.
///
/// If a wakeup arrived while the task was suspended (delay expired, or a
/// sync object handed it a token), the task goes straight to READY;
/// otherwise a task that was blocked returns to BLOCKED to keep waiting.
pub fn task_resume(id: TaskId) -> KernelResult<()> {
    if id == 0 {
        return Err(KernelError::TaskNotFound);
    }

    critical_section(|cs| {
        let kcb = KCB.get(cs);
        let tcb = kcb.tasks.find_mut(id).ok_or(KernelError::TaskNotFound)?;
        if tcb.state != TaskState::Suspended {
            return Err(KernelError::TaskCantResume);
        }
        if tcb.wake_pending || tcb.suspended_from != TaskState::Blocked {
            tcb.wake_pending = false;
            tcb.state = TaskState::Ready;
        } else {
            tcb.state = TaskState::Blocked;
        }
        Ok(())
    })
}

/// Change a task's base priority to one of the eight named levels. The
/// countdown counter restarts from the new base.
pub fn task_priority(id: TaskId, prio: Priority) -> KernelResult<()> {
    if id == 0 {
        return Err(KernelError::TaskInvalidPrio);
    }

    critical_section(|cs| {
        let kcb = KCB.get(cs);
        let tcb = kcb.tasks.find_mut(id).ok_or(KernelError::TaskNotFound)?;
        tcb.prio = prio.reloaded();
        Ok(())
    })
}

/// Attach opaque scheduling data for the real-time scheduler hook. A task
/// carrying hook data is skipped by the round-robin and chosen only by the
/// hook. Passing null detaches the task.
pub fn task_rt_priority(id: TaskId, data: *mut ()) -> KernelResult<()> {
    if id == 0 {
        return Err(KernelError::TaskNotFound);
    }

    critical_section(|cs| {
        let kcb = KCB.get(cs);
        let tcb = kcb.tasks.find_mut(id).ok_or(KernelError::TaskNotFound)?;
        tcb.rt_hook = NonNull::new(data);
        Ok(())
    })
}

/// Id of the calling task (0 before the first spawn).
pub fn task_id() -> TaskId {
    critical_section(|cs| current_id(KCB.get(cs)))
}

/// Find a task's id from its entry function.
pub fn task_idref(entry: TaskEntry) -> KernelResult<TaskId> {
    critical_section(|cs| {
        KCB.get(cs)
            .tasks
            .find_by_entry(entry)
            .map(|t| t.id)
            .ok_or(KernelError::TaskNotFound)
    })
}

/// Wait for the next scheduler tick in a low-power state. In cooperative
/// mode there is no tick to wait for, so this degrades to a single yield.
pub fn task_wfi() {
    if !KERNEL.preemptive() {
        sched::yield_now();
        return;
    }

    let entry = KERNEL.tick_get();
    while KERNEL.tick_get() == entry {
        port::cpu_idle();
    }
}

/// Number of live tasks.
pub fn task_count() -> u16 {
    critical_section(|cs| KCB.get(cs).task_count)
}

/// Lifecycle state of a task, if it exists. Inherently racy outside a
/// critical section; meant for diagnostics and tests.
pub fn task_state(id: TaskId) -> Option<TaskState> {
    critical_section(|cs| {
        let kcb = KCB.get(cs);
        kcb.tasks.slot_of(id).and_then(|s| kcb.tasks.get(s)).map(|t| t.state)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel;
    use crate::test_support::kernel_guard;

    fn entry_a() -> ! {
        loop {}
    }

    fn entry_b() -> ! {
        loop {}
    }

    #[test]
    fn spawn_assigns_monotonic_ids_from_one() {
        let _g = kernel_guard();
        kernel::init();

        let a = task_spawn(entry_a, 1024);
        let b = task_spawn(entry_b, 1024);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(task_count(), 2);
        assert_eq!(task_state(a), Some(TaskState::Ready));
        assert_eq!(task_idref(entry_b), Ok(b));
    }

    #[test]
    fn spawn_enforces_minimum_stack_and_canaries() {
        let _g = kernel_guard();
        kernel::init();

        let id = task_spawn(entry_a, 8);
        critical_section(|cs| {
            let kcb = KCB.get(cs);
            let tcb = kcb.tasks.find_mut(id).unwrap();
            assert!(tcb.stack.size() >= MIN_STACK_SIZE);
            assert_eq!(tcb.stack.size() % 16, 0);
            assert!(tcb.stack.canaries_intact());
        });
    }

    #[test]
    fn cancel_rules() {
        let _g = kernel_guard();
        kernel::init();

        let a = task_spawn(entry_a, 1024);
        let b = task_spawn(entry_b, 1024);

        // First spawn becomes current; make it RUNNING as the dispatcher
        // would.
        critical_section(|cs| {
            let kcb = KCB.get(cs);
            kcb.tasks.find_mut(a).unwrap().state = TaskState::Running;
        });

        assert_eq!(task_cancel(0), Err(KernelError::TaskCantRemove));
        assert_eq!(task_cancel(a), Err(KernelError::TaskCantRemove));
        assert_eq!(task_cancel(999), Err(KernelError::TaskNotFound));
        assert_eq!(task_cancel(b), Ok(()));
        assert_eq!(task_count(), 1);
        assert_eq!(task_state(b), None);
    }

    #[test]
    fn slot_reuse_keeps_ids_unique() {
        let _g = kernel_guard();
        kernel::init();

        let _a = task_spawn(entry_a, 1024);
        let b = task_spawn(entry_b, 1024);
        task_cancel(b).unwrap();
        let c = task_spawn(entry_b, 1024);
        assert_eq!(c, 3);
        assert_eq!(task_count(), 2);
    }

    #[test]
    fn suspend_resume_roundtrip() {
        let _g = kernel_guard();
        kernel::init();

        let _a = task_spawn(entry_a, 1024);
        let b = task_spawn(entry_b, 1024);

        assert_eq!(task_suspend(b), Ok(()));
        assert_eq!(task_state(b), Some(TaskState::Suspended));
        assert_eq!(task_suspend(b), Err(KernelError::TaskCantSuspend));
        assert_eq!(task_resume(b), Ok(()));
        assert_eq!(task_state(b), Some(TaskState::Ready));
        assert_eq!(task_resume(b), Err(KernelError::TaskCantResume));
    }

    #[test]
    fn suspend_of_blocked_task_defers_wakeup() {
        let _g = kernel_guard();
        kernel::init();

        let _a = task_spawn(entry_a, 1024);
        let b = task_spawn(entry_b, 1024);

        critical_section(|cs| {
            let kcb = KCB.get(cs);
            let tcb = kcb.tasks.find_mut(b).unwrap();
            tcb.state = TaskState::Blocked;
            tcb.delay = 0;
        });

        task_suspend(b).unwrap();
        // Resume without any wakeup: still waiting.
        task_resume(b).unwrap();
        assert_eq!(task_state(b), Some(TaskState::Blocked));

        // Suspend again, deliver the wakeup, then resume: READY.
        task_suspend(b).unwrap();
        critical_section(|cs| {
            KCB.get(cs).tasks.find_mut(b).unwrap().wake_pending = true;
        });
        task_resume(b).unwrap();
        assert_eq!(task_state(b), Some(TaskState::Ready));
    }

    #[test]
    fn priority_change_reloads_counter() {
        let _g = kernel_guard();
        kernel::init();

        let a = task_spawn(entry_a, 1024);
        assert_eq!(task_priority(a, Priority::HIGH), Ok(()));
        critical_section(|cs| {
            let tcb = KCB.get(cs).tasks.find_mut(a).unwrap();
            assert_eq!(tcb.prio.base(), 0x07);
            assert_eq!(tcb.prio.counter(), 0x07);
        });
        assert_eq!(
            task_priority(0, Priority::HIGH),
            Err(KernelError::TaskInvalidPrio)
        );
        assert_eq!(
            task_priority(99, Priority::HIGH),
            Err(KernelError::TaskNotFound)
        );
    }
}
