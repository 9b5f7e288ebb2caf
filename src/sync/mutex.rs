//! Non-recursive mutex
//!
//! Ownership is tracked by task id (0 = free) and handed off directly on
//! unlock: the oldest waiter becomes the owner before it even runs, so the
//! lock is never observably free while tasks are queued. Re-locking by the
//! owner fails rather than nesting.

use crate::critical::{critical_section, CriticalSection, CsCell};
use crate::error::{fatal, KernelError, KernelResult};
use crate::kernel::{self, KCB};
use crate::sched;
use crate::sync::WaitQueue;
use crate::task;
use crate::types::{TaskId, Ticks};

struct MutexInner {
    wait_q: WaitQueue,
    owner: TaskId,
    active: bool,
}

/// Non-recursive mutex with FIFO ownership handoff.
pub struct Mutex {
    inner: CsCell<MutexInner>,
}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex {
            inner: CsCell::new(MutexInner {
                wait_q: WaitQueue::unbounded(),
                owner: 0,
                active: true,
            }),
        }
    }

    fn caller() -> TaskId {
        let kcb = unsafe { KCB.get_unchecked() };
        task::current_id(kcb)
    }

    /// Acquire the mutex, blocking while another task owns it. Re-locking
    /// by the owner returns `TaskBusy`.
    pub fn lock(&self) -> KernelResult<()> {
        let cs = CriticalSection::enter();
        let me = Self::caller();
        if me == 0 {
            return Err(KernelError::Fail);
        }
        {
            let m = self.inner.get(&cs);
            if !m.active {
                fatal(KernelError::SemOperation);
            }
            if m.owner == me {
                return Err(KernelError::TaskBusy);
            }
            if m.owner == 0 {
                m.owner = me;
                return Ok(());
            }
        }
        // Slow path: block until unlock transfers ownership to us.
        {
            let m = self.inner.get(&cs);
            sched::block_current(&mut m.wait_q);
        }
        drop(cs);
        Ok(())
    }

    /// Acquire without blocking; `TaskBusy` if anyone (including the
    /// caller) owns it.
    pub fn trylock(&self) -> KernelResult<()> {
        critical_section(|cs| {
            let me = Self::caller();
            let m = self.inner.get(cs);
            if !m.active {
                return Err(KernelError::Fail);
            }
            if m.owner == 0 && me != 0 {
                m.owner = me;
                Ok(())
            } else {
                Err(KernelError::TaskBusy)
            }
        })
    }

    /// Acquire with a deadline, polling between yields. The caller joins
    /// the wait queue but keeps running; if ownership does not arrive
    /// within `ticks`, it removes itself and reports `Timeout`.
    pub fn timedlock(&self, ticks: Ticks) -> KernelResult<()> {
        if ticks == 0 {
            return self.trylock();
        }

        let me = {
            let cs = CriticalSection::enter();
            let me = Self::caller();
            if me == 0 {
                return Err(KernelError::Fail);
            }
            let m = self.inner.get(&cs);
            if !m.active {
                return Err(KernelError::Fail);
            }
            if m.owner == me {
                return Err(KernelError::TaskBusy);
            }
            if m.owner == 0 {
                m.owner = me;
                return Ok(());
            }
            if m.wait_q.push(me).is_err() {
                fatal(KernelError::SemOperation);
            }
            clear_pending(me);
            me
        };

        let start = kernel::ticks();
        loop {
            let owned =
                critical_section(|cs| self.inner.get(cs).owner == me);
            if owned {
                critical_section(|_cs| clear_pending(me));
                return Ok(());
            }
            if kernel::ticks().wrapping_sub(start) >= ticks {
                break;
            }
            sched::yield_now();
        }

        // Deadline passed; arbitrate against a last-instant handoff.
        critical_section(|cs| {
            let m = self.inner.get(cs);
            if m.owner == me {
                clear_pending(me);
                Ok(())
            } else {
                m.wait_q.remove(me);
                clear_pending(me);
                Err(KernelError::Timeout)
            }
        })
    }

    /// Release the mutex. The oldest waiter, if any, becomes the owner and
    /// is made READY; otherwise the mutex becomes free.
    pub fn unlock(&self) -> KernelResult<()> {
        critical_section(|cs| {
            let me = Self::caller();
            let m = self.inner.get(cs);
            if !m.active {
                return Err(KernelError::Fail);
            }
            if m.owner != me {
                return Err(KernelError::NotOwner);
            }
            match sched::wake_one(&mut m.wait_q) {
                Some(next) => m.owner = next,
                None => m.owner = 0,
            }
            Ok(())
        })
    }

    /// True if the calling task owns the mutex.
    pub fn owned_by_current(&self) -> bool {
        critical_section(|cs| {
            let me = Self::caller();
            let m = self.inner.get(cs);
            m.active && me != 0 && m.owner == me
        })
    }

    /// Number of tasks queued for ownership.
    pub fn waiting_count(&self) -> usize {
        critical_section(|cs| self.inner.get(cs).wait_q.len())
    }

    /// Tear the mutex down. Fails while it is owned or has waiters.
    pub fn destroy(&self) -> KernelResult<()> {
        critical_section(|cs| {
            let m = self.inner.get(cs);
            if !m.active {
                return Err(KernelError::Fail);
            }
            if m.owner != 0 || !m.wait_q.is_empty() {
                return Err(KernelError::TaskBusy);
            }
            m.active = false;
            Ok(())
        })
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Clear a task's pending-wake flag. Must run inside a critical section.
fn clear_pending(id: TaskId) {
    let kcb = unsafe { KCB.get_unchecked() };
    if let Some(t) = kcb.tasks.find_mut(id) {
        t.wake_pending = false;
    }
}
