//! Condition variable
//!
//! Waiting requires holding the associated mutex; the wait atomically joins
//! the queue and blocks before the mutex is released, so a signal issued
//! after `wait` started can never be lost. Woken tasks re-acquire the mutex
//! before returning.
//!
//! Signaling without holding the mutex is permitted; callers that want to
//! avoid thundering re-acquisition should signal while holding it.

use crate::critical::{critical_section, CsCell};
use crate::error::{fatal, KernelError, KernelResult};
use crate::kernel::{self, KCB};
use crate::sched;
use crate::sync::mutex::Mutex;
use crate::sync::WaitQueue;
use crate::task;
use crate::types::{TaskId, TaskState, Ticks};

struct CondInner {
    wait_q: WaitQueue,
    active: bool,
}

/// Condition variable bound to a mutex at wait time.
pub struct Condvar {
    inner: CsCell<CondInner>,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            inner: CsCell::new(CondInner {
                wait_q: WaitQueue::unbounded(),
                active: true,
            }),
        }
    }

    /// Release `m`, wait for a signal, then re-acquire `m`.
    ///
    /// Fails with `NotOwner` when the caller does not hold `m`. The queue
    /// insertion and the BLOCKED transition happen in one critical section,
    /// before the unlock, closing the lost-wakeup window.
    pub fn wait(&self, m: &Mutex) -> KernelResult<()> {
        if !m.owned_by_current() {
            return Err(KernelError::NotOwner);
        }
        let me = task::task_id();

        critical_section(|cs| {
            let c = self.inner.get(cs);
            if !c.active {
                fatal(KernelError::SemOperation);
            }
            if c.wait_q.push(me).is_err() {
                fatal(KernelError::SemOperation);
            }
            let kcb = KCB.get(cs);
            if let Some(t) = kcb.tasks.find_mut(me) {
                t.state = TaskState::Blocked;
            }
        });

        if let Err(e) = m.unlock() {
            // Back out: we never actually waited.
            critical_section(|cs| {
                self.inner.get(cs).wait_q.remove(me);
                let kcb = KCB.get(cs);
                if let Some(t) = kcb.tasks.find_mut(me) {
                    t.state = TaskState::Ready;
                }
            });
            return Err(e);
        }

        sched::yield_now();

        m.lock()
    }

    /// [`Condvar::wait`] with a deadline. The caller keeps polling between
    /// yields; on expiry it removes itself from the queue and reports
    /// `Timeout`. The mutex is re-acquired on both outcomes.
    pub fn timedwait(&self, m: &Mutex, ticks: Ticks) -> KernelResult<()> {
        if ticks == 0 {
            return Err(KernelError::Timeout);
        }
        if !m.owned_by_current() {
            return Err(KernelError::NotOwner);
        }
        let me = task::task_id();

        critical_section(|cs| {
            let c = self.inner.get(cs);
            if !c.active {
                fatal(KernelError::SemOperation);
            }
            if c.wait_q.push(me).is_err() {
                fatal(KernelError::SemOperation);
            }
            clear_pending(me);
        });

        if let Err(e) = m.unlock() {
            critical_section(|cs| {
                self.inner.get(cs).wait_q.remove(me);
                clear_pending(me);
            });
            return Err(e);
        }

        let start = kernel::ticks();
        let status = loop {
            let signaled = critical_section(|_cs| take_pending(me));
            if signaled {
                break Ok(());
            }
            if kernel::ticks().wrapping_sub(start) >= ticks {
                // Arbitrate against a last-instant signal.
                break critical_section(|cs| {
                    if take_pending(me) {
                        Ok(())
                    } else {
                        self.inner.get(cs).wait_q.remove(me);
                        Err(KernelError::Timeout)
                    }
                });
            }
            sched::yield_now();
        };

        // Re-acquire regardless of the outcome; a timeout wins over the
        // lock result.
        let lock_result = m.lock();
        match status {
            Err(KernelError::Timeout) => Err(KernelError::Timeout),
            _ => lock_result,
        }
    }

    /// Wake the oldest waiter, if any.
    pub fn signal(&self) -> KernelResult<()> {
        critical_section(|cs| {
            let c = self.inner.get(cs);
            if !c.active {
                return Err(KernelError::Fail);
            }
            sched::wake_one(&mut c.wait_q);
            Ok(())
        })
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> KernelResult<()> {
        critical_section(|cs| {
            let c = self.inner.get(cs);
            if !c.active {
                return Err(KernelError::Fail);
            }
            sched::wake_all(&mut c.wait_q);
            Ok(())
        })
    }

    /// Number of tasks waiting on this condition.
    pub fn waiting_count(&self) -> usize {
        critical_section(|cs| self.inner.get(cs).wait_q.len())
    }

    /// Tear the condvar down. Fails while tasks are waiting.
    pub fn destroy(&self) -> KernelResult<()> {
        critical_section(|cs| {
            let c = self.inner.get(cs);
            if !c.active {
                return Err(KernelError::Fail);
            }
            if !c.wait_q.is_empty() {
                return Err(KernelError::TaskBusy);
            }
            c.active = false;
            Ok(())
        })
    }
}

impl Default for Condvar {
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

/// Consume a task's pending-wake flag. Must run inside a critical section.
fn take_pending(id: TaskId) -> bool {
    let kcb = unsafe { KCB.get_unchecked() };
    match kcb.tasks.find_mut(id) {
        Some(t) => {
            let was = t.wake_pending;
            t.wake_pending = false;
            was
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KERNEL;
    use crate::task::{task_spawn, task_state};
    use crate::test_support::kernel_guard;

    fn entry_a() -> ! {
        loop {}
    }

    fn entry_b() -> ! {
        loop {}
    }

    fn set_current(id: TaskId) {
        critical_section(|cs| {
            let kcb = KCB.get(cs);
            let slot = kcb.tasks.slot_of(id).unwrap();
            kcb.current = Some(slot);
        });
    }

    #[test]
    fn wait_requires_mutex_ownership() {
        let _g = kernel_guard();
        crate::kernel::init();
        let a = task_spawn(entry_a, 1024);
        set_current(a);

        let m = Mutex::new();
        let c = Condvar::new();
        assert_eq!(c.wait(&m), Err(KernelError::NotOwner));
        assert_eq!(c.timedwait(&m, 5), Err(KernelError::NotOwner));
    }

    #[test]
    fn signal_wakes_oldest_blocked_waiter() {
        let _g = kernel_guard();
        crate::kernel::init();
        let a = task_spawn(entry_a, 1024);
        let b = task_spawn(entry_b, 1024);

        let c = Condvar::new();
        // Stage two blocked waiters directly.
        critical_section(|cs| {
            let inner = c.inner.get(cs);
            inner.wait_q.push(a).unwrap();
            inner.wait_q.push(b).unwrap();
            let kcb = KCB.get(cs);
            kcb.tasks.find_mut(a).unwrap().state = TaskState::Blocked;
            kcb.tasks.find_mut(b).unwrap().state = TaskState::Blocked;
        });

        c.signal().unwrap();
        assert_eq!(task_state(a), Some(TaskState::Ready));
        assert_eq!(task_state(b), Some(TaskState::Blocked));
        assert_eq!(c.waiting_count(), 1);

        c.broadcast().unwrap();
        assert_eq!(task_state(b), Some(TaskState::Ready));
        assert_eq!(c.waiting_count(), 0);
    }

    #[test]
    fn wait_releases_and_reacquires_the_mutex() {
        let _g = kernel_guard();
        crate::kernel::init();
        let a = task_spawn(entry_a, 1024);
        set_current(a);

        let m = Mutex::new();
        let c = Condvar::new();
        m.lock().unwrap();

        // On the host the yield is a no-op, so wait() runs to completion:
        // enqueue, unlock, "block", then re-lock.
        c.wait(&m).unwrap();
        assert!(m.owned_by_current());
        assert_eq!(c.waiting_count(), 1);
    }

    #[test]
    fn timedwait_times_out_and_reacquires() {
        let _g = kernel_guard();
        crate::kernel::init();
        let a = task_spawn(entry_a, 1024);
        let _b = task_spawn(entry_b, 1024);
        set_current(a);

        let m = Mutex::new();
        let c = Condvar::new();
        m.lock().unwrap();

        KERNEL.set_running(true);
        assert_eq!(c.timedwait(&m, 10), Err(KernelError::Timeout));
        assert_eq!(c.waiting_count(), 0);
        assert!(m.owned_by_current());
    }

    #[test]
    fn zero_timeout_does_not_wait() {
        let _g = kernel_guard();
        crate::kernel::init();
        let a = task_spawn(entry_a, 1024);
        set_current(a);

        let m = Mutex::new();
        let c = Condvar::new();
        m.lock().unwrap();
        assert_eq!(c.timedwait(&m, 0), Err(KernelError::Timeout));
        assert!(m.owned_by_current());
    }

    #[test]
    fn destroy_refuses_while_waiters_queued() {
        let _g = kernel_guard();
        crate::kernel::init();
        let a = task_spawn(entry_a, 1024);

        let c = Condvar::new();
        critical_section(|cs| {
            c.inner.get(cs).wait_q.push(a).unwrap();
            let kcb = KCB.get(cs);
            kcb.tasks.find_mut(a).unwrap().state = TaskState::Blocked;
        });
        assert_eq!(c.destroy(), Err(KernelError::TaskBusy));
        c.signal().unwrap();
        assert_eq!(c.destroy(), Ok(()));
    }
}
