//! Counting semaphore
//!
//! Token-passing wakeup: on `signal`, either the count is incremented or a
//! waiter moves from BLOCKED to READY - never both. Between a `signal` and
//! the awakened `wait` returning, no third party can steal the token, and
//! `trywait` refuses to overtake queued waiters, so the wait queue is served
//! in strict FIFO order.

use crate::config::SEM_MAX_COUNT;
use crate::critical::{critical_section, CriticalSection, CsCell};
use crate::error::{fatal, KernelError, KernelResult};
use crate::kernel;
use crate::sched;
use crate::sync::WaitQueue;

struct SemInner {
    wait_q: WaitQueue,
    count: i32,
    active: bool,
}

/// Counting semaphore with a bounded FIFO wait queue.
pub struct Semaphore {
    inner: CsCell<SemInner>,
}

impl Semaphore {
    /// Create a semaphore holding `initial` tokens, with room for at most
    /// `max_waiters` blocked tasks.
    pub fn new(max_waiters: u16, initial: i32) -> KernelResult<Semaphore> {
        if max_waiters == 0 || initial < 0 || initial > SEM_MAX_COUNT {
            return Err(KernelError::Fail);
        }
        Ok(Semaphore {
            inner: CsCell::new(SemInner {
                wait_q: WaitQueue::bounded(max_waiters as usize),
                count: initial,
                active: true,
            }),
        })
    }

    /// Acquire a token, blocking until one is available.
    ///
    /// Fast path: a token is free and nobody is queued. Slow path: the
    /// caller joins the wait queue and blocks; when it returns, the token
    /// was handed to it directly by a signaler.
    pub fn wait(&self) {
        let cs = CriticalSection::enter();
        let must_block = {
            let s = self.inner.get(&cs);
            if !s.active {
                fatal(KernelError::SemOperation);
            }
            if s.count > 0 && s.wait_q.is_empty() {
                s.count -= 1;
                false
            } else {
                // Queue overflow on a validated semaphore is a system error.
                if s.wait_q.len() >= s.wait_q.capacity() {
                    fatal(KernelError::SemOperation);
                }
                true
            }
        };
        if must_block {
            let s = self.inner.get(&cs);
            sched::block_current(&mut s.wait_q);
            // Awakened: the signaler did not increment the count; the token
            // was passed directly to us.
        }
        drop(cs);
    }

    /// Acquire a token without blocking. Fails if no token is free or if
    /// waiters are queued (FIFO is preserved under contention).
    pub fn trywait(&self) -> KernelResult<()> {
        critical_section(|cs| {
            let s = self.inner.get(cs);
            if !s.active {
                return Err(KernelError::Fail);
            }
            if s.count > 0 && s.wait_q.is_empty() {
                s.count -= 1;
                Ok(())
            } else {
                Err(KernelError::Fail)
            }
        })
    }

    /// Release a token. Wakes the oldest waiter if there is one (the token
    /// passes to it directly), otherwise increments the count, saturating
    /// at [`SEM_MAX_COUNT`].
    pub fn signal(&self) {
        let woke = critical_section(|cs| {
            let s = self.inner.get(cs);
            if !s.active {
                fatal(KernelError::SemOperation);
            }
            if sched::wake_one(&mut s.wait_q).is_some() {
                true
            } else {
                if s.count < SEM_MAX_COUNT {
                    s.count += 1;
                }
                false
            }
        });

        // Yield outside the critical section so a higher-priority waiter
        // can run promptly.
        if woke && !kernel::in_interrupt() {
            sched::yield_now();
        }
    }

    /// Current token count. Inherently racy; diagnostic only.
    pub fn value(&self) -> i32 {
        critical_section(|cs| self.inner.get(cs).count)
    }

    /// Number of tasks queued on this semaphore.
    pub fn waiting_count(&self) -> usize {
        critical_section(|cs| self.inner.get(cs).wait_q.len())
    }

    /// Tear the semaphore down. Fails while tasks are waiting on it;
    /// afterwards any operation on it is a fatal protocol violation.
    pub fn destroy(&self) -> KernelResult<()> {
        critical_section(|cs| {
            let s = self.inner.get(cs);
            if !s.active {
                return Err(KernelError::Fail);
            }
            if !s.wait_q.is_empty() {
                return Err(KernelError::TaskBusy);
            }
            s.active = false;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KCB;
    use crate::task::{task_spawn, task_state};
    use crate::test_support::kernel_guard;
    use crate::types::{TaskId, TaskState};

    fn entry_a() -> ! {
        loop {}
    }

    fn entry_b() -> ! {
        loop {}
    }

    fn entry_c() -> ! {
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
    fn fast_path_and_trywait() {
        let _g = kernel_guard();
        crate::kernel::init();
        let _a = task_spawn(entry_a, 1024);

        let sem = Semaphore::new(4, 2).unwrap();
        sem.wait();
        assert_eq!(sem.value(), 1);
        assert_eq!(sem.trywait(), Ok(()));
        assert_eq!(sem.value(), 0);
        assert_eq!(sem.trywait(), Err(KernelError::Fail));
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(Semaphore::new(0, 1).is_err());
        assert!(Semaphore::new(4, -1).is_err());
    }

    #[test]
    fn signal_hands_token_to_waiters_in_fifo_order() {
        let _g = kernel_guard();
        crate::kernel::init();
        let a = task_spawn(entry_a, 1024);
        let b = task_spawn(entry_b, 1024);
        let c = task_spawn(entry_c, 1024);

        let sem = Semaphore::new(4, 0).unwrap();

        // On the host a context switch is a no-op, so wait() returns with
        // the caller left BLOCKED on the queue.
        set_current(a);
        sem.wait();
        set_current(b);
        sem.wait();
        assert_eq!(sem.waiting_count(), 2);
        assert_eq!(task_state(a), Some(TaskState::Blocked));
        assert_eq!(task_state(b), Some(TaskState::Blocked));

        // Signal from a third task: oldest waiter first, count untouched.
        set_current(c);
        sem.signal();
        assert_eq!(task_state(a), Some(TaskState::Ready));
        assert_eq!(task_state(b), Some(TaskState::Blocked));
        assert_eq!(sem.value(), 0);

        sem.signal();
        assert_eq!(task_state(b), Some(TaskState::Ready));
        assert_eq!(sem.value(), 0);

        // No waiters left: the token lands in the count.
        sem.signal();
        assert_eq!(sem.value(), 1);
    }

    #[test]
    fn trywait_refuses_to_overtake_queued_waiters() {
        let _g = kernel_guard();
        crate::kernel::init();
        let a = task_spawn(entry_a, 1024);
        let b = task_spawn(entry_b, 1024);

        let sem = Semaphore::new(4, 0).unwrap();
        set_current(a);
        sem.wait();

        // Force a token into the count while a waiter is queued; trywait
        // must not steal it.
        critical_section(|cs| sem.inner.get(cs).count = 1);
        set_current(b);
        assert_eq!(sem.trywait(), Err(KernelError::Fail));
    }

    #[test]
    fn destroy_refuses_while_waiters_queued() {
        let _g = kernel_guard();
        crate::kernel::init();
        let a = task_spawn(entry_a, 1024);

        let sem = Semaphore::new(4, 0).unwrap();
        set_current(a);
        sem.wait();
        assert_eq!(sem.destroy(), Err(KernelError::TaskBusy));

        sem.signal();
        assert_eq!(sem.destroy(), Ok(()));
        assert_eq!(sem.destroy(), Err(KernelError::Fail));
    }

    #[test]
    #[should_panic(expected = "kernel halted")]
    fn wait_on_destroyed_semaphore_is_fatal() {
        let _g = kernel_guard();
        crate::kernel::init();
        let _a = task_spawn(entry_a, 1024);

        let sem = Semaphore::new(4, 1).unwrap();
        sem.destroy().unwrap();
        sem.wait();
    }
}
