//! Host-side tests for the public kernel surface
//!
//! These run on the host through the stub port: context switches are
//! no-ops, so the assertions target the kernel's state machines and the
//! pure data structures rather than true concurrency.

use std::sync::{Mutex, MutexGuard};

use kestrel::{
    kernel, task_cancel, task_count, task_idref, task_priority, task_resume,
    task_spawn, task_suspend, KernelError, MessageQueue, Pipe, Priority,
    TaskState,
};

// The kernel is a process-wide singleton; serialize every test that
// touches it.
static KERNEL_LOCK: Mutex<()> = Mutex::new(());

fn kernel_guard() -> MutexGuard<'static, ()> {
    KERNEL_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

mod priority_tests {
    use super::*;

    #[test]
    fn eight_named_levels() {
        assert_eq!(Priority::CRIT.encoded(), 0x0101);
        assert_eq!(Priority::REALTIME.encoded(), 0x0303);
        assert_eq!(Priority::HIGH.encoded(), 0x0707);
        assert_eq!(Priority::ABOVE.encoded(), 0x0F0F);
        assert_eq!(Priority::NORMAL.encoded(), 0x1F1F);
        assert_eq!(Priority::BELOW.encoded(), 0x3F3F);
        assert_eq!(Priority::LOW.encoded(), 0x7F7F);
        assert_eq!(Priority::IDLE.encoded(), 0xFFFF);
    }

    #[test]
    fn lower_base_means_higher_priority() {
        assert!(Priority::CRIT.base() < Priority::REALTIME.base());
        assert!(Priority::REALTIME.base() < Priority::HIGH.base());
        assert!(Priority::HIGH.base() < Priority::NORMAL.base());
        assert!(Priority::NORMAL.base() < Priority::IDLE.base());
    }

    #[test]
    fn arbitrary_encodings_are_rejected() {
        assert!(Priority::from_encoded(0x0505).is_none());
        assert!(Priority::from_encoded(0x1F0F).is_none());
        assert_eq!(Priority::from_encoded(0x0707), Some(Priority::HIGH));
    }
}

mod error_tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let all = [
            KernelError::Fail,
            KernelError::TaskBusy,
            KernelError::TaskNotFound,
            KernelError::TaskCantRemove,
            KernelError::TaskCantSuspend,
            KernelError::TaskCantResume,
            KernelError::TaskInvalidPrio,
            KernelError::SemOperation,
            KernelError::NotOwner,
            KernelError::Timeout,
            KernelError::MqNotEmpty,
            KernelError::StackCheck,
            KernelError::StackAlloc,
            KernelError::TcbAlloc,
            KernelError::KcbAlloc,
            KernelError::NoTasks,
            KernelError::Unknown,
        ];
        let mut seen = std::collections::HashSet::new();
        for e in all {
            assert!(e.code() < 0);
            assert!(seen.insert(e.code()), "duplicate code {}", e.code());
        }
    }

    #[test]
    fn errors_format_for_debugging() {
        let err = KernelError::Timeout;
        let _ = format!("{err:?}");
        assert_eq!(err.description(), "operation timed out");
    }
}

mod task_tests {
    use super::*;

    fn worker() -> ! {
        loop {}
    }

    fn other_worker() -> ! {
        loop {}
    }

    #[test]
    fn spawn_count_and_reverse_lookup() {
        let _g = kernel_guard();
        kernel::init();

        assert_eq!(task_count(), 0);
        let a = task_spawn(worker, 2048);
        let b = task_spawn(other_worker, 2048);
        assert_eq!(task_count(), 2);
        assert_eq!(task_idref(worker), Ok(a));
        assert_eq!(task_idref(other_worker), Ok(b));
        assert_eq!(
            kestrel::task::task_state(a),
            Some(TaskState::Ready)
        );
    }

    #[test]
    fn cancel_updates_count() {
        let _g = kernel_guard();
        kernel::init();

        let _a = task_spawn(worker, 2048);
        let b = task_spawn(other_worker, 2048);
        assert_eq!(task_cancel(b), Ok(()));
        assert_eq!(task_count(), 1);
        assert_eq!(task_cancel(b), Err(KernelError::TaskNotFound));
        assert_eq!(task_idref(other_worker), Err(KernelError::TaskNotFound));
    }

    #[test]
    fn suspend_and_resume_via_public_api() {
        let _g = kernel_guard();
        kernel::init();

        let _a = task_spawn(worker, 2048);
        let b = task_spawn(other_worker, 2048);
        assert_eq!(task_suspend(b), Ok(()));
        assert_eq!(
            kestrel::task::task_state(b),
            Some(TaskState::Suspended)
        );
        assert_eq!(task_resume(b), Ok(()));
        assert_eq!(kestrel::task::task_state(b), Some(TaskState::Ready));
    }

    #[test]
    fn priority_accepts_only_named_levels() {
        let _g = kernel_guard();
        kernel::init();

        let a = task_spawn(worker, 2048);
        assert_eq!(task_priority(a, Priority::REALTIME), Ok(()));
        assert_eq!(
            task_priority(0, Priority::REALTIME),
            Err(KernelError::TaskInvalidPrio)
        );
    }
}

mod mqueue_tests {
    use super::*;

    #[test]
    fn queue_carries_opaque_messages() {
        #[derive(Debug, PartialEq, Clone, Copy)]
        struct Msg {
            kind: u8,
            payload: u32,
        }

        let mq = MessageQueue::new(3).unwrap();
        mq.enqueue(Msg {
            kind: 1,
            payload: 0xAA,
        })
        .unwrap();
        mq.enqueue(Msg {
            kind: 2,
            payload: 0xBB,
        })
        .unwrap();

        assert_eq!(mq.count(), 2);
        assert_eq!(
            mq.peek(),
            Some(Msg {
                kind: 1,
                payload: 0xAA
            })
        );
        assert_eq!(mq.dequeue().unwrap().kind, 1);
        assert_eq!(mq.dequeue().unwrap().kind, 2);
        assert!(mq.dequeue().is_none());
    }

    #[test]
    fn destroy_fails_on_non_empty_queue() {
        let mq = MessageQueue::new(2).unwrap();
        mq.enqueue(7u32).unwrap();
        assert_eq!(mq.destroy(), Err(KernelError::MqNotEmpty));
        assert_eq!(mq.dequeue(), Some(7));
        assert_eq!(mq.destroy(), Ok(()));
    }
}

mod pipe_tests {
    use super::*;

    #[test]
    fn eight_byte_pipe_scenario() {
        // Capacity 8: "HELLOHEL" fits without blocking, the 9th byte does
        // not; draining 3 makes room for exactly 3 more.
        let p = Pipe::new(8).unwrap();
        assert_eq!(p.capacity(), 8);

        assert_eq!(p.nbwrite(b"HELLOHEL"), 8);
        assert_eq!(p.nbwrite(b"X"), 0);

        let mut drained = [0u8; 3];
        assert_eq!(p.nbread(&mut drained), 3);
        assert_eq!(p.nbwrite(b"LOW"), 3);
        assert_eq!(p.len(), 8);
    }

    #[test]
    fn odd_sizes_round_up() {
        assert_eq!(Pipe::new(3).unwrap().capacity(), 4);
        assert_eq!(Pipe::new(9).unwrap().capacity(), 16);
    }
}

mod time_tests {
    use super::*;

    #[test]
    fn ticks_start_at_zero_after_init() {
        let _g = kernel_guard();
        kernel::init();
        assert_eq!(kestrel::ticks(), 0);
        assert_eq!(kestrel::uptime(), 0);
    }

    #[test]
    fn tick_interrupt_is_ignored_before_boot() {
        let _g = kernel_guard();
        kernel::init();
        kestrel::tick_interrupt();
        assert_eq!(kestrel::ticks(), 0);
    }
}
