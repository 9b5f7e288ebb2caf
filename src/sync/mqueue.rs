//! Message queue
//!
//! A thin, typed wrapper over a bounded FIFO. Messages move by value:
//! `enqueue` hands the message back on a full queue instead of dropping it,
//! `dequeue` and `peek` report an empty queue as `None`.

use alloc::collections::VecDeque;

use crate::critical::{critical_section, CsCell};
use crate::error::{fatal, KernelError, KernelResult};

struct MqInner<T> {
    q: VecDeque<T>,
    cap: usize,
    active: bool,
}

/// Bounded FIFO of messages.
pub struct MessageQueue<T> {
    inner: CsCell<MqInner<T>>,
}

impl<T> MessageQueue<T> {
    /// Create a queue holding at most `max_items` messages.
    pub fn new(max_items: u16) -> KernelResult<MessageQueue<T>> {
        if max_items == 0 {
            return Err(KernelError::Fail);
        }
        Ok(MessageQueue {
            inner: CsCell::new(MqInner {
                q: VecDeque::new(),
                cap: max_items as usize,
                active: true,
            }),
        })
    }

    /// Append a message. A full queue returns the message to the caller.
    pub fn enqueue(&self, msg: T) -> Result<(), T> {
        critical_section(|cs| {
            let mq = self.inner.get(cs);
            if !mq.active {
                fatal(KernelError::SemOperation);
            }
            if mq.q.len() >= mq.cap {
                return Err(msg);
            }
            mq.q.push_back(msg);
            Ok(())
        })
    }

    /// Remove and return the oldest message.
    pub fn dequeue(&self) -> Option<T> {
        critical_section(|cs| {
            let mq = self.inner.get(cs);
            if !mq.active {
                fatal(KernelError::SemOperation);
            }
            mq.q.pop_front()
        })
    }

    /// Number of queued messages.
    pub fn count(&self) -> usize {
        critical_section(|cs| self.inner.get(cs).q.len())
    }

    /// Tear the queue down; refuses while messages are still queued.
    pub fn destroy(&self) -> KernelResult<()> {
        critical_section(|cs| {
            let mq = self.inner.get(cs);
            if !mq.active {
                return Err(KernelError::Fail);
            }
            if !mq.q.is_empty() {
                return Err(KernelError::MqNotEmpty);
            }
            mq.active = false;
            Ok(())
        })
    }
}

impl<T: Copy> MessageQueue<T> {
    /// Inspect the oldest message without removing it.
    pub fn peek(&self) -> Option<T> {
        critical_section(|cs| {
            let mq = self.inner.get(cs);
            if !mq.active {
                fatal(KernelError::SemOperation);
            }
            mq.q.front().copied()
        })
    }
}
