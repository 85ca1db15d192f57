//! Per-task mailboxes.
//!
//! A mailbox is a bounded lock-free FIFO plus a waker slot. Interrupt
//! handlers push and wake; the owning task pops, parking on the waker when
//! the queue runs dry. All operations are safe from interrupt context.

use alloc::sync::Arc;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::task::{Context, Poll, Waker};
use crossbeam_queue::ArrayQueue;

use super::message::Message;
use crate::constants::tasks::MAILBOX_CAPACITY;
use crate::error::{ErrorKind, KernelResult};

/// Single-slot waker cell usable from interrupt context.
#[derive(Debug)]
pub struct AtomicWaker {
    state: AtomicUsize,
    waker: ArrayQueue<Waker>,
}

impl AtomicWaker {
    const EMPTY: usize = 0;
    const REGISTERING: usize = 1;
    const READY: usize = 2;

    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(Self::EMPTY),
            waker: ArrayQueue::new(1),
        }
    }

    pub fn register(&self, waker: &Waker) {
        if self
            .state
            .compare_exchange(
                Self::EMPTY,
                Self::REGISTERING,
                Ordering::Acquire,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let _ = self.waker.pop();
            let _ = self.waker.push(waker.clone());
            self.state.store(Self::READY, Ordering::Release);
            return;
        }
        // Racing with a wake or a stale registration: replace the stored
        // waker unless it already wakes the same task.
        if let Some(existing) = self.waker.pop() {
            if existing.will_wake(waker) {
                let _ = self.waker.push(existing);
            } else {
                let _ = self.waker.push(waker.clone());
            }
            self.state.store(Self::READY, Ordering::Release);
        }
    }

    pub fn wake(&self) {
        if self.state.swap(Self::EMPTY, Ordering::AcqRel) == Self::READY {
            if let Some(waker) = self.waker.pop() {
                waker.wake();
            }
        }
    }
}

impl Default for AtomicWaker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Mailbox {
    queue: ArrayQueue<Message>,
    waker: AtomicWaker,
}

impl Mailbox {
    pub fn new() -> Arc<Mailbox> {
        Arc::new(Mailbox {
            queue: ArrayQueue::new(MAILBOX_CAPACITY),
            waker: AtomicWaker::new(),
        })
    }

    /// Enqueues a message and wakes the owner. `Full` when the queue has no
    /// room; the message is dropped in that case.
    pub fn post(&self, msg: Message) -> KernelResult<()> {
        self.queue.push(msg).map_err(|_| ErrorKind::Full)?;
        self.waker.wake();
        Ok(())
    }

    /// Pops the oldest message, if any.
    pub fn try_receive(&self) -> Option<Message> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn receive(self: &Arc<Mailbox>) -> ReceiveFuture {
        ReceiveFuture {
            mailbox: Arc::clone(self),
        }
    }
}

/// Resolves with the next message; parks the task while the queue is empty.
pub struct ReceiveFuture {
    mailbox: Arc<Mailbox>,
}

impl Future for ReceiveFuture {
    type Output = Message;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Message> {
        if let Some(msg) = self.mailbox.try_receive() {
            return Poll::Ready(msg);
        }
        self.mailbox.waker.register(cx.waker());
        // A message may have slipped in between the pop and the register.
        match self.mailbox.try_receive() {
            Some(msg) => Poll::Ready(msg),
            None => Poll::Pending,
        }
    }
}
