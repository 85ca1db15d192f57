//! Cooperative single-core executor.
//!
//! Tasks are futures parked on their mailboxes; wakers push the task handle
//! back onto a lock-free run queue, so interrupt handlers can wake tasks
//! without taking locks. `run_ready` drains everything runnable and returns,
//! which is also the hook the tests drive.

use alloc::sync::Arc;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use crossbeam_queue::ArrayQueue;
use futures::task::{waker_ref, ArcWake};
use spin::Mutex;

use crate::constants::tasks::MAX_TASKS;

type TaskFuture = Mutex<Pin<alloc::boxed::Box<dyn Future<Output = ()> + Send + 'static>>>;

struct TaskEntry {
    future: TaskFuture,
    run_queue: Arc<ArrayQueue<Arc<TaskEntry>>>,
    done: core::sync::atomic::AtomicBool,
}

impl ArcWake for TaskEntry {
    fn wake_by_ref(arc: &Arc<Self>) {
        // Queue overflow would mean MAX_TASKS simultaneously runnable
        // tasks; the push result is checked so a lost wake is at least loud.
        if arc.run_queue.push(Arc::clone(arc)).is_err() {
            panic!("executor run queue full");
        }
    }
}

pub struct Executor {
    run_queue: Arc<ArrayQueue<Arc<TaskEntry>>>,
}

impl Executor {
    pub fn new() -> Self {
        Executor {
            run_queue: Arc::new(ArrayQueue::new(MAX_TASKS)),
        }
    }

    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        let entry = Arc::new(TaskEntry {
            future: Mutex::new(alloc::boxed::Box::pin(future)),
            run_queue: Arc::clone(&self.run_queue),
            done: core::sync::atomic::AtomicBool::new(false),
        });
        if self.run_queue.push(entry).is_err() {
            panic!("executor run queue full");
        }
    }

    /// Polls every runnable task once until the queue drains.
    pub fn run_ready(&self) {
        use core::sync::atomic::Ordering;
        while let Some(entry) = self.run_queue.pop() {
            // A stale waker may re-enqueue a finished task.
            if entry.done.load(Ordering::Acquire) {
                continue;
            }
            let waker = waker_ref(&entry);
            let mut cx = Context::from_waker(&waker);
            let mut future = entry.future.lock();
            if let Poll::Ready(()) = future.as_mut().poll(&mut cx) {
                entry.done.store(true, Ordering::Release);
            }
        }
    }

    /// Runs forever, halting the CPU while no task is runnable.
    #[cfg(not(test))]
    pub fn run(&self) -> ! {
        use x86_64::instructions::interrupts;
        loop {
            self.run_ready();
            // Sleep-with-interrupts-off would lose wakeups delivered
            // between the queue check and the hlt.
            interrupts::disable();
            if self.run_queue.is_empty() {
                interrupts::enable_and_hlt();
            } else {
                interrupts::enable();
            }
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    pub static ref EXECUTOR: Executor = Executor::new();
}

/// Schedules a future on the global executor.
pub fn spawn(future: impl Future<Output = ()> + Send + 'static) {
    EXECUTOR.spawn(future);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::mailbox::Mailbox;
    use crate::task::message::Message;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn run_ready_drives_tasks_to_completion() {
        let executor = Executor::new();
        let counter = StdArc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let counter = StdArc::clone(&counter);
            executor.spawn(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        executor.run_ready();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn parked_task_resumes_after_wake() {
        let executor = Executor::new();
        let mb = Mailbox::new();
        let got = StdArc::new(AtomicU32::new(0));

        let rx = StdArc::clone(&got);
        let mailbox = Arc::clone(&mb);
        executor.spawn(async move {
            let msg = mailbox.receive().await;
            if let Message::TimerTimeout { value, .. } = msg {
                rx.store(value as u32, Ordering::SeqCst);
            }
        });

        executor.run_ready();
        assert_eq!(got.load(Ordering::SeqCst), 0);

        mb.post(Message::TimerTimeout {
            timeout: 1,
            value: 42,
        })
        .unwrap();
        executor.run_ready();
        assert_eq!(got.load(Ordering::SeqCst), 42);
    }
}
