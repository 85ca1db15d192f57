//! Tick-driven timers.
//!
//! The LAPIC timer interrupt advances a tick counter and fires due timers as
//! `TimerTimeout` messages. The queue is a binary heap ordered by deadline;
//! capacity is reserved up front so the tick path does not allocate.

use alloc::collections::BinaryHeap;
use core::cmp::Ordering as CmpOrdering;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::message::{Message, TaskId};
use super::send_message;
use crate::constants::tasks::TIMER_QUEUE_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    pub timeout: u64,
    /// 0 for one-shot; otherwise the timer is re-armed every `period` ticks.
    pub period: u64,
    pub value: i32,
    pub dst_task: TaskId,
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Min-heap on the deadline.
        other.timeout.cmp(&self.timeout)
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

pub struct TimerManager {
    tick: AtomicU64,
    timers: Mutex<BinaryHeap<Timer>>,
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            tick: AtomicU64::new(0),
            timers: Mutex::new(BinaryHeap::with_capacity(TIMER_QUEUE_CAPACITY)),
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    pub fn add_timer(&self, timer: Timer) {
        self.timers.lock().push(timer);
    }

    /// Advances the tick and fires every due timer. Called from the timer
    /// interrupt; send failures (dead task, full mailbox) are ignored.
    pub fn tick(&self) {
        let now = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        let mut timers = self.timers.lock();
        while let Some(head) = timers.peek() {
            if head.timeout > now {
                break;
            }
            let t = timers.pop().unwrap();
            let _ = send_message(
                t.dst_task,
                Message::TimerTimeout {
                    timeout: t.timeout,
                    value: t.value,
                },
            );
            if t.period > 0 {
                timers.push(Timer {
                    timeout: now + t.period,
                    ..t
                });
            }
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    pub static ref TIMER_MANAGER: TimerManager = TimerManager::new();
}

/// Installs a timer on the global manager. Task-context callers must not
/// hold the timer lock across the tick interrupt, hence the cli/sti bracket.
#[cfg(not(test))]
pub fn add_timer(timer: Timer) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        TIMER_MANAGER.add_timer(timer);
    });
}

#[cfg(test)]
pub fn add_timer(timer: Timer) {
    TIMER_MANAGER.add_timer(timer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::new_task;

    #[test]
    fn one_shot_timer_fires_once() {
        let task = new_task();
        let tm = TimerManager::new();
        tm.add_timer(Timer {
            timeout: 2,
            period: 0,
            value: 7,
            dst_task: task.id(),
        });
        tm.tick();
        assert!(task.try_receive().is_none());
        tm.tick();
        match task.try_receive().unwrap() {
            Message::TimerTimeout { timeout, value } => {
                assert_eq!(timeout, 2);
                assert_eq!(value, 7);
            }
            other => panic!("unexpected {:?}", other),
        }
        tm.tick();
        assert!(task.try_receive().is_none());
    }

    #[test]
    fn periodic_timer_rearms() {
        let task = new_task();
        let tm = TimerManager::new();
        tm.add_timer(Timer {
            timeout: 1,
            period: 2,
            value: 1,
            dst_task: task.id(),
        });
        for _ in 0..5 {
            tm.tick();
        }
        // Fires at ticks 1, 3 and 5.
        let mut count = 0;
        while task.try_receive().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn due_timers_fire_in_deadline_order() {
        let task = new_task();
        let tm = TimerManager::new();
        for (timeout, value) in [(3, 30), (1, 10), (2, 20)] {
            tm.add_timer(Timer {
                timeout,
                period: 0,
                value,
                dst_task: task.id(),
            });
        }
        for _ in 0..3 {
            tm.tick();
        }
        let mut values = alloc::vec::Vec::new();
        while let Some(Message::TimerTimeout { value, .. }) = task.try_receive() {
            values.push(value);
        }
        assert_eq!(values, [10, 20, 30]);
    }
}
