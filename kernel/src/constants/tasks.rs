/// The render task owns the layer manager and is the only screen writer.
pub const RENDER_TASK_ID: u64 = 1;

/// Capacity of each task mailbox.
pub const MAILBOX_CAPACITY: usize = 128;

/// Capacity of the executor run queue.
pub const MAX_TASKS: usize = 256;

/// Pre-reserved slots in the timer queue so the tick path never allocates.
pub const TIMER_QUEUE_CAPACITY: usize = 64;

/// Cursor blink half-period in timer ticks.
pub const CURSOR_BLINK_TICKS: u64 = 50;
