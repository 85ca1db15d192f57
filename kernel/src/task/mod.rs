//! Tasks, mailboxes and the cooperative executor.
//!
//! A task is a future plus a mailbox registered with the task manager.
//! Interrupt handlers communicate with tasks exclusively through
//! `send_message`; a task awaiting an empty mailbox is the cooperative
//! sleep point, and the wake happens inside the executor's run queue.

pub mod executor;
pub mod mailbox;
pub mod message;
pub mod timer;

pub use executor::{spawn, EXECUTOR};
pub use mailbox::Mailbox;
pub use message::{make_layer_message, LayerMessage, LayerOperation, Message, TaskId};

use alloc::collections::btree_map::BTreeMap;
use alloc::sync::Arc;
use spin::RwLock;

use crate::error::{ErrorKind, KernelResult};

/// Handle to a registered task: its id and its mailbox.
#[derive(Clone)]
pub struct Task {
    id: TaskId,
    mailbox: Arc<Mailbox>,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Next message, sleeping while the mailbox is empty.
    pub async fn receive(&self) -> Message {
        self.mailbox.receive().await
    }

    pub fn try_receive(&self) -> Option<Message> {
        self.mailbox.try_receive()
    }
}

struct TaskManager {
    mailboxes: BTreeMap<TaskId, Arc<Mailbox>>,
    next_id: TaskId,
}

impl TaskManager {
    const fn new() -> Self {
        TaskManager {
            mailboxes: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn register(&mut self) -> Task {
        let id = self.next_id;
        self.next_id += 1;
        let mailbox = Mailbox::new();
        self.mailboxes.insert(id, Arc::clone(&mailbox));
        Task { id, mailbox }
    }

    fn mailbox_of(&self, id: TaskId) -> Option<Arc<Mailbox>> {
        self.mailboxes.get(&id).cloned()
    }
}

static TASK_MANAGER: RwLock<TaskManager> = RwLock::new(TaskManager::new());

/// Registers a new task. Ids are dense and start at 1; the first registered
/// task is the render task.
pub fn new_task() -> Task {
    TASK_MANAGER.write().register()
}

/// Appends `msg` to the task's mailbox and wakes it. Safe from interrupt
/// context: the mailbox is lock-free and the manager map is only read.
pub fn send_message(id: TaskId, msg: Message) -> KernelResult<()> {
    let mailbox = TASK_MANAGER
        .read()
        .mailbox_of(id)
        .ok_or(ErrorKind::NoWaiter)?;
    mailbox.post(msg)
}
