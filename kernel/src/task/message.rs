//! Messages exchanged between interrupt handlers and tasks.

use crate::graphics::{Rectangle, Vector2D};

pub type TaskId = u64;

/// Operations a client task may request from the render task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOperation {
    Move,
    MoveRelative,
    Draw,
    DrawArea,
}

/// Payload of a layer message. Positions are absolute for `Move` /
/// `MoveRelative`; `DrawArea` rectangles are window-relative.
#[derive(Debug, Clone, Copy)]
pub struct LayerMessage {
    pub src_task: TaskId,
    pub layer_id: u32,
    pub op: LayerOperation,
    pub pos: Vector2D,
    pub area: Rectangle,
}

#[derive(Debug, Clone, Copy)]
pub enum Message {
    /// A timer installed via the timer manager expired.
    TimerTimeout { timeout: u64, value: i32 },
    /// A key event, already translated to modifier/keycode/ascii.
    KeyPush { modifier: u8, keycode: u8, ascii: u8 },
    /// Compositor request, routed to the render task.
    Layer(LayerMessage),
    /// The render task finished a layer request.
    LayerFinish,
}

/// Convenience constructor mirroring the shape used by window tasks.
pub fn make_layer_message(
    src_task: TaskId,
    layer_id: u32,
    op: LayerOperation,
    area: Rectangle,
) -> Message {
    Message::Layer(LayerMessage {
        src_task,
        layer_id,
        op,
        pos: area.pos,
        area,
    })
}
