//! Layered compositor.
//!
//! Layers stack bottom-to-top over the screen framebuffer. All composition
//! goes through a same-format back buffer so one flush is one visible
//! frame. The render task is the only writer of the screen; other tasks
//! request redraws with layer messages.

use alloc::collections::btree_map::BTreeMap;
use spin::Mutex;

use super::window::{SharedSurface, Surface};
use crate::graphics::{FrameBuffer, PixelColor, Rectangle, Vector2D};
use crate::task::{self, LayerMessage, LayerOperation, Message, Task, TaskId};

pub struct Layer {
    id: u32,
    pos: Vector2D,
    window: Option<SharedSurface>,
    draggable: bool,
}

impl Layer {
    fn new(id: u32) -> Self {
        Layer {
            id,
            pos: Vector2D::default(),
            window: None,
            draggable: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_window(&mut self, window: SharedSurface) -> &mut Self {
        self.window = Some(window);
        self
    }

    pub fn window(&self) -> Option<&SharedSurface> {
        self.window.as_ref()
    }

    pub fn set_draggable(&mut self, draggable: bool) -> &mut Self {
        self.draggable = draggable;
        self
    }

    pub fn is_draggable(&self) -> bool {
        self.draggable
    }

    pub fn set_position(&mut self, pos: Vector2D) -> &mut Self {
        self.pos = pos;
        self
    }

    pub fn position(&self) -> Vector2D {
        self.pos
    }

    fn window_size(&self) -> Vector2D {
        self.window
            .as_ref()
            .map(|w| w.lock().size())
            .unwrap_or_default()
    }

    /// On-screen rectangle of this layer.
    fn rect(&self) -> Rectangle {
        Rectangle::new(self.pos, self.window_size())
    }

    fn draw_to(&self, dst: &mut FrameBuffer, area: Rectangle) {
        if let Some(window) = &self.window {
            window.lock().draw_to(dst, self.pos, area);
        }
    }
}

pub struct LayerManager {
    screen: FrameBuffer,
    back_buffer: FrameBuffer,
    layers: BTreeMap<u32, Layer>,
    layer_stack: alloc::vec::Vec<u32>,
    latest_id: u32,
}

impl LayerManager {
    pub fn new(screen: FrameBuffer) -> Self {
        let size = screen.size();
        let back_buffer =
            FrameBuffer::new_shadow(size.x as usize, size.y as usize, screen.pixel_format());
        LayerManager {
            screen,
            back_buffer,
            layers: BTreeMap::new(),
            layer_stack: alloc::vec::Vec::new(),
            latest_id: 0,
        }
    }

    /// Allocates a hidden layer with a fresh id.
    pub fn new_layer(&mut self) -> &mut Layer {
        self.latest_id += 1;
        let id = self.latest_id;
        self.layers.insert(id, Layer::new(id));
        self.layers.get_mut(&id).unwrap()
    }

    pub fn layer(&self, id: u32) -> Option<&Layer> {
        self.layers.get(&id)
    }

    pub fn layer_mut(&mut self, id: u32) -> Option<&mut Layer> {
        self.layers.get_mut(&id)
    }

    #[cfg(test)]
    pub fn screen(&self) -> &FrameBuffer {
        &self.screen
    }

    fn screen_rect(&self) -> Rectangle {
        Rectangle::new(Vector2D::default(), self.screen.size())
    }

    /// Composites every visible layer intersecting `area` and blits the
    /// result to the screen in one copy.
    pub fn draw(&mut self, area: Rectangle) {
        self.draw_from(area, None);
    }

    /// Redraws the given layer and everything above it. The layers below are
    /// skipped on the caller's contract that `id` is opaque in its rect.
    pub fn draw_id(&mut self, id: u32) {
        let Some(rect) = self.layers.get(&id).map(Layer::rect) else {
            return;
        };
        self.draw_from(rect, Some(id));
    }

    /// Like [`draw_id`] but restricted to `area` given in window coordinates.
    pub fn draw_id_area(&mut self, id: u32, area: Rectangle) {
        let Some(layer_rect) = self.layers.get(&id).map(Layer::rect) else {
            return;
        };
        let target = Rectangle::new(layer_rect.pos + area.pos, area.size);
        self.draw_from(target.intersection(&layer_rect), Some(id));
    }

    fn draw_from(&mut self, area: Rectangle, from: Option<u32>) {
        let area = area.intersection(&self.screen_rect());
        if area.is_empty() {
            return;
        }
        if let Some(from_id) = from {
            if !self.layer_stack.contains(&from_id) {
                return;
            }
        }
        if from.is_none() {
            crate::graphics::fill_rectangle(
                &mut self.back_buffer,
                area.pos,
                area.size,
                PixelColor::BLACK,
            );
        }
        let mut drawing = from.is_none();
        for &lid in &self.layer_stack {
            if from == Some(lid) {
                drawing = true;
            }
            if drawing {
                if let Some(layer) = self.layers.get(&lid) {
                    layer.draw_to(&mut self.back_buffer, area);
                }
            }
        }
        let _ = self.screen.copy(area.pos, &self.back_buffer, area);
    }

    /// Moves a layer to an absolute position and repaints the union of the
    /// old and new rectangles.
    pub fn move_to(&mut self, id: u32, new_pos: Vector2D) {
        let Some(layer) = self.layers.get_mut(&id) else {
            return;
        };
        let old_rect = layer.rect();
        layer.set_position(new_pos);
        self.draw(old_rect);
        self.draw_id(id);
    }

    pub fn move_relative(&mut self, id: u32, diff: Vector2D) {
        let Some(layer) = self.layers.get_mut(&id) else {
            return;
        };
        let old_rect = layer.rect();
        let new_pos = layer.position() + diff;
        layer.set_position(new_pos);
        self.draw(old_rect);
        self.draw_id(id);
    }

    /// Sets the stack height of a layer. Negative heights hide the layer;
    /// anything above the top clamps to the top.
    pub fn up_down(&mut self, id: u32, new_height: i32) {
        if new_height < 0 {
            self.hide(id);
            return;
        }
        if !self.layers.contains_key(&id) {
            return;
        }
        let mut height = (new_height as usize).min(self.layer_stack.len());
        if let Some(old_pos) = self.layer_stack.iter().position(|&l| l == id) {
            self.layer_stack.remove(old_pos);
            height = height.min(self.layer_stack.len());
        }
        self.layer_stack.insert(height, id);
    }

    pub fn hide(&mut self, id: u32) {
        if let Some(pos) = self.layer_stack.iter().position(|&l| l == id) {
            self.layer_stack.remove(pos);
        }
    }

    /// Stack position of a layer, or -1 when hidden.
    pub fn height_of(&self, id: u32) -> i32 {
        self.layer_stack
            .iter()
            .position(|&l| l == id)
            .map(|p| p as i32)
            .unwrap_or(-1)
    }

    pub fn stack_len(&self) -> usize {
        self.layer_stack.len()
    }

    /// Topmost visible layer whose window rectangle contains `pos`.
    pub fn find_layer_by_position(&self, pos: Vector2D, exclude_id: Option<u32>) -> Option<u32> {
        self.layer_stack
            .iter()
            .rev()
            .filter(|&&id| Some(id) != exclude_id)
            .find(|&&id| {
                self.layers
                    .get(&id)
                    .map(|l| l.rect().contains(pos))
                    .unwrap_or(false)
            })
            .copied()
    }
}

/// Tracks which layer owns the keyboard and raises it on activation.
pub struct ActiveLayer {
    active: u32,
    mouse_layer: u32,
}

impl ActiveLayer {
    pub const fn new() -> Self {
        ActiveLayer {
            active: 0,
            mouse_layer: 0,
        }
    }

    pub fn active_id(&self) -> u32 {
        self.active
    }

    pub fn set_mouse_layer(&mut self, id: u32) {
        self.mouse_layer = id;
    }

    pub fn activate(&mut self, manager: &mut LayerManager, id: u32) {
        if self.active == id {
            return;
        }
        if self.active > 0 {
            if let Some(window) = manager.layer(self.active).and_then(Layer::window) {
                window.lock().deactivate();
            }
            manager.draw_id(self.active);
        }
        self.active = id;
        if id > 0 {
            if let Some(window) = manager.layer(id).and_then(Layer::window) {
                window.lock().activate();
            }
            let height = if self.mouse_layer > 0 {
                (manager.height_of(self.mouse_layer) - 1).max(0)
            } else {
                manager.stack_len() as i32
            };
            manager.up_down(id, height);
            manager.draw_id(id);
        }
    }
}

impl Default for ActiveLayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide compositor state, owned by the render task after boot.
pub static LAYER_MANAGER: Mutex<Option<LayerManager>> = Mutex::new(None);
pub static ACTIVE_LAYER: Mutex<ActiveLayer> = Mutex::new(ActiveLayer::new());
pub static LAYER_TASK_MAP: Mutex<BTreeMap<u32, TaskId>> = Mutex::new(BTreeMap::new());

/// Installs the layer manager backing the screen. Called once during boot.
pub fn init(screen: FrameBuffer) {
    *LAYER_MANAGER.lock() = Some(LayerManager::new(screen));
}

/// Applies one layer request. This is the single draw path for tasks other
/// than the render task.
pub fn process_layer_message(manager: &mut LayerManager, msg: &LayerMessage) {
    match msg.op {
        LayerOperation::Move => manager.move_to(msg.layer_id, msg.pos),
        LayerOperation::MoveRelative => manager.move_relative(msg.layer_id, msg.pos),
        LayerOperation::Draw => manager.draw_id(msg.layer_id),
        LayerOperation::DrawArea => manager.draw_id_area(msg.layer_id, msg.area),
    }
}

/// Main loop of the render task (task 1): applies layer messages and routes
/// key input to the task owning the active layer.
pub async fn render_task(task: Task) {
    loop {
        match task.receive().await {
            Message::Layer(layer_msg) => {
                if let Some(manager) = LAYER_MANAGER.lock().as_mut() {
                    process_layer_message(manager, &layer_msg);
                }
                let _ = task::send_message(layer_msg.src_task, Message::LayerFinish);
            }
            msg @ Message::KeyPush { .. } => {
                let active = ACTIVE_LAYER.lock().active_id();
                let dst = LAYER_TASK_MAP.lock().get(&active).copied();
                if let Some(dst_task) = dst {
                    let _ = task::send_message(dst_task, msg);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::{PixelFormat, PixelWriter};
    use crate::ui::window::Window;
    use alloc::sync::Arc;

    fn solid_window(w: i32, h: i32, color: PixelColor) -> SharedSurface {
        let mut window = Window::new(w, h, PixelFormat::Rgb8);
        crate::graphics::fill_rectangle(
            &mut window,
            Vector2D::new(0, 0),
            Vector2D::new(w, h),
            color,
        );
        Arc::new(Mutex::new(window))
    }

    fn manager_16x16() -> LayerManager {
        LayerManager::new(FrameBuffer::new_shadow(16, 16, PixelFormat::Rgb8))
    }

    #[test]
    fn up_down_keeps_each_layer_unique() {
        let mut m = manager_16x16();
        let a = m.new_layer().id();
        let b = m.new_layer().id();
        m.up_down(a, 0);
        m.up_down(b, 1);
        assert_eq!(m.height_of(a), 0);
        assert_eq!(m.height_of(b), 1);

        // Raise A above B: stack must stay duplicate-free.
        m.up_down(a, 1);
        assert_eq!(m.height_of(b), 0);
        assert_eq!(m.height_of(a), 1);
        assert_eq!(m.stack_len(), 2);

        m.up_down(a, -1);
        assert_eq!(m.height_of(a), -1);
        assert_eq!(m.stack_len(), 1);
    }

    #[test]
    fn up_down_clamps_height_to_stack_size() {
        let mut m = manager_16x16();
        let a = m.new_layer().id();
        m.up_down(a, 100);
        assert_eq!(m.height_of(a), 0);
    }

    #[test]
    fn new_layers_are_hidden_until_raised() {
        let mut m = manager_16x16();
        let a = m.new_layer().id();
        assert_eq!(m.height_of(a), -1);
    }

    #[test]
    fn draw_composites_topmost_layer() {
        let mut m = manager_16x16();
        let red = PixelColor::rgb(255, 0, 0);
        let blue = PixelColor::rgb(0, 0, 255);

        let a = {
            let layer = m.new_layer();
            layer.set_window(solid_window(8, 8, red));
            layer.id()
        };
        let b = {
            let layer = m.new_layer();
            layer.set_window(solid_window(8, 8, blue)).set_position(Vector2D::new(4, 4));
            layer.id()
        };
        m.up_down(a, 0);
        m.up_down(b, 1);
        m.draw(Rectangle::new(Vector2D::new(0, 0), Vector2D::new(16, 16)));

        // Overlap belongs to the topmost layer.
        assert_eq!(m.screen().pixel_at(Vector2D::new(5, 5)), blue);
        assert_eq!(m.screen().pixel_at(Vector2D::new(1, 1)), red);
        assert_eq!(m.screen().pixel_at(Vector2D::new(14, 14)), PixelColor::BLACK);
    }

    #[test]
    fn transparent_pixels_show_the_layer_below() {
        let mut m = manager_16x16();
        let red = PixelColor::rgb(255, 0, 0);
        let hole = PixelColor::rgb(1, 2, 3);

        let a = {
            let layer = m.new_layer();
            layer.set_window(solid_window(8, 8, red));
            layer.id()
        };
        let b = {
            let mut w = Window::new(8, 8, PixelFormat::Rgb8);
            crate::graphics::fill_rectangle(
                &mut w,
                Vector2D::new(0, 0),
                Vector2D::new(8, 8),
                PixelColor::WHITE,
            );
            w.write(Vector2D::new(2, 2), hole);
            w.set_transparent_color(Some(hole));
            let layer = m.new_layer();
            layer.set_window(Arc::new(Mutex::new(w)));
            layer.id()
        };
        m.up_down(a, 0);
        m.up_down(b, 1);
        m.draw(Rectangle::new(Vector2D::new(0, 0), Vector2D::new(16, 16)));

        assert_eq!(m.screen().pixel_at(Vector2D::new(2, 2)), red);
        assert_eq!(m.screen().pixel_at(Vector2D::new(3, 3)), PixelColor::WHITE);
    }

    #[test]
    fn move_to_repaints_old_position() {
        let mut m = manager_16x16();
        let red = PixelColor::rgb(255, 0, 0);
        let a = {
            let layer = m.new_layer();
            layer.set_window(solid_window(4, 4, red));
            layer.id()
        };
        m.up_down(a, 0);
        m.draw(Rectangle::new(Vector2D::new(0, 0), Vector2D::new(16, 16)));
        assert_eq!(m.screen().pixel_at(Vector2D::new(1, 1)), red);

        m.move_to(a, Vector2D::new(8, 8));
        assert_eq!(m.screen().pixel_at(Vector2D::new(1, 1)), PixelColor::BLACK);
        assert_eq!(m.screen().pixel_at(Vector2D::new(9, 9)), red);
    }

    #[test]
    fn hit_test_returns_topmost_and_respects_exclude() {
        let mut m = manager_16x16();
        let a = {
            let layer = m.new_layer();
            layer.set_window(solid_window(8, 8, PixelColor::WHITE));
            layer.id()
        };
        let b = {
            let layer = m.new_layer();
            layer.set_window(solid_window(8, 8, PixelColor::WHITE));
            layer.id()
        };
        m.up_down(a, 0);
        m.up_down(b, 1);

        let p = Vector2D::new(3, 3);
        assert_eq!(m.find_layer_by_position(p, None), Some(b));
        assert_eq!(m.find_layer_by_position(p, Some(b)), Some(a));
        assert_eq!(m.find_layer_by_position(Vector2D::new(12, 12), None), None);
    }

    #[test]
    fn up_down_after_hide_reinserts() {
        let mut m = manager_16x16();
        let a = m.new_layer().id();
        let b = m.new_layer().id();
        m.up_down(a, 0);
        m.up_down(b, 1);
        m.up_down(a, -1);
        m.up_down(a, 1);
        assert_eq!(m.height_of(b), 0);
        assert_eq!(m.height_of(a), 1);
    }

    #[test]
    fn activate_raises_layer_and_switches_palettes() {
        use crate::ui::window::ToplevelWindow;

        let mut m = LayerManager::new(FrameBuffer::new_shadow(200, 200, PixelFormat::Rgb8));
        let w1 = ToplevelWindow::new(100, 80, PixelFormat::Rgb8, "one");
        let w2 = ToplevelWindow::new(100, 80, PixelFormat::Rgb8, "two");
        let a = {
            let layer = m.new_layer();
            layer.set_window(w1.clone());
            layer.id()
        };
        let b = {
            let layer = m.new_layer();
            layer.set_window(w2.clone()).set_position(Vector2D::new(50, 50));
            layer.id()
        };
        m.up_down(a, 0);
        m.up_down(b, 1);

        let mut active = ActiveLayer::new();
        active.activate(&mut m, a);
        assert_eq!(active.active_id(), a);
        assert_eq!(m.height_of(a), 1);

        active.activate(&mut m, b);
        assert_eq!(m.height_of(b), 1);
        assert_eq!(m.height_of(a), 0);
    }

    #[test]
    fn process_layer_message_dispatches_ops() {
        let mut m = manager_16x16();
        let a = {
            let layer = m.new_layer();
            layer.set_window(solid_window(4, 4, PixelColor::WHITE));
            layer.id()
        };
        m.up_down(a, 0);

        let msg = LayerMessage {
            src_task: 7,
            layer_id: a,
            op: LayerOperation::Move,
            pos: Vector2D::new(5, 6),
            area: Rectangle::default(),
        };
        process_layer_message(&mut m, &msg);
        assert_eq!(m.layer(a).unwrap().position(), Vector2D::new(5, 6));

        let msg = LayerMessage {
            op: LayerOperation::MoveRelative,
            pos: Vector2D::new(-1, 2),
            ..msg
        };
        process_layer_message(&mut m, &msg);
        assert_eq!(m.layer(a).unwrap().position(), Vector2D::new(4, 8));
    }
}
