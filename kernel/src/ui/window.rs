//! Windows: backed pixel grids composited by the layer manager.
//!
//! A `Window` keeps its pixels twice: a `PixelColor` grid for transparency
//! tests and a same-format shadow framebuffer so opaque composition is a
//! plain row copy.

use alloc::string::String;
use alloc::sync::Arc;
use spin::Mutex;

use crate::graphics::font::write_string;
use crate::graphics::{
    fill_rectangle, FrameBuffer, PixelColor, PixelFormat, PixelWriter, Rectangle, Vector2D,
};

/// Anything a layer can composite onto the screen.
pub trait Surface: Send {
    fn size(&self) -> Vector2D;
    /// Draws the part of this surface inside `area` (screen coordinates)
    /// into `dst`, with the surface origin at `pos`.
    fn draw_to(&self, dst: &mut FrameBuffer, pos: Vector2D, area: Rectangle);
    fn activate(&mut self) {}
    fn deactivate(&mut self) {}
}

pub type SharedSurface = Arc<Mutex<dyn Surface + Send>>;

pub struct Window {
    width: i32,
    height: i32,
    data: alloc::vec::Vec<PixelColor>,
    shadow: FrameBuffer,
    transparent_color: Option<PixelColor>,
}

impl Window {
    pub fn new(width: i32, height: i32, pixel_format: PixelFormat) -> Self {
        Window {
            width,
            height,
            data: alloc::vec![PixelColor::BLACK; (width * height) as usize],
            shadow: FrameBuffer::new_shadow(width as usize, height as usize, pixel_format),
            transparent_color: None,
        }
    }

    pub fn set_transparent_color(&mut self, c: Option<PixelColor>) {
        self.transparent_color = c;
    }

    pub fn at(&self, pos: Vector2D) -> PixelColor {
        self.data[(pos.y * self.width + pos.x) as usize]
    }

    /// Shifts the rectangle `src` so its origin lands on `dst_pos`,
    /// preserving pixels outside `src` and handling overlap.
    pub fn move_rect(&mut self, dst_pos: Vector2D, src: Rectangle) {
        self.shadow.move_rect(dst_pos, src);
        let rows = src.size.y as usize;
        let cols = src.size.x as usize;
        let width = self.width as usize;
        let copy_row = |data: &mut alloc::vec::Vec<PixelColor>, sy: usize, dy: usize| {
            let s = sy * width + src.pos.x as usize;
            let d = dy * width + dst_pos.x as usize;
            data.copy_within(s..s + cols, d);
        };
        if dst_pos.y <= src.pos.y {
            for i in 0..rows {
                copy_row(&mut self.data, src.pos.y as usize + i, dst_pos.y as usize + i);
            }
        } else {
            for i in (0..rows).rev() {
                copy_row(&mut self.data, src.pos.y as usize + i, dst_pos.y as usize + i);
            }
        }
    }
}

impl Surface for Window {
    fn size(&self) -> Vector2D {
        Vector2D::new(self.width, self.height)
    }

    fn draw_to(&self, dst: &mut FrameBuffer, pos: Vector2D, area: Rectangle) {
        match self.transparent_color {
            None => {
                let window_area = Rectangle::new(pos, self.size());
                let intersection = area.intersection(&window_area);
                if intersection.is_empty() {
                    return;
                }
                let _ = dst.copy(
                    intersection.pos,
                    &self.shadow,
                    Rectangle::new(intersection.pos - pos, intersection.size),
                );
            }
            Some(tc) => {
                let window_area = Rectangle::new(pos, self.size());
                let intersection = area.intersection(&window_area);
                for y in intersection.pos.y..intersection.end().y {
                    for x in intersection.pos.x..intersection.end().x {
                        let local = Vector2D::new(x, y) - pos;
                        let c = self.at(local);
                        if c != tc {
                            dst.write_pixel(Vector2D::new(x, y), c);
                        }
                    }
                }
            }
        }
    }
}

impl PixelWriter for Window {
    fn write(&mut self, pos: Vector2D, color: PixelColor) {
        if pos.x < 0 || pos.y < 0 || pos.x >= self.width || pos.y >= self.height {
            return;
        }
        self.data[(pos.y * self.width + pos.x) as usize] = color;
        self.shadow.write_pixel(pos, color);
    }

    fn width(&self) -> i32 {
        self.width
    }

    fn height(&self) -> i32 {
        self.height
    }
}

const TITLE_BAR_ACTIVE: PixelColor = PixelColor::from_hex(0x000084);
const TITLE_BAR_INACTIVE: PixelColor = PixelColor::from_hex(0x848484);
const FRAME_LIGHT: PixelColor = PixelColor::from_hex(0xC6C6C6);
const FRAME_DARK: PixelColor = PixelColor::from_hex(0x848484);

/// A decorated window: frame, title bar, and a client ("inner") area.
pub struct ToplevelWindow {
    window: Window,
    title: String,
    active: bool,
}

impl ToplevelWindow {
    pub const TOP_LEFT_MARGIN: Vector2D = Vector2D::new(4, 24);
    pub const BOTTOM_RIGHT_MARGIN: Vector2D = Vector2D::new(4, 4);
    pub const MARGIN_X: i32 = Self::TOP_LEFT_MARGIN.x + Self::BOTTOM_RIGHT_MARGIN.x;
    pub const MARGIN_Y: i32 = Self::TOP_LEFT_MARGIN.y + Self::BOTTOM_RIGHT_MARGIN.y;

    pub fn new(width: i32, height: i32, pixel_format: PixelFormat, title: &str) -> Arc<Mutex<Self>> {
        let mut tw = ToplevelWindow {
            window: Window::new(width, height, pixel_format),
            title: String::from(title),
            active: false,
        };
        tw.draw_frame();
        tw.draw_title_bar();
        Arc::new(Mutex::new(tw))
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut Window {
        &mut self.window
    }

    pub fn inner_size(&self) -> Vector2D {
        self.window.size() - Self::TOP_LEFT_MARGIN - Self::BOTTOM_RIGHT_MARGIN
    }

    /// Writer whose origin is the top-left corner of the inner area.
    pub fn inner_writer(&mut self) -> InnerWriter<'_> {
        InnerWriter { toplevel: self }
    }

    /// Moves a rectangle given in inner-area coordinates.
    pub fn move_inner_rect(&mut self, dst_pos: Vector2D, src: Rectangle) {
        self.window.move_rect(
            dst_pos + Self::TOP_LEFT_MARGIN,
            Rectangle::new(src.pos + Self::TOP_LEFT_MARGIN, src.size),
        );
    }

    fn draw_frame(&mut self) {
        let size = self.window.size();
        fill_rectangle(&mut self.window, Vector2D::new(0, 0), size, FRAME_LIGHT);
        fill_rectangle(
            &mut self.window,
            Vector2D::new(0, size.y - 1),
            Vector2D::new(size.x, 1),
            FRAME_DARK,
        );
        fill_rectangle(
            &mut self.window,
            Vector2D::new(size.x - 1, 0),
            Vector2D::new(1, size.y),
            FRAME_DARK,
        );
    }

    fn draw_title_bar(&mut self) {
        let size = self.window.size();
        let bar_color = if self.active {
            TITLE_BAR_ACTIVE
        } else {
            TITLE_BAR_INACTIVE
        };
        fill_rectangle(
            &mut self.window,
            Vector2D::new(2, 2),
            Vector2D::new(size.x - 4, 20),
            bar_color,
        );
        let title = self.title.clone();
        write_string(
            &mut self.window,
            Vector2D::new(8, 4),
            &title,
            PixelColor::WHITE,
        );
    }
}

impl Surface for ToplevelWindow {
    fn size(&self) -> Vector2D {
        self.window.size()
    }

    fn draw_to(&self, dst: &mut FrameBuffer, pos: Vector2D, area: Rectangle) {
        self.window.draw_to(dst, pos, area);
    }

    fn activate(&mut self) {
        self.active = true;
        self.draw_title_bar();
    }

    fn deactivate(&mut self) {
        self.active = false;
        self.draw_title_bar();
    }
}

pub struct InnerWriter<'a> {
    toplevel: &'a mut ToplevelWindow,
}

impl PixelWriter for InnerWriter<'_> {
    fn write(&mut self, pos: Vector2D, color: PixelColor) {
        if pos.x < 0 || pos.y < 0 {
            return;
        }
        let inner = self.toplevel.inner_size();
        if pos.x >= inner.x || pos.y >= inner.y {
            return;
        }
        self.toplevel
            .window
            .write(pos + ToplevelWindow::TOP_LEFT_MARGIN, color);
    }

    fn width(&self) -> i32 {
        self.toplevel.inner_size().x
    }

    fn height(&self) -> i32 {
        self.toplevel.inner_size().y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_draw_to_respects_transparency() {
        let mut dst = FrameBuffer::new_shadow(4, 4, PixelFormat::Rgb8);
        fill_rectangle(&mut dst, Vector2D::new(0, 0), Vector2D::new(4, 4), PixelColor::rgb(9, 9, 9));

        let mut w = Window::new(2, 2, PixelFormat::Rgb8);
        let tc = PixelColor::rgb(1, 2, 3);
        w.set_transparent_color(Some(tc));
        w.write(Vector2D::new(0, 0), tc);
        w.write(Vector2D::new(1, 0), PixelColor::WHITE);
        w.write(Vector2D::new(0, 1), PixelColor::WHITE);
        w.write(Vector2D::new(1, 1), tc);

        let area = Rectangle::new(Vector2D::new(0, 0), Vector2D::new(4, 4));
        w.draw_to(&mut dst, Vector2D::new(1, 1), area);

        assert_eq!(dst.pixel_at(Vector2D::new(1, 1)), PixelColor::rgb(9, 9, 9));
        assert_eq!(dst.pixel_at(Vector2D::new(2, 1)), PixelColor::WHITE);
        assert_eq!(dst.pixel_at(Vector2D::new(1, 2)), PixelColor::WHITE);
        assert_eq!(dst.pixel_at(Vector2D::new(2, 2)), PixelColor::rgb(9, 9, 9));
    }

    #[test]
    fn window_draw_to_clips_to_area() {
        let mut dst = FrameBuffer::new_shadow(4, 4, PixelFormat::Rgb8);
        let mut w = Window::new(4, 4, PixelFormat::Rgb8);
        fill_rectangle(&mut w, Vector2D::new(0, 0), Vector2D::new(4, 4), PixelColor::WHITE);

        let area = Rectangle::new(Vector2D::new(0, 0), Vector2D::new(2, 4));
        w.draw_to(&mut dst, Vector2D::new(0, 0), area);

        assert_eq!(dst.pixel_at(Vector2D::new(1, 0)), PixelColor::WHITE);
        assert_eq!(dst.pixel_at(Vector2D::new(2, 0)), PixelColor::BLACK);
    }

    #[test]
    fn move_rect_scrolls_data_and_shadow() {
        let mut w = Window::new(1, 3, PixelFormat::Rgb8);
        for y in 0..3 {
            w.write(Vector2D::new(0, y), PixelColor::rgb(y as u8 + 1, 0, 0));
        }
        w.move_rect(
            Vector2D::new(0, 0),
            Rectangle::new(Vector2D::new(0, 1), Vector2D::new(1, 2)),
        );
        assert_eq!(w.at(Vector2D::new(0, 0)).r, 2);
        assert_eq!(w.at(Vector2D::new(0, 1)).r, 3);

        // The shadow must agree with the grid.
        let mut dst = FrameBuffer::new_shadow(1, 3, PixelFormat::Rgb8);
        let area = Rectangle::new(Vector2D::new(0, 0), Vector2D::new(1, 3));
        w.draw_to(&mut dst, Vector2D::new(0, 0), area);
        assert_eq!(dst.pixel_at(Vector2D::new(0, 0)).r, 2);
        assert_eq!(dst.pixel_at(Vector2D::new(0, 1)).r, 3);
    }

    #[test]
    fn toplevel_margins_bound_inner_area() {
        let tw = ToplevelWindow::new(100, 80, PixelFormat::Rgb8, "term");
        let tw = tw.lock();
        assert_eq!(tw.inner_size(), Vector2D::new(92, 52));
    }

    #[test]
    fn inner_writer_offsets_by_margin() {
        let tw = ToplevelWindow::new(100, 80, PixelFormat::Rgb8, "term");
        let mut tw = tw.lock();
        let c = PixelColor::rgb(7, 7, 7);
        tw.inner_writer().write(Vector2D::new(0, 0), c);
        assert_eq!(tw.window().at(ToplevelWindow::TOP_LEFT_MARGIN), c);
    }

    #[test]
    fn activation_changes_title_bar_palette() {
        let tw = ToplevelWindow::new(100, 80, PixelFormat::Rgb8, "term");
        let mut tw = tw.lock();
        let probe = Vector2D::new(50, 10);
        assert_eq!(tw.window().at(probe), TITLE_BAR_INACTIVE);
        tw.activate();
        assert_eq!(tw.window().at(probe), TITLE_BAR_ACTIVE);
        tw.deactivate();
        assert_eq!(tw.window().at(probe), TITLE_BAR_INACTIVE);
    }
}
