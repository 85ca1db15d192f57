//! Framebuffer with pixel-format aware write, copy and move primitives.
//!
//! A `FrameBuffer` either aliases the hardware scanout handed over by the
//! bootloader or owns a heap-backed shadow buffer of the same shape. All
//! compositing runs on byte slices so both cases share one code path.

use alloc::vec;
use alloc::vec::Vec;

use super::{FrameBufferConfig, PixelColor, PixelFormat, PixelWriter, Rectangle, Vector2D};
use crate::error::{ErrorKind, KernelResult};

pub struct FrameBuffer {
    config: FrameBufferConfig,
    // Empty when `config.frame_buffer` points at the hardware scanout.
    buffer: Vec<u8>,
}

// The raw scanout pointer is only ever touched by the render task; shadow
// buffers are heap-owned.
unsafe impl Send for FrameBuffer {}

impl FrameBuffer {
    pub fn new(config: FrameBufferConfig) -> Self {
        let mut buffer = Vec::new();
        if config.frame_buffer.is_null() {
            let len = config.pixels_per_scan_line
                * config.vertical_resolution
                * config.pixel_format.bytes_per_pixel();
            buffer = vec![0u8; len];
        }
        FrameBuffer { config, buffer }
    }

    /// Off-screen buffer of `width x height` pixels.
    pub fn new_shadow(width: usize, height: usize, pixel_format: PixelFormat) -> Self {
        FrameBuffer::new(FrameBufferConfig::shadow(width, height, pixel_format))
    }

    pub fn config(&self) -> &FrameBufferConfig {
        &self.config
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.config.pixel_format
    }

    pub fn size(&self) -> Vector2D {
        Vector2D::new(
            self.config.horizontal_resolution as i32,
            self.config.vertical_resolution as i32,
        )
    }

    fn stride_bytes(&self) -> usize {
        self.config.pixels_per_scan_line * self.config.pixel_format.bytes_per_pixel()
    }

    fn len_bytes(&self) -> usize {
        self.stride_bytes() * self.config.vertical_resolution
    }

    fn bytes(&self) -> &[u8] {
        if self.buffer.is_empty() {
            unsafe { core::slice::from_raw_parts(self.config.frame_buffer, self.len_bytes()) }
        } else {
            &self.buffer
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        if self.buffer.is_empty() {
            unsafe { core::slice::from_raw_parts_mut(self.config.frame_buffer, self.len_bytes()) }
        } else {
            &mut self.buffer
        }
    }

    fn pixel_offset(&self, pos: Vector2D) -> usize {
        (pos.y as usize * self.config.pixels_per_scan_line + pos.x as usize)
            * self.config.pixel_format.bytes_per_pixel()
    }

    pub fn write_pixel(&mut self, pos: Vector2D, color: PixelColor) {
        if pos.x < 0 || pos.y < 0 || pos.x >= self.size().x || pos.y >= self.size().y {
            return;
        }
        let format = self.config.pixel_format;
        let offset = self.pixel_offset(pos);
        let bytes = self.bytes_mut();
        match format {
            PixelFormat::Rgb8 => {
                bytes[offset] = color.r;
                bytes[offset + 1] = color.g;
                bytes[offset + 2] = color.b;
            }
            PixelFormat::Bgr8 => {
                bytes[offset] = color.b;
                bytes[offset + 1] = color.g;
                bytes[offset + 2] = color.r;
            }
        }
    }

    pub fn pixel_at(&self, pos: Vector2D) -> PixelColor {
        let offset = self.pixel_offset(pos);
        let bytes = self.bytes();
        match self.config.pixel_format {
            PixelFormat::Rgb8 => PixelColor::rgb(bytes[offset], bytes[offset + 1], bytes[offset + 2]),
            PixelFormat::Bgr8 => PixelColor::rgb(bytes[offset + 2], bytes[offset + 1], bytes[offset]),
        }
    }

    /// Copies `src_area` of `src` so that its origin lands on `dst_pos`.
    /// Both rectangles are clipped to their surfaces; the formats must match.
    pub fn copy(&mut self, dst_pos: Vector2D, src: &FrameBuffer, src_area: Rectangle) -> KernelResult<()> {
        if self.config.pixel_format != src.config.pixel_format {
            return Err(ErrorKind::UnknownPixelFormat);
        }
        let bpp = self.config.pixel_format.bytes_per_pixel();

        let src_area = src_area.intersection(&Rectangle::new(Vector2D::default(), src.size()));
        let dst_area = Rectangle::new(dst_pos, src_area.size)
            .intersection(&Rectangle::new(Vector2D::default(), self.size()));
        if dst_area.is_empty() {
            return Ok(());
        }
        // Clipping the destination may have shifted the origin; mirror it
        // on the source side.
        let shift = dst_area.pos - dst_pos;
        let src_start = src_area.pos + shift;

        let row_bytes = dst_area.size.x as usize * bpp;
        let src_stride = src.stride_bytes();
        let dst_stride = self.stride_bytes();
        let src_offset = src.pixel_offset(src_start);
        let dst_offset = self.pixel_offset(dst_area.pos);
        let src_bytes = src.bytes();
        let dst_bytes = self.bytes_mut();
        for y in 0..dst_area.size.y as usize {
            let s = src_offset + y * src_stride;
            let d = dst_offset + y * dst_stride;
            dst_bytes[d..d + row_bytes].copy_from_slice(&src_bytes[s..s + row_bytes]);
        }
        Ok(())
    }

    /// Moves `src` inside this buffer so its origin lands on `dst_pos`,
    /// choosing the row order so overlapping regions copy correctly.
    pub fn move_rect(&mut self, dst_pos: Vector2D, src: Rectangle) {
        let bpp = self.config.pixel_format.bytes_per_pixel();
        let stride = self.stride_bytes();
        let row_bytes = src.size.x as usize * bpp;
        let src_offset = self.pixel_offset(src.pos);
        let dst_offset = self.pixel_offset(dst_pos);
        let rows = src.size.y as usize;
        let bytes = self.bytes_mut();
        if dst_offset < src_offset {
            for y in 0..rows {
                let s = src_offset + y * stride;
                let d = dst_offset + y * stride;
                bytes.copy_within(s..s + row_bytes, d);
            }
        } else {
            for y in (0..rows).rev() {
                let s = src_offset + y * stride;
                let d = dst_offset + y * stride;
                bytes.copy_within(s..s + row_bytes, d);
            }
        }
    }
}

impl PixelWriter for FrameBuffer {
    fn write(&mut self, pos: Vector2D, color: PixelColor) {
        self.write_pixel(pos, color);
    }

    fn width(&self) -> i32 {
        self.size().x
    }

    fn height(&self) -> i32 {
        self.size().y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(width: usize, height: usize, color: PixelColor) -> FrameBuffer {
        let mut fb = FrameBuffer::new_shadow(width, height, PixelFormat::Rgb8);
        for y in 0..height as i32 {
            for x in 0..width as i32 {
                fb.write_pixel(Vector2D::new(x, y), color);
            }
        }
        fb
    }

    #[test]
    fn write_and_read_back_both_formats() {
        for format in [PixelFormat::Rgb8, PixelFormat::Bgr8] {
            let mut fb = FrameBuffer::new_shadow(4, 4, format);
            let c = PixelColor::rgb(10, 20, 30);
            fb.write_pixel(Vector2D::new(1, 2), c);
            assert_eq!(fb.pixel_at(Vector2D::new(1, 2)), c);
        }
    }

    #[test]
    fn copy_rejects_mismatched_formats() {
        let mut dst = FrameBuffer::new_shadow(4, 4, PixelFormat::Rgb8);
        let src = FrameBuffer::new_shadow(4, 4, PixelFormat::Bgr8);
        let area = Rectangle::new(Vector2D::new(0, 0), Vector2D::new(4, 4));
        assert_eq!(
            dst.copy(Vector2D::new(0, 0), &src, area),
            Err(ErrorKind::UnknownPixelFormat)
        );
    }

    #[test]
    fn copy_clips_to_destination() {
        let mut dst = filled(4, 4, PixelColor::BLACK);
        let src = filled(4, 4, PixelColor::WHITE);
        let area = Rectangle::new(Vector2D::new(0, 0), Vector2D::new(4, 4));
        dst.copy(Vector2D::new(2, 2), &src, area).unwrap();
        assert_eq!(dst.pixel_at(Vector2D::new(1, 1)), PixelColor::BLACK);
        assert_eq!(dst.pixel_at(Vector2D::new(2, 2)), PixelColor::WHITE);
        assert_eq!(dst.pixel_at(Vector2D::new(3, 3)), PixelColor::WHITE);
    }

    #[test]
    fn copy_clips_negative_destination() {
        let mut dst = filled(4, 4, PixelColor::BLACK);
        let src = filled(4, 4, PixelColor::WHITE);
        let area = Rectangle::new(Vector2D::new(0, 0), Vector2D::new(4, 4));
        dst.copy(Vector2D::new(-2, -2), &src, area).unwrap();
        // Destination clipping shifts the source window too: the visible
        // part must come from the bottom-right of the source.
        assert_eq!(dst.pixel_at(Vector2D::new(0, 0)), PixelColor::WHITE);
        assert_eq!(dst.pixel_at(Vector2D::new(1, 1)), PixelColor::WHITE);
        assert_eq!(dst.pixel_at(Vector2D::new(2, 2)), PixelColor::BLACK);
    }

    #[test]
    fn move_rect_handles_overlap_upward() {
        let mut fb = FrameBuffer::new_shadow(1, 4, PixelFormat::Rgb8);
        for y in 0..4 {
            fb.write_pixel(Vector2D::new(0, y), PixelColor::rgb(y as u8, 0, 0));
        }
        // Shift rows 1..4 up by one.
        fb.move_rect(
            Vector2D::new(0, 0),
            Rectangle::new(Vector2D::new(0, 1), Vector2D::new(1, 3)),
        );
        assert_eq!(fb.pixel_at(Vector2D::new(0, 0)).r, 1);
        assert_eq!(fb.pixel_at(Vector2D::new(0, 1)).r, 2);
        assert_eq!(fb.pixel_at(Vector2D::new(0, 2)).r, 3);
        assert_eq!(fb.pixel_at(Vector2D::new(0, 3)).r, 3);
    }

    #[test]
    fn move_rect_handles_overlap_downward() {
        let mut fb = FrameBuffer::new_shadow(1, 4, PixelFormat::Rgb8);
        for y in 0..4 {
            fb.write_pixel(Vector2D::new(0, y), PixelColor::rgb(y as u8, 0, 0));
        }
        fb.move_rect(
            Vector2D::new(0, 1),
            Rectangle::new(Vector2D::new(0, 0), Vector2D::new(1, 3)),
        );
        assert_eq!(fb.pixel_at(Vector2D::new(0, 1)).r, 0);
        assert_eq!(fb.pixel_at(Vector2D::new(0, 2)).r, 1);
        assert_eq!(fb.pixel_at(Vector2D::new(0, 3)).r, 2);
    }
}
