#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![cfg_attr(test, allow(dead_code, unused_imports))]

extern crate alloc;

use limine::request::{
    FramebufferRequest, MemoryMapRequest, ModuleRequest, RequestsEndMarker, RequestsStartMarker,
};
use limine::BaseRevision;

use helio::graphics::{FrameBuffer, FrameBufferConfig, PixelColor, PixelFormat, Rectangle, Vector2D};
use helio::ui::layer;
use helio::ui::terminal::terminal_task;
use helio::ui::window::Window;
use helio::{devices, filesys, interrupts, logging, memory, serial_println, task};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// Screen geometry from the limine framebuffer response.
fn framebuffer_config() -> FrameBufferConfig {
    let response = FRAMEBUFFER_REQUEST
        .get_response()
        .expect("framebuffer request failed");
    let fb = response
        .framebuffers()
        .next()
        .expect("no framebuffer available");
    let pixel_format = if fb.red_mask_shift() == 0 {
        PixelFormat::Rgb8
    } else {
        PixelFormat::Bgr8
    };
    FrameBufferConfig {
        frame_buffer: fb.addr(),
        pixels_per_scan_line: (fb.pitch() / 4) as usize,
        horizontal_resolution: fb.width() as usize,
        vertical_resolution: fb.height() as usize,
        pixel_format,
    }
}

#[cfg(not(test))]
#[no_mangle]
extern "C" fn kmain() -> ! {
    assert!(BASE_REVISION.is_supported());

    logging::init();
    serial_println!("Booting HelioOS...");

    interrupts::init();

    let memory_map = MEMORY_MAP_REQUEST
        .get_response()
        .expect("memory map request failed");
    memory::init(memory_map);

    devices::pci::init();

    // The FAT32 boot volume rides along as the first limine module.
    match MODULE_REQUEST.get_response().and_then(|r| r.modules().first().copied()) {
        Some(module) => {
            let image =
                unsafe { core::slice::from_raw_parts(module.addr(), module.size() as usize) };
            match filesys::init(image) {
                Ok(()) => log::info!("boot volume mounted ({} bytes)", image.len()),
                Err(e) => log::warn!("boot volume rejected: {:?}", e),
            }
        }
        None => log::warn!("no boot volume module supplied"),
    }

    // Compositor: screen framebuffer, desktop background, layer manager.
    let config = framebuffer_config();
    let screen = FrameBuffer::new(config);
    let screen_size = screen.size();
    layer::init(screen);
    {
        let mut guard = layer::LAYER_MANAGER.lock();
        let manager = guard.as_mut().unwrap();
        let mut desktop = Window::new(screen_size.x, screen_size.y, config.pixel_format);
        helio::graphics::fill_rectangle(
            &mut desktop,
            Vector2D::new(0, 0),
            screen_size,
            PixelColor::from_hex(0x1D2837),
        );
        let desktop_id = {
            let layer = manager.new_layer();
            layer.set_window(alloc::sync::Arc::new(spin::Mutex::new(desktop)));
            layer.id()
        };
        manager.up_down(desktop_id, 0);
        manager.draw(Rectangle::new(Vector2D::new(0, 0), screen_size));
    }

    // Task 1 is the render task; the terminal comes up next to it.
    let render = task::new_task();
    assert_eq!(render.id(), helio::constants::tasks::RENDER_TASK_ID);
    task::spawn(layer::render_task(render));

    let term = task::new_task();
    task::spawn(terminal_task(term, config.pixel_format));

    interrupts::enable();
    serial_println!("HelioOS up");
    task::EXECUTOR.run();
}

#[cfg(not(test))]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    helio::idle_loop();
}

#[cfg(test)]
fn main() {}
