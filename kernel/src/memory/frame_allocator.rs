//! Global frame allocator.
//!
//! The kernel boots with a bump allocator over the bootloader memory map,
//! then switches to the bitmap manager once the heap can hold its map.

use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};

use super::boot_frame_allocator::BootFrameAllocator;
use super::frame_manager::BitmapFrameManager;

pub enum GlobalFrameAllocator {
    Boot(BootFrameAllocator),
    Bitmap(BitmapFrameManager),
}

unsafe impl FrameAllocator<Size4KiB> for GlobalFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        match self {
            GlobalFrameAllocator::Boot(alloc) => alloc.allocate_frame(),
            GlobalFrameAllocator::Bitmap(manager) => manager.allocate_frame(),
        }
    }
}

impl FrameDeallocator<Size4KiB> for GlobalFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        match self {
            // The bump allocator cannot take frames back; they are
            // reclaimed when the bitmap manager is seeded.
            GlobalFrameAllocator::Boot(_) => {}
            GlobalFrameAllocator::Bitmap(manager) => manager.deallocate_frame(frame),
        }
    }
}

pub static FRAME_ALLOCATOR: Mutex<Option<GlobalFrameAllocator>> = Mutex::new(None);

pub fn alloc_frame() -> Option<PhysFrame> {
    FRAME_ALLOCATOR.lock().as_mut()?.allocate_frame()
}

/// # Safety
/// The frame must have been allocated by this allocator and be unused.
pub unsafe fn dealloc_frame(frame: PhysFrame) {
    if let Some(alloc) = FRAME_ALLOCATOR.lock().as_mut() {
        alloc.deallocate_frame(frame);
    }
}
