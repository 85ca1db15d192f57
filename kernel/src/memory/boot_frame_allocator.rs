//! Boot-time bump allocator.
//!
//! Hands out frames from the bootloader memory map before the heap exists.
//! Once the heap is up the kernel switches to the bitmap manager, seeding it
//! with the frames this allocator already consumed. Nothing is ever freed
//! here.

use limine::memory_map::EntryType;
use limine::response::MemoryMapResponse;
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::constants::memory::FRAME_SIZE;

pub struct BootFrameAllocator {
    memory_map: &'static MemoryMapResponse,
    next: usize,
}

impl BootFrameAllocator {
    /// # Safety
    /// The memory map must describe the machine this kernel runs on and the
    /// usable regions must really be unused.
    pub unsafe fn init(memory_map: &'static MemoryMapResponse) -> Self {
        BootFrameAllocator {
            memory_map,
            next: 0,
        }
    }

    pub fn memory_map(&self) -> &'static MemoryMapResponse {
        self.memory_map
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> + '_ {
        self.memory_map
            .entries()
            .iter()
            .filter(|e| e.entry_type == EntryType::USABLE)
            .map(|e| e.base..e.base + e.length)
            .flat_map(|r| r.step_by(FRAME_SIZE))
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }

    /// Frames this allocator has already handed out, for seeding the bitmap
    /// manager.
    pub fn allocated_frames(&self) -> impl Iterator<Item = PhysFrame> + '_ {
        self.usable_frames().take(self.next)
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}
