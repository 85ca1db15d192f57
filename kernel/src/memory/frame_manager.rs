//! Bitmap frame manager
//!
//! Owns the free/used state of physical 4 KiB frames, one bit per frame.
//! Contiguous allocation is a first-fit scan inside the manageable window;
//! everything outside the window is permanently "allocated" and never
//! returned.

use crate::constants::memory::{BITS_PER_MAP_LINE, FRAME_SIZE, FULL_MAP_LINE, MAX_FRAME_COUNT};
use crate::error::{ErrorKind, KernelResult};

use alloc::boxed::Box;
use alloc::vec;
use limine::memory_map::EntryType;
use limine::response::MemoryMapResponse;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

/// Index of a physical 4 KiB frame; the address is `id * 4096`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameId(usize);

impl FrameId {
    pub const NULL: FrameId = FrameId(usize::MAX);

    pub const fn new(id: usize) -> Self {
        FrameId(id)
    }

    pub const fn id(self) -> usize {
        self.0
    }

    pub fn phys_addr(self) -> PhysAddr {
        PhysAddr::new((self.0 * FRAME_SIZE) as u64)
    }

    pub fn from_phys(addr: PhysAddr) -> Self {
        FrameId(addr.as_u64() as usize / FRAME_SIZE)
    }
}

pub struct BitmapFrameManager {
    alloc_map: Box<[u64]>,
    frame_count: usize,
    range_begin: FrameId,
    range_end: FrameId,
}

impl BitmapFrameManager {
    /// Creates a manager covering `frame_count` frames (capped at 128 GiB
    /// worth), with every frame marked allocated and an empty window.
    pub fn new(frame_count: usize) -> Self {
        let frame_count = frame_count.min(MAX_FRAME_COUNT);
        let map_lines = frame_count.div_ceil(BITS_PER_MAP_LINE);
        BitmapFrameManager {
            alloc_map: vec![FULL_MAP_LINE; map_lines].into_boxed_slice(),
            frame_count,
            range_begin: FrameId::new(0),
            range_end: FrameId::new(0),
        }
    }

    /// Builds the manager from the bootloader memory map: usable regions
    /// become free, everything else stays allocated, and the frames the
    /// boot allocator already handed out are re-marked.
    ///
    /// # Safety
    /// The memory map must describe the machine this kernel runs on.
    pub unsafe fn init(
        memory_map: &MemoryMapResponse,
        initial_frames: impl Iterator<Item = PhysFrame>,
    ) -> Self {
        let mut true_end: usize = 0;
        for entry in memory_map.entries().iter() {
            if entry.entry_type == EntryType::USABLE {
                let end_addr = (entry.base + entry.length) as usize;
                if end_addr > true_end {
                    true_end = end_addr;
                }
            }
        }
        let mut manager = Self::new(true_end.div_ceil(FRAME_SIZE));

        for entry in memory_map.entries().iter() {
            if entry.entry_type == EntryType::USABLE {
                let start = entry.base as usize / FRAME_SIZE;
                let end = (entry.base + entry.length) as usize / FRAME_SIZE;
                for frame in start..end.min(manager.frame_count) {
                    manager.set_bit(FrameId::new(frame), false);
                }
            }
        }
        for frame in initial_frames {
            manager.set_bit(FrameId::from_phys(frame.start_address()), true);
        }
        // Frame 0 stays out of circulation so a null physical address is
        // never a valid allocation.
        manager.set_memory_range(FrameId::new(1), FrameId::new(manager.frame_count));
        manager
    }

    /// Restricts future allocations to `[range_begin, range_end)`. Reserved
    /// regions must already be marked allocated.
    pub fn set_memory_range(&mut self, range_begin: FrameId, range_end: FrameId) {
        self.range_begin = range_begin;
        self.range_end = FrameId::new(range_end.id().min(self.frame_count));
    }

    /// First-fit scan for `num_frames` contiguous free frames.
    pub fn allocate(&mut self, num_frames: usize) -> KernelResult<FrameId> {
        let mut start_frame_id = self.range_begin.id();
        loop {
            let mut i = 0;
            while i < num_frames {
                if start_frame_id + i >= self.range_end.id() {
                    return Err(ErrorKind::NoEnoughMemory);
                }
                if self.get_bit(FrameId::new(start_frame_id + i)) {
                    break;
                }
                i += 1;
            }
            if i == num_frames {
                self.mark_allocated(FrameId::new(start_frame_id), num_frames);
                return Ok(FrameId::new(start_frame_id));
            }
            start_frame_id += i + 1;
        }
    }

    pub fn free(&mut self, start_frame: FrameId, num_frames: usize) -> KernelResult<()> {
        for i in 0..num_frames {
            debug_assert!(
                self.get_bit(FrameId::new(start_frame.id() + i)),
                "freeing a frame that is not allocated"
            );
            self.set_bit(FrameId::new(start_frame.id() + i), false);
        }
        Ok(())
    }

    pub fn mark_allocated(&mut self, start_frame: FrameId, num_frames: usize) {
        for i in 0..num_frames {
            self.set_bit(FrameId::new(start_frame.id() + i), true);
        }
    }

    pub fn is_allocated(&self, frame: FrameId) -> bool {
        self.get_bit(frame)
    }

    fn get_bit(&self, frame: FrameId) -> bool {
        let line_index = frame.id() / BITS_PER_MAP_LINE;
        let bit_index = frame.id() % BITS_PER_MAP_LINE;
        (self.alloc_map[line_index] & (1u64 << bit_index)) != 0
    }

    fn set_bit(&mut self, frame: FrameId, allocated: bool) {
        let line_index = frame.id() / BITS_PER_MAP_LINE;
        let bit_index = frame.id() % BITS_PER_MAP_LINE;
        if allocated {
            self.alloc_map[line_index] |= 1u64 << bit_index;
        } else {
            self.alloc_map[line_index] &= !(1u64 << bit_index);
        }
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameManager {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.allocate(1)
            .ok()
            .map(|id| PhysFrame::containing_address(id.phys_addr()))
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameManager {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let _ = self.free(FrameId::from_phys(frame.start_address()), 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 64-frame manager with frames 1..64 free.
    fn small_manager() -> BitmapFrameManager {
        let mut m = BitmapFrameManager::new(64);
        m.set_memory_range(FrameId::new(1), FrameId::new(64));
        m.free(FrameId::new(1), 63).unwrap();
        m
    }

    fn snapshot(m: &BitmapFrameManager) -> alloc::vec::Vec<bool> {
        (0..64).map(|i| m.is_allocated(FrameId::new(i))).collect()
    }

    #[test]
    fn allocate_then_free_restores_the_bitmap() {
        let mut m = small_manager();
        let before = snapshot(&m);
        let id = m.allocate(5).unwrap();
        assert_ne!(snapshot(&m), before);
        m.free(id, 5).unwrap();
        assert_eq!(snapshot(&m), before);
    }

    #[test]
    fn freed_middle_frame_is_reused_first_fit() {
        let mut m = small_manager();
        let id = m.allocate(3).unwrap();
        assert_eq!(id, FrameId::new(1));
        let middle = FrameId::new(id.id() + 1);
        m.free(middle, 1).unwrap();
        assert_eq!(m.allocate(1).unwrap(), middle);
    }

    #[test]
    fn allocation_is_contiguous_and_inside_the_window() {
        let mut m = small_manager();
        m.mark_allocated(FrameId::new(5), 1);
        // 1..5 has only 4 free frames, so a 5-frame run starts at 6.
        let id = m.allocate(5).unwrap();
        assert_eq!(id, FrameId::new(6));
        for i in 0..5 {
            assert!(m.is_allocated(FrameId::new(6 + i)));
        }
    }

    #[test]
    fn exhaustion_reports_no_enough_memory() {
        let mut m = small_manager();
        assert_eq!(m.allocate(64), Err(ErrorKind::NoEnoughMemory));
        assert_eq!(m.allocate(63).unwrap(), FrameId::new(1));
        assert_eq!(m.allocate(1), Err(ErrorKind::NoEnoughMemory));
    }

    #[test]
    fn frames_outside_the_window_are_never_returned() {
        let mut m = BitmapFrameManager::new(64);
        m.set_memory_range(FrameId::new(8), FrameId::new(16));
        m.free(FrameId::new(1), 63).unwrap();
        let mut allocated = alloc::vec::Vec::new();
        while let Ok(id) = m.allocate(1) {
            allocated.push(id.id());
        }
        assert!(!allocated.is_empty());
        assert!(allocated.iter().all(|&id| (8..16).contains(&id)));
    }

    #[test]
    fn frame_allocator_trait_roundtrip() {
        let mut m = small_manager();
        let frame = m.allocate_frame().unwrap();
        assert!(m.is_allocated(FrameId::from_phys(frame.start_address())));
        unsafe { m.deallocate_frame(frame) };
        assert!(!m.is_allocated(FrameId::from_phys(frame.start_address())));
    }

    #[test]
    fn null_frame_id_is_max() {
        assert_eq!(FrameId::NULL.id(), usize::MAX);
    }
}
