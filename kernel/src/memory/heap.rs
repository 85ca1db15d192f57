//! The kernel heap
//!
//! Talc-backed global allocator over a fixed higher-half span. Heap pages
//! are mapped with frames from the boot allocator; afterwards the global
//! frame allocator is switched to the bitmap manager.

use x86_64::{
    structures::paging::{mapper::MapToError, Mapper, Page, Size4KiB},
    VirtAddr,
};

use crate::constants::memory::{HEAP_SIZE, HEAP_START};
use crate::memory::frame_allocator::{GlobalFrameAllocator, FRAME_ALLOCATOR};
use crate::memory::frame_manager::BitmapFrameManager;
use crate::memory::paging::create_mapping;

#[cfg(not(test))]
use talc::{ClaimOnOom, Span, Talc, Talck};

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: Talck<spin::Mutex<()>, ClaimOnOom> = Talc::new(unsafe {
    ClaimOnOom::new(Span::new(HEAP_START, HEAP_START.wrapping_add(HEAP_SIZE)))
})
.lock();

/// Maps the heap span page by page using the boot frame allocator.
pub fn init_heap(mapper: &mut impl Mapper<Size4KiB>) -> Result<(), MapToError<Size4KiB>> {
    let page_range = {
        let heap_start = VirtAddr::new(HEAP_START as u64);
        let heap_end = heap_start + HEAP_SIZE as u64 - 1u64;
        let heap_start_page = Page::containing_address(heap_start);
        let heap_end_page = Page::containing_address(heap_end);
        Page::range_inclusive(heap_start_page, heap_end_page)
    };

    for page in page_range {
        create_mapping(page, mapper);
    }

    Ok(())
}

/// Replaces the boot bump allocator with the bitmap manager, seeding it
/// with every frame the boot allocator handed out.
pub fn switch_allocator() {
    let mut alloc = FRAME_ALLOCATOR.lock();
    match alloc.take() {
        Some(GlobalFrameAllocator::Boot(boot_alloc)) => {
            let manager = unsafe {
                BitmapFrameManager::init(boot_alloc.memory_map(), boot_alloc.allocated_frames())
            };
            *alloc = Some(GlobalFrameAllocator::Bitmap(manager));
            log::info!("frame allocator switched to bitmap manager");
        }
        _ => panic!("switch_allocator called before boot allocator was set"),
    }
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, string::String, vec, vec::Vec};

    #[test]
    fn basic_heap_alloc() {
        let base = Box::new(42);
        assert_eq!(*base, 42);
    }

    #[test]
    fn vector_alloc() {
        let mut v = Vec::new();
        for i in 0..100 {
            v.push(i);
        }
        let expected_sum: usize = (0..100).sum();
        let sum: usize = v.iter().sum();
        assert_eq!(sum, expected_sum);
    }

    #[test]
    fn string_allocation() {
        let s = String::from("Hello, kernel heap!");
        assert_eq!(s, "Hello, kernel heap!");
    }

    #[test]
    fn large_allocation() {
        let size = 1024 * 512;
        let v: Vec<u8> = vec![1; size];
        assert_eq!(v.len(), size);
        assert!(v.iter().all(|&b| b == 1));
    }
}
