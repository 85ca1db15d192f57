//! Kernel address-space plumbing.
//!
//! The bootloader leaves us a higher-half direct map of all physical memory;
//! the active PML4 plus that offset gives an `OffsetPageTable` used for
//! kernel mappings such as the heap.

use x86_64::{
    structures::paging::{Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, Size4KiB},
    VirtAddr,
};

use super::frame_allocator::{alloc_frame, dealloc_frame, FRAME_ALLOCATOR};

/// Builds the kernel mapper from the active level-4 table.
///
/// # Safety
/// `hhdm_offset` must be the direct-map offset provided by the bootloader,
/// and the whole of physical memory must be mapped there.
pub unsafe fn init(hhdm_offset: VirtAddr) -> OffsetPageTable<'static> {
    let pml4 = active_level_4_table(hhdm_offset);
    OffsetPageTable::new(pml4, hhdm_offset)
}

unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    use x86_64::registers::control::Cr3;

    let (level_4_table_frame, _) = Cr3::read();

    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();

    &mut *page_table_ptr
}

/// Maps `page` to a freshly allocated frame, present and writable.
pub fn create_mapping(page: Page, mapper: &mut impl Mapper<Size4KiB>) {
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    let frame = alloc_frame().expect("no more frames");

    let map_to_result = unsafe {
        mapper.map_to(
            page,
            frame,
            flags,
            FRAME_ALLOCATOR
                .lock()
                .as_mut()
                .expect("Global allocator not initialized"),
        )
    };
    map_to_result.expect("map_to failed").flush();
}

pub fn remove_mapping(page: Page, mapper: &mut impl Mapper<Size4KiB>) {
    let (frame, flush) = mapper.unmap(page).expect("unmap failed");
    unsafe { dealloc_frame(frame) };
    flush.flush();
}
