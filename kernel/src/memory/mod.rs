pub mod boot_frame_allocator;
pub mod frame_allocator;
pub mod frame_manager;
pub mod heap;
pub mod page_map;
pub mod paging;

pub use frame_manager::{BitmapFrameManager, FrameId};

use boot_frame_allocator::BootFrameAllocator;
use frame_allocator::{GlobalFrameAllocator, FRAME_ALLOCATOR};
use lazy_static::lazy_static;
use limine::request::HhdmRequest;
use limine::response::MemoryMapResponse;
use spin::Mutex;
use x86_64::{structures::paging::OffsetPageTable, PhysAddr, VirtAddr};

#[used]
#[link_section = ".requests"]
pub static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

lazy_static! {
    /// Base of the bootloader's higher-half direct map.
    pub static ref HHDM_OFFSET: VirtAddr = VirtAddr::new(
        HHDM_REQUEST
            .get_response()
            .expect("HHDM request failed")
            .offset()
    );
    pub static ref KERNEL_MAPPER: Mutex<OffsetPageTable<'static>> =
        Mutex::new(unsafe { paging::init(*HHDM_OFFSET) });
}

/// Physical address as seen through the direct map.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    *HHDM_OFFSET + phys.as_u64()
}

/// Boot-time memory bring-up: boot frame allocator, kernel heap, then the
/// bitmap frame manager.
pub fn init(memory_map: &'static MemoryMapResponse) {
    unsafe {
        *FRAME_ALLOCATOR.lock() = Some(GlobalFrameAllocator::Boot(BootFrameAllocator::init(
            memory_map,
        )));
    }
    {
        let mut mapper = KERNEL_MAPPER.lock();
        heap::init_heap(&mut *mapper).expect("heap initialization failed");
    }
    heap::switch_allocator();
}
