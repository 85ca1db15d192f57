//! Recursive 4-level page-map builder.
//!
//! Populates and tears down the page-map subtrees that back loaded
//! executables. Table frames come from the frame allocator and are
//! dereferenced through a [`PageTableMapper`], so the walk itself is
//! independent of how physical memory is reachable.

use x86_64::structures::paging::{
    FrameAllocator, FrameDeallocator, PageTable, PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::VirtAddr;

use crate::error::{ErrorKind, KernelResult};

/// Translates a physical page-table frame to a dereferenceable pointer.
pub trait PageTableMapper {
    /// # Safety
    /// `frame` must hold a page table (or a page being treated as one) that
    /// the caller owns; the returned pointer aliases it.
    unsafe fn table_ptr(&self, frame: PhysFrame) -> *mut PageTable;
}

/// Kernel-side mapper: physical frames are visible through the
/// bootloader's higher-half direct map.
pub struct HhdmMapper;

impl PageTableMapper for HhdmMapper {
    unsafe fn table_ptr(&self, frame: PhysFrame) -> *mut PageTable {
        crate::memory::phys_to_virt(frame.start_address()).as_mut_ptr()
    }
}

/// A partially completed walk: how many pages were still unmapped when the
/// allocator gave out, so callers can report progress before tearing down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapError {
    pub remaining: usize,
    pub cause: ErrorKind,
}

/// 9-bit index of `addr` at the given level (4 = PML4 .. 1 = PT).
fn part(addr: VirtAddr, level: u8) -> usize {
    let shift = 12 + 9 * (level as u64 - 1);
    ((addr.as_u64() >> shift) & 0x1FF) as usize
}

/// Address with the index at `level` replaced by `next_index` and every
/// lower part zeroed.
fn step_part(addr: VirtAddr, level: u8, next_index: usize) -> VirtAddr {
    let shift = 12 + 9 * (level as u64 - 1);
    let field_and_below = (1u64 << (shift + 9)) - 1;
    let base = addr.as_u64() & !field_and_below;
    VirtAddr::new_truncate(base | ((next_index as u64) << shift))
}

fn new_page_table<A, M>(allocator: &mut A, mapper: &M) -> KernelResult<PhysFrame>
where
    A: FrameAllocator<Size4KiB>,
    M: PageTableMapper,
{
    let frame = allocator.allocate_frame().ok_or(ErrorKind::NoEnoughMemory)?;
    unsafe { (*mapper.table_ptr(frame)).zero() };
    Ok(frame)
}

fn child_or_new<A, M>(
    entry: &mut x86_64::structures::paging::page_table::PageTableEntry,
    allocator: &mut A,
    mapper: &M,
) -> KernelResult<PhysFrame>
where
    A: FrameAllocator<Size4KiB>,
    M: PageTableMapper,
{
    if entry.flags().contains(PageTableFlags::PRESENT) {
        return Ok(PhysFrame::containing_address(entry.addr()));
    }
    let frame = new_page_table(allocator, mapper)?;
    entry.set_addr(frame.start_address(), PageTableFlags::PRESENT);
    Ok(frame)
}

/// Maps `num_pages` 4 KiB pages starting at `addr`, descending from `table`
/// at `level`. Every visited entry is made present and writable. Returns
/// the number of pages still to map (0 when this subtree finished them, or
/// the leftover when the walk ran off index 511).
pub fn setup_page_map<A, M>(
    table: &mut PageTable,
    level: u8,
    addr: VirtAddr,
    num_pages: usize,
    allocator: &mut A,
    mapper: &M,
) -> Result<usize, MapError>
where
    A: FrameAllocator<Size4KiB>,
    M: PageTableMapper,
{
    let mut addr = addr;
    let mut num_pages = num_pages;
    while num_pages > 0 {
        let entry_index = part(addr, level);
        let child = child_or_new(&mut table[entry_index], allocator, mapper).map_err(|cause| {
            MapError {
                remaining: num_pages,
                cause,
            }
        })?;
        let flags = table[entry_index].flags();
        table[entry_index].set_flags(flags | PageTableFlags::WRITABLE);

        if level == 1 {
            num_pages -= 1;
        } else {
            let child_table = unsafe { &mut *mapper.table_ptr(child) };
            num_pages = setup_page_map(child_table, level - 1, addr, num_pages, allocator, mapper)
                .map_err(|e| MapError {
                    remaining: num_pages,
                    cause: e.cause,
                })?;
        }

        if entry_index == 511 {
            break;
        }
        addr = step_part(addr, level, entry_index + 1);
    }
    Ok(num_pages)
}

/// Maps `num_pages` pages at `addr` under the given PML4 root.
pub fn setup_page_maps_in<A, M>(
    root: PhysFrame,
    addr: VirtAddr,
    num_pages: usize,
    allocator: &mut A,
    mapper: &M,
) -> Result<(), MapError>
where
    A: FrameAllocator<Size4KiB>,
    M: PageTableMapper,
{
    let table = unsafe { &mut *mapper.table_ptr(root) };
    setup_page_map(table, 4, addr, num_pages, allocator, mapper)?;
    Ok(())
}

/// Maps `num_pages` pages at `addr` under the active PML4 (CR3).
pub fn setup_page_maps(addr: VirtAddr, num_pages: usize) -> KernelResult<()> {
    use x86_64::registers::control::Cr3;
    let (root, _) = Cr3::read();
    let mut guard = crate::memory::frame_allocator::FRAME_ALLOCATOR.lock();
    let allocator = guard.as_mut().ok_or(ErrorKind::NoEnoughMemory)?;
    setup_page_maps_in(root, addr, num_pages, allocator, &HhdmMapper).map_err(|e| e.cause)
}

/// Recursively frees the subtree below `table`, clearing entries as it
/// goes. At level 1 the "subtree" frames are the mapped data pages.
pub fn clean_page_map<D, M>(
    table: &mut PageTable,
    level: u8,
    deallocator: &mut D,
    mapper: &M,
) -> KernelResult<()>
where
    D: FrameDeallocator<Size4KiB>,
    M: PageTableMapper,
{
    for i in 0..512 {
        let entry = &mut table[i];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            continue;
        }
        let frame = PhysFrame::containing_address(entry.addr());
        if level > 1 {
            let child = unsafe { &mut *mapper.table_ptr(frame) };
            clean_page_map(child, level - 1, deallocator, mapper)?;
        }
        unsafe { deallocator.deallocate_frame(frame) };
        entry.set_unused();
    }
    Ok(())
}

/// Clears the single PML4 entry covering `addr` and frees its whole PDP
/// subtree, including the PDP frame itself. Sibling PML4 entries are left
/// alone.
pub fn clean_page_maps_in<D, M>(
    root: PhysFrame,
    addr: VirtAddr,
    deallocator: &mut D,
    mapper: &M,
) -> KernelResult<()>
where
    D: FrameDeallocator<Size4KiB>,
    M: PageTableMapper,
{
    let pml4 = unsafe { &mut *mapper.table_ptr(root) };
    let index = part(addr, 4);
    if !pml4[index].flags().contains(PageTableFlags::PRESENT) {
        return Ok(());
    }
    let pdp_frame = PhysFrame::containing_address(pml4[index].addr());
    pml4[index].set_unused();
    let pdp = unsafe { &mut *mapper.table_ptr(pdp_frame) };
    clean_page_map(pdp, 3, deallocator, mapper)?;
    unsafe { deallocator.deallocate_frame(pdp_frame) };
    Ok(())
}

/// Tears down the page maps for `addr` under the active PML4.
pub fn clean_page_maps(addr: VirtAddr) -> KernelResult<()> {
    use x86_64::registers::control::Cr3;
    let (root, _) = Cr3::read();
    let mut guard = crate::memory::frame_allocator::FRAME_ALLOCATOR.lock();
    let deallocator = guard.as_mut().ok_or(ErrorKind::NoEnoughMemory)?;
    clean_page_maps_in(root, addr, deallocator, &HhdmMapper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_manager::{BitmapFrameManager, FrameId};
    use alloc::vec;
    use alloc::vec::Vec;

    const APP_BASE: u64 = 0xFFFF_8000_0000_0000;

    /// Fake physical memory: frame N lives at `base + N * 4096`.
    struct TestArena {
        _buf: Vec<u8>,
        base: usize,
    }

    impl TestArena {
        fn new(frames: usize) -> Self {
            let buf = vec![0u8; (frames + 1) * 4096];
            let base = (buf.as_ptr() as usize + 4095) & !4095;
            TestArena { _buf: buf, base }
        }
    }

    impl PageTableMapper for TestArena {
        unsafe fn table_ptr(&self, frame: PhysFrame) -> *mut PageTable {
            (self.base + frame.start_address().as_u64() as usize) as *mut PageTable
        }
    }

    fn test_allocator(frames: usize) -> BitmapFrameManager {
        let mut m = BitmapFrameManager::new(frames);
        m.set_memory_range(FrameId::new(1), FrameId::new(frames));
        m.free(FrameId::new(1), frames - 1).unwrap();
        m
    }

    fn free_frames(m: &BitmapFrameManager, total: usize) -> usize {
        (0..total)
            .filter(|&i| !m.is_allocated(FrameId::new(i)))
            .count()
    }

    fn fresh_root(
        allocator: &mut BitmapFrameManager,
        arena: &TestArena,
    ) -> PhysFrame {
        let root = allocator.allocate_frame().unwrap();
        unsafe { (*arena.table_ptr(root)).zero() };
        root
    }

    #[test]
    fn part_extracts_level_indices() {
        let addr = VirtAddr::new(APP_BASE + (3 << 30) + (5 << 21) + (7 << 12) + 0x123);
        assert_eq!(part(addr, 4), 256);
        assert_eq!(part(addr, 3), 3);
        assert_eq!(part(addr, 2), 5);
        assert_eq!(part(addr, 1), 7);
    }

    #[test]
    fn step_part_zeroes_lower_levels() {
        let addr = VirtAddr::new(APP_BASE + (5 << 21) + (7 << 12));
        let next = step_part(addr, 2, 6);
        assert_eq!(part(next, 2), 6);
        assert_eq!(part(next, 1), 0);
        assert_eq!(part(next, 4), 256);
    }

    #[test]
    fn setup_maps_every_requested_page_writable() {
        let frames = 64;
        let mut allocator = test_allocator(frames);
        let arena = TestArena::new(frames);
        let root = fresh_root(&mut allocator, &arena);

        setup_page_maps_in(root, VirtAddr::new(APP_BASE), 5, &mut allocator, &arena).unwrap();

        let pml4 = unsafe { &*arena.table_ptr(root) };
        let e4 = &pml4[256];
        assert!(e4.flags().contains(PageTableFlags::PRESENT | PageTableFlags::WRITABLE));
        let pdp = unsafe { &*arena.table_ptr(PhysFrame::containing_address(e4.addr())) };
        let pd = unsafe { &*arena.table_ptr(PhysFrame::containing_address(pdp[0].addr())) };
        let pt = unsafe { &*arena.table_ptr(PhysFrame::containing_address(pd[0].addr())) };
        for i in 0..5 {
            assert!(
                pt[i].flags().contains(PageTableFlags::PRESENT | PageTableFlags::WRITABLE),
                "page {} not mapped",
                i
            );
        }
        assert!(!pt[5].flags().contains(PageTableFlags::PRESENT));
    }

    #[test]
    fn setup_then_clean_leaks_no_frames() {
        let frames = 64;
        let mut allocator = test_allocator(frames);
        let arena = TestArena::new(frames);
        let root = fresh_root(&mut allocator, &arena);
        let free_before = free_frames(&allocator, frames);

        setup_page_maps_in(root, VirtAddr::new(APP_BASE), 5, &mut allocator, &arena).unwrap();
        assert!(free_frames(&allocator, frames) < free_before);

        clean_page_maps_in(root, VirtAddr::new(APP_BASE), &mut allocator, &arena).unwrap();
        assert_eq!(free_frames(&allocator, frames), free_before);

        // The PML4 slot is cleared; sibling entries were never touched.
        let pml4 = unsafe { &*arena.table_ptr(root) };
        assert!(pml4[256].is_unused());
    }

    #[test]
    fn mapping_spans_page_table_boundaries() {
        // 513 pages cross from one PT into the next.
        let frames = 1024;
        let mut allocator = test_allocator(frames);
        let arena = TestArena::new(frames);
        let root = fresh_root(&mut allocator, &arena);
        let free_before = free_frames(&allocator, frames);

        setup_page_maps_in(root, VirtAddr::new(APP_BASE), 513, &mut allocator, &arena).unwrap();

        // 513 data pages + 1 pdp + 1 pd + 2 pts.
        assert_eq!(free_frames(&allocator, frames), free_before - 513 - 4);

        clean_page_maps_in(root, VirtAddr::new(APP_BASE), &mut allocator, &arena).unwrap();
        assert_eq!(free_frames(&allocator, frames), free_before);
    }

    #[test]
    fn exhaustion_reports_remaining_pages_and_clean_recovers() {
        let frames = 8; // root + pdp + pd + pt + 4 data frames at most
        let mut allocator = test_allocator(frames);
        let arena = TestArena::new(frames);
        let root = fresh_root(&mut allocator, &arena);
        let free_before = free_frames(&allocator, frames);

        let table = unsafe { &mut *arena.table_ptr(root) };
        let err = setup_page_map(table, 4, VirtAddr::new(APP_BASE), 16, &mut allocator, &arena)
            .unwrap_err();
        assert_eq!(err.cause, ErrorKind::NoEnoughMemory);
        // The count reported is the one in flight when the failing subtree
        // was entered.
        assert_eq!(err.remaining, 16);

        // Nothing is released on failure; an explicit teardown recovers
        // every allocated frame.
        clean_page_maps_in(root, VirtAddr::new(APP_BASE), &mut allocator, &arena).unwrap();
        assert_eq!(free_frames(&allocator, frames), free_before);
    }
}
