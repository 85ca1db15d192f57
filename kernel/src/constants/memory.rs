pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Upper bound of physical memory the bitmap frame manager covers.
pub const MAX_PHYSICAL_MEMORY_BYTES: usize = 128 * 1024 * 1024 * 1024;
pub const MAX_FRAME_COUNT: usize = MAX_PHYSICAL_MEMORY_BYTES / FRAME_SIZE;

pub const BITS_PER_MAP_LINE: usize = 64;
pub const FULL_MAP_LINE: u64 = 0xFFFF_FFFF_FFFF_FFFF;

pub const HEAP_START: *mut u8 = 0xFFFF_C000_0000_0000usize as *mut u8;
pub const HEAP_SIZE: usize = 32 * 1024 * 1024;
