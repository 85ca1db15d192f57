//! Filesystem drivers.

pub mod fat32;

use fat32::Fat32Volume;
use spin::Once;

use crate::error::KernelResult;

static BOOT_VOLUME: Once<Fat32Volume<'static>> = Once::new();

/// Mounts the boot volume image handed over by the bootloader.
pub fn init(image: &'static [u8]) -> KernelResult<()> {
    let volume = Fat32Volume::new(image)?;
    BOOT_VOLUME.call_once(|| volume);
    Ok(())
}

pub fn boot_volume() -> Option<&'static Fat32Volume<'static>> {
    BOOT_VOLUME.get()
}
