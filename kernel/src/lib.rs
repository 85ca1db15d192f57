#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]
extern crate alloc;

#[cfg(not(test))]
use x86_64::instructions::hlt;

pub mod constants;
pub mod devices;
pub mod elf;
pub mod error;
pub mod filesys;
pub mod graphics;
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod task;
pub mod ui;

pub use devices::serial;
pub use error::{ErrorKind, KernelResult};

pub mod prelude {
    pub use crate::serial_print;
    pub use crate::serial_println;
    pub use crate::{ErrorKind, KernelResult};
}

#[cfg(not(test))]
pub fn idle_loop() -> ! {
    loop {
        hlt();
    }
}
