pub const SERIAL_PORT: u16 = 0x3F8;

pub const PCI_CONFIG_ADDRESS: u16 = 0x0CF8;
pub const PCI_CONFIG_DATA: u16 = 0x0CFC;

pub const PS2_DATA: u16 = 0x60;

pub const PIC1_DATA: u16 = 0x21;
pub const PIC2_DATA: u16 = 0xA1;
