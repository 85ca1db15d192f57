//! PCI bus scan and MSI configuration.
//!
//! Configuration space is reached through the legacy 0x0CF8/0x0CFC port
//! pair. The port accesses sit behind the `ConfigAccess` trait so the scan
//! and capability logic can run against a mock topology.

use spin::Once;
use x86_64::instructions::port::{PortGeneric, ReadWriteAccess, WriteOnlyAccess};

use crate::constants::ports::{PCI_CONFIG_ADDRESS, PCI_CONFIG_DATA};
use crate::error::{ErrorKind, KernelResult};

/// Capacity of the device table filled by the bus scan.
pub const MAX_DEVICES: usize = 32;

pub const CAPABILITY_MSI: u8 = 0x05;
pub const CAPABILITY_MSIX: u8 = 0x11;
const CAP_POINTER_REG: u8 = 0x34;

/// Raw 32-bit configuration-space access for one function register.
pub trait ConfigAccess {
    fn read(&mut self, bus: u8, device: u8, function: u8, reg_addr: u8) -> u32;
    fn write(&mut self, bus: u8, device: u8, function: u8, reg_addr: u8, value: u32);
}

/// CONFIG_ADDRESS encoding: enable bit, bus, device, function, register.
pub fn make_address(bus: u8, device: u8, function: u8, reg_addr: u8) -> u32 {
    debug_assert!(device < 32);
    debug_assert!(function < 8);
    debug_assert!(reg_addr % 4 == 0);
    1 << 31
        | (bus as u32) << 16
        | (device as u32) << 11
        | (function as u32) << 8
        | (reg_addr as u32)
}

/// Hardware access through the legacy I/O port pair.
pub struct PortConfigAccess;

impl ConfigAccess for PortConfigAccess {
    fn read(&mut self, bus: u8, device: u8, function: u8, reg_addr: u8) -> u32 {
        let address = make_address(bus, device, function, reg_addr);
        unsafe {
            let mut address_port: PortGeneric<u32, WriteOnlyAccess> =
                PortGeneric::new(PCI_CONFIG_ADDRESS);
            address_port.write(address);
            let mut data_port: PortGeneric<u32, ReadWriteAccess> =
                PortGeneric::new(PCI_CONFIG_DATA);
            data_port.read()
        }
    }

    fn write(&mut self, bus: u8, device: u8, function: u8, reg_addr: u8, value: u32) {
        let address = make_address(bus, device, function, reg_addr);
        unsafe {
            let mut address_port: PortGeneric<u32, WriteOnlyAccess> =
                PortGeneric::new(PCI_CONFIG_ADDRESS);
            address_port.write(address);
            let mut data_port: PortGeneric<u32, ReadWriteAccess> =
                PortGeneric::new(PCI_CONFIG_DATA);
            data_port.write(value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassCode {
    pub base: u8,
    pub sub: u8,
    pub interface: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub header_type: u8,
    pub class_code: ClassCode,
}

/// Devices discovered by [`scan_all_bus`], in discovery order.
pub struct DeviceList {
    devices: [Option<Device>; MAX_DEVICES],
    count: usize,
}

impl DeviceList {
    pub const fn new() -> Self {
        DeviceList {
            devices: [None; MAX_DEVICES],
            count: 0,
        }
    }

    fn add(&mut self, device: Device) -> KernelResult<()> {
        if self.count == MAX_DEVICES {
            return Err(ErrorKind::Full);
        }
        self.devices[self.count] = Some(device);
        self.count += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices[..self.count].iter().filter_map(Option::as_ref)
    }
}

impl Default for DeviceList {
    fn default() -> Self {
        Self::new()
    }
}

fn read_vendor_id(access: &mut impl ConfigAccess, bus: u8, device: u8, function: u8) -> u16 {
    (access.read(bus, device, function, 0x00) & 0xFFFF) as u16
}

fn read_header_type(access: &mut impl ConfigAccess, bus: u8, device: u8, function: u8) -> u8 {
    ((access.read(bus, device, function, 0x0C) >> 16) & 0xFF) as u8
}

fn read_class_code(access: &mut impl ConfigAccess, bus: u8, device: u8, function: u8) -> ClassCode {
    let reg = access.read(bus, device, function, 0x08);
    ClassCode {
        base: (reg >> 24) as u8,
        sub: ((reg >> 16) & 0xFF) as u8,
        interface: ((reg >> 8) & 0xFF) as u8,
    }
}

/// Bus Numbers register of a PCI-to-PCI bridge; bits 15:8 hold the
/// secondary bus.
fn read_bus_numbers(access: &mut impl ConfigAccess, bus: u8, device: u8, function: u8) -> u32 {
    access.read(bus, device, function, 0x18)
}

fn is_single_function_device(header_type: u8) -> bool {
    header_type & 0x80 == 0
}

fn scan_function(
    access: &mut impl ConfigAccess,
    list: &mut DeviceList,
    bus: u8,
    device: u8,
    function: u8,
) -> KernelResult<()> {
    let vendor_id = read_vendor_id(access, bus, device, function);
    let header_type = read_header_type(access, bus, device, function);
    let class_code = read_class_code(access, bus, device, function);
    list.add(Device {
        bus,
        device,
        function,
        vendor_id,
        header_type,
        class_code,
    })?;

    if header_type & 0x7F == 0x01 {
        // PCI-to-PCI bridge: walk the secondary bus.
        let bus_numbers = read_bus_numbers(access, bus, device, function);
        let secondary_bus = ((bus_numbers >> 8) & 0xFF) as u8;
        return scan_bus(access, list, secondary_bus);
    }
    Ok(())
}

fn scan_device(
    access: &mut impl ConfigAccess,
    list: &mut DeviceList,
    bus: u8,
    device: u8,
) -> KernelResult<()> {
    scan_function(access, list, bus, device, 0)?;
    if is_single_function_device(read_header_type(access, bus, device, 0)) {
        return Ok(());
    }
    for function in 1..8 {
        if read_vendor_id(access, bus, device, function) == 0xFFFF {
            continue;
        }
        scan_function(access, list, bus, device, function)?;
    }
    Ok(())
}

fn scan_bus(access: &mut impl ConfigAccess, list: &mut DeviceList, bus: u8) -> KernelResult<()> {
    for device in 0..32 {
        if read_vendor_id(access, bus, device, 0) == 0xFFFF {
            continue;
        }
        scan_device(access, list, bus, device)?;
    }
    Ok(())
}

/// Walks the bus tree from bus 0, recursing through bridges. The table is
/// capped at [`MAX_DEVICES`]; a full table ends the scan silently, which
/// also bounds malformed or cyclic topologies.
pub fn scan_all_bus(access: &mut impl ConfigAccess) -> KernelResult<DeviceList> {
    let mut list = DeviceList::new();
    match scan_bus(access, &mut list, 0) {
        Ok(()) | Err(ErrorKind::Full) => Ok(list),
        Err(e) => Err(e),
    }
}

const fn bar_address(bar_index: u8) -> u8 {
    0x10 + 4 * bar_index
}

/// Reads a BAR; 64-bit BARs consume two slots and are returned with the low
/// flag bits masked off.
pub fn read_bar(access: &mut impl ConfigAccess, dev: &Device, bar_index: u8) -> KernelResult<u64> {
    if bar_index > 5 {
        return Err(ErrorKind::IndexOutOfRange);
    }
    let bar = access.read(dev.bus, dev.device, dev.function, bar_address(bar_index));

    // Memory BAR with bits 2:1 == 0b10 spans this slot and the next.
    if bar & 0x6 != 0x4 {
        return Ok(bar as u64);
    }
    if bar_index > 4 {
        return Err(ErrorKind::IndexOutOfRange);
    }
    let upper = access.read(dev.bus, dev.device, dev.function, bar_address(bar_index + 1));
    Ok((((upper as u64) << 32) | bar as u64) & !0xF)
}

/// Common header of a capability register.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityHeader(pub u32);

impl CapabilityHeader {
    pub fn cap_id(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn next_ptr(self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }
}

pub fn read_capability_header(
    access: &mut impl ConfigAccess,
    dev: &Device,
    addr: u8,
) -> CapabilityHeader {
    CapabilityHeader(access.read(dev.bus, dev.device, dev.function, addr))
}

/// MSI capability, superset layout. Which registers exist depends on the
/// `addr_64_capable` and `per_vector_mask_capable` header bits; the
/// register offsets are chosen accordingly when reading and writing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsiCapability {
    pub header: u32,
    pub msg_addr: u32,
    pub msg_upper_addr: u32,
    pub msg_data: u32,
}

impl MsiCapability {
    pub fn msi_enable(&self) -> bool {
        self.header & (1 << 16) != 0
    }

    pub fn set_msi_enable(&mut self, enable: bool) {
        if enable {
            self.header |= 1 << 16;
        } else {
            self.header &= !(1 << 16);
        }
    }

    pub fn multi_msg_capable(&self) -> u32 {
        (self.header >> 17) & 0x7
    }

    pub fn multi_msg_enable(&self) -> u32 {
        (self.header >> 20) & 0x7
    }

    pub fn set_multi_msg_enable(&mut self, value: u32) {
        self.header = (self.header & !(0x7 << 20)) | ((value & 0x7) << 20);
    }

    pub fn addr_64_capable(&self) -> bool {
        self.header & (1 << 23) != 0
    }

    pub fn per_vector_mask_capable(&self) -> bool {
        self.header & (1 << 24) != 0
    }
}

fn read_msi_capability(
    access: &mut impl ConfigAccess,
    dev: &Device,
    cap_addr: u8,
) -> MsiCapability {
    let mut msi = MsiCapability {
        header: access.read(dev.bus, dev.device, dev.function, cap_addr),
        ..Default::default()
    };
    msi.msg_addr = access.read(dev.bus, dev.device, dev.function, cap_addr + 4);
    if msi.addr_64_capable() {
        msi.msg_upper_addr = access.read(dev.bus, dev.device, dev.function, cap_addr + 8);
        msi.msg_data = access.read(dev.bus, dev.device, dev.function, cap_addr + 12);
    } else {
        msi.msg_data = access.read(dev.bus, dev.device, dev.function, cap_addr + 8);
    }
    msi
}

fn write_msi_capability(
    access: &mut impl ConfigAccess,
    dev: &Device,
    cap_addr: u8,
    msi: &MsiCapability,
) {
    access.write(dev.bus, dev.device, dev.function, cap_addr, msi.header);
    access.write(dev.bus, dev.device, dev.function, cap_addr + 4, msi.msg_addr);
    if msi.addr_64_capable() {
        access.write(
            dev.bus,
            dev.device,
            dev.function,
            cap_addr + 8,
            msi.msg_upper_addr,
        );
        access.write(dev.bus, dev.device, dev.function, cap_addr + 12, msi.msg_data);
    } else {
        access.write(dev.bus, dev.device, dev.function, cap_addr + 8, msi.msg_data);
    }
}

fn configure_msi_register(
    access: &mut impl ConfigAccess,
    dev: &Device,
    cap_addr: u8,
    msg_addr: u32,
    msg_data: u32,
    num_vector_exponent: u32,
) -> KernelResult<()> {
    let mut msi = read_msi_capability(access, dev, cap_addr);
    msi.set_multi_msg_enable(msi.multi_msg_capable().min(num_vector_exponent));
    msi.set_msi_enable(true);
    msi.msg_addr = msg_addr;
    msi.msg_upper_addr = 0;
    msi.msg_data = msg_data;
    write_msi_capability(access, dev, cap_addr, &msi);
    Ok(())
}

/// Walks the capability list and programs the MSI capability. MSI-X-only
/// devices are rejected: this kernel only drives plain MSI.
pub fn configure_msi(
    access: &mut impl ConfigAccess,
    dev: &Device,
    msg_addr: u32,
    msg_data: u32,
    num_vector_exponent: u32,
) -> KernelResult<()> {
    let mut cap_addr = (access.read(dev.bus, dev.device, dev.function, CAP_POINTER_REG) & 0xFF) as u8;
    while cap_addr != 0 {
        let header = read_capability_header(access, dev, cap_addr);
        match header.cap_id() {
            CAPABILITY_MSI => {
                return configure_msi_register(
                    access,
                    dev,
                    cap_addr,
                    msg_addr,
                    msg_data,
                    num_vector_exponent,
                );
            }
            CAPABILITY_MSIX => break,
            _ => cap_addr = header.next_ptr(),
        }
    }
    Err(ErrorKind::InvalidFormat)
}

#[derive(Debug, Clone, Copy)]
pub enum MsiTriggerMode {
    Edge = 0,
    Level = 1,
}

#[derive(Debug, Clone, Copy)]
pub enum MsiDeliveryMode {
    Fixed = 0b000,
    LowestPriority = 0b001,
    Smi = 0b010,
    Nmi = 0b100,
    Init = 0b101,
    ExtInt = 0b111,
}

/// Programs an MSI pointed at one local APIC.
pub fn configure_msi_fixed_destination(
    access: &mut impl ConfigAccess,
    dev: &Device,
    apic_id: u8,
    trigger_mode: MsiTriggerMode,
    delivery_mode: MsiDeliveryMode,
    vector: u8,
    num_vector_exponent: u32,
) -> KernelResult<()> {
    let msg_addr = 0xFEE0_0000 | ((apic_id as u32) << 12);
    let msg_data =
        ((delivery_mode as u32) << 8) | ((trigger_mode as u32) << 15) | vector as u32;
    configure_msi(access, dev, msg_addr, msg_data, num_vector_exponent)
}

static DEVICES: Once<DeviceList> = Once::new();

/// Scans the bus once at boot and caches the result.
pub fn init() {
    let list = scan_all_bus(&mut PortConfigAccess).unwrap_or_default();
    log::info!("pci scan found {} devices", list.len());
    DEVICES.call_once(|| list);
}

/// Devices found at boot; empty before `init`.
pub fn devices() -> impl Iterator<Item = &'static Device> {
    static EMPTY: DeviceList = DeviceList::new();
    DEVICES.get().unwrap_or(&EMPTY).iter()
}
