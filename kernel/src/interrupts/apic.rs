//! Local APIC in x2APIC mode.
//!
//! All register access goes through MSRs. The timer runs periodic with a
//! fixed divide; ticks are consumed by the timer manager.

use raw_cpuid::CpuId;
use x86_64::instructions::port::Port;
use x86_64::registers::model_specific::Msr;

use crate::constants::idt::{SPURIOUS_VECTOR, TIMER_VECTOR};
use crate::constants::ports::{PIC1_DATA, PIC2_DATA};

const IA32_APIC_BASE_MSR: u32 = 0x1B;
const X2APIC_MSR_BASE: u32 = 0x800;

const OFFSET_ID: u32 = 0x02;
const OFFSET_EOI: u32 = 0x0B;
const OFFSET_SVR: u32 = 0x0F;
const OFFSET_LVT_TIMER: u32 = 0x32;
const OFFSET_TIMER_INITIAL_COUNT: u32 = 0x38;
const OFFSET_TIMER_DIVIDE_CONFIG: u32 = 0x3E;

const TIMER_MODE_PERIODIC: u64 = 1 << 17;
const APIC_SOFTWARE_ENABLE: u64 = 1 << 8;
const X2APIC_ENABLE: u64 = 0b11 << 10;

/// Timer reload value; roughly a 10 ms period on common QEMU setups. The
/// terminal only needs a steady blink, not wall-clock accuracy.
const TIMER_INITIAL_COUNT: u64 = 10_000_000;

/// Enables the x2APIC and starts the periodic timer.
///
/// # Safety
/// Must run once, on the BSP, with interrupts disabled.
pub unsafe fn init() {
    let cpuid = CpuId::new();
    let has_x2apic = cpuid
        .get_feature_info()
        .is_some_and(|f| f.has_x2apic());
    assert!(has_x2apic, "x2APIC not supported by this CPU");

    // The legacy PICs keep firing unless fully masked.
    Port::<u8>::new(PIC1_DATA).write(0xFF);
    Port::<u8>::new(PIC2_DATA).write(0xFF);

    let mut apic_base = Msr::new(IA32_APIC_BASE_MSR);
    apic_base.write(apic_base.read() | X2APIC_ENABLE);

    Msr::new(X2APIC_MSR_BASE + OFFSET_SVR).write(APIC_SOFTWARE_ENABLE | SPURIOUS_VECTOR as u64);
    Msr::new(X2APIC_MSR_BASE + OFFSET_TIMER_DIVIDE_CONFIG).write(0b1011); // divide by 1
    Msr::new(X2APIC_MSR_BASE + OFFSET_LVT_TIMER).write(TIMER_MODE_PERIODIC | TIMER_VECTOR as u64);
    Msr::new(X2APIC_MSR_BASE + OFFSET_TIMER_INITIAL_COUNT).write(TIMER_INITIAL_COUNT);
}

pub fn send_eoi() {
    unsafe { Msr::new(X2APIC_MSR_BASE + OFFSET_EOI).write(0) };
}

pub fn local_apic_id() -> u32 {
    unsafe { Msr::new(X2APIC_MSR_BASE + OFFSET_ID).read() as u32 }
}
