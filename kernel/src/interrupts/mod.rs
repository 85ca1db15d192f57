//! Interrupt descriptor table and handlers.
//!
//! Handlers do the minimum: advance the tick counter or translate a
//! scancode, push a message, signal EOI. Everything else happens in task
//! context.

pub mod apic;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::constants::idt::{KEYBOARD_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR};
use crate::constants::ports::PS2_DATA;
use crate::constants::tasks::RENDER_TASK_ID;
use crate::devices::keyboard::Keyboard;
use crate::task::{self, Message};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt[TIMER_VECTOR].set_handler_fn(timer_handler);
        idt[KEYBOARD_VECTOR].set_handler_fn(keyboard_handler);
        idt[SPURIOUS_VECTOR].set_handler_fn(spurious_handler);
        idt
    };
}

static KEYBOARD: Mutex<Keyboard> = Mutex::new(Keyboard::new());

/// Loads the IDT and brings up the local APIC. Interrupts stay disabled
/// until [`enable`] is called.
pub fn init() {
    IDT.load();
    unsafe { apic::init() };
}

pub fn enable() {
    interrupts::enable();
}

pub fn disable() {
    interrupts::disable();
}

pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    interrupts::without_interrupts(f)
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::serial_println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    crate::serial_println!(
        "EXCEPTION: PAGE FAULT\nFaulting Address: {:?}\nError Code: {:X}\n{:#?}",
        Cr2::read(),
        error_code,
        stack_frame
    );
    panic!("PAGE FAULT!");
}

extern "x86-interrupt" fn timer_handler(_stack_frame: InterruptStackFrame) {
    task::timer::TIMER_MANAGER.tick();
    apic::send_eoi();
}

extern "x86-interrupt" fn keyboard_handler(_stack_frame: InterruptStackFrame) {
    let scancode = unsafe { Port::<u8>::new(PS2_DATA).read() };
    if let Some(event) = KEYBOARD.lock().process_scancode(scancode) {
        // Key input goes to the render task, which routes it to the task
        // owning the active layer.
        let _ = task::send_message(
            RENDER_TASK_ID,
            Message::KeyPush {
                modifier: event.modifier,
                keycode: event.keycode,
                ascii: event.ascii,
            },
        );
    }
    apic::send_eoi();
}

extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {}
