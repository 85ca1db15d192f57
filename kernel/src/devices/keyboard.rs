//! PS/2 keyboard scancode translation.
//!
//! Converts set-1 scancodes into `{modifier, keycode, ascii}` triples. The
//! interrupt handler feeds bytes in; arrow keys are reported with the usage
//! codes the terminal's history browsing expects (0x52 up, 0x51 down).

/// Modifier bit assignments.
pub const L_CONTROL: u8 = 0x01;
pub const L_SHIFT: u8 = 0x02;
pub const L_ALT: u8 = 0x04;
pub const R_SHIFT: u8 = 0x20;

pub const KEYCODE_ARROW_DOWN: u8 = 0x51;
pub const KEYCODE_ARROW_UP: u8 = 0x52;

const SC_EXTENDED: u8 = 0xE0;
const SC_L_SHIFT: u8 = 0x2A;
const SC_R_SHIFT: u8 = 0x36;
const SC_L_CONTROL: u8 = 0x1D;
const SC_L_ALT: u8 = 0x38;
const SC_ARROW_UP: u8 = 0x48;
const SC_ARROW_DOWN: u8 = 0x50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub modifier: u8,
    pub keycode: u8,
    pub ascii: u8,
}

/// Scancode decoder state machine.
pub struct Keyboard {
    modifier: u8,
    extended: bool,
}

impl Keyboard {
    pub const fn new() -> Self {
        Keyboard {
            modifier: 0,
            extended: false,
        }
    }

    /// Feeds one scancode byte; returns an event on a completed key press.
    pub fn process_scancode(&mut self, code: u8) -> Option<KeyEvent> {
        if code == SC_EXTENDED {
            self.extended = true;
            return None;
        }

        let extended = core::mem::replace(&mut self.extended, false);
        let make = code & 0x7F;
        let released = code & 0x80 != 0;

        if !extended {
            let modifier_bit = match make {
                SC_L_SHIFT => Some(L_SHIFT),
                SC_R_SHIFT => Some(R_SHIFT),
                SC_L_CONTROL => Some(L_CONTROL),
                SC_L_ALT => Some(L_ALT),
                _ => None,
            };
            if let Some(bit) = modifier_bit {
                if released {
                    self.modifier &= !bit;
                } else {
                    self.modifier |= bit;
                }
                return None;
            }
        }

        if released {
            return None;
        }

        if extended {
            let keycode = match make {
                SC_ARROW_UP => KEYCODE_ARROW_UP,
                SC_ARROW_DOWN => KEYCODE_ARROW_DOWN,
                _ => return None,
            };
            return Some(KeyEvent {
                modifier: self.modifier,
                keycode,
                ascii: 0,
            });
        }

        let shifted = self.modifier & (L_SHIFT | R_SHIFT) != 0;
        let ascii = ascii_for(make, shifted);
        if ascii == 0 {
            return None;
        }
        Some(KeyEvent {
            modifier: self.modifier,
            keycode: make,
            ascii,
        })
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

fn ascii_for(make: u8, shifted: bool) -> u8 {
    const PLAIN: &[u8; 0x3A] = b"\0\x1B1234567890-=\x08\tqwertyuiop[]\n\0asdfghjkl;'`\0\\zxcvbnm,./\0*\0 ";
    const SHIFT: &[u8; 0x3A] = b"\0\x1B!@#$%^&*()_+\x08\tQWERTYUIOP{}\n\0ASDFGHJKL:\"~\0|ZXCVBNM<>?\0*\0 ";
    if (make as usize) >= PLAIN.len() {
        return 0;
    }
    if shifted {
        SHIFT[make as usize]
    } else {
        PLAIN[make as usize]
    }
}
