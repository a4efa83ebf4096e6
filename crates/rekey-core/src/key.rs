// Rekey Key Type
// Platform-neutral symbolic key identifier (X11 keysym value space)

use std::fmt;

use serde::{Deserialize, Serialize};

/// A platform-neutral logical key identifier.
///
/// Values live in the X11 keysym space: printable Latin-1 characters map
/// one-to-one onto their code points, special keys use the `0xFFxx` block,
/// and Unicode code points above Latin-1 are carried in the extended
/// private range `0x0100_0000 + code_point`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct KeySymbol(pub u32);

impl KeySymbol {
    /// Raw keysym value.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Whether this keysym carries a directly printable character.
    pub fn to_char(self) -> Option<char> {
        match self.0 {
            0x20..=0x7E | 0xA0..=0xFF => char::from_u32(self.0),
            cp if cp >= UNICODE_OFFSET => char::from_u32(cp - UNICODE_OFFSET),
            _ => None,
        }
    }
}

impl From<u32> for KeySymbol {
    fn from(value: u32) -> Self {
        KeySymbol(value)
    }
}

impl fmt::Display for KeySymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Offset of the extended keysym range for Unicode code points above Latin-1.
pub const UNICODE_OFFSET: u32 = 0x0100_0000;

/// Convert a single character to its keysym.
///
/// Printable ASCII and Latin-1 map one-to-one; higher code points map into
/// the extended range. Control characters have no keysym.
pub fn char_to_keysym(ch: char) -> Option<KeySymbol> {
    let code = ch as u32;
    match code {
        0x20..=0x7E | 0xA0..=0xFF => Some(KeySymbol(code)),
        cp if cp > 0xFF => Some(KeySymbol(UNICODE_OFFSET + cp)),
        _ => None,
    }
}

/// Well-known keysym constants used by the static name table.
pub mod keysyms {
    pub const F1: u32 = 0xFFBE;
    pub const F13: u32 = 0xFFCA;
    pub const F14: u32 = 0xFFCB;

    pub const SHIFT_L: u32 = 0xFFE1;
    pub const CONTROL_L: u32 = 0xFFE3;
    pub const ALT_L: u32 = 0xFFE9;
    pub const SUPER_L: u32 = 0xFFEB;
    pub const CAPS_LOCK: u32 = 0xFFE5;
    pub const NUM_LOCK: u32 = 0xFF7F;
    pub const SCROLL_LOCK: u32 = 0xFF14;

    pub const ESCAPE: u32 = 0xFF1B;
    pub const TAB: u32 = 0xFF09;
    pub const ISO_LEFT_TAB: u32 = 0xFE20;
    pub const BACKSPACE: u32 = 0xFF08;
    pub const RETURN: u32 = 0xFF0D;
    pub const KP_ENTER: u32 = 0xFF8D;
    pub const INSERT: u32 = 0xFF63;
    pub const DELETE: u32 = 0xFFFF;
    pub const PAUSE: u32 = 0xFF13;
    pub const PRINT: u32 = 0xFF61;
    pub const HOME: u32 = 0xFF50;
    pub const END: u32 = 0xFF57;
    pub const LEFT: u32 = 0xFF51;
    pub const UP: u32 = 0xFF52;
    pub const RIGHT: u32 = 0xFF53;
    pub const DOWN: u32 = 0xFF54;
    pub const PAGE_UP: u32 = 0xFF55;
    pub const PAGE_DOWN: u32 = 0xFF56;
    pub const SPACE: u32 = 0x20;
    pub const MENU: u32 = 0xFF67;

    pub const A_LOWER: u32 = 0x61;
    pub const DIGIT_0: u32 = 0x30;
}

/// Static table of special keys: (keysym, display name).
///
/// Letters, digits, and printable Latin-1 are handled by computed ranges
/// in the resolver; this table only covers keys without a printable form
/// (plus punctuation whose display name is the character itself).
pub(crate) const SPECIAL_KEYS: &[(u32, &str)] = &[
    // Function keys F1-F24 (contiguous keysym block)
    (keysyms::F1, "F1"),
    (keysyms::F1 + 1, "F2"),
    (keysyms::F1 + 2, "F3"),
    (keysyms::F1 + 3, "F4"),
    (keysyms::F1 + 4, "F5"),
    (keysyms::F1 + 5, "F6"),
    (keysyms::F1 + 6, "F7"),
    (keysyms::F1 + 7, "F8"),
    (keysyms::F1 + 8, "F9"),
    (keysyms::F1 + 9, "F10"),
    (keysyms::F1 + 10, "F11"),
    (keysyms::F1 + 11, "F12"),
    (keysyms::F1 + 12, "F13"),
    (keysyms::F1 + 13, "F14"),
    (keysyms::F1 + 14, "F15"),
    (keysyms::F1 + 15, "F16"),
    (keysyms::F1 + 16, "F17"),
    (keysyms::F1 + 17, "F18"),
    (keysyms::F1 + 18, "F19"),
    (keysyms::F1 + 19, "F20"),
    (keysyms::F1 + 20, "F21"),
    (keysyms::F1 + 21, "F22"),
    (keysyms::F1 + 22, "F23"),
    (keysyms::F1 + 23, "F24"),
    // Modifiers
    (keysyms::SHIFT_L, "Shift"),
    (keysyms::CONTROL_L, "Ctrl"),
    (keysyms::ALT_L, "Alt"),
    (keysyms::SUPER_L, "Super"),
    (keysyms::CAPS_LOCK, "CapsLock"),
    (keysyms::NUM_LOCK, "NumLock"),
    (keysyms::SCROLL_LOCK, "ScrollLock"),
    // Navigation / editing
    (keysyms::ESCAPE, "Escape"),
    (keysyms::TAB, "Tab"),
    (keysyms::ISO_LEFT_TAB, "Backtab"),
    (keysyms::BACKSPACE, "Backspace"),
    (keysyms::RETURN, "Return"),
    (keysyms::KP_ENTER, "Enter"),
    (keysyms::INSERT, "Insert"),
    (keysyms::DELETE, "Delete"),
    (keysyms::PAUSE, "Pause"),
    (keysyms::PRINT, "Print"),
    (keysyms::HOME, "Home"),
    (keysyms::END, "End"),
    (keysyms::LEFT, "Left"),
    (keysyms::UP, "Up"),
    (keysyms::RIGHT, "Right"),
    (keysyms::DOWN, "Down"),
    (keysyms::PAGE_UP, "PageUp"),
    (keysyms::PAGE_DOWN, "PageDown"),
    (keysyms::SPACE, "Space"),
    (keysyms::MENU, "Menu"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_to_keysym_ascii() {
        assert_eq!(char_to_keysym('a'), Some(KeySymbol(0x61)));
        assert_eq!(char_to_keysym('@'), Some(KeySymbol(0x40)));
        assert_eq!(char_to_keysym('2'), Some(KeySymbol(0x32)));
    }

    #[test]
    fn test_char_to_keysym_latin1() {
        assert_eq!(char_to_keysym('é'), Some(KeySymbol(0xE9)));
    }

    #[test]
    fn test_char_to_keysym_unicode_extended_range() {
        let sym = char_to_keysym('€').unwrap();
        assert_eq!(sym.value(), UNICODE_OFFSET + '€' as u32);
        assert_eq!(sym.to_char(), Some('€'));
    }

    #[test]
    fn test_char_to_keysym_control_char() {
        assert_eq!(char_to_keysym('\n'), None);
        assert_eq!(char_to_keysym('\x07'), None);
    }

    #[test]
    fn test_to_char_round_trip() {
        for ch in ['a', 'Z', '0', '@', '#', 'ß'] {
            assert_eq!(char_to_keysym(ch).unwrap().to_char(), Some(ch));
        }
    }

    #[test]
    fn test_special_keys_have_unique_keysyms() {
        let mut seen = std::collections::HashSet::new();
        for (sym, name) in SPECIAL_KEYS {
            assert!(seen.insert(*sym), "duplicate keysym for {}", name);
        }
    }
}
