// Rekey Keysym/Keycode Resolver
// Names, combo strings, and live keyboard-layout keycode tables

use std::collections::HashMap;

use crate::key::{char_to_keysym, KeySymbol, SPECIAL_KEYS};
use crate::modifier::ModifierMask;

/// Backend-specific raw key code.
///
/// The stored value is an X11 keycode; [`DeviceKeyCode::evdev`] converts to
/// the kernel's code space (X11 keycodes are evdev codes shifted by 8).
/// Opaque outside the resolver and hook layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKeyCode(u16);

impl DeviceKeyCode {
    pub(crate) fn from_x11(code: u8) -> Self {
        DeviceKeyCode(code as u16)
    }

    pub(crate) fn from_evdev(code: u16) -> Self {
        DeviceKeyCode(code + 8)
    }

    pub(crate) fn x11(self) -> u8 {
        self.0 as u8
    }

    pub(crate) fn evdev(self) -> u16 {
        self.0.saturating_sub(8)
    }
}

/// Snapshot of the live keyboard mapping, fetched from the display server
/// when a hook starts.
///
/// A layout change after start is not automatically re-resolved; a
/// production version should re-derive this table on a layout-change
/// notification.
#[derive(Debug, Clone)]
pub struct LayoutTable {
    min_keycode: u8,
    keysyms_per_keycode: u8,
    /// Row-major: `keysyms_per_keycode` entries per keycode starting at
    /// `min_keycode`. Zero entries are unbound positions.
    keysyms: Vec<u32>,
}

impl LayoutTable {
    /// Build a table from raw `GetKeyboardMapping` data.
    pub fn from_parts(min_keycode: u8, keysyms_per_keycode: u8, keysyms: Vec<u32>) -> Self {
        Self {
            min_keycode,
            keysyms_per_keycode,
            keysyms,
        }
    }

    fn row(&self, keycode: u8) -> Option<&[u32]> {
        if keycode < self.min_keycode {
            return None;
        }
        let per = self.keysyms_per_keycode as usize;
        let start = (keycode - self.min_keycode) as usize * per;
        self.keysyms.get(start..start + per)
    }

    /// Unshifted keysym bound to a keycode.
    pub fn keysym_for(&self, code: DeviceKeyCode) -> Option<KeySymbol> {
        match self.row(code.x11())?.first() {
            Some(&sym) if sym != 0 => Some(KeySymbol(sym)),
            _ => None,
        }
    }

    /// Find the keycode producing a keysym, along with whether the Shift
    /// level is required to reach it. Only the first two columns (plain and
    /// shifted) take part, matching what a physical press can produce.
    pub fn keycode_for(&self, keysym: KeySymbol) -> Option<(DeviceKeyCode, bool)> {
        let per = self.keysyms_per_keycode as usize;
        for (i, row) in self.keysyms.chunks(per).enumerate() {
            for (column, &sym) in row.iter().take(2).enumerate() {
                if sym == keysym.0 && sym != 0 {
                    let code = self.min_keycode as u16 + i as u16;
                    return Some((DeviceKeyCode(code), column == 1));
                }
            }
        }
        None
    }

    /// Keycode for a keysym, ignoring the shift level.
    pub fn plain_keycode_for(&self, keysym: KeySymbol) -> Option<DeviceKeyCode> {
        self.keycode_for(keysym).map(|(code, _)| code)
    }
}

/// Immutable name lookup for keysyms, built once and shared by reference.
///
/// Unknown inputs resolve to best-effort fallbacks rather than failing:
/// unnamed keysyms format as hex, unparseable names yield `None` and
/// callers tolerate it.
pub struct KeyResolver {
    keysym_to_name: HashMap<u32, String>,
    name_to_keysym: HashMap<String, u32>,
}

impl KeyResolver {
    pub fn new() -> Self {
        let mut keysym_to_name = HashMap::new();
        let mut name_to_keysym = HashMap::new();

        let mut insert = |sym: u32, name: &str| {
            keysym_to_name.insert(sym, name.to_string());
            name_to_keysym.insert(name.to_ascii_lowercase(), sym);
        };

        for (sym, name) in SPECIAL_KEYS {
            insert(*sym, name);
        }

        // Letters display uppercase but resolve to lowercase keysyms.
        for i in 0..26u32 {
            let sym = crate::key::keysyms::A_LOWER + i;
            let name = char::from(b'A' + i as u8).to_string();
            insert(sym, &name);
        }

        for i in 0..10u32 {
            let sym = crate::key::keysyms::DIGIT_0 + i;
            insert(sym, &i.to_string());
        }

        Self {
            keysym_to_name,
            name_to_keysym,
        }
    }

    /// Human-readable name for a keysym. Falls back to the printable
    /// character, then a hex literal; never fails.
    pub fn keysym_to_name(&self, keysym: KeySymbol) -> String {
        if let Some(name) = self.keysym_to_name.get(&keysym.0) {
            return name.clone();
        }
        if let Some(ch) = keysym.to_char() {
            return ch.to_string();
        }
        format!("0x{:04x}", keysym.0)
    }

    /// Resolve a name back to a keysym. Accepts table names
    /// (case-insensitive), single printable characters, and the hex
    /// fallback form produced by [`KeyResolver::keysym_to_name`].
    pub fn name_to_keysym(&self, name: &str) -> Option<KeySymbol> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(&sym) = self.name_to_keysym.get(&trimmed.to_ascii_lowercase()) {
            return Some(KeySymbol(sym));
        }
        let mut chars = trimmed.chars();
        if let (Some(ch), None) = (chars.next(), chars.next()) {
            if let Some(sym) = char_to_keysym(ch) {
                return Some(sym);
            }
        }
        if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
            if let Ok(value) = u32::from_str_radix(hex, 16) {
                return Some(KeySymbol(value));
            }
        }
        None
    }

    /// Format a combination like `Ctrl+Shift+A`.
    pub fn describe_combo(&self, keysym: KeySymbol, modifiers: ModifierMask) -> String {
        let mut parts: Vec<String> = modifiers.names().map(str::to_string).collect();
        parts.push(self.keysym_to_name(keysym));
        parts.join("+")
    }

    /// Parse a combination string like `Ctrl+Shift+A`.
    ///
    /// Modifier words may appear in any order; the remaining part is the
    /// key. Returns `None` when no key part resolves.
    pub fn parse_combo(&self, combo: &str) -> Option<(KeySymbol, ModifierMask)> {
        let mut modifiers = ModifierMask::NONE;
        let mut key_part = None;

        for part in combo.trim().split('+') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some(mask) = ModifierMask::from_name(part) {
                modifiers |= mask;
            } else {
                key_part = Some(part);
            }
        }

        let keysym = self.name_to_keysym(key_part?)?;
        Some((keysym, modifiers))
    }
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new()
    }
}
