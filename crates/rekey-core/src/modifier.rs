// Rekey Modifier Mask
// Bit set over {Shift, Control, Alt, Super} in X11 modifier-mask layout

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Bit set of held modifier keys, stored in X11 modifier-mask layout so the
/// value can be passed straight to display-server grab requests.
///
/// Lock bits (CapsLock, NumLock) can appear in raw event state but are not
/// semantically meaningful to remapping; [`ModifierMask::clean`] strips them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModifierMask(pub u16);

impl ModifierMask {
    pub const NONE: ModifierMask = ModifierMask(0);
    pub const SHIFT: ModifierMask = ModifierMask(1 << 0);
    pub const LOCK: ModifierMask = ModifierMask(1 << 1);
    pub const CONTROL: ModifierMask = ModifierMask(1 << 2);
    /// Mod1 in X11 terms.
    pub const ALT: ModifierMask = ModifierMask(1 << 3);
    /// Mod2 in X11 terms.
    pub const NUM_LOCK: ModifierMask = ModifierMask(1 << 4);
    /// Mod4 in X11 terms.
    pub const SUPER: ModifierMask = ModifierMask(1 << 6);

    /// Name table in display order (matches combo formatting).
    const NAMES: &'static [(ModifierMask, &'static str)] = &[
        (ModifierMask::CONTROL, "Ctrl"),
        (ModifierMask::ALT, "Alt"),
        (ModifierMask::SHIFT, "Shift"),
        (ModifierMask::SUPER, "Super"),
    ];

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Self {
        ModifierMask(bits)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ModifierMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Strip lock-key bits; grabs match on clean masks only.
    pub fn clean(self) -> ModifierMask {
        ModifierMask(self.0 & !(Self::LOCK.0 | Self::NUM_LOCK.0))
    }

    /// Names of the set remapping-relevant modifiers, in display order.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .iter()
            .filter(move |(mask, _)| self.contains(*mask))
            .map(|(_, name)| *name)
    }

    /// Parse a single modifier word (case-insensitive). `None` for non-modifiers.
    pub fn from_name(name: &str) -> Option<ModifierMask> {
        let lower = name.trim().to_ascii_lowercase();
        Self::NAMES
            .iter()
            .find(|(_, n)| n.to_ascii_lowercase() == lower)
            .map(|(mask, _)| *mask)
    }
}

impl BitOr for ModifierMask {
    type Output = ModifierMask;

    fn bitor(self, rhs: ModifierMask) -> ModifierMask {
        ModifierMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for ModifierMask {
    fn bitor_assign(&mut self, rhs: ModifierMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ModifierMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for name in self.names() {
            if !first {
                write!(f, "+")?;
            }
            write!(f, "{}", name)?;
            first = false;
        }
        Ok(())
    }
}
