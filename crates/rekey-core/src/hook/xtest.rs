// Rekey X11 Helpers
// Connection setup, layout snapshot, and XTEST key synthesis

use x11rb::connection::Connection;
use x11rb::protocol::xproto::{self, ConnectionExt as _, Window};
use x11rb::protocol::xtest::ConnectionExt as _;
use x11rb::rust_connection::RustConnection;

use super::{HookError, HookResult};
use crate::key::{keysyms, KeySymbol};
use crate::modifier::ModifierMask;
use crate::resolver::{DeviceKeyCode, LayoutTable};

/// Open a display connection and return it with the default screen's root.
pub(crate) fn connect() -> HookResult<(RustConnection, Window)> {
    let (conn, screen_num) =
        x11rb::connect(None).map_err(|e| HookError::ResourceUnavailable(e.to_string()))?;
    let root = conn.setup().roots[screen_num].root;
    Ok((conn, root))
}

/// Verify the XTEST extension is present; required for simulation.
pub(crate) fn check_xtest(conn: &RustConnection) -> HookResult<()> {
    conn.xtest_get_version(2, 2)
        .map_err(|e| HookError::ResourceUnavailable(format!("XTEST extension missing: {}", e)))?
        .reply()
        .map_err(|e| HookError::ResourceUnavailable(format!("XTEST extension missing: {}", e)))?;
    Ok(())
}

/// Snapshot the live keyboard mapping into a [`LayoutTable`].
pub(crate) fn fetch_layout(conn: &RustConnection) -> HookResult<LayoutTable> {
    let setup = conn.setup();
    let min = setup.min_keycode;
    let count = setup.max_keycode - min + 1;
    let reply = conn
        .get_keyboard_mapping(min, count)
        .map_err(|e| HookError::X11(e.to_string()))?
        .reply()
        .map_err(|e| HookError::X11(e.to_string()))?;
    Ok(LayoutTable::from_parts(
        min,
        reply.keysyms_per_keycode,
        reply.keysyms,
    ))
}

/// One step of a synthetic key sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeyStep {
    pub code: DeviceKeyCode,
    pub press: bool,
}

/// Compute the full press/release sequence producing `keysym` with
/// `modifiers` under the given layout.
///
/// The layout decides which modifiers are actually needed: a symbol on a
/// shifted level (like `@` on a US layout) adds Shift even when the caller
/// did not request it. Ordering is modifier presses, key press, key
/// release, modifier releases in reverse.
pub(crate) fn simulate_sequence(
    layout: &LayoutTable,
    keysym: KeySymbol,
    modifiers: ModifierMask,
) -> HookResult<Vec<KeyStep>> {
    let (key_code, needs_shift) = layout
        .keycode_for(keysym)
        .ok_or(HookError::NoKeycode(keysym))?;

    let mut combined = modifiers.clean();
    if needs_shift {
        combined |= ModifierMask::SHIFT;
    }

    let mut mod_codes = Vec::new();
    for (mask, mod_keysym) in [
        (ModifierMask::SHIFT, keysyms::SHIFT_L),
        (ModifierMask::CONTROL, keysyms::CONTROL_L),
        (ModifierMask::ALT, keysyms::ALT_L),
        (ModifierMask::SUPER, keysyms::SUPER_L),
    ] {
        if combined.contains(mask) {
            // A layout with no keycode for a modifier simply skips it.
            if let Some(code) = layout.plain_keycode_for(KeySymbol(mod_keysym)) {
                mod_codes.push(code);
            }
        }
    }

    let mut steps = Vec::with_capacity(mod_codes.len() * 2 + 2);
    for &code in &mod_codes {
        steps.push(KeyStep { code, press: true });
    }
    steps.push(KeyStep {
        code: key_code,
        press: true,
    });
    steps.push(KeyStep {
        code: key_code,
        press: false,
    });
    for &code in mod_codes.iter().rev() {
        steps.push(KeyStep { code, press: false });
    }
    Ok(steps)
}

/// Play a key sequence through XTEST and flush.
pub(crate) fn run_sequence(
    conn: &RustConnection,
    root: Window,
    steps: &[KeyStep],
) -> HookResult<()> {
    for step in steps {
        let kind = if step.press {
            xproto::KEY_PRESS_EVENT
        } else {
            xproto::KEY_RELEASE_EVENT
        };
        conn.xtest_fake_input(kind, step.code.x11(), x11rb::CURRENT_TIME, root, 0, 0, 0)
            .map_err(|e| HookError::X11(e.to_string()))?;
    }
    conn.flush().map_err(|e| HookError::X11(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Layout fixture with a US-style number row and left modifiers.
    fn layout() -> LayoutTable {
        let min = 10u8;
        let per = 2u8;
        let mut rows: Vec<[u32; 2]> = vec![[0, 0]; 190];
        rows[0] = [0x31, 0x21]; // keycode 10: 1 !
        rows[1] = [0x32, 0x40]; // keycode 11: 2 @
        rows[2] = [0x33, 0x23]; // keycode 12: 3 #
        rows[28] = [0x61, 0x41]; // keycode 38: a A
        rows[40] = [keysyms::SHIFT_L, 0]; // keycode 50
        rows[27] = [keysyms::CONTROL_L, 0]; // keycode 37
        LayoutTable::from_parts(min, per, rows.into_iter().flatten().collect())
    }

    fn codes(steps: &[KeyStep]) -> Vec<(u8, bool)> {
        steps.iter().map(|s| (s.code.x11(), s.press)).collect()
    }

    #[test]
    fn test_at_sign_adds_shift_under_us_layout() {
        // simulate('@') presses Shift even though it was not requested.
        let steps = simulate_sequence(&layout(), KeySymbol(0x40), ModifierMask::NONE).unwrap();
        assert_eq!(
            codes(&steps),
            vec![(50, true), (11, true), (11, false), (50, false)]
        );
    }

    #[test]
    fn test_plain_key_has_no_modifier_steps() {
        let steps = simulate_sequence(&layout(), KeySymbol(0x32), ModifierMask::NONE).unwrap();
        assert_eq!(codes(&steps), vec![(11, true), (11, false)]);
    }

    #[test]
    fn test_requested_modifiers_wrap_key_in_order() {
        let mods = ModifierMask::CONTROL | ModifierMask::SHIFT;
        let steps = simulate_sequence(&layout(), KeySymbol(0x61), mods).unwrap();
        assert_eq!(
            codes(&steps),
            vec![
                (50, true),  // Shift down
                (37, true),  // Ctrl down
                (38, true),  // a down
                (38, false), // a up
                (37, false), // Ctrl up
                (50, false), // Shift up
            ]
        );
    }

    #[test]
    fn test_shift_not_doubled_when_requested_and_needed() {
        let steps = simulate_sequence(&layout(), KeySymbol(0x40), ModifierMask::SHIFT).unwrap();
        assert_eq!(
            codes(&steps),
            vec![(50, true), (11, true), (11, false), (50, false)]
        );
    }

    #[test]
    fn test_unresolvable_keysym_is_rejected() {
        let err = simulate_sequence(&layout(), KeySymbol(0xFFCA), ModifierMask::NONE);
        assert!(matches!(err, Err(HookError::NoKeycode(_))));
    }

    #[test]
    fn test_lock_bits_do_not_leak_into_sequence() {
        let mods = ModifierMask::LOCK | ModifierMask::NUM_LOCK;
        let steps = simulate_sequence(&layout(), KeySymbol(0x32), mods).unwrap();
        assert_eq!(codes(&steps), vec![(11, true), (11, false)]);
    }
}
