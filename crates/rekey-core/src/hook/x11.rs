// Rekey Display-Server Hook
// Exclusive key grabs routed by the display server, XTEST simulation

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use x11rb::connection::Connection;
use x11rb::errors::ReplyError;
use x11rb::protocol::xproto::{ConnectionExt as _, GrabMode, ModMask, Window};
use x11rb::protocol::{ErrorKind, Event};
use x11rb::rust_connection::RustConnection;

use super::xtest;
use super::{
    offer_intercept, Dispatcher, GrabCallback, GrabEntry, GrabTable, HookError, HookResult,
    HookState, Intercept, KeyHook, ReaderHandle, POLL_INTERVAL_MS,
};
use crate::key::KeySymbol;
use crate::modifier::ModifierMask;
use crate::resolver::{DeviceKeyCode, LayoutTable};

/// Lock-state combinations a grab is registered under. CapsLock and
/// NumLock are not semantically meaningful to remapping, so each grab
/// claims all four.
const LOCK_VARIANTS: [u16; 4] = [
    0,
    ModifierMask::LOCK.0,
    ModifierMask::NUM_LOCK.0,
    ModifierMask::LOCK.0 | ModifierMask::NUM_LOCK.0,
];

/// Display-server grab backend.
///
/// Asks the server to route only the grabbed combinations to this process;
/// all other keys are delivered normally system-wide. Needs no device
/// permissions, but a combination owned by another client is refused.
///
/// Two connections: the primary serves grab-time layout lookups and
/// synchronous XTEST simulation on the control context; a dedicated second
/// connection is owned by the background read loop so grab/ungrab
/// bookkeeping is never serialized behind event waits.
pub struct X11GrabHook {
    state: Mutex<HookState>,
    grabs: Arc<GrabTable>,
    dispatcher: Dispatcher,
    layout: Mutex<Option<Arc<LayoutTable>>>,
    primary: Mutex<Option<DisplayConn>>,
    events: Mutex<Option<Arc<DisplayConn>>>,
    worker: Mutex<Option<ReaderHandle>>,
}

struct DisplayConn {
    conn: RustConnection,
    root: Window,
}

impl X11GrabHook {
    pub fn new() -> Self {
        let grabs = Arc::new(GrabTable::new());
        let dispatcher = Dispatcher::new(Arc::clone(&grabs));
        Self {
            state: Mutex::new(HookState::Stopped),
            grabs,
            dispatcher,
            layout: Mutex::new(None),
            primary: Mutex::new(None),
            events: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    fn resolve_code(&self, keysym: KeySymbol) -> HookResult<DeviceKeyCode> {
        let layout = self.layout.lock().clone().ok_or(HookError::NotRunning)?;
        layout
            .plain_keycode_for(keysym)
            .ok_or(HookError::NoKeycode(keysym))
    }

    /// Register the server-side grabs for one combination, rolling back on
    /// conflict so no partial set of lock variants is left claimed.
    fn server_grab(
        display: &DisplayConn,
        code: DeviceKeyCode,
        clean: ModifierMask,
    ) -> HookResult<()> {
        let mut granted = Vec::new();
        for variant in LOCK_VARIANTS {
            let mods = ModMask::from(clean.bits() | variant);
            let result = display
                .conn
                .grab_key(
                    false,
                    display.root,
                    mods,
                    code.x11(),
                    GrabMode::ASYNC,
                    GrabMode::ASYNC,
                )
                .map_err(|e| HookError::X11(e.to_string()))
                .and_then(|cookie| match cookie.check() {
                    Ok(()) => Ok(()),
                    Err(ReplyError::X11Error(ref e))
                        if e.error_kind == ErrorKind::Access =>
                    {
                        Err(HookError::GrabConflict)
                    }
                    Err(e) => Err(HookError::X11(e.to_string())),
                });
            match result {
                Ok(()) => granted.push(variant),
                Err(e) => {
                    for variant in granted {
                        let mods = ModMask::from(clean.bits() | variant);
                        let _ = display.conn.ungrab_key(code.x11(), display.root, mods);
                    }
                    let _ = display.conn.flush();
                    return Err(e);
                }
            }
        }
        display
            .conn
            .flush()
            .map_err(|e| HookError::X11(e.to_string()))?;
        Ok(())
    }

    fn server_ungrab(display: &DisplayConn, code: DeviceKeyCode, clean: ModifierMask) {
        for variant in LOCK_VARIANTS {
            let mods = ModMask::from(clean.bits() | variant);
            let _ = display.conn.ungrab_key(code.x11(), display.root, mods);
        }
        let _ = display.conn.flush();
    }
}

impl Default for X11GrabHook {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyHook for X11GrabHook {
    fn start(&self) -> HookResult<()> {
        {
            let mut state = self.state.lock();
            if *state != HookState::Stopped {
                return Err(HookError::AlreadyRunning);
            }
            *state = HookState::Starting;
        }

        let result = self.start_inner();
        if result.is_err() {
            *self.state.lock() = HookState::Stopped;
        }
        result
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == HookState::Stopped {
                return;
            }
            *state = HookState::Stopped;
        }

        // Release server-side claims before tearing down the connection.
        if let Some(events) = self.events.lock().as_ref() {
            for (code, clean) in self.grabs.drain_keys() {
                Self::server_ungrab(events, code, clean);
            }
        }

        if let Some(worker) = self.worker.lock().take() {
            worker.shutdown_and_join();
        }

        self.grabs.clear();
        *self.layout.lock() = None;
        *self.primary.lock() = None;
        *self.events.lock() = None;
        log::info!("X11GrabHook stopped");
    }

    fn state(&self) -> HookState {
        *self.state.lock()
    }

    fn grab(
        &self,
        keysym: KeySymbol,
        modifiers: ModifierMask,
        callback: GrabCallback,
    ) -> HookResult<()> {
        if *self.state.lock() != HookState::Running {
            return Err(HookError::NotRunning);
        }
        let code = self.resolve_code(keysym)?;
        let clean = modifiers.clean();
        if self.grabs.contains(code, clean) {
            return Err(HookError::AlreadyGrabbed);
        }

        {
            let events = self.events.lock();
            let display = events.as_ref().ok_or(HookError::NotRunning)?;
            Self::server_grab(display, code, clean)?;
        }

        self.grabs.insert(code, clean, GrabEntry { keysym, callback })?;
        log::info!("Grabbed keycode {} (keysym {})", code.x11(), keysym);
        Ok(())
    }

    fn ungrab(&self, keysym: KeySymbol, modifiers: ModifierMask) {
        let Ok(code) = self.resolve_code(keysym) else {
            return;
        };
        let clean = modifiers.clean();
        if !self.grabs.remove(code, clean) {
            return;
        }
        if let Some(display) = self.events.lock().as_ref() {
            Self::server_ungrab(display, code, clean);
        }
        log::info!("Ungrabbed keycode {}", code.x11());
    }

    /// Synchronous on the control context's own connection; crosses no
    /// thread boundary.
    fn simulate(&self, keysym: KeySymbol, modifiers: ModifierMask) -> HookResult<()> {
        if *self.state.lock() != HookState::Running {
            return Err(HookError::NotRunning);
        }
        let layout = self.layout.lock().clone().ok_or(HookError::NotRunning)?;
        let steps = xtest::simulate_sequence(&layout, keysym, modifiers)?;
        let primary = self.primary.lock();
        let display = primary.as_ref().ok_or(HookError::NotRunning)?;
        xtest::run_sequence(&display.conn, display.root, &steps)
    }

    fn dispatch_pending(&self, wait: Duration) -> usize {
        self.dispatcher.dispatch_pending(wait)
    }

    fn layout(&self) -> Option<Arc<LayoutTable>> {
        self.layout.lock().clone()
    }
}

impl X11GrabHook {
    fn start_inner(&self) -> HookResult<()> {
        let (conn, root) = xtest::connect()?;
        xtest::check_xtest(&conn)?;
        let layout = Arc::new(xtest::fetch_layout(&conn)?);

        let (event_conn, event_root) = xtest::connect()?;
        let events = Arc::new(DisplayConn {
            conn: event_conn,
            root: event_root,
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let reader_events = Arc::clone(&events);
        let intercept_tx = self.dispatcher.sender();
        let reader_shutdown = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("rekey-x11".to_string())
            .spawn(move || {
                reader_main(reader_events, intercept_tx, reader_shutdown);
                let _ = done_tx.send(());
            })?;

        *self.layout.lock() = Some(layout);
        *self.primary.lock() = Some(DisplayConn { conn, root });
        *self.events.lock() = Some(events);
        *self.worker.lock() = Some(ReaderHandle {
            handle,
            shutdown,
            done_rx,
        });
        *self.state.lock() = HookState::Running;
        log::info!("X11GrabHook started (XGrabKey + XTEST)");
        Ok(())
    }
}

impl Drop for X11GrabHook {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_main(
    events: Arc<DisplayConn>,
    intercept_tx: crossbeam_channel::Sender<Intercept>,
    shutdown: Arc<AtomicBool>,
) {
    // Autorepeat reaches a grabbing client as release/press pairs sharing
    // one timestamp; remembering the last release filters the synthetic
    // presses out.
    let mut last_release: Option<(u8, u32)> = None;
    let mut pressed: HashSet<u8> = HashSet::new();

    while !shutdown.load(Ordering::SeqCst) {
        match events.conn.poll_for_event() {
            Ok(Some(Event::KeyPress(ev))) => {
                let repeat =
                    last_release == Some((ev.detail, ev.time)) || pressed.contains(&ev.detail);
                last_release = None;
                if repeat {
                    continue;
                }
                pressed.insert(ev.detail);
                let mask = ModifierMask::from_bits(u16::from(ev.state)).clean();
                offer_intercept(
                    &intercept_tx,
                    Intercept {
                        code: DeviceKeyCode::from_x11(ev.detail),
                        modifiers: mask,
                    },
                );
            }
            Ok(Some(Event::KeyRelease(ev))) => {
                pressed.remove(&ev.detail);
                last_release = Some((ev.detail, ev.time));
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
            Err(e) => {
                log::error!("Event connection lost: {}", e);
                break;
            }
        }
    }
    log::debug!("Reader thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_variants_cover_all_combinations() {
        let set: HashSet<u16> = LOCK_VARIANTS.iter().copied().collect();
        assert_eq!(set.len(), 4);
        assert!(set.contains(&0));
        assert!(set.contains(&(ModifierMask::LOCK.0 | ModifierMask::NUM_LOCK.0)));
    }

    #[test]
    fn test_grab_fails_when_stopped() {
        let hook = X11GrabHook::new();
        let err = hook.grab(
            KeySymbol(0xFFCA),
            ModifierMask::NONE,
            Arc::new(|_, _| {}),
        );
        assert!(matches!(err, Err(HookError::NotRunning)));
        assert!(matches!(
            hook.simulate(KeySymbol(0x61), ModifierMask::NONE),
            Err(HookError::NotRunning)
        ));
    }

    #[test]
    fn test_stop_is_idempotent_when_never_started() {
        let hook = X11GrabHook::new();
        hook.stop();
        hook.stop();
        assert_eq!(hook.state(), HookState::Stopped);
    }

    #[test]
    fn test_start_without_display_reports_unavailable() {
        // Only meaningful where no X server is reachable; when one is,
        // exercise the full lifecycle instead.
        let hook = X11GrabHook::new();
        match hook.start() {
            Ok(()) => {
                assert_eq!(hook.state(), HookState::Running);
                assert!(hook.layout().is_some());
                hook.stop();
            }
            Err(_) => {
                assert_eq!(hook.state(), HookState::Stopped);
                assert!(hook.layout().is_none());
            }
        }
    }
}
