// Rekey Device-Level Hook
// evdev interception with transparent uinput mirroring, XTEST simulation

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, Device, EventType, InputEvent, Key};
use parking_lot::Mutex;

use super::xtest;
use super::{
    offer_intercept, Dispatcher, GrabCallback, GrabEntry, GrabTable, HookError, HookResult,
    HookState, Intercept, KeyHook, ReaderHandle, POLL_INTERVAL_MS, START_TIMEOUT,
};
use crate::key::KeySymbol;
use crate::modifier::ModifierMask;
use crate::resolver::{DeviceKeyCode, LayoutTable};

/// Name prefix of the mirror device; devices carrying it are never grabbed
/// (grabbing our own output would feed events back into the reader).
const VIRT_DEVICE_NAME: &str = "Rekey (virtual) Keyboard";
const VIRT_DEVICE_PREFIX: &str = "Rekey (virtual)";

// QWERTY row plus representative letter/space codes; a device carrying all
// of them is treated as a keyboard.
const QWERTY_CODES: &[u16] = &[16, 17, 18, 19, 20, 21];
const A_Z_SPACE_CODES: &[u16] = &[57, 30, 44];

/// Device-level interception backend.
///
/// Exclusively grabs every physical keyboard, mirrors all non-matching
/// events to a synthetic uinput device, and drops key-downs that match an
/// active grab. Works beneath any compositor but needs raw-device
/// permission. Simulation goes through a dedicated X11 connection owned by
/// the reader thread.
pub struct EvdevHook {
    state: Mutex<HookState>,
    grabs: Arc<GrabTable>,
    dispatcher: Dispatcher,
    layout: Mutex<Option<Arc<LayoutTable>>>,
    cmd_tx: Mutex<Option<Sender<SimulateCmd>>>,
    worker: Mutex<Option<ReaderHandle>>,
}

#[derive(Debug, Clone, Copy)]
struct SimulateCmd {
    keysym: KeySymbol,
    modifiers: ModifierMask,
}

impl EvdevHook {
    pub fn new() -> Self {
        let grabs = Arc::new(GrabTable::new());
        let dispatcher = Dispatcher::new(Arc::clone(&grabs));
        Self {
            state: Mutex::new(HookState::Stopped),
            grabs,
            dispatcher,
            layout: Mutex::new(None),
            cmd_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// List the evdev paths of real keyboard devices.
    pub fn discover_keyboards() -> Vec<PathBuf> {
        let mut keyboards = Vec::new();
        for (path, device) in evdev::enumerate() {
            if is_keyboard_device(&device) {
                keyboards.push(path);
            }
        }
        keyboards
    }

    /// Like `discover_keyboards`, with device names for display.
    pub fn list_keyboards() -> Vec<(PathBuf, String)> {
        let mut keyboards = Vec::new();
        for (path, device) in evdev::enumerate() {
            if is_keyboard_device(&device) {
                let name = device.name().unwrap_or("(unnamed)").to_string();
                keyboards.push((path, name));
            }
        }
        keyboards
    }

    fn resolve_code(&self, keysym: KeySymbol) -> HookResult<DeviceKeyCode> {
        let layout = self
            .layout
            .lock()
            .clone()
            .ok_or(HookError::NotRunning)?;
        layout
            .plain_keycode_for(keysym)
            .ok_or(HookError::NoKeycode(keysym))
    }
}

impl Default for EvdevHook {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyHook for EvdevHook {
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

        if let Some(worker) = self.worker.lock().take() {
            worker.shutdown_and_join();
        }

        self.grabs.clear();
        *self.layout.lock() = None;
        *self.cmd_tx.lock() = None;
        log::info!("EvdevHook stopped");
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
        self.grabs
            .insert(code, modifiers.clean(), GrabEntry { keysym, callback })?;
        log::info!(
            "Grabbed evdev code {} (keysym {})",
            code.evdev(),
            keysym
        );
        Ok(())
    }

    fn ungrab(&self, keysym: KeySymbol, modifiers: ModifierMask) {
        let Ok(code) = self.resolve_code(keysym) else {
            return;
        };
        if self.grabs.remove(code, modifiers.clean()) {
            log::info!("Ungrabbed evdev code {}", code.evdev());
        }
    }

    fn simulate(&self, keysym: KeySymbol, modifiers: ModifierMask) -> HookResult<()> {
        if *self.state.lock() != HookState::Running {
            return Err(HookError::NotRunning);
        }
        // Resolve eagerly so an unknown keysym rejects the operation instead
        // of dying silently in the reader thread.
        let layout = self.layout.lock().clone().ok_or(HookError::NotRunning)?;
        if layout.keycode_for(keysym).is_none() {
            return Err(HookError::NoKeycode(keysym));
        }
        if let Some(tx) = self.cmd_tx.lock().as_ref() {
            let _ = tx.send(SimulateCmd { keysym, modifiers });
        }
        Ok(())
    }

    fn dispatch_pending(&self, wait: Duration) -> usize {
        self.dispatcher.dispatch_pending(wait)
    }

    fn layout(&self) -> Option<Arc<LayoutTable>> {
        self.layout.lock().clone()
    }
}

impl EvdevHook {
    fn start_inner(&self) -> HookResult<()> {
        let paths = Self::discover_keyboards();
        if paths.is_empty() {
            return Err(HookError::ResourceUnavailable(
                "No keyboard devices found in /dev/input".to_string(),
            ));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let ctx = ReaderCtx {
            paths,
            grabs: Arc::clone(&self.grabs),
            intercept_tx: self.dispatcher.sender(),
            cmd_rx,
            ready_tx,
            done_tx,
            shutdown: Arc::clone(&shutdown),
        };
        let handle = std::thread::Builder::new()
            .name("rekey-evdev".to_string())
            .spawn(move || reader_main(ctx))?;

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(layout)) => {
                *self.layout.lock() = Some(layout);
                *self.cmd_tx.lock() = Some(cmd_tx);
                *self.worker.lock() = Some(ReaderHandle {
                    handle,
                    shutdown,
                    done_rx,
                });
                *self.state.lock() = HookState::Running;
                log::info!("EvdevHook started (evdev + XTEST)");
                Ok(())
            }
            Ok(Err(e)) => {
                // The thread exits right after reporting a setup failure.
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                shutdown.store(true, Ordering::SeqCst);
                Err(HookError::StartTimeout(START_TIMEOUT))
            }
        }
    }
}

impl Drop for EvdevHook {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the reader thread needs, moved in at spawn.
struct ReaderCtx {
    paths: Vec<PathBuf>,
    grabs: Arc<GrabTable>,
    intercept_tx: Sender<Intercept>,
    cmd_rx: Receiver<SimulateCmd>,
    ready_tx: Sender<HookResult<Arc<LayoutTable>>>,
    done_tx: Sender<()>,
    shutdown: Arc<AtomicBool>,
}

/// Grabbed devices with a Drop guarantee: if the reader panics or exits,
/// every device is ungrabbed so the keyboard never stays wedged.
struct GrabbedDevices {
    devices: Vec<Device>,
}

impl GrabbedDevices {
    fn open(paths: &[PathBuf]) -> Self {
        let mut devices = Vec::new();
        for path in paths {
            match Device::open(path) {
                Ok(mut device) => {
                    // Clear any stale grab left by a crashed instance first.
                    let _ = device.ungrab();
                    match device.grab() {
                        Ok(()) => {
                            log::info!(
                                "Grabbed device: {} ({})",
                                device.name().unwrap_or("Unknown"),
                                path.display()
                            );
                            devices.push(device);
                        }
                        Err(e) => log::warn!("Cannot grab {}: {}", path.display(), e),
                    }
                }
                Err(e) => log::warn!("Cannot open {}: {}", path.display(), e),
            }
        }
        Self { devices }
    }

    fn poll_fds(&self) -> Vec<libc::pollfd> {
        use std::os::unix::io::AsRawFd;
        self.devices
            .iter()
            .map(|d| libc::pollfd {
                fd: d.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect()
    }

    fn drop_device(&mut self, index: usize) {
        let mut device = self.devices.remove(index);
        let _ = device.ungrab();
    }
}

impl Drop for GrabbedDevices {
    fn drop(&mut self) {
        for device in &mut self.devices {
            let _ = device.ungrab();
        }
    }
}

fn reader_main(ctx: ReaderCtx) {
    let setup = || -> HookResult<(x11rb::rust_connection::RustConnection, u32, Arc<LayoutTable>, GrabbedDevices, VirtualDevice)> {
        let (conn, root) = xtest::connect()?;
        xtest::check_xtest(&conn)?;
        let layout = Arc::new(xtest::fetch_layout(&conn)?);

        let devices = GrabbedDevices::open(&ctx.paths);
        if devices.devices.is_empty() {
            return Err(HookError::ResourceUnavailable(
                "Could not grab any keyboard device".to_string(),
            ));
        }

        let mirror = build_mirror_device(&devices.devices[0])?;
        Ok((conn, root, layout, devices, mirror))
    };

    let (conn, root, layout, mut devices, mut mirror) = match setup() {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ctx.ready_tx.send(Err(e));
            let _ = ctx.done_tx.send(());
            return;
        }
    };

    let _ = ctx.ready_tx.send(Ok(Arc::clone(&layout)));

    let mut held = ModifierMask::NONE;
    let mut poll_fds = devices.poll_fds();

    while !ctx.shutdown.load(Ordering::SeqCst) {
        // Simulation requests are drained once per iteration; a queued
        // request is never cancelled.
        while let Ok(cmd) = ctx.cmd_rx.try_recv() {
            match xtest::simulate_sequence(&layout, cmd.keysym, cmd.modifiers) {
                Ok(steps) => {
                    if let Err(e) = xtest::run_sequence(&conn, root, &steps) {
                        log::warn!("XTEST simulation failed: {}", e);
                    }
                }
                Err(e) => log::warn!("Cannot simulate {}: {}", cmd.keysym, e),
            }
        }

        if poll_fds.is_empty() {
            // All devices are gone; keep draining simulate requests so the
            // hook stays useful until the session restarts it.
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            continue;
        }

        let rc = unsafe {
            libc::poll(
                poll_fds.as_mut_ptr(),
                poll_fds.len() as libc::nfds_t,
                POLL_INTERVAL_MS as i32,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            log::error!("poll() failed: {}", err);
            break;
        }
        if rc == 0 {
            continue;
        }

        let mut lost = Vec::new();
        for (i, pfd) in poll_fds.iter().enumerate() {
            if pfd.revents & libc::POLLIN == 0 {
                continue;
            }
            let device = &mut devices.devices[i];
            let device_name = device.name().unwrap_or("Unknown").to_string();
            match device.fetch_events() {
                Ok(events) => {
                    for event in events {
                        held = track_modifiers(held, &event);
                        if should_intercept(&ctx.grabs, &event, held) {
                            offer_intercept(
                                &ctx.intercept_tx,
                                Intercept {
                                    code: DeviceKeyCode::from_evdev(event.code()),
                                    modifiers: held.clean(),
                                },
                            );
                        } else {
                            mirror_event(&mut mirror, event);
                        }
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Lost device {}: {}",
                        device_name,
                        e
                    );
                    lost.push(i);
                }
            }
        }

        if !lost.is_empty() {
            for &i in lost.iter().rev() {
                devices.drop_device(i);
            }
            poll_fds = devices.poll_fds();
        }
    }

    // Devices ungrab via Drop; the mirror device closes with the thread.
    drop(mirror);
    drop(devices);
    drop(conn);
    let _ = ctx.done_tx.send(());
    log::debug!("Reader thread exited");
}

/// Create the synthetic output device, mirroring the key capabilities of a
/// real source device so downstream consumers see an equivalent keyboard.
fn build_mirror_device(source: &Device) -> HookResult<VirtualDevice> {
    let mut keys = AttributeSet::<Key>::new();
    match source.supported_keys() {
        Some(supported) => {
            for key in supported.iter() {
                keys.insert(key);
            }
        }
        None => {
            for code in 0..0x2FF_u16 {
                keys.insert(Key::new(code));
            }
        }
    }

    let device = VirtualDeviceBuilder::new()?
        .name(VIRT_DEVICE_NAME)
        .with_keys(&keys)?
        .build()?;
    Ok(device)
}

/// Forward one event verbatim; key events get a SYN report so the kernel
/// flushes them immediately.
fn mirror_event(mirror: &mut VirtualDevice, event: InputEvent) {
    let result = if event.event_type() == EventType::KEY {
        let syn = InputEvent::new(EventType::SYNCHRONIZATION, 0, 0);
        mirror.emit(&[event, syn])
    } else {
        mirror.emit(&[event])
    };
    if let Err(e) = result {
        log::warn!("Mirror write failed: {}", e);
    }
}

/// Only a key-down that matches an active grab is intercepted; releases and
/// repeats of grabbed keys mirror through like everything else.
fn should_intercept(grabs: &GrabTable, event: &InputEvent, held: ModifierMask) -> bool {
    event.event_type() == EventType::KEY
        && event.value() == 1
        && grabs.contains(DeviceKeyCode::from_evdev(event.code()), held.clean())
}

/// Update the held-modifier mask from a raw key event. evdev events carry
/// no modifier state, so the reader reconstructs it from the stream.
fn track_modifiers(held: ModifierMask, event: &InputEvent) -> ModifierMask {
    if event.event_type() != EventType::KEY {
        return held;
    }
    let Some(bit) = modifier_bit(event.code()) else {
        return held;
    };
    match event.value() {
        1 => ModifierMask(held.0 | bit.0),
        0 => ModifierMask(held.0 & !bit.0),
        _ => held,
    }
}

fn modifier_bit(evdev_code: u16) -> Option<ModifierMask> {
    match evdev_code {
        42 | 54 => Some(ModifierMask::SHIFT),     // shifts
        29 | 97 => Some(ModifierMask::CONTROL),   // ctrls
        56 | 100 => Some(ModifierMask::ALT),      // alts
        125 | 126 => Some(ModifierMask::SUPER),   // supers
        _ => None,
    }
}

fn is_keyboard_device(device: &Device) -> bool {
    if !device.supported_events().contains(EventType::KEY) {
        return false;
    }
    if device
        .name()
        .is_some_and(|name| name.contains(VIRT_DEVICE_PREFIX))
    {
        return false;
    }
    let Some(keys) = device.supported_keys() else {
        return false;
    };
    let qwerty = QWERTY_CODES.iter().all(|&c| keys.contains(Key::new(c)));
    let az_space = A_Z_SPACE_CODES.iter().all(|&c| keys.contains(Key::new(c)));
    qwerty && az_space
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key_event(code: u16, value: i32) -> InputEvent {
        InputEvent::new(EventType::KEY, code, value)
    }

    #[test]
    fn test_track_modifiers_press_release() {
        let mut held = ModifierMask::NONE;
        held = track_modifiers(held, &key_event(42, 1)); // Shift down
        assert_eq!(held, ModifierMask::SHIFT);
        held = track_modifiers(held, &key_event(29, 1)); // Ctrl down
        assert_eq!(held, ModifierMask::SHIFT | ModifierMask::CONTROL);
        held = track_modifiers(held, &key_event(42, 0)); // Shift up
        assert_eq!(held, ModifierMask::CONTROL);
    }

    #[test]
    fn test_track_modifiers_ignores_repeat_and_plain_keys() {
        let held = ModifierMask::SHIFT;
        assert_eq!(held, track_modifiers(held, &key_event(42, 2)));
        assert_eq!(held, track_modifiers(held, &key_event(30, 1)));
    }

    #[test]
    fn test_should_intercept_only_matching_key_down() {
        let grabs = GrabTable::new();
        grabs
            .insert(
                DeviceKeyCode::from_evdev(183), // F13
                ModifierMask::NONE,
                GrabEntry {
                    keysym: KeySymbol(0xFFCA),
                    callback: Arc::new(|_, _| {}),
                },
            )
            .unwrap();

        // Matching key-down is intercepted.
        assert!(should_intercept(&grabs, &key_event(183, 1), ModifierMask::NONE));
        // Release and repeat of the grabbed key mirror through.
        assert!(!should_intercept(&grabs, &key_event(183, 0), ModifierMask::NONE));
        assert!(!should_intercept(&grabs, &key_event(183, 2), ModifierMask::NONE));
        // Other keys mirror through.
        assert!(!should_intercept(&grabs, &key_event(30, 1), ModifierMask::NONE));
        // Held modifiers change the match key.
        assert!(!should_intercept(&grabs, &key_event(183, 1), ModifierMask::SHIFT));
    }

    #[test]
    fn test_should_intercept_with_modifier_grab() {
        let grabs = GrabTable::new();
        grabs
            .insert(
                DeviceKeyCode::from_evdev(30),
                ModifierMask::CONTROL,
                GrabEntry {
                    keysym: KeySymbol(0x61),
                    callback: Arc::new(|_, _| {}),
                },
            )
            .unwrap();

        assert!(should_intercept(&grabs, &key_event(30, 1), ModifierMask::CONTROL));
        // Lock bits in the held mask never affect matching.
        assert!(should_intercept(
            &grabs,
            &key_event(30, 1),
            ModifierMask::CONTROL | ModifierMask::NUM_LOCK
        ));
        assert!(!should_intercept(&grabs, &key_event(30, 1), ModifierMask::NONE));
    }

    #[test]
    fn test_modifier_bit_table() {
        assert_eq!(modifier_bit(54), Some(ModifierMask::SHIFT));
        assert_eq!(modifier_bit(97), Some(ModifierMask::CONTROL));
        assert_eq!(modifier_bit(100), Some(ModifierMask::ALT));
        assert_eq!(modifier_bit(125), Some(ModifierMask::SUPER));
        assert_eq!(modifier_bit(58), None); // CapsLock is not a held modifier
        assert_eq!(modifier_bit(30), None);
    }

    #[test]
    fn test_lifecycle_without_devices() {
        // In most CI sandboxes there are no grabable keyboards; start()
        // must fail cleanly and leave the hook stopped either way.
        let hook = EvdevHook::new();
        assert_eq!(hook.state(), HookState::Stopped);
        match hook.start() {
            Ok(()) => hook.stop(),
            Err(_) => assert_eq!(hook.state(), HookState::Stopped),
        }
        // stop() is idempotent.
        hook.stop();
        hook.stop();
        assert_eq!(hook.state(), HookState::Stopped);
    }

    #[test]
    fn test_grab_fails_when_stopped() {
        let hook = EvdevHook::new();
        let err = hook.grab(KeySymbol(0xFFCA), ModifierMask::NONE, Arc::new(|_, _| {}));
        assert!(matches!(err, Err(HookError::NotRunning)));
        // ungrab on a stopped hook is a silent no-op.
        hook.ungrab(KeySymbol(0xFFCA), ModifierMask::NONE);
    }
}
