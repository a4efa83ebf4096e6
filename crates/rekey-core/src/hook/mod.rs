// Rekey Key Hook
// Shared contract for the two interception backends

mod evdev;
mod x11;
mod xtest;

pub use self::evdev::EvdevHook;
pub use self::x11::X11GrabHook;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::key::KeySymbol;
use crate::modifier::ModifierMask;
use crate::resolver::{DeviceKeyCode, LayoutTable};

/// Bound on the background→control intercept channel. Key-downs are rare;
/// a full channel means the control context stopped draining and further
/// intercepts are dropped with a warning rather than blocking the reader.
const INTERCEPT_CHANNEL_BOUND: usize = 64;

/// How long `start()` may block the control context.
pub(crate) const START_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `stop()` waits for the reader thread before abandoning it.
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Reader-loop polling interval; trades simulate latency against
/// device-read responsiveness.
pub(crate) const POLL_INTERVAL_MS: u64 = 20;

pub type HookResult<T> = Result<T, HookError>;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook is not running")]
    NotRunning,

    #[error("hook is already running")]
    AlreadyRunning,

    #[error("{0}")]
    ResourceUnavailable(String),

    #[error("no keycode for keysym {0} in the active layout")]
    NoKeycode(KeySymbol),

    #[error("combination already grabbed")]
    AlreadyGrabbed,

    #[error("combination grabbed by another process")]
    GrabConflict,

    #[error("background reader failed to start within {0:?}")]
    StartTimeout(Duration),

    #[error("display connection error: {0}")]
    X11(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hook lifecycle state. Grabs are valid only while `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Stopped,
    Starting,
    Running,
}

/// Callback invoked on the control context once per physical key-down of a
/// grabbed combination.
pub type GrabCallback = Arc<dyn Fn(KeySymbol, ModifierMask) + Send + Sync>;

/// The interception/simulation contract shared by both backends.
///
/// Callers depend only on this trait; the variant is chosen at startup.
/// All methods except `start()` return promptly; `start()` is bounded by
/// an internal readiness timeout.
pub trait KeyHook: Send + Sync {
    /// Acquire devices/display resources and become fully ready. Any
    /// failure before readiness leaves no partial grabs behind.
    fn start(&self) -> HookResult<()>;

    /// Release every grab, close handles, and join the background reader
    /// within a bounded wait. Idempotent.
    fn stop(&self);

    /// Alias kept for collaborators that tear down on shutdown paths.
    fn cleanup(&self) {
        self.stop();
    }

    fn state(&self) -> HookState;

    /// Claim a combination. The callback fires on the control context
    /// exactly once per physical key-down, never on repeat or release.
    fn grab(
        &self,
        keysym: KeySymbol,
        modifiers: ModifierMask,
        callback: GrabCallback,
    ) -> HookResult<()>;

    /// Release a combination. Idempotent; unknown combinations are a no-op.
    fn ungrab(&self, keysym: KeySymbol, modifiers: ModifierMask);

    /// Fire-and-forget synthesis of press+release for a logical key, plus
    /// whatever modifiers the live layout requires to produce it.
    fn simulate(&self, keysym: KeySymbol, modifiers: ModifierMask) -> HookResult<()>;

    /// Control-context pump: wait up to `wait` for one intercepted
    /// key-down, drain the rest, and invoke matching callbacks. Returns
    /// the number of callbacks invoked.
    fn dispatch_pending(&self, wait: Duration) -> usize;

    /// Live layout tables, available while running.
    fn layout(&self) -> Option<Arc<LayoutTable>>;
}

/// An intercepted key-down crossing from the reader to the control context.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Intercept {
    pub code: DeviceKeyCode,
    pub modifiers: ModifierMask,
}

pub(crate) struct GrabEntry {
    pub keysym: KeySymbol,
    pub callback: GrabCallback,
}

/// Active grabs keyed by `(keycode, clean modifier mask)`.
///
/// Shared between the control context (insert/remove/invoke) and the
/// reader thread (membership checks); the lock is never held across a
/// callback invocation.
#[derive(Default)]
pub(crate) struct GrabTable {
    entries: Mutex<std::collections::HashMap<(DeviceKeyCode, ModifierMask), GrabEntry>>,
}

impl GrabTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        code: DeviceKeyCode,
        modifiers: ModifierMask,
        entry: GrabEntry,
    ) -> HookResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&(code, modifiers)) {
            return Err(HookError::AlreadyGrabbed);
        }
        entries.insert((code, modifiers), entry);
        Ok(())
    }

    /// Remove an entry, reporting whether it existed.
    pub fn remove(&self, code: DeviceKeyCode, modifiers: ModifierMask) -> bool {
        self.entries.lock().remove(&(code, modifiers)).is_some()
    }

    pub fn contains(&self, code: DeviceKeyCode, modifiers: ModifierMask) -> bool {
        self.entries.lock().contains_key(&(code, modifiers))
    }

    /// Clone out the callback and keysym so the caller can invoke without
    /// holding the table lock.
    pub fn callback_for(
        &self,
        code: DeviceKeyCode,
        modifiers: ModifierMask,
    ) -> Option<(KeySymbol, GrabCallback)> {
        self.entries
            .lock()
            .get(&(code, modifiers))
            .map(|entry| (entry.keysym, Arc::clone(&entry.callback)))
    }

    /// Drain all entries, returning their keys (used on stop to release
    /// backend grabs).
    pub fn drain_keys(&self) -> Vec<(DeviceKeyCode, ModifierMask)> {
        self.entries.lock().drain().map(|(key, _)| key).collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Control-side dispatcher: owns the intercept channel and turns queued
/// key-downs into callback invocations, isolating callback faults.
pub(crate) struct Dispatcher {
    tx: Sender<Intercept>,
    rx: Receiver<Intercept>,
    grabs: Arc<GrabTable>,
}

impl Dispatcher {
    pub fn new(grabs: Arc<GrabTable>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(INTERCEPT_CHANNEL_BOUND);
        Self { tx, rx, grabs }
    }

    /// Sender handed to the reader thread.
    pub fn sender(&self) -> Sender<Intercept> {
        self.tx.clone()
    }

    pub fn dispatch_pending(&self, wait: Duration) -> usize {
        let mut invoked = 0;
        let first = match self.rx.recv_timeout(wait) {
            Ok(intercept) => intercept,
            Err(_) => return 0,
        };
        invoked += self.invoke(first);
        while let Ok(intercept) = self.rx.try_recv() {
            invoked += self.invoke(intercept);
        }
        invoked
    }

    fn invoke(&self, intercept: Intercept) -> usize {
        let Some((keysym, callback)) = self
            .grabs
            .callback_for(intercept.code, intercept.modifiers)
        else {
            // The grab was released after the reader queued this key-down.
            return 0;
        };
        let result = catch_unwind(AssertUnwindSafe(|| {
            callback(keysym, intercept.modifiers);
        }));
        if result.is_err() {
            log::error!(
                "Key callback panicked for keysym {} (mods {:#x})",
                keysym,
                intercept.modifiers.bits()
            );
        }
        1
    }
}

/// Handle to a running background reader thread.
pub(crate) struct ReaderHandle {
    pub handle: std::thread::JoinHandle<()>,
    pub shutdown: Arc<std::sync::atomic::AtomicBool>,
    pub done_rx: Receiver<()>,
}

impl ReaderHandle {
    /// Signal the loop to exit and join within the stop bound. If the join
    /// does not complete in time the thread is abandoned; resource release
    /// outranks a clean exit.
    pub fn shutdown_and_join(self) {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);
        match self.done_rx.recv_timeout(STOP_TIMEOUT) {
            Ok(()) => {
                let _ = self.handle.join();
            }
            Err(_) => {
                log::error!(
                    "Reader thread did not exit within {:?}; abandoning it",
                    STOP_TIMEOUT
                );
            }
        }
    }
}

/// Queue a key-down toward the control context without ever blocking the
/// reader loop.
pub(crate) fn offer_intercept(tx: &Sender<Intercept>, intercept: Intercept) {
    if tx.try_send(intercept).is_err() {
        log::warn!(
            "Intercept channel full; dropping key-down for code {:?}",
            intercept.code
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn code(x11: u8) -> DeviceKeyCode {
        // Reuse the crate-internal constructor through the resolver API.
        crate::resolver::DeviceKeyCode::from_x11(x11)
    }

    #[test]
    fn test_grab_table_rejects_duplicate() {
        let table = GrabTable::new();
        let entry = || GrabEntry {
            keysym: KeySymbol(0x61),
            callback: Arc::new(|_, _| {}),
        };
        table
            .insert(code(38), ModifierMask::NONE, entry())
            .unwrap();
        assert!(matches!(
            table.insert(code(38), ModifierMask::NONE, entry()),
            Err(HookError::AlreadyGrabbed)
        ));
        // Same code under a different clean mask is a distinct grab.
        table
            .insert(code(38), ModifierMask::CONTROL, entry())
            .unwrap();
    }

    #[test]
    fn test_grab_table_remove_is_idempotent() {
        let table = GrabTable::new();
        assert!(!table.remove(code(38), ModifierMask::NONE));
        table
            .insert(
                code(38),
                ModifierMask::NONE,
                GrabEntry {
                    keysym: KeySymbol(0x61),
                    callback: Arc::new(|_, _| {}),
                },
            )
            .unwrap();
        assert!(table.remove(code(38), ModifierMask::NONE));
        assert!(!table.remove(code(38), ModifierMask::NONE));
    }

    #[test]
    fn test_dispatcher_invokes_callback_once_per_intercept() {
        let grabs = Arc::new(GrabTable::new());
        let dispatcher = Dispatcher::new(Arc::clone(&grabs));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        grabs
            .insert(
                code(191),
                ModifierMask::NONE,
                GrabEntry {
                    keysym: KeySymbol(0xFFCA),
                    callback: Arc::new(move |keysym, mods| {
                        assert_eq!(keysym, KeySymbol(0xFFCA));
                        assert_eq!(mods, ModifierMask::NONE);
                        hits_cb.fetch_add(1, Ordering::SeqCst);
                    }),
                },
            )
            .unwrap();

        let tx = dispatcher.sender();
        offer_intercept(
            &tx,
            Intercept {
                code: code(191),
                modifiers: ModifierMask::NONE,
            },
        );
        offer_intercept(
            &tx,
            Intercept {
                code: code(191),
                modifiers: ModifierMask::NONE,
            },
        );

        let invoked = dispatcher.dispatch_pending(Duration::from_millis(50));
        assert_eq!(invoked, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispatcher_ignores_released_grab() {
        let grabs = Arc::new(GrabTable::new());
        let dispatcher = Dispatcher::new(Arc::clone(&grabs));
        let tx = dispatcher.sender();
        offer_intercept(
            &tx,
            Intercept {
                code: code(191),
                modifiers: ModifierMask::NONE,
            },
        );
        assert_eq!(dispatcher.dispatch_pending(Duration::from_millis(10)), 0);
    }

    #[test]
    fn test_dispatcher_survives_callback_panic() {
        let grabs = Arc::new(GrabTable::new());
        let dispatcher = Dispatcher::new(Arc::clone(&grabs));
        grabs
            .insert(
                code(191),
                ModifierMask::NONE,
                GrabEntry {
                    keysym: KeySymbol(0xFFCA),
                    callback: Arc::new(|_, _| panic!("boom")),
                },
            )
            .unwrap();
        let tx = dispatcher.sender();
        offer_intercept(
            &tx,
            Intercept {
                code: code(191),
                modifiers: ModifierMask::NONE,
            },
        );
        // The panic is caught and counted as an invocation.
        assert_eq!(dispatcher.dispatch_pending(Duration::from_millis(50)), 1);
        // The grab is still live afterwards.
        assert!(grabs.contains(code(191), ModifierMask::NONE));
    }

    #[test]
    fn test_dispatch_pending_times_out_empty() {
        let dispatcher = Dispatcher::new(Arc::new(GrabTable::new()));
        assert_eq!(dispatcher.dispatch_pending(Duration::from_millis(1)), 0);
    }
}
