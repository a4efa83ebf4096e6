// Rekey Core Library
// Key interception, substitution, and mapping persistence

pub mod hook;
pub mod key;
pub mod mapping;
pub mod modifier;
pub mod remapper;
pub mod resolver;
pub mod storage;

pub use hook::{
    EvdevHook, GrabCallback, HookError, HookResult, HookState, KeyHook, X11GrabHook,
};
pub use key::{char_to_keysym, keysyms, KeySymbol};
pub use mapping::KeyMapping;
pub use modifier::ModifierMask;
pub use remapper::{RemapError, RemapResult, Remapper, RemapperEvent};
pub use resolver::{DeviceKeyCode, KeyResolver, LayoutTable};
pub use storage::{Storage, StorageError};
