// Rekey Remapper
// Mapping lifecycle: grabs, persistence, and notifications

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use indexmap::IndexMap;

use crate::hook::{HookError, KeyHook};
use crate::key::KeySymbol;
use crate::mapping::KeyMapping;
use crate::modifier::ModifierMask;
use crate::resolver::KeyResolver;
use crate::storage::Storage;

pub type RemapResult<T> = Result<T, RemapError>;

#[derive(Debug, thiserror::Error)]
pub enum RemapError {
    #[error("a mapping for that combination already exists")]
    Duplicate,

    #[error(transparent)]
    Hook(#[from] HookError),
}

/// State-change notifications, delivered on the control context.
#[derive(Debug, Clone)]
pub enum RemapperEvent {
    MappingAdded(KeyMapping),
    MappingRemoved(String),
    MappingToggled { id: String, enabled: bool },
    Error(String),
}

/// Owns the mapping set and keeps three views consistent: the in-memory
/// records, the hook's grab table, and the persisted document. A grab
/// exists exactly when its mapping is enabled and the hook is running.
///
/// Single-threaded on the control context; the hook's callbacks reach back
/// only through `simulate`, via a weak handle so the hook may be dropped
/// independently.
pub struct Remapper {
    hook: Arc<dyn KeyHook>,
    storage: Storage,
    resolver: Arc<KeyResolver>,
    mappings: IndexMap<String, KeyMapping>,
    events_tx: Sender<RemapperEvent>,
    events_rx: Receiver<RemapperEvent>,
}

impl Remapper {
    pub fn new(hook: Arc<dyn KeyHook>, storage: Storage, resolver: Arc<KeyResolver>) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            hook,
            storage,
            resolver,
            mappings: IndexMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Notification stream. May be taken any number of times; each receiver
    /// competes for events, so collaborators normally hold one.
    pub fn subscribe(&self) -> Receiver<RemapperEvent> {
        self.events_rx.clone()
    }

    pub fn hook(&self) -> &Arc<dyn KeyHook> {
        &self.hook
    }

    pub fn resolver(&self) -> &Arc<KeyResolver> {
        &self.resolver
    }

    /// Start the hook. A failure emits exactly one `Error` notification
    /// and leaves the hook stopped.
    pub fn start(&mut self) -> RemapResult<()> {
        if let Err(e) = self.hook.start() {
            log::error!("Hook failed to start: {}", e);
            self.notify(RemapperEvent::Error(format!("Hook failed to start: {}", e)));
            return Err(e.into());
        }
        Ok(())
    }

    /// Release every grab and stop the hook. Mappings stay loaded.
    pub fn stop(&mut self) {
        self.hook.stop();
    }

    /// Restore mappings from storage in document order. Enabled mappings
    /// attempt their grab; a grab failure disables that mapping and is
    /// surfaced without aborting the rest. A load fault yields an empty set.
    pub fn load(&mut self) {
        self.mappings.clear();
        for mut mapping in self.storage.load_mappings() {
            if mapping.id.is_empty() {
                mapping.id = crate::mapping::generate_id();
            }
            if mapping.enabled {
                if let Err(e) = self.grab_for(&mapping) {
                    log::warn!(
                        "Could not restore grab for {}: {}",
                        self.describe(&mapping),
                        e
                    );
                    self.notify(RemapperEvent::Error(format!(
                        "Could not restore {}: {}",
                        self.describe(&mapping),
                        e
                    )));
                    mapping.enabled = false;
                }
            }
            self.notify(RemapperEvent::MappingAdded(mapping.clone()));
            self.mappings.insert(mapping.id.clone(), mapping);
        }
        log::info!("Loaded {} mappings", self.mappings.len());
    }

    /// Create, grab, persist, and announce a new mapping. The source
    /// combination must be unclaimed by any existing mapping, enabled or
    /// not; the grab is attempted before any record is created.
    pub fn add_mapping(
        &mut self,
        source_keysym: KeySymbol,
        source_modifiers: ModifierMask,
        target_keysym: KeySymbol,
        target_modifiers: ModifierMask,
        description: impl Into<String>,
    ) -> RemapResult<KeyMapping> {
        if self
            .mappings
            .values()
            .any(|m| m.same_source(source_keysym, source_modifiers))
        {
            return Err(RemapError::Duplicate);
        }

        let mapping = KeyMapping::new(
            source_keysym,
            source_modifiers,
            target_keysym,
            target_modifiers,
            description,
        );
        self.grab_for(&mapping)?;

        self.mappings.insert(mapping.id.clone(), mapping.clone());
        self.persist();
        log::info!("Added mapping {}", self.describe(&mapping));
        self.notify(RemapperEvent::MappingAdded(mapping.clone()));
        Ok(mapping)
    }

    /// Delete a mapping, releasing its grab if it held one. Unknown ids
    /// are a no-op.
    pub fn remove_mapping(&mut self, id: &str) {
        let Some(mapping) = self.mappings.shift_remove(id) else {
            return;
        };
        if mapping.enabled {
            self.hook
                .ungrab(mapping.source_keysym, mapping.source_modifiers);
        }
        self.persist();
        log::info!("Removed mapping {}", self.describe(&mapping));
        self.notify(RemapperEvent::MappingRemoved(mapping.id));
    }

    /// Flip a mapping's enabled state. Enabling grabs first and commits
    /// only on success; disabling always releases the grab. Same-state
    /// toggles and unknown ids change nothing.
    pub fn toggle_mapping(&mut self, id: &str, enabled: bool) -> RemapResult<()> {
        let Some(mapping) = self.mappings.get(id).cloned() else {
            return Ok(());
        };
        if mapping.enabled == enabled {
            return Ok(());
        }

        if enabled {
            self.grab_for(&mapping)?;
        } else {
            self.hook
                .ungrab(mapping.source_keysym, mapping.source_modifiers);
        }

        if let Some(m) = self.mappings.get_mut(id) {
            m.enabled = enabled;
        }
        self.persist();
        self.notify(RemapperEvent::MappingToggled {
            id: id.to_string(),
            enabled,
        });
        Ok(())
    }

    /// Enable every mapping, reporting individual failures without
    /// stopping.
    pub fn enable_all(&mut self) {
        for id in self.ids() {
            if let Err(e) = self.toggle_mapping(&id, true) {
                self.notify(RemapperEvent::Error(format!(
                    "Could not enable mapping {}: {}",
                    id, e
                )));
            }
        }
    }

    pub fn disable_all(&mut self) {
        for id in self.ids() {
            // Disabling never fails.
            let _ = self.toggle_mapping(&id, false);
        }
    }

    /// Number of mappings currently holding a grab.
    pub fn active_count(&self) -> usize {
        self.mappings.values().filter(|m| m.enabled).count()
    }

    pub fn mappings(&self) -> impl Iterator<Item = &KeyMapping> {
        self.mappings.values()
    }

    pub fn describe(&self, mapping: &KeyMapping) -> String {
        format!(
            "{} -> {}",
            self.resolver
                .describe_combo(mapping.source_keysym, mapping.source_modifiers),
            self.resolver
                .describe_combo(mapping.target_keysym, mapping.target_modifiers)
        )
    }

    fn ids(&self) -> Vec<String> {
        self.mappings.keys().cloned().collect()
    }

    /// Register the grab whose callback substitutes the target combination.
    fn grab_for(&self, mapping: &KeyMapping) -> RemapResult<()> {
        let hook = Arc::downgrade(&self.hook);
        let target = mapping.target_keysym;
        let target_mods = mapping.target_modifiers;
        self.hook.grab(
            mapping.source_keysym,
            mapping.source_modifiers,
            Arc::new(move |_keysym, _mods| {
                let Some(hook) = hook.upgrade() else {
                    return;
                };
                if let Err(e) = hook.simulate(target, target_mods) {
                    log::warn!("Substitution failed for keysym {}: {}", target, e);
                }
            }),
        )?;
        Ok(())
    }

    /// Serialize the full set. A save fault keeps the previous on-disk
    /// document and is surfaced as one `Error` notification.
    fn persist(&mut self) {
        let records: Vec<KeyMapping> = self.mappings.values().cloned().collect();
        if let Err(e) = self.storage.save_mappings(records) {
            log::error!("Failed to persist mappings: {}", e);
            self.notify(RemapperEvent::Error(format!(
                "Failed to persist mappings: {}",
                e
            )));
        }
    }

    fn notify(&self, event: RemapperEvent) {
        // Unbounded channel; send fails only with no receiver alive.
        let _ = self.events_tx.send(event);
    }
}
