// Rekey Storage
// Atomic JSON persistence for mappings and settings

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mapping::KeyMapping;

const MAPPINGS_FILE: &str = "mappings.json";
const DOCUMENT_VERSION: u32 = 1;

/// Errors raised by the storage layer.
///
/// A load fault never reaches callers of `load_mappings`; it degrades to
/// the default document. Save faults propagate so the remapper can surface
/// them.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to replace config file: {0}")]
    Persist(String),
}

/// On-disk document: one structured record holding everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    mappings: Vec<KeyMapping>,
    #[serde(default = "default_settings")]
    settings: BTreeMap<String, Value>,
}

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

fn default_settings() -> BTreeMap<String, Value> {
    let mut settings = BTreeMap::new();
    settings.insert("start_minimized".to_string(), Value::Bool(false));
    settings.insert("enable_on_startup".to_string(), Value::Bool(true));
    settings
}

impl Default for Document {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            mappings: Vec::new(),
            settings: default_settings(),
        }
    }
}

/// JSON-backed store for the mapping set and scalar settings.
///
/// Writes are atomic: the document is serialized to a temp file in the
/// config directory and renamed over the target, so no reader ever
/// observes a partial write.
pub struct Storage {
    config_dir: PathBuf,
    path: PathBuf,
    cached: Option<Document>,
}

impl Storage {
    /// Store under the default config directory (`~/.config/rekey`).
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rekey");
        Self::with_dir(config_dir)
    }

    /// Store under an explicit directory.
    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        let path = config_dir.join(MAPPINGS_FILE);
        Self {
            config_dir,
            path,
            cached: None,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn document(&mut self) -> &mut Document {
        if self.cached.is_none() {
            self.cached = Some(self.read_document());
        }
        self.cached.as_mut().unwrap()
    }

    fn read_document(&self) -> Document {
        match fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(doc) => {
                    log::info!("Loaded config from {}", self.path.display());
                    doc
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", self.path.display(), e);
                    Document::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::default(),
            Err(e) => {
                log::warn!("Failed to read {}: {}", self.path.display(), e);
                Document::default()
            }
        }
    }

    fn write_document(&mut self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.config_dir)?;
        let doc = self.cached.get_or_insert_with(Document::default);
        let tmp = tempfile::Builder::new()
            .prefix("mappings_")
            .suffix(".tmp")
            .tempfile_in(&self.config_dir)?;
        serde_json::to_writer_pretty(&tmp, doc)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StorageError::Persist(e.to_string()))?;
        log::info!("Saved config to {}", self.path.display());
        Ok(())
    }

    /// Ordered sequence of persisted mapping records. A load fault yields
    /// an empty set rather than an error.
    pub fn load_mappings(&mut self) -> Vec<KeyMapping> {
        self.document().mappings.clone()
    }

    /// Persist the full mapping set, replacing the stored sequence.
    pub fn save_mappings(&mut self, mappings: Vec<KeyMapping>) -> Result<(), StorageError> {
        self.document().mappings = mappings;
        self.write_document()
    }

    pub fn get_setting(&mut self, key: &str, default: Value) -> Value {
        self.document().settings.get(key).cloned().unwrap_or(default)
    }

    /// Typed accessor for boolean settings; non-boolean values fall back to
    /// the default.
    pub fn get_bool(&mut self, key: &str, default: bool) -> bool {
        self.get_setting(key, Value::Bool(default))
            .as_bool()
            .unwrap_or(default)
    }

    pub fn set_setting(&mut self, key: &str, value: Value) -> Result<(), StorageError> {
        self.document().settings.insert(key.to_string(), value);
        self.write_document()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeySymbol;
    use crate::modifier::ModifierMask;

    fn sample_mapping(desc: &str) -> KeyMapping {
        KeyMapping::new(
            KeySymbol(0xFFCA),
            ModifierMask::NONE,
            KeySymbol(0x40),
            ModifierMask::NONE,
            desc,
        )
    }

    #[test]
    fn test_load_from_empty_dir_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::with_dir(dir.path());
        assert!(storage.load_mappings().is_empty());
    }

    #[test]
    fn test_save_load_round_trip_preserves_order_and_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut m2 = sample_mapping("second");
        m2.source_keysym = KeySymbol(0xFFCB);
        m2.enabled = false;
        let saved = vec![sample_mapping("first"), m2];

        {
            let mut storage = Storage::with_dir(dir.path());
            storage.save_mappings(saved.clone()).unwrap();
        }

        // Fresh instance reads from disk, not cache.
        let mut storage = Storage::with_dir(dir.path());
        assert_eq!(storage.load_mappings(), saved);
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MAPPINGS_FILE), "{not json").unwrap();
        let mut storage = Storage::with_dir(dir.path());
        assert!(storage.load_mappings().is_empty());
    }

    #[test]
    fn test_settings_defaults_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::with_dir(dir.path());
        assert_eq!(
            storage.get_setting("enable_on_startup", Value::Bool(false)),
            Value::Bool(true)
        );
        assert_eq!(
            storage.get_setting("no_such_key", Value::from(7)),
            Value::from(7)
        );

        assert!(storage.get_bool("enable_on_startup", false));
        assert!(!storage.get_bool("start_minimized", false));

        storage
            .set_setting("start_minimized", Value::Bool(true))
            .unwrap();

        let mut reread = Storage::with_dir(dir.path());
        assert_eq!(
            reread.get_setting("start_minimized", Value::Bool(false)),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_saved_document_carries_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::with_dir(dir.path());
        storage.save_mappings(vec![sample_mapping("x")]).unwrap();

        let text = fs::read_to_string(dir.path().join(MAPPINGS_FILE)).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["version"], Value::from(1));
        assert!(doc["mappings"].is_array());
        assert!(doc["settings"].is_object());
    }

    #[test]
    fn test_no_stray_temp_files_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = Storage::with_dir(dir.path());
        storage.save_mappings(vec![sample_mapping("x")]).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![MAPPINGS_FILE.to_string()]);
    }
}
