// Rekey Mapping Record
// One source combination mapped to one target combination

use serde::{Deserialize, Serialize};

use crate::key::KeySymbol;
use crate::modifier::ModifierMask;

/// A single key substitution: pressing `source` produces `target`.
///
/// Only `enabled` mutates after creation. The id is a short random token,
/// stable across persistence round-trips. Every field deserializes with a
/// default so documents written by older versions load cleanly; unknown
/// fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMapping {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source_keysym: KeySymbol,
    #[serde(default)]
    pub source_modifiers: ModifierMask,
    #[serde(default)]
    pub target_keysym: KeySymbol,
    #[serde(default)]
    pub target_modifiers: ModifierMask,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

impl KeyMapping {
    pub fn new(
        source_keysym: KeySymbol,
        source_modifiers: ModifierMask,
        target_keysym: KeySymbol,
        target_modifiers: ModifierMask,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            source_keysym,
            source_modifiers,
            target_keysym,
            target_modifiers,
            enabled: true,
            description: description.into(),
        }
    }

    /// Whether another mapping claims the same source combination.
    pub fn same_source(&self, keysym: KeySymbol, modifiers: ModifierMask) -> bool {
        self.source_keysym == keysym && self.source_modifiers == modifiers
    }
}

/// Short collision-resistant token, 8 hex chars of a v4 uuid.
pub fn generate_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_mapping_defaults() {
        let m = KeyMapping::new(
            KeySymbol(0xFFCA),
            ModifierMask::NONE,
            KeySymbol(0x40),
            ModifierMask::NONE,
            "F13 types @",
        );
        assert!(m.enabled);
        assert_eq!(m.id.len(), 8);
        assert_eq!(m.description, "F13 types @");
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn test_serde_round_trip_preserves_all_fields() {
        let mut m = KeyMapping::new(
            KeySymbol(0xFFCA),
            ModifierMask::CONTROL,
            KeySymbol(0x40),
            ModifierMask::SHIFT,
            "desc",
        );
        m.enabled = false;
        let json = serde_json::to_string(&m).unwrap();
        let back: KeyMapping = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_deserialize_missing_fields_take_defaults() {
        let m: KeyMapping = serde_json::from_str(r#"{"id": "abcd1234"}"#).unwrap();
        assert_eq!(m.id, "abcd1234");
        assert!(m.enabled);
        assert_eq!(m.source_keysym, KeySymbol(0));
        assert_eq!(m.description, "");
    }

    #[test]
    fn test_deserialize_ignores_unknown_fields() {
        let m: KeyMapping =
            serde_json::from_str(r#"{"id": "abcd1234", "color": "red", "weight": 3}"#).unwrap();
        assert_eq!(m.id, "abcd1234");
    }

    #[test]
    fn test_same_source() {
        let m = KeyMapping::new(
            KeySymbol(0xFFCA),
            ModifierMask::CONTROL,
            KeySymbol(0x40),
            ModifierMask::NONE,
            "",
        );
        assert!(m.same_source(KeySymbol(0xFFCA), ModifierMask::CONTROL));
        assert!(!m.same_source(KeySymbol(0xFFCA), ModifierMask::NONE));
    }
}
