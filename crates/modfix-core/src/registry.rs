//! The authoritative list of monitored key identities.

use crate::config::KeysConfig;
use crate::types::ScKey;
use std::collections::HashMap;
use tracing::warn;

// Modifier scan codes (based on actual testing).
pub const SC_LCTRL: ScKey = ScKey::new(0x1D, false);
pub const SC_RCTRL: ScKey = ScKey::new(0x1D, true);
pub const SC_LSHIFT: ScKey = ScKey::new(0x2A, false);
pub const SC_RSHIFT: ScKey = ScKey::new(0x36, false);
pub const SC_LALT: ScKey = ScKey::new(0x38, false);
pub const SC_RALT: ScKey = ScKey::new(0x38, true);
pub const SC_LWIN: ScKey = ScKey::new(0x5B, true);
pub const SC_RWIN: ScKey = ScKey::new(0x5C, true);

// winuser virtual-key codes, kept numeric so the registry builds on any host.
pub const VK_LSHIFT: u16 = 0xA0;
pub const VK_RSHIFT: u16 = 0xA1;
pub const VK_LCONTROL: u16 = 0xA2;
pub const VK_RCONTROL: u16 = 0xA3;
pub const VK_LMENU: u16 = 0xA4;
pub const VK_RMENU: u16 = 0xA5;
pub const VK_LWIN: u16 = 0x5B;
pub const VK_RWIN: u16 = 0x5C;

/// Identity of one monitored key: stable id, display name, the physical
/// selector seen on the keystroke stream and the virtual-key code used for
/// logical polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub id: String,
    pub name: String,
    pub key: ScKey,
    pub vk: u16,
}

/// Derive a key id from a display name: lowercase with spaces removed.
/// "Left Ctrl" becomes "leftctrl", "Custom F1" becomes "customf1".
pub fn derive_key_id(name: &str) -> String {
    name.chars()
        .filter(|c| *c != ' ')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Insertion-ordered set of monitored keys with an id side table. Id lookup
/// is first-inserted-wins, so a later custom key whose derived id collides
/// with an existing one shadows nothing.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    entries: Vec<KeyEntry>,
    by_id: HashMap<String, usize>,
}

impl KeyRegistry {
    /// The 8 canonical modifier entries, all monitored.
    pub fn with_defaults() -> Self {
        Self::from_config(&KeysConfig::default())
    }

    /// Builds the registry from configuration: monitor flags select whole
    /// left/right families, disabled ids prune individual entries, custom
    /// keys are appended in file order.
    pub fn from_config(keys: &KeysConfig) -> Self {
        let mut registry = Self::default();

        let families: [(bool, [(&str, &str, ScKey, u16); 2]); 4] = [
            (
                keys.monitor_ctrl,
                [
                    ("lctrl", "Left Ctrl", SC_LCTRL, VK_LCONTROL),
                    ("rctrl", "Right Ctrl", SC_RCTRL, VK_RCONTROL),
                ],
            ),
            (
                keys.monitor_shift,
                [
                    ("lshift", "Left Shift", SC_LSHIFT, VK_LSHIFT),
                    ("rshift", "Right Shift", SC_RSHIFT, VK_RSHIFT),
                ],
            ),
            (
                keys.monitor_alt,
                [
                    ("lalt", "Left Alt", SC_LALT, VK_LMENU),
                    ("ralt", "Right Alt", SC_RALT, VK_RMENU),
                ],
            ),
            (
                keys.monitor_win,
                [
                    ("lwin", "Left Win", SC_LWIN, VK_LWIN),
                    ("rwin", "Right Win", SC_RWIN, VK_RWIN),
                ],
            ),
        ];

        for (monitored, pair) in families {
            if !monitored {
                continue;
            }
            for (id, name, key, vk) in pair {
                if keys.disabled_keys.iter().any(|d| d.eq_ignore_ascii_case(id)) {
                    continue;
                }
                registry.push(KeyEntry {
                    id: id.to_string(),
                    name: name.to_string(),
                    key,
                    vk,
                });
            }
        }

        for custom in &keys.custom_keys {
            registry.push(KeyEntry {
                id: derive_key_id(custom.name()),
                name: custom.name().to_string(),
                key: custom.key(),
                vk: custom.vk(),
            });
        }

        registry
    }

    fn push(&mut self, entry: KeyEntry) {
        if let Some(existing) = self.find_by_key(entry.key) {
            warn!(
                id = %entry.id,
                shadowed_by = %existing.id,
                sc = entry.key.sc,
                ext = entry.key.ext,
                "duplicate physical selector, first entry wins on lookup"
            );
        }
        let index = self.entries.len();
        self.by_id.entry(entry.id.clone()).or_insert(index);
        self.entries.push(entry);
    }

    pub fn find_by_id(&self, id: &str) -> Option<&KeyEntry> {
        self.index_of_id(id).map(|i| &self.entries[i])
    }

    pub fn index_of_id(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    /// First entry whose own physical selector matches, in insertion order.
    pub fn find_by_key(&self, key: ScKey) -> Option<&KeyEntry> {
        self.index_of_key(key).map(|i| &self.entries[i])
    }

    pub fn index_of_key(&self, key: ScKey) -> Option<usize> {
        self.entries.iter().position(|e| e.key == key)
    }

    pub fn get(&self, index: usize) -> Option<&KeyEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }
}
