//! Source-selector to target-id remap table.

use crate::config::{KeyMapping, MappingKind};
use crate::registry::KeyRegistry;
use crate::types::ScKey;
use std::collections::HashMap;
use tracing::warn;

/// Maps an additional physical source key onto a monitored key id. Built
/// wholesale against a registry snapshot; entries that do not validate are
/// dropped here and never revisited.
#[derive(Debug, Clone, Default)]
pub struct KeyMappingTable {
    targets: HashMap<ScKey, String>,
}

impl KeyMappingTable {
    pub fn build(mappings: &[KeyMapping], registry: &KeyRegistry) -> Self {
        let mut table = Self::default();

        for mapping in mappings {
            if mapping.mapping_type != MappingKind::Additional {
                warn!(
                    target_id = %mapping.target_key_id,
                    "mapping type is not supported, mapping dropped"
                );
                continue;
            }
            if registry.find_by_id(&mapping.target_key_id).is_none() {
                warn!(
                    target_id = %mapping.target_key_id,
                    "mapping target is not a monitored key, mapping dropped"
                );
                continue;
            }

            let source = mapping.source();
            if let Some(entry) = registry.find_by_key(source) {
                // Direct selector matches win during event processing, so
                // this entry can never fire.
                warn!(
                    source_id = %entry.id,
                    target_id = %mapping.target_key_id,
                    "mapping source is itself a monitored key, mapping is inert"
                );
            }

            // Last definition for a source wins.
            table.targets.insert(source, mapping.target_key_id.clone());
        }

        table
    }

    pub fn resolve(&self, key: ScKey) -> Option<&str> {
        self.targets.get(&key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
