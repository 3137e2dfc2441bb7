//! Pressed/released state derived from the raw keystroke stream.

use crate::mapping::KeyMappingTable;
use crate::registry::KeyRegistry;
use crate::types::RawKeyEvent;

/// One pressed flag per registry entry, positionally aligned with the
/// registry's insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalKeyState {
    pressed: Vec<bool>,
}

impl PhysicalKeyState {
    pub fn new(registry: &KeyRegistry) -> Self {
        Self {
            pressed: vec![false; registry.len()],
        }
    }

    pub fn reset(&mut self) {
        self.pressed.fill(false);
    }

    /// Applies one keystroke. A direct selector match updates that entry;
    /// otherwise a mapped source drives its target. An event matches at most
    /// one of the two paths.
    ///
    /// Mapped releases clear the target unconditionally, even if the target's
    /// own key or another mapped source is still held. That last-writer-wins
    /// simplification is intentional and covered by tests.
    pub fn process_event(
        &mut self,
        registry: &KeyRegistry,
        mappings: &KeyMappingTable,
        event: RawKeyEvent,
    ) {
        let pressed = !event.up;
        if let Some(index) = registry.index_of_key(event.key) {
            self.pressed[index] = pressed;
        } else if let Some(target_id) = mappings.resolve(event.key) {
            if let Some(index) = registry.index_of_id(target_id) {
                self.pressed[index] = pressed;
            }
        }
    }

    pub fn is_pressed(&self, index: usize) -> bool {
        self.pressed.get(index).copied().unwrap_or(false)
    }

    /// The chord guard: true while any monitored key is physically held.
    pub fn any_pressed(&self) -> bool {
        self.pressed.iter().any(|p| *p)
    }

    /// Positional pressed flags, for change detection against a snapshot of
    /// the same configuration.
    pub fn flags(&self) -> &[bool] {
        &self.pressed
    }
}
