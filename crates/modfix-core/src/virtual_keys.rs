//! Pressed/released state derived from logical key polling.

use crate::registry::KeyRegistry;
use crate::types::LogicalKeyQuery;

/// One pressed flag per registry entry, refreshed in full on every poll so a
/// stale flag cannot survive a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualKeyState {
    pressed: Vec<bool>,
}

impl VirtualKeyState {
    pub fn new(registry: &KeyRegistry) -> Self {
        Self {
            pressed: vec![false; registry.len()],
        }
    }

    pub fn reset(&mut self) {
        self.pressed.fill(false);
    }

    /// Overwrites every entry with the currently reported logical state.
    /// Cadence is the caller's concern; this component has no timer.
    pub fn poll(&mut self, registry: &KeyRegistry, query: &dyn LogicalKeyQuery) {
        for (index, entry) in registry.iter().enumerate() {
            self.pressed[index] = query.is_logically_pressed(entry.vk);
        }
    }

    pub fn is_pressed(&self, index: usize) -> bool {
        self.pressed.get(index).copied().unwrap_or(false)
    }

    pub fn flags(&self) -> &[bool] {
        &self.pressed
    }
}
