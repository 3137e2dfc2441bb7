use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Windows Scancode + Extended flag key identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScKey {
    pub sc: u16,
    pub ext: bool,
}

impl ScKey {
    pub const fn new(sc: u16, ext: bool) -> Self {
        Self { sc, ext }
    }
}

/// One keystroke on the physical stream, observed or injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawKeyEvent {
    pub key: ScKey,
    /// true for KeyUp, false for KeyDown.
    pub up: bool,
}

impl RawKeyEvent {
    pub const fn down(key: ScKey) -> Self {
        Self { key, up: false }
    }

    pub const fn release(key: ScKey) -> Self {
        Self { key, up: true }
    }
}

/// Source of raw physical keystrokes.
pub trait EventSource {
    /// Waits up to `timeout` for the next keystroke. `None` means nothing
    /// arrived in time; a transient read failure reports the same way.
    fn wait_for_event(&mut self, timeout: Duration) -> Option<RawKeyEvent>;
}

/// Sink for keystrokes, used both to forward observed events and to
/// synthesize corrective releases.
pub trait EventSink {
    fn inject(&mut self, event: RawKeyEvent) -> anyhow::Result<()>;
}

/// OS-level "is this key logically down right now" query.
pub trait LogicalKeyQuery {
    fn is_logically_pressed(&self, vk: u16) -> bool;
}
