pub mod config;
pub mod fixer;
#[cfg(windows)]
pub mod hook;
pub mod mapping;
pub mod physical;
pub mod registry;
pub mod service;
pub mod types;
pub mod virtual_keys;

pub use config::Config;
pub use fixer::{EngineSnapshot, FixEngine};
pub use types::{RawKeyEvent, ScKey};
