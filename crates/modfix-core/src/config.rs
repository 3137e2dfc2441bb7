//! TOML configuration, file layout compatible with the historical
//! `config.toml` of the tool (camelCase keys, hex scan codes allowed).

use crate::types::ScKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize configuration")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeneralConfig {
    /// Time (ms) a mismatch must persist before a key counts as stuck.
    pub threshold_ms: u32,
    pub show_messages: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            threshold_ms: 1000,
            show_messages: true,
        }
    }
}

impl GeneralConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_millis(u64::from(self.threshold_ms))
    }
}

/// Balloon-notification switches, carried for front ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationConfig {
    pub enabled: bool,
    pub notify_on_fix: bool,
    pub notify_on_startup: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            notify_on_fix: true,
            notify_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdvancedConfig {
    pub tooltip_update_interval: u32,
    pub debug_mode: bool,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            tooltip_update_interval: 1000,
            debug_mode: false,
        }
    }
}

/// Custom monitored key, stored in config as `[scanCode, needsE0, name, vkCode]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomKey(pub u16, pub bool, pub String, pub u16);

impl CustomKey {
    pub fn key(&self) -> ScKey {
        ScKey::new(self.0, self.1)
    }

    pub fn name(&self) -> &str {
        &self.2
    }

    pub fn vk(&self) -> u16 {
        self.3
    }
}

/// Which keys the detector watches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeysConfig {
    pub monitor_ctrl: bool,
    pub monitor_shift: bool,
    pub monitor_alt: bool,
    pub monitor_win: bool,
    pub disabled_keys: Vec<String>,
    pub custom_keys: Vec<CustomKey>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            monitor_ctrl: true,
            monitor_shift: true,
            monitor_alt: true,
            monitor_win: true,
            disabled_keys: Vec::new(),
            custom_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingKind {
    /// Source press/release additionally asserts/clears the target.
    Additional,
    /// Recognized in configuration but not implemented.
    Replace,
}

/// One remap rule: a physical key acting as an extra source for a monitored
/// key. Target validity is checked against the registry when the mapping
/// table is built, not here.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMapping {
    pub source_scan_code: u16,
    pub source_needs_e0: bool,
    pub target_key_id: String,
    pub mapping_type: MappingKind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl KeyMapping {
    pub fn source(&self) -> ScKey {
        ScKey::new(self.source_scan_code, self.source_needs_e0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub notifications: NotificationConfig,
    pub advanced: AdvancedConfig,
    pub keys: KeysConfig,
    #[serde(rename = "keyMappings", skip_serializing_if = "Vec::is_empty")]
    pub key_mappings: Vec<KeyMapping>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            notifications: NotificationConfig::default(),
            advanced: AdvancedConfig::default(),
            keys: KeysConfig::default(),
            key_mappings: Vec::new(),
        }
    }
}

/// Mapping entries are normalized leniently: one malformed entry is dropped
/// with a warning and the rest of the file still loads.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawKeyMapping {
    source_scan_code: Option<u16>,
    source_needs_e0: Option<bool>,
    target_key_id: Option<String>,
    mapping_type: Option<String>,
    description: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    general: GeneralConfig,
    notifications: NotificationConfig,
    advanced: AdvancedConfig,
    keys: KeysConfig,
    #[serde(rename = "keyMappings")]
    key_mappings: Vec<RawKeyMapping>,
}

fn normalize_mapping(raw: RawKeyMapping) -> Option<KeyMapping> {
    let (Some(source_scan_code), Some(source_needs_e0), Some(target_key_id)) =
        (raw.source_scan_code, raw.source_needs_e0, raw.target_key_id)
    else {
        warn!("key mapping is missing a required field, entry ignored");
        return None;
    };

    let mapping_type = match raw.mapping_type.as_deref() {
        None | Some("additional") => MappingKind::Additional,
        Some("replace") => MappingKind::Replace,
        Some(other) => {
            warn!(mapping_type = other, "unknown mapping type, using 'additional'");
            MappingKind::Additional
        }
    };

    Some(KeyMapping {
        source_scan_code,
        source_needs_e0,
        target_key_id,
        mapping_type,
        description: raw.description.unwrap_or_default(),
    })
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        let raw: RawConfig = toml::from_str(text)?;
        Ok(Self {
            general: raw.general,
            notifications: raw.notifications,
            advanced: raw.advanced,
            keys: raw.keys,
            key_mappings: raw.key_mappings.into_iter().filter_map(normalize_mapping).collect(),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let body = toml::to_string(self)?;
        let text = format!("# Modifier key auto-fix configuration\n\n{body}");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path`, falling back to defaults on any failure. The defaults
    /// are persisted best-effort so the user has a file to edit.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                warn!(%err, "configuration not loaded, using defaults");
                let config = Self::default();
                if let Err(err) = config.save(path) {
                    warn!(%err, "could not write default configuration");
                }
                config
            }
        }
    }

    /// `config.toml` next to the executable wins; otherwise the per-user
    /// configuration directory.
    pub fn default_path() -> PathBuf {
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let candidate = dir.join("config.toml");
                if candidate.exists() {
                    return candidate;
                }
            }
        }
        if let Some(base) = dirs::config_dir() {
            return base.join("modfix").join("config.toml");
        }
        PathBuf::from("config.toml")
    }
}
