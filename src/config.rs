//! `upyfs` settings file.
//!
//! Stored as JSON under the user config directory
//! (`<config_dir>/upylink/config.json`). Every field is optional;
//! command-line flags override what the file says.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use upylink_serial::serial::port_scanner::{BoardRegistry, KnownBoard};
use upylink_serial::serial::{
    BaudRate, DeviceFamily, FlowControlConfig, RawReplConfig, ReplError, ReplResult, SerialConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    /// Port to use instead of auto-detection.
    #[serde(default)]
    pub port: Option<String>,

    #[serde(default)]
    pub baud_rate: BaudRate,

    /// Physical read timeout.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Overrides the family's raw REPL defaults when set.
    #[serde(default)]
    pub raw_repl: Option<RawReplConfig>,

    /// Family to assume when the port is not a known board.
    #[serde(default)]
    pub family: Option<DeviceFamily>,

    /// Boards added to the built-in registry.
    #[serde(default)]
    pub extra_boards: Vec<KnownBoard>,

    #[serde(default)]
    pub flow_control: FlowControlConfig,
}

fn default_read_timeout() -> u64 {
    100
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: BaudRate::default(),
            read_timeout_ms: default_read_timeout(),
            raw_repl: None,
            family: None,
            extra_boards: Vec::new(),
            flow_control: FlowControlConfig::default(),
        }
    }
}

impl LinkConfig {
    /// `<config_dir>/upylink/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("upylink").join("config.json"))
    }

    pub fn load(path: &Path) -> ReplResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReplError::local_io(format!("Cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| ReplError::local_io(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Load `explicit` if given (it must exist), else the default file if
    /// present, else defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> ReplResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> ReplResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ReplError::local_io(format!("Cannot create {}: {}", parent.display(), e))
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ReplError::local_io(format!("Cannot encode config: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| ReplError::local_io(format!("Cannot write {}: {}", path.display(), e)))
    }

    /// Built-in boards plus `extra_boards`.
    pub fn registry(&self) -> BoardRegistry {
        let mut registry = BoardRegistry::default();
        for board in &self.extra_boards {
            registry.add(board.clone());
        }
        registry
    }

    pub fn serial_config(&self, port_name: &str) -> SerialConfig {
        SerialConfig {
            baud_rate: self.baud_rate,
            read_timeout_ms: self.read_timeout_ms,
            ..SerialConfig::for_port(port_name)
        }
    }

    pub fn raw_repl_config(&self, family: DeviceFamily) -> RawReplConfig {
        self.raw_repl
            .clone()
            .unwrap_or_else(|| family.raw_repl_defaults())
    }
}
