//! Configuration file support for loadp2.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (LOADP2_*)
//! 3. Local config file (./loadp2.toml)
//! 4. Global config file (~/.config/loadp2/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "loadp2.toml";

/// Serial port settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Prefix for the candidate sweep when no port is given.
    pub prefix: Option<String>,
    /// Control line wired to reset ("dtr" or "rts").
    pub reset_line: Option<String>,
}

/// Load settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Baud rate after loading.
    pub user_baud: Option<u32>,
    /// Baud rate while loading.
    pub loader_baud: Option<u32>,
    /// Target clock in Hz.
    pub clock_freq: Option<u32>,
    /// Explicit clock mode word.
    pub clock_mode: Option<u32>,
    /// Host receive FIFO size.
    pub fifo_size: Option<u32>,
    /// Directory holding the loader stub binaries.
    pub stub_dir: Option<PathBuf>,
    /// Clear hub memory before loading.
    pub zero_memory: Option<bool>,
    /// Verify ROM hex loads.
    pub checksum: Option<bool>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Load configuration.
    #[serde(default)]
    pub load: LoadConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "loadp2").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; values set in `other` win.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.port.serial, other.port.serial);
        take(&mut self.port.prefix, other.port.prefix);
        take(&mut self.port.reset_line, other.port.reset_line);

        let load = other.load;
        take(&mut self.load.user_baud, load.user_baud);
        take(&mut self.load.loader_baud, load.loader_baud);
        take(&mut self.load.clock_freq, load.clock_freq);
        take(&mut self.load.clock_mode, load.clock_mode);
        take(&mut self.load.fifo_size, load.fifo_size);
        take(&mut self.load.stub_dir, load.stub_dir);
        take(&mut self.load.zero_memory, load.zero_memory);
        take(&mut self.load.checksum, load.checksum);
    }
}
