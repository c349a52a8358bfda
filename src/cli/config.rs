//! Command-line interface configuration
//!
//! The GPIO lines driving the debug pins rarely change between invocations,
//! so they can be stored in a configuration file instead of being repeated
//! on every command. Command-line flags always take precedence.

use std::{
    fs::{create_dir_all, read_to_string, write},
    path::PathBuf,
};

use directories_next::ProjectDirs;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

/// GPIO lines wired to the debug pins
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct GpioConfig {
    /// BCM pin number of the RESET line
    pub reset: Option<u8>,
    /// BCM pin number of the debug clock line
    pub dc: Option<u8>,
    /// BCM pin number of the debug data line
    pub dd: Option<u8>,
    /// Debug clock half-period in nanoseconds; 0 lets the pin-toggle
    /// latency pace the clock
    #[serde(default)]
    pub delay_nanos: u64,
}

/// Deserialized contents of a configuration file
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// GPIO wiring of the debug pins
    #[serde(default)]
    pub gpio: GpioConfig,
    /// Path of the file to save the config to
    #[serde(skip)]
    save_path: PathBuf,
}

impl Config {
    /// Load the config from the config file
    pub fn load() -> Result<Self> {
        let dirs = ProjectDirs::from("rs", "ccflash", "ccflash").unwrap();
        let file = dirs.config_dir().join("ccflash.toml");

        let mut config: Config = if let Ok(data) = read_to_string(&file) {
            toml::from_str(&data).into_diagnostic()?
        } else {
            Self::default()
        };
        config.save_path = file;
        Ok(config)
    }

    /// Save the config to the config file
    pub fn save_with<F: Fn(&mut Self)>(&self, modify_fn: F) -> Result<()> {
        let mut copy = self.clone();
        modify_fn(&mut copy);

        let serialized = toml::to_string(&copy)
            .into_diagnostic()
            .wrap_err("Failed to serialize config")?;
        create_dir_all(self.save_path.parent().unwrap())
            .into_diagnostic()
            .wrap_err("Failed to create config directory")?;
        write(&self.save_path, serialized)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write config to {}", self.save_path.display()))
    }
}
