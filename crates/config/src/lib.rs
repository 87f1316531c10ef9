//! TickScript Host Configuration
//!
//! Loads host options from a `key = value` options file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tickscript_core::{HostError, Result};

/// Default location of the options file, relative to the working directory
pub const DEFAULT_OPTIONS_PATH: &str = "host/options.txt";

/// Host configuration parsed from the options file
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    /// Host name shown in logs (from "name" option)
    pub name: String,
    /// Folder holding `<category>/*.js` scripts (from "scriptsfolder")
    pub scripts_folder: PathBuf,
    /// Root for non-relative module specifiers (from "moduleroot")
    pub module_root: PathBuf,
    /// Tick interval in milliseconds (from "tickrate", default: 50)
    pub tick_rate: u64,
    /// Engine heap limit in bytes, 0 = unlimited (from "memorylimit")
    pub memory_limit: usize,
    /// Engine stack limit in bytes, 0 = engine default (from "maxstacksize")
    pub max_stack_size: usize,
    /// `tracing` filter directive (from "logfilter", default: "info")
    pub log_filter: String,
    /// Script runs before the engine is reloaded, 0 = never (from "recycleafter")
    pub recycle_after: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: "TickScript Host".into(),
            scripts_folder: PathBuf::from("scripts"),
            module_root: PathBuf::from("scripts/modules"),
            tick_rate: 50,
            memory_limit: 0,
            max_stack_size: 1024 * 1024,
            log_filter: "info".into(),
            recycle_after: 10_000,
        }
    }
}

impl HostConfig {
    /// Load configuration from an options file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            HostError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&content))
    }

    /// Load from [`DEFAULT_OPTIONS_PATH`], falling back to defaults when the
    /// file is missing
    pub fn load_default() -> Self {
        match Self::load_from_file(DEFAULT_OPTIONS_PATH) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using default configuration", e);
                Self::default()
            }
        }
    }

    /// Parse options file content
    pub fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(eq_pos) = line.find('=') {
                let key = line[..eq_pos].trim();
                let value = line[eq_pos + 1..].trim();

                config.parse_option(&key.to_lowercase(), value);
            }
        }

        config
    }

    fn parse_option(&mut self, key: &str, value: &str) {
        let defaults = Self::default();
        match key {
            "name" => self.name = value.into(),
            "scriptsfolder" => {
                if !value.is_empty() {
                    self.scripts_folder = PathBuf::from(value);
                }
            }
            "moduleroot" => {
                if !value.is_empty() {
                    self.module_root = PathBuf::from(value);
                }
            }
            "tickrate" => {
                self.tick_rate = match value.parse::<u64>() {
                    Ok(0) | Err(_) => defaults.tick_rate,
                    Ok(rate) => rate,
                };
            }
            "memorylimit" => {
                self.memory_limit = value.parse().unwrap_or(defaults.memory_limit);
            }
            "maxstacksize" => {
                self.max_stack_size = value.parse().unwrap_or(defaults.max_stack_size);
            }
            "logfilter" => {
                if !value.is_empty() {
                    self.log_filter = value.into();
                }
            }
            "recycleafter" => {
                self.recycle_after = value.parse().unwrap_or(defaults.recycle_after);
            }
            _ => {
                tracing::debug!("Unknown config option: {} = {}", key, value);
            }
        }
    }

    /// Interval between tick drains
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_rate)
    }

    /// Display configuration summary
    pub fn display(&self) {
        tracing::info!("Host Configuration:");
        tracing::info!("    Name: {}", self.name);
        tracing::info!("    Scripts: {}", self.scripts_folder.display());
        tracing::info!("    Module Root: {}", self.module_root.display());
        tracing::info!("    Tick Rate: {} ms", self.tick_rate);
        if self.memory_limit == 0 {
            tracing::info!("    Memory Limit: unlimited");
        } else {
            tracing::info!("    Memory Limit: {} bytes", self.memory_limit);
        }
        tracing::info!("    Max Stack: {} bytes", self.max_stack_size);
        tracing::info!("    Log Filter: {}", self.log_filter);
        if self.recycle_after == 0 {
            tracing::info!("    Recycle: never");
        } else {
            tracing::info!("    Recycle: every {} runs", self.recycle_after);
        }
    }
}
