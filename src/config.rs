// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Settings file and per-user paths.

use crate::backend::subscription::SubscriptionSettings;
use crate::listener::ListenerSettings;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error in {path}: {source}")]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("No config directory found")]
    NoConfigDir,
}

/// Contents of `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Quiet time after the first notification before a pass starts.
    pub settle_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Failed passes in a row before a listener gives up.
    pub max_consecutive_failures: u32,
    pub client_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 100,
            poll_interval_ms: 100,
            max_reconnect_attempts: 5,
            max_consecutive_failures: 10,
            client_name: "pdav".to_string(),
        }
    }
}

impl Settings {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No settings at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let settings = Self::from_toml(&content).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            max_consecutive_failures: self.max_consecutive_failures.max(1),
        }
    }

    pub fn subscription_settings(&self) -> SubscriptionSettings {
        SubscriptionSettings {
            client_name: self.client_name.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}

/// Explicit paths given on the command line.
#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub config_file: Option<PathBuf>,
    pub save_file: Option<PathBuf>,
    pub quirks_file: Option<PathBuf>,
}

/// Where every file lives for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_file: PathBuf,
    pub save_file: PathBuf,
    pub quirks_file: PathBuf,
}

impl Paths {
    /// Files inside `config_dir`.
    pub fn in_dir(config_dir: &Path) -> Self {
        Self {
            config_file: config_dir.join("config.toml"),
            save_file: config_dir.join("save.json"),
            quirks_file: config_dir.join("quirks.toml"),
        }
    }

    /// Per-user defaults with `overrides` applied.
    ///
    /// The user config directory is only looked up, and created, when at
    /// least one path is not overridden.
    pub fn resolve(overrides: PathOverrides) -> Result<Self, ConfigError> {
        let defaults = match (&overrides.config_file, &overrides.save_file, &overrides.quirks_file) {
            (Some(_), Some(_), Some(_)) => None,
            _ => Some(Self::in_dir(&user_config_dir()?)),
        };
        Ok(Self::merge(defaults, overrides))
    }

    fn merge(defaults: Option<Self>, overrides: PathOverrides) -> Self {
        let pick = |explicit: Option<PathBuf>, default: Option<&PathBuf>| {
            explicit.or_else(|| default.cloned()).unwrap_or_default()
        };
        Self {
            config_file: pick(overrides.config_file, defaults.as_ref().map(|d| &d.config_file)),
            save_file: pick(overrides.save_file, defaults.as_ref().map(|d| &d.save_file)),
            quirks_file: pick(overrides.quirks_file, defaults.as_ref().map(|d| &d.quirks_file)),
        }
    }
}

fn user_config_dir() -> Result<PathBuf, ConfigError> {
    let project_dirs = ProjectDirs::from("", "", "pdav").ok_or(ConfigError::NoConfigDir)?;
    let config_dir = project_dirs.config_dir().to_path_buf();
    fs::create_dir_all(&config_dir)?;
    debug!("Config directory: {:?}", config_dir);
    Ok(config_dir)
}
