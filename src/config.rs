// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{LockError, Result};
use crate::locking::acquisition::PollingBackoff;
use crate::locking::timeout::{LockTimeoutValue, parse_timeout};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "DBLOCK";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_LOCK_DIR_NAME: &str = "dblock";

/// Database engine providing the lock primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
    Postgres,
    Mysql,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendKind::Memory => "memory",
            BackendKind::File => "file",
            BackendKind::Postgres => "postgres",
            BackendKind::Mysql => "mysql",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    pub backend: BackendKind,

    /// Connection string for database backends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Directory for the file backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_dir: Option<PathBuf>,

    /// Default acquisition timeout: seconds or "infinite". Absent means infinite.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    pub poll_interval_ms: u64,

    pub backoff_factor: u32,

    pub max_poll_interval_ms: u64,

    /// Namespace half of the key for text and numeric lock names.
    pub key_namespace: i32,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            url: None,
            lock_dir: None,
            timeout: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            backoff_factor: 1,
            max_poll_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
            key_namespace: 0,
        }
    }
}

impl LockingConfig {
    /// Loads configuration from an optional TOML file, overridden by
    /// `DBLOCK_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if path.exists() {
                log::debug!("Loading lock configuration from {path:?}");
            } else {
                log::debug!("Config file not found at {path:?}, using defaults");
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        let config: LockingConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| LockError::Config(format!("Failed to serialize config: {e}")))?;

        fs::write(path, contents)?;
        log::debug!("Saved lock configuration to {path:?}");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.timeout_value()?;
        if self.poll_interval_ms == 0 {
            return Err(LockError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout_value(&self) -> Result<LockTimeoutValue> {
        match self.timeout.as_deref() {
            None => Ok(LockTimeoutValue::Infinite),
            Some(raw) => parse_timeout(raw).map_err(|err| LockError::Config(err.to_string())),
        }
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_LOCK_DIR_NAME))
    }

    pub fn settings(&self) -> Result<LockSettings> {
        Ok(LockSettings {
            default_timeout: self.timeout_value()?,
            backoff: PollingBackoff::new(
                Duration::from_millis(self.poll_interval_ms),
                self.backoff_factor,
                Duration::from_millis(self.max_poll_interval_ms),
            ),
            key_namespace: self.key_namespace,
        })
    }
}

/// Resolved runtime policy shared by every session of a locker.
#[derive(Debug, Clone)]
pub struct LockSettings {
    pub default_timeout: LockTimeoutValue,
    pub backoff: PollingBackoff,
    pub key_namespace: i32,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            default_timeout: LockTimeoutValue::Infinite,
            backoff: PollingBackoff::default(),
            key_namespace: 0,
        }
    }
}
