//! Configuration system (layered: code > env > config file > defaults).

use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ThreadlineError};

pub const ENV_STORE: &str = "THREADLINE_STORE";
pub const ENV_DATA_DIR: &str = "THREADLINE_DATA_DIR";
pub const ENV_DATABASE_URL: &str = "THREADLINE_DATABASE_URL";
pub const ENV_SUBSCRIBER_CAPACITY: &str = "THREADLINE_SUBSCRIBER_CAPACITY";
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "THREADLINE_SHUTDOWN_TIMEOUT_MS";

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Run engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-subscriber buffer size; the oldest event is dropped when full.
    #[builder(default = DEFAULT_SUBSCRIBER_CAPACITY)]
    pub subscriber_capacity: usize,
    /// How long a backend gets to exit on shutdown before it is killed.
    #[builder(default = DEFAULT_SHUTDOWN_TIMEOUT_MS)]
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Which conversation store backend to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory,
    File { base_dir: PathBuf },
    Sqlite { url: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            base_dir: default_data_dir().join("threads"),
        }
    }
}

impl StoreConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File { .. } => "file",
            Self::Sqlite { .. } => "sqlite",
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadlineConfig {
    pub engine: EngineConfig,
    pub store: StoreConfig,
}

impl ThreadlineConfig {
    /// Defaults overridden by environment variables (`.env` is honoured).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Config file at `path`, then environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| ThreadlineError::Configuration(err.to_string()))
    }

    /// Overlay values found through `lookup` (normally the process env).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_SUBSCRIBER_CAPACITY) {
            self.engine.subscriber_capacity = parse_number(ENV_SUBSCRIBER_CAPACITY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SHUTDOWN_TIMEOUT_MS) {
            self.engine.shutdown_timeout_ms = parse_number(ENV_SHUTDOWN_TIMEOUT_MS, &raw)?;
        }

        let data_dir = lookup(ENV_DATA_DIR).map(PathBuf::from);
        let store_kind = lookup(ENV_STORE);
        match store_kind.as_deref() {
            None => {
                if let (Some(dir), StoreConfig::File { base_dir }) = (&data_dir, &mut self.store) {
                    *base_dir = dir.join("threads");
                }
            }
            Some("memory") => self.store = StoreConfig::Memory,
            Some("file") => {
                let base_dir = data_dir.unwrap_or_else(default_data_dir).join("threads");
                self.store = StoreConfig::File { base_dir };
            }
            Some("sqlite") => {
                let url = match lookup(ENV_DATABASE_URL) {
                    Some(url) => url,
                    None => {
                        let dir = data_dir.unwrap_or_else(default_data_dir);
                        format!("sqlite://{}", dir.join("threads.db").display())
                    }
                };
                self.store = StoreConfig::Sqlite { url };
            }
            Some(other) => {
                return Err(ThreadlineError::Configuration(format!(
                    "{ENV_STORE} must be memory, file or sqlite (got {other:?})"
                )))
            }
        }

        if self.engine.subscriber_capacity == 0 {
            return Err(ThreadlineError::Configuration(
                "subscriber capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// `~/.threadline`, or `.threadline` when no home directory is known.
pub fn default_data_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".threadline"))
        .unwrap_or_else(|| PathBuf::from(".threadline"))
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ThreadlineError::Configuration(format!("{key} is not a number: {raw:?}")))
}
