//! Coordinator configuration.
//!
//! Read from `~/.config/calview/config.toml` (or the file named by
//! `CALVIEW_CONFIG`), with `CALVIEW_*` environment variables layered on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{CalViewError, CalViewResult};

const CONFIG_PATH_ENV: &str = "CALVIEW_CONFIG";
const ENV_PREFIX: &str = "CALVIEW";

static DEFAULT_DEBOUNCE: &str = "5ms";
static DEFAULT_RETRY_DELAY: &str = "1s";
static DEFAULT_STORAGE_TIMEOUT: &str = "10s";

fn default_debounce() -> Duration {
    Duration::from_millis(5)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_storage_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Delay that coalesces bursts of view changes into one batch.
    #[serde(default = "default_debounce", with = "humantime_str")]
    pub debounce: Duration,

    /// Delay before a failed batch is retried.
    #[serde(default = "default_retry_delay", with = "humantime_str")]
    pub retry_delay: Duration,

    /// Bound on a single storage call.
    #[serde(default = "default_storage_timeout", with = "humantime_str")]
    pub storage_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            debounce: default_debounce(),
            retry_delay: default_retry_delay(),
            storage_timeout: default_storage_timeout(),
        }
    }
}

impl CoordinatorConfig {
    pub fn config_path() -> CalViewResult<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(shellexpand::tilde(&path).into_owned()));
        }

        let config_dir = dirs::config_dir()
            .ok_or_else(|| CalViewError::Config("Could not determine config directory".into()))?
            .join("calview");

        Ok(config_dir.join("config.toml"))
    }

    /// Load from the default location. A missing file yields the defaults.
    pub fn load() -> CalViewResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> CalViewResult<Self> {
        Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()
            .map_err(|e| CalViewError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| CalViewError::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> CalViewResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| CalViewError::Config(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CalViewError::Config(format!("Could not create config directory: {e}"))
            })?;
        }

        std::fs::write(path, content)
            .map_err(|e| CalViewError::Config(format!("Could not write config file: {e}")))?;

        Ok(())
    }

    /// Create a default config file with all options commented out.
    pub fn create_default_config(path: &Path) -> CalViewResult<()> {
        let contents = format!(
            "\
# calview configuration

# Delay that coalesces rapid view changes into one load:
# debounce = \"{}\"

# Delay before retrying a failed load:
# retry_delay = \"{}\"

# Give up on a single storage call after:
# storage_timeout = \"{}\"
",
            DEFAULT_DEBOUNCE, DEFAULT_RETRY_DELAY, DEFAULT_STORAGE_TIMEOUT
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CalViewError::Config(format!("Could not create config directory: {e}"))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| CalViewError::Config(format!("Could not write config file: {e}")))?;

        Ok(())
    }
}

/// Durations as humantime strings ("5ms", "1s").
mod humantime_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}
