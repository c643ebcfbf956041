//! Configuration for fctoken
//!
//! Settings come from a TOML file; every field is optional and falls back
//! to a built-in default. Search order:
//! 1. explicit `--config` path
//! 2. `$XDG_CONFIG_HOME/fctoken/config.toml` (or the platform equivalent)
//! 3. built-in defaults
//!
//! The `TIMEZONE` environment variable, when set, overrides
//! `source_timezone`. Command-line flags override both, so [`Config::load`]
//! does not validate; callers run [`Config::validate`] once every override
//! has been applied.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheManager, PersistError};
use crate::data::{default_identities, Identity, Zone};
use crate::policy::{RefreshPolicy, AUTO_REFRESH_MINUTES, MAX_INTERVAL_MINUTES, MIN_REFRESH_MINUTES};

/// Page the activation codes are published on
pub const DEFAULT_SOURCE_URL: &str = "http://filecxx.com/en_US/activation_code.html";

/// Zone the page is believed to print its timestamps in
pub const DEFAULT_SOURCE_TIMEZONE: &str = "America/Chicago";

/// Environment variable overriding the source timezone
pub const TIMEZONE_ENV: &str = "TIMEZONE";

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested config file does not exist
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// The config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for `Config`
    #[error("Failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),

    /// `source_timezone` names no known zone
    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    /// The request timeout must be at least one second
    #[error("request_timeout_seconds must be greater than zero")]
    InvalidTimeout,

    /// A refresh interval is too large to schedule
    #[error("{field} must be at most {max} minutes, got {value}", max = MAX_INTERVAL_MINUTES)]
    InvalidInterval { field: &'static str, value: i64 },
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Page to scrape
    pub source_url: String,
    /// IANA name of the zone the page timestamps are in (`UTC` and `local` also accepted)
    pub source_timezone: String,
    /// Floor between network fetches once coverage is exhausted; never below 360
    pub min_refresh_interval_minutes: i64,
    /// Cadence of scheduled refreshes while nothing is cached
    pub auto_refresh_minutes: i64,
    /// Whether `watch` schedules refreshes on its own
    pub auto_refresh: bool,
    /// Upper bound for one HTTP request
    pub request_timeout_seconds: u64,
    /// Browser identities rotated per request
    pub identities: Vec<Identity>,
    /// Overrides the platform cache directory
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            source_timezone: DEFAULT_SOURCE_TIMEZONE.to_string(),
            min_refresh_interval_minutes: MIN_REFRESH_MINUTES,
            auto_refresh_minutes: AUTO_REFRESH_MINUTES,
            auto_refresh: true,
            request_timeout_seconds: crate::data::fetcher::DEFAULT_TIMEOUT_SECS,
            identities: default_identities(),
            cache_dir: None,
        }
    }
}

impl Config {
    /// Loads configuration following the search order in the module docs
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit_path {
            Some(p) if p.exists() => Some(p.to_path_buf()),
            Some(p) => return Err(ConfigError::NotFound(p.to_path_buf())),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let mut config = match path {
            Some(p) => Self::load_from_path(&p)?,
            None => Self::default(),
        };
        config.apply_timezone_override(std::env::var(TIMEZONE_ENV).ok());
        Ok(config)
    }

    /// Default config file location, if a home directory is known
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "fctoken").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parses a TOML document; missing fields take their defaults
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Replaces the source timezone with a non-empty override
    pub fn apply_timezone_override(&mut self, value: Option<String>) {
        if let Some(name) = value.filter(|v| !v.trim().is_empty()) {
            self.source_timezone = name.trim().to_string();
        }
    }

    /// Checks values that cannot be defaulted silently
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.zone()?;
        if self.request_timeout_seconds == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        let intervals = [
            ("min_refresh_interval_minutes", self.min_refresh_interval_minutes),
            ("auto_refresh_minutes", self.auto_refresh_minutes),
        ];
        for (field, value) in intervals {
            if value > MAX_INTERVAL_MINUTES {
                return Err(ConfigError::InvalidInterval { field, value });
            }
        }
        Ok(())
    }

    /// The configured source zone
    pub fn zone(&self) -> Result<Zone, ConfigError> {
        self.source_timezone
            .parse()
            .map_err(|_| ConfigError::UnknownTimezone(self.source_timezone.clone()))
    }

    /// Throttle policy built from the configured intervals
    pub fn policy(&self) -> RefreshPolicy {
        RefreshPolicy::new(self.min_refresh_interval_minutes, self.auto_refresh_minutes)
    }

    /// HTTP request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Cache directory manager: the override if set, else the platform default
    pub fn cache_manager(&self) -> Result<CacheManager, PersistError> {
        match &self.cache_dir {
            Some(dir) => Ok(CacheManager::with_dir(dir.clone())),
            None => CacheManager::new().ok_or(PersistError::NoCacheDir),
        }
    }
}
