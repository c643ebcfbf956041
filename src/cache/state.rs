//! Refresh bookkeeping persisted next to the token cache

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{CacheManager, PersistError};

/// File name of the refresh state inside the cache directory
pub const STATE_FILE: &str = "state.json";

/// Statistics about the last network refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeStats {
    /// When the page was downloaded
    pub at: DateTime<Utc>,
    /// Label of the browser identity used
    pub identity_label: String,
    /// Size of the response body
    pub bytes: usize,
    /// Entries recovered from the page
    pub entries_scraped: usize,
    /// Wall-clock time of the download and parse
    pub duration_ms: u64,
}

/// State that drives the refresh throttle
///
/// Only a successful network fetch mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshState {
    /// Last time the page was downloaded successfully
    #[serde(default)]
    pub last_network_success: Option<DateTime<Utc>>,
    /// Identity of the zone that won the last timezone resolution
    #[serde(default)]
    pub last_zone: Option<String>,
    /// Statistics of the last network refresh
    #[serde(default)]
    pub last_scrape: Option<ScrapeStats>,
}

impl RefreshState {
    /// Reads the state file; a missing or unreadable file yields the default
    pub fn load(files: &CacheManager) -> Self {
        match files.read_json::<RefreshState>(STATE_FILE) {
            Ok(Some(state)) => state,
            Ok(None) => Self::default(),
            Err(err) => {
                warn!(%err, "ignoring unreadable refresh state");
                Self::default()
            }
        }
    }

    /// Writes the state file
    pub fn save(&self, files: &CacheManager) -> Result<(), PersistError> {
        files.write_json(STATE_FILE, self)
    }

    /// Records a successful network refresh
    pub fn record_success(&mut self, stats: ScrapeStats, zone: Option<String>) {
        self.last_network_success = Some(stats.at);
        if zone.is_some() {
            self.last_zone = zone;
        }
        self.last_scrape = Some(stats);
    }
}
