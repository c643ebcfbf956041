//! Durable storage for activation tokens and refresh bookkeeping
//!
//! `TokenStore` owns the deduplicated, expiry-filtered set of entries and
//! `RefreshState` records when the network was last used successfully. Both
//! live as JSON files in one cache directory managed by `CacheManager`.
//! Persistence is advisory: a failed write leaves the in-memory copy
//! authoritative for the rest of the process.

mod manager;
mod state;
mod store;

use thiserror::Error;

pub use manager::CacheManager;
pub use state::{RefreshState, ScrapeStats, STATE_FILE};
pub use store::{TokenStore, CODES_FILE};

/// Errors raised while reading or writing the cache directory
#[derive(Debug, Error)]
pub enum PersistError {
    /// Filesystem error
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unserializable JSON
    #[error("Cache JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No cache directory could be determined for this user
    #[error("No cache directory available")]
    NoCacheDir,
}
