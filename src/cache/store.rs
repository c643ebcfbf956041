//! Token store: the authoritative set of cached entries
//!
//! Entries are read lazily from `codes.json` on first access and kept in
//! memory afterwards. Every mutation rewrites the file.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{CacheManager, PersistError};
use crate::data::{CacheRecord, Entry};

/// File name of the entry cache inside the cache directory
pub const CODES_FILE: &str = "codes.json";

/// Deduplicated, expiry-filtered cache of activation entries
#[derive(Debug)]
pub struct TokenStore {
    files: CacheManager,
    /// `None` until the first access reads the file
    entries: Option<Vec<Entry>>,
}

impl TokenStore {
    /// Creates a store backed by `files`; nothing is read until first use
    pub fn new(files: CacheManager) -> Self {
        Self {
            files,
            entries: None,
        }
    }

    /// Returns a snapshot of the cached entries, sorted by start
    ///
    /// The first call reads the cache file; malformed records are dropped
    /// one by one and an unreadable file counts as empty. Expired entries
    /// are only removed by [`TokenStore::merge`].
    pub fn load(&mut self) -> Vec<Entry> {
        self.entries().clone()
    }

    fn entries(&mut self) -> &mut Vec<Entry> {
        let files = &self.files;
        self.entries.get_or_insert_with(|| read_entries(files))
    }

    /// Merges `fresh` entries into the cache and drops expired ones
    ///
    /// Entries are keyed by their canonical start; a fresh entry replaces an
    /// existing one with the same key. Anything ending before `now` is
    /// discarded. The result is sorted, kept in memory and written to disk.
    ///
    /// # Returns
    /// * `Ok(entries)` - the merged set
    /// * `Err(PersistError)` - the write failed; the in-memory set is already
    ///   updated and [`TokenStore::load`] returns it
    pub fn merge(&mut self, fresh: Vec<Entry>, now: DateTime<Utc>) -> Result<Vec<Entry>, PersistError> {
        let existing = std::mem::take(self.entries());
        let fresh_count = fresh.len();

        let mut by_key: BTreeMap<String, Entry> = existing
            .into_iter()
            .map(|entry| (entry.start_key(), entry))
            .collect();
        for entry in fresh {
            by_key.insert(entry.start_key(), entry);
        }

        let mut merged: Vec<Entry> = by_key
            .into_values()
            .filter(|entry| entry.is_current_or_future(now))
            .collect();
        merged.sort_by(|a, b| a.start.cmp(&b.start));

        debug!(fresh = fresh_count, kept = merged.len(), "merged entries");
        self.entries = Some(merged.clone());

        self.persist(&merged)?;
        Ok(merged)
    }

    /// Discards every entry, in memory and on disk
    pub fn purge(&mut self) -> Result<(), PersistError> {
        self.entries = Some(Vec::new());
        self.files.remove(CODES_FILE)
    }

    fn persist(&self, entries: &[Entry]) -> Result<(), PersistError> {
        let records: Vec<CacheRecord> = entries.iter().map(Entry::to_record).collect();
        self.files.write_json(CODES_FILE, &records)
    }
}

fn read_entries(files: &CacheManager) -> Vec<Entry> {
    let raw: Vec<serde_json::Value> = match files.read_json(CODES_FILE) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(err) => {
            warn!(%err, "ignoring unreadable token cache");
            return Vec::new();
        }
    };

    let total = raw.len();
    let mut entries: Vec<Entry> = raw
        .into_iter()
        .filter_map(|value| serde_json::from_value::<CacheRecord>(value).ok())
        .filter_map(|record| Entry::from_record(&record))
        .collect();
    entries.sort_by(|a, b| a.start.cmp(&b.start));

    if entries.len() < total {
        debug!(dropped = total - entries.len(), "dropped malformed cache records");
    }
    entries
}
