//! Core data models for fctoken
//!
//! This module contains the activation token entry type, its on-disk record
//! form, and the acquisition pipeline (fetching, parsing and timezone
//! resolution) that produces entries from the source page.

pub mod fetcher;
pub mod parser;
pub mod timezone;

pub use fetcher::{default_identities, FetchError, FetchOutcome, Fetcher, Identity};
pub use parser::{clean_token, parse_entries, parse_entries_in};
pub use timezone::{candidate_zones, resolve, Resolution, Score, Zone, ZoneMemory};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp layout used by the source page and by the cache file
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single activation token together with its UTC validity window
///
/// Both ends of the window are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// First moment the token is valid
    pub start: DateTime<Utc>,
    /// Last moment the token is valid
    pub end: DateTime<Utc>,
    /// The opaque token string
    pub token: String,
}

/// Durable form of an entry, one element of the cache file array
///
/// Unknown fields are ignored on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Window start, `YYYY-MM-DD HH:MM:SS` in UTC
    pub start_date: String,
    /// Window end, `YYYY-MM-DD HH:MM:SS` in UTC
    pub end_date: String,
    /// The token
    pub code: String,
}

impl Entry {
    /// Creates an entry from its parts
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, token: impl Into<String>) -> Self {
        Self {
            start,
            end,
            token: token.into(),
        }
    }

    /// Canonical start key used for deduplication
    pub fn start_key(&self) -> String {
        self.start.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Canonical rendering of the window end
    pub fn end_key(&self) -> String {
        self.end.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Returns true if `moment` falls inside `[start, end]`
    pub fn contains(&self, moment: DateTime<Utc>) -> bool {
        self.start <= moment && moment <= self.end
    }

    /// Returns true if the entry is still valid at or after `now`
    pub fn is_current_or_future(&self, now: DateTime<Utc>) -> bool {
        self.end >= now
    }

    /// One-line human rendering: `<start> – <end> :: <token>`
    pub fn display_line(&self) -> String {
        format!("{} – {} :: {}", self.start_key(), self.end_key(), self.token)
    }

    /// Converts the entry into its cache file record
    pub fn to_record(&self) -> CacheRecord {
        CacheRecord {
            start_date: self.start_key(),
            end_date: self.end_key(),
            code: self.token.clone(),
        }
    }

    /// Rebuilds an entry from a cache file record
    ///
    /// # Returns
    /// * `Some(Entry)` if both timestamps parse, the window is not inverted
    ///   and the token is non-empty
    /// * `None` for a malformed record
    pub fn from_record(record: &CacheRecord) -> Option<Self> {
        let start = parse_utc(&record.start_date)?;
        let end = parse_utc(&record.end_date)?;
        let token = record.code.trim();

        if start > end || token.is_empty() {
            return None;
        }

        Some(Self::new(start, end, token))
    }
}

/// Parses a `YYYY-MM-DD HH:MM:SS` string already known to be UTC
fn parse_utc(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Returns the token whose window contains `now`, if any
///
/// The first matching entry wins; `entries` does not need to be sorted.
pub fn current_token(now: DateTime<Utc>, entries: &[Entry]) -> Option<&str> {
    entries
        .iter()
        .find(|entry| entry.contains(now))
        .map(|entry| entry.token.as_str())
}

/// Latest window end among entries still valid at `now`
pub fn coverage_end(now: DateTime<Utc>, entries: &[Entry]) -> Option<DateTime<Utc>> {
    entries
        .iter()
        .filter(|entry| entry.is_current_or_future(now))
        .map(|entry| entry.end)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_start_key_is_fixed_precision() {
        let entry = Entry::new(utc(2024, 1, 1, 0), utc(2024, 1, 2, 0), "ABC123");
        assert_eq!(entry.start_key(), "2024-01-01 00:00:00");
        assert_eq!(entry.end_key(), "2024-01-02 00:00:00");
    }

    #[test]
    fn test_record_roundtrip_preserves_entry() {
        let entry = Entry::new(utc(2024, 1, 1, 0), utc(2024, 1, 2, 0), "ABC123");

        let record = entry.to_record();
        let restored = Entry::from_record(&record).expect("record should convert back");

        assert_eq!(restored, entry);
    }

    #[test]
    fn test_record_json_uses_original_field_names() {
        let entry = Entry::new(utc(2024, 1, 1, 0), utc(2024, 1, 2, 0), "ABC123");
        let json = serde_json::to_string(&entry.to_record()).unwrap();

        assert!(json.contains("\"start_date\":\"2024-01-01 00:00:00\""));
        assert!(json.contains("\"end_date\":\"2024-01-02 00:00:00\""));
        assert!(json.contains("\"code\":\"ABC123\""));
    }

    #[test]
    fn test_record_ignores_unknown_fields() {
        let json = r#"{"start_date":"2024-01-01 00:00:00","end_date":"2024-01-02 00:00:00","code":"X","extra":1}"#;
        let record: CacheRecord = serde_json::from_str(json).unwrap();
        assert!(Entry::from_record(&record).is_some());
    }

    #[test]
    fn test_from_record_rejects_malformed() {
        let bad_date = CacheRecord {
            start_date: "yesterday".to_string(),
            end_date: "2024-01-02 00:00:00".to_string(),
            code: "X".to_string(),
        };
        let inverted = CacheRecord {
            start_date: "2024-01-03 00:00:00".to_string(),
            end_date: "2024-01-02 00:00:00".to_string(),
            code: "X".to_string(),
        };
        let empty_code = CacheRecord {
            start_date: "2024-01-01 00:00:00".to_string(),
            end_date: "2024-01-02 00:00:00".to_string(),
            code: "   ".to_string(),
        };

        assert!(Entry::from_record(&bad_date).is_none());
        assert!(Entry::from_record(&inverted).is_none());
        assert!(Entry::from_record(&empty_code).is_none());
    }

    #[test]
    fn test_contains_is_inclusive() {
        let entry = Entry::new(utc(2024, 1, 1, 0), utc(2024, 1, 1, 1), "ABC123");

        assert!(entry.contains(utc(2024, 1, 1, 0)));
        assert!(entry.contains(utc(2024, 1, 1, 0) + Duration::minutes(30)));
        assert!(entry.contains(utc(2024, 1, 1, 1)));
        assert!(!entry.contains(utc(2024, 1, 1, 2)));
    }

    #[test]
    fn test_current_token_inside_and_outside_windows() {
        let entries = vec![
            Entry::new(utc(2024, 1, 1, 0), utc(2024, 1, 2, 0), "FIRST"),
            Entry::new(utc(2024, 1, 3, 0), utc(2024, 1, 4, 0), "SECOND"),
        ];

        assert_eq!(current_token(utc(2024, 1, 1, 12), &entries), Some("FIRST"));
        assert_eq!(current_token(utc(2024, 1, 3, 12), &entries), Some("SECOND"));
        assert_eq!(current_token(utc(2024, 1, 2, 12), &entries), None);
        assert_eq!(current_token(utc(2023, 12, 31, 0), &entries), None);
    }

    #[test]
    fn test_coverage_end_ignores_expired() {
        let entries = vec![
            Entry::new(utc(2024, 1, 1, 0), utc(2024, 1, 2, 0), "OLD"),
            Entry::new(utc(2024, 1, 3, 0), utc(2024, 1, 4, 0), "A"),
            Entry::new(utc(2024, 1, 4, 0), utc(2024, 1, 5, 0), "B"),
        ];

        assert_eq!(coverage_end(utc(2024, 1, 3, 0), &entries), Some(utc(2024, 1, 5, 0)));
        assert_eq!(coverage_end(utc(2024, 2, 1, 0), &entries), None);
    }

    #[test]
    fn test_display_line() {
        let entry = Entry::new(utc(2024, 1, 1, 0), utc(2024, 1, 2, 0), "ABC123");
        assert_eq!(
            entry.display_line(),
            "2024-01-01 00:00:00 – 2024-01-02 00:00:00 :: ABC123"
        );
    }
}
