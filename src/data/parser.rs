//! Parser for the activation code page
//!
//! The page lists blocks of the form:
//!
//! ```text
//! 2024-01-01 00:00:00 - 2024-02-01 00:00:00
//! <one or more lines holding the token>
//! ```
//!
//! Tokens wrapped across several lines by the page renderer are joined back
//! together. Timestamps carry no zone; callers pick the zone to read them in.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use super::{Entry, TIMESTAMP_FORMAT};

/// A block header: two timestamps separated by a dash
const HEADER_PATTERN: &str =
    r"^\s*(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\s*-\s*(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})";

/// Tokens use a URL-safe Base64-like alphabet and are at least 40 characters long
const TOKEN_PATTERN: &str = r"[A-Za-z0-9_-]{40,}";

static HEADER_RE: OnceLock<Regex> = OnceLock::new();
static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

fn header_re() -> &'static Regex {
    HEADER_RE.get_or_init(|| Regex::new(HEADER_PATTERN).expect("header pattern is valid"))
}

fn token_re() -> &'static Regex {
    TOKEN_RE.get_or_init(|| Regex::new(TOKEN_PATTERN).expect("token pattern is valid"))
}

/// Why a block was skipped. Never leaves this module except through logs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseSkip {
    /// A header timestamp could not be read
    #[error("invalid timestamp: {0}")]
    BadTimestamp(String),

    /// The local time does not exist in the chosen zone (DST gap)
    #[error("nonexistent local time: {0}")]
    NonexistentLocalTime(String),

    /// The window ends before it starts
    #[error("window ends before it starts: {start} - {end}")]
    InvertedWindow { start: String, end: String },

    /// Nothing usable followed the header
    #[error("block has no token")]
    EmptyToken,
}

/// Extracts the activation token from a noisy string
///
/// Returns the first run of at least 40 token characters, or the trimmed
/// input when no such run exists.
pub fn clean_token(raw: &str) -> String {
    match token_re().find(raw) {
        Some(found) => found.as_str().to_string(),
        None => raw.trim().to_string(),
    }
}

/// Parses entries treating the page timestamps as UTC
pub fn parse_entries(text: &str) -> Vec<Entry> {
    parse_entries_in(text, &Utc)
}

/// Parses entries treating the page timestamps as local to `zone`
///
/// Never fails: malformed blocks are skipped and scanning continues with
/// the next header. The result is sorted by start time.
pub fn parse_entries_in<Tz: TimeZone>(text: &str, zone: &Tz) -> Vec<Entry> {
    let lines: Vec<&str> = text.lines().collect();
    let mut entries = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some((start_raw, end_raw)) = match_header(lines[i]) else {
            i += 1;
            continue;
        };

        // Gather every non-blank line up to the next header or end of input
        let mut j = i + 1;
        let mut body = String::new();
        while j < lines.len() {
            let line = lines[j].trim();
            if match_header(line).is_some() {
                break;
            }
            body.push_str(line);
            j += 1;
        }

        match build_entry(start_raw, end_raw, &body, zone) {
            Ok(entry) => entries.push(entry),
            Err(skip) => debug!(line = i + 1, %skip, "skipping block"),
        }

        i = j;
    }

    entries.sort_by(|a, b| a.start.cmp(&b.start));
    entries
}

fn match_header(line: &str) -> Option<(&str, &str)> {
    let captures = header_re().captures(line)?;
    let start = captures.get(1)?.as_str();
    let end = captures.get(2)?.as_str();
    Some((start, end))
}

fn build_entry<Tz: TimeZone>(
    start_raw: &str,
    end_raw: &str,
    body: &str,
    zone: &Tz,
) -> Result<Entry, ParseSkip> {
    if body.is_empty() {
        return Err(ParseSkip::EmptyToken);
    }

    let start = to_utc(start_raw, zone)?;
    let end = to_utc(end_raw, zone)?;
    if start > end {
        return Err(ParseSkip::InvertedWindow {
            start: start_raw.to_string(),
            end: end_raw.to_string(),
        });
    }

    let token = clean_token(body);
    if token.is_empty() {
        return Err(ParseSkip::EmptyToken);
    }

    Ok(Entry::new(start, end, token))
}

/// Reads a page timestamp as local time in `zone` and converts it to UTC
///
/// Ambiguous local times (DST fall-back) resolve to the earlier instant.
fn to_utc<Tz: TimeZone>(raw: &str, zone: &Tz) -> Result<DateTime<Utc>, ParseSkip> {
    let naive = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|_| ParseSkip::BadTimestamp(raw.to_string()))?;

    naive
        .and_local_timezone(zone.clone())
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| ParseSkip::NonexistentLocalTime(raw.to_string()))
}
