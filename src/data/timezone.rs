//! Timezone disambiguation for zone-less page timestamps
//!
//! The page prints its validity windows without an offset. The resolver
//! parses the page once per candidate zone and keeps the interpretation that
//! makes the present moment look normal: a window containing "now", or at
//! least one close to it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use tracing::debug;

use super::parser::parse_entries_in;
use super::Entry;

/// Identity string used for the process-local zone
const LOCAL_IDENTITY: &str = "local";

/// A zone the page timestamps may be expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// Coordinated Universal Time
    Utc,
    /// Whatever zone this machine is configured for
    Local,
    /// An IANA zone such as `America/Chicago`
    Named(Tz),
}

impl Zone {
    /// Stable name used for deduplication and for remembering the last winner
    pub fn identity(&self) -> String {
        match self {
            Zone::Utc => "UTC".to_string(),
            Zone::Local => LOCAL_IDENTITY.to_string(),
            Zone::Named(tz) => tz.name().to_string(),
        }
    }

    /// Parses the page treating its timestamps as local to this zone
    pub fn parse_entries(&self, text: &str) -> Vec<Entry> {
        match self {
            Zone::Utc => parse_entries_in(text, &Utc),
            Zone::Local => parse_entries_in(text, &Local),
            Zone::Named(tz) => parse_entries_in(text, tz),
        }
    }
}

impl FromStr for Zone {
    type Err = String;

    /// Accepts `UTC`, `local`, or any IANA zone name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if name.eq_ignore_ascii_case("utc") {
            return Ok(Zone::Utc);
        }
        if name.eq_ignore_ascii_case(LOCAL_IDENTITY) {
            return Ok(Zone::Local);
        }
        name.parse::<Tz>()
            .map(Zone::Named)
            .map_err(|_| format!("unknown timezone '{name}'"))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

/// Recommended candidates: the configured zone, UTC and the local zone
pub fn candidate_zones(configured: Zone) -> Vec<Zone> {
    dedup_by_identity(vec![configured, Zone::Utc, Zone::Local])
}

fn dedup_by_identity(zones: Vec<Zone>) -> Vec<Zone> {
    let mut seen = Vec::with_capacity(zones.len());
    let mut unique = Vec::with_capacity(zones.len());
    for zone in zones {
        let identity = zone.identity();
        if !seen.contains(&identity) {
            seen.push(identity);
            unique.push(zone);
        }
    }
    unique
}

/// Single-slot memory of the last winning zone
///
/// Owned by the caller and passed into every [`resolve`] call so the winning
/// interpretation stays stable between refreshes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneMemory {
    last_winner: Option<String>,
}

impl ZoneMemory {
    /// Creates a memory seeded with a previously persisted winner
    pub fn with_last_winner(identity: Option<String>) -> Self {
        Self {
            last_winner: identity,
        }
    }

    /// Identity of the last winning zone, if any
    pub fn last_winner(&self) -> Option<&str> {
        self.last_winner.as_deref()
    }

    fn remember(&mut self, zone: &Zone) {
        self.last_winner = Some(zone.identity());
    }
}

/// Plausibility score of one interpretation; lower is better
///
/// Fields compare in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Score {
    /// 0 if some window contains now, 1 if there are entries, 2 if none
    pub coverage: u8,
    /// Seconds from now to the nearest window boundary, 0 when inside one
    pub distance_secs: i64,
    /// Negated count of entries ending at or after now
    pub future_coverage: i64,
}

impl Score {
    /// Scores an entry set against `now`
    pub fn of(entries: &[Entry], now: DateTime<Utc>) -> Self {
        if entries.is_empty() {
            return Self {
                coverage: 2,
                distance_secs: i64::MAX,
                future_coverage: 0,
            };
        }

        let inside = entries.iter().any(|entry| entry.contains(now));
        let distance_secs = if inside {
            0
        } else {
            entries
                .iter()
                .map(|entry| {
                    let to_start = (entry.start - now).num_seconds().abs();
                    let to_end = (entry.end - now).num_seconds().abs();
                    to_start.min(to_end)
                })
                .min()
                .unwrap_or(i64::MAX)
        };
        let future = entries
            .iter()
            .filter(|entry| entry.is_current_or_future(now))
            .count();

        Self {
            coverage: if inside { 0 } else { 1 },
            distance_secs,
            future_coverage: -(future as i64),
        }
    }
}

/// Outcome of resolving the page against a set of candidate zones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The winning zone, or `None` when no candidate produced entries
    pub zone: Option<Zone>,
    /// Entries parsed in the winning zone, in UTC and sorted by start
    pub entries: Vec<Entry>,
}

/// Parses `text` in every candidate zone and keeps the most plausible result
///
/// Candidates are deduplicated by identity and the remembered winner is tried
/// first. On equal scores the earlier candidate wins, so the remembered zone
/// keeps its place unless another interpretation is strictly better. When no
/// candidate yields any entry the result is empty and the memory is left
/// untouched.
pub fn resolve(
    text: &str,
    now: DateTime<Utc>,
    candidates: &[Zone],
    memory: &mut ZoneMemory,
) -> Resolution {
    let mut ordered = dedup_by_identity(candidates.to_vec());
    if let Some(last) = memory.last_winner() {
        if let Some(pos) = ordered.iter().position(|zone| zone.identity() == last) {
            let sticky = ordered.remove(pos);
            ordered.insert(0, sticky);
        }
    }

    let mut best: Option<(Score, Zone, Vec<Entry>)> = None;
    for zone in ordered {
        let entries = zone.parse_entries(text);
        let score = Score::of(&entries, now);
        debug!(zone = %zone, ?score, count = entries.len(), "scored candidate zone");

        let better = match &best {
            Some((best_score, _, _)) => score < *best_score,
            None => true,
        };
        if better {
            best = Some((score, zone, entries));
        }
    }

    match best {
        Some((_, zone, entries)) if !entries.is_empty() => {
            memory.remember(&zone);
            Resolution {
                zone: Some(zone),
                entries,
            }
        }
        _ => Resolution {
            zone: None,
            entries: Vec::new(),
        },
    }
}
