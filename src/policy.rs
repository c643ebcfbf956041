//! Refresh throttling policy
//!
//! Decides whether a refresh may contact the network. The source page is
//! only hit once at first run, and afterwards only when cached coverage has
//! run out and the minimum interval since the last successful fetch has
//! elapsed.

use chrono::{DateTime, Duration, Utc};

use crate::data::{coverage_end, Entry};

/// Minimum interval between network fetches, in minutes (6 hours)
pub const MIN_REFRESH_MINUTES: i64 = 6 * 60;

/// Default cadence of scheduled refreshes without coverage, in minutes (daily)
pub const AUTO_REFRESH_MINUTES: i64 = 24 * 60;

/// Longest accepted interval, in minutes (ten years)
pub const MAX_INTERVAL_MINUTES: i64 = 10 * 365 * 24 * 60;

/// Scheduled refreshes aim this many hours before the last cached entry ends
const AUTO_LEAD_HOURS: i64 = 24;

/// Retry delay in minutes when the lead target has already passed
const AUTO_RETRY_MINUTES: i64 = 5;

/// Why a refresh is not allowed to use the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    /// Cached entries are valid until the given moment
    CoverageUntil(DateTime<Utc>),
    /// The minimum interval has not elapsed yet
    Floor { next_allowed: DateTime<Utc> },
}

/// Pure throttle decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Floor between two network fetches once coverage is exhausted
    pub min_interval: Duration,
    /// Scheduled cadence when nothing is cached
    pub auto_interval: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::minutes(MIN_REFRESH_MINUTES),
            auto_interval: Duration::minutes(AUTO_REFRESH_MINUTES),
        }
    }
}

impl RefreshPolicy {
    /// Creates a policy
    ///
    /// Intervals shorter than the 6-hour floor are raised to it; anything
    /// past [`MAX_INTERVAL_MINUTES`] is cut down to that.
    pub fn new(min_interval_minutes: i64, auto_interval_minutes: i64) -> Self {
        let min = min_interval_minutes.clamp(MIN_REFRESH_MINUTES, MAX_INTERVAL_MINUTES);
        let auto = auto_interval_minutes.clamp(1, MAX_INTERVAL_MINUTES);
        Self {
            min_interval: Duration::try_minutes(min).unwrap_or(Duration::hours(6)),
            auto_interval: Duration::try_minutes(auto).unwrap_or(Duration::days(1)),
        }
    }

    /// Whether a refresh at `now` may contact the network
    ///
    /// Rules, in order:
    /// 1. never fetched before: allowed
    /// 2. some cached entry ends at or after `now`: not allowed
    /// 3. allowed once `min_interval` has elapsed since the last success
    pub fn should_use_network(
        &self,
        now: DateTime<Utc>,
        entries: &[Entry],
        last_network_success: Option<DateTime<Utc>>,
    ) -> bool {
        self.block_reason(now, entries, last_network_success).is_none()
    }

    /// Explains why the network is off limits, `None` when it is allowed
    pub fn block_reason(
        &self,
        now: DateTime<Utc>,
        entries: &[Entry],
        last_network_success: Option<DateTime<Utc>>,
    ) -> Option<Blocked> {
        let last = last_network_success?;

        if let Some(until) = coverage_end(now, entries) {
            return Some(Blocked::CoverageUntil(until));
        }

        self.next_allowed(now, Some(last))
            .map(|next_allowed| Blocked::Floor { next_allowed })
    }

    /// When the floor next permits a fetch
    ///
    /// `None` on first run or once the floor has already elapsed.
    pub fn next_allowed(
        &self,
        now: DateTime<Utc>,
        last_network_success: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let next = after(last_network_success?, self.min_interval);
        (next > now).then_some(next)
    }

    /// When the next scheduled (not manual) refresh should run
    ///
    /// With coverage, one day before the latest cached entry ends, or five
    /// minutes from now if that moment has passed. Without coverage, one
    /// `auto_interval` from now. Always at least a minute ahead.
    pub fn next_auto_refresh(&self, now: DateTime<Utc>, entries: &[Entry]) -> DateTime<Utc> {
        let target = match coverage_end(now, entries) {
            Some(last_end) => {
                match last_end.checked_sub_signed(Duration::hours(AUTO_LEAD_HOURS)) {
                    Some(target) if target > now => target,
                    _ => after(now, Duration::minutes(AUTO_RETRY_MINUTES)),
                }
            }
            None => after(now, self.auto_interval),
        };
        target.max(after(now, Duration::minutes(1)))
    }
}

/// `at + interval`, saturating at the last representable instant
fn after(at: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    at.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Renders a duration for humans: `2d 3h`, `5h`, `45m`, `30s`
pub fn format_interval(interval: Duration) -> String {
    let seconds = interval.num_seconds().max(0);
    if seconds < 60 {
        return format!("{seconds}s");
    }

    let minutes = seconds / 60;
    let days = minutes / (24 * 60);
    let hours = (minutes / 60) % 24;
    let mins = minutes % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if mins > 0 && days == 0 && hours == 0 {
        parts.push(format!("{mins}m"));
    }
    if parts.is_empty() {
        return "0m".to_string();
    }
    parts.join(" ")
}
