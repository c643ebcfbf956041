//! Refresh orchestration and background scheduling
//!
//! `Orchestrator` runs fetch, parse, timezone resolution and merge as one
//! unit of work and guarantees that at most one such unit is in flight.
//! `RefreshHandle` drives it from a background tokio task using a timer and
//! manual triggers, and reports results over a channel.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, PersistError, RefreshState, ScrapeStats, TokenStore};
use crate::config::{Config, ConfigError};
use crate::data::{candidate_zones, current_token, resolve, Entry, FetchError, Fetcher, Zone, ZoneMemory};
use crate::policy::{Blocked, RefreshPolicy};

/// Soft failures of a refresh; the cache is still served when one occurs
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The page could not be downloaded
    #[error("Refresh failed: {0}")]
    Network(#[from] FetchError),

    /// The result could not be written to disk
    #[error("Could not persist cache: {0}")]
    Persist(#[from] PersistError),
}

/// Errors building an orchestrator from configuration
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Where the refresh state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Merging,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Fetching,
            2 => Phase::Merging,
            _ => Phase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Fetching => 1,
            Phase::Merging => 2,
        }
    }
}

/// Result of one completed refresh
#[derive(Debug)]
pub struct RefreshReport {
    /// Cache contents after the refresh, sorted by start
    pub entries: Vec<Entry>,
    /// The active token differs from the one seen by the previous refresh
    pub changed: bool,
    /// The page was requested
    pub used_network: bool,
    /// Why the network was skipped, when the policy said no
    pub blocked: Option<Blocked>,
    /// First soft failure, if any
    pub error: Option<RefreshError>,
}

impl RefreshReport {
    /// True when nothing went wrong
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Token active at `now` in the reported entries
    pub fn current_token(&self, now: DateTime<Utc>) -> Option<&str> {
        current_token(now, &self.entries)
    }
}

/// What a call to `refresh` did
#[derive(Debug)]
pub enum RefreshOutcome {
    /// Another refresh was in flight; nothing was done
    Busy,
    /// The refresh ran to completion
    Done(RefreshReport),
}

/// Mutable state touched only under the session lock
#[derive(Debug)]
struct Session {
    store: TokenStore,
    files: CacheManager,
    state: RefreshState,
    zones: ZoneMemory,
    /// Active token seen by the previous refresh
    last_active: Option<String>,
    /// Whether any refresh has completed since startup
    primed: bool,
}

impl Session {
    /// Records the active token and reports whether it changed
    fn observe(&mut self, now: DateTime<Utc>, entries: &[Entry]) -> bool {
        let current = current_token(now, entries).map(str::to_owned);
        let previous = std::mem::replace(&mut self.last_active, current.clone());
        let primed = std::mem::replace(&mut self.primed, true);

        primed
            && matches!(
                (previous.as_deref(), current.as_deref()),
                (Some(old), Some(new)) if old != new
            )
    }
}

#[derive(Debug)]
struct Shared {
    fetcher: Fetcher,
    policy: RefreshPolicy,
    candidates: Vec<Zone>,
    phase: AtomicU8,
    session: Mutex<Session>,
}

/// Resets the phase to `Idle` when the unit of work ends, however it ends
struct FlightGuard<'a> {
    phase: &'a AtomicU8,
}

impl<'a> FlightGuard<'a> {
    fn acquire(phase: &'a AtomicU8, first: Phase) -> Option<Self> {
        phase
            .compare_exchange(
                Phase::Idle.as_u8(),
                first.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| Self { phase })
    }

    fn enter(&self, next: Phase) {
        self.phase.store(next.as_u8(), Ordering::Release);
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(Phase::Idle.as_u8(), Ordering::Release);
    }
}

/// Single-flight coordinator of the refresh pipeline
///
/// Cheap to clone; clones share the same cache, state and flight slot.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Creates an orchestrator over an existing fetcher and cache directory
    ///
    /// The refresh state (including the remembered timezone) is read now;
    /// the entry cache is read lazily on first use.
    pub fn new(fetcher: Fetcher, files: CacheManager, policy: RefreshPolicy, candidates: Vec<Zone>) -> Self {
        let state = RefreshState::load(&files);
        let zones = ZoneMemory::with_last_winner(state.last_zone.clone());
        let session = Session {
            store: TokenStore::new(files.clone()),
            files,
            state,
            zones,
            last_active: None,
            primed: false,
        };

        Self {
            shared: Arc::new(Shared {
                fetcher,
                policy,
                candidates,
                phase: AtomicU8::new(Phase::Idle.as_u8()),
                session: Mutex::new(session),
            }),
        }
    }

    /// Builds the fetcher, cache and candidate zones from configuration
    pub fn from_config(config: &Config) -> Result<Self, SetupError> {
        let zone = config.zone()?;
        let fetcher = Fetcher::new(config.source_url.clone(), config.identities.clone(), config.timeout())?;
        let files = config.cache_manager()?;
        Ok(Self::new(fetcher, files, config.policy(), candidate_zones(zone)))
    }

    /// Page the fetcher downloads
    pub fn source_url(&self) -> &str {
        self.shared.fetcher.url()
    }

    /// Current state machine phase
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// Throttle policy in use
    pub fn policy(&self) -> RefreshPolicy {
        self.shared.policy
    }

    /// Candidate zones tried when resolving page timestamps
    pub fn candidates(&self) -> &[Zone] {
        &self.shared.candidates
    }

    /// Snapshot of every cached entry, sorted by start
    pub async fn all_entries(&self) -> Vec<Entry> {
        self.shared.session.lock().await.store.load()
    }

    /// Token whose window contains `now`, if any
    pub async fn current_token(&self, now: DateTime<Utc>) -> Option<String> {
        let entries = self.all_entries().await;
        current_token(now, &entries).map(str::to_owned)
    }

    /// Copy of the persisted refresh bookkeeping
    pub async fn refresh_state(&self) -> RefreshState {
        self.shared.session.lock().await.state.clone()
    }

    /// Why a refresh at `now` may not use the network, `None` if it may
    pub async fn block_reason(&self, now: DateTime<Utc>) -> Option<Blocked> {
        let mut session = self.shared.session.lock().await;
        let entries = session.store.load();
        self.shared
            .policy
            .block_reason(now, &entries, session.state.last_network_success)
    }

    /// Whether a refresh at `now` may use the network
    pub async fn should_use_network(&self, now: DateTime<Utc>) -> bool {
        self.block_reason(now).await.is_none()
    }

    /// When the floor next permits a network fetch
    pub async fn next_allowed(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let last = self.shared.session.lock().await.state.last_network_success;
        self.shared.policy.next_allowed(now, last)
    }

    /// When the next scheduled refresh should run
    pub async fn next_auto_refresh(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let entries = self.all_entries().await;
        self.shared.policy.next_auto_refresh(now, &entries)
    }

    /// Runs one refresh
    ///
    /// Returns `RefreshOutcome::Busy` immediately if another refresh is in
    /// flight. With `use_network == false` the cache is returned untouched.
    /// Otherwise the page is fetched, parsed in the most plausible zone and
    /// merged into the cache. A failed fetch counts as zero fresh entries;
    /// the failure is reported in the report, never raised.
    pub async fn refresh(&self, now: DateTime<Utc>, use_network: bool) -> RefreshOutcome {
        let first = if use_network { Phase::Fetching } else { Phase::Merging };
        let Some(guard) = FlightGuard::acquire(&self.shared.phase, first) else {
            debug!("refresh already in flight, dropping request");
            return RefreshOutcome::Busy;
        };
        RefreshOutcome::Done(self.run(&guard, now, use_network).await)
    }

    /// Pipeline body; the caller holds the flight slot for its whole duration
    async fn run(&self, guard: &FlightGuard<'_>, now: DateTime<Utc>, use_network: bool) -> RefreshReport {
        if !use_network {
            guard.enter(Phase::Merging);
            let mut session = self.shared.session.lock().await;
            let entries = session.store.load();
            let changed = session.observe(now, &entries);
            return RefreshReport {
                entries,
                changed,
                used_network: false,
                blocked: None,
                error: None,
            };
        }

        guard.enter(Phase::Fetching);
        let started = Instant::now();
        let fetched = self.shared.fetcher.fetch().await;

        guard.enter(Phase::Merging);
        let mut locked = self.shared.session.lock().await;
        let session = &mut *locked;
        let mut error: Option<RefreshError> = None;

        let fresh = match fetched {
            Ok(page) => {
                let resolution = resolve(&page.body, now, &self.shared.candidates, &mut session.zones);
                let stats = ScrapeStats {
                    at: now,
                    identity_label: page.identity_label,
                    bytes: page.bytes,
                    entries_scraped: resolution.entries.len(),
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                };
                info!(
                    entries = stats.entries_scraped,
                    zone = ?resolution.zone.map(|zone| zone.identity()),
                    "network refresh succeeded"
                );

                session
                    .state
                    .record_success(stats, resolution.zone.map(|zone| zone.identity()));
                if let Err(err) = session.state.save(&session.files) {
                    warn!(%err, "could not persist refresh state");
                    error = Some(err.into());
                }
                resolution.entries
            }
            Err(err) => {
                warn!(%err, "network refresh failed, serving cached entries");
                error = Some(err.into());
                Vec::new()
            }
        };

        let entries = match session.store.merge(fresh, now) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "could not persist token cache");
                error.get_or_insert(err.into());
                session.store.load()
            }
        };
        let changed = session.observe(now, &entries);

        RefreshReport {
            entries,
            changed,
            used_network: true,
            blocked: None,
            error,
        }
    }

    /// Runs one refresh, letting the policy decide whether to use the network
    ///
    /// The flight slot is taken before the policy is consulted, so the
    /// decision always sees the result of any refresh that finished earlier.
    pub async fn refresh_with_policy(&self, now: DateTime<Utc>) -> RefreshOutcome {
        let Some(guard) = FlightGuard::acquire(&self.shared.phase, Phase::Merging) else {
            debug!("refresh already in flight, dropping request");
            return RefreshOutcome::Busy;
        };

        let blocked = self.block_reason(now).await;
        if let Some(reason) = &blocked {
            debug!(?reason, "network refresh not allowed, using cache");
        }

        let mut report = self.run(&guard, now, blocked.is_none()).await;
        report.blocked = blocked;
        RefreshOutcome::Done(report)
    }

    /// Runs one network refresh ignoring the policy
    pub async fn refresh_forced(&self, now: DateTime<Utc>) -> RefreshOutcome {
        self.refresh(now, true).await
    }

    /// Clears the entry cache
    ///
    /// # Returns
    /// * `Ok(true)` once the cache is empty
    /// * `Ok(false)` if a refresh was in flight and nothing was done
    /// * `Err` if the cache file could not be removed (memory is cleared anyway)
    pub async fn purge(&self) -> Result<bool, PersistError> {
        let Some(_guard) = FlightGuard::acquire(&self.shared.phase, Phase::Merging) else {
            return Ok(false);
        };

        let mut session = self.shared.session.lock().await;
        session.last_active = None;
        session.store.purge()?;
        info!("token cache purged");
        Ok(true)
    }
}

/// What started a background refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The auto-refresh timer fired
    Scheduled,
    /// A user asked for a refresh; the policy still applies
    Manual,
    /// A user asked for a refresh that bypasses the policy
    Forced,
}

/// Messages sent from the background refresh task
#[derive(Debug)]
pub enum RefreshMessage {
    /// A refresh finished (successfully or with a soft error)
    Completed { trigger: Trigger, report: RefreshReport },
    /// A trigger arrived while another refresh was in flight and was dropped
    Dropped(Trigger),
}

/// Configuration for the background scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Whether the timer schedules refreshes on its own
    pub auto_refresh: bool,
    /// Run one policy-governed refresh as soon as the task starts
    pub run_initial: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            run_initial: true,
        }
    }
}

/// Handle for controlling the background refresh task
pub struct RefreshHandle {
    /// Channel for receiving refresh messages
    pub receiver: mpsc::Receiver<RefreshMessage>,
    trigger_tx: mpsc::Sender<Trigger>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Spawns the background refresh task
    ///
    /// The timer is re-armed after every event from the policy's
    /// auto-schedule, so it follows the cache as entries come and go.
    /// Each refresh runs in its own task; the orchestrator drops triggers
    /// that arrive while one is in flight.
    pub fn spawn(orchestrator: Orchestrator, config: SchedulerConfig) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<Trigger>(1);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            if config.run_initial {
                in_flight.spawn(run_trigger(orchestrator.clone(), Trigger::Scheduled, msg_tx.clone()));
            }

            loop {
                let wait = if config.auto_refresh {
                    let now = Utc::now();
                    let next = orchestrator.next_auto_refresh(now).await;
                    debug!(%next, "next scheduled refresh");
                    (next - now).to_std().unwrap_or(Duration::ZERO)
                } else {
                    Duration::ZERO
                };

                tokio::select! {
                    _ = tokio::time::sleep(wait), if config.auto_refresh => {
                        in_flight.spawn(run_trigger(orchestrator.clone(), Trigger::Scheduled, msg_tx.clone()));
                    }
                    Some(trigger) = trigger_rx.recv() => {
                        in_flight.spawn(run_trigger(orchestrator.clone(), trigger, msg_tx.clone()));
                    }
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            // In-flight work finishes so no merge is cut short
            while in_flight.join_next().await.is_some() {}
        });

        Self {
            receiver: msg_rx,
            trigger_tx,
            shutdown_tx,
            task,
        }
    }

    /// Requests an immediate policy-governed refresh
    ///
    /// Returns false if a trigger is already pending; the request is dropped.
    pub fn request_refresh(&self) -> bool {
        self.trigger_tx.try_send(Trigger::Manual).is_ok()
    }

    /// Requests an immediate refresh that bypasses the policy
    pub fn force_refresh(&self) -> bool {
        self.trigger_tx.try_send(Trigger::Forced).is_ok()
    }

    /// Stops the timer and waits for any in-flight refresh to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(err) = self.task.await {
            warn!(%err, "refresh task ended abnormally");
        }
    }
}

async fn run_trigger(orchestrator: Orchestrator, trigger: Trigger, tx: mpsc::Sender<RefreshMessage>) {
    let now = Utc::now();
    let outcome = match trigger {
        Trigger::Forced => orchestrator.refresh_forced(now).await,
        Trigger::Scheduled | Trigger::Manual => orchestrator.refresh_with_policy(now).await,
    };

    let message = match outcome {
        RefreshOutcome::Busy => RefreshMessage::Dropped(trigger),
        RefreshOutcome::Done(report) => RefreshMessage::Completed { trigger, report },
    };
    let _ = tx.send(message).await;
}

/// Checks for pending refresh messages without blocking
///
/// # Returns
/// * `Some(RefreshMessage)` if a message was available
/// * `None` if no messages are pending
pub fn try_recv(handle: &mut RefreshHandle) -> Option<RefreshMessage> {
    handle.receiver.try_recv().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn token(c: char) -> String {
        std::iter::repeat(c).take(48).collect()
    }

    /// One window around `now()` holding `token`, one later window
    fn page(active: &str) -> String {
        format!(
            "2024-06-01 00:00:00 - 2024-06-02 00:00:00\n{active}\n\n2024-06-02 00:00:00 - 2024-06-03 00:00:00\n{}\n",
            token('Z')
        )
    }

    async fn serve(server: &MockServer, status: u16, body: String) {
        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(server)
            .await;
    }

    fn orchestrator(server: &MockServer, temp_dir: &TempDir) -> Orchestrator {
        let fetcher = Fetcher::new(server.uri(), Vec::new(), Duration::from_secs(5)).unwrap();
        Orchestrator::new(
            fetcher,
            CacheManager::with_dir(temp_dir.path().to_path_buf()),
            RefreshPolicy::default(),
            vec![Zone::Utc],
        )
    }

    fn done(outcome: RefreshOutcome) -> RefreshReport {
        match outcome {
            RefreshOutcome::Done(report) => report,
            RefreshOutcome::Busy => panic!("refresh unexpectedly busy"),
        }
    }

    #[tokio::test]
    async fn test_network_refresh_merges_and_records_success() {
        let server = MockServer::start().await;
        serve(&server, 200, page(&token('A'))).await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);

        let report = done(orch.refresh(now(), true).await);

        assert!(report.is_success());
        assert!(report.used_network);
        assert!(!report.changed, "first refresh never reports a change");
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.current_token(now()), Some(token('A').as_str()));

        let state = orch.refresh_state().await;
        assert_eq!(state.last_network_success, Some(now()));
        assert_eq!(state.last_zone.as_deref(), Some("UTC"));
        let stats = state.last_scrape.expect("scrape stats recorded");
        assert_eq!(stats.entries_scraped, 2);
        assert_eq!(stats.bytes, page(&token('A')).len());
        assert_eq!(orch.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_offline_refresh_returns_cache_without_fetching() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);

        let report = done(orch.refresh(now(), false).await);

        assert!(!report.used_network);
        assert!(report.entries.is_empty());
        assert!(orch.refresh_state().await.last_network_success.is_none());
    }

    #[tokio::test]
    async fn test_network_failure_serves_cache() {
        let server = MockServer::start().await;
        serve(&server, 200, page(&token('A'))).await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);
        done(orch.refresh(now(), true).await);

        serve(&server, 500, String::new()).await;
        let later = now() + ChronoDuration::hours(7);
        let report = done(orch.refresh(later, true).await);

        assert!(matches!(report.error, Some(RefreshError::Network(FetchError::Status(500)))));
        assert_eq!(report.entries.len(), 2);
        assert_eq!(
            orch.refresh_state().await.last_network_success,
            Some(now()),
            "failed fetch must not count as success"
        );
    }

    #[tokio::test]
    async fn test_changed_only_when_active_token_differs() {
        let server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);

        serve(&server, 200, page(&token('A'))).await;
        assert!(!done(orch.refresh(now(), true).await).changed);

        // Same token again
        assert!(!done(orch.refresh(now(), true).await).changed);

        // Same window, new token
        serve(&server, 200, page(&token('B'))).await;
        let report = done(orch.refresh(now(), true).await);
        assert!(report.changed);
        assert_eq!(report.current_token(now()), Some(token('B').as_str()));

        // Offline refresh with nothing new
        assert!(!done(orch.refresh(now(), false).await).changed);
    }

    #[tokio::test]
    async fn test_no_change_when_previous_token_missing() {
        let server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);

        serve(&server, 200, String::from("nothing yet")).await;
        done(orch.refresh(now(), true).await);

        serve(&server, 200, page(&token('A'))).await;
        let report = done(orch.refresh(now(), true).await);

        assert!(!report.changed);
        assert_eq!(report.current_token(now()), Some(token('A').as_str()));
    }

    #[tokio::test]
    async fn test_empty_page_still_records_network_success() {
        let server = MockServer::start().await;
        serve(&server, 200, String::from("<html>maintenance</html>")).await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);

        let report = done(orch.refresh(now(), true).await);

        assert!(report.is_success());
        assert!(report.entries.is_empty());
        assert_eq!(orch.refresh_state().await.last_network_success, Some(now()));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_single_flight() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(page(&token('A')))
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);

        let outcomes = futures::future::join_all(vec![
            orch.refresh(now(), true),
            orch.refresh(now(), true),
            orch.refresh(now(), true),
        ])
        .await;

        let busy = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, RefreshOutcome::Busy))
            .count();
        assert_eq!(busy, 2);
        assert_eq!(orch.phase(), Phase::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_policy_refreshes_fetch_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(page(&token('A')))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let orch = orch.clone();
                tokio::spawn(async move { orch.refresh_with_policy(now()).await })
            })
            .collect();
        let mut reports = Vec::new();
        for task in tasks {
            if let RefreshOutcome::Done(report) = task.await.unwrap() {
                reports.push(report);
            }
        }

        assert_eq!(reports.iter().filter(|report| report.used_network).count(), 1);
        for report in reports.iter().filter(|report| !report.used_network) {
            assert!(matches!(report.blocked, Some(Blocked::CoverageUntil(_))));
        }

        // Settled state: the one fetch is remembered and coverage blocks the next
        let report = done(orch.refresh_with_policy(now()).await);
        assert!(!report.used_network);
        assert_eq!(orch.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_policy_refresh_is_busy_while_fetch_in_flight() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(page(&token('A')))
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);

        let (forced, policy) = tokio::join!(orch.refresh_forced(now()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            orch.refresh_with_policy(now()).await
        });

        assert!(done(forced).used_network);
        assert!(matches!(policy, RefreshOutcome::Busy));
    }

    #[tokio::test]
    async fn test_policy_blocks_network_while_coverage_exists() {
        let server = MockServer::start().await;
        serve(&server, 200, page(&token('A'))).await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);
        assert!(orch.should_use_network(now()).await, "first run may fetch");
        done(orch.refresh_with_policy(now()).await);

        let later = now() + ChronoDuration::hours(1);
        let report = done(orch.refresh_with_policy(later).await);

        assert!(!report.used_network);
        assert_eq!(
            report.blocked,
            Some(Blocked::CoverageUntil(Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap()))
        );
        assert_eq!(orch.refresh_state().await.last_network_success, Some(now()));
    }

    #[tokio::test]
    async fn test_forced_refresh_bypasses_policy() {
        let server = MockServer::start().await;
        serve(&server, 200, page(&token('A'))).await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);
        done(orch.refresh(now(), true).await);

        let later = now() + ChronoDuration::hours(1);
        assert!(!orch.should_use_network(later).await);
        let report = done(orch.refresh_forced(later).await);

        assert!(report.used_network);
        assert_eq!(orch.refresh_state().await.last_network_success, Some(later));
    }

    #[tokio::test]
    async fn test_state_and_cache_survive_restart() {
        let server = MockServer::start().await;
        serve(&server, 200, page(&token('A'))).await;
        let temp_dir = TempDir::new().unwrap();
        done(orchestrator(&server, &temp_dir).refresh(now(), true).await);

        let reopened = orchestrator(&server, &temp_dir);

        assert_eq!(reopened.all_entries().await.len(), 2);
        assert_eq!(reopened.current_token(now()).await, Some(token('A')));
        assert_eq!(reopened.refresh_state().await.last_zone.as_deref(), Some("UTC"));
        assert!(!reopened.should_use_network(now()).await);
    }

    #[tokio::test]
    async fn test_purge_empties_cache() {
        let server = MockServer::start().await;
        serve(&server, 200, page(&token('A'))).await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);
        done(orch.refresh(now(), true).await);

        assert!(orch.purge().await.unwrap());

        assert!(orch.all_entries().await.is_empty());
        assert_eq!(orch.current_token(now()).await, None);
    }

    #[tokio::test]
    async fn test_handle_manual_trigger_completes() {
        let server = MockServer::start().await;
        serve(&server, 200, page(&token('A'))).await;
        let temp_dir = TempDir::new().unwrap();
        let orch = orchestrator(&server, &temp_dir);
        let mut handle = RefreshHandle::spawn(
            orch.clone(),
            SchedulerConfig {
                auto_refresh: false,
                run_initial: false,
            },
        );

        assert!(handle.request_refresh());
        let message = handle.receiver.recv().await.expect("message");

        match message {
            RefreshMessage::Completed { trigger, report } => {
                assert_eq!(trigger, Trigger::Manual);
                assert!(report.used_network);
                assert_eq!(report.entries.len(), 2);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_drops_trigger_while_in_flight() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(page(&token('A')))
                    .set_delay(Duration::from_millis(500)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let mut handle = RefreshHandle::spawn(
            orchestrator(&server, &temp_dir),
            SchedulerConfig {
                auto_refresh: false,
                run_initial: false,
            },
        );

        assert!(handle.force_refresh());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.force_refresh());

        let first = handle.receiver.recv().await.expect("first message");
        let second = handle.receiver.recv().await.expect("second message");

        assert!(matches!(first, RefreshMessage::Dropped(Trigger::Forced)));
        assert!(matches!(second, RefreshMessage::Completed { .. }));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_disabled_sends_nothing() {
        let server = MockServer::start().await;
        let temp_dir = TempDir::new().unwrap();
        let mut handle = RefreshHandle::spawn(
            orchestrator(&server, &temp_dir),
            SchedulerConfig {
                auto_refresh: false,
                run_initial: false,
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(try_recv(&mut handle).is_none());
        handle.shutdown().await;
    }
}
