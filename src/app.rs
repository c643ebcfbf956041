//! Command execution for fctoken
//!
//! Each subcommand is a thin view over the refresh orchestrator. Output goes
//! to any `Write` so commands can be exercised without a terminal.

use std::future::Future;
use std::io::Write;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::debug;

use crate::cache::PersistError;
use crate::cli::Command;
use crate::config::Config;
use crate::data::{coverage_end, current_token, resolve, Entry, Zone, ZoneMemory, TIMESTAMP_FORMAT};
use crate::policy::{format_interval, Blocked, RefreshPolicy};
use crate::refresh::{
    Orchestrator, RefreshHandle, RefreshMessage, RefreshOutcome, RefreshReport, SchedulerConfig, SetupError,
};

/// How often `watch` re-reads the cache for a window rollover
const WATCH_TICK_SECS: u64 = 60;

/// Errors that abort a command
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("Another refresh is already running")]
    Busy,

    #[error("Self-test failed: {0}")]
    SelfTest(String),
}

/// How a command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    /// `current` found no active code
    NoToken,
}

impl Exit {
    /// Process exit code
    pub fn code(self) -> u8 {
        match self {
            Exit::Success => 0,
            Exit::NoToken => 1,
        }
    }
}

/// Runs subcommands against one orchestrator
pub struct App {
    orchestrator: Orchestrator,
    auto_refresh: bool,
}

impl App {
    /// Builds the orchestrator described by `config`
    pub fn new(config: &Config) -> Result<Self, AppError> {
        Ok(Self::with_orchestrator(
            Orchestrator::from_config(config)?,
            config.auto_refresh,
        ))
    }

    /// Wraps an existing orchestrator
    pub fn with_orchestrator(orchestrator: Orchestrator, auto_refresh: bool) -> Self {
        Self {
            orchestrator,
            auto_refresh,
        }
    }

    /// Runs `command` at the current time
    pub async fn run<W: Write>(&self, command: &Command, out: &mut W) -> Result<Exit, AppError> {
        self.execute(command, Utc::now(), out).await
    }

    /// Runs a one-shot `command` as if it were `now`
    ///
    /// `watch` runs against the wall clock until the process is interrupted.
    pub async fn execute<W: Write>(
        &self,
        command: &Command,
        now: DateTime<Utc>,
        out: &mut W,
    ) -> Result<Exit, AppError> {
        match command {
            Command::Current => self.current(now, out).await,
            Command::List => self.list(now, out).await,
            Command::Refresh { force } => self.refresh(now, *force, out).await,
            Command::Status => self.status(now, out).await,
            Command::Purge => self.purge(out).await,
            Command::Watch => {
                let stop = async {
                    let _ = tokio::signal::ctrl_c().await;
                };
                self.watch(out, stop).await
            }
            Command::SelfTest => self_test(now, out),
        }
    }

    async fn current<W: Write>(&self, now: DateTime<Utc>, out: &mut W) -> Result<Exit, AppError> {
        let report = finished(self.orchestrator.refresh_with_policy(now).await)?;
        match report.current_token(now) {
            Some(token) => {
                writeln!(out, "{token}")?;
                Ok(Exit::Success)
            }
            None => {
                writeln!(out, "No active code")?;
                Ok(Exit::NoToken)
            }
        }
    }

    async fn list<W: Write>(&self, now: DateTime<Utc>, out: &mut W) -> Result<Exit, AppError> {
        let report = finished(self.orchestrator.refresh_with_policy(now).await)?;
        let visible: Vec<&Entry> = report
            .entries
            .iter()
            .filter(|entry| entry.is_current_or_future(now))
            .collect();

        if visible.is_empty() {
            writeln!(out, "No cached codes")?;
            return Ok(Exit::Success);
        }
        for entry in visible {
            let marker = if entry.contains(now) { '*' } else { ' ' };
            writeln!(out, "{marker} {}", entry.display_line())?;
        }
        Ok(Exit::Success)
    }

    async fn refresh<W: Write>(&self, now: DateTime<Utc>, force: bool, out: &mut W) -> Result<Exit, AppError> {
        let outcome = if force {
            self.orchestrator.refresh_forced(now).await
        } else {
            self.orchestrator.refresh_with_policy(now).await
        };
        let report = finished(outcome)?;

        if let Some(reason) = report.blocked {
            writeln!(out, "{}", describe_block(reason, now))?;
        }
        match (&report.error, report.used_network) {
            (Some(err), _) => writeln!(out, "{err}; serving {} cached codes", report.entries.len())?,
            (None, true) => writeln!(out, "Fetched page: {} codes cached", report.entries.len())?,
            (None, false) => writeln!(out, "Using cache: {} codes cached", report.entries.len())?,
        }
        match report.current_token(now) {
            Some(token) => writeln!(out, "Active code: {token}")?,
            None => writeln!(out, "No active code")?,
        }
        Ok(Exit::Success)
    }

    async fn status<W: Write>(&self, now: DateTime<Utc>, out: &mut W) -> Result<Exit, AppError> {
        let entries = self.orchestrator.all_entries().await;
        let state = self.orchestrator.refresh_state().await;
        let policy: RefreshPolicy = self.orchestrator.policy();
        let zones: Vec<String> = self
            .orchestrator
            .candidates()
            .iter()
            .map(Zone::identity)
            .collect();

        writeln!(out, "Source:             {}", self.orchestrator.source_url())?;
        writeln!(out, "Candidate zones:    {}", zones.join(", "))?;
        writeln!(
            out,
            "Last winning zone:  {}",
            state.last_zone.as_deref().unwrap_or("none yet")
        )?;

        let live = entries.iter().filter(|entry| entry.is_current_or_future(now)).count();
        writeln!(out, "Cached codes:       {live}")?;
        writeln!(
            out,
            "Active code:        {}",
            current_token(now, &entries).unwrap_or("none")
        )?;
        match coverage_end(now, &entries) {
            Some(end) => writeln!(out, "Coverage until:     {}", describe_moment(end, now))?,
            None => writeln!(out, "Coverage until:     none")?,
        }

        match state.last_network_success {
            Some(at) => writeln!(out, "Last fetch:         {}", describe_moment(at, now))?,
            None => writeln!(out, "Last fetch:         never")?,
        }
        match policy.block_reason(now, &entries, state.last_network_success) {
            None => writeln!(out, "Next fetch allowed: now")?,
            Some(Blocked::CoverageUntil(until)) => {
                writeln!(out, "Next fetch allowed: after coverage ends ({})", describe_moment(until, now))?
            }
            Some(Blocked::Floor { next_allowed }) => {
                writeln!(out, "Next fetch allowed: {}", describe_moment(next_allowed, now))?
            }
        }
        if self.auto_refresh {
            let next = policy.next_auto_refresh(now, &entries);
            writeln!(out, "Next auto refresh:  {}", describe_moment(next, now))?;
        } else {
            writeln!(out, "Next auto refresh:  disabled")?;
        }

        if let Some(scrape) = &state.last_scrape {
            writeln!(
                out,
                "Last scrape:        {} entries, {} bytes, {} ms as {}",
                scrape.entries_scraped, scrape.bytes, scrape.duration_ms, scrape.identity_label
            )?;
        }
        Ok(Exit::Success)
    }

    async fn purge<W: Write>(&self, out: &mut W) -> Result<Exit, AppError> {
        if !self.orchestrator.purge().await? {
            return Err(AppError::Busy);
        }
        writeln!(out, "Cache cleared")?;
        Ok(Exit::Success)
    }

    /// Runs the background scheduler until `stop` resolves
    ///
    /// Prints a line whenever the active code differs from the last one
    /// printed, including the first time one is known. The cache is also
    /// re-read every minute so window rollovers show up between refreshes.
    pub async fn watch<W, F>(&self, out: &mut W, stop: F) -> Result<Exit, AppError>
    where
        W: Write,
        F: Future<Output = ()>,
    {
        let mut handle = RefreshHandle::spawn(
            self.orchestrator.clone(),
            SchedulerConfig {
                auto_refresh: self.auto_refresh,
                run_initial: true,
            },
        );
        let mut tick = tokio::time::interval(StdDuration::from_secs(WATCH_TICK_SECS));
        let mut announced: Option<String> = None;
        tokio::pin!(stop);

        let result = loop {
            tokio::select! {
                _ = &mut stop => break Ok(()),
                message = handle.receiver.recv() => {
                    let Some(message) = message else { break Ok(()) };
                    match message {
                        RefreshMessage::Completed { trigger, report } => {
                            debug!(?trigger, used_network = report.used_network, "refresh completed");
                            let now = Utc::now();
                            let token = report.current_token(now).map(str::to_owned);
                            if let Err(err) = announce(out, &mut announced, token, now) {
                                break Err(err);
                            }
                        }
                        RefreshMessage::Dropped(trigger) => debug!(?trigger, "refresh trigger dropped"),
                    }
                }
                _ = tick.tick() => {
                    let now = Utc::now();
                    let token = self.orchestrator.current_token(now).await;
                    if let Err(err) = announce(out, &mut announced, token, now) {
                        break Err(err);
                    }
                }
            }
        };

        handle.shutdown().await;
        result?;
        Ok(Exit::Success)
    }
}

fn finished(outcome: RefreshOutcome) -> Result<RefreshReport, AppError> {
    match outcome {
        RefreshOutcome::Done(report) => Ok(report),
        RefreshOutcome::Busy => Err(AppError::Busy),
    }
}

fn announce<W: Write>(
    out: &mut W,
    announced: &mut Option<String>,
    token: Option<String>,
    now: DateTime<Utc>,
) -> std::io::Result<()> {
    if *announced == token {
        return Ok(());
    }
    let stamp = now.format(TIMESTAMP_FORMAT);
    match &token {
        Some(token) => writeln!(out, "{stamp} {token}")?,
        None => writeln!(out, "{stamp} no active code")?,
    }
    out.flush()?;
    *announced = token;
    Ok(())
}

/// `2024-06-01 12:00:00 UTC (in 5h)` or `(3h ago)`
fn describe_moment(moment: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let stamp = moment.format(TIMESTAMP_FORMAT);
    if moment >= now {
        format!("{stamp} UTC (in {})", format_interval(moment - now))
    } else {
        format!("{stamp} UTC ({} ago)", format_interval(now - moment))
    }
}

fn describe_block(reason: Blocked, now: DateTime<Utc>) -> String {
    match reason {
        Blocked::CoverageUntil(until) => format!(
            "Cached codes are valid until {}; not contacting the page",
            describe_moment(until, now)
        ),
        Blocked::Floor { next_allowed } => format!(
            "Fetched recently; next network refresh allowed at {}",
            describe_moment(next_allowed, now)
        ),
    }
}

/// Tokens used by the built-in sample page
const SAMPLE_TOKENS: [&str; 3] = [
    "Q2hlY2tpbmctdGhlLXBpcGVsaW5lLWFjdGl2ZS10b2tlbi0wMQ",
    "TmV4dC13aW5kb3ctdG9rZW4tZm9yLXRoZS1zZWxmLXRlc3QtMDI",
    "TGFzdC13aW5kb3ctdG9rZW4tZm9yLXRoZS1zZWxmLXRlc3QtMDM",
];

/// Renders a page shaped like the real one, with windows around `now`
///
/// The active token is wrapped across two lines the way the page renderer
/// sometimes does, and markup noise sits between blocks.
pub fn sample_page(now: DateTime<Utc>) -> String {
    let windows = [
        (now - Duration::minutes(30), now + Duration::minutes(30)),
        (now + Duration::minutes(30), now + Duration::days(1)),
        (now + Duration::days(1), now + Duration::days(2)),
    ];
    let (head, tail) = SAMPLE_TOKENS[0].split_at(30);

    let mut page = String::from("<html><body>\n<h1>Activation codes</h1>\n");
    for (i, (start, end)) in windows.iter().enumerate() {
        page.push_str(&format!(
            "{} - {}\n",
            start.format(TIMESTAMP_FORMAT),
            end.format(TIMESTAMP_FORMAT)
        ));
        if i == 0 {
            page.push_str(&format!("<div>{head}\n{tail}</div>\n"));
        } else {
            page.push_str(&format!("<div>{}</div>\n", SAMPLE_TOKENS[i]));
        }
        page.push('\n');
    }
    page.push_str("</body></html>\n");
    page
}

/// Checks parsing, zone resolution and the throttle on the sample page
///
/// Runs entirely offline and touches neither the cache nor the network.
pub fn self_test<W: Write>(now: DateTime<Utc>, out: &mut W) -> Result<Exit, AppError> {
    let page = sample_page(now);

    let entries = Zone::Utc.parse_entries(&page);
    if entries.len() != SAMPLE_TOKENS.len() {
        return Err(AppError::SelfTest(format!(
            "expected {} entries, parsed {}",
            SAMPLE_TOKENS.len(),
            entries.len()
        )));
    }
    writeln!(out, "ok  parse: {} entries", entries.len())?;

    // A zone eleven hours behind UTC pushes every window into the future
    let candidates = [Zone::Named(chrono_tz::Pacific::Pago_Pago), Zone::Utc];
    let mut memory = ZoneMemory::default();
    let resolution = resolve(&page, now, &candidates, &mut memory);
    if resolution.zone != Some(Zone::Utc) {
        return Err(AppError::SelfTest(format!(
            "expected UTC to win zone resolution, got {:?}",
            resolution.zone.map(|zone| zone.identity())
        )));
    }
    writeln!(out, "ok  resolve: {} wins", Zone::Utc)?;

    let active = current_token(now, &resolution.entries);
    if active != Some(SAMPLE_TOKENS[0]) {
        return Err(AppError::SelfTest(format!(
            "expected the wrapped token to be active, got {active:?}"
        )));
    }
    writeln!(out, "ok  active: {}", SAMPLE_TOKENS[0])?;

    let blocked = RefreshPolicy::default().block_reason(now, &resolution.entries, Some(now));
    if !matches!(blocked, Some(Blocked::CoverageUntil(_))) {
        return Err(AppError::SelfTest(format!(
            "expected coverage to block the network, got {blocked:?}"
        )));
    }
    writeln!(out, "ok  policy: coverage blocks the network")?;

    writeln!(out, "self-test passed")?;
    Ok(Exit::Success)
}
