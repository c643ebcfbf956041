//! Command-line interface parsing for fctoken
//!
//! Global flags override the configuration file; the subcommand picks what
//! to do. Without a subcommand the active token is printed.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::config::Config;
use crate::data::Zone;

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The specified timezone is not recognized
    #[error("Invalid timezone: '{0}'. Use UTC, local, or an IANA name such as America/Chicago")]
    InvalidTimezone(String),
}

/// fctoken - keep a local cache of time-windowed activation codes
#[derive(Parser, Debug)]
#[command(name = "fctoken")]
#[command(about = "Fetches, caches and shows time-windowed activation codes")]
#[command(version)]
pub struct Cli {
    /// Read configuration from this file instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Page to scrape
    #[arg(long, global = true, value_name = "URL")]
    pub url: Option<String>,

    /// Zone the page timestamps are printed in
    ///
    /// Accepts UTC, local, or an IANA name. Overrides the config file and
    /// the TIMEZONE environment variable.
    #[arg(long, global = true, value_name = "ZONE", value_parser = parse_zone_arg)]
    pub timezone: Option<Zone>,

    /// Directory holding codes.json and state.json
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the active code (exit code 1 if there is none)
    Current,
    /// Print every cached window, marking the active one
    List,
    /// Run one refresh and report what happened
    Refresh {
        /// Contact the page even if the throttle says no
        #[arg(long)]
        force: bool,
    },
    /// Show refresh bookkeeping and schedule
    Status,
    /// Delete every cached code
    Purge,
    /// Keep refreshing in the background and print each new code until Ctrl-C
    Watch,
    /// Check the parsing pipeline against a built-in sample page
    SelfTest,
}

/// Parses a timezone argument
///
/// # Arguments
/// * `s` - The zone string from the command line
///
/// # Returns
/// * `Ok(Zone)` for `UTC`, `local` or a known IANA zone
/// * `Err(CliError::InvalidTimezone)` otherwise
pub fn parse_zone_arg(s: &str) -> Result<Zone, CliError> {
    s.parse().map_err(|_| CliError::InvalidTimezone(s.to_string()))
}

impl Cli {
    /// The requested command, `current` when none was given
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Current)
    }

    /// Applies the global flags on top of a loaded configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(url) = &self.url {
            config.source_url = url.clone();
        }
        if let Some(zone) = self.timezone {
            config.source_timezone = zone.identity();
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = Some(dir.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_zone_arg_accepts_known_names() {
        assert_eq!(parse_zone_arg("utc").unwrap(), Zone::Utc);
        assert_eq!(parse_zone_arg("UTC").unwrap(), Zone::Utc);
        assert_eq!(parse_zone_arg("local").unwrap(), Zone::Local);
        assert_eq!(
            parse_zone_arg("Asia/Shanghai").unwrap(),
            Zone::Named(chrono_tz::Asia::Shanghai)
        );
    }

    #[test]
    fn test_parse_zone_arg_invalid() {
        let result = parse_zone_arg("Mars/Olympus");
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Invalid timezone"));
        assert!(err.to_string().contains("Mars/Olympus"));
    }

    #[test]
    fn test_cli_parse_no_args_defaults_to_current() {
        let cli = Cli::parse_from(["fctoken"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.command(), Command::Current);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_parse_refresh_force() {
        let cli = Cli::parse_from(["fctoken", "refresh", "--force"]);
        assert_eq!(cli.command(), Command::Refresh { force: true });

        let cli = Cli::parse_from(["fctoken", "refresh"]);
        assert_eq!(cli.command(), Command::Refresh { force: false });
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["fctoken", "list", "--timezone", "UTC", "-v"]);
        assert_eq!(cli.command(), Command::List);
        assert_eq!(cli.timezone, Some(Zone::Utc));
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_rejects_invalid_timezone() {
        let result = Cli::try_parse_from(["fctoken", "--timezone", "Nowhere/Land"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let cli = Cli::parse_from([
            "fctoken",
            "--url",
            "http://localhost:1/page",
            "--timezone",
            "Europe/Berlin",
            "--cache-dir",
            "/tmp/fctoken-cli",
            "status",
        ]);
        let mut config = Config::default();

        cli.apply_overrides(&mut config);

        assert_eq!(config.source_url, "http://localhost:1/page");
        assert_eq!(config.source_timezone, "Europe/Berlin");
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/fctoken-cli")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_overrides_without_flags_keeps_config() {
        let cli = Cli::parse_from(["fctoken", "purge"]);
        let mut config = Config::default();

        cli.apply_overrides(&mut config);

        assert_eq!(config, Config::default());
    }
}
