//! fctoken - keep a local cache of time-windowed activation codes
//!
//! Scrapes the activation code page at most as often as the throttle
//! allows, keeps every still-valid code on disk and prints the active one.

use std::io::{self, Write};

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fctoken::app::{self_test, App, Exit};
use fctoken::cli::{Cli, Command};
use fctoken::config::Config;

/// Environment variable holding the log filter
const LOG_ENV: &str = "FCTOKEN_LOG";

/// Logs go to stderr so stdout stays usable in scripts
fn init_tracing(verbose: bool) {
    let default = if verbose { "fctoken=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(&cli).await {
        Ok(exit) => exit.code(),
        Err(err) => {
            eprintln!("Error: {err}");
            2
        }
    };
    if code != 0 {
        std::process::exit(i32::from(code));
    }
}

async fn run(cli: &Cli) -> Result<Exit, Box<dyn std::error::Error>> {
    let command = cli.command();
    let mut stdout = io::stdout();

    // Needs neither config nor cache
    let exit = if command == Command::SelfTest {
        self_test(Utc::now(), &mut stdout)?
    } else {
        let mut config = Config::load(cli.config.as_deref())?;
        cli.apply_overrides(&mut config);
        config.validate()?;

        let app = App::new(&config)?;
        app.run(&command, &mut stdout).await?
    };

    stdout.flush()?;
    Ok(exit)
}
