//! # tapin
//!
//! Command-line front end for facility check-in.
//!
//! ```bash
//! # Check in, pasting the tag's hex dump when prompted
//! tapin check-in
//!
//! # Check in with a tag dump from a file
//! tapin check-in --tag "$(cat tag.hex)"
//!
//! # Inspect what a tag decodes to
//! tapin decode D1010A5402656E534954452D3432
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing::{debug, info};

use tapin_core::{
    decode_record_set, default_config_path, CheckInCoordinator, CheckInOutcome, CheckInState,
    Config, DeviceIdentityStore, HttpVisitClient, JsonFileStore, Session, TagDriver, TagReader,
    TapinError,
};

mod console_reader;
mod logging;

use console_reader::{parse_tag_line, ConsoleTagDriver};

/// tapin - check in to a facility by tapping its tag
#[derive(Parser, Debug)]
#[command(name = "tapin", version, about)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSON logs to a daily file (TAPIN_LOG_DIR or the user data directory)
    #[arg(long, global = true)]
    production: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a facility tag and record a visit
    CheckIn {
        /// Tag dump to use instead of reading from stdin
        #[arg(long, value_name = "HEX")]
        tag: Option<String>,

        /// Member barcode, overriding configuration
        #[arg(long)]
        barcode: Option<String>,

        /// Member display name, overriding configuration
        #[arg(long)]
        name: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print this installation's device identity, creating it if needed
    DeviceId,

    /// Decode a tag dump or bare record payload
    Decode {
        /// Hex bytes of an NDEF message or a single record payload
        hex: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config path if no file exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.production, "warn")?;

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?
        .with_env_overrides();
    debug!(path = %config_path.display(), "Configuration loaded");

    match cli.command {
        Command::CheckIn {
            tag,
            barcode,
            name,
            json,
        } => check_in(config, tag, barcode, name, json).await,
        Command::DeviceId => device_id(&config),
        Command::Decode { hex, json } => decode(&hex, json),
        Command::Config { init } => show_config(&config, &config_path, init),
    }
}

async fn check_in(
    mut config: Config,
    tag: Option<String>,
    barcode: Option<String>,
    name: Option<String>,
    json: bool,
) -> Result<ExitCode> {
    if let Some(barcode) = barcode {
        config.member.barcode = barcode;
    }
    if let Some(name) = name {
        config.member.name = name;
    }
    config.validate().map_err(TapinError::from)?;
    if !config.member.is_configured() {
        bail!("No member barcode configured. Set member.barcode, TAPIN_BARCODE or --barcode.");
    }

    let session = Session::assemble(&identity_store(&config)?, &config.member.to_member())
        .map_err(TapinError::from)?;
    info!(device = %session.device_identity.abbreviated(), "Session ready");

    let client = HttpVisitClient::from_config(&config.service).map_err(TapinError::from)?;
    let driver: Arc<dyn TagDriver> = match tag {
        Some(hex) => Arc::new(ConsoleTagDriver::new(std::io::Cursor::new(hex.into_bytes())).quiet()),
        None => Arc::new(ConsoleTagDriver::new(BufReader::new(tokio::io::stdin()))),
    };
    let reader = TagReader::new(driver).with_scan_timeout(config.reader.scan_timeout());
    reader.check_supported().await;

    let coordinator = Arc::new(CheckInCoordinator::new(
        Arc::new(reader),
        Arc::new(client),
        config.service.api_version.clone(),
    ));

    let progress = tokio::spawn(report_progress(coordinator.subscribe(), json));
    let interrupt = tokio::spawn(cancel_on_interrupt(Arc::clone(&coordinator)));

    let outcome = coordinator
        .check_in(&session)
        .await
        .context("A check-in is already in progress")?;

    interrupt.abort();
    progress.abort();

    print_outcome(&outcome, json)?;
    Ok(ExitCode::from(exit_status(&outcome)))
}

/// Print progress lines to stderr as the attempt advances.
async fn report_progress(mut states: tokio::sync::watch::Receiver<CheckInState>, quiet: bool) {
    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        debug!(%state, "Check-in state changed");
        if quiet {
            continue;
        }
        match state {
            CheckInState::Validating => eprintln!("Checking access..."),
            CheckInState::CheckingIn => eprintln!("Recording visit..."),
            _ => {}
        }
    }
}

/// Cancel the scan on Ctrl-C. Network calls are left to finish.
async fn cancel_on_interrupt(coordinator: Arc<CheckInCoordinator>) {
    while tokio::signal::ctrl_c().await.is_ok() {
        if coordinator.cancel() {
            info!("Received Ctrl+C, scan cancelled");
        } else if coordinator.state().is_busy() {
            eprintln!("Waiting for the service to respond...");
        }
    }
}

fn print_outcome(outcome: &CheckInOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    println!("{}", outcome.title());
    for line in outcome.messages() {
        println!("  {line}");
    }
    Ok(())
}

const fn exit_status(outcome: &CheckInOutcome) -> u8 {
    match outcome {
        CheckInOutcome::Succeeded { .. } => 0,
        CheckInOutcome::Denied { .. } => 1,
        CheckInOutcome::Failed { .. } => 2,
    }
}

fn identity_store(config: &Config) -> Result<DeviceIdentityStore> {
    let data_dir = config.data_dir().map_err(TapinError::from)?;
    let store = JsonFileStore::in_dir(&data_dir);
    debug!(path = %store.path().display(), "Using device store");
    Ok(DeviceIdentityStore::new(Arc::new(store)))
}

fn device_id(config: &Config) -> Result<ExitCode> {
    let identity = identity_store(config)?
        .get_or_create()
        .map_err(TapinError::from)?;
    println!("{identity}");
    Ok(ExitCode::SUCCESS)
}

fn decode(hex: &str, json: bool) -> Result<ExitCode> {
    let Some(tag) = parse_tag_line(hex).context("Input is not valid hex")? else {
        bail!("Nothing to decode");
    };

    match decode_record_set(&tag) {
        Ok(decoded) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&decoded)?);
            } else {
                println!("Site token: {}", decoded.token);
                println!("Strategy:   {}", decoded.strategy);
                if let Some(primary) = &decoded.primary_error {
                    println!("Text record error: {primary}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let err = TapinError::from(e);
            eprintln!("{err} ({})", err.error_code());
            Ok(ExitCode::from(2))
        }
    }
}

fn show_config(config: &Config, path: &std::path::Path, init: bool) -> Result<ExitCode> {
    if init {
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        config.save(path).map_err(TapinError::from)?;
        eprintln!("Wrote {}", path.display());
    }

    print!("{}", toml::to_string_pretty(config)?);
    if let Err(e) = config.validate() {
        eprintln!("Warning: {}", TapinError::from(e));
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tapin_core::{AttemptPhase, FailureKind};

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_in_flags() {
        let cli = Cli::parse_from([
            "tapin",
            "--config",
            "/tmp/tapin.toml",
            "check-in",
            "--barcode",
            "26782701",
            "--json",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/tapin.toml")));
        match cli.command {
            Command::CheckIn { barcode, json, .. } => {
                assert_eq!(barcode.as_deref(), Some("26782701"));
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_exit_codes() {
        let denied = CheckInOutcome::Denied {
            messages: vec![],
            phase: AttemptPhase::Validating,
        };
        let failed = CheckInOutcome::Failed {
            kind: FailureKind::ScanCancelled,
            phase: AttemptPhase::Scanning,
            detail: String::new(),
        };
        assert_eq!(exit_status(&denied), 1);
        assert_eq!(exit_status(&failed), 2);
    }
}
