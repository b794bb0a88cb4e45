//! keelctl - lifecycle orchestrator CLI
//!
//! Parses the command line, sets up logging, and runs the selected command on
//! a blocking thread while a signal watcher covers the stack-down window.

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use keel_common::emergency;
use keel_common::KeelConfig;
use keelctl::cli::Cli;
use keelctl::commands::{self, Session};
use keelctl::errors::{exit_code_for, remediation_for, EXIT_INTERRUPTED, EXIT_INVALID, EXIT_SUCCESS};
use keelctl::{logging, output};
use tracing::{debug, error, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_SUCCESS,
                _ => EXIT_INVALID,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let paths = cli.paths();
    let config = match KeelConfig::load(&cli.config_path(&paths)) {
        Ok(config) => config,
        Err(e) => {
            output::display_error(&e.to_string());
            std::process::exit(e.exit_code());
        }
    };
    logging::init(cli.verbose, &config.logging.level);
    debug!("keelctl v{} with state under {}", env!("CARGO_PKG_VERSION"), paths.state_dir.display());

    tokio::spawn(watch_signals());

    let session = Session::system(paths, config, cli.json);
    let command = cli.command.clone();
    let outcome = tokio::task::spawn_blocking(move || commands::dispatch(&command, &session)).await;

    let code = match outcome {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            output::display_error(&format!("{:#}", e));
            if let Some(remediation) = remediation_for(&e) {
                output::display_remediation(&remediation);
            }
            exit_code_for(&e)
        }
        Err(join) => {
            error!("Command thread died: {}", join);
            exit_code_for(&join.into())
        }
    };
    std::process::exit(code);
}

/// Restart whatever an interrupted operation had stopped, then exit
async fn watch_signals() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupted();
                }
                return;
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_err() {
                    return;
                }
            }
            _ = terminate.recv() => {}
        }
        interrupted();
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted();
        }
    }
}

fn interrupted() {
    warn!("Interrupted");
    let restarted = emergency::restart_if_armed();
    if restarted > 0 {
        output::display_warning("Interrupted while services were down; emergency restart issued");
    }
    std::process::exit(EXIT_INTERRUPTED);
}
