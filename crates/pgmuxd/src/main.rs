//! pgmuxd: the pgmux daemon.
//!
//! Loads and validates a `pgmux.toml`, logs the resulting configuration,
//! and can probe every configured server through the connect state
//! machine.
//!
//! # Usage
//!
//! ```text
//! pgmuxd check --config /etc/pgmux/pgmux.toml
//! pgmuxd probe --config /etc/pgmux/pgmux.toml --timeout-ms 2000
//! ```

mod probe;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use pgmux_scheme::{Scheme, Topology};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pgmuxd", about = "PostgreSQL connection pooler")]
struct Cli {
    /// Log line format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a configuration file and print the resulting configuration.
    Check {
        /// Configuration file.
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Validate, then connect once to every configured server.
    Probe {
        /// Configuration file.
        #[arg(long, short)]
        config: PathBuf,

        /// Per-server connect timeout in milliseconds; 0 waits indefinitely.
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,
    },
}

impl Command {
    fn config(&self) -> &Path {
        match self {
            Command::Check { config } | Command::Probe { config, .. } => config,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // The scheme decides the default log level, so it is read before
    // logging starts and its errors are reported right after.
    let loaded = Scheme::load(cli.command.config());
    let log_debug = loaded.as_ref().is_ok_and(|scheme| scheme.log_debug);
    init_tracing(cli.log_format, log_debug);

    let topology = match loaded.and_then(|scheme| scheme.validate()) {
        Ok(topology) => Arc::new(topology),
        Err(err) => {
            error!("{err}");
            return Ok(ExitCode::FAILURE);
        }
    };

    match cli.command {
        Command::Check { .. } => {
            log_dump(&topology);
            Ok(ExitCode::SUCCESS)
        }
        Command::Probe { timeout_ms, .. } => {
            if topology.log_config {
                log_dump(&topology);
            }
            let report = probe::run(topology, Duration::from_millis(timeout_ms)).await?;
            info!(
                servers = report.servers,
                failed = report.failed,
                "probe finished"
            );
            Ok(if report.failed == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn init_tracing(format: LogFormat, log_debug: bool) {
    let default = if log_debug { "info,pgmux=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn log_dump(topology: &Topology) {
    for line in topology.dump() {
        info!("{line}");
    }
}
