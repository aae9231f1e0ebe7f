// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tailex::agent::{Agent, AgentConfig};
use tailex::watcher::{WatchMode, WatcherConfig};

#[derive(Debug, Parser)]
#[command(
    name = "tailex",
    version,
    about = "Tails log files and extracts metrics with small match-and-count programs"
)]
struct Cli {
    /// Directory containing metric programs (*.dsl)
    #[arg(long, env = "TAILEX_PROGS")]
    progs: Option<PathBuf>,

    /// Glob patterns of log files to tail (repeatable, comma-separated)
    #[arg(long, env = "TAILEX_LOGS", value_delimiter = ',')]
    logs: Vec<String>,

    /// Interval between full re-read passes over tracked files; 0 relies
    /// on filesystem events alone
    #[arg(long, env = "TAILEX_POLL_INTERVAL", default_value = "250ms")]
    poll_interval: humantime::Duration,

    /// Read each matched file to EOF, print the metrics, exit
    #[arg(long, env = "TAILEX_ONE_SHOT", default_value = "false")]
    one_shot: bool,

    /// Metric exposition port
    #[arg(long, env = "TAILEX_PORT", default_value = "3903")]
    port: u16,

    /// Bind address for the exposition endpoint
    #[arg(long, env = "TAILEX_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: String,

    /// Filesystem watch backend: auto, native, or poll
    #[arg(long, env = "TAILEX_WATCH_MODE", default_value = "auto", value_parser = parse_watch_mode)]
    watch_mode: WatchMode,

    /// Log level filter (tracing EnvFilter syntax)
    #[arg(long, env = "TAILEX_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn parse_watch_mode(s: &str) -> Result<WatchMode, String> {
    s.parse()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let poll_interval: Duration = cli.poll_interval.into();

    let exposition_addr = if cli.one_shot {
        None
    } else {
        match format!("{}:{}", cli.bind_address, cli.port).parse::<SocketAddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                error!("invalid bind address: {}", e);
                return ExitCode::FAILURE;
            }
        }
    };

    let config = AgentConfig {
        progs_dir: cli.progs,
        log_patterns: cli.logs,
        poll_interval,
        one_shot: cli.one_shot,
        exposition_addr,
        watch: WatcherConfig {
            mode: cli.watch_mode,
            // the watcher needs a real scan interval even when the
            // tailer's own poll pass is disabled
            poll_interval: if poll_interval.is_zero() {
                Duration::from_millis(250)
            } else {
                poll_interval
            },
            ..WatcherConfig::default()
        },
        ..AgentConfig::default()
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    info!(version = env!("CARGO_PKG_VERSION"), "starting tailex");

    match Agent::new(config).run(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
fn spawn_signal_handler(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGINT handler: {}", e);
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                return;
            }
        };

        select! {
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        cancel.cancel();
    });
}

#[cfg(not(unix))]
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down");
        }
        cancel.cancel();
    });
}
