//! mqtt-exporter - MQTT のトピック値を Prometheus に公開する
//!
//! スケジューラはメインスレッドで回す。tokio ランタイムは HTTP サーバーと
//! シグナル待ちのためだけに使う。

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use exporter_core::impls::RumqttTransport;
use exporter_core::{Configuration, Exporter, ShutdownHandle, ShutdownOutcome};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Expose MQTT topic values as Prometheus gauges
#[derive(Parser, Debug)]
#[command(name = "mqtt-exporter", version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Default log level; RUST_LOG overrides it
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("exporter failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = Configuration::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    info!(path = %cli.config.display(), "configuration loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("exporter-io")
        .build()
        .context("building tokio runtime")?;

    let exporter = Exporter::build(
        config,
        runtime.handle().clone(),
        Arc::new(RumqttTransport::new()),
    )?;
    watch_signals(&runtime, exporter.shutdown_handle())?;

    exporter.run().context("running scheduler")?;

    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    info!("bye");
    Ok(ExitCode::SUCCESS)
}

/// First SIGINT/SIGTERM starts an orderly shutdown; the second one exits hard.
fn watch_signals(runtime: &tokio::runtime::Runtime, shutdown: ShutdownHandle) -> Result<()> {
    #[cfg(unix)]
    let mut terminate = {
        let _guard = runtime.enter();
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?
    };

    runtime.spawn(async move {
        loop {
            #[cfg(unix)]
            let terminate = terminate.recv();
            #[cfg(not(unix))]
            let terminate = std::future::pending::<Option<()>>();

            tokio::select! {
                result = signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "can't listen for Ctrl+C");
                        return;
                    }
                    info!("Received SIGINT (Ctrl+C)");
                }
                _ = terminate => {
                    info!("Received SIGTERM");
                }
            }

            if shutdown.shutdown() == ShutdownOutcome::Forced {
                warn!("second signal; exiting without cleanup");
                std::process::exit(1);
            }
        }
    });
    Ok(())
}
