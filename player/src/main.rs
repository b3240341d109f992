mod config;
mod error;
mod report;
mod session;

use crate::config::Settings;
use crate::error::PlayerError;
use crate::report::SessionReport;
use crate::session::Session;
use clap::Parser as ClapParser;
use std::process;
use std::sync::Arc;
use streaming::HttpTransport;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

#[derive(ClapParser, Debug)]
#[command(version)]
struct Cli {
    #[arg(short, long, default_value = "player.toml")]
    config: String,

    /// Write the session report here instead of the configured path
    #[arg(short, long)]
    report: Option<String>,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::Layer::default()
            .with_target(false)
            .with_thread_names(false)
            .with_ansi(true)
            .with_line_number(false)
            .with_file(false)
            .with_thread_ids(false),
    );
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Unable to set a global logger instance: {}", e);
        process::exit(1);
    }

    let cli = Cli::parse();
    let settings = match Settings::load(cli.config.as_str()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let runtime = match common::runtime::build(settings.runtime.threads) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create runtime: {}", e);
            process::exit(1);
        }
    };

    let report_path = cli.report.or_else(|| settings.report.path.clone());
    match runtime.block_on(start(settings, report_path)) {
        Ok(report) if report.is_failure() => {
            error!("session failed: {}", report.error.unwrap_or_default());
            process::exit(1);
        }
        Ok(_) => info!("done"),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

async fn start(
    settings: Settings,
    report_path: Option<String>,
) -> Result<SessionReport, PlayerError> {
    let notifier = Arc::new(Notify::new());
    common::signal::listen(notifier.clone())
        .map_err(|e| PlayerError::RuntimeError(format!("signal handler: {}", e)))?;

    info!(
        "playing {} streams from {}",
        settings.source.streams.len(),
        settings.source.base_url
    );
    let transport = Arc::new(HttpTransport::new(settings.download.timeout));
    let session = Session::new(Arc::new(settings), transport, notifier);
    let report = session.run().await?;

    if let Some(path) = report_path {
        report.write(&path).await?;
        info!("session report written to {}", path);
    }
    Ok(report)
}
