use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use vidrelay::cloud::CloudinaryClient;
use vidrelay::config::Config;
use vidrelay::ledger::Ledger;
use vidrelay::pipeline::{
    DedupCache, DeliveryStrategist, Dispatcher, MediaFetcher, RetentionSweeper, ShareResolver, YtDlp, sweeper,
};
use vidrelay::server::{self, AppState};
use vidrelay::whatsapp::WahaClient;

const SWEEPER_GRACE: Duration = Duration::from_secs(10);

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Cancelled on SIGINT or SIGTERM.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    info!("Received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received Ctrl+C, shutting down");
        }

        token_clone.cancel();
    });

    token
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "vidrelay.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::never(&log_dir, "vidrelay.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(env_filter(&config.log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter(&config.log_level)),
        )
        .init();

    info!("🚀 Starting vidrelay...");
    info!("Loaded config from {}", config.config_path.display());
    if config.dev_mode {
        info!("DEV mode enabled");
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.download_dir)?;
    let credentials = config.write_credentials()?;

    let ledger = Ledger::open(&config.database_path)?;
    let messenger = Arc::new(WahaClient::new(
        config.waha_base_url.clone(),
        config.waha_session_name.clone(),
        config.waha_api_key.clone(),
    )?);
    let cloud = Arc::new(CloudinaryClient::new(
        config.cloudinary.clone(),
        config.cloudinary_folder.clone(),
    )?);
    let fetcher = Arc::new(MediaFetcher::new(
        Arc::new(YtDlp::new(config.ytdlp_path.clone())),
        ShareResolver::new(1000..=3000)?,
        credentials,
        config.download_dir.clone(),
        Duration::from_secs(config.download_timeout_seconds),
    ));

    let strategist = DeliveryStrategist::new(messenger.clone(), cloud.clone(), config.cloudinary_retention_hours);
    let dispatcher = Arc::new(Dispatcher::new(
        DedupCache::default(),
        fetcher.clone(),
        messenger.clone(),
        strategist,
        ledger.clone(),
        config.max_file_size_mb,
    ));

    let shutdown = install_signal_handler();

    let sweeper_token = CancellationToken::new();
    let sweeper_handle = RetentionSweeper::new(
        cloud,
        ledger.clone(),
        config.cloudinary_folder.clone(),
        config.download_dir.clone(),
        config.cloudinary_retention_hours,
        config.file_retention_hours,
        Duration::from_secs(config.cleanup_interval_minutes * 60),
    )
    .spawn(sweeper_token.clone());

    let state = AppState {
        dispatcher,
        messenger,
        fetcher,
        ledger,
        verify_token: config.verify_token.clone(),
        dev_mode: config.dev_mode,
    };

    let addr = format!("{}:{}", config.host, config.port);
    let served = server::serve(&addr, state, shutdown).await;

    sweeper::stop(&sweeper_token, sweeper_handle, SWEEPER_GRACE).await;
    info!("👋 Shutdown complete");

    served.map_err(Into::into)
}
