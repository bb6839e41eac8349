use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_ingest::config::IngestConfig;
use stream_ingest::shutdown::Shutdown;
use stream_ingest::state::AppState;
use stream_ingest::utils::bind_tcp_listener;
use stream_ingest::web;
use stream_ingest::webrtc::IngestApi;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// stream-ingest command line arguments
#[derive(Parser, Debug)]
#[command(name = "stream-ingest")]
#[command(version, about = "WHIP/WHEP ingest with HLS egress", long_about = None)]
struct CliArgs {
    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, env = "INGEST_LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    ingest: IngestConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting stream-ingest v{}", env!("CARGO_PKG_VERSION"));

    let config = args.ingest;
    let http_addr = config
        .http_addr()
        .map_err(|e| anyhow::anyhow!("Invalid HTTP address: {}", e))?;

    let api = IngestApi::new(config.webrtc_config())?;
    tracing::info!("ICE UDP mux listening on {}", api.udp_addr());

    let shutdown = Arc::new(Shutdown::new());
    let state = AppState::new(&config, api, shutdown.clone());
    let app = web::create_router(state.clone());

    let listener = tokio::net::TcpListener::from_std(bind_tcp_listener(http_addr)?)?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let stop = shutdown.token();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(stop))
        .await;

    shutdown.trigger();
    if let Err(e) = result {
        tracing::error!("HTTP server error: {}", e);
        return Err(e.into());
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Resolves on CTRL+C, SIGTERM or a process shutdown (fail-fast)
async fn shutdown_signal(stop: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Shutdown signal received"),
        _ = terminate => tracing::info!("SIGTERM received"),
        _ = stop.cancelled() => tracing::info!("Ingest session ended, shutting down"),
    }
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "stream_ingest=error,tower_http=error",
        LogLevel::Warn => "stream_ingest=warn,tower_http=warn",
        LogLevel::Info => "stream_ingest=info,tower_http=info",
        LogLevel::Verbose => "stream_ingest=debug,tower_http=info",
        LogLevel::Debug => "stream_ingest=debug,tower_http=debug",
        LogLevel::Trace => "stream_ingest=trace,tower_http=debug,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
