use clap::Parser;
use event_fabric::config::FabricConfig;
use event_fabric::AppState;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "event-fabric", version, about = "Unified realtime event fabric for the hybrid DNS server's management plane")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "/etc/event-fabric/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = FabricConfig::load(&cli.config).expect("failed to load config");
    let bind_addr = config.bind_addr.clone();

    let state = AppState::new(config);
    state.broadcaster.start().await;
    info!("dispatcher workers started");

    let router = event_fabric::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind");
    info!(addr = %bind_addr, "event fabric listening");
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await.expect("server error");
    info!("event fabric shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
