use clap::Parser;
use ratekeeper_server::api::create_router;
use ratekeeper_server::api::handlers::AppState;
use ratekeeper_server::config::{Config, DEFAULT_CONFIG_FILE};
use ratekeeper_server::init_tracing;
use ratekeeper_wal::WalStore;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ratekeeper-server", about = "Token-bucket quota decision server")]
struct Args {
    /// TOML configuration file; missing files are ignored
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::load_from(&args.config).unwrap_or_else(|err| {
        eprintln!("Failed to load configuration: {}", err);
        std::process::exit(1);
    });
    init_tracing(&config);
    tracing::debug!(?config, "loaded configuration");

    let store = WalStore::open(&config.database_dir)?;
    let state = AppState::new(store.clone(), config.request_timeout());
    let app = create_router(state, config.debug);
    if config.debug {
        tracing::warn!("debug introspection enabled at /v1/debug/bucket");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, database_dir = %config.database_dir.display(), "listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    store.close()?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining connections");
}
