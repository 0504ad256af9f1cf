//! Shale archive server binary.

use std::sync::Arc;

use clap::Parser;
use shale_auth::PasswordFile;
use shale_server::config::{BackendKind, ShaleConfig};
use shale_server::routes::AppState;
use shale_store::{FileStore, FtpStore, FtpStoreConfig, ShardStore};
use shale_tags::TagRegistry;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Multi-tenant cloud archive for time-partitioned log-index shards.
#[derive(Parser, Debug)]
#[command(name = "shale-server")]
#[command(about = "Cloud archive server for time-partitioned log shards")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(long = "config-file", value_name = "FILE")]
    config_file: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ShaleConfig::load(&cli.config_file)
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", cli.config_file.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level().expect("validated"))),
        )
        .init();

    info!(listen = %config.server.listen, backend = ?config.storage.backend, "shale server starting");

    let registry = Arc::new(TagRegistry::new());
    let store: Arc<dyn ShardStore> = match config.storage.backend {
        BackendKind::File => Arc::new(FileStore::new(
            config.storage.directory.clone(),
            registry.clone(),
        )?),
        BackendKind::Ftp => {
            let ftp = config
                .storage
                .ftp
                .clone()
                .expect("validated ftp settings");
            Arc::new(FtpStore::new(
                FtpStoreConfig {
                    server: ftp.server,
                    username: ftp.username,
                    password: ftp.password,
                    base_dir: ftp.base_dir,
                    local_store: config.storage.directory.clone(),
                },
                registry.clone(),
            )?)
        }
    };
    store
        .preflight()
        .map_err(|e| anyhow::anyhow!("storage preflight failed: {e}"))?;

    let auth = Arc::new(PasswordFile::open(&config.auth.password_file)?);
    let state = Arc::new(AppState::new(store, auth));
    let app = shale_server::router(state);

    match &config.server.tls {
        Some(tls) => {
            let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                .await
                .map_err(|e| anyhow::anyhow!("failed to load TLS material: {e}"))?;
            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
            });
            info!(listen = %config.server.listen, "serving with TLS");
            axum_server::bind_rustls(config.server.listen, rustls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(config.server.listen).await?;
            info!(listen = %config.server.listen, "serving without TLS");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }

    if let Err(e) = registry.close_all() {
        error!(error = %e, "tag registry did not shut down cleanly");
    }
    info!("shale server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        }
        () = terminate => {
            info!("received SIGTERM, shutting down");
        }
    }
}
