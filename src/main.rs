//! CASBS Server
//!
//! Content-addressable streaming blob store with reference-counted
//! deduplication over a local, in-memory or S3 byte medium.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use casbs_server::config::{Config, StorageBackend};
use casbs_server::db::Catalog;
use casbs_server::service::BlobService;
use casbs_server::state::AppState;
use casbs_server::storage::{
    ByteStorage, LocalByteStorage, MemoryByteStorage, S3ByteStorage, S3Client,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "casbs_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid configuration")?;

    tracing::info!("Starting CASBS Server v{}", env!("CARGO_PKG_VERSION"));

    // Initialize byte storage
    let backend = build_backend(&config).await?;
    tracing::info!("Byte storage: {}", backend.name());

    // Initialize catalog
    let catalog = match &config.catalog.url {
        Some(url) => {
            let catalog = Catalog::open(url)
                .await
                .with_context(|| format!("failed to open catalog at {}", url))?;
            tracing::info!("Catalog initialized at {}", url);
            Some(catalog)
        }
        None => {
            tracing::warn!("No catalog configured, blob metadata will not survive restarts");
            None
        }
    };

    let service = BlobService::new(backend, catalog, config.upload.clone());
    service.recover().await.context("catalog recovery failed")?;

    let app_state = AppState::new(service);

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = casbs_server::app(app_state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.server.host, config.server.port))?;
    tracing::info!("CASBS Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app_state.shutdown().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

async fn build_backend(config: &Config) -> anyhow::Result<Arc<dyn ByteStorage>> {
    let backend: Arc<dyn ByteStorage> = match config.storage.backend {
        StorageBackend::Local => {
            let local = LocalByteStorage::new(config.storage.local_path.clone());
            let swept = local.sweep_partials().await?;
            if swept > 0 {
                tracing::info!("Removed {} partial writes from {}", swept, local.base_path().display());
            }
            Arc::new(local)
        }
        StorageBackend::Memory => Arc::new(MemoryByteStorage::new()),
        StorageBackend::S3 => {
            let s3 = config
                .storage
                .s3
                .as_ref()
                .context("S3 backend selected without S3 settings")?;
            tracing::info!("S3 endpoint: {}", s3.endpoint);
            tracing::info!("S3 bucket: {}", s3.bucket);
            let client = S3Client::new(s3).await;
            Arc::new(S3ByteStorage::new(client, s3.prefix.clone()))
        }
    };

    Ok(backend)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
