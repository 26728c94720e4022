use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use ringcache::cache::ResponseCache;
use ringcache::config::{self, Config};
use ringcache::handlers::{
    AppState, cache_stats, health, metrics as metrics_handler, proxy_handler, purge_cache,
};
use ringcache::metrics::Metrics;
use ringcache::origin::OriginFetcher;
use ringcache::worker::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load and validate configuration before accepting traffic
    let (config, source) = load_config()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting ringcache v{}", env!("CARGO_PKG_VERSION"));
    match source {
        Some(path) => info!("Loaded configuration from {}", path),
        None => info!("No config file found, using default configuration"),
    }

    let cache = ResponseCache::new(&config.cache)?;
    let workers = Arc::new(WorkerPool::new(config.server.workers)?);
    let origin = Arc::new(OriginFetcher::new(config.origins.clone())?);
    let metrics = Arc::new(Metrics::new()?);

    if config.cache.coalescing {
        info!(
            "Request coalescing enabled ({} delivery run loops)",
            workers.len()
        );
    }

    let state = Arc::new(AppState {
        cache,
        origin,
        config: Arc::new(config.clone()),
        metrics,
        workers: workers.clone(),
    });

    let app = build_router(state);

    let addr: SocketAddr = config.server_addr().parse()?;
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Run loops are plain threads; stop them off the async runtime
    tokio::task::spawn_blocking(move || workers.shutdown()).await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Returns the configuration and the file it came from, if any
fn load_config() -> anyhow::Result<(Config, Option<String>)> {
    let config_path = std::env::var("RINGCACHE_CONFIG")
        .unwrap_or_else(|_| "config/ringcache.toml".to_string());

    if std::path::Path::new(&config_path).exists() {
        let config = Config::load(&config_path)?;
        Ok((config, Some(config_path)))
    } else {
        let config = Config::default();
        config.validate()?;
        Ok((config, None))
    }
}

fn init_logging(config: &config::LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(cache_stats))
        .route("/purge", post(purge_cache));

    // Proxy routes - GET and HEAD (RFC 9110)
    let proxy_routes = Router::new()
        .route("/", get(proxy_handler).head(proxy_handler))
        .route("/{*path}", get(proxy_handler).head(proxy_handler));

    Router::new()
        .nest("/_cache", api_routes)
        .merge(proxy_routes)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install signal handler");
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

    info!("Shutdown signal received, starting graceful shutdown");
}
