use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use bookline::auth::HeaderTenantContext;
use bookline::directory::Directory;
use bookline::http::{self, AppState};
use bookline::limits::{DEFAULT_MAX_OCCURRENCES, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW_SECS};
use bookline::orchestrator::{Orchestrator, OrchestratorConfig};
use bookline::rate_limit::RateLimiter;
use bookline::store::{MemoryStore, PersistentStore, WalStore};

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = env_parse("BOOKLINE_METRICS_PORT");
    bookline::observability::init(metrics_port)?;

    let port = std::env::var("BOOKLINE_PORT").unwrap_or_else(|_| "8080".into());
    let bind = std::env::var("BOOKLINE_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("BOOKLINE_DATA_DIR").ok().map(PathBuf::from);
    let directory_file = std::env::var("BOOKLINE_DIRECTORY").ok().map(PathBuf::from);
    let rate_limit: u32 = env_parse("BOOKLINE_RATE_LIMIT").unwrap_or(DEFAULT_RATE_LIMIT);
    let rate_window: u64 = env_parse("BOOKLINE_RATE_WINDOW_SECS").unwrap_or(DEFAULT_RATE_WINDOW_SECS);
    let max_occurrences: usize = env_parse("BOOKLINE_MAX_OCCURRENCES").unwrap_or(DEFAULT_MAX_OCCURRENCES);
    let multi_tenancy: bool = env_parse("BOOKLINE_MULTI_TENANCY").unwrap_or(true);
    let trust_forwarded: bool = env_parse("BOOKLINE_TRUST_FORWARDED").unwrap_or(false);

    let primary = match &data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Arc::new(WalStore::new(dir.clone()))
        }
        None => {
            tracing::warn!("BOOKLINE_DATA_DIR not set, serving from the fallback store only");
            Arc::new(WalStore::unconfigured())
        }
    };
    let fallback = Arc::new(MemoryStore::new());

    if let Some(path) = &directory_file {
        match Directory::load(path) {
            Ok(directory) => match directory.seed(&primary, &fallback).await {
                Ok(n) => info!("seeded {n} directory entries from {}", path.display()),
                Err(e) => tracing::warn!("directory seeding failed: {e}"),
            },
            Err(e) => tracing::warn!("{e}"),
        }
    }

    let orchestrator = Orchestrator::new(primary.clone(), fallback)
        .with_rate_limiter(Arc::new(RateLimiter::new(rate_limit, Duration::from_secs(rate_window))))
        .with_config(OrchestratorConfig { max_occurrences });
    let state = AppState::new(
        orchestrator,
        Arc::new(HeaderTenantContext::new(multi_tenancy)),
        trust_forwarded,
    );
    let app = http::router(state);

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("bookline listening on {addr}");
    info!(
        "  data_dir: {}",
        data_dir.as_ref().map_or("unset".to_string(), |d| d.display().to_string())
    );
    info!("  primary store: {}", if primary.is_available() { "available" } else { "unavailable" });
    info!("  rate limit: {rate_limit} per {rate_window}s");
    info!("  max occurrences: {max_occurrences}");
    info!("  multi_tenancy: {multi_tenancy}");
    info!("  trust x-forwarded-for: {trust_forwarded}");
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("bookline stopped");
    Ok(())
}

/// Resolves on SIGTERM or ctrl-c. In-flight requests are drained by axum.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("cannot register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");
}
