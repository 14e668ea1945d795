//! # agora-server
//!
//! Single-room real-time chat server.
//!
//! This binary provides:
//! - **Websocket chat** (`/ws`): ordered messages with replies, mentions and
//!   soft deletion, plus a live roster with debounced join/leave notices
//! - **Durable store** on SQLite with debounced write-behind flushing
//! - **REST API** (axum) for health checks, file lookup and administration
//! - **Per-IP rate limiting** to protect against abuse

mod api;
mod config;
mod coordinator;
mod error;
mod hub;
mod presence;
mod rate_limit;
mod render;
mod scheduler;
mod session;
mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use agora_store::{Database, Store, StoreConfig};
use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::coordinator::{Coordinator, CoordinatorSettings};
use crate::rate_limit::RateLimiter;
use crate::scheduler::TokioScheduler;
use crate::session::SessionTable;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,agora_server=debug")),
        )
        .init();

    info!("Starting Agora server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        instance = %config.instance_name,
        http_addr = %config.http_addr,
        grace_ms = config.grace_period.as_millis() as u64,
        admin_enabled = config.admin_token.is_some(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Open the store
    // -----------------------------------------------------------------------
    let database = match &config.data_path {
        Some(path) => Database::open_at(path),
        None => Database::new(),
    }
    .context("failed to open database")?;
    if let Some(path) = database.path() {
        info!(path = %path.display(), "Database opened");
    }

    let store = Store::open(
        Arc::new(database),
        StoreConfig {
            flush_interval: config.flush_interval,
        },
    )
    .await
    .context("failed to load store")?;

    // -----------------------------------------------------------------------
    // 4. Initialize subsystems
    // -----------------------------------------------------------------------
    let sessions = Arc::new(SessionTable::new(config.session_ttl));
    let coordinator = Coordinator::new(
        store.clone(),
        sessions.clone(),
        Arc::new(TokioScheduler),
        CoordinatorSettings {
            grace_period: config.grace_period,
            history_page_size: config.history_page_size,
            messages_per_minute: config.messages_per_minute,
        },
    );

    // Rate limiter: 10 req/s sustained, burst of 30
    let rate_limiter = RateLimiter::default();

    let app_state = AppState {
        coordinator,
        store: store.clone(),
        sessions: sessions.clone(),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 5. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    let chat_limits = app_state.coordinator.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
            chat_limits.purge_idle_limits(Duration::from_secs(600)).await;
        }
    });

    // Periodic session cleanup (every 10 minutes)
    let st = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            let purged = st.purge_expired().await;
            if purged > 0 {
                info!(purged, "Expired sessions removed");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 6. Run the HTTP server until it fails or Ctrl+C
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let outcome = tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    // Whatever is still inside the coalescing window gets written now.
    match store.flush_now().await {
        Ok(true) => info!("Pending changes flushed"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Final flush failed"),
    }

    outcome
}
