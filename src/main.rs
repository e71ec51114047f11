// =============================================================================
// Meridian Gate — Main Entry Point
// =============================================================================
//
// Multi-tenant trading control plane: authoritative signal ingress with a
// deterministic gate chain, a capped broker-connection pool with background
// reconciliation, non-blocking per-profile event fan-out, and per-profile
// emergency controls.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod admin;
mod api;
mod app_state;
mod broker;
mod clock;
mod config;
mod decision;
mod emergency;
mod error;
mod events;
mod evidence;
mod gate;
mod ingress;
mod model;
mod pool;
mod provenance;
mod reconcile;
mod repository;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::PaperBroker;
use crate::clock::{Clock, IdMinter, RandomIds, SystemClock};
use crate::config::CoreConfig;
use crate::model::Tenant;
use crate::repository::{MemoryRepository, Repository};
use crate::types::{TenantStatus, Tier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Gate — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian_config.json".into());
    let config = CoreConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        CoreConfig::default()
    });

    info!(
        rate_limit = config.rate_limit_max_per_window,
        pool_cap = config.pool_max_connections,
        gates = ?config.gate_order,
        "Core configuration resolved"
    );

    // ── 2. Capabilities ──────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdMinter> = Arc::new(RandomIds);
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    // The paper adapter backs demo profiles; a real terminal adapter slots
    // in behind the same trait without touching the core.
    let broker = Arc::new(PaperBroker::new(clock.clone()));

    // ── 3. Bootstrap operator tenant ─────────────────────────────────────
    if repo.count_tenants().await? == 0 {
        let token = std::env::var("MERIDIAN_BOOTSTRAP_TOKEN").unwrap_or_else(|_| {
            let generated = ids.mint().simple().to_string();
            warn!(token = %generated, "MERIDIAN_BOOTSTRAP_TOKEN not set — generated operator token");
            generated
        });
        let operator = Tenant {
            id: ids.mint(),
            email: "operator@meridian.local".to_string(),
            display_name: "Operator".to_string(),
            status: TenantStatus::Active,
            tier: Tier::Enterprise,
            is_admin: true,
            api_token: token,
            created_at: clock.now_utc(),
        };
        repo.insert_tenant(operator).await?;
        info!("Bootstrap operator tenant created");
    }

    // ── 4. Build shared state ────────────────────────────────────────────
    let state = AppState::build(config, clock, ids, repo, broker)?;

    // ── 5. Background loops ──────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let heartbeat_interval = state.config.read().heartbeat_interval_seconds;
    let _heartbeat = crate::events::spawn_heartbeat(
        state.hub.clone(),
        heartbeat_interval,
        shutdown_rx.clone(),
    );

    let _workers = state.reconcilers.spawn_all(shutdown_rx);
    info!("Reconcilers and heartbeat loops running");

    // ── 6. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let api_state = state.clone();
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr_clone).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %bind_addr_clone, error = %e, "Failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr_clone, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);

    if let Err(e) = state.config.read().save(&config_path) {
        error!(error = %e, "Failed to save core config on shutdown");
    }

    info!("Meridian Gate shut down complete.");
    Ok(())
}
