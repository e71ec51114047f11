// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a tenant bearer token resolved by the `TenantAuth` extractor.
// Business rejections (rate limit, failing gates, panic) are 200-class
// Decisions; only transport-level problems surface as error statuses.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, patch, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::admin::{AlertRequest, ProfilePatch, TenantPatch};
use crate::app_state::AppState;
use crate::config::GateConfigPatch;
use crate::decision::SignalRequest;
use crate::emergency::PanicTrigger;
use crate::error::CoreError;
use crate::evidence::{bundle, EvidenceKind, EvidencePackage};
use crate::model::Profile;
use crate::repository::{DecisionFilter, EventFilter, ProfileFilter, TenantFilter};
use crate::types::{AccountKind, DecisionStatus, Severity, Tier};

use super::auth::TenantAuth;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Profiles ────────────────────────────────────────────────
        .route("/api/v1/profiles", get(list_profiles).post(create_profile))
        .route("/api/v1/profiles/:id", get(get_profile))
        .route("/api/v1/profiles/:id/connect", post(connect_profile))
        .route("/api/v1/profiles/:id/disconnect", post(disconnect_profile))
        .route(
            "/api/v1/profiles/:id/gate-config",
            get(get_gate_config).patch(patch_gate_config),
        )
        // ── Signals ─────────────────────────────────────────────────
        .route("/api/v1/profiles/:id/signals", post(submit_signal).get(list_signals))
        .route("/api/v1/profiles/:id/signals/batch", post(submit_batch))
        .route("/api/v1/profiles/:id/signals/stats", get(signal_stats))
        .route("/api/v1/profiles/:id/signals/:signal_id", get(get_signal))
        .route("/api/v1/profiles/:id/rate-limit", get(rate_limit_status))
        // ── Emergency controls ──────────────────────────────────────
        .route("/api/v1/profiles/:id/kill-switch", post(kill_switch))
        .route("/api/v1/profiles/:id/panic-hedge", post(panic_hedge))
        .route("/api/v1/profiles/:id/panic-reset", post(panic_reset))
        .route("/api/v1/profiles/:id/panic", get(panic_state))
        // ── Provenance & evidence ───────────────────────────────────
        .route("/api/v1/decisions/:id/chain", get(decision_chain))
        .route("/api/v1/evidence/export", post(evidence_export))
        // ── Admin plane ─────────────────────────────────────────────
        .route("/api/v1/admin/dashboard", get(admin_dashboard))
        .route("/api/v1/admin/users", get(admin_users))
        .route("/api/v1/admin/users/:id", patch(admin_patch_user))
        .route("/api/v1/admin/users/:id/suspend", post(admin_suspend_user))
        .route("/api/v1/admin/profiles", get(admin_profiles))
        .route("/api/v1/admin/profiles/:id", patch(admin_patch_profile))
        .route(
            "/api/v1/admin/profiles/:id/disconnect",
            post(admin_disconnect_profile),
        )
        .route("/api/v1/admin/alerts", get(admin_alerts).post(admin_create_alert))
        .route("/api/v1/admin/alerts/ack", post(admin_ack_alerts))
        .route("/api/v1/admin/broadcast", post(admin_broadcast))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/profiles/:id/ws", get(super::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "server_time": state.clock.now_utc(),
        "pool": state.pool.stats(),
    }))
}

// =============================================================================
// Profiles
// =============================================================================

#[derive(Deserialize)]
struct CreateProfileRequest {
    label: String,
    broker_coords: String,
    account_kind: Option<AccountKind>,
    tz_offset_minutes: Option<i32>,
}

async fn create_profile(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Json(body): Json<CreateProfileRequest>,
) -> Result<Json<Profile>, CoreError> {
    if body.label.trim().is_empty() {
        return Err(CoreError::InputInvalid("label must not be empty".to_string()));
    }
    if body.broker_coords.trim().is_empty() {
        return Err(CoreError::InputInvalid(
            "broker_coords must not be empty".to_string(),
        ));
    }
    let now = state.clock.now_utc();
    let mut profile = Profile::new(
        state.ids.mint(),
        tenant.id,
        body.label,
        body.broker_coords,
        now,
    );
    if let Some(kind) = body.account_kind {
        profile.account_kind = kind;
    }
    if let Some(offset) = body.tz_offset_minutes {
        profile.tz_offset_minutes = offset;
    }
    state.repo.insert_profile(profile.clone()).await?;
    Ok(Json(profile))
}

async fn list_profiles(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
) -> Result<impl IntoResponse, CoreError> {
    let profiles = state.repo.profiles_for_tenant(tenant.id).await?;
    let views: Vec<serde_json::Value> = profiles
        .into_iter()
        .map(|profile| {
            let handle = state.pool.get(profile.id);
            json!({ "profile": profile, "handle": handle })
        })
        .collect();
    Ok(Json(views))
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    let profile = state.signal_gate.ensure_visible(&tenant, profile_id).await?;
    let handle = state.pool.get(profile_id);
    Ok(Json(json!({ "profile": profile, "handle": handle })))
}

#[derive(Deserialize)]
struct ConnectRequest {
    /// Already-decrypted broker credential; credential-at-rest handling is
    /// outside the core.
    credential: String,
}

async fn connect_profile(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
    Json(body): Json<ConnectRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let mut profile = state.signal_gate.ensure_visible(&tenant, profile_id).await?;
    let outcome = state
        .pool
        .connect(profile_id, &profile.broker_coords, &body.credential)
        .await?;

    if !profile.connected {
        profile.connected = true;
        profile.updated_at = state.clock.now_utc();
        state.repo.update_profile(profile).await?;
    }
    Ok(Json(outcome))
}

async fn disconnect_profile(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    let mut profile = state.signal_gate.ensure_visible(&tenant, profile_id).await?;
    state.pool.disconnect(profile_id).await?;
    if profile.connected {
        profile.connected = false;
        profile.updated_at = state.clock.now_utc();
        state.repo.update_profile(profile).await?;
    }
    Ok(Json(json!({ "disconnected": true })))
}

async fn get_gate_config(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    let profile = state.signal_gate.ensure_visible(&tenant, profile_id).await?;
    Ok(Json(profile.gate_config))
}

async fn patch_gate_config(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
    Json(body): Json<GateConfigPatch>,
) -> Result<impl IntoResponse, CoreError> {
    let mut profile = state.signal_gate.ensure_visible(&tenant, profile_id).await?;
    profile
        .gate_config
        .apply_patch(&body)
        .map_err(CoreError::InputInvalid)?;
    profile.updated_at = state.clock.now_utc();
    state.repo.update_profile(profile.clone()).await?;
    Ok(Json(profile.gate_config))
}

// =============================================================================
// Signals
// =============================================================================

async fn submit_signal(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
    Json(body): Json<SignalRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let decision = state.signal_gate.submit(&tenant, profile_id, body).await?;
    Ok(Json(decision))
}

async fn submit_batch(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
    Json(body): Json<Vec<SignalRequest>>,
) -> Result<impl IntoResponse, CoreError> {
    let results = state
        .signal_gate
        .submit_batch(&tenant, profile_id, body)
        .await?;
    Ok(Json(results))
}

#[derive(Deserialize)]
struct SignalListQuery {
    page: Option<usize>,
    page_size: Option<usize>,
    decision: Option<DecisionStatus>,
}

async fn list_signals(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
    Query(query): Query<SignalListQuery>,
) -> Result<impl IntoResponse, CoreError> {
    state.signal_gate.ensure_visible(&tenant, profile_id).await?;
    let filter = DecisionFilter {
        status: query.decision,
        page: query.page.unwrap_or(1),
        page_size: query.page_size.unwrap_or(20).min(100),
    };
    let (items, total) = state
        .repo
        .decisions_for_profile(profile_id, &filter)
        .await?;
    Ok(Json(json!({
        "items": items,
        "total": total,
        "page": filter.page,
        "page_size": filter.page_size,
    })))
}

async fn get_signal(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path((profile_id, signal_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, CoreError> {
    state.signal_gate.ensure_visible(&tenant, profile_id).await?;
    let decision = state
        .repo
        .decision(signal_id)
        .await?
        .filter(|d| d.profile_id == profile_id)
        .ok_or_else(|| CoreError::NotFound(format!("signal {signal_id}")))?;
    Ok(Json(decision))
}

#[derive(Deserialize)]
struct StatsQuery {
    hours: Option<u64>,
}

async fn signal_stats(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
    Query(query): Query<StatsQuery>,
) -> Result<impl IntoResponse, CoreError> {
    state.signal_gate.ensure_visible(&tenant, profile_id).await?;
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 7);
    let stats = state.signal_gate.signal_stats(profile_id, hours).await?;
    Ok(Json(stats))
}

async fn rate_limit_status(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    state.signal_gate.ensure_visible(&tenant, profile_id).await?;
    Ok(Json(state.signal_gate.rate_status(profile_id)))
}

// =============================================================================
// Emergency controls
// =============================================================================

async fn kill_switch(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    crate::admin::authorise(&tenant, crate::admin::AdminAction::Emergency, Some(profile_id))?;
    let report = state.emergency.kill_switch(&tenant, profile_id).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct PanicHedgeRequest {
    trigger: Option<PanicTrigger>,
}

async fn panic_hedge(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
    Json(body): Json<PanicHedgeRequest>,
) -> Result<impl IntoResponse, CoreError> {
    state.signal_gate.ensure_visible(&tenant, profile_id).await?;
    let trigger = body.trigger.unwrap_or(PanicTrigger::Manual);
    let report = state.emergency.panic_hedge(profile_id, trigger).await?;
    Ok(Json(report))
}

async fn panic_reset(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    crate::admin::authorise(&tenant, crate::admin::AdminAction::Emergency, Some(profile_id))?;
    state.emergency.reset_panic(profile_id)?;
    Ok(Json(json!({ "reset": true })))
}

async fn panic_state(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    state.signal_gate.ensure_visible(&tenant, profile_id).await?;
    Ok(Json(json!({
        "panic": state.emergency.panic_state(profile_id),
    })))
}

// =============================================================================
// Provenance & evidence
// =============================================================================

async fn decision_chain(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(decision_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    let decision = state
        .repo
        .decision(decision_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("decision {decision_id}")))?;
    state
        .signal_gate
        .ensure_visible(&tenant, decision.profile_id)
        .await?;
    let chain = state
        .repo
        .chain_for_decision(decision_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("chain for decision {decision_id}")))?;
    let timeline = chain.timeline();
    Ok(Json(json!({
        "decision_id": decision_id,
        "decision_hash": decision.decision_hash,
        "chain": chain,
        "timeline": timeline,
    })))
}

#[derive(Deserialize)]
struct EvidenceExportRequest {
    profile_id: Uuid,
    title: Option<String>,
    purpose: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    kinds: Vec<EvidenceKind>,
}

async fn evidence_export(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Json(body): Json<EvidenceExportRequest>,
) -> Result<impl IntoResponse, CoreError> {
    crate::admin::authorise(&tenant, crate::admin::AdminAction::ManageAlerts, None)?;
    if body.period_end <= body.period_start {
        return Err(CoreError::InputInvalid(
            "period_end must be after period_start".to_string(),
        ));
    }

    let now = state.clock.now_utc();
    let mut package = EvidencePackage::new(
        state.ids.mint(),
        body.title
            .unwrap_or_else(|| format!("Evidence Bundle - {}", body.purpose)),
        body.purpose,
        tenant.email.clone(),
        now,
        body.period_start,
        body.period_end,
    );

    let decisions = state
        .repo
        .decisions_between(body.profile_id, body.period_start, body.period_end)
        .await?;

    for kind in body.kinds {
        match kind {
            EvidenceKind::SignalHistory => {
                package.collect_signal_history(state.ids.mint(), &decisions, now);
            }
            EvidenceKind::DecisionChains => {
                let mut chains = Vec::with_capacity(decisions.len());
                for decision in &decisions {
                    if let Some(chain) = state.repo.chain_for_decision(decision.id).await? {
                        chains.push(chain);
                    }
                }
                package.collect_decision_chains(state.ids.mint(), &chains, now);
            }
            EvidenceKind::TradeHistory => {
                let trades: Vec<_> = state
                    .repo
                    .trades_for_profile(body.profile_id, 10_000)
                    .await?
                    .into_iter()
                    .filter(|t| {
                        t.close_time >= body.period_start && t.close_time < body.period_end
                    })
                    .collect();
                package.collect_trade_history(state.ids.mint(), &trades, now);
            }
            EvidenceKind::RiskAlerts => {
                let (alerts, _) = state
                    .repo
                    .list_events(&EventFilter {
                        profile_id: Some(body.profile_id),
                        page: 1,
                        page_size: 10_000,
                        ..Default::default()
                    })
                    .await?;
                let alerts: Vec<_> = alerts
                    .into_iter()
                    .filter(|a| {
                        a.created_at >= body.period_start && a.created_at < body.period_end
                    })
                    .collect();
                package.collect_risk_alerts(state.ids.mint(), &alerts, now);
            }
        }
    }

    let integrity = package.verify();
    let entries = bundle(&package);
    Ok(Json(json!({
        "manifest": package.manifest(),
        "integrity": integrity,
        "entries": entries,
    })))
}

// =============================================================================
// Admin plane
// =============================================================================

async fn admin_dashboard(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(state.admin.dashboard(&tenant).await?))
}

#[derive(Deserialize)]
struct UserListQuery {
    page: Option<usize>,
    page_size: Option<usize>,
    search: Option<String>,
    tier: Option<Tier>,
    is_active: Option<bool>,
}

async fn admin_users(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Query(query): Query<UserListQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let filter = TenantFilter {
        search: query.search,
        tier: query.tier,
        active: query.is_active,
        page: query.page.unwrap_or(1),
        page_size: query.page_size.unwrap_or(20).min(100),
    };
    let (items, total) = state.admin.tenants(&tenant, &filter).await?;
    Ok(Json(json!({
        "items": items,
        "total": total,
        "page": filter.page,
        "page_size": filter.page_size,
    })))
}

async fn admin_patch_user(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(user_id): Path<Uuid>,
    Json(body): Json<TenantPatch>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(state.admin.patch_tenant(&tenant, user_id, body).await?))
}

async fn admin_suspend_user(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    state.admin.suspend_tenant(&tenant, user_id).await?;
    Ok(Json(json!({ "suspended": true })))
}

#[derive(Deserialize)]
struct AdminProfileQuery {
    tenant_id: Option<Uuid>,
    connected: Option<bool>,
    trading_enabled: Option<bool>,
    broker: Option<String>,
}

async fn admin_profiles(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Query(query): Query<AdminProfileQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let filter = ProfileFilter {
        tenant_id: query.tenant_id,
        connected: query.connected,
        trading_enabled: query.trading_enabled,
        broker: query.broker,
    };
    Ok(Json(state.admin.profiles(&tenant, &filter).await?))
}

async fn admin_patch_profile(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
    Json(body): Json<ProfilePatch>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(
        state.admin.patch_profile(&tenant, profile_id, body).await?,
    ))
}

async fn admin_disconnect_profile(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Path(profile_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    state.admin.force_disconnect(&tenant, profile_id).await?;
    Ok(Json(json!({ "disconnected": true })))
}

#[derive(Deserialize)]
struct AlertListQuery {
    severity: Option<Severity>,
    event_type: Option<String>,
    acknowledged: Option<bool>,
    profile_id: Option<Uuid>,
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn admin_alerts(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Query(query): Query<AlertListQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let filter = EventFilter {
        severity: query.severity,
        event_type: query.event_type,
        acknowledged: query.acknowledged,
        profile_id: query.profile_id,
        page: query.page.unwrap_or(1),
        page_size: query.page_size.unwrap_or(20).min(100),
    };
    let (items, total) = state.admin.alerts(&tenant, &filter).await?;
    Ok(Json(json!({
        "items": items,
        "total": total,
        "page": filter.page,
        "page_size": filter.page_size,
    })))
}

async fn admin_create_alert(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Json(body): Json<AlertRequest>,
) -> Result<impl IntoResponse, CoreError> {
    Ok(Json(state.admin.create_alert(&tenant, body).await?))
}

#[derive(Deserialize)]
struct AckRequest {
    ids: Vec<Uuid>,
}

async fn admin_ack_alerts(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Json(body): Json<AckRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let acknowledged = state.admin.acknowledge_alerts(&tenant, &body.ids).await?;
    Ok(Json(json!({ "acknowledged": acknowledged })))
}

#[derive(Deserialize)]
struct BroadcastRequest {
    severity: Option<Severity>,
    message: String,
}

async fn admin_broadcast(
    State(state): State<Arc<AppState>>,
    TenantAuth(tenant): TenantAuth,
    Json(body): Json<BroadcastRequest>,
) -> Result<impl IntoResponse, CoreError> {
    if body.message.trim().is_empty() {
        return Err(CoreError::InputInvalid("message must not be empty".to_string()));
    }
    state
        .admin
        .broadcast(&tenant, body.severity.unwrap_or(Severity::Info), body.message)
        .await?;
    Ok(Json(json!({ "broadcast": true })))
}
