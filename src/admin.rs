// =============================================================================
// Admin plane — projections over the live system plus imperative controls
// =============================================================================
//
// Authorisation is one function, `authorise`, invoked at the top of every
// admin operation; tests mock nothing else. Self-protection: an admin can
// neither suspend nor demote themselves.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{Clock, IdMinter};
use crate::emergency::{EmergencyController, PanicState};
use crate::error::CoreError;
use crate::events::{Event, EventHub, EventType, HubStats};
use crate::model::{Profile, SystemEvent, Tenant};
use crate::pool::{ConnectionPool, HandleState, PoolStats};
use crate::reconcile::{Reconcilers, WorkerStats};
use crate::repository::{EventFilter, ProfileFilter, Repository, TenantFilter};
use crate::types::{Severity, TenantStatus, Tier};

// =============================================================================
// Authorisation
// =============================================================================

/// Actions the admin surface distinguishes for auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    ViewDashboard,
    ManageTenants,
    ManageProfiles,
    ManageAlerts,
    Broadcast,
    Emergency,
}

/// The single authorisation guard for the admin plane.
pub fn authorise(
    actor: &Tenant,
    action: AdminAction,
    _target: Option<Uuid>,
) -> Result<(), CoreError> {
    if !actor.is_active() {
        return Err(CoreError::TenantForbidden(
            "acting tenant is suspended".to_string(),
        ));
    }
    if !actor.is_admin {
        return Err(CoreError::TenantForbidden(format!(
            "admin privileges required for {action:?}"
        )));
    }
    Ok(())
}

// =============================================================================
// Projection types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub total_tenants: usize,
    pub total_profiles: usize,
    pub connected_profiles: usize,
    pub trading_profiles: usize,
    pub open_positions: usize,
    pub event_subscribers: usize,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierBreakdown {
    pub free: usize,
    pub starter: usize,
    pub pro: usize,
    pub enterprise: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardResponse {
    pub stats: SystemStats,
    pub tier_breakdown: TierBreakdown,
    pub recent_alerts: Vec<SystemEvent>,
    pub pool: PoolStats,
    pub hub: HubStats,
    pub workers: Vec<WorkerStats>,
    pub active_panics: usize,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminTenantView {
    #[serde(flatten)]
    pub tenant: Tenant,
    pub profile_count: usize,
    pub connected_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminProfileView {
    #[serde(flatten)]
    pub profile: Profile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle_state: Option<HandleState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub panic: Option<PanicState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantPatch {
    pub tier: Option<Tier>,
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfilePatch {
    pub label: Option<String>,
    pub trading_enabled: Option<bool>,
    pub tz_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertRequest {
    pub event_type: String,
    pub severity: Severity,
    pub message: String,
    pub profile_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub details: Option<serde_json::Value>,
}

// =============================================================================
// AdminService
// =============================================================================

pub struct AdminService {
    repo: Arc<dyn Repository>,
    pool: Arc<ConnectionPool>,
    hub: Arc<EventHub>,
    emergency: Arc<EmergencyController>,
    workers: Arc<Reconcilers>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdMinter>,
    started: Instant,
}

impl AdminService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        pool: Arc<ConnectionPool>,
        hub: Arc<EventHub>,
        emergency: Arc<EmergencyController>,
        workers: Arc<Reconcilers>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdMinter>,
    ) -> Self {
        Self {
            repo,
            pool,
            hub,
            emergency,
            workers,
            clock,
            ids,
            started: Instant::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Projections
    // -------------------------------------------------------------------------

    pub async fn dashboard(&self, actor: &Tenant) -> Result<DashboardResponse, CoreError> {
        authorise(actor, AdminAction::ViewDashboard, None)?;

        let profiles = self.repo.list_profiles(&ProfileFilter::default()).await?;
        let (recent_alerts, _) = self
            .repo
            .list_events(&EventFilter {
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .await?;

        let (all_tenants, total_tenants) = self
            .repo
            .list_tenants(&TenantFilter {
                page: 1,
                page_size: usize::MAX / 2,
                ..Default::default()
            })
            .await?;
        let mut tiers: HashMap<Tier, usize> = HashMap::new();
        for tenant in &all_tenants {
            *tiers.entry(tenant.tier).or_insert(0) += 1;
        }

        let hub_stats = self.hub.stats();
        Ok(DashboardResponse {
            stats: SystemStats {
                total_tenants,
                total_profiles: profiles.len(),
                connected_profiles: profiles.iter().filter(|p| p.connected).count(),
                trading_profiles: profiles.iter().filter(|p| p.trading_enabled).count(),
                open_positions: self.repo.count_open_positions().await?,
                event_subscribers: hub_stats.total_subscribers,
                uptime_seconds: self.started.elapsed().as_secs(),
            },
            tier_breakdown: TierBreakdown {
                free: tiers.get(&Tier::Free).copied().unwrap_or(0),
                starter: tiers.get(&Tier::Starter).copied().unwrap_or(0),
                pro: tiers.get(&Tier::Pro).copied().unwrap_or(0),
                enterprise: tiers.get(&Tier::Enterprise).copied().unwrap_or(0),
            },
            recent_alerts,
            pool: self.pool.stats(),
            hub: hub_stats,
            workers: self.workers.stats(),
            active_panics: self
                .emergency
                .panic_snapshot()
                .values()
                .filter(|p| p.is_active())
                .count(),
            server_time: self.clock.now_utc(),
        })
    }

    pub async fn tenants(
        &self,
        actor: &Tenant,
        filter: &TenantFilter,
    ) -> Result<(Vec<AdminTenantView>, usize), CoreError> {
        authorise(actor, AdminAction::ManageTenants, None)?;
        let (tenants, total) = self.repo.list_tenants(filter).await?;

        let mut views = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let profiles = self.repo.profiles_for_tenant(tenant.id).await?;
            views.push(AdminTenantView {
                connected_count: profiles.iter().filter(|p| p.connected).count(),
                profile_count: profiles.len(),
                tenant,
            });
        }
        Ok((views, total))
    }

    pub async fn profiles(
        &self,
        actor: &Tenant,
        filter: &ProfileFilter,
    ) -> Result<Vec<AdminProfileView>, CoreError> {
        authorise(actor, AdminAction::ManageProfiles, None)?;
        let profiles = self.repo.list_profiles(filter).await?;
        Ok(profiles
            .into_iter()
            .map(|profile| AdminProfileView {
                handle_state: self.pool.get(profile.id).map(|h| h.state),
                panic: self.emergency.panic_state(profile.id),
                profile,
            })
            .collect())
    }

    pub async fn alerts(
        &self,
        actor: &Tenant,
        filter: &EventFilter,
    ) -> Result<(Vec<SystemEvent>, usize), CoreError> {
        authorise(actor, AdminAction::ManageAlerts, None)?;
        self.repo.list_events(filter).await
    }

    // -------------------------------------------------------------------------
    // Tenant mutations
    // -------------------------------------------------------------------------

    pub async fn patch_tenant(
        &self,
        actor: &Tenant,
        target_id: Uuid,
        patch: TenantPatch,
    ) -> Result<Tenant, CoreError> {
        authorise(actor, AdminAction::ManageTenants, Some(target_id))?;

        // Self-protection: an admin cannot demote or deactivate themselves.
        if target_id == actor.id
            && (patch.is_admin == Some(false) || patch.is_active == Some(false))
        {
            return Err(CoreError::TenantForbidden(
                "admins cannot demote or deactivate themselves".to_string(),
            ));
        }

        let mut tenant = self
            .repo
            .tenant(target_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("tenant {target_id}")))?;

        if let Some(tier) = patch.tier {
            tenant.tier = tier;
        }
        if let Some(active) = patch.is_active {
            tenant.status = if active {
                TenantStatus::Active
            } else {
                TenantStatus::Suspended
            };
        }
        if let Some(admin) = patch.is_admin {
            tenant.is_admin = admin;
        }
        self.repo.update_tenant(tenant.clone()).await?;
        info!(target = %target_id, actor = %actor.id, "tenant patched");
        Ok(tenant)
    }

    /// Suspend a tenant and force-disconnect every one of its profiles.
    pub async fn suspend_tenant(&self, actor: &Tenant, target_id: Uuid) -> Result<(), CoreError> {
        authorise(actor, AdminAction::ManageTenants, Some(target_id))?;
        if target_id == actor.id {
            return Err(CoreError::TenantForbidden(
                "admins cannot suspend themselves".to_string(),
            ));
        }

        let mut tenant = self
            .repo
            .tenant(target_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("tenant {target_id}")))?;
        tenant.status = TenantStatus::Suspended;
        self.repo.update_tenant(tenant.clone()).await?;

        for profile in self.repo.profiles_for_tenant(target_id).await? {
            self.disconnect_profile(profile).await?;
        }

        warn!(target = %target_id, actor = %actor.id, "tenant suspended");
        self.repo
            .insert_event(
                SystemEvent::new(
                    self.ids.mint(),
                    "tenant_suspended",
                    Severity::Warning,
                    "admin",
                    format!("Tenant {} suspended by {}", tenant.email, actor.email),
                    self.clock.now_utc(),
                )
                .with_tenant(target_id),
            )
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Profile mutations
    // -------------------------------------------------------------------------

    pub async fn patch_profile(
        &self,
        actor: &Tenant,
        profile_id: Uuid,
        patch: ProfilePatch,
    ) -> Result<Profile, CoreError> {
        authorise(actor, AdminAction::ManageProfiles, Some(profile_id))?;

        let mut profile = self
            .repo
            .profile(profile_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("profile {profile_id}")))?;

        if let Some(label) = patch.label {
            profile.label = label;
        }
        if let Some(enabled) = patch.trading_enabled {
            profile.trading_enabled = enabled;
            let event_type = if enabled {
                EventType::TradingEnabled
            } else {
                EventType::TradingDisabled
            };
            self.hub.publish(Event::new(
                event_type,
                profile_id,
                self.clock.now_utc(),
                serde_json::Value::Null,
            ));
        }
        if let Some(offset) = patch.tz_offset_minutes {
            if !(-16 * 60..=16 * 60).contains(&offset) {
                return Err(CoreError::InputInvalid(
                    "tz_offset_minutes must be within ±960".to_string(),
                ));
            }
            profile.tz_offset_minutes = offset;
        }
        profile.updated_at = self.clock.now_utc();
        self.repo.update_profile(profile.clone()).await?;
        Ok(profile)
    }

    pub async fn force_disconnect(&self, actor: &Tenant, profile_id: Uuid) -> Result<(), CoreError> {
        authorise(actor, AdminAction::ManageProfiles, Some(profile_id))?;
        let profile = self
            .repo
            .profile(profile_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("profile {profile_id}")))?;
        self.disconnect_profile(profile).await?;
        info!(profile_id = %profile_id, actor = %actor.id, "profile force-disconnected");
        Ok(())
    }

    async fn disconnect_profile(&self, mut profile: Profile) -> Result<(), CoreError> {
        self.pool.disconnect(profile.id).await?;
        if profile.connected {
            profile.connected = false;
            profile.updated_at = self.clock.now_utc();
            self.repo.update_profile(profile.clone()).await?;
        }
        self.hub.publish(Event::new(
            EventType::Disconnected,
            profile.id,
            self.clock.now_utc(),
            json!({ "reason": "admin_disconnect" }),
        ));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Alerts & broadcast
    // -------------------------------------------------------------------------

    pub async fn acknowledge_alerts(
        &self,
        actor: &Tenant,
        ids: &[Uuid],
    ) -> Result<usize, CoreError> {
        authorise(actor, AdminAction::ManageAlerts, None)?;
        self.repo.acknowledge_events(ids, actor.id).await
    }

    pub async fn create_alert(
        &self,
        actor: &Tenant,
        request: AlertRequest,
    ) -> Result<SystemEvent, CoreError> {
        authorise(actor, AdminAction::ManageAlerts, None)?;
        let mut event = SystemEvent::new(
            self.ids.mint(),
            request.event_type,
            request.severity,
            "admin",
            request.message,
            self.clock.now_utc(),
        );
        event.tenant_id = request.tenant_id;
        event.profile_id = request.profile_id;
        if let Some(details) = request.details {
            event.details = details;
        }
        self.repo.insert_event(event.clone()).await?;
        Ok(event)
    }

    /// Broadcast a system message to every connected subscriber.
    pub async fn broadcast(
        &self,
        actor: &Tenant,
        severity: Severity,
        message: String,
    ) -> Result<(), CoreError> {
        authorise(actor, AdminAction::Broadcast, None)?;
        let now = self.clock.now_utc();
        self.hub.broadcast_all(Event::broadcast(
            EventType::SystemMessage,
            now,
            json!({ "severity": severity, "message": message }),
        ));
        self.repo
            .insert_event(SystemEvent::new(
                self.ids.mint(),
                "broadcast",
                severity,
                "admin",
                message,
                now,
            ))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::clock::{ManualClock, SequentialIds};
    use crate::config::CoreConfig;
    use crate::gate::GateRegistry;
    use crate::ingress::SignalGate;
    use crate::repository::MemoryRepository;
    use chrono::TimeZone;
    use parking_lot::RwLock;

    struct Fixture {
        admin_service: AdminService,
        repo: Arc<MemoryRepository>,
        pool: Arc<ConnectionPool>,
        admin: Tenant,
        member: Tenant,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let ids = Arc::new(SequentialIds::default());
        let repo = Arc::new(MemoryRepository::new());
        let hub = Arc::new(EventHub::new(clock.clone(), 64));
        let config = Arc::new(RwLock::new(CoreConfig::default()));
        let broker = Arc::new(PaperBroker::new(clock.clone()));
        let pool = Arc::new(ConnectionPool::new(
            broker.clone(),
            clock.clone(),
            config.clone(),
        ));
        let emergency = Arc::new(EmergencyController::new(
            repo.clone(),
            broker.clone(),
            hub.clone(),
            clock.clone(),
            ids.clone(),
            config.clone(),
        ));
        let registry = Arc::new(GateRegistry::from_names(&config.read().gate_order).unwrap());
        let gate = Arc::new(SignalGate::new(
            repo.clone(),
            hub.clone(),
            registry,
            emergency.clone(),
            clock.clone(),
            ids.clone(),
            config.clone(),
        ));
        let workers = Arc::new(Reconcilers::new(
            repo.clone(),
            pool.clone(),
            broker,
            hub.clone(),
            emergency.clone(),
            gate,
            clock.clone(),
            ids.clone(),
            config,
        ));

        let admin = Tenant {
            id: Uuid::new_v4(),
            email: "admin@example.com".into(),
            display_name: "Admin".into(),
            status: TenantStatus::Active,
            tier: Tier::Enterprise,
            is_admin: true,
            api_token: "admin-token-000001".into(),
            created_at: clock.now_utc(),
        };
        let member = Tenant {
            id: Uuid::new_v4(),
            email: "member@example.com".into(),
            display_name: "Member".into(),
            status: TenantStatus::Active,
            tier: Tier::Starter,
            is_admin: false,
            api_token: "member-token-00001".into(),
            created_at: clock.now_utc(),
        };
        repo.insert_tenant(admin.clone()).await.unwrap();
        repo.insert_tenant(member.clone()).await.unwrap();

        let admin_service = AdminService::new(
            repo.clone(),
            pool.clone(),
            hub,
            emergency,
            workers,
            clock,
            ids,
        );

        Fixture {
            admin_service,
            repo,
            pool,
            admin,
            member,
        }
    }

    #[tokio::test]
    async fn non_admin_is_denied_everywhere() {
        let f = fixture().await;
        let err = f.admin_service.dashboard(&f.member).await.unwrap_err();
        assert_eq!(err.code(), "tenant_forbidden");

        let err = f
            .admin_service
            .suspend_tenant(&f.member, f.admin.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "tenant_forbidden");
    }

    #[tokio::test]
    async fn self_demotion_and_self_suspension_are_refused() {
        let f = fixture().await;

        let err = f
            .admin_service
            .patch_tenant(
                &f.admin,
                f.admin.id,
                TenantPatch {
                    is_admin: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "tenant_forbidden");

        let err = f
            .admin_service
            .suspend_tenant(&f.admin, f.admin.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "tenant_forbidden");

        // Tier changes on self are fine.
        let updated = f
            .admin_service
            .patch_tenant(
                &f.admin,
                f.admin.id,
                TenantPatch {
                    tier: Some(Tier::Pro),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.tier, Tier::Pro);
    }

    #[tokio::test]
    async fn suspension_force_disconnects_every_profile() {
        let f = fixture().await;
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        let mut profile = Profile::new(Uuid::new_v4(), f.member.id, "main", "1001@paper", now);
        profile.connected = true;
        f.repo.insert_profile(profile.clone()).await.unwrap();
        f.pool.connect(profile.id, "1001@paper", "pw").await.unwrap();

        f.admin_service
            .suspend_tenant(&f.admin, f.member.id)
            .await
            .unwrap();

        let tenant = f.repo.tenant(f.member.id).await.unwrap().unwrap();
        assert_eq!(tenant.status, TenantStatus::Suspended);
        assert!(f.pool.get(profile.id).is_none());
        let profile = f.repo.profile(profile.id).await.unwrap().unwrap();
        assert!(!profile.connected);
    }

    #[tokio::test]
    async fn dashboard_aggregates_counts() {
        let f = fixture().await;
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut profile = Profile::new(Uuid::new_v4(), f.member.id, "main", "1001@paper", now);
        profile.connected = true;
        profile.trading_enabled = true;
        f.repo.insert_profile(profile).await.unwrap();

        let dashboard = f.admin_service.dashboard(&f.admin).await.unwrap();
        assert_eq!(dashboard.stats.total_tenants, 2);
        assert_eq!(dashboard.stats.total_profiles, 1);
        assert_eq!(dashboard.stats.connected_profiles, 1);
        assert_eq!(dashboard.stats.trading_profiles, 1);
        assert_eq!(dashboard.tier_breakdown.enterprise, 1);
        assert_eq!(dashboard.tier_breakdown.starter, 1);
        assert_eq!(dashboard.workers.len(), 4);
    }

    #[tokio::test]
    async fn alert_lifecycle_create_list_acknowledge() {
        let f = fixture().await;

        let alert = f
            .admin_service
            .create_alert(
                &f.admin,
                AlertRequest {
                    event_type: "maintenance".into(),
                    severity: Severity::Info,
                    message: "rolling restart tonight".into(),
                    profile_id: None,
                    tenant_id: None,
                    details: None,
                },
            )
            .await
            .unwrap();

        let (alerts, total) = f
            .admin_service
            .alerts(&f.admin, &EventFilter::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert!(!alerts[0].acknowledged);

        let n = f
            .admin_service
            .acknowledge_alerts(&f.admin, &[alert.id])
            .await
            .unwrap();
        assert_eq!(n, 1);

        let (alerts, _) = f
            .admin_service
            .alerts(
                &f.admin,
                &EventFilter {
                    acknowledged: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].acknowledged_by, Some(f.admin.id));
    }
}
