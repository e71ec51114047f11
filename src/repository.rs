// =============================================================================
// Repository capability — typed, transactional persistence
// =============================================================================
//
// The core consumes this trait; it never sees a schema. `record_decision`
// writes the Decision row and its sealed chain as one unit: after a failure
// neither exists, which is what makes ingress retries safe.
//
// `MemoryRepository` is the in-process implementation used by tests and demo
// boots. A database-backed implementation replaces it behind the same trait.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::decision::Decision;
use crate::error::CoreError;
use crate::model::{Position, Profile, SystemEvent, Tenant, TradeRecord};
use crate::provenance::DecisionChain;
use crate::types::{DecisionStatus, Severity, Tier};

// =============================================================================
// Query filters
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct TenantFilter {
    /// Case-insensitive substring match on email or display name.
    pub search: Option<String>,
    pub tier: Option<Tier>,
    pub active: Option<bool>,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileFilter {
    pub tenant_id: Option<Uuid>,
    pub connected: Option<bool>,
    pub trading_enabled: Option<bool>,
    /// Substring match on the opaque broker coordinates.
    pub broker: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub severity: Option<Severity>,
    pub event_type: Option<String>,
    pub acknowledged: Option<bool>,
    pub profile_id: Option<Uuid>,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DecisionFilter {
    pub status: Option<DecisionStatus>,
    pub page: usize,
    pub page_size: usize,
}

fn paginate<T: Clone>(items: &[T], page: usize, page_size: usize) -> Vec<T> {
    let page = page.max(1);
    let page_size = if page_size == 0 { 20 } else { page_size };
    items
        .iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .cloned()
        .collect()
}

// =============================================================================
// Trait
// =============================================================================

#[async_trait]
pub trait Repository: Send + Sync {
    // --- Tenants -------------------------------------------------------------
    async fn insert_tenant(&self, tenant: Tenant) -> Result<(), CoreError>;
    async fn tenant(&self, id: Uuid) -> Result<Option<Tenant>, CoreError>;
    async fn tenant_by_token(&self, token: &str) -> Result<Option<Tenant>, CoreError>;
    async fn update_tenant(&self, tenant: Tenant) -> Result<(), CoreError>;
    async fn list_tenants(&self, filter: &TenantFilter) -> Result<(Vec<Tenant>, usize), CoreError>;
    async fn count_tenants(&self) -> Result<usize, CoreError>;

    // --- Profiles ------------------------------------------------------------
    async fn insert_profile(&self, profile: Profile) -> Result<(), CoreError>;
    async fn profile(&self, id: Uuid) -> Result<Option<Profile>, CoreError>;
    async fn update_profile(&self, profile: Profile) -> Result<(), CoreError>;
    async fn profiles_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Profile>, CoreError>;
    async fn list_profiles(&self, filter: &ProfileFilter) -> Result<Vec<Profile>, CoreError>;

    // --- Positions & trade history -------------------------------------------
    async fn upsert_position(&self, position: Position) -> Result<(), CoreError>;
    async fn open_positions(&self, profile_id: Uuid) -> Result<Vec<Position>, CoreError>;
    async fn position(&self, profile_id: Uuid, ticket: i64)
        -> Result<Option<Position>, CoreError>;
    /// Remove the open position and append the trade record as one unit.
    async fn close_position(
        &self,
        profile_id: Uuid,
        ticket: i64,
        trade: TradeRecord,
    ) -> Result<(), CoreError>;
    async fn trades_for_profile(
        &self,
        profile_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, CoreError>;
    async fn count_open_positions(&self) -> Result<usize, CoreError>;

    // --- System events -------------------------------------------------------
    async fn insert_event(&self, event: SystemEvent) -> Result<(), CoreError>;
    async fn list_events(
        &self,
        filter: &EventFilter,
    ) -> Result<(Vec<SystemEvent>, usize), CoreError>;
    async fn acknowledge_events(&self, ids: &[Uuid], by: Uuid) -> Result<usize, CoreError>;

    // --- Decision audit ------------------------------------------------------
    /// Write the Decision and its sealed chain atomically.
    async fn record_decision(
        &self,
        decision: Decision,
        chain: DecisionChain,
    ) -> Result<(), CoreError>;
    async fn decision(&self, id: Uuid) -> Result<Option<Decision>, CoreError>;
    /// Durable replay lookup for an idempotency key within the TTL horizon.
    async fn decision_by_key(
        &self,
        profile_id: Uuid,
        key: &str,
        not_before: DateTime<Utc>,
    ) -> Result<Option<Decision>, CoreError>;
    async fn chain(&self, chain_id: &str) -> Result<Option<DecisionChain>, CoreError>;
    async fn chain_for_decision(
        &self,
        decision_id: Uuid,
    ) -> Result<Option<DecisionChain>, CoreError>;
    async fn decisions_for_profile(
        &self,
        profile_id: Uuid,
        filter: &DecisionFilter,
    ) -> Result<(Vec<Decision>, usize), CoreError>;
    async fn decisions_between(
        &self,
        profile_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Decision>, CoreError>;
    /// Pending/approved decisions whose `valid_until` has elapsed.
    async fn expired_candidates(&self, now: DateTime<Utc>) -> Result<Vec<Decision>, CoreError>;
    /// Transition a decision to `expired`, re-deriving its hash for the new
    /// terminal state. Returns the updated row.
    async fn mark_expired(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Decision>, CoreError>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    tenants: HashMap<Uuid, Tenant>,
    profiles: HashMap<Uuid, Profile>,
    positions: HashMap<(Uuid, i64), Position>,
    trades: Vec<TradeRecord>,
    events: Vec<SystemEvent>,
    decisions: HashMap<Uuid, Decision>,
    chains: HashMap<String, DecisionChain>,
    chain_by_decision: HashMap<Uuid, String>,
    /// When set, every write fails (test hook for the retryable-fault path).
    fail_writes: Option<String>,
}

/// Map-backed repository. All operations are linearised behind one lock,
/// which stands in for the transactional guarantees of a real store.
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<MemoryInner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (test hook).
    pub fn fail_writes(&self, reason: Option<&str>) {
        self.inner.write().fail_writes = reason.map(str::to_string);
    }

    fn check_writable(inner: &MemoryInner) -> Result<(), CoreError> {
        match &inner.fail_writes {
            Some(reason) => Err(CoreError::Repository(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_tenant(&self, tenant: Tenant) -> Result<(), CoreError> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        inner.tenants.insert(tenant.id, tenant);
        Ok(())
    }

    async fn tenant(&self, id: Uuid) -> Result<Option<Tenant>, CoreError> {
        Ok(self.inner.read().tenants.get(&id).cloned())
    }

    async fn tenant_by_token(&self, token: &str) -> Result<Option<Tenant>, CoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tenants
            .values()
            .find(|t| crate::api::auth::constant_time_eq(t.api_token.as_bytes(), token.as_bytes()))
            .cloned())
    }

    async fn update_tenant(&self, tenant: Tenant) -> Result<(), CoreError> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        if !inner.tenants.contains_key(&tenant.id) {
            return Err(CoreError::NotFound(format!("tenant {}", tenant.id)));
        }
        inner.tenants.insert(tenant.id, tenant);
        Ok(())
    }

    async fn list_tenants(&self, filter: &TenantFilter) -> Result<(Vec<Tenant>, usize), CoreError> {
        let inner = self.inner.read();
        let mut matched: Vec<Tenant> = inner
            .tenants
            .values()
            .filter(|t| {
                if let Some(search) = &filter.search {
                    let needle = search.to_lowercase();
                    if !t.email.to_lowercase().contains(&needle)
                        && !t.display_name.to_lowercase().contains(&needle)
                    {
                        return false;
                    }
                }
                if let Some(tier) = filter.tier {
                    if t.tier != tier {
                        return false;
                    }
                }
                if let Some(active) = filter.active {
                    if t.is_active() != active {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len();
        Ok((paginate(&matched, filter.page, filter.page_size), total))
    }

    async fn count_tenants(&self) -> Result<usize, CoreError> {
        Ok(self.inner.read().tenants.len())
    }

    async fn insert_profile(&self, profile: Profile) -> Result<(), CoreError> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        inner.profiles.insert(profile.id, profile);
        Ok(())
    }

    async fn profile(&self, id: Uuid) -> Result<Option<Profile>, CoreError> {
        Ok(self.inner.read().profiles.get(&id).cloned())
    }

    async fn update_profile(&self, profile: Profile) -> Result<(), CoreError> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        if !inner.profiles.contains_key(&profile.id) {
            return Err(CoreError::NotFound(format!("profile {}", profile.id)));
        }
        inner.profiles.insert(profile.id, profile);
        Ok(())
    }

    async fn profiles_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Profile>, CoreError> {
        let inner = self.inner.read();
        let mut out: Vec<Profile> = inner
            .profiles
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn list_profiles(&self, filter: &ProfileFilter) -> Result<Vec<Profile>, CoreError> {
        let inner = self.inner.read();
        let mut out: Vec<Profile> = inner
            .profiles
            .values()
            .filter(|p| {
                if let Some(tenant) = filter.tenant_id {
                    if p.tenant_id != tenant {
                        return false;
                    }
                }
                if let Some(connected) = filter.connected {
                    if p.connected != connected {
                        return false;
                    }
                }
                if let Some(enabled) = filter.trading_enabled {
                    if p.trading_enabled != enabled {
                        return false;
                    }
                }
                if let Some(broker) = &filter.broker {
                    if !p.broker_coords.contains(broker.as_str()) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn upsert_position(&self, position: Position) -> Result<(), CoreError> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        inner
            .positions
            .insert((position.profile_id, position.ticket), position);
        Ok(())
    }

    async fn open_positions(&self, profile_id: Uuid) -> Result<Vec<Position>, CoreError> {
        let inner = self.inner.read();
        let mut out: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| p.profile_id == profile_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.open_time.cmp(&b.open_time));
        Ok(out)
    }

    async fn position(
        &self,
        profile_id: Uuid,
        ticket: i64,
    ) -> Result<Option<Position>, CoreError> {
        Ok(self.inner.read().positions.get(&(profile_id, ticket)).cloned())
    }

    async fn close_position(
        &self,
        profile_id: Uuid,
        ticket: i64,
        trade: TradeRecord,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        if inner.positions.remove(&(profile_id, ticket)).is_none() {
            return Err(CoreError::NotFound(format!(
                "position {profile_id}/{ticket}"
            )));
        }
        inner.trades.push(trade);
        Ok(())
    }

    async fn trades_for_profile(
        &self,
        profile_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, CoreError> {
        let inner = self.inner.read();
        let mut out: Vec<TradeRecord> = inner
            .trades
            .iter()
            .filter(|t| t.profile_id == profile_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.close_time.cmp(&a.close_time));
        out.truncate(limit);
        Ok(out)
    }

    async fn count_open_positions(&self) -> Result<usize, CoreError> {
        Ok(self.inner.read().positions.len())
    }

    async fn insert_event(&self, event: SystemEvent) -> Result<(), CoreError> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        inner.events.push(event);
        Ok(())
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
    ) -> Result<(Vec<SystemEvent>, usize), CoreError> {
        let inner = self.inner.read();
        let mut matched: Vec<SystemEvent> = inner
            .events
            .iter()
            .filter(|e| {
                if let Some(sev) = filter.severity {
                    if e.severity != sev {
                        return false;
                    }
                }
                if let Some(kind) = &filter.event_type {
                    if &e.event_type != kind {
                        return false;
                    }
                }
                if let Some(ack) = filter.acknowledged {
                    if e.acknowledged != ack {
                        return false;
                    }
                }
                if let Some(profile) = filter.profile_id {
                    if e.profile_id != Some(profile) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len();
        Ok((paginate(&matched, filter.page, filter.page_size), total))
    }

    async fn acknowledge_events(&self, ids: &[Uuid], by: Uuid) -> Result<usize, CoreError> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        let mut count = 0;
        for event in inner.events.iter_mut() {
            if ids.contains(&event.id) && !event.acknowledged {
                event.acknowledged = true;
                event.acknowledged_by = Some(by);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn record_decision(
        &self,
        decision: Decision,
        chain: DecisionChain,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        inner
            .chain_by_decision
            .insert(decision.id, chain.chain_id.clone());
        inner.chains.insert(chain.chain_id.clone(), chain);
        inner.decisions.insert(decision.id, decision);
        Ok(())
    }

    async fn decision(&self, id: Uuid) -> Result<Option<Decision>, CoreError> {
        Ok(self.inner.read().decisions.get(&id).cloned())
    }

    async fn decision_by_key(
        &self,
        profile_id: Uuid,
        key: &str,
        not_before: DateTime<Utc>,
    ) -> Result<Option<Decision>, CoreError> {
        let inner = self.inner.read();
        Ok(inner
            .decisions
            .values()
            .filter(|d| {
                d.profile_id == profile_id
                    && d.idempotency_key == key
                    && d.created_at >= not_before
            })
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    async fn chain(&self, chain_id: &str) -> Result<Option<DecisionChain>, CoreError> {
        Ok(self.inner.read().chains.get(chain_id).cloned())
    }

    async fn chain_for_decision(
        &self,
        decision_id: Uuid,
    ) -> Result<Option<DecisionChain>, CoreError> {
        let inner = self.inner.read();
        Ok(inner
            .chain_by_decision
            .get(&decision_id)
            .and_then(|chain_id| inner.chains.get(chain_id))
            .cloned())
    }

    async fn decisions_for_profile(
        &self,
        profile_id: Uuid,
        filter: &DecisionFilter,
    ) -> Result<(Vec<Decision>, usize), CoreError> {
        let inner = self.inner.read();
        let mut matched: Vec<Decision> = inner
            .decisions
            .values()
            .filter(|d| {
                d.profile_id == profile_id
                    && filter.status.map_or(true, |s| d.decision == s)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len();
        Ok((paginate(&matched, filter.page, filter.page_size), total))
    }

    async fn decisions_between(
        &self,
        profile_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Decision>, CoreError> {
        let inner = self.inner.read();
        let mut out: Vec<Decision> = inner
            .decisions
            .values()
            .filter(|d| d.profile_id == profile_id && d.created_at >= from && d.created_at < to)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn expired_candidates(&self, now: DateTime<Utc>) -> Result<Vec<Decision>, CoreError> {
        let inner = self.inner.read();
        Ok(inner
            .decisions
            .values()
            .filter(|d| {
                matches!(
                    d.decision,
                    DecisionStatus::Pending | DecisionStatus::Approved
                ) && d.valid_until.map_or(false, |vu| vu <= now)
            })
            .cloned()
            .collect())
    }

    async fn mark_expired(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Decision>, CoreError> {
        let mut inner = self.inner.write();
        Self::check_writable(&inner)?;
        let Some(decision) = inner.decisions.get_mut(&id) else {
            return Ok(None);
        };
        decision.decision = DecisionStatus::Expired;
        decision.decision_reason = "valid_until elapsed".to_string();
        decision.decision_at = now;
        decision.decision_hash = decision.recompute_hash();
        Ok(Some(decision.clone()))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::compute_decision_hash;
    use crate::provenance::{ChainBuilder, DecisionNode, NodeKind, NodeSource};
    use crate::types::{Direction, PositionSide, SignalPriority, SignalSource, TenantStatus};
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, m, 0).unwrap()
    }

    fn tenant(email: &str, tier: Tier, admin: bool) -> Tenant {
        Tenant {
            id: Uuid::new_v4(),
            email: email.to_string(),
            display_name: email.split('@').next().unwrap_or("t").to_string(),
            status: TenantStatus::Active,
            tier,
            is_admin: admin,
            api_token: format!("token-{email}"),
            created_at: at(8, 0),
        }
    }

    fn decision(profile_id: Uuid, key: &str, status: DecisionStatus, created: DateTime<Utc>) -> Decision {
        let id = Uuid::new_v4();
        Decision {
            id,
            idempotency_key: key.to_string(),
            profile_id,
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            source: SignalSource::Strategy,
            priority: SignalPriority::Normal,
            confidence: 0.8,
            decision: status,
            decision_reason: String::new(),
            decision_at: created,
            gate_checks: vec![],
            created_at: created,
            valid_until: None,
            processing_ms: 1,
            strategy_name: None,
            model_version: None,
            decision_hash: compute_decision_hash(id, profile_id, "EURUSD", Direction::Buy, status, created),
            chain_id: format!("chain_{}", &Uuid::new_v4().simple().to_string()[..12]),
        }
    }

    fn chain_for(decision: &Decision) -> DecisionChain {
        let root = DecisionNode::new(
            Uuid::new_v4(),
            NodeKind::SignalValidated,
            NodeSource::SignalGate,
            decision.created_at,
            serde_json::json!({}),
            serde_json::json!({}),
            "validated",
            None,
        );
        let builder = ChainBuilder::open(Uuid::new_v4(), root);
        let mut chain = builder.seal(decision.decision.to_string(), decision.created_at);
        chain.chain_id = decision.chain_id.clone();
        chain
    }

    #[tokio::test]
    async fn tenant_lookup_by_token() {
        let repo = MemoryRepository::new();
        let t = tenant("ops@example.com", Tier::Pro, true);
        let token = t.api_token.clone();
        repo.insert_tenant(t.clone()).await.unwrap();

        let found = repo.tenant_by_token(&token).await.unwrap().unwrap();
        assert_eq!(found.id, t.id);
        assert!(repo.tenant_by_token("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tenant_filters_and_pagination() {
        let repo = MemoryRepository::new();
        for i in 0..5 {
            let mut t = tenant(&format!("user{i}@example.com"), Tier::Free, false);
            t.created_at = at(8, i);
            repo.insert_tenant(t).await.unwrap();
        }
        let mut pro = tenant("whale@example.com", Tier::Pro, false);
        pro.created_at = at(9, 0);
        repo.insert_tenant(pro).await.unwrap();

        let (page, total) = repo
            .list_tenants(&TenantFilter {
                page: 1,
                page_size: 3,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 6);
        assert_eq!(page.len(), 3);
        // Newest first.
        assert_eq!(page[0].email, "whale@example.com");

        let (found, total) = repo
            .list_tenants(&TenantFilter {
                tier: Some(Tier::Pro),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(found[0].email, "whale@example.com");

        let (found, _) = repo
            .list_tenants(&TenantFilter {
                search: Some("USER3".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn position_uniqueness_on_profile_and_ticket() {
        let repo = MemoryRepository::new();
        let profile = Uuid::new_v4();
        let base = Position {
            id: Uuid::new_v4(),
            profile_id: profile,
            ticket: 7,
            symbol: "EURUSD".into(),
            side: PositionSide::Buy,
            volume: 1.0,
            open_price: 1.08,
            current_price: 1.08,
            stop_loss: None,
            take_profit: None,
            swap: 0.0,
            commission: 0.0,
            profit: 0.0,
            signal_id: None,
            open_time: at(9, 0),
            updated_at: at(9, 0),
        };
        repo.upsert_position(base.clone()).await.unwrap();

        let mut updated = base.clone();
        updated.current_price = 1.09;
        repo.upsert_position(updated).await.unwrap();

        let open = repo.open_positions(profile).await.unwrap();
        assert_eq!(open.len(), 1);
        assert!((open[0].current_price - 1.09).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn close_position_moves_to_history() {
        let repo = MemoryRepository::new();
        let profile = Uuid::new_v4();
        let pos = Position {
            id: Uuid::new_v4(),
            profile_id: profile,
            ticket: 7,
            symbol: "EURUSD".into(),
            side: PositionSide::Buy,
            volume: 1.0,
            open_price: 1.08,
            current_price: 1.09,
            stop_loss: None,
            take_profit: None,
            swap: 0.0,
            commission: 0.0,
            profit: 10.0,
            signal_id: None,
            open_time: at(9, 0),
            updated_at: at(9, 0),
        };
        repo.upsert_position(pos.clone()).await.unwrap();
        let trade = pos.clone().into_trade(Uuid::new_v4(), 1.09, at(10, 0));
        repo.close_position(profile, 7, trade).await.unwrap();

        assert!(repo.open_positions(profile).await.unwrap().is_empty());
        let trades = repo.trades_for_profile(profile, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].ticket, 7);
    }

    #[tokio::test]
    async fn record_decision_is_atomic_under_write_failure() {
        let repo = MemoryRepository::new();
        let profile = Uuid::new_v4();
        let d = decision(profile, "k-000001", DecisionStatus::Approved, at(9, 0));
        let c = chain_for(&d);

        repo.fail_writes(Some("disk full"));
        let err = repo.record_decision(d.clone(), c.clone()).await.unwrap_err();
        assert_eq!(err.code(), "repository_fault");
        assert!(repo.decision(d.id).await.unwrap().is_none());
        assert!(repo.chain(&c.chain_id).await.unwrap().is_none());

        repo.fail_writes(None);
        repo.record_decision(d.clone(), c.clone()).await.unwrap();
        assert!(repo.decision(d.id).await.unwrap().is_some());
        assert_eq!(
            repo.chain_for_decision(d.id).await.unwrap().unwrap().chain_id,
            c.chain_id
        );
    }

    #[tokio::test]
    async fn decision_key_lookup_respects_horizon() {
        let repo = MemoryRepository::new();
        let profile = Uuid::new_v4();
        let d = decision(profile, "k-000001", DecisionStatus::Approved, at(9, 0));
        let c = chain_for(&d);
        repo.record_decision(d.clone(), c).await.unwrap();

        let hit = repo
            .decision_by_key(profile, "k-000001", at(8, 0))
            .await
            .unwrap();
        assert!(hit.is_some());

        let miss = repo
            .decision_by_key(profile, "k-000001", at(10, 0))
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn expiration_sweep_finds_and_marks() {
        let repo = MemoryRepository::new();
        let profile = Uuid::new_v4();
        let mut d = decision(profile, "k-000001", DecisionStatus::Approved, at(9, 0));
        d.valid_until = Some(at(9, 30));
        d.decision_hash = d.recompute_hash();
        let c = chain_for(&d);
        repo.record_decision(d.clone(), c).await.unwrap();

        assert!(repo.expired_candidates(at(9, 15)).await.unwrap().is_empty());
        let due = repo.expired_candidates(at(9, 30)).await.unwrap();
        assert_eq!(due.len(), 1);

        let updated = repo.mark_expired(d.id, at(9, 31)).await.unwrap().unwrap();
        assert_eq!(updated.decision, DecisionStatus::Expired);
        assert!(updated.verify_hash());
        assert!(repo.expired_candidates(at(9, 32)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_marks_only_requested_events() {
        let repo = MemoryRepository::new();
        let admin = Uuid::new_v4();
        let e1 = SystemEvent::new(Uuid::new_v4(), "drift_detected", Severity::Warning, "reconciler", "drift", at(9, 0));
        let e2 = SystemEvent::new(Uuid::new_v4(), "connection_lost", Severity::Critical, "pool", "lost", at(9, 1));
        repo.insert_event(e1.clone()).await.unwrap();
        repo.insert_event(e2.clone()).await.unwrap();

        let n = repo.acknowledge_events(&[e1.id], admin).await.unwrap();
        assert_eq!(n, 1);

        let (unacked, _) = repo
            .list_events(&EventFilter {
                acknowledged: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unacked.len(), 1);
        assert_eq!(unacked[0].id, e2.id);
    }
}
