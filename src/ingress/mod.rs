// =============================================================================
// Signal Ingress Pipeline — the authoritative gate for every signal
// =============================================================================
//
// Single path, no shortcuts: idempotency → rate limit → state fetch → gate
// chain → transactional persist → idempotency populate → event publish.
//
// Per-profile serialisation: the pipeline holds an exclusive async lease for
// the duration of one submit, so the rate-limit window, position count, and
// daily-cap counters each observe a consistent snapshot. Different profiles
// proceed independently.
//
// Failure discipline: the Decision row and its chain are written as one
// transactional unit, and the idempotency cache is populated only after that
// write succeeds — a persistence fault leaves no trace, so a retry with the
// same key is safe.
// =============================================================================

pub mod idempotency;
pub mod rate_limit;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, IdMinter};
use crate::config::CoreConfig;
use crate::decision::{Decision, GateCheckResult, SignalRequest, MAX_BATCH_SIZE};
use crate::emergency::EmergencyController;
use crate::error::CoreError;
use crate::events::{Event, EventHub, EventType};
use crate::gate::{GateContext, GateRegistry};
use crate::model::{Profile, Tenant};
use crate::provenance::{ChainBuilder, DecisionChain, DecisionNode, NodeKind, NodeSource};
use crate::repository::Repository;
use crate::types::{DecisionStatus, SignalPriority};

use self::idempotency::IdempotencyCache;
use self::rate_limit::{RateLimitStatus, RateLimiter};

// =============================================================================
// Batch & stats surface types
// =============================================================================

/// One element of a batch response: a Decision, or the per-signal error that
/// prevented one.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchItem {
    Decision(Box<Decision>),
    Error {
        error: String,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectionCount {
    pub reason: String,
    pub count: usize,
}

/// Aggregate signal statistics over a trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct SignalStats {
    pub profile_id: Uuid,
    pub period_hours: u64,
    pub total_signals: usize,
    pub approved: usize,
    pub rejected: usize,
    pub expired: usize,
    pub executed: usize,
    pub failed: usize,
    pub pending: usize,
    pub approval_rate: f64,
    pub execution_rate: f64,
    pub avg_confidence: f64,
    pub avg_processing_ms: u64,
    pub by_source: HashMap<String, usize>,
    pub top_rejection_reasons: Vec<RejectionCount>,
}

// =============================================================================
// SignalGate
// =============================================================================

pub struct SignalGate {
    repo: Arc<dyn Repository>,
    hub: Arc<EventHub>,
    registry: Arc<GateRegistry>,
    emergency: Arc<EmergencyController>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdMinter>,
    config: Arc<RwLock<CoreConfig>>,
    idempotency: IdempotencyCache,
    rate_limiter: RateLimiter,
    leases: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SignalGate {
    pub fn new(
        repo: Arc<dyn Repository>,
        hub: Arc<EventHub>,
        registry: Arc<GateRegistry>,
        emergency: Arc<EmergencyController>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdMinter>,
        config: Arc<RwLock<CoreConfig>>,
    ) -> Self {
        Self {
            repo,
            hub,
            registry,
            emergency,
            clock,
            ids,
            config,
            idempotency: IdempotencyCache::new(),
            rate_limiter: RateLimiter::new(),
            leases: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Visibility
    // -------------------------------------------------------------------------

    /// Resolve a profile the tenant may act on. Non-owned profiles read as
    /// absent rather than forbidden, so their existence does not leak.
    pub async fn ensure_visible(
        &self,
        tenant: &Tenant,
        profile_id: Uuid,
    ) -> Result<Profile, CoreError> {
        if !tenant.is_active() {
            return Err(CoreError::TenantForbidden("tenant is suspended".to_string()));
        }
        let profile = self
            .repo
            .profile(profile_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("profile {profile_id}")))?;
        if profile.tenant_id != tenant.id && !tenant.is_admin {
            return Err(CoreError::NotFound(format!("profile {profile_id}")));
        }
        Ok(profile)
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Submit one signal through the gate. Returns the durable Decision:
    /// rejections are ordinary 200-class outcomes, never transport errors.
    pub async fn submit(
        &self,
        tenant: &Tenant,
        profile_id: Uuid,
        request: SignalRequest,
    ) -> Result<Decision, CoreError> {
        let started = self.clock.monotonic();
        request.validate()?;
        let profile = self.ensure_visible(tenant, profile_id).await?;

        // Exclusive per-profile lease for the rest of the submit.
        let lease = self.lease(profile_id);
        let _guard = lease.lock().await;

        let now = self.clock.now_utc();
        let (ttl, capacity, cap) = {
            let config = self.config.read();
            (
                Duration::hours(config.idempotency_ttl_hours as i64),
                config.idempotency_capacity_per_profile,
                config.rate_limit_max_per_window,
            )
        };

        // 1. Idempotent replay — byte-identical response, zero side effects.
        if let Some(cached) = self.replay_lookup(profile_id, &request, now, ttl, capacity).await? {
            debug!(
                profile_id = %profile_id,
                key = %request.idempotency_key,
                "idempotent replay served"
            );
            return Ok(cached);
        }

        // 2. Already-expired signals never reach the gates and never consume
        //    the rate-limit window.
        if let Some(valid_until) = request.valid_until {
            if valid_until <= now {
                return self
                    .finalize_without_gates(
                        &profile,
                        &request,
                        DecisionStatus::Expired,
                        "valid_until elapsed".to_string(),
                        NodeKind::SignalExpired,
                        started,
                        now,
                    )
                    .await;
            }
        }

        // 3. Rate limit. Critical priority bypasses entirely (audited).
        if request.priority == SignalPriority::Critical {
            self.rate_limiter.record_critical_bypass(profile_id);
        } else {
            let status = self.rate_limiter.status(profile_id, cap, now);
            if status.is_limited {
                info!(
                    profile_id = %profile_id,
                    key = %request.idempotency_key,
                    "signal rejected by rate limit"
                );
                return self
                    .finalize_without_gates(
                        &profile,
                        &request,
                        DecisionStatus::Rejected,
                        "rate_limit".to_string(),
                        NodeKind::RiskRejected,
                        started,
                        now,
                    )
                    .await;
            }
        }

        // 4. Consistent state snapshot under the lease.
        let open_positions = self.repo.open_positions(profile_id).await?.len();
        let (day_start, day_end) = self.local_day_bounds(&profile);
        let decisions_today = self
            .repo
            .decisions_between(profile_id, day_start, day_end)
            .await?
            .len();
        let panic = self.emergency.panic_state(profile_id);

        // 5. Full gate chain — every gate is evaluated.
        let gate_config = profile.gate_config.clone();
        let ctx = GateContext {
            signal: &request,
            profile: &profile,
            config: &gate_config,
            open_positions,
            decisions_today,
            panic,
            now,
        };
        let (all_passed, checks) = self.registry.evaluate_all(&ctx);

        let (status, reason) = if all_passed {
            (DecisionStatus::Approved, "All gate checks passed".to_string())
        } else {
            let joined = checks
                .iter()
                .filter(|c| !c.passed)
                .filter_map(|c| c.reason.clone())
                .collect::<Vec<_>>()
                .join("; ");
            (DecisionStatus::Rejected, joined)
        };

        // 6. Chain construction: root, one node per gate, terminal verdict.
        let decision_at = self.clock.now_utc();
        let mut builder = self.open_chain(&profile, &request, now);
        for check in &checks {
            let kind = if check.passed {
                NodeKind::GatePassed
            } else {
                NodeKind::GateBlocked
            };
            let rationale = check
                .reason
                .clone()
                .unwrap_or_else(|| format!("{} passed", check.gate_name));
            let parent = builder.tip();
            builder.push(DecisionNode::new(
                self.ids.mint(),
                kind,
                NodeSource::SignalGate,
                now,
                json!({ "gate": check.gate_name }),
                json!({ "passed": check.passed, "reason": check.reason, "details": check.details }),
                rationale,
                Some(parent),
            ));
        }
        let terminal_kind = if all_passed {
            NodeKind::RiskApproved
        } else {
            NodeKind::RiskRejected
        };
        let parent = builder.tip();
        builder.push(DecisionNode::new(
            self.ids.mint(),
            terminal_kind,
            NodeSource::RiskEngine,
            decision_at,
            json!({}),
            json!({ "decision": status, "reason": reason }),
            reason.clone(),
            Some(parent),
        ));

        let decision = self.build_decision(
            &profile, &request, status, reason, checks, builder.chain_id(), started, decision_at,
        );
        let chain = builder.seal(status.to_string(), decision_at);

        // 7. Persist + cache + window tick + publish.
        let tick_window = request.priority != SignalPriority::Critical;
        self.commit(decision, chain, tick_window).await
    }

    /// Batch variant: up to [`MAX_BATCH_SIZE`] signals, processed
    /// independently in submission order.
    pub async fn submit_batch(
        &self,
        tenant: &Tenant,
        profile_id: Uuid,
        requests: Vec<SignalRequest>,
    ) -> Result<Vec<BatchItem>, CoreError> {
        if requests.is_empty() {
            return Err(CoreError::InputInvalid("batch must not be empty".to_string()));
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(CoreError::InputInvalid(format!(
                "batch accepts at most {MAX_BATCH_SIZE} signals, got {}",
                requests.len()
            )));
        }

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            match self.submit(tenant, profile_id, request).await {
                Ok(decision) => results.push(BatchItem::Decision(Box::new(decision))),
                Err(err) => results.push(BatchItem::Error {
                    error: err.code().to_string(),
                    message: err.to_string(),
                    retryable: err.retryable(),
                }),
            }
        }
        Ok(results)
    }

    // -------------------------------------------------------------------------
    // Read surface
    // -------------------------------------------------------------------------

    /// Current rate-limit window for a profile.
    pub fn rate_status(&self, profile_id: Uuid) -> RateLimitStatus {
        let cap = self.config.read().rate_limit_max_per_window;
        self.rate_limiter.status(profile_id, cap, self.clock.now_utc())
    }

    /// Run the idempotency janitor; returns how many entries were dropped.
    pub fn sweep_idempotency(&self) -> usize {
        let ttl = Duration::hours(self.config.read().idempotency_ttl_hours as i64);
        self.idempotency.sweep(self.clock.now_utc(), ttl)
    }

    /// Aggregate statistics over the trailing `hours`.
    pub async fn signal_stats(
        &self,
        profile_id: Uuid,
        hours: u64,
    ) -> Result<SignalStats, CoreError> {
        let now = self.clock.now_utc();
        let from = now - Duration::hours(hours as i64);
        // The store's upper bound is exclusive; nudge it so decisions stamped
        // at this exact instant are counted.
        let to = now + Duration::milliseconds(1);
        let decisions = self.repo.decisions_between(profile_id, from, to).await?;

        let total = decisions.len();
        let count = |status: DecisionStatus| {
            decisions.iter().filter(|d| d.decision == status).count()
        };
        let approved = count(DecisionStatus::Approved);
        let executed = count(DecisionStatus::Executed);

        let mut by_source: HashMap<String, usize> = HashMap::new();
        let mut rejection_reasons: HashMap<String, usize> = HashMap::new();
        for d in &decisions {
            *by_source.entry(d.source.to_string()).or_insert(0) += 1;
            if d.decision == DecisionStatus::Rejected {
                *rejection_reasons.entry(d.decision_reason.clone()).or_insert(0) += 1;
            }
        }
        let mut top_rejection_reasons: Vec<RejectionCount> = rejection_reasons
            .into_iter()
            .map(|(reason, count)| RejectionCount { reason, count })
            .collect();
        top_rejection_reasons.sort_by(|a, b| b.count.cmp(&a.count).then(a.reason.cmp(&b.reason)));
        top_rejection_reasons.truncate(5);

        let avg_confidence = if total > 0 {
            decisions.iter().map(|d| d.confidence).sum::<f64>() / total as f64
        } else {
            0.0
        };
        let avg_processing_ms = if total > 0 {
            decisions.iter().map(|d| d.processing_ms).sum::<u64>() / total as u64
        } else {
            0
        };

        Ok(SignalStats {
            profile_id,
            period_hours: hours,
            total_signals: total,
            approved,
            rejected: count(DecisionStatus::Rejected),
            expired: count(DecisionStatus::Expired),
            executed,
            failed: count(DecisionStatus::Failed),
            pending: count(DecisionStatus::Pending),
            approval_rate: percentage(approved, total),
            execution_rate: percentage(executed, approved),
            avg_confidence,
            avg_processing_ms,
            by_source,
            top_rejection_reasons,
        })
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn lease(&self, profile_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut leases = self.leases.lock();
        Arc::clone(
            leases
                .entry(profile_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Replay lookup: process cache first, durable Decision row second (the
    /// row is the source of truth across restarts). A key reuse with a
    /// different body is a conflict.
    async fn replay_lookup(
        &self,
        profile_id: Uuid,
        request: &SignalRequest,
        now: DateTime<Utc>,
        ttl: Duration,
        capacity: usize,
    ) -> Result<Option<Decision>, CoreError> {
        let cached = match self
            .idempotency
            .lookup(profile_id, &request.idempotency_key, now, ttl)
        {
            Some(decision) => Some(decision),
            None => {
                let horizon = now - ttl;
                let from_store = self
                    .repo
                    .decision_by_key(profile_id, &request.idempotency_key, horizon)
                    .await?;
                if let Some(decision) = &from_store {
                    // Repopulate the cache after a restart.
                    self.idempotency.insert(
                        profile_id,
                        &request.idempotency_key,
                        decision.clone(),
                        now,
                        capacity,
                    );
                }
                from_store
            }
        };

        match cached {
            None => Ok(None),
            Some(decision) if decision.matches_request(request) => Ok(Some(decision)),
            Some(_) => Err(CoreError::IdempotencyConflict(format!(
                "key '{}' was already used for a different signal",
                request.idempotency_key
            ))),
        }
    }

    /// Build and commit a decision that never reached the gate chain
    /// (expired on arrival, or rejected by the rate limiter).
    #[allow(clippy::too_many_arguments)]
    async fn finalize_without_gates(
        &self,
        profile: &Profile,
        request: &SignalRequest,
        status: DecisionStatus,
        reason: String,
        terminal_kind: NodeKind,
        started: std::time::Instant,
        now: DateTime<Utc>,
    ) -> Result<Decision, CoreError> {
        let mut builder = self.open_chain(profile, request, now);
        let parent = builder.tip();
        builder.push(DecisionNode::new(
            self.ids.mint(),
            terminal_kind,
            NodeSource::SignalGate,
            now,
            json!({}),
            json!({ "decision": status, "reason": reason }),
            reason.clone(),
            Some(parent),
        ));
        let decision = self.build_decision(
            profile,
            request,
            status,
            reason,
            Vec::new(),
            builder.chain_id(),
            started,
            now,
        );
        let chain = builder.seal(status.to_string(), now);
        // Neither path consumed the window.
        self.commit(decision, chain, false).await
    }

    fn open_chain(
        &self,
        profile: &Profile,
        request: &SignalRequest,
        now: DateTime<Utc>,
    ) -> ChainBuilder {
        let root = DecisionNode::new(
            self.ids.mint(),
            NodeKind::SignalValidated,
            NodeSource::SignalGate,
            now,
            json!({
                "idempotency_key": request.idempotency_key,
                "profile_id": profile.id,
                "symbol": request.symbol,
                "direction": request.direction,
                "source": request.source,
                "priority": request.priority,
                "confidence": request.confidence,
                "features": request.features,
            }),
            json!({}),
            "Signal accepted at ingress",
            None,
        );
        ChainBuilder::open(self.ids.mint(), root)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_decision(
        &self,
        profile: &Profile,
        request: &SignalRequest,
        status: DecisionStatus,
        reason: String,
        checks: Vec<GateCheckResult>,
        chain_id: &str,
        started: std::time::Instant,
        decision_at: DateTime<Utc>,
    ) -> Decision {
        let id = self.ids.mint();
        let decision_hash = crate::decision::compute_decision_hash(
            id,
            profile.id,
            &request.symbol,
            request.direction,
            status,
            decision_at,
        );
        Decision {
            id,
            idempotency_key: request.idempotency_key.clone(),
            profile_id: profile.id,
            symbol: request.symbol.clone(),
            direction: request.direction,
            source: request.source,
            priority: request.priority,
            confidence: request.confidence,
            decision: status,
            decision_reason: reason,
            decision_at,
            gate_checks: checks,
            created_at: decision_at,
            valid_until: request.valid_until,
            processing_ms: started.elapsed().as_millis() as u64,
            strategy_name: request.strategy_name.clone(),
            model_version: request.model_version.clone(),
            decision_hash,
            chain_id: chain_id.to_string(),
        }
    }

    async fn commit(
        &self,
        decision: Decision,
        chain: DecisionChain,
        tick_window: bool,
    ) -> Result<Decision, CoreError> {
        // Transactional unit. On failure the idempotency cache is untouched,
        // so the caller's retry reprocesses from scratch.
        self.repo.record_decision(decision.clone(), chain).await?;

        let now = self.clock.now_utc();
        let capacity = self.config.read().idempotency_capacity_per_profile;
        self.idempotency.insert(
            decision.profile_id,
            &decision.idempotency_key,
            decision.clone(),
            now,
            capacity,
        );
        if tick_window {
            self.rate_limiter.tick(decision.profile_id, now);
        }

        let event_type = match decision.decision {
            DecisionStatus::Approved => EventType::SignalApproved,
            DecisionStatus::Expired => EventType::SignalExpired,
            _ => EventType::SignalRejected,
        };
        self.hub.publish(Event::new(
            event_type,
            decision.profile_id,
            now,
            json!({
                "signal_id": decision.id,
                "idempotency_key": decision.idempotency_key,
                "symbol": decision.symbol,
                "direction": decision.direction,
                "confidence": decision.confidence,
                "decision": decision.decision,
                "reason": decision.decision_reason,
                "decision_hash": decision.decision_hash,
            }),
        ));

        if decision.decision == DecisionStatus::Rejected {
            debug!(
                signal_id = %decision.id,
                reason = %decision.decision_reason,
                "signal rejected"
            );
        }

        Ok(decision)
    }

    fn local_day_bounds(&self, profile: &Profile) -> (DateTime<Utc>, DateTime<Utc>) {
        let offset = Duration::minutes(i64::from(profile.tz_offset_minutes));
        let local_date = self.clock.local_date(profile.tz_offset_minutes);
        let local_midnight = match local_date.and_hms_opt(0, 0, 0) {
            Some(midnight) => midnight,
            None => {
                warn!("failed to derive local midnight, falling back to UTC day");
                return (
                    self.clock.now_utc() - Duration::hours(24),
                    self.clock.now_utc(),
                );
            }
        };
        let start = Utc.from_utc_datetime(&(local_midnight - offset));
        (start, start + Duration::hours(24))
    }
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

// =============================================================================
// Tests — end-to-end gate scenarios
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::clock::{ManualClock, SequentialIds};
    use crate::model::{AccountSnapshot, Position, Tenant};
    use crate::repository::MemoryRepository;
    use crate::types::{Direction, PositionSide, SignalSource, TenantStatus, Tier};
    use chrono::TimeZone;

    struct Fixture {
        gate: Arc<SignalGate>,
        repo: Arc<MemoryRepository>,
        hub: Arc<EventHub>,
        emergency: Arc<EmergencyController>,
        clock: Arc<ManualClock>,
        tenant: Tenant,
        profile: Profile,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let ids = Arc::new(SequentialIds::default());
        let repo = Arc::new(MemoryRepository::new());
        let hub = Arc::new(EventHub::new(clock.clone(), 64));
        let config = Arc::new(RwLock::new(CoreConfig::default()));
        let adapter = Arc::new(PaperBroker::new(clock.clone()));
        let emergency = Arc::new(EmergencyController::new(
            repo.clone(),
            adapter,
            hub.clone(),
            clock.clone(),
            ids.clone(),
            config.clone(),
        ));
        let registry = Arc::new(GateRegistry::from_names(&config.read().gate_order).unwrap());

        let tenant = Tenant {
            id: Uuid::new_v4(),
            email: "trader@example.com".into(),
            display_name: "Trader".into(),
            status: TenantStatus::Active,
            tier: Tier::Pro,
            is_admin: false,
            api_token: "trader-token-0001".into(),
            created_at: clock.now_utc(),
        };
        repo.insert_tenant(tenant.clone()).await.unwrap();

        // Scenario S1 baseline: connected, trading enabled, 1 open position,
        // snapshot {balance: 10000, equity: 10500}, max positions 3.
        let mut profile = Profile::new(
            Uuid::new_v4(),
            tenant.id,
            "main",
            "1001@paper",
            clock.now_utc(),
        );
        profile.connected = true;
        profile.trading_enabled = true;
        profile.gate_config.max_concurrent_positions = 3;
        profile.account = Some(AccountSnapshot {
            balance: 10_000.0,
            equity: 10_500.0,
            margin: 0.0,
            free_margin: 10_500.0,
            margin_level: 0.0,
            synced_at: clock.now_utc(),
        });
        repo.insert_profile(profile.clone()).await.unwrap();

        let now = clock.now_utc();
        repo.upsert_position(Position {
            id: Uuid::new_v4(),
            profile_id: profile.id,
            ticket: 1,
            symbol: "GBPUSD".into(),
            side: PositionSide::Buy,
            volume: 0.5,
            open_price: 1.27,
            current_price: 1.27,
            stop_loss: None,
            take_profit: None,
            swap: 0.0,
            commission: 0.0,
            profit: 0.0,
            signal_id: None,
            open_time: now,
            updated_at: now,
        })
        .await
        .unwrap();

        let gate = Arc::new(SignalGate::new(
            repo.clone(),
            hub.clone(),
            registry,
            emergency.clone(),
            clock.clone(),
            ids,
            config,
        ));

        Fixture {
            gate,
            repo,
            hub,
            emergency,
            clock,
            tenant,
            profile,
        }
    }

    fn request(key: &str, confidence: f64) -> SignalRequest {
        SignalRequest {
            idempotency_key: key.to_string(),
            symbol: "EURUSD".to_string(),
            direction: Direction::Buy,
            source: SignalSource::Strategy,
            priority: SignalPriority::Normal,
            confidence,
            reasoning: None,
            suggested_size: None,
            suggested_sl: None,
            suggested_tp: None,
            strategy_name: None,
            model_version: None,
            features: None,
            valid_until: None,
        }
    }

    #[tokio::test]
    async fn happy_path_approval() {
        let f = fixture().await;
        let mut rx = f.hub.subscribe(f.profile.id, Uuid::new_v4(), None);

        let decision = f
            .gate
            .submit(&f.tenant, f.profile.id, request("k-0001aa", 0.85))
            .await
            .unwrap();

        assert_eq!(decision.decision, DecisionStatus::Approved);
        assert_eq!(decision.gate_checks.len(), 7);
        assert!(decision.gate_checks.iter().all(|c| c.passed));
        assert!(decision.processing_ms <= 100);
        assert!(decision.verify_hash());

        // Exactly one signal_approved event.
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::SignalApproved);
        assert!(rx.try_recv().is_err());

        // Chain persisted and intact.
        let chain = f
            .repo
            .chain_for_decision(decision.id)
            .await
            .unwrap()
            .unwrap();
        assert!(chain.verify());
        assert_eq!(chain.outcome, "approved");
        assert_eq!(chain.nodes.len(), 9); // root + 7 gates + terminal
    }

    #[tokio::test]
    async fn low_confidence_rejection_still_evaluates_every_gate() {
        let f = fixture().await;

        let decision = f
            .gate
            .submit(&f.tenant, f.profile.id, request("k-0002aa", 0.50))
            .await
            .unwrap();

        assert_eq!(decision.decision, DecisionStatus::Rejected);
        assert_eq!(decision.gate_checks.len(), 7);
        let confidence = decision
            .gate_checks
            .iter()
            .find(|c| c.gate_name == "confidence")
            .unwrap();
        assert!(!confidence.passed);
        assert!(decision.decision_reason.contains("0.5"));
        assert!(decision.decision_reason.contains("0.7"));

        // One submit = one window tick, rejections included.
        assert_eq!(f.gate.rate_status(f.profile.id).current_count, 1);
    }

    #[tokio::test]
    async fn idempotent_replay_is_byte_identical_with_no_side_effects() {
        let f = fixture().await;
        let mut rx = f.hub.subscribe(f.profile.id, Uuid::new_v4(), None);

        let original = f
            .gate
            .submit(&f.tenant, f.profile.id, request("k-0003aa", 0.85))
            .await
            .unwrap();
        let _ = rx.recv().await.unwrap();
        let ticks_after_first = f.gate.rate_status(f.profile.id).current_count;

        f.clock.advance(Duration::minutes(0)); // same window
        let replay = f
            .gate
            .submit(&f.tenant, f.profile.id, request("k-0003aa", 0.85))
            .await
            .unwrap();

        assert_eq!(
            serde_json::to_string(&original).unwrap(),
            serde_json::to_string(&replay).unwrap()
        );
        assert_eq!(replay.decision_hash, original.decision_hash);
        assert_eq!(
            f.gate.rate_status(f.profile.id).current_count,
            ticks_after_first
        );
        assert!(rx.try_recv().is_err()); // no re-publish
    }

    #[tokio::test]
    async fn replay_survives_cache_restart_via_decision_row() {
        let f = fixture().await;
        let original = f
            .gate
            .submit(&f.tenant, f.profile.id, request("k-0004aa", 0.85))
            .await
            .unwrap();

        // A fresh gate (empty in-memory cache) sharing the same repository
        // stands in for a process restart.
        let config = Arc::new(RwLock::new(CoreConfig::default()));
        let registry = Arc::new(GateRegistry::from_names(&config.read().gate_order).unwrap());
        let restarted = SignalGate::new(
            f.repo.clone(),
            f.hub.clone(),
            registry,
            f.emergency.clone(),
            f.clock.clone(),
            Arc::new(SequentialIds::default()),
            config,
        );

        let replay = restarted
            .submit(&f.tenant, f.profile.id, request("k-0004aa", 0.85))
            .await
            .unwrap();
        assert_eq!(replay.id, original.id);
        assert_eq!(replay.decision_hash, original.decision_hash);
    }

    #[tokio::test]
    async fn key_reuse_with_different_body_conflicts() {
        let f = fixture().await;
        f.gate
            .submit(&f.tenant, f.profile.id, request("k-0005aa", 0.85))
            .await
            .unwrap();

        let err = f
            .gate
            .submit(&f.tenant, f.profile.id, request("k-0005aa", 0.60))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "idempotency_conflict");
    }

    #[tokio::test]
    async fn rate_limit_caps_window_and_critical_bypasses() {
        let f = fixture().await;

        let mut approved = 0;
        let mut rate_limited = 0;
        for i in 0..12 {
            let decision = f
                .gate
                .submit(&f.tenant, f.profile.id, request(&format!("k-10{i:02}aa"), 0.85))
                .await
                .unwrap();
            match decision.decision_reason.as_str() {
                "rate_limit" => {
                    rate_limited += 1;
                    assert!(decision.gate_checks.is_empty());
                }
                _ => {
                    approved += 1;
                    assert_eq!(decision.gate_checks.len(), 7);
                }
            }
        }
        assert_eq!(approved, 10);
        assert_eq!(rate_limited, 2);

        // Critical priority proceeds through the gates normally.
        let mut critical = request("k-13crit1", 0.85);
        critical.priority = SignalPriority::Critical;
        let decision = f
            .gate
            .submit(&f.tenant, f.profile.id, critical)
            .await
            .unwrap();
        assert_eq!(decision.gate_checks.len(), 7);
        assert_ne!(decision.decision_reason, "rate_limit");
        assert_eq!(f.gate.rate_status(f.profile.id).critical_bypasses, 1);
    }

    #[tokio::test]
    async fn panic_rejection_names_the_panic_first() {
        let f = fixture().await;

        // Drawdown controller trips: 0.20 > 0.15 threshold.
        let account = crate::broker::BrokerAccount {
            balance: 10_000.0,
            equity: 10_000.0,
            margin: 0.0,
            free_margin: 10_000.0,
            margin_level: 0.0,
            leverage: 100,
        };
        f.emergency.observe_account(&f.profile, account).await.unwrap();
        let dropped = crate::broker::BrokerAccount {
            equity: 8_000.0,
            free_margin: 8_000.0,
            ..account
        };
        f.emergency.observe_account(&f.profile, dropped).await.unwrap();

        let decision = f
            .gate
            .submit(&f.tenant, f.profile.id, request("k-0006aa", 0.90))
            .await
            .unwrap();
        assert_eq!(decision.decision, DecisionStatus::Rejected);
        assert!(decision.decision_reason.starts_with("Panic active"));
        let panic_check = decision
            .gate_checks
            .iter()
            .find(|c| c.gate_name == "panic_not_active")
            .unwrap();
        assert!(!panic_check.passed);
    }

    #[tokio::test]
    async fn per_profile_ordering_is_observable_in_daily_counts() {
        let f = fixture().await;
        let mut profile = f.profile.clone();
        profile.gate_config.max_daily_signals = 1;
        f.repo.update_profile(profile).await.unwrap();

        let first = f
            .gate
            .submit(&f.tenant, f.profile.id, request("k-0007aa", 0.85))
            .await
            .unwrap();
        assert_eq!(first.decision, DecisionStatus::Approved);

        // The second submission observes the first decision's side effect.
        let second = f
            .gate
            .submit(&f.tenant, f.profile.id, request("k-0008aa", 0.85))
            .await
            .unwrap();
        assert_eq!(second.decision, DecisionStatus::Rejected);
        assert!(second.decision_reason.contains("Daily limit"));
    }

    #[tokio::test]
    async fn expired_on_arrival_runs_no_gates_and_consumes_nothing() {
        let f = fixture().await;

        let mut req = request("k-0009aa", 0.85);
        req.valid_until = Some(f.clock.now_utc()); // equal to now = expired
        let decision = f.gate.submit(&f.tenant, f.profile.id, req).await.unwrap();

        assert_eq!(decision.decision, DecisionStatus::Expired);
        assert!(decision.gate_checks.is_empty());
        assert_eq!(f.gate.rate_status(f.profile.id).current_count, 0);
    }

    #[tokio::test]
    async fn persistence_fault_is_retryable_and_leaves_no_trace() {
        let f = fixture().await;

        f.repo.fail_writes(Some("storage offline"));
        let err = f
            .gate
            .submit(&f.tenant, f.profile.id, request("k-0010aa", 0.85))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "repository_fault");
        assert!(err.retryable());

        // Retry with the same key processes from scratch and succeeds.
        f.repo.fail_writes(None);
        let decision = f
            .gate
            .submit(&f.tenant, f.profile.id, request("k-0010aa", 0.85))
            .await
            .unwrap();
        assert_eq!(decision.decision, DecisionStatus::Approved);
    }

    #[tokio::test]
    async fn batch_is_bounded_and_independent() {
        let f = fixture().await;

        let ten: Vec<SignalRequest> = (0..10)
            .map(|i| request(&format!("k-20{i:02}aa"), 0.85))
            .collect();
        let results = f
            .gate
            .submit_batch(&f.tenant, f.profile.id, ten)
            .await
            .unwrap();
        assert_eq!(results.len(), 10);

        let eleven: Vec<SignalRequest> = (0..11)
            .map(|i| request(&format!("k-21{i:02}aa"), 0.85))
            .collect();
        let err = f
            .gate
            .submit_batch(&f.tenant, f.profile.id, eleven)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "input_invalid");
    }

    #[tokio::test]
    async fn foreign_profile_reads_as_absent() {
        let f = fixture().await;
        let stranger = Tenant {
            id: Uuid::new_v4(),
            email: "other@example.com".into(),
            display_name: "Other".into(),
            status: TenantStatus::Active,
            tier: Tier::Free,
            is_admin: false,
            api_token: "other-token-00001".into(),
            created_at: f.clock.now_utc(),
        };
        f.repo.insert_tenant(stranger.clone()).await.unwrap();

        let err = f
            .gate
            .submit(&stranger, f.profile.id, request("k-0011aa", 0.85))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn stats_aggregate_outcomes_and_reasons() {
        let f = fixture().await;
        f.gate
            .submit(&f.tenant, f.profile.id, request("k-3000aa", 0.85))
            .await
            .unwrap();
        f.gate
            .submit(&f.tenant, f.profile.id, request("k-3001aa", 0.40))
            .await
            .unwrap();
        f.gate
            .submit(&f.tenant, f.profile.id, request("k-3002aa", 0.45))
            .await
            .unwrap();

        let stats = f.gate.signal_stats(f.profile.id, 24).await.unwrap();
        assert_eq!(stats.total_signals, 3);
        assert_eq!(stats.approved, 1);
        assert_eq!(stats.rejected, 2);
        assert!((stats.approval_rate - 33.333).abs() < 0.01);
        assert_eq!(stats.by_source.get("strategy"), Some(&3));
        assert!(!stats.top_rejection_reasons.is_empty());
    }
}
