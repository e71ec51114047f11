// =============================================================================
// Reconcilers — four periodic tasks keeping local state honest
// =============================================================================
//
// They continuously answer: "is reality still what we think it is?"
//   1. Position reconciliation  (default 30 s)
//   2. Account sync             (default 10 s)
//   3. Connection health        (default 15 s)
//   4. Signal expiration        (default 60 s)
//
// Each worker runs one cycle at a time, records its last run and last error,
// and never crashes the process. Ordering between workers is not guaranteed
// and correctness does not depend on it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerAdapter, BrokerPosition};
use crate::clock::{Clock, IdMinter};
use crate::config::CoreConfig;
use crate::emergency::EmergencyController;
use crate::error::CoreError;
use crate::events::{Event, EventHub, EventType};
use crate::ingress::SignalGate;
use crate::model::{AccountSnapshot, Position, SystemEvent};
use crate::pool::{ConnectionPool, ReconnectOutcome};
use crate::repository::Repository;
use crate::types::Severity;

const PRICE_EPSILON: f64 = 1e-9;

// =============================================================================
// Worker statistics
// =============================================================================

/// Operational record of one background worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub name: &'static str,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl WorkerStats {
    fn new(name: &'static str, started_at: DateTime<Utc>) -> Self {
        Self {
            name,
            started_at,
            last_run_at: None,
            run_count: 0,
            error_count: 0,
            last_error: None,
        }
    }
}

/// Classification of one row in a position diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Matched,
    Drift,
    MissingLocal,
    MissingRemote,
    Stale,
}

/// Summary of one position-reconciliation pass over one profile.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub matched: usize,
    pub drift_corrected: usize,
    pub created_local: usize,
    pub closed_local: usize,
    pub stale: usize,
    pub unresolved_drift: usize,
}

// =============================================================================
// Reconcilers
// =============================================================================

pub struct Reconcilers {
    repo: Arc<dyn Repository>,
    pool: Arc<ConnectionPool>,
    adapter: Arc<dyn BrokerAdapter>,
    hub: Arc<EventHub>,
    emergency: Arc<EmergencyController>,
    gate: Arc<SignalGate>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdMinter>,
    config: Arc<RwLock<CoreConfig>>,
    position_stats: RwLock<WorkerStats>,
    account_stats: RwLock<WorkerStats>,
    health_stats: RwLock<WorkerStats>,
    expiration_stats: RwLock<WorkerStats>,
}

impl Reconcilers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        pool: Arc<ConnectionPool>,
        adapter: Arc<dyn BrokerAdapter>,
        hub: Arc<EventHub>,
        emergency: Arc<EmergencyController>,
        gate: Arc<SignalGate>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdMinter>,
        config: Arc<RwLock<CoreConfig>>,
    ) -> Self {
        let started = clock.now_utc();
        Self {
            repo,
            pool,
            adapter,
            hub,
            emergency,
            gate,
            clock,
            ids,
            config,
            position_stats: RwLock::new(WorkerStats::new("position_reconciliation", started)),
            account_stats: RwLock::new(WorkerStats::new("account_sync", started)),
            health_stats: RwLock::new(WorkerStats::new("connection_health", started)),
            expiration_stats: RwLock::new(WorkerStats::new("signal_expiration", started)),
        }
    }

    /// Snapshot of all worker stats for the admin dashboard.
    pub fn stats(&self) -> Vec<WorkerStats> {
        vec![
            self.position_stats.read().clone(),
            self.account_stats.read().clone(),
            self.health_stats.read().clone(),
            self.expiration_stats.read().clone(),
        ]
    }

    /// Start all four workers. They stop when the shutdown watch flips true.
    pub fn spawn_all(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let intervals = {
            let config = self.config.read();
            [
                config.position_reconcile_seconds,
                config.account_sync_seconds,
                config.connection_health_seconds,
                config.signal_expiration_seconds,
            ]
        };

        let mut handles = Vec::with_capacity(4);

        let this = Arc::clone(self);
        let mut rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(intervals[0].max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.position_cycle().await,
                    _ = rx.changed() => if *rx.borrow() { break },
                }
            }
        }));

        let this = Arc::clone(self);
        let mut rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(intervals[1].max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.account_cycle().await,
                    _ = rx.changed() => if *rx.borrow() { break },
                }
            }
        }));

        let this = Arc::clone(self);
        let mut rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(intervals[2].max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.health_cycle().await,
                    _ = rx.changed() => if *rx.borrow() { break },
                }
            }
        }));

        let this = Arc::clone(self);
        let mut rx = shutdown;
        handles.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(intervals[3].max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.expiration_cycle().await,
                    _ = rx.changed() => if *rx.borrow() { break },
                }
            }
        }));

        info!("reconcilers started");
        handles
    }

    // -------------------------------------------------------------------------
    // 1. Position reconciliation
    // -------------------------------------------------------------------------

    pub async fn position_cycle(&self) {
        let result = self.position_cycle_inner().await;
        Self::note(&self.position_stats, self.clock.now_utc(), result);
    }

    async fn position_cycle_inner(&self) -> Result<(), CoreError> {
        let handles = self.pool.all();
        for handle in handles.iter().filter(|h| h.is_live()) {
            if let Err(err) = self.reconcile_profile(handle.profile_id).await {
                warn!(
                    profile_id = %handle.profile_id,
                    error = %err,
                    "position reconciliation failed for profile"
                );
            }
        }
        Ok(())
    }

    /// Diff one profile's local positions against the broker and heal.
    pub async fn reconcile_profile(&self, profile_id: Uuid) -> Result<ReconcileReport, CoreError> {
        let now = self.clock.now_utc();
        let grace = Duration::seconds(self.config.read().missing_remote_grace_seconds as i64);

        let remote = match self.adapter.positions(profile_id).await {
            Ok(positions) => positions,
            Err(err) => {
                self.pool.mark_degraded(profile_id, &err.to_string());
                return Err(err);
            }
        };
        let local = self.repo.open_positions(profile_id).await?;
        let local_by_ticket: HashMap<i64, &Position> =
            local.iter().map(|p| (p.ticket, p)).collect();
        let remote_tickets: std::collections::HashSet<i64> =
            remote.iter().map(|r| r.ticket).collect();

        let mut report = ReconcileReport {
            checked: remote.len() + local.len(),
            ..Default::default()
        };

        for broker_pos in &remote {
            match local_by_ticket.get(&broker_pos.ticket) {
                Some(local_pos) => {
                    match classify_diff(local_pos, broker_pos) {
                        DiffKind::Matched => report.matched += 1,
                        DiffKind::Drift => {
                            let mut updated = (*local_pos).clone();
                            updated.current_price = broker_pos.current_price;
                            updated.profit = broker_pos.profit;
                            updated.swap = broker_pos.swap;
                            updated.commission = broker_pos.commission;
                            updated.stop_loss = broker_pos.stop_loss;
                            updated.take_profit = broker_pos.take_profit;
                            updated.updated_at = now;
                            self.repo.upsert_position(updated).await?;
                            self.hub.publish(Event::new(
                                EventType::PositionUpdate,
                                profile_id,
                                now,
                                json!({
                                    "ticket": broker_pos.ticket,
                                    "current_price": broker_pos.current_price,
                                    "profit": broker_pos.profit,
                                    "swap": broker_pos.swap,
                                }),
                            ));
                            report.drift_corrected += 1;
                        }
                        // Identity fields disagree: this cannot be healed
                        // mechanically, so it becomes an alert instead.
                        _ => {
                            report.unresolved_drift += 1;
                            self.repo
                                .insert_event(
                                    SystemEvent::new(
                                        self.ids.mint(),
                                        "drift_detected",
                                        Severity::Warning,
                                        "position_reconciler",
                                        format!(
                                            "Unresolvable drift on ticket {}: local {}@{} vs broker {}@{}",
                                            broker_pos.ticket,
                                            local_pos.symbol,
                                            local_pos.volume,
                                            broker_pos.symbol,
                                            broker_pos.volume,
                                        ),
                                        now,
                                    )
                                    .with_profile(profile_id)
                                    .with_details(json!({
                                        "ticket": broker_pos.ticket,
                                        "local_symbol": local_pos.symbol,
                                        "remote_symbol": broker_pos.symbol,
                                        "local_volume": local_pos.volume,
                                        "remote_volume": broker_pos.volume,
                                    })),
                                )
                                .await?;
                        }
                    }
                }
                None => {
                    // In the broker's book but not ours: adopt it.
                    debug!(
                        ticket = broker_pos.ticket,
                        kind = ?DiffKind::MissingLocal,
                        "adopting broker-side position"
                    );
                    let position = Position {
                        id: self.ids.mint(),
                        profile_id,
                        ticket: broker_pos.ticket,
                        symbol: broker_pos.symbol.clone(),
                        side: broker_pos.side,
                        volume: broker_pos.volume,
                        open_price: broker_pos.open_price,
                        current_price: broker_pos.current_price,
                        stop_loss: broker_pos.stop_loss,
                        take_profit: broker_pos.take_profit,
                        swap: broker_pos.swap,
                        commission: broker_pos.commission,
                        profit: broker_pos.profit,
                        signal_id: None,
                        open_time: broker_pos.open_time,
                        updated_at: now,
                    };
                    self.repo.upsert_position(position).await?;
                    self.hub.publish(Event::new(
                        EventType::PositionOpened,
                        profile_id,
                        now,
                        json!({
                            "ticket": broker_pos.ticket,
                            "symbol": broker_pos.symbol,
                            "side": broker_pos.side,
                            "volume": broker_pos.volume,
                            "open_price": broker_pos.open_price,
                        }),
                    ));
                    report.created_local += 1;
                }
            }
        }

        // Ours but not the broker's: close after the grace period, which
        // absorbs open/close event reordering around a cycle boundary.
        for local_pos in &local {
            if remote_tickets.contains(&local_pos.ticket) {
                continue;
            }
            if now - local_pos.updated_at <= grace {
                report.stale += 1;
                continue;
            }
            debug!(
                ticket = local_pos.ticket,
                kind = ?DiffKind::MissingRemote,
                "closing local position absent at broker"
            );
            let ticket = local_pos.ticket;
            let close_price = local_pos.current_price;
            let trade = local_pos
                .clone()
                .into_trade(self.ids.mint(), close_price, now);
            let symbol = trade.symbol.clone();
            let profit = trade.profit;
            self.repo.close_position(profile_id, ticket, trade).await?;
            self.hub.publish(Event::new(
                EventType::PositionClosed,
                profile_id,
                now,
                json!({ "ticket": ticket, "symbol": symbol, "profit": profit, "reason": "missing_at_broker" }),
            ));
            report.closed_local += 1;
        }

        debug!(
            profile_id = %profile_id,
            matched = report.matched,
            drift = report.drift_corrected,
            created = report.created_local,
            closed = report.closed_local,
            "position reconciliation cycle"
        );
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // 2. Account sync
    // -------------------------------------------------------------------------

    pub async fn account_cycle(&self) {
        let result = self.account_cycle_inner().await;
        Self::note(&self.account_stats, self.clock.now_utc(), result);
    }

    async fn account_cycle_inner(&self) -> Result<(), CoreError> {
        for handle in self.pool.all().into_iter().filter(|h| h.is_live()) {
            let profile_id = handle.profile_id;
            let account = match self.adapter.account(profile_id).await {
                Ok(account) => account,
                Err(err) => {
                    self.pool.mark_degraded(profile_id, &err.to_string());
                    continue;
                }
            };
            let now = self.clock.now_utc();
            self.pool.record_account(profile_id, account);

            let Some(mut profile) = self.repo.profile(profile_id).await? else {
                continue;
            };
            profile.account = Some(AccountSnapshot {
                balance: account.balance,
                equity: account.equity,
                margin: account.margin,
                free_margin: account.free_margin,
                margin_level: account.margin_level,
                synced_at: now,
            });
            profile.updated_at = now;
            self.repo.update_profile(profile.clone()).await?;

            self.hub.publish(Event::new(
                EventType::AccountUpdate,
                profile_id,
                now,
                json!({
                    "balance": account.balance,
                    "equity": account.equity,
                    "margin": account.margin,
                    "free_margin": account.free_margin,
                    "margin_level": account.margin_level,
                    "profit": account.equity - account.balance,
                }),
            ));

            self.emergency.observe_account(&profile, account).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // 3. Connection health
    // -------------------------------------------------------------------------

    pub async fn health_cycle(&self) {
        let result = self.health_cycle_inner().await;
        Self::note(&self.health_stats, self.clock.now_utc(), result);
    }

    async fn health_cycle_inner(&self) -> Result<(), CoreError> {
        // Idle sessions close first; their profiles flip to disconnected.
        for profile_id in self.pool.evict_idle().await {
            self.set_profile_connected(profile_id, false).await?;
            self.hub.publish(Event::new(
                EventType::Disconnected,
                profile_id,
                self.clock.now_utc(),
                json!({ "reason": "idle_timeout" }),
            ));
        }

        // Degraded sessions get a backoff-respecting reconnect.
        for handle in self.pool.all() {
            match handle.state {
                crate::pool::HandleState::Degraded => {
                    match self.pool.try_reconnect(handle.profile_id).await {
                        Some(ReconnectOutcome::Restored(_)) => {
                            self.set_profile_connected(handle.profile_id, true).await?;
                            self.hub.publish(Event::new(
                                EventType::Connected,
                                handle.profile_id,
                                self.clock.now_utc(),
                                json!({ "reason": "reconnected" }),
                            ));
                        }
                        Some(ReconnectOutcome::GaveUp) => {
                            self.handle_connection_lost(handle.profile_id).await?;
                        }
                        _ => {}
                    }
                }
                crate::pool::HandleState::Closed => {
                    self.handle_connection_lost(handle.profile_id).await?;
                }
                _ => {}
            }
        }

        // Repair the handle/profile invariant: a handle exists iff the
        // profile is marked connected.
        let connected_profiles = self
            .repo
            .list_profiles(&crate::repository::ProfileFilter {
                connected: Some(true),
                ..Default::default()
            })
            .await?;
        for profile in connected_profiles {
            if self.pool.get(profile.id).map_or(true, |h| !h.is_live()) {
                debug!(profile_id = %profile.id, "repairing connected flag — no live handle");
                self.set_profile_connected(profile.id, false).await?;
            }
        }

        Ok(())
    }

    async fn handle_connection_lost(&self, profile_id: Uuid) -> Result<(), CoreError> {
        let now = self.clock.now_utc();
        self.pool.remove_closed(profile_id);
        self.set_profile_connected(profile_id, false).await?;

        error!(profile_id = %profile_id, "connection lost after exhausted reconnects");
        self.repo
            .insert_event(
                SystemEvent::new(
                    self.ids.mint(),
                    "connection_lost",
                    Severity::Critical,
                    "connection_health",
                    "Broker session lost after exhausted reconnect attempts",
                    now,
                )
                .with_profile(profile_id),
            )
            .await?;
        self.hub.publish(Event::new(
            EventType::ConnectionLost,
            profile_id,
            now,
            json!({ "reason": "reconnects_exhausted" }),
        ));
        Ok(())
    }

    async fn set_profile_connected(&self, profile_id: Uuid, connected: bool) -> Result<(), CoreError> {
        if let Some(mut profile) = self.repo.profile(profile_id).await? {
            if profile.connected != connected {
                profile.connected = connected;
                profile.updated_at = self.clock.now_utc();
                self.repo.update_profile(profile).await?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // 4. Signal expiration
    // -------------------------------------------------------------------------

    pub async fn expiration_cycle(&self) {
        let result = self.expiration_cycle_inner().await;
        Self::note(&self.expiration_stats, self.clock.now_utc(), result);
    }

    async fn expiration_cycle_inner(&self) -> Result<(), CoreError> {
        let now = self.clock.now_utc();
        for stale in self.repo.expired_candidates(now).await? {
            if let Some(updated) = self.repo.mark_expired(stale.id, now).await? {
                info!(signal_id = %updated.id, "decision expired by sweeper");
                self.hub.publish(Event::new(
                    EventType::SignalExpired,
                    updated.profile_id,
                    now,
                    json!({
                        "signal_id": updated.id,
                        "symbol": updated.symbol,
                        "valid_until": updated.valid_until,
                    }),
                ));
            }
        }

        let swept = self.gate.sweep_idempotency();
        if swept > 0 {
            debug!(entries = swept, "idempotency janitor sweep");
        }
        Ok(())
    }

    fn note(
        stats: &RwLock<WorkerStats>,
        now: DateTime<Utc>,
        result: Result<(), CoreError>,
    ) {
        let mut stats = stats.write();
        stats.run_count += 1;
        stats.last_run_at = Some(now);
        if let Err(err) = result {
            stats.error_count += 1;
            stats.last_error = Some(err.to_string());
        }
    }
}

/// Classify one remote/local pair. Identity fields that disagree are
/// unresolvable; value fields that disagree are correctable drift.
fn classify_diff(local: &Position, remote: &BrokerPosition) -> DiffKind {
    if local.symbol != remote.symbol
        || (local.volume - remote.volume).abs() > PRICE_EPSILON
        || (local.open_price - remote.open_price).abs() > PRICE_EPSILON
    {
        return DiffKind::Stale;
    }
    let drifted = (local.current_price - remote.current_price).abs() > PRICE_EPSILON
        || (local.profit - remote.profit).abs() > PRICE_EPSILON
        || (local.swap - remote.swap).abs() > PRICE_EPSILON
        || (local.commission - remote.commission).abs() > PRICE_EPSILON
        || local.stop_loss != remote.stop_loss
        || local.take_profit != remote.take_profit;
    if drifted {
        DiffKind::Drift
    } else {
        DiffKind::Matched
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
    use crate::gate::GateRegistry;
    use crate::model::{Profile, Tenant};
    use crate::repository::MemoryRepository;
    use crate::types::{PositionSide, TenantStatus, Tier};
    use chrono::TimeZone;

    struct Fixture {
        reconcilers: Arc<Reconcilers>,
        repo: Arc<MemoryRepository>,
        broker: Arc<PaperBroker>,
        pool: Arc<ConnectionPool>,
        hub: Arc<EventHub>,
        gate: Arc<SignalGate>,
        clock: Arc<ManualClock>,
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

        let mut profile = Profile::new(
            Uuid::new_v4(),
            tenant.id,
            "main",
            "1001@paper",
            clock.now_utc(),
        );
        profile.connected = true;
        profile.trading_enabled = true;
        repo.insert_profile(profile.clone()).await.unwrap();

        pool.connect(profile.id, "1001@paper", "pw").await.unwrap();

        let reconcilers = Arc::new(Reconcilers::new(
            repo.clone(),
            pool.clone(),
            broker.clone(),
            hub.clone(),
            emergency,
            gate.clone(),
            clock.clone(),
            ids,
            config,
        ));

        Fixture {
            reconcilers,
            repo,
            broker,
            pool,
            hub,
            gate,
            clock,
            profile,
        }
    }

    fn local_position(profile_id: Uuid, ticket: i64, price: f64, at: DateTime<Utc>) -> Position {
        Position {
            id: Uuid::new_v4(),
            profile_id,
            ticket,
            symbol: "EURUSD".into(),
            side: PositionSide::Buy,
            volume: 1.0,
            open_price: 1.08,
            current_price: price,
            stop_loss: None,
            take_profit: None,
            swap: 0.0,
            commission: 0.0,
            profit: 0.0,
            signal_id: None,
            open_time: at,
            updated_at: at,
        }
    }

    fn broker_position(ticket: i64, price: f64, at: DateTime<Utc>) -> BrokerPosition {
        BrokerPosition {
            ticket,
            symbol: "EURUSD".into(),
            side: PositionSide::Buy,
            volume: 1.0,
            open_price: 1.08,
            current_price: price,
            stop_loss: None,
            take_profit: None,
            swap: 0.0,
            commission: 0.0,
            profit: 0.0,
            open_time: at,
        }
    }

    #[tokio::test]
    async fn routine_drift_is_corrected_with_one_event_and_no_alert() {
        let f = fixture().await;
        let now = f.clock.now_utc();

        f.repo
            .upsert_position(local_position(f.profile.id, 900, 1.08500, now))
            .await
            .unwrap();
        f.broker
            .seed_position(f.profile.id, broker_position(900, 1.08620, now));

        let mut rx = f.hub.subscribe(f.profile.id, Uuid::new_v4(), None);
        let report = f
            .reconcilers
            .reconcile_profile(f.profile.id)
            .await
            .unwrap();
        assert_eq!(report.drift_corrected, 1);
        assert_eq!(report.unresolved_drift, 0);

        let local = f
            .repo
            .position(f.profile.id, 900)
            .await
            .unwrap()
            .unwrap();
        assert!((local.current_price - 1.08620).abs() < 1e-9);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::PositionUpdate);
        assert!(rx.try_recv().is_err());

        let (alerts, _) = f
            .repo
            .list_events(&crate::repository::EventFilter::default())
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn missing_remote_closes_after_grace() {
        let f = fixture().await;
        let opened = f.clock.now_utc();
        f.repo
            .upsert_position(local_position(f.profile.id, 901, 1.08500, opened))
            .await
            .unwrap();

        // Within grace: row is stale, not closed.
        let report = f
            .reconcilers
            .reconcile_profile(f.profile.id)
            .await
            .unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(report.closed_local, 0);

        // Grace elapsed: row closes and position_closed fires.
        f.clock.advance(Duration::seconds(121));
        let mut rx = f.hub.subscribe(f.profile.id, Uuid::new_v4(), None);
        let report = f
            .reconcilers
            .reconcile_profile(f.profile.id)
            .await
            .unwrap();
        assert_eq!(report.closed_local, 1);
        assert!(f.repo.open_positions(f.profile.id).await.unwrap().is_empty());
        assert_eq!(f.repo.trades_for_profile(f.profile.id, 10).await.unwrap().len(), 1);
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::PositionClosed);
    }

    #[tokio::test]
    async fn missing_local_is_adopted() {
        let f = fixture().await;
        let now = f.clock.now_utc();
        f.broker
            .seed_position(f.profile.id, broker_position(902, 1.0900, now));

        let mut rx = f.hub.subscribe(f.profile.id, Uuid::new_v4(), None);
        let report = f
            .reconcilers
            .reconcile_profile(f.profile.id)
            .await
            .unwrap();
        assert_eq!(report.created_local, 1);
        assert!(f
            .repo
            .position(f.profile.id, 902)
            .await
            .unwrap()
            .is_some());
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::PositionOpened);
    }

    #[tokio::test]
    async fn identity_drift_raises_alert_not_correction() {
        let f = fixture().await;
        let now = f.clock.now_utc();
        f.repo
            .upsert_position(local_position(f.profile.id, 903, 1.0850, now))
            .await
            .unwrap();
        let mut remote = broker_position(903, 1.0850, now);
        remote.volume = 2.0; // identity field disagrees

        f.broker.seed_position(f.profile.id, remote);
        let report = f
            .reconcilers
            .reconcile_profile(f.profile.id)
            .await
            .unwrap();
        assert_eq!(report.unresolved_drift, 1);
        assert_eq!(report.drift_corrected, 0);

        let (alerts, _) = f
            .repo
            .list_events(&crate::repository::EventFilter {
                event_type: Some("drift_detected".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test]
    async fn account_cycle_updates_snapshot_and_publishes() {
        let f = fixture().await;
        let mut rx = f.hub.subscribe(f.profile.id, Uuid::new_v4(), None);

        f.reconcilers.account_cycle().await;

        let profile = f.repo.profile(f.profile.id).await.unwrap().unwrap();
        let snapshot = profile.account.unwrap();
        assert!((snapshot.balance - 10_000.0).abs() < f64::EPSILON);

        assert_eq!(rx.recv().await.unwrap().event_type, EventType::AccountUpdate);

        let stats = f.reconcilers.stats();
        let account_stats = stats.iter().find(|s| s.name == "account_sync").unwrap();
        assert_eq!(account_stats.run_count, 1);
        assert_eq!(account_stats.error_count, 0);
    }

    #[tokio::test]
    async fn health_cycle_repairs_connected_flag() {
        let f = fixture().await;

        // Profile says connected, but its handle is gone.
        f.pool.disconnect(f.profile.id).await.unwrap();
        f.reconcilers.health_cycle().await;

        let profile = f.repo.profile(f.profile.id).await.unwrap().unwrap();
        assert!(!profile.connected);
    }

    #[tokio::test]
    async fn expiration_cycle_expires_and_notifies() {
        let f = fixture().await;

        // An approved decision with a short validity window.
        let tenant = f.repo.tenant_by_token("trader-token-0001").await.unwrap().unwrap();
        let mut request = crate::decision::SignalRequest {
            idempotency_key: "k-exp0001".into(),
            symbol: "EURUSD".into(),
            direction: crate::types::Direction::Buy,
            source: crate::types::SignalSource::Strategy,
            priority: crate::types::SignalPriority::Normal,
            confidence: 0.9,
            reasoning: None,
            suggested_size: None,
            suggested_sl: None,
            suggested_tp: None,
            strategy_name: None,
            model_version: None,
            features: None,
            valid_until: None,
        };
        request.valid_until = Some(f.clock.now_utc() + Duration::minutes(5));

        // Snapshot so the drawdown gate passes.
        let mut profile = f.repo.profile(f.profile.id).await.unwrap().unwrap();
        profile.account = Some(AccountSnapshot {
            balance: 10_000.0,
            equity: 10_000.0,
            margin: 0.0,
            free_margin: 10_000.0,
            margin_level: 0.0,
            synced_at: f.clock.now_utc(),
        });
        f.repo.update_profile(profile).await.unwrap();

        let decision = f.gate.submit(&tenant, f.profile.id, request).await.unwrap();
        assert_eq!(decision.decision, crate::types::DecisionStatus::Approved);

        let mut rx = f.hub.subscribe(f.profile.id, Uuid::new_v4(), None);
        f.clock.advance(Duration::minutes(6));
        f.reconcilers.expiration_cycle().await;

        let expired = f.repo.decision(decision.id).await.unwrap().unwrap();
        assert_eq!(expired.decision, crate::types::DecisionStatus::Expired);
        assert!(expired.verify_hash());
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::SignalExpired);
    }
}
