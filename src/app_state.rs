// =============================================================================
// Application state — the wired component graph
// =============================================================================
//
// Every component is constructed once at boot and injected where needed;
// there are no ambient registries. `AppState` is the composition root shared
// with the API layer via `Arc`.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;

use crate::admin::AdminService;
use crate::broker::BrokerAdapter;
use crate::clock::{Clock, IdMinter};
use crate::config::CoreConfig;
use crate::emergency::EmergencyController;
use crate::error::CoreError;
use crate::events::EventHub;
use crate::gate::GateRegistry;
use crate::ingress::SignalGate;
use crate::pool::ConnectionPool;
use crate::reconcile::Reconcilers;
use crate::repository::Repository;

/// Shared state for every request handler and background task.
pub struct AppState {
    pub config: Arc<RwLock<CoreConfig>>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdMinter>,
    pub repo: Arc<dyn Repository>,
    pub broker: Arc<dyn BrokerAdapter>,
    pub pool: Arc<ConnectionPool>,
    pub hub: Arc<EventHub>,
    pub emergency: Arc<EmergencyController>,
    pub signal_gate: Arc<SignalGate>,
    pub reconcilers: Arc<Reconcilers>,
    pub admin: AdminService,
}

impl AppState {
    /// Wire the full component graph from its capabilities.
    pub fn build(
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdMinter>,
        repo: Arc<dyn Repository>,
        broker: Arc<dyn BrokerAdapter>,
    ) -> Result<Arc<Self>, CoreError> {
        let registry = Arc::new(GateRegistry::from_names(&config.gate_order)?);
        let config = Arc::new(RwLock::new(config));

        let hub = Arc::new(EventHub::new(
            clock.clone(),
            config.read().event_outbox_capacity,
        ));
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
        let signal_gate = Arc::new(SignalGate::new(
            repo.clone(),
            hub.clone(),
            registry,
            emergency.clone(),
            clock.clone(),
            ids.clone(),
            config.clone(),
        ));
        let reconcilers = Arc::new(Reconcilers::new(
            repo.clone(),
            pool.clone(),
            broker.clone(),
            hub.clone(),
            emergency.clone(),
            signal_gate.clone(),
            clock.clone(),
            ids.clone(),
            config.clone(),
        ));
        let admin = AdminService::new(
            repo.clone(),
            pool.clone(),
            hub.clone(),
            emergency.clone(),
            reconcilers.clone(),
            clock.clone(),
            ids.clone(),
        );

        Ok(Arc::new(Self {
            config,
            clock,
            ids,
            repo,
            broker,
            pool,
            hub,
            emergency,
            signal_gate,
            reconcilers,
            admin,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::clock::{ManualClock, SequentialIds};
    use crate::repository::MemoryRepository;
    use chrono::TimeZone;
    use chrono::Utc;

    #[test]
    fn builds_the_full_graph() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let state = AppState::build(
            CoreConfig::default(),
            clock.clone(),
            Arc::new(SequentialIds::default()),
            Arc::new(MemoryRepository::new()),
            Arc::new(PaperBroker::new(clock)),
        )
        .unwrap();
        assert_eq!(state.pool.stats().live, 0);
        assert_eq!(state.hub.stats().total_subscribers, 0);
        assert_eq!(state.reconcilers.stats().len(), 4);
    }

    #[test]
    fn build_rejects_bad_gate_order() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let mut config = CoreConfig::default();
        config.gate_order = vec!["nonexistent".to_string()];
        let err = AppState::build(
            config,
            clock.clone(),
            Arc::new(SequentialIds::default()),
            Arc::new(MemoryRepository::new()),
            Arc::new(PaperBroker::new(clock)),
        )
        .err()
        .unwrap();
        assert_eq!(err.code(), "input_invalid");
    }
}
