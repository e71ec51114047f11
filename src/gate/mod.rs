// =============================================================================
// Gate evaluator — the ordered chain of risk checks
// =============================================================================
//
// Gates are registered once at startup from the configured order list.
// Every gate is evaluated for every signal — there is no first-failure
// short-circuit — so a rejection names every failing check and audit logs
// show the complete picture. The overall outcome is approved iff every gate
// passed.
// =============================================================================

pub mod checks;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::GateConfig;
use crate::decision::{GateCheckResult, SignalRequest};
use crate::emergency::PanicState;
use crate::error::CoreError;
use crate::model::Profile;

/// Everything a gate may look at. Assembled once per submission under the
/// profile lease, so all gates observe one consistent snapshot.
pub struct GateContext<'a> {
    pub signal: &'a SignalRequest,
    pub profile: &'a Profile,
    pub config: &'a GateConfig,
    /// Count of currently open positions on the profile.
    pub open_positions: usize,
    /// Decisions already recorded today (profile-local civil day).
    pub decisions_today: usize,
    /// Panic state for the profile, if any has been raised.
    pub panic: Option<PanicState>,
    pub now: DateTime<Utc>,
}

/// One pass/fail check in the evaluation chain. Implementations are pure
/// functions of the context.
pub trait GateCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, ctx: &GateContext<'_>) -> GateCheckResult;
}

/// Ordered set of gates built from configuration at startup. Adding a gate
/// means registering it here; the ingress pipeline never changes.
pub struct GateRegistry {
    gates: Vec<Arc<dyn GateCheck>>,
}

impl fmt::Debug for GateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateRegistry")
            .field("gates", &self.gate_names())
            .finish()
    }
}

impl GateRegistry {
    /// Build a registry from gate names in evaluation order.
    pub fn from_names(names: &[String]) -> Result<Self, CoreError> {
        let mut available: HashMap<&'static str, Arc<dyn GateCheck>> = HashMap::new();
        for gate in checks::builtin_gates() {
            available.insert(gate.name(), gate);
        }

        let mut gates = Vec::with_capacity(names.len());
        for name in names {
            let gate = available.get(name.as_str()).ok_or_else(|| {
                CoreError::InputInvalid(format!("unknown gate in configured order: {name}"))
            })?;
            gates.push(Arc::clone(gate));
        }
        Ok(Self { gates })
    }

    pub fn gate_names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    /// Run every gate in order. Returns the overall verdict and the full
    /// check list in chain order.
    pub fn evaluate_all(&self, ctx: &GateContext<'_>) -> (bool, Vec<GateCheckResult>) {
        let results: Vec<GateCheckResult> =
            self.gates.iter().map(|g| g.evaluate(ctx)).collect();
        let all_passed = results.iter().all(|r| r.passed);
        (all_passed, results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::types::{Direction, SignalPriority, SignalSource};
    use chrono::TimeZone;
    use uuid::Uuid;

    pub(crate) fn sample_request(confidence: f64) -> SignalRequest {
        SignalRequest {
            idempotency_key: "k-000001".to_string(),
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

    pub(crate) fn sample_profile(connected: bool, trading: bool) -> Profile {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut profile = Profile::new(Uuid::new_v4(), Uuid::new_v4(), "main", "1001@paper", now);
        profile.connected = connected;
        profile.trading_enabled = trading;
        profile
    }

    #[test]
    fn registry_builds_from_default_order() {
        let config = CoreConfig::default();
        let registry = GateRegistry::from_names(&config.gate_order).unwrap();
        assert_eq!(
            registry.gate_names(),
            vec![
                "trading_enabled",
                "panic_not_active",
                "confidence",
                "position_limit",
                "drawdown",
                "daily_limit",
                "freshness",
            ]
        );
    }

    #[test]
    fn registry_rejects_unknown_gate() {
        let err = GateRegistry::from_names(&["no_such_gate".to_string()]).unwrap_err();
        assert_eq!(err.code(), "input_invalid");
    }

    #[test]
    fn every_gate_is_evaluated_even_after_a_failure() {
        let config = CoreConfig::default();
        let registry = GateRegistry::from_names(&config.gate_order).unwrap();

        // Disconnected profile fails gate 1, low confidence fails gate 3 —
        // both must appear in the result list.
        let profile = sample_profile(false, false);
        let request = sample_request(0.1);
        let gate_config = profile.gate_config.clone();
        let ctx = GateContext {
            signal: &request,
            profile: &profile,
            config: &gate_config,
            open_positions: 0,
            decisions_today: 0,
            panic: None,
            now: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        };

        let (all_passed, results) = registry.evaluate_all(&ctx);
        assert!(!all_passed);
        assert_eq!(results.len(), 7);
        assert!(!results[0].passed); // trading_enabled
        assert!(!results[2].passed); // confidence
        assert!(results[6].passed); // freshness (no valid_until)
    }
}
