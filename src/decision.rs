// =============================================================================
// Signal requests and Decisions — the gate's auditable verdicts
// =============================================================================
//
// Every signal that enters the gate produces exactly one Decision. The
// Decision echoes the request, records every gate check, and carries a
// provenance hash derived from its canonical fields. Decisions are immutable
// once written; idempotent replays serve the stored value verbatim.
// =============================================================================

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{DecisionStatus, Direction, SignalPriority, SignalSource};

/// Inclusive bounds on the client-chosen idempotency key length.
pub const IDEMPOTENCY_KEY_MIN: usize = 8;
pub const IDEMPOTENCY_KEY_MAX: usize = 64;

/// Maximum signals accepted in one batch submission.
pub const MAX_BATCH_SIZE: usize = 10;

// =============================================================================
// SignalRequest
// =============================================================================

/// A request to potentially open or close a position. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    pub idempotency_key: String,
    pub symbol: String,
    pub direction: Direction,
    pub source: SignalSource,
    #[serde(default)]
    pub priority: SignalPriority,
    /// Producer confidence in [0, 1].
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_sl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_tp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    /// Open-schema feature bag carried through to the audit trail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl SignalRequest {
    /// Validate request shape. An already-elapsed `valid_until` is *not* a
    /// shape error — it produces an `expired` Decision downstream.
    pub fn validate(&self) -> Result<(), CoreError> {
        let key_len = self.idempotency_key.chars().count();
        if !(IDEMPOTENCY_KEY_MIN..=IDEMPOTENCY_KEY_MAX).contains(&key_len) {
            return Err(CoreError::InputInvalid(format!(
                "idempotency_key must be {IDEMPOTENCY_KEY_MIN}-{IDEMPOTENCY_KEY_MAX} chars, got {key_len}"
            )));
        }
        if self.symbol.trim().is_empty() {
            return Err(CoreError::InputInvalid("symbol must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.confidence) || self.confidence.is_nan() {
            return Err(CoreError::InputInvalid(format!(
                "confidence must be within [0, 1], got {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

// =============================================================================
// GateCheckResult
// =============================================================================

/// Outcome of a single gate check, recorded on the Decision in chain order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCheckResult {
    pub gate_name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GateCheckResult {
    pub fn pass(gate_name: impl Into<String>) -> Self {
        Self {
            gate_name: gate_name.into(),
            passed: true,
            reason: None,
            details: None,
        }
    }

    pub fn fail(gate_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            gate_name: gate_name.into(),
            passed: false,
            reason: Some(reason.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// =============================================================================
// Decision
// =============================================================================

/// The system's durable answer to a signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Signal id, minted on acceptance.
    pub id: Uuid,
    pub idempotency_key: String,
    pub profile_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub source: SignalSource,
    pub priority: SignalPriority,
    pub confidence: f64,
    pub decision: DecisionStatus,
    pub decision_reason: String,
    pub decision_at: DateTime<Utc>,
    /// Per-gate checks in chain order; empty when the gates never ran
    /// (rate-limited or expired submissions).
    pub gate_checks: Vec<GateCheckResult>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    pub processing_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    /// Provenance hash over the canonical decision fields.
    pub decision_hash: String,
    /// Id of the sealed decision chain persisted alongside this row.
    pub chain_id: String,
}

impl Decision {
    /// Recompute the provenance hash from this decision's canonical fields.
    pub fn recompute_hash(&self) -> String {
        compute_decision_hash(
            self.id,
            self.profile_id,
            &self.symbol,
            self.direction,
            self.decision,
            self.decision_at,
        )
    }

    /// Verify the stored hash against the canonical fields.
    pub fn verify_hash(&self) -> bool {
        self.decision_hash == self.recompute_hash()
    }

    /// Whether a replayed request matches the one that produced this
    /// decision. A mismatch means the client reused a key for a different
    /// signal, which is a conflict rather than a replay.
    pub fn matches_request(&self, req: &SignalRequest) -> bool {
        self.symbol == req.symbol
            && self.direction == req.direction
            && self.source == req.source
            && self.priority == req.priority
            && (self.confidence - req.confidence).abs() < f64::EPSILON
            && self.valid_until == req.valid_until
    }
}

/// Compute the provenance hash for a decision.
///
/// SHA-256 over `id|profile|symbol|direction|decision|timestamp`, truncated
/// to 32 hex characters. Distinct signals produce distinct hashes; a replay
/// of the stored decision reproduces the stored hash exactly.
pub fn compute_decision_hash(
    id: Uuid,
    profile_id: Uuid,
    symbol: &str,
    direction: Direction,
    decision: DecisionStatus,
    decision_at: DateTime<Utc>,
) -> String {
    let data = format!(
        "{id}|{profile_id}|{symbol}|{direction}|{decision}|{}",
        decision_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    );
    let digest = Sha256::digest(data.as_bytes());
    hex::encode(digest)[..32].to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

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

    #[test]
    fn key_length_boundaries() {
        assert!(request("k-000001", 0.8).validate().is_ok()); // exactly 8
        assert!(request(&"k".repeat(64), 0.8).validate().is_ok()); // exactly 64
        assert!(request("k-00001", 0.8).validate().is_err()); // 7
        assert!(request(&"k".repeat(65), 0.8).validate().is_err()); // 65
    }

    #[test]
    fn confidence_boundaries() {
        assert!(request("k-000001", 0.0).validate().is_ok());
        assert!(request("k-000001", 1.0).validate().is_ok());
        assert!(request("k-000001", -0.01).validate().is_err());
        assert!(request("k-000001", 1.01).validate().is_err());
    }

    #[test]
    fn empty_symbol_rejected() {
        let mut req = request("k-000001", 0.8);
        req.symbol = "  ".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn hash_is_deterministic_and_discriminating() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let id = Uuid::new_v4();
        let profile = Uuid::new_v4();

        let h1 = compute_decision_hash(id, profile, "EURUSD", Direction::Buy, DecisionStatus::Approved, at);
        let h2 = compute_decision_hash(id, profile, "EURUSD", Direction::Buy, DecisionStatus::Approved, at);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);

        let h3 = compute_decision_hash(id, profile, "EURUSD", Direction::Sell, DecisionStatus::Approved, at);
        assert_ne!(h1, h3);

        let h4 = compute_decision_hash(Uuid::new_v4(), profile, "EURUSD", Direction::Buy, DecisionStatus::Approved, at);
        assert_ne!(h1, h4);
    }

    #[test]
    fn decision_json_roundtrip_preserves_hash() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let id = Uuid::new_v4();
        let profile = Uuid::new_v4();
        let decision = Decision {
            id,
            idempotency_key: "k-000001".into(),
            profile_id: profile,
            symbol: "EURUSD".into(),
            direction: Direction::Buy,
            source: SignalSource::Strategy,
            priority: SignalPriority::Normal,
            confidence: 0.85,
            decision: DecisionStatus::Approved,
            decision_reason: "All gate checks passed".into(),
            decision_at: at,
            gate_checks: vec![GateCheckResult::pass("confidence")],
            created_at: at,
            valid_until: None,
            processing_ms: 3,
            strategy_name: None,
            model_version: None,
            decision_hash: compute_decision_hash(
                id,
                profile,
                "EURUSD",
                Direction::Buy,
                DecisionStatus::Approved,
                at,
            ),
            chain_id: "chain_000000000001".into(),
        };
        assert!(decision.verify_hash());

        let json = serde_json::to_string(&decision).unwrap();
        let parsed: Decision = serde_json::from_str(&json).unwrap();
        assert!(parsed.verify_hash());
        assert_eq!(parsed.decision_hash, decision.decision_hash);
    }

    #[test]
    fn replay_match_detects_body_drift() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let req = request("k-000001", 0.85);
        let decision = Decision {
            id: Uuid::new_v4(),
            idempotency_key: req.idempotency_key.clone(),
            profile_id: Uuid::new_v4(),
            symbol: req.symbol.clone(),
            direction: req.direction,
            source: req.source,
            priority: req.priority,
            confidence: req.confidence,
            decision: DecisionStatus::Approved,
            decision_reason: String::new(),
            decision_at: at,
            gate_checks: vec![],
            created_at: at,
            valid_until: None,
            processing_ms: 0,
            strategy_name: None,
            model_version: None,
            decision_hash: String::new(),
            chain_id: String::new(),
        };
        assert!(decision.matches_request(&req));

        let mut drifted = req.clone();
        drifted.confidence = 0.5;
        assert!(!decision.matches_request(&drifted));

        let mut drifted = req;
        drifted.direction = Direction::Sell;
        assert!(!decision.matches_request(&drifted));
    }
}
