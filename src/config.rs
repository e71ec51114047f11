// =============================================================================
// Configuration — per-profile gate settings and process-wide tuning
// =============================================================================
//
// Every field carries a serde default so that older JSON files keep loading
// after new options are added. Persistence uses an atomic tmp + rename write
// to prevent corruption on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_max_daily_signals() -> u32 {
    50
}

fn default_max_concurrent_positions() -> u32 {
    2
}

fn default_max_correlation_exposure() -> f64 {
    0.7
}

fn default_max_drawdown_to_trade() -> f64 {
    0.15
}

fn default_news_quiet_minutes() -> u32 {
    30
}

fn default_rate_limit_window_seconds() -> u64 {
    60
}

fn default_rate_limit_max_per_window() -> u32 {
    10
}

fn default_idempotency_ttl_hours() -> u64 {
    24
}

fn default_idempotency_capacity() -> usize {
    256
}

fn default_position_reconcile_seconds() -> u64 {
    30
}

fn default_account_sync_seconds() -> u64 {
    10
}

fn default_connection_health_seconds() -> u64 {
    15
}

fn default_signal_expiration_seconds() -> u64 {
    60
}

fn default_missing_remote_grace_seconds() -> u64 {
    120
}

fn default_pool_max_connections() -> usize {
    10
}

fn default_pool_idle_timeout_seconds() -> u64 {
    300
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_panic_cooldown_seconds() -> u64 {
    900
}

fn default_event_outbox_capacity() -> usize {
    64
}

fn default_heartbeat_interval_seconds() -> u64 {
    30
}

fn default_gate_order() -> Vec<String> {
    vec![
        "trading_enabled".to_string(),
        "panic_not_active".to_string(),
        "confidence".to_string(),
        "position_limit".to_string(),
        "drawdown".to_string(),
        "daily_limit".to_string(),
        "freshness".to_string(),
    ]
}

// =============================================================================
// GateConfig
// =============================================================================

/// Per-profile gate configuration, mutable by the owning tenant within
/// admin-imposed bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Minimum signal confidence required to pass the confidence gate.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Maximum decisions counted against a single local civil day.
    #[serde(default = "default_max_daily_signals")]
    pub max_daily_signals: u32,

    /// Maximum simultaneously open positions on the profile.
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    #[serde(default = "default_true")]
    pub require_positive_expectancy: bool,

    #[serde(default = "default_true")]
    pub require_regime_alignment: bool,

    #[serde(default = "default_max_correlation_exposure")]
    pub max_correlation_exposure: f64,

    /// Drawdown fraction above which the drawdown gate rejects new trades.
    #[serde(default = "default_max_drawdown_to_trade")]
    pub max_drawdown_to_trade: f64,

    /// Quiet window before scheduled news, in minutes.
    #[serde(default = "default_news_quiet_minutes")]
    pub no_trade_before_news_minutes: u32,

    /// Quiet window after scheduled news, in minutes.
    #[serde(default = "default_news_quiet_minutes")]
    pub no_trade_after_news_minutes: u32,

    /// "HH:MM-HH:MM" windows during which trading is allowed; empty = always.
    #[serde(default)]
    pub allowed_trading_hours: Vec<String>,

    #[serde(default = "default_true")]
    pub allow_manual_override: bool,

    #[serde(default = "default_true")]
    pub require_guardian_approval: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            max_daily_signals: default_max_daily_signals(),
            max_concurrent_positions: default_max_concurrent_positions(),
            require_positive_expectancy: true,
            require_regime_alignment: true,
            max_correlation_exposure: default_max_correlation_exposure(),
            max_drawdown_to_trade: default_max_drawdown_to_trade(),
            no_trade_before_news_minutes: default_news_quiet_minutes(),
            no_trade_after_news_minutes: default_news_quiet_minutes(),
            allowed_trading_hours: Vec::new(),
            allow_manual_override: true,
            require_guardian_approval: true,
        }
    }
}

/// Partial update to a profile's gate configuration. `None` leaves the
/// current value in place.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GateConfigPatch {
    pub min_confidence: Option<f64>,
    pub max_daily_signals: Option<u32>,
    pub max_concurrent_positions: Option<u32>,
    pub require_positive_expectancy: Option<bool>,
    pub require_regime_alignment: Option<bool>,
    pub max_correlation_exposure: Option<f64>,
    pub max_drawdown_to_trade: Option<f64>,
    pub no_trade_before_news_minutes: Option<u32>,
    pub no_trade_after_news_minutes: Option<u32>,
    pub allowed_trading_hours: Option<Vec<String>>,
    pub allow_manual_override: Option<bool>,
    pub require_guardian_approval: Option<bool>,
}

impl GateConfig {
    /// Apply a patch, validating every changed field against the
    /// admin-imposed bounds. Returns the offending field name on failure.
    pub fn apply_patch(&mut self, patch: &GateConfigPatch) -> std::result::Result<(), String> {
        if let Some(v) = patch.min_confidence {
            if !(0.0..=1.0).contains(&v) {
                return Err("min_confidence must be within [0, 1]".to_string());
            }
            self.min_confidence = v;
        }
        if let Some(v) = patch.max_daily_signals {
            if v == 0 || v > 10_000 {
                return Err("max_daily_signals must be within [1, 10000]".to_string());
            }
            self.max_daily_signals = v;
        }
        if let Some(v) = patch.max_concurrent_positions {
            if v == 0 || v > 500 {
                return Err("max_concurrent_positions must be within [1, 500]".to_string());
            }
            self.max_concurrent_positions = v;
        }
        if let Some(v) = patch.max_correlation_exposure {
            if !(0.0..=1.0).contains(&v) {
                return Err("max_correlation_exposure must be within [0, 1]".to_string());
            }
            self.max_correlation_exposure = v;
        }
        if let Some(v) = patch.max_drawdown_to_trade {
            if !(0.0..=1.0).contains(&v) {
                return Err("max_drawdown_to_trade must be within [0, 1]".to_string());
            }
            self.max_drawdown_to_trade = v;
        }
        if let Some(v) = patch.no_trade_before_news_minutes {
            self.no_trade_before_news_minutes = v;
        }
        if let Some(v) = patch.no_trade_after_news_minutes {
            self.no_trade_after_news_minutes = v;
        }
        if let Some(v) = &patch.allowed_trading_hours {
            self.allowed_trading_hours = v.clone();
        }
        if let Some(v) = patch.require_positive_expectancy {
            self.require_positive_expectancy = v;
        }
        if let Some(v) = patch.require_regime_alignment {
            self.require_regime_alignment = v;
        }
        if let Some(v) = patch.allow_manual_override {
            self.allow_manual_override = v;
        }
        if let Some(v) = patch.require_guardian_approval {
            self.require_guardian_approval = v;
        }
        Ok(())
    }
}

// =============================================================================
// CoreConfig
// =============================================================================

/// Process-wide configuration for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    // --- Signal ingress ------------------------------------------------------
    /// Rate-limit window length in seconds (fixed windows).
    #[serde(default = "default_rate_limit_window_seconds")]
    pub rate_limit_window_seconds: u64,

    /// Non-critical signals accepted per window per profile.
    #[serde(default = "default_rate_limit_max_per_window")]
    pub rate_limit_max_per_window: u32,

    /// How long an idempotency key binds to its first Decision.
    #[serde(default = "default_idempotency_ttl_hours")]
    pub idempotency_ttl_hours: u64,

    /// Backstop cap on cached decisions per profile (oldest-out).
    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity_per_profile: usize,

    /// Ordered list of gate names evaluated for every signal.
    #[serde(default = "default_gate_order")]
    pub gate_order: Vec<String>,

    // --- Reconcilers ---------------------------------------------------------
    #[serde(default = "default_position_reconcile_seconds")]
    pub position_reconcile_seconds: u64,

    #[serde(default = "default_account_sync_seconds")]
    pub account_sync_seconds: u64,

    #[serde(default = "default_connection_health_seconds")]
    pub connection_health_seconds: u64,

    #[serde(default = "default_signal_expiration_seconds")]
    pub signal_expiration_seconds: u64,

    /// Grace before a locally-open position missing at the broker is closed,
    /// absorbing event reordering.
    #[serde(default = "default_missing_remote_grace_seconds")]
    pub missing_remote_grace_seconds: u64,

    // --- Connection pool -----------------------------------------------------
    #[serde(default = "default_pool_max_connections")]
    pub pool_max_connections: usize,

    #[serde(default = "default_pool_idle_timeout_seconds")]
    pub pool_idle_timeout_seconds: u64,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    // --- Emergency controls --------------------------------------------------
    /// Cooldown after a panic trigger during which the panic gate keeps
    /// failing even if the trigger has recovered.
    #[serde(default = "default_panic_cooldown_seconds")]
    pub panic_cooldown_seconds: u64,

    // --- Event hub -----------------------------------------------------------
    /// Bounded outbox depth per subscriber; overflow drops the subscriber.
    #[serde(default = "default_event_outbox_capacity")]
    pub event_outbox_capacity: usize,

    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            rate_limit_window_seconds: default_rate_limit_window_seconds(),
            rate_limit_max_per_window: default_rate_limit_max_per_window(),
            idempotency_ttl_hours: default_idempotency_ttl_hours(),
            idempotency_capacity_per_profile: default_idempotency_capacity(),
            gate_order: default_gate_order(),
            position_reconcile_seconds: default_position_reconcile_seconds(),
            account_sync_seconds: default_account_sync_seconds(),
            connection_health_seconds: default_connection_health_seconds(),
            signal_expiration_seconds: default_signal_expiration_seconds(),
            missing_remote_grace_seconds: default_missing_remote_grace_seconds(),
            pool_max_connections: default_pool_max_connections(),
            pool_idle_timeout_seconds: default_pool_idle_timeout_seconds(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            panic_cooldown_seconds: default_panic_cooldown_seconds(),
            event_outbox_capacity: default_event_outbox_capacity(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            rate_limit = config.rate_limit_max_per_window,
            pool_cap = config.pool_max_connections,
            "core config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` using an atomic write (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise core config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "core config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gate_config_matches_documented_values() {
        let cfg = GateConfig::default();
        assert!((cfg.min_confidence - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.max_daily_signals, 50);
        assert_eq!(cfg.max_concurrent_positions, 2);
        assert!((cfg.max_drawdown_to_trade - 0.15).abs() < f64::EPSILON);
        assert_eq!(cfg.no_trade_before_news_minutes, 30);
        assert!(cfg.allow_manual_override);
        assert!(cfg.allowed_trading_hours.is_empty());
    }

    #[test]
    fn default_core_config_matches_documented_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.rate_limit_window_seconds, 60);
        assert_eq!(cfg.rate_limit_max_per_window, 10);
        assert_eq!(cfg.idempotency_ttl_hours, 24);
        assert_eq!(cfg.position_reconcile_seconds, 30);
        assert_eq!(cfg.account_sync_seconds, 10);
        assert_eq!(cfg.connection_health_seconds, 15);
        assert_eq!(cfg.signal_expiration_seconds, 60);
        assert_eq!(cfg.max_reconnect_attempts, 5);
        assert_eq!(cfg.gate_order.len(), 7);
        assert_eq!(cfg.gate_order[0], "trading_enabled");
        assert_eq!(cfg.gate_order[1], "panic_not_active");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.rate_limit_max_per_window, 10);
        assert_eq!(cfg.panic_cooldown_seconds, 900);

        let gate: GateConfig = serde_json::from_str("{}").unwrap();
        assert!((gate.min_confidence - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "rate_limit_max_per_window": 25, "pool_max_connections": 3 }"#;
        let cfg: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.rate_limit_max_per_window, 25);
        assert_eq!(cfg.pool_max_connections, 3);
        assert_eq!(cfg.idempotency_ttl_hours, 24);
    }

    #[test]
    fn gate_patch_validates_bounds() {
        let mut cfg = GateConfig::default();
        let ok = GateConfigPatch {
            min_confidence: Some(0.9),
            max_concurrent_positions: Some(5),
            ..Default::default()
        };
        cfg.apply_patch(&ok).unwrap();
        assert!((cfg.min_confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(cfg.max_concurrent_positions, 5);

        let bad = GateConfigPatch {
            min_confidence: Some(1.5),
            ..Default::default()
        };
        assert!(cfg.apply_patch(&bad).is_err());
        // Failed patch left the config untouched.
        assert!((cfg.min_confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = CoreConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.gate_order, cfg2.gate_order);
        assert_eq!(cfg.rate_limit_max_per_window, cfg2.rate_limit_max_per_window);
    }
}
