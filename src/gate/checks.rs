// =============================================================================
// Built-in gate checks
// =============================================================================
//
// The default chain, in order: trading_enabled, panic_not_active,
// confidence, position_limit, drawdown, daily_limit, freshness.
// =============================================================================

use std::sync::Arc;

use serde_json::json;

use crate::decision::GateCheckResult;

use super::{GateCheck, GateContext};

/// All gates the registry can resolve by name.
pub fn builtin_gates() -> Vec<Arc<dyn GateCheck>> {
    vec![
        Arc::new(TradingEnabledGate),
        Arc::new(PanicNotActiveGate),
        Arc::new(ConfidenceGate),
        Arc::new(PositionLimitGate),
        Arc::new(DrawdownGate),
        Arc::new(DailyLimitGate),
        Arc::new(FreshnessGate),
    ]
}

/// Gate 1: the profile must be connected with trading enabled.
pub struct TradingEnabledGate;

impl GateCheck for TradingEnabledGate {
    fn name(&self) -> &'static str {
        "trading_enabled"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> GateCheckResult {
        if !ctx.profile.connected {
            return GateCheckResult::fail(self.name(), "Profile not connected");
        }
        if !ctx.profile.trading_enabled {
            return GateCheckResult::fail(self.name(), "Trading not enabled");
        }
        GateCheckResult::pass(self.name())
    }
}

/// Gate 2: the single code path through which emergency controls reject new
/// trades.
pub struct PanicNotActiveGate;

impl GateCheck for PanicNotActiveGate {
    fn name(&self) -> &'static str {
        "panic_not_active"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> GateCheckResult {
        match &ctx.panic {
            Some(panic) if panic.is_active() => GateCheckResult::fail(
                self.name(),
                format!("Panic active: {}", panic.trigger),
            )
            .with_details(json!({
                "trigger": panic.trigger.to_string(),
                "triggered_at": panic.triggered_at,
                "cooldown_until": panic.cooldown_until,
            })),
            _ => GateCheckResult::pass(self.name()),
        }
    }
}

/// Gate 3: minimum confidence threshold.
pub struct ConfidenceGate;

impl GateCheck for ConfidenceGate {
    fn name(&self) -> &'static str {
        "confidence"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> GateCheckResult {
        let required = ctx.config.min_confidence;
        let actual = ctx.signal.confidence;
        if actual >= required {
            GateCheckResult::pass(self.name())
                .with_details(json!({ "required": required, "actual": actual }))
        } else {
            GateCheckResult::fail(
                self.name(),
                format!("Confidence {actual} < {required}"),
            )
            .with_details(json!({ "required": required, "actual": actual }))
        }
    }
}

/// Gate 4: concurrent position limit. Counts open positions only.
pub struct PositionLimitGate;

impl GateCheck for PositionLimitGate {
    fn name(&self) -> &'static str {
        "position_limit"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> GateCheckResult {
        let max = ctx.config.max_concurrent_positions as usize;
        let current = ctx.open_positions;
        if current < max {
            GateCheckResult::pass(self.name())
                .with_details(json!({ "max": max, "current": current }))
        } else {
            GateCheckResult::fail(
                self.name(),
                format!("Position limit reached ({current}/{max})"),
            )
            .with_details(json!({ "max": max, "current": current }))
        }
    }
}

/// Gate 5: drawdown on the most recent synced snapshot, never a per-request
/// broker round-trip. Non-positive balance passes rather than fails.
pub struct DrawdownGate;

impl GateCheck for DrawdownGate {
    fn name(&self) -> &'static str {
        "drawdown"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> GateCheckResult {
        let max = ctx.config.max_drawdown_to_trade;
        let current = match &ctx.profile.account {
            Some(account) if account.balance > 0.0 => {
                (account.balance - account.equity) / account.balance
            }
            _ => 0.0,
        };
        if current < max {
            GateCheckResult::pass(self.name())
                .with_details(json!({ "max": max, "current": current }))
        } else {
            GateCheckResult::fail(
                self.name(),
                format!(
                    "Drawdown {:.2}% exceeds {:.2}%",
                    current * 100.0,
                    max * 100.0
                ),
            )
            .with_details(json!({ "max": max, "current": current }))
        }
    }
}

/// Gate 6: daily signal cap against the profile-local civil day.
pub struct DailyLimitGate;

impl GateCheck for DailyLimitGate {
    fn name(&self) -> &'static str {
        "daily_limit"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> GateCheckResult {
        let max = ctx.config.max_daily_signals as usize;
        let current = ctx.decisions_today;
        if current < max {
            GateCheckResult::pass(self.name())
                .with_details(json!({ "max": max, "current": current }))
        } else {
            GateCheckResult::fail(
                self.name(),
                format!("Daily limit reached ({current}/{max})"),
            )
            .with_details(json!({ "max": max, "current": current }))
        }
    }
}

/// Gate 7: a `valid_until` equal to now counts as already expired.
pub struct FreshnessGate;

impl GateCheck for FreshnessGate {
    fn name(&self) -> &'static str {
        "freshness"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> GateCheckResult {
        match ctx.signal.valid_until {
            None => GateCheckResult::pass(self.name()),
            Some(valid_until) if valid_until > ctx.now => GateCheckResult::pass(self.name())
                .with_details(json!({ "valid_until": valid_until })),
            Some(valid_until) => GateCheckResult::fail(
                self.name(),
                format!("Signal expired at {valid_until}"),
            )
            .with_details(json!({ "valid_until": valid_until })),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::{PanicState, PanicTrigger};
    use crate::gate::tests::{sample_profile, sample_request};
    use crate::model::AccountSnapshot;
    use chrono::{Duration, TimeZone, Utc};

    fn ctx_now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    macro_rules! ctx {
        ($signal:expr, $profile:expr, $config:expr, $open:expr, $today:expr, $panic:expr) => {
            GateContext {
                signal: $signal,
                profile: $profile,
                config: $config,
                open_positions: $open,
                decisions_today: $today,
                panic: $panic,
                now: ctx_now(),
            }
        };
    }

    #[test]
    fn trading_enabled_distinguishes_reasons() {
        let request = sample_request(0.8);

        let profile = sample_profile(false, true);
        let config = profile.gate_config.clone();
        let result = TradingEnabledGate.evaluate(&ctx!(&request, &profile, &config, 0, 0, None));
        assert!(!result.passed);
        assert_eq!(result.reason.as_deref(), Some("Profile not connected"));

        let profile = sample_profile(true, false);
        let config = profile.gate_config.clone();
        let result = TradingEnabledGate.evaluate(&ctx!(&request, &profile, &config, 0, 0, None));
        assert!(!result.passed);
        assert_eq!(result.reason.as_deref(), Some("Trading not enabled"));

        let profile = sample_profile(true, true);
        let config = profile.gate_config.clone();
        assert!(TradingEnabledGate
            .evaluate(&ctx!(&request, &profile, &config, 0, 0, None))
            .passed);
    }

    #[test]
    fn panic_gate_blocks_while_active() {
        let request = sample_request(0.9);
        let profile = sample_profile(true, true);
        let config = profile.gate_config.clone();

        let panic = PanicState::raised(PanicTrigger::Drawdown, ctx_now(), None);
        let result =
            PanicNotActiveGate.evaluate(&ctx!(&request, &profile, &config, 0, 0, Some(panic)));
        assert!(!result.passed);
        assert!(result.reason.unwrap().contains("drawdown"));

        assert!(PanicNotActiveGate
            .evaluate(&ctx!(&request, &profile, &config, 0, 0, None))
            .passed);
    }

    #[test]
    fn confidence_reason_names_both_sides() {
        let request = sample_request(0.5);
        let profile = sample_profile(true, true);
        let config = profile.gate_config.clone();
        let result = ConfidenceGate.evaluate(&ctx!(&request, &profile, &config, 0, 0, None));
        assert!(!result.passed);
        let reason = result.reason.unwrap();
        assert!(reason.contains("0.5"));
        assert!(reason.contains("0.7"));
    }

    #[test]
    fn position_limit_counts_strictly() {
        let request = sample_request(0.9);
        let profile = sample_profile(true, true);
        let config = profile.gate_config.clone(); // max 2
        assert!(PositionLimitGate
            .evaluate(&ctx!(&request, &profile, &config, 1, 0, None))
            .passed);
        assert!(!PositionLimitGate
            .evaluate(&ctx!(&request, &profile, &config, 2, 0, None))
            .passed);
    }

    #[test]
    fn drawdown_uses_snapshot_and_passes_without_balance() {
        let request = sample_request(0.9);
        let mut profile = sample_profile(true, true);
        let config = profile.gate_config.clone(); // max 0.15

        // No snapshot at all: pass.
        assert!(DrawdownGate
            .evaluate(&ctx!(&request, &profile, &config, 0, 0, None))
            .passed);

        // 20% drawdown: fail.
        profile.account = Some(AccountSnapshot {
            balance: 10_000.0,
            equity: 8_000.0,
            margin: 0.0,
            free_margin: 8_000.0,
            margin_level: 0.0,
            synced_at: ctx_now(),
        });
        let result = DrawdownGate.evaluate(&ctx!(&request, &profile, &config, 0, 0, None));
        assert!(!result.passed);
        assert!(result.reason.unwrap().contains("20.00%"));

        // Non-positive balance treated as pass, not fail.
        profile.account = Some(AccountSnapshot {
            balance: 0.0,
            equity: -50.0,
            margin: 0.0,
            free_margin: 0.0,
            margin_level: 0.0,
            synced_at: ctx_now(),
        });
        assert!(DrawdownGate
            .evaluate(&ctx!(&request, &profile, &config, 0, 0, None))
            .passed);
    }

    #[test]
    fn daily_limit_boundary() {
        let request = sample_request(0.9);
        let profile = sample_profile(true, true);
        let config = profile.gate_config.clone(); // max 50
        assert!(DailyLimitGate
            .evaluate(&ctx!(&request, &profile, &config, 0, 49, None))
            .passed);
        assert!(!DailyLimitGate
            .evaluate(&ctx!(&request, &profile, &config, 0, 50, None))
            .passed);
    }

    #[test]
    fn freshness_treats_now_as_expired() {
        let profile = sample_profile(true, true);
        let config = profile.gate_config.clone();

        let mut request = sample_request(0.9);
        request.valid_until = Some(ctx_now());
        assert!(!FreshnessGate
            .evaluate(&ctx!(&request, &profile, &config, 0, 0, None))
            .passed);

        request.valid_until = Some(ctx_now() + Duration::seconds(1));
        assert!(FreshnessGate
            .evaluate(&ctx!(&request, &profile, &config, 0, 0, None))
            .passed);
    }
}
