// =============================================================================
// Emergency controls — kill switch, drawdown halts, panic hedge
// =============================================================================
//
// These controls never mutate a Decision. They raise per-profile PanicState,
// and the gate's `panic_not_active` check is the single code path through
// which new trades get rejected while a panic stands. Existing positions are
// only force-closed by the kill switch and the panic hedge, both of which go
// through the broker adapter's close hook.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerAccount, BrokerAdapter};
use crate::clock::{Clock, IdMinter};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::events::{Event, EventHub, EventType};
use crate::model::{Profile, SystemEvent, Tenant};
use crate::repository::Repository;
use crate::types::Severity;

// =============================================================================
// Panic state
// =============================================================================

/// What raised the panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanicTrigger {
    None,
    FlashCrash,
    VolSpike,
    SpreadBlowout,
    Drawdown,
    Manual,
}

impl std::fmt::Display for PanicTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::FlashCrash => write!(f, "flash_crash"),
            Self::VolSpike => write!(f, "vol_spike"),
            Self::SpreadBlowout => write!(f, "spread_blowout"),
            Self::Drawdown => write!(f, "drawdown"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Per-profile panic flag. Once raised it stays active until an admin
/// resets it; the reset is refused while the cooldown runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PanicState {
    pub active: bool,
    pub trigger: PanicTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl PanicState {
    pub fn raised(
        trigger: PanicTrigger,
        at: DateTime<Utc>,
        cooldown_until: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            active: true,
            trigger,
            triggered_at: Some(at),
            cooldown_until,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Outcome of a kill-switch invocation.
#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchReport {
    pub profile_id: Uuid,
    pub positions_closed: usize,
    pub close_errors: Vec<String>,
}

/// Outcome of a panic hedge.
#[derive(Debug, Clone, Serialize)]
pub struct PanicHedgeReport {
    pub profile_id: Uuid,
    pub trigger: PanicTrigger,
    pub positions_closed: usize,
    pub cooldown_until: DateTime<Utc>,
}

struct EquityWatch {
    peak: f64,
    warned: bool,
}

// =============================================================================
// EmergencyController
// =============================================================================

pub struct EmergencyController {
    repo: Arc<dyn Repository>,
    adapter: Arc<dyn BrokerAdapter>,
    hub: Arc<EventHub>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdMinter>,
    config: Arc<RwLock<CoreConfig>>,
    panics: RwLock<HashMap<Uuid, PanicState>>,
    watches: RwLock<HashMap<Uuid, EquityWatch>>,
}

impl EmergencyController {
    pub fn new(
        repo: Arc<dyn Repository>,
        adapter: Arc<dyn BrokerAdapter>,
        hub: Arc<EventHub>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdMinter>,
        config: Arc<RwLock<CoreConfig>>,
    ) -> Self {
        Self {
            repo,
            adapter,
            hub,
            clock,
            ids,
            config,
            panics: RwLock::new(HashMap::new()),
            watches: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Panic state for a profile, if one has ever been raised.
    pub fn panic_state(&self, profile_id: Uuid) -> Option<PanicState> {
        self.panics.read().get(&profile_id).copied()
    }

    /// All raised panic states, for the admin plane.
    pub fn panic_snapshot(&self) -> HashMap<Uuid, PanicState> {
        self.panics.read().clone()
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    /// Disable trading on the profile and flush every open position through
    /// the adapter's close hook. Re-enablement is a distinct admin action.
    pub async fn kill_switch(
        &self,
        actor: &Tenant,
        profile_id: Uuid,
    ) -> Result<KillSwitchReport, CoreError> {
        let now = self.clock.now_utc();
        let mut profile = self
            .repo
            .profile(profile_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("profile {profile_id}")))?;

        profile.trading_enabled = false;
        profile.updated_at = now;
        self.repo.update_profile(profile.clone()).await?;

        let (closed, errors) = self.flush_positions(profile_id).await?;

        warn!(
            profile_id = %profile_id,
            actor = %actor.id,
            positions_closed = closed,
            "kill switch activated"
        );

        self.repo
            .insert_event(
                SystemEvent::new(
                    self.ids.mint(),
                    "kill_switch",
                    Severity::Critical,
                    "emergency",
                    format!("Kill switch activated by {}", actor.email),
                    now,
                )
                .with_profile(profile_id)
                .with_tenant(profile.tenant_id)
                .with_details(json!({ "positions_closed": closed, "errors": errors })),
            )
            .await?;

        self.hub.publish(Event::new(
            EventType::KillSwitchActivated,
            profile_id,
            now,
            json!({ "positions_closed": closed, "activated_by": actor.id }),
        ));
        self.hub.publish(Event::new(
            EventType::TradingDisabled,
            profile_id,
            now,
            serde_json::Value::Null,
        ));

        Ok(KillSwitchReport {
            profile_id,
            positions_closed: closed,
            close_errors: errors,
        })
    }

    // -------------------------------------------------------------------------
    // Drawdown controller
    // -------------------------------------------------------------------------

    /// Observe one account-update. Tracks peak equity and trips the
    /// per-profile panic when the drop from peak exceeds the profile's
    /// configured threshold. Existing positions are left open: closing them
    /// is the panic hedge's job, not the drawdown controller's.
    pub async fn observe_account(
        &self,
        profile: &Profile,
        account: BrokerAccount,
    ) -> Result<(), CoreError> {
        let threshold = profile.gate_config.max_drawdown_to_trade;
        let now = self.clock.now_utc();

        let (drawdown, crossed_warning, crossed_halt) = {
            let mut watches = self.watches.write();
            let watch = watches.entry(profile.id).or_insert(EquityWatch {
                peak: account.equity,
                warned: false,
            });
            if account.equity > watch.peak {
                watch.peak = account.equity;
            }
            let drawdown = if watch.peak > 0.0 {
                (watch.peak - account.equity) / watch.peak
            } else {
                0.0
            };

            let warn_level = threshold * 0.75;
            let crossed_warning = drawdown >= warn_level && !watch.warned;
            if crossed_warning {
                watch.warned = true;
            } else if drawdown < warn_level {
                watch.warned = false;
            }

            let already_panicked = self
                .panics
                .read()
                .get(&profile.id)
                .map_or(false, |p| p.is_active());
            let crossed_halt = drawdown >= threshold && !already_panicked;

            (drawdown, crossed_warning, crossed_halt)
        };

        if crossed_warning {
            warn!(
                profile_id = %profile.id,
                drawdown_pct = drawdown * 100.0,
                "drawdown warning"
            );
            self.hub.publish(Event::new(
                EventType::DrawdownWarning,
                profile.id,
                now,
                json!({ "drawdown": drawdown, "threshold": threshold, "equity": account.equity }),
            ));
        }

        if crossed_halt {
            self.raise_panic(profile.id, PanicTrigger::Drawdown, now);
            error!(
                profile_id = %profile.id,
                drawdown_pct = drawdown * 100.0,
                threshold_pct = threshold * 100.0,
                "drawdown halt — panic raised"
            );
            self.repo
                .insert_event(
                    SystemEvent::new(
                        self.ids.mint(),
                        "drawdown_halt",
                        Severity::Critical,
                        "drawdown_controller",
                        format!(
                            "Drawdown {:.2}% breached {:.2}% — trading halted",
                            drawdown * 100.0,
                            threshold * 100.0
                        ),
                        now,
                    )
                    .with_profile(profile.id)
                    .with_tenant(profile.tenant_id)
                    .with_details(json!({ "drawdown": drawdown, "threshold": threshold })),
                )
                .await?;
            self.hub.publish(Event::new(
                EventType::DrawdownHalt,
                profile.id,
                now,
                json!({ "drawdown": drawdown, "threshold": threshold, "equity": account.equity }),
            ));
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Panic hedge
    // -------------------------------------------------------------------------

    /// Raise the panic for a profile and flush its open positions through the
    /// adapter. The cooldown keeps the panic gate failing even if the trigger
    /// recovers immediately.
    pub async fn panic_hedge(
        &self,
        profile_id: Uuid,
        trigger: PanicTrigger,
    ) -> Result<PanicHedgeReport, CoreError> {
        let now = self.clock.now_utc();
        let profile = self
            .repo
            .profile(profile_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("profile {profile_id}")))?;

        let cooldown_until = self.raise_panic(profile_id, trigger, now);
        let (closed, errors) = self.flush_positions(profile_id).await?;

        error!(
            profile_id = %profile_id,
            trigger = %trigger,
            positions_closed = closed,
            "panic hedge triggered"
        );

        self.repo
            .insert_event(
                SystemEvent::new(
                    self.ids.mint(),
                    "panic_hedge",
                    Severity::Critical,
                    "emergency",
                    format!("Panic hedge triggered ({trigger})"),
                    now,
                )
                .with_profile(profile_id)
                .with_tenant(profile.tenant_id)
                .with_details(json!({
                    "trigger": trigger,
                    "positions_closed": closed,
                    "errors": errors,
                    "cooldown_until": cooldown_until,
                })),
            )
            .await?;

        self.hub.publish(Event::new(
            EventType::PanicHedgeTriggered,
            profile_id,
            now,
            json!({
                "trigger": trigger,
                "positions_hedged": closed,
                "cooldown_until": cooldown_until,
            }),
        ));

        Ok(PanicHedgeReport {
            profile_id,
            trigger,
            positions_closed: closed,
            cooldown_until,
        })
    }

    /// Clear a profile's panic. Admin-only at the call site; refused while
    /// the cooldown is still running.
    pub fn reset_panic(&self, profile_id: Uuid) -> Result<(), CoreError> {
        let now = self.clock.now_utc();
        let mut panics = self.panics.write();
        let Some(state) = panics.get(&profile_id).copied() else {
            return Ok(());
        };
        if let Some(until) = state.cooldown_until {
            if now < until {
                return Err(CoreError::InputInvalid(format!(
                    "panic cooldown runs until {until}"
                )));
            }
        }
        panics.remove(&profile_id);
        self.watches.write().remove(&profile_id);
        info!(profile_id = %profile_id, "panic state reset");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn raise_panic(
        &self,
        profile_id: Uuid,
        trigger: PanicTrigger,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let cooldown =
            chrono::Duration::seconds(self.config.read().panic_cooldown_seconds as i64);
        let until = now + cooldown;
        self.panics
            .write()
            .insert(profile_id, PanicState::raised(trigger, now, Some(until)));
        until
    }

    /// Close every open position through the adapter and the repository,
    /// publishing `position_closed` per ticket. Individual close failures are
    /// collected, never fatal: a half-flushed book is still safer than an
    /// untouched one.
    async fn flush_positions(
        &self,
        profile_id: Uuid,
    ) -> Result<(usize, Vec<String>), CoreError> {
        let open = self.repo.open_positions(profile_id).await?;
        let mut closed = 0usize;
        let mut errors = Vec::new();

        for position in open {
            let ticket = position.ticket;
            if let Err(err) = self.adapter.close_position(profile_id, ticket).await {
                errors.push(format!("ticket {ticket}: {err}"));
                continue;
            }
            let now = self.clock.now_utc();
            let close_price = position.current_price;
            let trade = position.into_trade(self.ids.mint(), close_price, now);
            let symbol = trade.symbol.clone();
            let profit = trade.profit;
            self.repo.close_position(profile_id, ticket, trade).await?;
            self.hub.publish(Event::new(
                EventType::PositionClosed,
                profile_id,
                now,
                json!({ "ticket": ticket, "symbol": symbol, "profit": profit, "reason": "emergency_flush" }),
            ));
            closed += 1;
        }

        Ok((closed, errors))
    }
}
