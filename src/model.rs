// =============================================================================
// Domain entities — tenants, profiles, positions, trades, system events
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::GateConfig;
use crate::types::{AccountKind, PositionSide, Severity, TenantStatus, Tier};

// =============================================================================
// Tenant
// =============================================================================

/// A platform account. Created outside the core; the core consumes it by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub status: TenantStatus,
    pub tier: Tier,
    pub is_admin: bool,
    /// Opaque bearer token presented by the tenant's clients. Verification of
    /// how this was issued is out of scope; the core only matches it.
    #[serde(skip_serializing, default)]
    pub api_token: String,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

// =============================================================================
// Profile
// =============================================================================

/// Cached account figures from the most recent broker sync.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub margin_level: f64,
    pub synced_at: DateTime<Utc>,
}

/// A tenant-owned broker account binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub label: String,
    /// Opaque broker coordinates (e.g. "login@server"); the adapter decides
    /// what they mean.
    pub broker_coords: String,
    pub account_kind: AccountKind,
    pub connected: bool,
    pub trading_enabled: bool,
    /// Offset applied when computing the profile's civil day for daily caps.
    pub tz_offset_minutes: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountSnapshot>,
    pub gate_config: GateConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(
        id: Uuid,
        tenant_id: Uuid,
        label: impl Into<String>,
        broker_coords: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            label: label.into(),
            broker_coords: broker_coords.into(),
            account_kind: AccountKind::Demo,
            connected: false,
            trading_enabled: false,
            tz_offset_minutes: 0,
            account: None,
            gate_config: GateConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Position & TradeRecord
// =============================================================================

/// An open position mirrored from the broker. `profile_id + ticket` is
/// unique; closed positions move to [`TradeRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub ticket: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    pub swap: f64,
    pub commission: f64,
    /// Unrealised PnL as last reported by the broker.
    pub profit: f64,
    /// Signal id of the approved Decision that caused this position, when
    /// execution recorded one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<Uuid>,
    pub open_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A closed deal, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub ticket: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub volume: f64,
    pub open_price: f64,
    pub close_price: f64,
    pub swap: f64,
    pub commission: f64,
    /// Realised PnL of the deal.
    pub profit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<Uuid>,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
}

impl Position {
    /// Convert to an append-only trade record at close.
    pub fn into_trade(self, id: Uuid, close_price: f64, close_time: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            id,
            profile_id: self.profile_id,
            ticket: self.ticket,
            symbol: self.symbol,
            side: self.side,
            volume: self.volume,
            open_price: self.open_price,
            close_price,
            swap: self.swap,
            commission: self.commission,
            profit: self.profit,
            signal_id: self.signal_id,
            open_time: self.open_time,
            close_time,
        }
    }
}

// =============================================================================
// SystemEvent
// =============================================================================

/// An operational alert. Append-only; acknowledgement is a separate mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: Uuid,
    pub event_type: String,
    pub severity: Severity,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<Uuid>,
    pub message: String,
    /// Open-schema structured details.
    pub details: serde_json::Value,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(
        id: Uuid,
        event_type: impl Into<String>,
        severity: Severity,
        source: impl Into<String>,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            severity,
            source: source.into(),
            tenant_id: None,
            profile_id: None,
            message: message.into(),
            details: serde_json::Value::Null,
            acknowledged: false,
            acknowledged_by: None,
            created_at,
        }
    }

    pub fn with_profile(mut self, profile_id: Uuid) -> Self {
        self.profile_id = Some(profile_id);
        self
    }

    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
