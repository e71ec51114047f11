// =============================================================================
// Rate limiter — per-profile fixed-minute windows
// =============================================================================
//
// Counters are authoritative in process memory; a restart resets them, which
// is acceptable because the window is short and idempotency still prevents
// double-processing. Critical-priority signals bypass the limit but are
// counted separately so the bypasses remain auditable.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

/// Read-only view of a profile's current window.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub profile_id: Uuid,
    pub window_seconds: u64,
    pub max_signals: u32,
    pub current_count: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub is_limited: bool,
    pub critical_bypasses: u64,
}

struct Window {
    key: String,
    count: u32,
}

#[derive(Default)]
pub struct RateLimiter {
    windows: RwLock<HashMap<Uuid, Window>>,
    critical_bypasses: RwLock<HashMap<Uuid, u64>>,
}

fn window_key(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M").to_string()
}

fn next_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let minute_start = (now.timestamp() / 60) * 60;
    Utc.timestamp_opt(minute_start + 60, 0).single().unwrap_or(now)
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current window status for a profile. Stale windows reset lazily.
    pub fn status(&self, profile_id: Uuid, max_signals: u32, now: DateTime<Utc>) -> RateLimitStatus {
        let key = window_key(now);
        let current_count = {
            let mut windows = self.windows.write();
            match windows.get_mut(&profile_id) {
                Some(window) if window.key == key => window.count,
                Some(window) => {
                    window.key = key;
                    window.count = 0;
                    0
                }
                None => 0,
            }
        };
        let remaining = max_signals.saturating_sub(current_count);
        RateLimitStatus {
            profile_id,
            window_seconds: 60,
            max_signals,
            current_count,
            remaining,
            reset_at: next_window_start(now),
            is_limited: remaining == 0,
            critical_bypasses: self
                .critical_bypasses
                .read()
                .get(&profile_id)
                .copied()
                .unwrap_or(0),
        }
    }

    /// Consume one slot of the profile's current window.
    pub fn tick(&self, profile_id: Uuid, now: DateTime<Utc>) {
        let key = window_key(now);
        let mut windows = self.windows.write();
        let window = windows.entry(profile_id).or_insert_with(|| Window {
            key: key.clone(),
            count: 0,
        });
        if window.key != key {
            window.key = key;
            window.count = 0;
        }
        window.count += 1;
    }

    /// Audit a critical-priority bypass without consuming the window.
    pub fn record_critical_bypass(&self, profile_id: Uuid) {
        *self.critical_bypasses.write().entry(profile_id).or_insert(0) += 1;
    }
}
