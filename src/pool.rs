// =============================================================================
// Connection Pool — one live broker session per profile, capped globally
// =============================================================================
//
// Handle state machine:
//   idle → connecting → live → (live | degraded | closing) → closed
//
// The pool owns the handle table and talks only to the broker adapter. It
// knows nothing about the Event Hub: the reconcilers observe pool state and
// publish lifecycle events. Reconnects use exponential backoff with jitter
// up to a ceiling; the attempt counter resets when a session goes live.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{BrokerAccount, BrokerAdapter};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::CoreError;

// =============================================================================
// Handle types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    Idle,
    Connecting,
    Live,
    Degraded,
    Closing,
    Closed,
}

/// Read-only snapshot of one pooled session.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHandle {
    pub profile_id: Uuid,
    pub state: HandleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<BrokerAccount>,
}

impl ConnectionHandle {
    pub fn is_live(&self) -> bool {
        self.state == HandleState::Live
    }
}

struct HandleEntry {
    handle: ConnectionHandle,
    coords: String,
    credential: String,
    next_attempt_at: Option<DateTime<Utc>>,
}

/// Result of a `connect` call.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub already_connected: bool,
    pub account: BrokerAccount,
    pub message: String,
}

/// Result of a health-driven reconnect attempt.
#[derive(Debug, Clone)]
pub enum ReconnectOutcome {
    /// Session restored; counter reset.
    Restored(BrokerAccount),
    /// Backoff window not yet elapsed, or another attempt is in flight.
    Waiting,
    /// Attempts exhausted; the handle is closed and the caller should alert.
    GaveUp,
}

/// Pool statistics for the admin dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub total: usize,
    pub live: usize,
    pub degraded: usize,
    pub connecting: usize,
    pub total_reconnects: u64,
}

// =============================================================================
// ConnectionPool
// =============================================================================

pub struct ConnectionPool {
    adapter: Arc<dyn BrokerAdapter>,
    clock: Arc<dyn Clock>,
    config: Arc<RwLock<CoreConfig>>,
    entries: RwLock<HashMap<Uuid, HandleEntry>>,
    total_reconnects: AtomicU64,
}

impl ConnectionPool {
    pub fn new(
        adapter: Arc<dyn BrokerAdapter>,
        clock: Arc<dyn Clock>,
        config: Arc<RwLock<CoreConfig>>,
    ) -> Self {
        Self {
            adapter,
            clock,
            config,
            entries: RwLock::new(HashMap::new()),
            total_reconnects: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Connect / disconnect
    // -------------------------------------------------------------------------

    /// Open a session for the profile. Idempotent: connecting an already-live
    /// profile returns `already_connected` without touching the adapter.
    pub async fn connect(
        &self,
        profile_id: Uuid,
        coords: &str,
        credential: &str,
    ) -> Result<ConnectOutcome, CoreError> {
        let cap = self.config.read().pool_max_connections;

        {
            let mut entries = self.entries.write();

            if let Some(entry) = entries.get(&profile_id) {
                if entry.handle.state == HandleState::Live {
                    let account = entry.handle.account.ok_or_else(|| {
                        CoreError::Internal("live handle without account cache".to_string())
                    })?;
                    return Ok(ConnectOutcome {
                        already_connected: true,
                        account,
                        message: "Already connected".to_string(),
                    });
                }
            }

            // Connecting sessions count toward the cap so that racing
            // connects cannot overshoot it.
            let active = entries
                .values()
                .filter(|e| {
                    matches!(e.handle.state, HandleState::Live | HandleState::Connecting)
                })
                .count();
            if active >= cap {
                return Err(CoreError::PoolFull { cap });
            }

            entries.insert(
                profile_id,
                HandleEntry {
                    handle: ConnectionHandle {
                        profile_id,
                        state: HandleState::Connecting,
                        connected_at: None,
                        last_heartbeat: None,
                        reconnect_attempts: 0,
                        error: None,
                        account: None,
                    },
                    coords: coords.to_string(),
                    credential: credential.to_string(),
                    next_attempt_at: None,
                },
            );
        }

        match self.adapter.connect(profile_id, coords, credential).await {
            Ok(account) => {
                let now = self.clock.now_utc();
                let mut entries = self.entries.write();
                if let Some(entry) = entries.get_mut(&profile_id) {
                    entry.handle.state = HandleState::Live;
                    entry.handle.connected_at = Some(now);
                    entry.handle.last_heartbeat = Some(now);
                    entry.handle.reconnect_attempts = 0;
                    entry.handle.error = None;
                    entry.handle.account = Some(account);
                    entry.next_attempt_at = None;
                }
                info!(profile_id = %profile_id, coords, "broker session live");
                Ok(ConnectOutcome {
                    already_connected: false,
                    account,
                    message: "Connected successfully".to_string(),
                })
            }
            Err(err) => {
                let now = self.clock.now_utc();
                let delay = self.backoff_delay(0);
                let mut entries = self.entries.write();
                if let Some(entry) = entries.get_mut(&profile_id) {
                    entry.handle.state = HandleState::Degraded;
                    entry.handle.error = Some(err.to_string());
                    entry.next_attempt_at = Some(now + delay);
                }
                warn!(profile_id = %profile_id, error = %err, "broker connect failed");
                Err(err)
            }
        }
    }

    /// Close the session. Idempotent; cancels any pending reconnect.
    pub async fn disconnect(&self, profile_id: Uuid) -> Result<(), CoreError> {
        {
            let mut entries = self.entries.write();
            match entries.get_mut(&profile_id) {
                None => return Ok(()),
                Some(entry) => {
                    entry.handle.state = HandleState::Closing;
                    entry.next_attempt_at = None;
                }
            }
        }

        if let Err(err) = self.adapter.disconnect(profile_id).await {
            warn!(profile_id = %profile_id, error = %err, "adapter disconnect failed (session dropped anyway)");
        }

        self.entries.write().remove(&profile_id);
        info!(profile_id = %profile_id, "broker session closed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn get(&self, profile_id: Uuid) -> Option<ConnectionHandle> {
        self.entries.read().get(&profile_id).map(|e| e.handle.clone())
    }

    pub fn all(&self) -> Vec<ConnectionHandle> {
        self.entries.read().values().map(|e| e.handle.clone()).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let entries = self.entries.read();
        let count = |state: HandleState| {
            entries.values().filter(|e| e.handle.state == state).count()
        };
        PoolStats {
            capacity: self.config.read().pool_max_connections,
            total: entries.len(),
            live: count(HandleState::Live),
            degraded: count(HandleState::Degraded),
            connecting: count(HandleState::Connecting),
            total_reconnects: self.total_reconnects.load(Ordering::Relaxed),
        }
    }

    // -------------------------------------------------------------------------
    // Health maintenance (driven by the reconcilers)
    // -------------------------------------------------------------------------

    /// Refresh the heartbeat and cached account after a successful poll.
    pub fn record_account(&self, profile_id: Uuid, account: BrokerAccount) {
        let now = self.clock.now_utc();
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&profile_id) {
            entry.handle.account = Some(account);
            entry.handle.last_heartbeat = Some(now);
        }
    }

    /// Transition a live handle to degraded after a missed heartbeat or a
    /// transient adapter error, scheduling its first reconnect.
    pub fn mark_degraded(&self, profile_id: Uuid, reason: &str) {
        let now = self.clock.now_utc();
        let delay = self.backoff_delay(0);
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&profile_id) {
            if entry.handle.state == HandleState::Live {
                entry.handle.state = HandleState::Degraded;
                entry.handle.error = Some(reason.to_string());
                entry.next_attempt_at = Some(now + delay);
                warn!(profile_id = %profile_id, reason, "session degraded");
            }
        }
    }

    /// Attempt to restore a degraded session, honouring backoff. Returns
    /// `None` when the profile has no degraded handle.
    pub async fn try_reconnect(&self, profile_id: Uuid) -> Option<ReconnectOutcome> {
        let now = self.clock.now_utc();
        let max_attempts = self.config.read().max_reconnect_attempts;

        let (coords, credential, attempts) = {
            let mut entries = self.entries.write();
            let entry = entries.get_mut(&profile_id)?;
            if entry.handle.state != HandleState::Degraded {
                return None;
            }
            if let Some(at) = entry.next_attempt_at {
                if now < at {
                    return Some(ReconnectOutcome::Waiting);
                }
            }
            if entry.handle.reconnect_attempts >= max_attempts {
                entry.handle.state = HandleState::Closed;
                return Some(ReconnectOutcome::GaveUp);
            }
            entry.handle.state = HandleState::Connecting;
            (
                entry.coords.clone(),
                entry.credential.clone(),
                entry.handle.reconnect_attempts,
            )
        };

        self.total_reconnects.fetch_add(1, Ordering::Relaxed);

        match self.adapter.connect(profile_id, &coords, &credential).await {
            Ok(account) => {
                let now = self.clock.now_utc();
                let mut entries = self.entries.write();
                if let Some(entry) = entries.get_mut(&profile_id) {
                    entry.handle.state = HandleState::Live;
                    entry.handle.connected_at = Some(now);
                    entry.handle.last_heartbeat = Some(now);
                    entry.handle.reconnect_attempts = 0;
                    entry.handle.error = None;
                    entry.handle.account = Some(account);
                    entry.next_attempt_at = None;
                }
                info!(profile_id = %profile_id, "session restored");
                Some(ReconnectOutcome::Restored(account))
            }
            Err(err) => {
                let next_attempts = attempts + 1;
                let delay = self.backoff_delay(next_attempts);
                let mut entries = self.entries.write();
                let entry = entries.get_mut(&profile_id)?;
                entry.handle.reconnect_attempts = next_attempts;
                entry.handle.error = Some(err.to_string());
                if next_attempts >= max_attempts {
                    entry.handle.state = HandleState::Closed;
                    warn!(
                        profile_id = %profile_id,
                        attempts = next_attempts,
                        "reconnect attempts exhausted — handle closed"
                    );
                    Some(ReconnectOutcome::GaveUp)
                } else {
                    entry.handle.state = HandleState::Degraded;
                    entry.next_attempt_at = Some(self.clock.now_utc() + delay);
                    Some(ReconnectOutcome::Waiting)
                }
            }
        }
    }

    /// Close live sessions whose heartbeat is older than the idle timeout.
    /// Handles refreshed by account polls are never considered idle.
    pub async fn evict_idle(&self) -> Vec<Uuid> {
        let now = self.clock.now_utc();
        let timeout = Duration::seconds(self.config.read().pool_idle_timeout_seconds as i64);

        let victims: Vec<Uuid> = {
            let entries = self.entries.read();
            entries
                .values()
                .filter(|e| {
                    e.handle.state == HandleState::Live
                        && e.handle
                            .last_heartbeat
                            .map_or(false, |hb| now - hb > timeout)
                })
                .map(|e| e.handle.profile_id)
                .collect()
        };

        for profile_id in &victims {
            info!(profile_id = %profile_id, "closing idle session");
            let _ = self.disconnect(*profile_id).await;
        }
        victims
    }

    /// Drop a closed handle from the table (after the caller has alerted).
    pub fn remove_closed(&self, profile_id: Uuid) {
        let mut entries = self.entries.write();
        if entries
            .get(&profile_id)
            .map_or(false, |e| e.handle.state == HandleState::Closed)
        {
            entries.remove(&profile_id);
        }
    }

    fn backoff_delay(&self, attempts: u32) -> Duration {
        let config = self.config.read();
        let base = config.reconnect_base_delay_ms;
        let ceiling = config.reconnect_max_delay_ms;
        let exp = base.saturating_mul(1u64 << attempts.min(16));
        let capped = exp.min(ceiling);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4 + 1);
        Duration::milliseconds((capped + jitter) as i64)
    }
}
