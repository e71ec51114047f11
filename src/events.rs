// =============================================================================
// Event Hub — non-blocking per-profile fan-out
// =============================================================================
//
// Publishers enqueue into each subscriber's bounded outbox with `try_send`
// and never wait. A full outbox means the subscriber is too slow: it is
// disconnected on the spot and the pipeline proceeds. Delivery is
// at-most-once, best-effort, in publish order per subscriber.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;

// =============================================================================
// Event types
// =============================================================================

/// Every frame type the hub can fan out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Connection lifecycle
    Connected,
    Disconnected,
    Error,
    Ping,
    Pong,
    // Positions
    PositionOpened,
    PositionClosed,
    PositionModified,
    PositionUpdate,
    PositionsSnapshot,
    // Account
    AccountUpdate,
    AccountSnapshot,
    // Orders
    OrderPlaced,
    OrderFilled,
    OrderCancelled,
    OrderRejected,
    // Signals
    SignalGenerated,
    SignalApproved,
    SignalRejected,
    SignalExpired,
    // Risk & emergencies
    RiskAlert,
    PanicHedgeTriggered,
    DrawdownWarning,
    DrawdownHalt,
    KillSwitchActivated,
    // Pool lifecycle
    ConnectionLost,
    TradingEnabled,
    TradingDisabled,
    // Admin
    SystemMessage,
}

/// A single published event. `payload` is an open-schema object whose fields
/// are flattened into the outbound frame next to `type`, `timestamp`, and
/// `profile_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: EventType,
        profile_id: Uuid,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            timestamp,
            profile_id: Some(profile_id),
            payload,
        }
    }

    pub fn broadcast(event_type: EventType, timestamp: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp,
            profile_id: None,
            payload,
        }
    }

    /// Wire frame: `{type, timestamp, profile_id, ...payload}`.
    pub fn frame(&self) -> serde_json::Value {
        let mut map = match &self.payload {
            serde_json::Value::Object(m) => m.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut m = serde_json::Map::new();
                m.insert("data".to_string(), other.clone());
                m
            }
        };
        map.insert(
            "type".to_string(),
            serde_json::to_value(self.event_type).unwrap_or_default(),
        );
        map.insert(
            "timestamp".to_string(),
            serde_json::Value::String(self.timestamp.to_rfc3339()),
        );
        if let Some(profile_id) = self.profile_id {
            map.insert(
                "profile_id".to_string(),
                serde_json::Value::String(profile_id.to_string()),
            );
        }
        serde_json::Value::Object(map)
    }
}

// =============================================================================
// Subscribers
// =============================================================================

struct SubscriberHandle {
    id: Uuid,
    profile_id: Uuid,
    tx: mpsc::Sender<Event>,
    /// `None` = all event types; `Some(set)` = only those types.
    filter: RwLock<Option<HashSet<EventType>>>,
    last_seen: RwLock<DateTime<Utc>>,
}

impl SubscriberHandle {
    fn wants(&self, event_type: EventType) -> bool {
        match &*self.filter.read() {
            None => true,
            Some(set) => set.contains(&event_type),
        }
    }
}

/// Hub statistics for the admin dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub total_subscribers: usize,
    pub profiles_with_subscribers: usize,
    pub events_delivered: u64,
    pub subscribers_dropped_slow: u64,
}

#[derive(Default)]
struct HubInner {
    by_profile: HashMap<Uuid, Vec<Arc<SubscriberHandle>>>,
    by_id: HashMap<Uuid, Arc<SubscriberHandle>>,
}

// =============================================================================
// EventHub
// =============================================================================

pub struct EventHub {
    inner: RwLock<HubInner>,
    clock: Arc<dyn Clock>,
    outbox_capacity: usize,
    delivered: AtomicU64,
    dropped_slow: AtomicU64,
}

impl EventHub {
    pub fn new(clock: Arc<dyn Clock>, outbox_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(HubInner::default()),
            clock,
            outbox_capacity: outbox_capacity.max(1),
            delivered: AtomicU64::new(0),
            dropped_slow: AtomicU64::new(0),
        }
    }

    /// Register a subscriber for a profile. `filter = None` receives every
    /// event type on the profile.
    pub fn subscribe(
        &self,
        profile_id: Uuid,
        subscriber_id: Uuid,
        filter: Option<HashSet<EventType>>,
    ) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let handle = Arc::new(SubscriberHandle {
            id: subscriber_id,
            profile_id,
            tx,
            filter: RwLock::new(filter),
            last_seen: RwLock::new(self.clock.now_utc()),
        });

        let mut inner = self.inner.write();
        inner
            .by_profile
            .entry(profile_id)
            .or_default()
            .push(Arc::clone(&handle));
        inner.by_id.insert(subscriber_id, handle);

        debug!(subscriber_id = %subscriber_id, profile_id = %profile_id, "subscriber registered");
        rx
    }

    /// Remove a subscriber; its receiver closes once the sender drops.
    pub fn unsubscribe(&self, subscriber_id: Uuid) {
        let mut inner = self.inner.write();
        if let Some(handle) = inner.by_id.remove(&subscriber_id) {
            if let Some(list) = inner.by_profile.get_mut(&handle.profile_id) {
                list.retain(|h| h.id != subscriber_id);
                if list.is_empty() {
                    inner.by_profile.remove(&handle.profile_id);
                }
            }
            debug!(subscriber_id = %subscriber_id, "subscriber removed");
        }
    }

    /// Narrow or extend a subscriber's event-type filter.
    pub fn add_subscriptions(&self, subscriber_id: Uuid, events: &[EventType]) {
        let inner = self.inner.read();
        if let Some(handle) = inner.by_id.get(&subscriber_id) {
            let mut filter = handle.filter.write();
            match filter.as_mut() {
                Some(set) => set.extend(events.iter().copied()),
                None => *filter = Some(events.iter().copied().collect()),
            }
        }
    }

    /// Remove event types from a subscriber's filter. A subscriber that never
    /// narrowed its filter keeps receiving everything.
    pub fn remove_subscriptions(&self, subscriber_id: Uuid, events: &[EventType]) {
        let inner = self.inner.read();
        if let Some(handle) = inner.by_id.get(&subscriber_id) {
            let mut filter = handle.filter.write();
            if let Some(set) = filter.as_mut() {
                for e in events {
                    set.remove(e);
                }
            }
        }
    }

    /// Record inbound liveness for a subscriber (pong or any client frame).
    pub fn touch(&self, subscriber_id: Uuid) {
        let inner = self.inner.read();
        if let Some(handle) = inner.by_id.get(&subscriber_id) {
            *handle.last_seen.write() = self.clock.now_utc();
        }
    }

    /// Deliver an event to every matching subscriber of its profile.
    /// Never blocks: slow subscribers are dropped.
    pub fn publish(&self, event: Event) {
        let Some(profile_id) = event.profile_id else {
            self.broadcast_all(event);
            return;
        };
        let targets: Vec<Arc<SubscriberHandle>> = {
            let inner = self.inner.read();
            inner
                .by_profile
                .get(&profile_id)
                .map(|list| list.iter().map(Arc::clone).collect())
                .unwrap_or_default()
        };
        self.deliver(&targets, event);
    }

    /// Cross-profile broadcast for admin messages.
    pub fn broadcast_all(&self, event: Event) {
        let targets: Vec<Arc<SubscriberHandle>> = {
            let inner = self.inner.read();
            inner.by_id.values().map(Arc::clone).collect()
        };
        self.deliver(&targets, event);
    }

    fn deliver(&self, targets: &[Arc<SubscriberHandle>], event: Event) {
        let mut to_drop: Vec<Uuid> = Vec::new();
        for handle in targets {
            if !handle.wants(event.event_type) {
                continue;
            }
            match handle.tx.try_send(event.clone()) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_slow.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber_id = %handle.id,
                        profile_id = %handle.profile_id,
                        "subscriber outbox full — disconnecting slow subscriber"
                    );
                    to_drop.push(handle.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    to_drop.push(handle.id);
                }
            }
        }
        for id in to_drop {
            self.unsubscribe(id);
        }
    }

    /// One heartbeat pass: ping every subscriber and close the ones that
    /// have shown no inbound activity for `stale_after`.
    pub fn heartbeat_cycle(&self, stale_after: Duration) {
        let now = self.clock.now_utc();
        let targets: Vec<Arc<SubscriberHandle>> = {
            let inner = self.inner.read();
            inner.by_id.values().map(Arc::clone).collect()
        };

        let mut stale: Vec<Uuid> = Vec::new();
        for handle in &targets {
            if now - *handle.last_seen.read() > stale_after {
                stale.push(handle.id);
                continue;
            }
            let ping = Event::new(
                EventType::Ping,
                handle.profile_id,
                now,
                serde_json::Value::Null,
            );
            // A full outbox on a ping is the same slow-subscriber condition.
            if handle.tx.try_send(ping).is_err() {
                stale.push(handle.id);
            }
        }
        for id in stale {
            info!(subscriber_id = %id, "closing non-responsive subscriber");
            self.unsubscribe(id);
        }
    }

    pub fn stats(&self) -> HubStats {
        let inner = self.inner.read();
        HubStats {
            total_subscribers: inner.by_id.len(),
            profiles_with_subscribers: inner.by_profile.len(),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            subscribers_dropped_slow: self.dropped_slow.load(Ordering::Relaxed),
        }
    }
}

/// Background heartbeat loop, stopped via the shutdown watch channel.
pub fn spawn_heartbeat(
    hub: Arc<EventHub>,
    interval_seconds: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
        let stale_after = Duration::seconds((interval_seconds.max(1) * 2) as i64);
        loop {
            tokio::select! {
                _ = ticker.tick() => hub.heartbeat_cycle(stale_after),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
