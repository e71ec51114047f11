// =============================================================================
// Clock & ID capabilities
// =============================================================================
//
// Wall/monotonic time and ID minting are injected as capabilities so that the
// gate, the reconcilers, and their tests share one notion of "now" and tests
// can pin it. Nothing else in the crate calls `Utc::now()` or
// `Uuid::new_v4()` directly.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

/// Time source for wall-clock and monotonic readings.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic instant for latency measurement.
    fn monotonic(&self) -> Instant;

    /// Civil date at the given UTC offset, used for daily signal caps.
    fn local_date(&self, tz_offset_minutes: i32) -> NaiveDate {
        (self.now_utc() + Duration::minutes(i64::from(tz_offset_minutes))).date_naive()
    }
}

/// Production clock backed by the OS.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Settable clock for tests. Wall time is pinned; `advance` moves it forward.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: RwLock::new(now) }
    }

    /// Pin the wall clock to an exact time.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    /// Move the wall clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.read()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Mints identifiers for signals, events, and chain nodes.
pub trait IdMinter: Send + Sync {
    fn mint(&self) -> Uuid;
}

/// Production minter: random v4 UUIDs.
#[derive(Debug, Default)]
pub struct RandomIds;

impl IdMinter for RandomIds {
    fn mint(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Deterministic minter for tests: counter embedded in the UUID bytes.
#[derive(Debug, Default)]
pub struct SequentialIds {
    counter: AtomicU64,
}

impl IdMinter for SequentialIds {
    fn mint(&self) -> Uuid {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut bytes = [0u8; 16];
        bytes[8..].copy_from_slice(&n.to_be_bytes());
        Uuid::from_bytes(bytes)
    }
}
