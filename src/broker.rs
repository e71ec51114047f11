// =============================================================================
// Broker capability — the only doorway to external trading terminals
// =============================================================================
//
// The core never speaks a broker wire protocol. Everything it needs from a
// terminal goes through `BrokerAdapter`; the pool decides *when* to connect,
// the adapter decides *how*. `PaperBroker` is the in-process implementation
// backing demo profiles and the test suite: deterministic fills at the
// current mark price, per-profile position books, simple balance/equity
// book-keeping.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::CoreError;
use crate::types::PositionSide;

// =============================================================================
// Wire-independent broker types
// =============================================================================

/// Account figures reported by a terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BrokerAccount {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub margin_level: f64,
    pub leverage: u32,
}

/// A position as the broker sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub swap: f64,
    pub commission: f64,
    pub profit: f64,
    pub open_time: DateTime<Utc>,
}

/// An order handed to the adapter by execution or the panic hedge.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub volume: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

// =============================================================================
// Adapter trait
// =============================================================================

/// Session-oriented interface exposed by an external broker adapter.
/// All operations are keyed by profile id; the adapter owns any terminal
/// handles behind that key.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Open a session. `coords` are the profile's opaque broker coordinates;
    /// `credential` arrives already decrypted (credential-at-rest handling is
    /// outside the core).
    async fn connect(
        &self,
        profile_id: Uuid,
        coords: &str,
        credential: &str,
    ) -> Result<BrokerAccount, CoreError>;

    /// Close the session. Idempotent.
    async fn disconnect(&self, profile_id: Uuid) -> Result<(), CoreError>;

    /// Current account snapshot.
    async fn account(&self, profile_id: Uuid) -> Result<BrokerAccount, CoreError>;

    /// All open positions on the session.
    async fn positions(&self, profile_id: Uuid) -> Result<Vec<BrokerPosition>, CoreError>;

    /// Place an order; returns the broker ticket.
    async fn submit_order(&self, profile_id: Uuid, order: OrderRequest) -> Result<i64, CoreError>;

    /// Close an open position by ticket.
    async fn close_position(&self, profile_id: Uuid, ticket: i64) -> Result<(), CoreError>;

    /// Adjust SL/TP on an open position.
    async fn modify_position(
        &self,
        profile_id: Uuid,
        ticket: i64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<(), CoreError>;
}

// =============================================================================
// PaperBroker
// =============================================================================

struct PaperBook {
    account: BrokerAccount,
    positions: HashMap<i64, BrokerPosition>,
    next_ticket: i64,
}

impl PaperBook {
    fn new(starting_balance: f64) -> Self {
        Self {
            account: BrokerAccount {
                balance: starting_balance,
                equity: starting_balance,
                margin: 0.0,
                free_margin: starting_balance,
                margin_level: 0.0,
                leverage: 100,
            },
            positions: HashMap::new(),
            next_ticket: 1_000,
        }
    }

    /// Recompute equity from balance plus open PnL at current marks.
    fn refresh(&mut self, prices: &HashMap<String, f64>) {
        let mut open_profit = 0.0;
        for pos in self.positions.values_mut() {
            if let Some(&price) = prices.get(&pos.symbol) {
                pos.current_price = price;
                let delta = match pos.side {
                    PositionSide::Buy => price - pos.open_price,
                    PositionSide::Sell => pos.open_price - price,
                };
                pos.profit = delta * pos.volume;
            }
            open_profit += pos.profit;
        }
        self.account.equity = self.account.balance + open_profit;
        self.account.free_margin = self.account.equity - self.account.margin;
    }
}

struct PaperInner {
    books: HashMap<Uuid, PaperBook>,
    prices: HashMap<String, f64>,
    /// When set, `connect` fails with this message (used to exercise the
    /// refused/degraded paths).
    refuse_connect: Option<String>,
}

/// Simulated broker for demo accounts and tests. Deterministic: fills happen
/// at the current mark price, and time comes from the injected clock.
pub struct PaperBroker {
    inner: RwLock<PaperInner>,
    clock: Arc<dyn Clock>,
    starting_balance: f64,
}

impl PaperBroker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_balance(clock, 10_000.0)
    }

    pub fn with_balance(clock: Arc<dyn Clock>, starting_balance: f64) -> Self {
        Self {
            inner: RwLock::new(PaperInner {
                books: HashMap::new(),
                prices: HashMap::new(),
                refuse_connect: None,
            }),
            clock,
            starting_balance,
        }
    }

    /// Set the mark price for a symbol and re-mark every book.
    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut inner = self.inner.write();
        inner.prices.insert(symbol.to_string(), price);
        let prices = inner.prices.clone();
        for book in inner.books.values_mut() {
            book.refresh(&prices);
        }
    }

    /// Force subsequent `connect` calls to fail (test hook).
    pub fn refuse_connections(&self, reason: Option<&str>) {
        self.inner.write().refuse_connect = reason.map(str::to_string);
    }

    /// Overwrite the balance on a connected book and re-mark (test hook for
    /// drawdown scenarios).
    pub fn set_balance(&self, profile_id: Uuid, balance: f64) {
        let mut inner = self.inner.write();
        let prices = inner.prices.clone();
        if let Some(book) = inner.books.get_mut(&profile_id) {
            book.account.balance = balance;
            book.refresh(&prices);
        }
    }

    /// Inject a raw broker-side position (test hook for reconciliation).
    pub fn seed_position(&self, profile_id: Uuid, position: BrokerPosition) {
        let mut inner = self.inner.write();
        if let Some(book) = inner.books.get_mut(&profile_id) {
            book.next_ticket = book.next_ticket.max(position.ticket + 1);
            book.positions.insert(position.ticket, position);
        }
    }

    /// Remove a broker-side position without closing it locally (test hook).
    pub fn drop_position(&self, profile_id: Uuid, ticket: i64) {
        let mut inner = self.inner.write();
        if let Some(book) = inner.books.get_mut(&profile_id) {
            book.positions.remove(&ticket);
        }
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn connect(
        &self,
        profile_id: Uuid,
        _coords: &str,
        credential: &str,
    ) -> Result<BrokerAccount, CoreError> {
        if credential.is_empty() {
            return Err(CoreError::BrokerRefused("empty credential".to_string()));
        }
        let mut inner = self.inner.write();
        if let Some(reason) = &inner.refuse_connect {
            return Err(CoreError::BrokerRefused(reason.clone()));
        }
        let starting = self.starting_balance;
        let book = inner
            .books
            .entry(profile_id)
            .or_insert_with(|| PaperBook::new(starting));
        Ok(book.account)
    }

    async fn disconnect(&self, _profile_id: Uuid) -> Result<(), CoreError> {
        // The paper book survives disconnects so a reconnect resumes the
        // same account, mirroring a real terminal.
        Ok(())
    }

    async fn account(&self, profile_id: Uuid) -> Result<BrokerAccount, CoreError> {
        let inner = self.inner.read();
        inner
            .books
            .get(&profile_id)
            .map(|b| b.account)
            .ok_or_else(|| CoreError::BrokerRefused("no session for profile".to_string()))
    }

    async fn positions(&self, profile_id: Uuid) -> Result<Vec<BrokerPosition>, CoreError> {
        let inner = self.inner.read();
        inner
            .books
            .get(&profile_id)
            .map(|b| b.positions.values().cloned().collect())
            .ok_or_else(|| CoreError::BrokerRefused("no session for profile".to_string()))
    }

    async fn submit_order(&self, profile_id: Uuid, order: OrderRequest) -> Result<i64, CoreError> {
        let now = self.clock.now_utc();
        let mut inner = self.inner.write();
        let price = inner.prices.get(&order.symbol).copied().unwrap_or(1.0);
        let book = inner
            .books
            .get_mut(&profile_id)
            .ok_or_else(|| CoreError::BrokerRefused("no session for profile".to_string()))?;

        let ticket = book.next_ticket;
        book.next_ticket += 1;
        book.positions.insert(
            ticket,
            BrokerPosition {
                ticket,
                symbol: order.symbol,
                side: order.side,
                volume: order.volume,
                open_price: price,
                current_price: price,
                stop_loss: order.stop_loss,
                take_profit: order.take_profit,
                swap: 0.0,
                commission: 0.0,
                profit: 0.0,
                open_time: now,
            },
        );
        Ok(ticket)
    }

    async fn close_position(&self, profile_id: Uuid, ticket: i64) -> Result<(), CoreError> {
        let mut inner = self.inner.write();
        let prices = inner.prices.clone();
        let book = inner
            .books
            .get_mut(&profile_id)
            .ok_or_else(|| CoreError::BrokerRefused("no session for profile".to_string()))?;
        let pos = book
            .positions
            .remove(&ticket)
            .ok_or_else(|| CoreError::BrokerRefused(format!("unknown ticket {ticket}")))?;
        // Realise the PnL into balance.
        book.account.balance += pos.profit + pos.swap + pos.commission;
        book.refresh(&prices);
        Ok(())
    }

    async fn modify_position(
        &self,
        profile_id: Uuid,
        ticket: i64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.write();
        let book = inner
            .books
            .get_mut(&profile_id)
            .ok_or_else(|| CoreError::BrokerRefused("no session for profile".to_string()))?;
        let pos = book
            .positions
            .get_mut(&ticket)
            .ok_or_else(|| CoreError::BrokerRefused(format!("unknown ticket {ticket}")))?;
        pos.stop_loss = stop_loss;
        pos.take_profit = take_profit;
        Ok(())
    }
}
