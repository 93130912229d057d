//! Venue adapter capability contract.
//!
//! Every venue is a stateful component behind one trait: lifecycle,
//! market-data callbacks, order CRUD, account views and the shared
//! position/order caches the orchestrator reads during reconciliation.
//! There is no inheritance tree; failures are explicit tagged values so
//! the backoff controller can react per error class.
//!
//! Concrete REST/WS venues live outside this crate. `SimExchange` is the
//! in-process venue used by paper runs and the integration tests.

pub mod sim;
pub mod symbol_converter;

pub use sim::SimExchange;
pub use symbol_converter::SymbolConverter;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    BalanceData, OrderBookSnapshot, OrderData, OrderSide, OrderType, PositionData, PositionSide,
    TickerSnapshot,
};

/// Adapter failure classes. Transient transport errors are surfaced (not
/// swallowed) so the backoff controller can pause the venue.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited")]
    RateLimited,
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("stale data")]
    Stale,
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Market-data callbacks, invoked in per-stream arrival order.
/// Implementations may coalesce but must not drop final state before idle.
pub type OrderBookCallback = Arc<dyn Fn(OrderBookSnapshot) + Send + Sync>;
pub type TickerCallback = Arc<dyn Fn(TickerSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

/// Order submission parameters. `symbol` is the neutral form; the adapter
/// translates to native and rejects unknown symbols.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    pub client_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            reduce_only: false,
            client_id: None,
        }
    }

    pub fn limit(symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            reduce_only: false,
            client_id: None,
        }
    }
}

/// Net position entry of the adapter-side cache, fed by REST and WS and
/// read by reconciliation. Keys are venue-native symbols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPosition {
    pub size: Decimal,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl CachedPosition {
    pub fn signed_size(&self) -> Decimal {
        match self.side {
            PositionSide::Long => self.size.abs(),
            PositionSide::Short => -self.size.abs(),
        }
    }
}

/// Uniform venue capability. Public-only deployments degrade gracefully:
/// trading calls fail with `Auth`, market data still flows.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> &str;

    // -- lifecycle ------------------------------------------------------

    async fn connect(&self) -> ExchangeResult<()>;
    async fn disconnect(&self) -> ExchangeResult<()>;
    /// Controlled reconnect for self-heal: tear down and re-establish the
    /// venue session without touching other venues.
    async fn reconnect(&self) -> ExchangeResult<()>;

    // -- market data ----------------------------------------------------

    async fn subscribe_market_streams(&self, symbols: &[String]) -> ExchangeResult<()>;
    fn set_orderbook_callback(&self, callback: OrderBookCallback);
    fn set_ticker_callback(&self, callback: TickerCallback);
    /// Drop installed callbacks so a controlled reconnect can re-arm
    /// subscriptions without duplicating handlers.
    fn reset_market_callbacks(&self);
    async fn get_orderbook(
        &self,
        symbol: &str,
        depth: Option<usize>,
    ) -> ExchangeResult<OrderBookSnapshot>;
    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<TickerSnapshot>;

    // -- trading --------------------------------------------------------

    async fn create_order(&self, request: OrderRequest) -> ExchangeResult<OrderData>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;
    async fn cancel_all_orders(&self, symbol: Option<&str>) -> ExchangeResult<()>;
    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderData>>;
    async fn get_positions(&self) -> ExchangeResult<Vec<PositionData>>;
    async fn get_balances(&self) -> ExchangeResult<Vec<BalanceData>>;

    // -- setup ----------------------------------------------------------

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;
    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> ExchangeResult<()>;

    // -- shared caches --------------------------------------------------

    /// Snapshot of the venue-native position cache.
    fn position_cache(&self) -> HashMap<String, CachedPosition>;
    /// Snapshot of the order cache keyed by order id (client ids mirror in
    /// on venues that use them).
    fn order_cache(&self) -> HashMap<String, OrderData>;

    /// Release any venue listen key / user-data session on shutdown.
    async fn close_listen_key(&self) -> ExchangeResult<()>;
}
