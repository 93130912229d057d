//! In-memory simulated venue.
//!
//! Backs paper runs and the integration tests: injected books/tickers
//! flow through the registered callbacks exactly like a live WS stream,
//! orders fill at the injected touch, and the position/order caches
//! behave like the adapter-side caches of a real venue. Failure switches
//! let tests drive single-leg rejections (emergency close) and silent
//! streams (self-heal).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{
    quantity_epsilon, BalanceData, OrderBookLevel, OrderBookSnapshot, OrderData, OrderSide,
    OrderStatus, PositionData, PositionSide, TickerSnapshot,
};

use super::{
    CachedPosition, ExchangeAdapter, ExchangeError, ExchangeResult, MarginMode, OrderBookCallback,
    OrderRequest, SymbolConverter, TickerCallback,
};

pub struct SimExchange {
    venue: String,
    converter: Arc<SymbolConverter>,
    books: RwLock<HashMap<String, OrderBookSnapshot>>,
    tickers: RwLock<HashMap<String, TickerSnapshot>>,
    orderbook_callback: RwLock<Option<OrderBookCallback>>,
    ticker_callback: RwLock<Option<TickerCallback>>,
    position_cache: RwLock<HashMap<String, CachedPosition>>,
    order_cache: RwLock<HashMap<String, OrderData>>,
    balances: RwLock<Vec<BalanceData>>,
    connected: AtomicBool,
    /// Stream outage switch: pushed books are dropped while set.
    silenced: AtomicBool,
    /// Next `create_order` calls fail with `Rejected` while set.
    reject_orders: RwLock<Option<String>>,
    /// Venue-imposed reduce-only rejection window.
    reject_reduce_only: AtomicBool,
    reconnect_count: AtomicU64,
    listen_key_open: AtomicBool,
}

impl SimExchange {
    pub fn new(venue: &str, converter: Arc<SymbolConverter>) -> Arc<Self> {
        Arc::new(Self {
            venue: venue.to_lowercase(),
            converter,
            books: RwLock::new(HashMap::new()),
            tickers: RwLock::new(HashMap::new()),
            orderbook_callback: RwLock::new(None),
            ticker_callback: RwLock::new(None),
            position_cache: RwLock::new(HashMap::new()),
            order_cache: RwLock::new(HashMap::new()),
            balances: RwLock::new(vec![BalanceData {
                asset: "USDC".to_string(),
                total: Decimal::from(10_000),
                available: Decimal::from(10_000),
            }]),
            connected: AtomicBool::new(false),
            silenced: AtomicBool::new(false),
            reject_orders: RwLock::new(None),
            reject_reduce_only: AtomicBool::new(false),
            reconnect_count: AtomicU64::new(0),
            listen_key_open: AtomicBool::new(false),
        })
    }

    /// Inject a top-of-book update; emits the venue-native snapshot
    /// through the orderbook callback unless the stream is silenced.
    pub fn push_orderbook(&self, neutral_symbol: &str, bid: (Decimal, Decimal), ask: (Decimal, Decimal)) {
        let native = self.converter.to_exchange(neutral_symbol, &self.venue);
        let now = Utc::now();
        let snapshot = OrderBookSnapshot {
            symbol: native.clone(),
            venue: self.venue.clone(),
            bids: vec![OrderBookLevel::new(bid.0, bid.1)],
            asks: vec![OrderBookLevel::new(ask.0, ask.1)],
            exchange_timestamp: Some(now),
            received_timestamp: None,
            processed_timestamp: None,
        };
        self.books
            .write()
            .insert(neutral_symbol.to_uppercase(), snapshot.clone());
        if self.silenced.load(Ordering::Relaxed) {
            return;
        }
        if let Some(callback) = self.orderbook_callback.read().clone() {
            callback(snapshot);
        }
    }

    pub fn push_ticker(&self, neutral_symbol: &str, funding_rate: Decimal) {
        let native = self.converter.to_exchange(neutral_symbol, &self.venue);
        let ticker = TickerSnapshot {
            symbol: native,
            venue: self.venue.clone(),
            bid: None,
            ask: None,
            last: None,
            mark_price: None,
            index_price: None,
            funding_rate: Some(funding_rate),
            next_funding_time: None,
            received_timestamp: None,
        };
        self.tickers
            .write()
            .insert(neutral_symbol.to_uppercase(), ticker.clone());
        if self.silenced.load(Ordering::Relaxed) {
            return;
        }
        if let Some(callback) = self.ticker_callback.read().clone() {
            callback(ticker);
        }
    }

    pub fn set_silenced(&self, silenced: bool) {
        self.silenced.store(silenced, Ordering::Relaxed);
    }

    pub fn set_reject_orders(&self, reason: Option<&str>) {
        *self.reject_orders.write() = reason.map(str::to_string);
    }

    pub fn set_reject_reduce_only(&self, reject: bool) {
        self.reject_reduce_only.store(reject, Ordering::Relaxed);
    }

    pub fn set_balance(&self, asset: &str, total: Decimal) {
        *self.balances.write() = vec![BalanceData {
            asset: asset.to_string(),
            total,
            available: total,
        }];
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn has_orderbook_callback(&self) -> bool {
        self.orderbook_callback.read().is_some()
    }

    fn apply_fill(&self, native_symbol: &str, side: OrderSide, quantity: Decimal) {
        let mut cache = self.position_cache.write();
        let signed = cache
            .get(native_symbol)
            .map(|p| p.signed_size())
            .unwrap_or(Decimal::ZERO);
        let updated = match side {
            OrderSide::Buy => signed + quantity,
            OrderSide::Sell => signed - quantity,
        };
        if updated.abs() <= quantity_epsilon() {
            cache.remove(native_symbol);
            return;
        }
        let side = if updated >= Decimal::ZERO {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        let entry_price = cache
            .get(native_symbol)
            .map(|p| p.entry_price)
            .unwrap_or(Decimal::ZERO);
        cache.insert(
            native_symbol.to_string(),
            CachedPosition {
                size: updated.abs(),
                side,
                entry_price,
                timestamp: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl ExchangeAdapter for SimExchange {
    fn venue(&self) -> &str {
        &self.venue
    }

    async fn connect(&self) -> ExchangeResult<()> {
        self.connected.store(true, Ordering::Relaxed);
        self.listen_key_open.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn reconnect(&self) -> ExchangeResult<()> {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
        self.silenced.store(false, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe_market_streams(&self, _symbols: &[String]) -> ExchangeResult<()> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(ExchangeError::Transport("not connected".to_string()));
        }
        Ok(())
    }

    fn set_orderbook_callback(&self, callback: OrderBookCallback) {
        *self.orderbook_callback.write() = Some(callback);
    }

    fn set_ticker_callback(&self, callback: TickerCallback) {
        *self.ticker_callback.write() = Some(callback);
    }

    fn reset_market_callbacks(&self) {
        *self.orderbook_callback.write() = None;
        *self.ticker_callback.write() = None;
    }

    async fn get_orderbook(
        &self,
        symbol: &str,
        _depth: Option<usize>,
    ) -> ExchangeResult<OrderBookSnapshot> {
        self.books
            .read()
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(symbol.to_string()))
    }

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<TickerSnapshot> {
        self.tickers
            .read()
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(symbol.to_string()))
    }

    async fn create_order(&self, request: OrderRequest) -> ExchangeResult<OrderData> {
        if let Some(reason) = self.reject_orders.read().clone() {
            return Err(ExchangeError::Rejected(reason));
        }
        if request.reduce_only && self.reject_reduce_only.load(Ordering::Relaxed) {
            return Err(ExchangeError::Rejected("reduce-only window".to_string()));
        }
        let key = request.symbol.to_uppercase();
        let book = self
            .books
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(request.symbol.clone()))?;
        let touch = match request.side {
            OrderSide::Buy => book.best_ask(),
            OrderSide::Sell => book.best_bid(),
        }
        .ok_or(ExchangeError::Stale)?;
        let fill_price = match (request.order_type, request.price) {
            (crate::models::OrderType::Limit, Some(price)) => price,
            _ => touch.price,
        };

        let native = self.converter.to_exchange(&request.symbol, &self.venue);
        self.apply_fill(&native, request.side, request.quantity);

        let order = OrderData {
            order_id: Uuid::new_v4().to_string(),
            client_id: request.client_id.clone(),
            symbol: request.symbol.clone(),
            venue: self.venue.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            filled: request.quantity,
            avg_fill_price: Some(fill_price),
            status: OrderStatus::Filled,
            timestamp: Utc::now(),
        };
        self.order_cache
            .write()
            .insert(order.order_id.clone(), order.clone());
        if let Some(client_id) = &order.client_id {
            self.order_cache.write().insert(client_id.clone(), order.clone());
        }
        Ok(order)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let mut cache = self.order_cache.write();
        match cache.get_mut(order_id) {
            Some(order) => {
                if order.status == OrderStatus::New {
                    order.status = OrderStatus::Canceled;
                }
                Ok(())
            }
            None => Err(ExchangeError::NotFound(order_id.to_string())),
        }
    }

    async fn cancel_all_orders(&self, _symbol: Option<&str>) -> ExchangeResult<()> {
        for order in self.order_cache.write().values_mut() {
            if order.status == OrderStatus::New {
                order.status = OrderStatus::Canceled;
            }
        }
        Ok(())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderData>> {
        Ok(self
            .order_cache
            .read()
            .values()
            .filter(|o| o.status == OrderStatus::New || o.status == OrderStatus::PartiallyFilled)
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<PositionData>> {
        Ok(self
            .position_cache
            .read()
            .iter()
            .map(|(symbol, cached)| PositionData {
                symbol: symbol.clone(),
                size: cached.size,
                side: cached.side,
                entry_price: cached.entry_price,
                timestamp: cached.timestamp,
            })
            .collect())
    }

    async fn get_balances(&self) -> ExchangeResult<Vec<BalanceData>> {
        Ok(self.balances.read().clone())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> ExchangeResult<()> {
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, _mode: MarginMode) -> ExchangeResult<()> {
        Ok(())
    }

    fn position_cache(&self) -> HashMap<String, CachedPosition> {
        self.position_cache.read().clone()
    }

    fn order_cache(&self) -> HashMap<String, OrderData> {
        self.order_cache.read().clone()
    }

    async fn close_listen_key(&self) -> ExchangeResult<()> {
        self.listen_key_open.store(false, Ordering::Relaxed);
        Ok(())
    }
}
