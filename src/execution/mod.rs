//! Arbitrage executor contract and the paper implementation.
//!
//! The orchestrator treats the executor as a black box that turns an
//! `ExecutionRequest` into a two-leg position change. The contract:
//! place both legs as close to atomically as the venues allow, re-check
//! the orchestrator-provided preconditions before any retry, emergency
//! reverse an unpaired fill, and report `success_quantity` as the
//! minimum paired fill across legs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::exchanges::{ExchangeAdapter, OrderRequest};
use crate::models::{OrderData, OrderSide, OrderStatus, OrderType, SpreadData};

/// Freshest local touch for (venue, symbol, is_buy), served by the core.
pub type LivePriceResolver = Arc<dyn Fn(&str, &str, bool) -> Option<Decimal> + Send + Sync>;

/// Core-provided gate re-run before each executor retry.
#[async_trait]
pub trait RetryValidator: Send + Sync {
    async fn validate(&self, request: &ExecutionRequest) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridAction {
    Open,
    Close,
}

impl GridAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GridAction::Open => "open",
            GridAction::Close => "close",
        }
    }
}

/// Everything the executor needs for one paired order, including the
/// four-point book snapshot taken at decision time.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub symbol: String,
    pub exchange_buy: String,
    pub exchange_sell: String,
    pub price_buy: Decimal,
    pub price_sell: Decimal,
    pub quantity: Decimal,
    pub is_open: bool,
    pub spread_data: SpreadData,
    pub buy_symbol: String,
    pub sell_symbol: String,
    pub grid_action: GridAction,
    pub grid_level: u32,
    pub grid_threshold_pct: Option<Decimal>,
    pub slippage_tolerance_pct: Option<Decimal>,
    pub limit_price_offset_buy: Option<Decimal>,
    pub limit_price_offset_sell: Option<Decimal>,
    pub min_exchange_order_qty: HashMap<String, Decimal>,
    pub orderbook_buy_ask: Option<Decimal>,
    pub orderbook_buy_bid: Option<Decimal>,
    pub orderbook_sell_ask: Option<Decimal>,
    pub orderbook_sell_bid: Option<Decimal>,
    pub is_last_split: bool,
}

/// Unwind of an unpaired leg, reported back for logging/reconciliation.
#[derive(Debug, Clone)]
pub struct EmergencyClose {
    pub exchange: String,
    pub quantity: Decimal,
    pub context: String,
    pub exchange_role: String,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    /// Minimum of filled sizes across legs: the quantity actually hedged.
    pub success_quantity: Decimal,
    pub order_buy: Option<OrderData>,
    pub order_sell: Option<OrderData>,
    pub error_message: Option<String>,
    pub failure_code: Option<String>,
    pub emergency_closes: Vec<EmergencyClose>,
}

#[async_trait]
pub trait ArbitrageExecutor: Send + Sync {
    async fn execute_arbitrage(&self, request: ExecutionRequest) -> ExecutionResult;

    /// Live mode: subscribe venue user-data streams feeding the adapter
    /// position/order caches the core reads during reconciliation.
    async fn initialize_websocket_subscriptions(&self);

    fn set_live_price_resolver(&self, resolver: LivePriceResolver);
    fn set_retry_validator(&self, validator: Arc<dyn RetryValidator>);
    fn monitor_only(&self) -> bool;
}

/// Paper executor: in monitor-only mode fills are booked at the request
/// prices without touching any venue; otherwise both legs go through the
/// adapters (the sim venues fill at their injected touch).
pub struct PaperExecutor {
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    monitor_only: bool,
    live_price_resolver: RwLock<Option<LivePriceResolver>>,
    retry_validator: RwLock<Option<Arc<dyn RetryValidator>>>,
}

impl PaperExecutor {
    pub fn new(adapters: HashMap<String, Arc<dyn ExchangeAdapter>>, monitor_only: bool) -> Arc<Self> {
        Arc::new(Self {
            adapters,
            monitor_only,
            live_price_resolver: RwLock::new(None),
            retry_validator: RwLock::new(None),
        })
    }

    fn resolve_price(&self, venue: &str, symbol: &str, is_buy: bool, fallback: Decimal) -> Decimal {
        let resolver = self.live_price_resolver.read().clone();
        resolver
            .and_then(|resolve| resolve(venue, symbol, is_buy))
            .unwrap_or(fallback)
    }

    fn paper_order(
        &self,
        venue: &str,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> OrderData {
        OrderData {
            order_id: Uuid::new_v4().to_string(),
            client_id: None,
            symbol: symbol.to_string(),
            venue: venue.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            filled: quantity,
            avg_fill_price: Some(price),
            status: OrderStatus::Filled,
            timestamp: Utc::now(),
        }
    }

    async fn execute_live(&self, request: &ExecutionRequest) -> ExecutionResult {
        let Some(buy_adapter) = self.adapters.get(&request.exchange_buy) else {
            return failure("missing_buy_adapter", &request.exchange_buy);
        };
        let Some(sell_adapter) = self.adapters.get(&request.exchange_sell) else {
            return failure("missing_sell_adapter", &request.exchange_sell);
        };

        // Buy leg first. A failure here leaves nothing to unwind.
        let buy_order = match buy_adapter
            .create_order(OrderRequest::market(
                &request.buy_symbol,
                OrderSide::Buy,
                request.quantity,
            ))
            .await
        {
            Ok(order) => order,
            Err(err) => {
                warn!(
                    "⛔️ [执行] {}: 买入腿 {} 下单失败: {err}",
                    request.symbol, request.exchange_buy
                );
                return ExecutionResult {
                    success: false,
                    error_message: Some(err.to_string()),
                    failure_code: Some("buy_leg_failed".to_string()),
                    ..ExecutionResult::default()
                };
            }
        };

        // Sell leg; one retry behind the core's precondition gate.
        let mut sell_result = sell_adapter
            .create_order(OrderRequest::market(
                &request.sell_symbol,
                OrderSide::Sell,
                request.quantity,
            ))
            .await;
        if sell_result.is_err() {
            let validator = self.retry_validator.read().clone();
            let may_retry = match validator {
                Some(validator) => validator.validate(request).await,
                None => false,
            };
            if may_retry {
                sell_result = sell_adapter
                    .create_order(OrderRequest::market(
                        &request.sell_symbol,
                        OrderSide::Sell,
                        request.quantity,
                    ))
                    .await;
            }
        }

        match sell_result {
            Ok(sell_order) => {
                let paired = buy_order.filled.min(sell_order.filled);
                ExecutionResult {
                    success: true,
                    success_quantity: paired,
                    order_buy: Some(buy_order),
                    order_sell: Some(sell_order),
                    ..ExecutionResult::default()
                }
            }
            Err(err) => {
                // The buy leg is naked: reverse it immediately.
                error!(
                    "🧯 [执行] {}: 卖出腿 {} 失败，紧急平仓买入腿: {err}",
                    request.symbol, request.exchange_sell
                );
                let mut reverse = OrderRequest::market(
                    &request.buy_symbol,
                    OrderSide::Sell,
                    buy_order.filled,
                );
                reverse.reduce_only = true;
                let status = match buy_adapter.create_order(reverse).await {
                    Ok(_) => "done",
                    Err(reverse_err) => {
                        error!(
                            "❌ [执行] {}: 紧急平仓失败，持仓裸露: {reverse_err}",
                            request.symbol
                        );
                        "failed"
                    }
                };
                ExecutionResult {
                    success: false,
                    success_quantity: Decimal::ZERO,
                    order_buy: Some(buy_order.clone()),
                    order_sell: None,
                    error_message: Some(err.to_string()),
                    failure_code: Some("open_leg_mismatch".to_string()),
                    emergency_closes: vec![EmergencyClose {
                        exchange: request.exchange_buy.clone(),
                        quantity: buy_order.filled,
                        context: "open_leg_mismatch".to_string(),
                        exchange_role: "buy".to_string(),
                        status: status.to_string(),
                    }],
                }
            }
        }
    }
}

fn failure(code: &str, detail: &str) -> ExecutionResult {
    ExecutionResult {
        success: false,
        error_message: Some(detail.to_string()),
        failure_code: Some(code.to_string()),
        ..ExecutionResult::default()
    }
}

#[async_trait]
impl ArbitrageExecutor for PaperExecutor {
    async fn execute_arbitrage(&self, request: ExecutionRequest) -> ExecutionResult {
        if self.monitor_only {
            let buy_price = self.resolve_price(
                &request.exchange_buy,
                &request.buy_symbol,
                true,
                request.price_buy,
            );
            let sell_price = self.resolve_price(
                &request.exchange_sell,
                &request.sell_symbol,
                false,
                request.price_sell,
            );
            info!(
                "📝 [纸面执行] {} {} | 数量={} | 买{}@{buy_price} 卖{}@{sell_price}",
                request.symbol,
                request.grid_action.as_str(),
                request.quantity,
                request.exchange_buy,
                request.exchange_sell,
            );
            return ExecutionResult {
                success: true,
                success_quantity: request.quantity,
                order_buy: Some(self.paper_order(
                    &request.exchange_buy,
                    &request.buy_symbol,
                    OrderSide::Buy,
                    request.quantity,
                    buy_price,
                )),
                order_sell: Some(self.paper_order(
                    &request.exchange_sell,
                    &request.sell_symbol,
                    OrderSide::Sell,
                    request.quantity,
                    sell_price,
                )),
                ..ExecutionResult::default()
            };
        }

        self.execute_live(&request).await
    }

    async fn initialize_websocket_subscriptions(&self) {
        // Sim adapters keep their caches live in-process; nothing to arm.
        info!("📡 [执行] 用户数据订阅初始化完成 ({} 个交易所)", self.adapters.len());
    }

    fn set_live_price_resolver(&self, resolver: LivePriceResolver) {
        *self.live_price_resolver.write() = Some(resolver);
    }

    fn set_retry_validator(&self, validator: Arc<dyn RetryValidator>) {
        *self.retry_validator.write() = Some(validator);
    }

    fn monitor_only(&self) -> bool {
        self.monitor_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::{SimExchange, SymbolConverter};
    use rust_decimal_macros::dec;

    fn request(quantity: Decimal) -> ExecutionRequest {
        let spread = SpreadData {
            symbol: "BTC-USDC-PERP".to_string(),
            exchange_buy: "lighter".to_string(),
            exchange_sell: "paradex".to_string(),
            price_buy: dec!(100.00),
            price_sell: dec!(100.08),
            size_buy: dec!(5),
            size_sell: dec!(5),
            spread_abs: dec!(0.08),
            spread_pct: dec!(0.08),
            buy_symbol: "BTC-USDC-PERP".to_string(),
            sell_symbol: "BTC-USDC-PERP".to_string(),
        };
        ExecutionRequest {
            symbol: "BTC-USDC-PERP".to_string(),
            exchange_buy: "lighter".to_string(),
            exchange_sell: "paradex".to_string(),
            price_buy: spread.price_buy,
            price_sell: spread.price_sell,
            quantity,
            is_open: true,
            spread_data: spread,
            buy_symbol: "BTC-USDC-PERP".to_string(),
            sell_symbol: "BTC-USDC-PERP".to_string(),
            grid_action: GridAction::Open,
            grid_level: 1,
            grid_threshold_pct: Some(dec!(0.05)),
            slippage_tolerance_pct: None,
            limit_price_offset_buy: None,
            limit_price_offset_sell: None,
            min_exchange_order_qty: HashMap::new(),
            orderbook_buy_ask: Some(dec!(100.00)),
            orderbook_buy_bid: Some(dec!(99.98)),
            orderbook_sell_ask: Some(dec!(100.10)),
            orderbook_sell_bid: Some(dec!(100.08)),
            is_last_split: true,
        }
    }

    fn venues() -> (Arc<SimExchange>, Arc<SimExchange>, HashMap<String, Arc<dyn ExchangeAdapter>>) {
        let converter = Arc::new(SymbolConverter::new());
        let lighter = SimExchange::new("lighter", converter.clone());
        let paradex = SimExchange::new("paradex", converter);
        for venue in [&lighter, &paradex] {
            venue.push_orderbook("BTC-USDC-PERP", (dec!(99.98), dec!(5)), (dec!(100.00), dec!(5)));
        }
        let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert("lighter".to_string(), lighter.clone());
        adapters.insert("paradex".to_string(), paradex.clone());
        (lighter, paradex, adapters)
    }

    #[tokio::test]
    async fn monitor_only_books_paper_fills() {
        let (_, _, adapters) = venues();
        let executor = PaperExecutor::new(adapters, true);
        let result = executor.execute_arbitrage(request(dec!(0.001))).await;
        assert!(result.success);
        assert_eq!(result.success_quantity, dec!(0.001));
        assert!(result.order_buy.is_some());
        assert!(result.order_sell.is_some());
        assert!(result.emergency_closes.is_empty());
    }

    #[tokio::test]
    async fn paper_fills_use_live_price_resolver() {
        let (_, _, adapters) = venues();
        let executor = PaperExecutor::new(adapters, true);
        executor.set_live_price_resolver(Arc::new(|_, _, is_buy| {
            Some(if is_buy { dec!(101.0) } else { dec!(101.2) })
        }));
        let result = executor.execute_arbitrage(request(dec!(0.001))).await;
        assert_eq!(
            result.order_buy.unwrap().avg_fill_price,
            Some(dec!(101.0))
        );
        assert_eq!(
            result.order_sell.unwrap().avg_fill_price,
            Some(dec!(101.2))
        );
    }

    #[tokio::test]
    async fn live_mode_pairs_both_legs() {
        let (lighter, paradex, adapters) = venues();
        let executor = PaperExecutor::new(adapters, false);
        let result = executor.execute_arbitrage(request(dec!(0.002))).await;
        assert!(result.success);
        assert_eq!(result.success_quantity, dec!(0.002));
        assert_eq!(
            lighter.position_cache().get("BTC").unwrap().signed_size(),
            dec!(0.002)
        );
        assert_eq!(
            paradex
                .position_cache()
                .get("BTC-USD-PERP")
                .unwrap()
                .signed_size(),
            dec!(-0.002)
        );
    }

    #[tokio::test]
    async fn failed_sell_leg_triggers_emergency_reverse() {
        let (lighter, paradex, adapters) = venues();
        let executor = PaperExecutor::new(adapters, false);

        // Paradex rejects everything: the filled lighter leg must unwind.
        paradex.set_reject_orders(Some("margin check failed"));
        let result = executor.execute_arbitrage(request(dec!(0.001))).await;

        assert!(!result.success);
        assert_eq!(result.success_quantity, Decimal::ZERO);
        assert_eq!(result.failure_code.as_deref(), Some("open_leg_mismatch"));
        assert_eq!(result.emergency_closes.len(), 1);
        let emergency = &result.emergency_closes[0];
        assert_eq!(emergency.exchange, "lighter");
        assert_eq!(emergency.quantity, dec!(0.001));
        assert_eq!(emergency.status, "done");
        // Net lighter position is flat again after the reverse.
        assert!(lighter.position_cache().is_empty());
    }

    #[tokio::test]
    async fn retry_validator_gates_second_attempt() {
        struct DenyAll;
        #[async_trait]
        impl RetryValidator for DenyAll {
            async fn validate(&self, _request: &ExecutionRequest) -> bool {
                false
            }
        }

        let (_, paradex, adapters) = venues();
        let executor = PaperExecutor::new(adapters, false);
        executor.set_retry_validator(Arc::new(DenyAll));
        paradex.set_reject_orders(Some("transient"));

        let result = executor.execute_arbitrage(request(dec!(0.001))).await;
        assert!(!result.success);
        // Validator said no: exactly one sell attempt was made, and the
        // failure escalated to the emergency path.
        assert_eq!(result.failure_code.as_deref(), Some("open_leg_mismatch"));
    }
}
