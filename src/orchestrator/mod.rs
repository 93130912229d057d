//! Unified orchestrator: the control loop that turns pipeline signals
//! into executed, recorded, reconciled position changes.
//!
//! Sequencing per tick: risk gate → per-pair spread pipeline → close
//! check before open check → gate ladder with stable reject codes →
//! pair/symbol execution locks → background execution → fill recording →
//! reconciliation audit (immediate + 1 s delayed). Auxiliary duties:
//! stream self-heal, reduce-only probing, status summaries, emergency
//! close-all on critical balance and shutdown.

pub mod gates;
pub mod reconcile;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ConfigManager;
use crate::data::{BoundedQueue, DataProcessor, DataReceiver};
use crate::decision::{DecisionEngine, OpenFill};
use crate::exchanges::{ExchangeAdapter, SymbolConverter};
use crate::execution::{
    ArbitrageExecutor, ExecutionRequest, ExecutionResult, GridAction, RetryValidator,
};
use crate::logging::{log_signal_reject, LogLevel, ThrottledLogger};
use crate::models::{quantity_epsilon, FundingRateData, SpreadData};
use crate::risk::{
    ErrorBackoffController, GlobalRiskController, ReduceOnlyGuard, ReduceOnlyProbeService,
    SymbolStateManager,
};
use crate::spread::SpreadPipeline;

use gates::{DualLimitBackoff, LiquidityLeg, PriceStabilityTracker};
use reconcile::PositionAuditor;

const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_millis(100);
const STATUS_SUMMARY_INTERVAL: Duration = Duration::from_secs(60);
const SELF_HEAL_THRESHOLD_SECONDS: f64 = 30.0;
const SELF_HEAL_COOLDOWN: Duration = Duration::from_secs(300);
const QUEUE_CAPACITY: usize = 2048;

pub struct UnifiedOrchestrator {
    config: Arc<ConfigManager>,
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    converter: Arc<SymbolConverter>,
    receiver: Arc<DataReceiver>,
    processor: Arc<DataProcessor>,
    pipeline: SpreadPipeline,
    engine: Arc<DecisionEngine>,
    executor: Arc<dyn ArbitrageExecutor>,
    risk: Arc<GlobalRiskController>,
    backoff: Arc<ErrorBackoffController>,
    reduce_only: Arc<ReduceOnlyGuard>,
    reduce_only_probe: Arc<ReduceOnlyProbeService>,
    symbol_state: Arc<SymbolStateManager>,

    price_stability: PriceStabilityTracker,
    dual_limit: DualLimitBackoff,
    auditor: PositionAuditor,
    throttle: ThrottledLogger,

    data_freshness_seconds: f64,
    loop_interval: Duration,
    running: Arc<AtomicBool>,

    pending_open_pairs: Mutex<HashSet<String>>,
    pending_close_symbols: Mutex<HashSet<String>>,
    inflight: Mutex<Vec<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    last_self_heal: Mutex<Option<Instant>>,
    last_status_summary: Mutex<Instant>,
}

impl UnifiedOrchestrator {
    pub fn new(
        config: Arc<ConfigManager>,
        converter: Arc<SymbolConverter>,
        adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
        executor: Arc<dyn ArbitrageExecutor>,
    ) -> Arc<Self> {
        let orderbook_queue = BoundedQueue::new(QUEUE_CAPACITY);
        let ticker_queue = BoundedQueue::new(QUEUE_CAPACITY);
        let receiver = DataReceiver::new(
            orderbook_queue.clone(),
            ticker_queue.clone(),
            converter.clone(),
        );
        let processor = DataProcessor::new(orderbook_queue, ticker_queue);
        let data_freshness_seconds = config.system_mode().data_freshness_seconds;
        let pipeline = SpreadPipeline::new(processor.clone(), data_freshness_seconds);

        let backoff = ErrorBackoffController::new();
        let engine = DecisionEngine::new(config.clone());
        engine.set_backoff_controller(backoff.clone());

        let risk = GlobalRiskController::new(config.risk_control().clone(), adapters.clone());
        let reduce_only = ReduceOnlyGuard::new();
        let reduce_only_probe =
            ReduceOnlyProbeService::new(reduce_only.clone(), adapters.clone(), config.clone());

        let orchestrator = Arc::new(Self {
            config,
            adapters,
            converter,
            receiver,
            processor,
            pipeline,
            engine,
            executor,
            risk,
            backoff,
            reduce_only,
            reduce_only_probe,
            symbol_state: Arc::new(SymbolStateManager::new()),
            price_stability: PriceStabilityTracker::new(),
            dual_limit: DualLimitBackoff::new(),
            auditor: PositionAuditor::new(),
            throttle: ThrottledLogger::new(),
            data_freshness_seconds,
            loop_interval: DEFAULT_LOOP_INTERVAL,
            running: Arc::new(AtomicBool::new(false)),
            pending_open_pairs: Mutex::new(HashSet::new()),
            pending_close_symbols: Mutex::new(HashSet::new()),
            inflight: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            last_self_heal: Mutex::new(None),
            last_status_summary: Mutex::new(Instant::now()),
        });
        orchestrator.install_executor_hooks();
        info!("✅ [统一调度] 统一调度器初始化完成");
        orchestrator
    }

    /// Wire the executor's back-callbacks without circular ownership:
    /// the price resolver captures only the processor, the retry
    /// validator holds a weak reference.
    fn install_executor_hooks(self: &Arc<Self>) {
        let processor = self.processor.clone();
        let freshness = self.data_freshness_seconds;
        self.executor
            .set_live_price_resolver(Arc::new(move |venue, symbol, is_buy| {
                let book = processor.get_orderbook(venue, symbol, freshness)?;
                let touch = if is_buy { book.best_ask() } else { book.best_bid() }?;
                (touch.price > Decimal::ZERO).then_some(touch.price)
            }));
        self.executor
            .set_retry_validator(Arc::new(OrchestratorRetryValidator {
                orchestrator: Arc::downgrade(self),
            }));
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.adapters.is_empty() {
            anyhow::bail!("没有可用的交易所适配器");
        }
        info!(
            "🚀 [统一调度] 启动调度器... ({} 个交易所)",
            self.adapters.len()
        );

        self.risk.start().await;
        self.processor.start().await;

        let symbols = self.subscription_symbols();
        for (venue, adapter) in &self.adapters {
            adapter.connect().await.map_err(|err| {
                anyhow::anyhow!("交易所 {venue} 连接失败: {err}")
            })?;
            self.receiver.register_adapter(adapter);
            adapter
                .subscribe_market_streams(&symbols)
                .await
                .map_err(|err| anyhow::anyhow!("交易所 {venue} 订阅失败: {err}"))?;
        }
        info!("✅ [统一调度] 交易所连接和订阅完成 ({} symbols)", symbols.len());

        if !self.executor.monitor_only() {
            self.executor.initialize_websocket_subscriptions().await;
        }
        self.reduce_only_probe.start();
        self.engine.log_grid_thresholds();

        self.running.store(true, Ordering::SeqCst);
        let orchestrator = self.clone();
        let main_loop = tokio::spawn(async move { orchestrator.main_loop().await });
        self.background.lock().push(main_loop);
        info!("✅ [统一调度] 分段套利系统已启动");
        Ok(())
    }

    pub async fn stop(&self) {
        info!("🛑 [统一调度] 停止调度器...");
        self.running.store(false, Ordering::SeqCst);

        let background: Vec<_> = self.background.lock().drain(..).collect();
        for task in background {
            let _ = task.await;
        }
        self.await_inflight().await;

        self.reduce_only_probe.stop().await;
        self.processor.stop().await;
        self.risk.stop().await;

        for (venue, adapter) in &self.adapters {
            if let Err(err) = adapter.close_listen_key().await {
                warn!("⚠️ [统一调度] {venue} 关闭 listen key 失败: {err}");
            }
            if let Err(err) = adapter.disconnect().await {
                warn!("⚠️ [统一调度] {venue} 断开失败: {err}");
            }
        }
        info!("✅ [统一调度] 调度器已停止");
    }

    async fn main_loop(self: Arc<Self>) {
        info!("▶️ [统一调度] 主循环启动");
        while self.running.load(Ordering::Relaxed) {
            self.run_cycle_once().await;
            tokio::time::sleep(self.loop_interval).await;
        }
        info!("✅ [统一调度] 主循环已停止");
    }

    /// One scheduling tick. Public so tests can drive the loop manually.
    pub async fn run_cycle_once(self: &Arc<Self>) {
        // Critical balance bypasses everything except the locks.
        if self.risk.take_emergency_close_request() {
            error!("🚨 [统一调度] 余额触发紧急平仓，立即执行");
            self.emergency_close_all_positions("余额紧急平仓").await;
        }

        let status = self.risk.get_risk_status();
        if status.is_paused {
            self.throttle.log(
                "risk_paused",
                &format!(
                    "⏸️ [统一调度] 风控暂停中: {}",
                    status.pause_reason.as_deref().unwrap_or("-")
                ),
                LogLevel::Warn,
                Duration::from_secs(30),
            );
            self.reap_inflight();
            return;
        }

        for pair in self.config.trading_pairs().to_vec() {
            let symbol_key = pair.trading_pair_id.to_uppercase();
            let position = self.engine.get_position(&symbol_key);
            let Some(signals) = self.pipeline.process_trading_pair(&pair, position.as_ref())
            else {
                continue;
            };
            self.price_stability.record(&symbol_key, &signals.opening);
            let funding = self.pipeline.funding_for(
                &pair.normalized_symbol(),
                &signals.opening.exchange_buy,
                &signals.opening.exchange_sell,
            );

            self.check_and_close(&symbol_key, &signals.closing, funding.as_ref())
                .await;
            // With a position the open check still runs (even on negative
            // spreads) to honor the reverse-open fast path.
            if signals.has_position || signals.opening.spread_pct > Decimal::ZERO {
                self.check_and_open(&symbol_key, &signals.opening, funding.as_ref())
                    .await;
            }
        }

        for pair in self.config.multi_leg_pairs().to_vec() {
            let pair_id = pair.pair_id.to_uppercase();
            let position = self.engine.get_position(&pair_id);
            let Some(signals) = self.pipeline.process_multi_leg_pair(&pair, position.as_ref())
            else {
                continue;
            };
            self.price_stability.record(&pair_id, &signals.opening);

            self.check_and_close(&pair_id, &signals.closing, None).await;
            if signals.has_position || signals.opening.spread_pct > Decimal::ZERO {
                self.check_and_open(&pair_id, &signals.opening, None).await;
            }
        }

        self.maybe_self_heal_exchange_stream().await;
        self.log_status_summary();
        self.reap_inflight();
    }

    fn subscription_symbols(&self) -> Vec<String> {
        let mut symbols: HashSet<String> = HashSet::new();
        for pair in self.config.trading_pairs() {
            symbols.insert(pair.normalized_symbol());
        }
        for pair in self.config.multi_leg_pairs() {
            symbols.insert(pair.leg_primary.normalized_symbol());
            symbols.insert(pair.leg_secondary.normalized_symbol());
        }
        for symbol in self.config.configured_symbols() {
            if !symbol.contains('_') {
                symbols.insert(symbol);
            }
        }
        symbols.into_iter().collect()
    }

    // ------------------------------------------------------------------
    // Open path
    // ------------------------------------------------------------------

    pub async fn check_and_open(
        self: &Arc<Self>,
        symbol: &str,
        spread: &SpreadData,
        funding: Option<&FundingRateData>,
    ) {
        if self.reduce_only.is_pair_blocked(symbol) {
            self.reject("open", symbol, "OPEN_BLOCK_REDUCE_ONLY", None);
            return;
        }
        if self.dual_limit.should_skip(symbol) {
            self.reject("open", symbol, "OPEN_BLOCK_DUAL_LIMIT_BACKOFF", None);
            return;
        }
        let base_symbol = spread.buy_symbol.clone();
        if !gates::is_symbol_market_open(symbol, Some(&base_symbol)) {
            self.reject("open", symbol, "OPEN_BLOCK_MARKET_CLOSED", None);
            return;
        }
        let (daily_ok, daily_reason) = self.risk.check_daily_trade_limit();
        if !daily_ok {
            self.reject("open", symbol, "OPEN_BLOCK_DAILY_LIMIT", daily_reason.as_deref());
            return;
        }

        let Some(open_quantity) = self.engine.should_open(symbol, spread, funding) else {
            self.reject("open", symbol, "OPEN_BLOCK_DECISION_FALSE", None);
            // A refused reverse open is really a close signal; run the
            // close check immediately instead of waiting a tick.
            if self.engine.take_reverse_open_detected() {
                info!("🔄 [{symbol}] 反向开仓被拦截，立即触发平仓检查");
                self.check_and_close(symbol, spread, funding).await;
            }
            return;
        };

        let config = self.config.get_config(symbol);
        if !self.price_stability.passes(symbol, &config) {
            self.reject("open", symbol, "OPEN_BLOCK_PRICE_UNSTABLE", None);
            return;
        }
        if !self.passes_local_orderbook_spread(symbol, spread, &config) {
            self.reject("open", symbol, "OPEN_BLOCK_LOCAL_SPREAD", None);
            return;
        }

        let grid_level = self.engine.grid_level(symbol, spread.spread_pct);
        if let Some((reason, level)) = self.symbol_state.should_block(symbol, grid_level) {
            self.reject(
                "open",
                symbol,
                "OPEN_BLOCK_MANUAL_STATE",
                Some(&format!("reason={reason} (T{level})")),
            );
            return;
        }

        if !self.executor.monitor_only() && config.grid_config.require_orderbook_liquidity {
            let legs = [
                LiquidityLeg {
                    venue: spread.exchange_buy.clone(),
                    symbol: spread.buy_symbol.clone(),
                    quantity: open_quantity,
                    is_buy: true,
                    description: "开仓买入腿",
                },
                LiquidityLeg {
                    venue: spread.exchange_sell.clone(),
                    symbol: spread.sell_symbol.clone(),
                    quantity: open_quantity,
                    is_buy: false,
                    description: "开仓卖出腿",
                },
            ];
            if let Err(detail) = gates::verify_orderbook_liquidity(
                &self.processor,
                &legs,
                config.grid_config.min_orderbook_quantity,
                self.data_freshness_seconds,
            ) {
                self.reject("open", symbol, "OPEN_BLOCK_LIQUIDITY", Some(&detail));
                return;
            }
        }

        let open_key = build_open_pair_key(symbol, &spread.exchange_buy, &spread.exchange_sell);
        if !self.try_register_open_pair(&open_key) {
            self.reject(
                "open",
                symbol,
                "OPEN_BLOCK_LOCK_HELD",
                Some(&format!("pair={open_key}")),
            );
            return;
        }

        let current_qty = self
            .engine
            .get_position(symbol)
            .map(|p| p.total_quantity)
            .unwrap_or(Decimal::ZERO);
        self.throttle.log(
            &format!("open_intent:{symbol}"),
            &format!(
                "📈 [开仓意图] {symbol} | 数量={open_quantity} | 当前持仓={current_qty} | 买{}@{} 卖{}@{} | 开仓价差={:.4}% | 网格T{grid_level}",
                spread.exchange_buy,
                spread.price_buy,
                spread.exchange_sell,
                spread.price_sell,
                spread.spread_pct
            ),
            LogLevel::Info,
            Duration::from_secs(3),
        );

        let is_last_split = self.engine.is_last_split_order(symbol, open_quantity, true);
        let request = self.build_execution_request(
            symbol,
            spread,
            open_quantity,
            true,
            grid_level,
            is_last_split,
            &config,
        );

        let orchestrator = self.clone();
        let symbol = symbol.to_string();
        let spread = spread.clone();
        let funding = funding.cloned();
        let task = tokio::spawn(async move {
            orchestrator
                .execute_and_record_open(&symbol, open_quantity, &spread, funding.as_ref(), request)
                .await;
            orchestrator.release_open_pair(&open_key);
        });
        self.inflight.lock().push(task);
    }

    async fn execute_and_record_open(
        self: &Arc<Self>,
        symbol: &str,
        open_quantity: Decimal,
        spread: &SpreadData,
        funding: Option<&FundingRateData>,
        request: ExecutionRequest,
    ) {
        let result = self.executor.execute_arbitrage(request).await;

        if result.success {
            self.dual_limit.clear(symbol);
            let entry_price_buy = resolve_execution_price(&result.order_buy, spread.price_buy);
            let entry_price_sell = resolve_execution_price(&result.order_sell, spread.price_sell);
            let filled = extract_filled_quantity(&result);
            if filled < open_quantity {
                warn!(
                    "⚠️ [V2开仓] {symbol}: 实际成交 {filled} 低于目标 {open_quantity}，剩余部分将延后补齐"
                );
            }
            self.engine.record_open(
                symbol,
                open_quantity,
                spread,
                funding,
                OpenFill {
                    buy_order_id: result.order_buy.as_ref().map(|o| o.order_id.clone()),
                    sell_order_id: result.order_sell.as_ref().map(|o| o.order_id.clone()),
                    entry_price_buy: Some(entry_price_buy),
                    entry_price_sell: Some(entry_price_sell),
                    filled_quantity: Some(filled),
                },
            );
            self.engine
                .report_open_shortfall(symbol, open_quantity, filled);
            self.risk.record_trade();

            let actual_spread_pct = if entry_price_buy > Decimal::ZERO {
                (entry_price_sell - entry_price_buy) / entry_price_buy * Decimal::ONE_HUNDRED
            } else {
                Decimal::ZERO
            };
            info!(
                "✅ [开仓成交] {symbol} | 数量={filled} | 买{}@{entry_price_buy} 卖{}@{entry_price_sell} | 实际价差={actual_spread_pct:.4}% 理论={:.4}%",
                spread.exchange_buy, spread.exchange_sell, spread.spread_pct
            );
        } else if result.failure_code.as_deref() == Some("dual_limit_no_fill") {
            self.dual_limit.schedule(symbol);
        } else {
            self.dual_limit.clear(symbol);
        }

        self.handle_emergency_close_feedback(symbol, &result, "开仓");
        self.schedule_position_alignment(symbol);
    }

    // ------------------------------------------------------------------
    // Close path
    // ------------------------------------------------------------------

    pub async fn check_and_close(
        self: &Arc<Self>,
        symbol: &str,
        spread: &SpreadData,
        funding: Option<&FundingRateData>,
    ) {
        let grid_level = self.engine.grid_level(symbol, spread.spread_pct);
        if let Some((reason, level)) = self.symbol_state.should_block(symbol, grid_level) {
            self.reject(
                "close",
                symbol,
                "CLOSE_BLOCK_MANUAL_STATE",
                Some(&format!("reason={reason} (T{level})")),
            );
            return;
        }
        if self.reduce_only.is_pair_closing_blocked(symbol) {
            self.reject("close", symbol, "CLOSE_BLOCK_REDUCE_ONLY_CLOSING", None);
            return;
        }
        if self.reduce_only.is_pair_blocked(symbol) {
            self.reject("close", symbol, "CLOSE_BLOCK_REDUCE_ONLY_GLOBAL", None);
            return;
        }

        let Some(signal) = self.engine.should_close(symbol, spread, funding) else {
            self.reject("close", symbol, "CLOSE_BLOCK_DECISION_FALSE", None);
            return;
        };

        let config = self.config.get_config(symbol);
        if !self.price_stability.passes(symbol, &config) {
            self.reject("close", symbol, "CLOSE_BLOCK_PRICE_UNSTABLE", None);
            return;
        }
        if !self.passes_local_orderbook_spread(symbol, spread, &config) {
            self.reject("close", symbol, "CLOSE_BLOCK_LOCAL_SPREAD", None);
            return;
        }

        let Some(position) = self.engine.get_position(symbol) else {
            self.reject("close", symbol, "CLOSE_BLOCK_NO_POSITION", None);
            return;
        };

        // The closing view must be the inverse of the memorized opening
        // direction; anything else is repaired from memory or refused.
        let mut spread = spread.clone();
        let is_reverse_view = spread
            .exchange_buy
            .eq_ignore_ascii_case(&position.exchange_sell)
            && spread
                .exchange_sell
                .eq_ignore_ascii_case(&position.exchange_buy);
        if !is_reverse_view {
            match self.pipeline.spreads_from_position(symbol, &position) {
                Some((_, closing_from_memory)) => {
                    warn!(
                        "⚠️ [V2平仓] {symbol}: 接收到的价差方向与持仓不符，已按照记忆方向重新计算平仓视角"
                    );
                    spread = closing_from_memory;
                }
                None => {
                    self.reject("close", symbol, "CLOSE_BLOCK_DIRECTION_MISMATCH", None);
                    return;
                }
            }
        }

        if !self.executor.monitor_only() && config.grid_config.require_orderbook_liquidity {
            let legs = [
                LiquidityLeg {
                    venue: spread.exchange_buy.clone(),
                    symbol: spread.buy_symbol.clone(),
                    quantity: signal.quantity,
                    is_buy: true,
                    description: "平仓买回腿",
                },
                LiquidityLeg {
                    venue: spread.exchange_sell.clone(),
                    symbol: spread.sell_symbol.clone(),
                    quantity: signal.quantity,
                    is_buy: false,
                    description: "平仓卖出腿",
                },
            ];
            if let Err(detail) = gates::verify_orderbook_liquidity(
                &self.processor,
                &legs,
                config.grid_config.min_orderbook_quantity,
                self.data_freshness_seconds,
            ) {
                self.reject("close", symbol, "CLOSE_BLOCK_LIQUIDITY", Some(&detail));
                return;
            }
        }

        // Close locks are symbol-scoped: one close at a time per symbol.
        let close_key = symbol.to_uppercase();
        if !self.try_register_close_symbol(&close_key) {
            self.reject(
                "close",
                symbol,
                "CLOSE_BLOCK_LOCK_HELD",
                Some(&format!("key={close_key}")),
            );
            return;
        }

        self.throttle.log(
            &format!("close_intent:{symbol}"),
            &format!(
                "📉 [平仓意图] {symbol} | 数量={} | 剩余={} | 平仓视角: 买{}@{} 卖{}@{} ({:.4}%) | 原因={}",
                signal.quantity,
                position.total_quantity,
                spread.exchange_buy,
                spread.price_buy,
                spread.exchange_sell,
                spread.price_sell,
                spread.spread_pct,
                signal.reason
            ),
            LogLevel::Info,
            Duration::from_secs(3),
        );

        let position_segments = self.engine.current_segments(symbol);
        let is_last_split = self
            .engine
            .is_last_split_order(symbol, signal.quantity, false);
        let request = self.build_execution_request(
            symbol,
            &spread,
            signal.quantity,
            false,
            position_segments,
            is_last_split,
            &config,
        );

        let orchestrator = self.clone();
        let symbol = symbol.to_string();
        let task = tokio::spawn(async move {
            orchestrator
                .execute_and_record_close(&symbol, &spread, &signal.reason, request)
                .await;
            orchestrator.release_close_symbol(&close_key);
        });
        self.inflight.lock().push(task);
    }

    async fn execute_and_record_close(
        self: &Arc<Self>,
        symbol: &str,
        spread: &SpreadData,
        reason: &str,
        request: ExecutionRequest,
    ) {
        let result = self.executor.execute_arbitrage(request).await;

        if result.success {
            let filled = extract_filled_quantity(&result);
            if filled > Decimal::ZERO {
                self.engine.record_close(symbol, filled, spread, reason);
                self.risk.record_trade();
                let remaining = self
                    .engine
                    .get_position(symbol)
                    .map(|p| p.total_quantity)
                    .unwrap_or(Decimal::ZERO);
                info!(
                    "✅ [平仓成交] {symbol} | 数量={filled} | 剩余={remaining} | 原因={reason}"
                );
            } else {
                warn!("⚠️ [平仓成交] {symbol} | 执行器报告成交量为0，决策引擎未更新");
            }
            self.dual_limit.clear(symbol);
        } else if result.failure_code.as_deref() == Some("dual_limit_no_fill") {
            self.dual_limit.schedule(symbol);
        } else {
            self.dual_limit.clear(symbol);
        }

        self.handle_emergency_close_feedback(symbol, &result, "平仓");
        self.schedule_position_alignment(symbol);
    }

    /// Market-order unwind of every open position. Bypasses persistence
    /// and stability gates but still takes the close locks.
    pub async fn emergency_close_all_positions(self: &Arc<Self>, reason: &str) {
        let positions = self.engine.positions_snapshot();
        if positions.is_empty() {
            info!("ℹ️ [紧急平仓] 无持仓需要平仓");
            return;
        }
        for position in positions {
            if !position.is_open || position.total_quantity <= quantity_epsilon() {
                continue;
            }
            let symbol = position.symbol.clone();
            let Some((_, closing)) = self.pipeline.spreads_from_position(&symbol, &position)
            else {
                warn!("⚠️ [紧急平仓] {symbol}: 无法获取价差数据，跳过");
                continue;
            };
            let close_key = symbol.to_uppercase();
            if !self.try_register_close_symbol(&close_key) {
                continue;
            }
            let config = self.config.get_config(&symbol);
            let request = self.build_execution_request(
                &symbol,
                &closing,
                position.total_quantity,
                false,
                self.engine.current_segments(&symbol),
                true,
                &config,
            );
            let result = self.executor.execute_arbitrage(request).await;
            if result.success {
                let filled = extract_filled_quantity(&result);
                if filled > Decimal::ZERO {
                    self.engine.record_close(&symbol, filled, &closing, reason);
                }
                info!("✅ [紧急平仓] {symbol}: 平仓成功");
            } else {
                error!(
                    "❌ [紧急平仓] {symbol}: 平仓失败 - {}",
                    result.error_message.as_deref().unwrap_or("-")
                );
            }
            self.release_close_symbol(&close_key);
            self.schedule_position_alignment(&symbol);
        }
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn build_execution_request(
        &self,
        symbol: &str,
        spread: &SpreadData,
        quantity: Decimal,
        is_open: bool,
        grid_level: u32,
        is_last_split: bool,
        config: &crate::config::SymbolConfig,
    ) -> ExecutionRequest {
        let book_buy = self.processor.get_orderbook(
            &spread.exchange_buy,
            &spread.buy_symbol,
            self.data_freshness_seconds,
        );
        let book_sell = self.processor.get_orderbook(
            &spread.exchange_sell,
            &spread.sell_symbol,
            self.data_freshness_seconds,
        );

        let grid_threshold_pct = (grid_level > 0).then(|| {
            config.grid_config.initial_spread_threshold
                + config.grid_config.grid_step * Decimal::from(grid_level.saturating_sub(1))
        });

        ExecutionRequest {
            symbol: symbol.to_string(),
            exchange_buy: spread.exchange_buy.clone(),
            exchange_sell: spread.exchange_sell.clone(),
            price_buy: spread.price_buy,
            price_sell: spread.price_sell,
            quantity,
            is_open,
            spread_data: spread.clone(),
            buy_symbol: spread.buy_symbol.clone(),
            sell_symbol: spread.sell_symbol.clone(),
            grid_action: if is_open {
                GridAction::Open
            } else {
                GridAction::Close
            },
            grid_level,
            grid_threshold_pct,
            slippage_tolerance_pct: config.grid_config.slippage_tolerance,
            limit_price_offset_buy: config.grid_config.limit_price_offset,
            limit_price_offset_sell: config.grid_config.limit_price_offset,
            min_exchange_order_qty: config.quantity_config.min_exchange_order_qty.clone(),
            orderbook_buy_ask: book_buy.as_ref().and_then(|b| b.best_ask()).map(|l| l.price),
            orderbook_buy_bid: book_buy.as_ref().and_then(|b| b.best_bid()).map(|l| l.price),
            orderbook_sell_ask: book_sell.as_ref().and_then(|b| b.best_ask()).map(|l| l.price),
            orderbook_sell_bid: book_sell.as_ref().and_then(|b| b.best_bid()).map(|l| l.price),
            is_last_split,
        }
    }

    fn passes_local_orderbook_spread(
        &self,
        symbol: &str,
        spread: &SpreadData,
        config: &crate::config::SymbolConfig,
    ) -> bool {
        let Some(threshold) = config.grid_config.max_local_orderbook_spread_pct else {
            return true;
        };
        if threshold <= Decimal::ZERO {
            return true;
        }
        let legs = [
            (&spread.exchange_buy, &spread.buy_symbol),
            (&spread.exchange_sell, &spread.sell_symbol),
        ];
        let mut checked: HashSet<(String, String)> = HashSet::new();
        for (venue, leg_symbol) in legs {
            if venue.is_empty() || leg_symbol.is_empty() {
                continue;
            }
            let key = (venue.to_lowercase(), leg_symbol.to_uppercase());
            if !checked.insert(key) {
                continue;
            }
            match gates::local_orderbook_spread_pct(
                &self.processor,
                venue,
                leg_symbol,
                self.data_freshness_seconds,
            ) {
                Some(leg_spread) if leg_spread <= threshold => {}
                Some(leg_spread) => {
                    self.throttle.log(
                        &format!("local_spread_block:{symbol}:{venue}:{leg_symbol}"),
                        &format!(
                            "⏸️ [{symbol}] {venue}/{leg_symbol} 自有点差 {leg_spread:.4}% 高于阈值 {threshold:.4}%，跳过本次机会"
                        ),
                        LogLevel::Info,
                        Duration::from_secs(10),
                    );
                    return false;
                }
                None => {
                    self.throttle.log(
                        &format!("local_spread_missing:{symbol}:{venue}:{leg_symbol}"),
                        &format!(
                            "⏸️ [{symbol}] {venue}/{leg_symbol} 缺少盘口数据，无法计算bid-ask点差，跳过本次信号"
                        ),
                        LogLevel::Warn,
                        Duration::from_secs(5),
                    );
                    return false;
                }
            }
        }
        true
    }

    fn handle_emergency_close_feedback(
        &self,
        symbol: &str,
        result: &ExecutionResult,
        action_label: &str,
    ) {
        for entry in &result.emergency_closes {
            warn!(
                "🧯 [紧急平仓反馈] {symbol} {action_label} | 交易所={} | 数量={} | 上下文={}/{} | 状态={}",
                entry.exchange, entry.quantity, entry.context, entry.exchange_role, entry.status
            );
        }
    }

    /// Audit now plus once more after 1 s to absorb WS propagation delay.
    fn schedule_position_alignment(self: &Arc<Self>, symbol: &str) {
        self.auditor
            .audit(symbol, &self.engine, &self.adapters);
        let orchestrator = self.clone();
        let symbol = symbol.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            orchestrator
                .auditor
                .audit(&symbol, &orchestrator.engine, &orchestrator.adapters);
        });
        self.inflight.lock().push(task);
    }

    /// Immediate audit pass, exposed for shutdown checks and tests.
    pub fn audit_positions(&self, key: &str) -> bool {
        self.auditor.audit(key, &self.engine, &self.adapters)
    }

    async fn maybe_self_heal_exchange_stream(self: &Arc<Self>) {
        {
            let last = self.last_self_heal.lock();
            if let Some(last) = *last {
                if last.elapsed() < SELF_HEAL_COOLDOWN {
                    return;
                }
            }
        }

        let diagnostics = self.pipeline.missing_orderbook_diagnostics();
        if diagnostics.is_empty() {
            return;
        }

        // Worst single-leg outage where the other leg is demonstrably
        // healthy; double outages are a network problem, not a venue one.
        let mut candidates: Vec<(f64, String, String)> = Vec::new();
        for diag in diagnostics.values() {
            if diag.missing_duration_seconds < SELF_HEAL_THRESHOLD_SECONDS {
                continue;
            }
            let a_healthy = diag.state_a == crate::spread::LegState::HasOrderbook;
            let b_healthy = diag.state_b == crate::spread::LegState::HasOrderbook;
            let target = match (a_healthy, b_healthy) {
                (true, false) => diag.exchange_b.clone(),
                (false, true) => diag.exchange_a.clone(),
                _ => continue,
            };
            candidates.push((
                diag.missing_duration_seconds,
                diag.symbol_key.clone(),
                target,
            ));
        }
        let Some((duration, symbol_key, venue)) = candidates
            .into_iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
        else {
            return;
        };

        *self.last_self_heal.lock() = Some(Instant::now());
        let Some(adapter) = self.adapters.get(&venue) else {
            return;
        };
        warn!(
            "🔁 [流自愈] 触发={venue} pair={symbol_key} duration={duration:.1}s"
        );

        adapter.reset_market_callbacks();
        if let Err(err) = adapter.reconnect().await {
            error!("❌ [流自愈] 失败={venue} pair={symbol_key}: {err}");
            return;
        }
        self.receiver.register_adapter(adapter);
        self.receiver.record_reconnect(&venue);
        let symbols = self.subscription_symbols();
        match adapter.subscribe_market_streams(&symbols).await {
            Ok(()) => warn!(
                "✅ [流自愈] 完成={venue} pair={symbol_key} duration={duration:.1}s symbols={}",
                symbols.len()
            ),
            Err(err) => error!("❌ [流自愈] 重订阅失败={venue}: {err}"),
        }
    }

    fn log_status_summary(&self) {
        {
            let mut last = self.last_status_summary.lock();
            if last.elapsed() < STATUS_SUMMARY_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        let positions = self.engine.positions_snapshot();
        let open: Vec<String> = positions
            .iter()
            .filter(|p| p.is_open && p.total_quantity > quantity_epsilon())
            .map(|p| {
                format!(
                    "{}={} ({}→{})",
                    p.symbol, p.total_quantity, p.exchange_buy, p.exchange_sell
                )
            })
            .collect();
        let stats = self.processor.stats();
        let blocked = self.reduce_only.blocked_pairs();
        info!(
            "📊 [状态汇总] 持仓: {} | reduce-only: {} | 订单簿 1h: {} | 队列: {}/{} (峰值 {}/{})",
            if open.is_empty() { "-".to_string() } else { open.join(", ") },
            if blocked.is_empty() { "-".to_string() } else { blocked.join(",") },
            stats.orderbook_processed_1h,
            stats.orderbook_queue_size,
            stats.ticker_queue_size,
            stats.orderbook_queue_peak,
            stats.ticker_queue_peak,
        );
    }

    fn reject(&self, action: &str, symbol: &str, code: &str, detail: Option<&str>) {
        log_signal_reject(&self.throttle, action, symbol, code, detail);
    }

    // ------------------------------------------------------------------
    // Execution locks
    // ------------------------------------------------------------------

    pub fn try_register_open_pair(&self, key: &str) -> bool {
        self.pending_open_pairs.lock().insert(key.to_string())
    }

    pub fn release_open_pair(&self, key: &str) {
        self.pending_open_pairs.lock().remove(key);
    }

    pub fn try_register_close_symbol(&self, key: &str) -> bool {
        self.pending_close_symbols.lock().insert(key.to_string())
    }

    pub fn release_close_symbol(&self, key: &str) {
        self.pending_close_symbols.lock().remove(key);
    }

    fn reap_inflight(&self) {
        self.inflight.lock().retain(|task| !task.is_finished());
    }

    /// Await every in-flight execution/audit task (tests, shutdown).
    pub async fn await_inflight(&self) {
        loop {
            let tasks: Vec<_> = self.inflight.lock().drain(..).collect();
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                let _ = task.await;
            }
        }
    }

    // Component accessors used by the binary and the integration tests.

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn processor(&self) -> &Arc<DataProcessor> {
        &self.processor
    }

    pub fn receiver(&self) -> &Arc<DataReceiver> {
        &self.receiver
    }

    pub fn pipeline(&self) -> &SpreadPipeline {
        &self.pipeline
    }

    pub fn risk(&self) -> &Arc<GlobalRiskController> {
        &self.risk
    }

    pub fn backoff(&self) -> &Arc<ErrorBackoffController> {
        &self.backoff
    }

    pub fn reduce_only(&self) -> &Arc<ReduceOnlyGuard> {
        &self.reduce_only
    }

    pub fn symbol_state(&self) -> &Arc<SymbolStateManager> {
        &self.symbol_state
    }

    pub fn converter(&self) -> &Arc<SymbolConverter> {
        &self.converter
    }
}

fn build_open_pair_key(symbol: &str, exchange_buy: &str, exchange_sell: &str) -> String {
    format!(
        "{}:{}->{}",
        symbol.to_uppercase(),
        exchange_buy.to_lowercase(),
        exchange_sell.to_lowercase()
    )
}

fn resolve_execution_price(
    order: &Option<crate::models::OrderData>,
    fallback: Decimal,
) -> Decimal {
    order
        .as_ref()
        .and_then(|o| o.avg_fill_price.or(o.price))
        .filter(|p| *p > Decimal::ZERO)
        .unwrap_or(fallback)
}

/// Paired fill: the reported success_quantity, else the minimum across
/// per-leg fills, else zero (never book a phantom position).
fn extract_filled_quantity(result: &ExecutionResult) -> Decimal {
    if result.success_quantity > Decimal::ZERO {
        return result.success_quantity;
    }
    let fills: Vec<Decimal> = [&result.order_buy, &result.order_sell]
        .iter()
        .filter_map(|order| order.as_ref())
        .map(|order| order.filled)
        .filter(|filled| *filled > Decimal::ZERO)
        .collect();
    match fills.len() {
        2 => fills[0].min(fills[1]),
        1 => fills[0],
        _ => Decimal::ZERO,
    }
}

/// Re-runs the decision, stability and liquidity gates before an
/// executor retry; a dead orchestrator vetoes the retry.
struct OrchestratorRetryValidator {
    orchestrator: Weak<UnifiedOrchestrator>,
}

#[async_trait]
impl RetryValidator for OrchestratorRetryValidator {
    async fn validate(&self, request: &ExecutionRequest) -> bool {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return false;
        };
        let symbol = request.symbol.to_uppercase();

        // Rebuild a live spread from the freshest books on the request's
        // own legs; stale books veto the retry outright.
        let buy_book = orchestrator.processor.get_orderbook(
            &request.exchange_buy,
            &request.buy_symbol,
            orchestrator.data_freshness_seconds,
        );
        let sell_book = orchestrator.processor.get_orderbook(
            &request.exchange_sell,
            &request.sell_symbol,
            orchestrator.data_freshness_seconds,
        );
        let (Some(buy_book), Some(sell_book)) = (buy_book, sell_book) else {
            warn!("⛔️ [重试门槛] {symbol}: 无最新盘口数据，放弃重新挂单");
            return false;
        };
        let (Some(buy_ask), Some(sell_bid)) = (buy_book.best_ask(), sell_book.best_bid()) else {
            return false;
        };
        let spread = SpreadData::from_legs(
            &symbol,
            &request.exchange_buy,
            &request.buy_symbol,
            buy_ask,
            &request.exchange_sell,
            &request.sell_symbol,
            sell_bid,
        );

        if request.is_open {
            if orchestrator.engine.should_open(&symbol, &spread, None).is_none() {
                // A latched reverse open is a close signal, not a veto of
                // the in-flight close leg.
                if orchestrator.engine.take_reverse_open_detected() {
                    return true;
                }
                info!("⛔️ [重试门槛] {symbol}: 价差已不满足开仓条件，终止补单");
                return false;
            }
        } else if orchestrator
            .engine
            .should_close(&symbol, &spread, None)
            .is_none()
        {
            info!("⛔️ [重试门槛] {symbol}: 平仓条件未满足，终止补单");
            return false;
        }

        let config = orchestrator.config.get_config(&symbol);
        if !orchestrator.price_stability.passes(&symbol, &config) {
            info!("⛔️ [重试门槛] {symbol}: 价格稳定性未通过，终止补单");
            return false;
        }

        if !orchestrator.executor.monitor_only()
            && config.grid_config.require_orderbook_liquidity
        {
            let legs = [
                LiquidityLeg {
                    venue: spread.exchange_buy.clone(),
                    symbol: spread.buy_symbol.clone(),
                    quantity: request.quantity,
                    is_buy: true,
                    description: "重试买入腿",
                },
                LiquidityLeg {
                    venue: spread.exchange_sell.clone(),
                    symbol: spread.sell_symbol.clone(),
                    quantity: request.quantity,
                    is_buy: false,
                    description: "重试卖出腿",
                },
            ];
            if let Err(detail) = gates::verify_orderbook_liquidity(
                &orchestrator.processor,
                &legs,
                config.grid_config.min_orderbook_quantity,
                orchestrator.data_freshness_seconds,
            ) {
                warn!("⛔️ [重试门槛] {symbol}: {detail}，终止补单");
                return false;
            }
        }

        true
    }
}
