//! Unified total-driven decision engine.
//!
//! Everything reduces to `target − actual = delta` over the grid ladder:
//! the current spread selects a grid level, the level selects a target
//! position, and the delta (plus any carried shortfall) is split into an
//! order. Direction memory pins a pair to its original opening side, a
//! reverse signal on the same venue pair is treated as a close signal,
//! and a scalping state machine can replace the grid close branch above a
//! trigger level.
//!
//! All mutations (`record_open`, `record_close`, `report_open_shortfall`)
//! are serialized per symbol by the orchestrator's execution locks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{info, warn};

use crate::config::{ConfigManager, QuantityMode, SymbolConfig};
use crate::models::{
    build_pair_key, quantity_epsilon, FundingRateData, PositionSegment, SegmentedPosition,
    SpreadData,
};
use crate::risk::ErrorBackoffController;

use super::persistence::{Comparison, PersistenceGate};

/// A close decision: how much to unwind and why.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    pub quantity: Decimal,
    pub reason: String,
}

/// Fill details reported back after an open execution.
#[derive(Debug, Clone, Default)]
pub struct OpenFill {
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
    pub entry_price_buy: Option<Decimal>,
    pub entry_price_sell: Option<Decimal>,
    /// Paired quantity actually hedged; falls back to the requested
    /// quantity when absent.
    pub filled_quantity: Option<Decimal>,
}

#[derive(Default)]
struct EngineState {
    /// Symbol-level aggregate positions.
    positions: HashMap<String, SegmentedPosition>,
    /// symbol → pair_key → pair-level position.
    pair_positions: HashMap<String, HashMap<String, SegmentedPosition>>,
    /// pair_key → sign of the first-open spread (+1 / −1).
    open_direction: HashMap<String, i8>,
    scalping_active: HashMap<String, bool>,
    persistence: PersistenceGate,
    /// Latch: a reverse open was refused; the orchestrator should run the
    /// close check immediately. Consumed exactly once.
    reverse_open_detected: bool,
    /// Un-placed quantity from earlier cycles (min_order_size underflow),
    /// added to the next cycle's delta.
    pending_open_shortfall: HashMap<String, Decimal>,
}

pub struct DecisionEngine {
    config: Arc<ConfigManager>,
    backoff: Mutex<Option<Arc<ErrorBackoffController>>>,
    state: Mutex<EngineState>,
}

impl DecisionEngine {
    pub fn new(config: Arc<ConfigManager>) -> Arc<Self> {
        info!("✅ [统一决策] 统一决策引擎初始化完成");
        Arc::new(Self {
            config,
            backoff: Mutex::new(None),
            state: Mutex::new(EngineState::default()),
        })
    }

    pub fn set_backoff_controller(&self, controller: Arc<ErrorBackoffController>) {
        *self.backoff.lock() = Some(controller);
    }

    fn venue_paused(&self, spread: &SpreadData) -> bool {
        let backoff = self.backoff.lock().clone();
        let Some(backoff) = backoff else {
            return false;
        };
        [&spread.exchange_buy, &spread.exchange_sell]
            .iter()
            .any(|venue| !venue.is_empty() && backoff.is_paused(venue))
    }

    // ------------------------------------------------------------------
    // Opens
    // ------------------------------------------------------------------

    pub fn should_open(
        &self,
        symbol: &str,
        spread: &SpreadData,
        funding: Option<&FundingRateData>,
    ) -> Option<Decimal> {
        self.should_open_at(symbol, spread, funding, now_secs())
    }

    /// Clock-injected variant used by tests to drive persistence windows.
    pub fn should_open_at(
        &self,
        symbol: &str,
        spread: &SpreadData,
        _funding: Option<&FundingRateData>,
        now_secs: f64,
    ) -> Option<Decimal> {
        if self.venue_paused(spread) {
            return None;
        }
        let config = self.config.get_config(symbol);
        let persistence_key = persistence_key(symbol, spread);
        let pair_key = spread_pair_key(symbol, spread);

        let mut state = self.state.lock();

        // 1. Grid from the current spread.
        let current_grid = calculate_current_grid(&config, spread.spread_pct);
        if current_grid == 0 {
            state.persistence.reset(&persistence_key);
            return None;
        }

        // 2-3. Level threshold.
        let threshold = open_threshold(&config, current_grid);
        if spread.spread_pct < threshold {
            state.persistence.reset(&persistence_key);
            return None;
        }

        // 4. Persistence in the open (≥) direction.
        let persisted = state.persistence.check(
            &persistence_key,
            spread.spread_pct,
            threshold,
            config.grid_config.spread_persistence_seconds,
            config.grid_config.strict_persistence_check,
            Comparison::Ge,
            now_secs,
        );
        if !persisted {
            return None;
        }

        // 5. Scalping activation is a side effect of climbing the grid.
        if config.grid_config.scalping_enabled
            && !state.scalping_active.get(symbol).copied().unwrap_or(false)
            && current_grid >= config.grid_config.scalping_trigger_segment
        {
            state.scalping_active.insert(symbol.to_string(), true);
            warn!(
                "🔴 [{symbol}] 剥头皮模式激活！当前格子{current_grid} >= 触发格子{}",
                config.grid_config.scalping_trigger_segment
            );
        }

        // 6-7. Target vs actual (plus carried shortfall).
        let target = target_position(&state, symbol, current_grid, &config);
        let actual = actual_position(&state, symbol);
        let carry = state
            .pending_open_shortfall
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let effective_actual = actual + carry;

        // 8a. The side that opened positive must close on the inverse leg,
        // never re-open against itself.
        if let Some(direction) = state.open_direction.get(&pair_key).copied() {
            if actual > quantity_epsilon()
                && spread.spread_pct * Decimal::from(direction) < Decimal::ZERO
            {
                state.persistence.reset(&persistence_key);
                return None;
            }
        }

        // 8b. Same venue pair (in any order) holding size: a different
        // pair_key is a reverse/mixed signal — refuse and latch the close
        // fast-path. Distinct venue pairs may coexist (one-to-many).
        if actual > quantity_epsilon() {
            let venue_set = unordered_venues(&spread.exchange_buy, &spread.exchange_sell);
            let mut reverse_detected = false;
            if let Some(pair_map) = state.pair_positions.get(symbol) {
                for (existing_key, existing) in pair_map {
                    if existing.total_quantity <= quantity_epsilon() {
                        continue;
                    }
                    let existing_set =
                        unordered_venues(&existing.exchange_buy, &existing.exchange_sell);
                    if existing_set != venue_set {
                        continue;
                    }
                    let same_direction = existing
                        .exchange_buy
                        .eq_ignore_ascii_case(&spread.exchange_buy)
                        && existing
                            .exchange_sell
                            .eq_ignore_ascii_case(&spread.exchange_sell);
                    if !same_direction || *existing_key != pair_key {
                        reverse_detected = true;
                        break;
                    }
                }
            }
            if reverse_detected {
                state.reverse_open_detected = true;
                state.persistence.reset(&persistence_key);
                return None;
            }
        }

        // 9-10. Delta and split.
        let delta = target - effective_actual;
        if delta <= quantity_epsilon() {
            return None;
        }
        let order_qty = order_quantity(&mut state, symbol, delta, &config, carry);
        if order_qty <= quantity_epsilon() {
            return None;
        }

        info!(
            "✅ [{symbol}] 开仓信号: 格子T{current_grid} | 目标={target} 实际={actual} 待补={carry} | 新增={delta} 本次={order_qty}"
        );
        Some(order_qty)
    }

    /// Consume the reverse-open latch (true at most once per detection).
    pub fn take_reverse_open_detected(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::take(&mut state.reverse_open_detected)
    }

    // ------------------------------------------------------------------
    // Closes
    // ------------------------------------------------------------------

    pub fn should_close(
        &self,
        symbol: &str,
        spread: &SpreadData,
        funding: Option<&FundingRateData>,
    ) -> Option<CloseSignal> {
        self.should_close_at(symbol, spread, funding, now_secs())
    }

    // Funding data is plumbed through deliberately but not consulted by
    // the close branches; a funding-aware policy can hook in here without
    // changing the contract.
    pub fn should_close_at(
        &self,
        symbol: &str,
        spread: &SpreadData,
        _funding: Option<&FundingRateData>,
        now_secs: f64,
    ) -> Option<CloseSignal> {
        if self.venue_paused(spread) {
            return None;
        }
        let config = self.config.get_config(symbol);
        let mut state = self.state.lock();

        let actual = actual_position(&state, symbol);
        if actual <= quantity_epsilon() {
            return None;
        }

        let current_grid = calculate_current_grid(&config, spread.spread_pct);
        let scalping = state.scalping_active.get(symbol).copied().unwrap_or(false);
        if scalping {
            self.check_scalping_close(&mut state, symbol, current_grid, spread, &config)
        } else {
            self.check_grid_close(&mut state, symbol, current_grid, spread, &config, now_secs)
        }
    }

    fn check_scalping_close(
        &self,
        state: &mut EngineState,
        symbol: &str,
        current_grid: u32,
        spread: &SpreadData,
        config: &SymbolConfig,
    ) -> Option<CloseSignal> {
        let target = target_position(state, symbol, current_grid, config);
        let actual = actual_position(state, symbol);
        let delta = target - actual;
        if delta >= Decimal::ZERO {
            return None;
        }

        let avg_entry = state
            .positions
            .get(symbol)
            .map(|p| p.calculate_avg_spread())
            .unwrap_or(Decimal::ZERO);
        let profit_pct = avg_entry - spread.spread_pct;
        if profit_pct < config.grid_config.scalping_profit_threshold {
            return None;
        }

        let close_qty = order_quantity(state, symbol, delta, config, Decimal::ZERO);
        if close_qty <= quantity_epsilon() {
            return None;
        }
        let reason = format!(
            "剥头皮止盈T{current_grid}(盈利{profit_pct:.3}% >= 阈值{}%)",
            config.grid_config.scalping_profit_threshold
        );
        info!("🛑 [{symbol}] {reason}, 平仓{}到目标{target}", delta.abs());
        Some(CloseSignal {
            quantity: close_qty,
            reason,
        })
    }

    fn check_grid_close(
        &self,
        state: &mut EngineState,
        symbol: &str,
        current_grid: u32,
        spread: &SpreadData,
        config: &SymbolConfig,
        now_secs: f64,
    ) -> Option<CloseSignal> {
        let actual = actual_position(state, symbol);
        let close_key = format!("{symbol}_close");

        // Direction memory keyed by the live pair position; the
        // symbol-level record is the fallback.
        let active_pair_key = state
            .pair_positions
            .get(symbol)
            .and_then(|pair_map| {
                pair_map
                    .iter()
                    .find(|(_, p)| p.total_quantity > quantity_epsilon())
                    .map(|(key, _)| key.clone())
            })
            .or_else(|| {
                state.positions.get(symbol).map(|p| {
                    build_pair_key(
                        symbol,
                        &p.exchange_buy,
                        &p.exchange_sell,
                        &p.buy_symbol,
                        &p.sell_symbol,
                    )
                })
            })?;
        let direction = state
            .open_direction
            .get(&active_pair_key)
            .copied()
            .unwrap_or(1);

        // How far the closing opportunity has moved in favor of reversal.
        let sign = if direction >= 0 {
            Decimal::ONE
        } else {
            -Decimal::ONE
        };
        let relative_spread = -spread.spread_pct * sign;

        let target = target_position_by_spread(state, symbol, relative_spread, config);
        let close_delta = actual - target;
        if close_delta <= quantity_epsilon() {
            state.persistence.reset(&close_key);
            return None;
        }

        let close_threshold = close_persistence_threshold(actual, config);
        let persisted = state.persistence.check(
            &close_key,
            relative_spread,
            close_threshold,
            config.grid_config.spread_persistence_seconds,
            config.grid_config.strict_persistence_check,
            Comparison::Le,
            now_secs,
        );
        if !persisted {
            return None;
        }

        let close_qty = order_quantity(state, symbol, close_delta, config, Decimal::ZERO);
        if close_qty <= quantity_epsilon() {
            return None;
        }
        let reason = format!(
            "网格平仓T{current_grid}(平仓价差{:.3}%, 反转后{relative_spread:.3}%, 目标{target}, 实际{actual})",
            spread.spread_pct
        );
        Some(CloseSignal {
            quantity: close_qty,
            reason,
        })
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    pub fn record_open(
        &self,
        symbol: &str,
        quantity: Decimal,
        spread: &SpreadData,
        funding: Option<&FundingRateData>,
        fill: OpenFill,
    ) {
        if quantity <= quantity_epsilon() {
            return;
        }
        let actual_quantity = match fill.filled_quantity {
            Some(filled) if filled > quantity_epsilon() => filled,
            _ => quantity,
        };
        let pair_key = spread_pair_key(symbol, spread);
        let now = Utc::now();

        let mut state = self.state.lock();
        let prev_total = state
            .positions
            .get(symbol)
            .map(|p| p.total_quantity)
            .unwrap_or(Decimal::ZERO);

        let buy_symbol = non_empty_or(&spread.buy_symbol, symbol);
        let sell_symbol = non_empty_or(&spread.sell_symbol, symbol);

        let position = state
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| {
                SegmentedPosition::new(
                    symbol,
                    &spread.exchange_buy,
                    &spread.exchange_sell,
                    &buy_symbol,
                    &sell_symbol,
                    spread.spread_pct,
                )
            });
        // Direction may have flipped since the position record was
        // created; keep the venue legs current.
        position.exchange_buy = spread.exchange_buy.clone();
        position.exchange_sell = spread.exchange_sell.clone();
        position.buy_symbol = buy_symbol.clone();
        position.sell_symbol = sell_symbol.clone();

        let segment_id = position.next_segment_id();
        position.segments.push(build_segment(
            segment_id,
            quantity,
            actual_quantity,
            spread,
            funding,
            &fill,
            now,
        ));
        position.total_quantity += actual_quantity;
        position.avg_open_spread_pct = position.calculate_avg_spread();
        position.last_update_time = now;
        position.is_open = true;
        let new_total = position.total_quantity;

        // Pair-level ledger mirrors the symbol-level one.
        let pair_map = state.pair_positions.entry(symbol.to_string()).or_default();
        let pair_position = pair_map.entry(pair_key.clone()).or_insert_with(|| {
            let mut p = SegmentedPosition::new(
                symbol,
                &spread.exchange_buy,
                &spread.exchange_sell,
                &buy_symbol,
                &sell_symbol,
                spread.spread_pct,
            );
            p.pair_key = Some(pair_key.clone());
            p
        });
        let pair_segment_id = pair_position.next_segment_id();
        pair_position.segments.push(build_segment(
            pair_segment_id,
            quantity,
            actual_quantity,
            spread,
            funding,
            &fill,
            now,
        ));
        pair_position.total_quantity += actual_quantity;
        pair_position.avg_open_spread_pct = pair_position.calculate_avg_spread();
        pair_position.last_update_time = now;
        pair_position.is_open = true;

        // Install direction memory on the first fill (or after the pair
        // collapsed to zero).
        let should_init_memory =
            !state.open_direction.contains_key(&pair_key) || prev_total <= quantity_epsilon();
        if should_init_memory {
            let direction = if spread.spread_pct >= Decimal::ZERO { 1 } else { -1 };
            state.open_direction.insert(pair_key.clone(), direction);
            info!(
                "🧠 [{pair_key}] 记忆已建立 | 方向={} | 交易所={}→{}",
                if direction > 0 { "正" } else { "负" },
                spread.exchange_buy,
                spread.exchange_sell
            );
        }

        info!(
            "✅ [{symbol}] 记录开仓 (段{segment_id}) | 数量: 目标={quantity} 实际={actual_quantity} | 价差: {:.3}% | 总持仓: {new_total}",
            spread.spread_pct
        );
    }

    pub fn record_close(&self, symbol: &str, quantity: Decimal, spread: &SpreadData, reason: &str) {
        if quantity <= quantity_epsilon() {
            return;
        }
        let mut state = self.state.lock();
        if !state.positions.contains_key(symbol) {
            return;
        }

        let closed_segments = {
            let position = state.positions.get_mut(symbol).unwrap();
            apply_close_to_position(position, quantity, spread)
        };

        let remaining = state
            .positions
            .get(symbol)
            .map(|p| p.total_quantity)
            .unwrap_or(Decimal::ZERO);
        if remaining <= quantity_epsilon() {
            if state.scalping_active.remove(symbol).unwrap_or(false) {
                info!("🟢 [{symbol}] 剥头皮模式退出，恢复网格模式");
            }
        }

        info!(
            "🛑 [{symbol}] 记录平仓 | 数量: {quantity} | 关闭段: {closed_segments:?} | 剩余持仓: {remaining} | 原因: {reason}"
        );

        // Pair-level ledger: match by venue set first (the closing view
        // is the reverse of the opening direction), reverse key second.
        let closing_set = unordered_venues(&spread.exchange_buy, &spread.exchange_sell);
        if let Some(pair_map) = state.pair_positions.get_mut(symbol) {
            let matched_key = pair_map
                .iter()
                .find(|(_, p)| {
                    unordered_venues(&p.exchange_buy, &p.exchange_sell) == closing_set
                })
                .map(|(key, _)| key.clone())
                .or_else(|| {
                    let reverse_key = build_pair_key(
                        symbol,
                        &spread.exchange_sell,
                        &spread.exchange_buy,
                        &non_empty_or(&spread.sell_symbol, symbol),
                        &non_empty_or(&spread.buy_symbol, symbol),
                    );
                    pair_map.contains_key(&reverse_key).then_some(reverse_key)
                });
            if let Some(key) = matched_key {
                if let Some(pair_position) = pair_map.get_mut(&key) {
                    let adjust = quantity.min(pair_position.total_quantity);
                    apply_close_to_position(pair_position, adjust, spread);
                }
            }
        }

        self.cleanup_position_state(&mut state, symbol);
    }

    /// Remember un-filled open quantity so the next cycle tops it up.
    pub fn report_open_shortfall(&self, symbol: &str, requested: Decimal, actual: Decimal) {
        let diff = requested - actual;
        let mut state = self.state.lock();
        if diff > quantity_epsilon() {
            warn!("⚠️ [{symbol}] 记录拆单短缺: 目标{requested}, 实际{actual}, 缺口{diff}");
            state.pending_open_shortfall.insert(symbol.to_string(), diff);
        } else {
            state
                .pending_open_shortfall
                .insert(symbol.to_string(), Decimal::ZERO);
        }
    }

    fn cleanup_position_state(&self, state: &mut EngineState, symbol: &str) {
        let zeroed = state
            .positions
            .get(symbol)
            .map(|p| p.total_quantity <= quantity_epsilon())
            .unwrap_or(false);
        if zeroed {
            state.positions.remove(symbol);
            state.pending_open_shortfall.remove(symbol);
            state.scalping_active.remove(symbol);
            state.persistence.reset_prefix(symbol);
        }

        if let Some(pair_map) = state.pair_positions.get_mut(symbol) {
            let dead_keys: Vec<String> = pair_map
                .iter()
                .filter(|(_, p)| p.total_quantity <= quantity_epsilon())
                .map(|(key, _)| key.clone())
                .collect();
            for key in dead_keys {
                pair_map.remove(&key);
                if state.open_direction.remove(&key).is_some() {
                    info!("🧠 [{key}] 记忆已清除（套利对持仓归零）");
                }
            }
            if pair_map.is_empty() {
                state.pair_positions.remove(symbol);
            }
        }
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn get_position(&self, symbol: &str) -> Option<SegmentedPosition> {
        self.state.lock().positions.get(symbol).cloned()
    }

    pub fn positions_snapshot(&self) -> Vec<SegmentedPosition> {
        self.state.lock().positions.values().cloned().collect()
    }

    pub fn pair_positions_snapshot(&self) -> Vec<(String, SegmentedPosition)> {
        let state = self.state.lock();
        let mut snapshot = Vec::new();
        for (symbol, pair_map) in &state.pair_positions {
            for pair_position in pair_map.values() {
                snapshot.push((symbol.clone(), pair_position.clone()));
            }
        }
        snapshot
    }

    pub fn has_open_positions(&self) -> bool {
        self.state
            .lock()
            .positions
            .values()
            .any(|p| p.is_open && p.total_quantity > quantity_epsilon())
    }

    pub fn open_direction(&self, pair_key: &str) -> Option<i8> {
        self.state.lock().open_direction.get(pair_key).copied()
    }

    pub fn pending_shortfall(&self, symbol: &str) -> Decimal {
        self.state
            .lock()
            .pending_open_shortfall
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn is_scalping_active(&self, symbol: &str) -> bool {
        self.state
            .lock()
            .scalping_active
            .get(symbol)
            .copied()
            .unwrap_or(false)
    }

    pub fn grid_level(&self, symbol: &str, spread_pct: Decimal) -> u32 {
        let config = self.config.get_config(symbol);
        calculate_current_grid(&config, spread_pct)
    }

    /// Highest grid segment covered by the current position size.
    pub fn current_segments(&self, symbol: &str) -> u32 {
        let config = self.config.get_config(symbol);
        let base = config.quantity_config.base_quantity;
        if base <= quantity_epsilon() {
            return 0;
        }
        let state = self.state.lock();
        let Some(position) = state.positions.get(symbol) else {
            return 0;
        };
        let segments = (position.total_quantity / base)
            .ceil()
            .to_u32()
            .unwrap_or(0);
        segments.min(config.grid_config.max_segments)
    }

    /// Whether this order exhausts the remaining split schedule.
    ///
    /// Opens keep the size heuristic (the planned remainder is unknown
    /// until the fill reports); closes are exact from remaining − qty.
    pub fn is_last_split_order(&self, symbol: &str, order_quantity: Decimal, is_open: bool) -> bool {
        let config = self.config.get_config(symbol);
        if is_open {
            let min_qty = config.grid_config.min_partial_order_quantity;
            order_quantity < min_qty * Decimal::TWO
        } else {
            let state = self.state.lock();
            let actual = actual_position(&state, symbol);
            actual - order_quantity < quantity_epsilon()
        }
    }

    /// Grid threshold table, logged once at startup for operators.
    pub fn log_grid_thresholds(&self) {
        for symbol in self.config.configured_symbols() {
            let config = self.config.get_config(&symbol);
            let (open_thresholds, close_thresholds) = build_grid_thresholds(&config);
            if open_thresholds.is_empty() {
                continue;
            }
            let mut lines = vec![format!(
                "  - {symbol} | base_quantity={} | max_segments={}",
                config.quantity_config.base_quantity, config.grid_config.max_segments
            )];
            for (index, open) in open_thresholds.iter().enumerate() {
                let close = close_thresholds
                    .get(index)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                lines.push(format!(
                    "      T{}: 开仓≥{open:.4}%, 平仓<{close:.4}%",
                    index + 1
                ));
            }
            info!("📊 [统一决策] 网格阈值表\n{}", lines.join("\n"));
        }
    }
}

// ----------------------------------------------------------------------
// Grid math (free functions; unit-tested directly)
// ----------------------------------------------------------------------

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn unordered_venues(a: &str, b: &str) -> (String, String) {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn persistence_key(symbol: &str, spread: &SpreadData) -> String {
    let buy = spread.exchange_buy.trim().to_lowercase();
    let sell = spread.exchange_sell.trim().to_lowercase();
    match (buy.is_empty(), sell.is_empty()) {
        (false, false) => format!("{symbol}_{buy}_{sell}"),
        (false, true) => format!("{symbol}_{buy}"),
        (true, false) => format!("{symbol}_{sell}"),
        (true, true) => symbol.to_string(),
    }
}

fn spread_pair_key(symbol: &str, spread: &SpreadData) -> String {
    build_pair_key(
        symbol,
        &spread.exchange_buy,
        &spread.exchange_sell,
        &non_empty_or(&spread.buy_symbol, symbol),
        &non_empty_or(&spread.sell_symbol, symbol),
    )
}

/// Grid index for a spread: 0 below T1, else floor((s − T1)/Δ) + 1.
/// Uncapped; callers clamp to max_segments when sizing.
pub fn calculate_current_grid(config: &SymbolConfig, spread_pct: Decimal) -> u32 {
    let t1 = config.grid_config.initial_spread_threshold;
    if spread_pct < t1 {
        return 0;
    }
    let step = config.grid_config.grid_step;
    if step <= Decimal::ZERO {
        return 1;
    }
    let diff = spread_pct - t1;
    (diff / step).floor().to_u32().unwrap_or(0) + 1
}

pub fn open_threshold(config: &SymbolConfig, grid: u32) -> Decimal {
    let t1 = config.grid_config.initial_spread_threshold;
    if grid == 0 {
        return t1;
    }
    t1 + config.grid_config.grid_step * Decimal::from(grid - 1)
}

/// Open and close threshold ladders. `close[0] = T1 * t0_close_ratio`,
/// `close[n] = open[n-1]`; both strictly monotonic for a positive step.
pub fn build_grid_thresholds(config: &SymbolConfig) -> (Vec<Decimal>, Vec<Decimal>) {
    let initial = config.grid_config.initial_spread_threshold;
    let step = config.grid_config.grid_step;
    let max_segments = config.grid_config.max_segments as usize;
    if initial <= Decimal::ZERO || step < Decimal::ZERO || max_segments == 0 {
        return (Vec::new(), Vec::new());
    }

    let mut open_thresholds = Vec::with_capacity(max_segments);
    let mut current = initial;
    for _ in 0..max_segments {
        open_thresholds.push(current);
        current += step;
    }

    let t0 = initial * config.grid_config.t0_close_ratio;
    let mut close_thresholds = Vec::with_capacity(max_segments);
    close_thresholds.push(t0);
    close_thresholds.extend_from_slice(&open_thresholds[..max_segments - 1]);

    (open_thresholds, close_thresholds)
}

fn count_segments_by_threshold(value: Decimal, thresholds: &[Decimal]) -> u32 {
    for index in (0..thresholds.len()).rev() {
        if value >= thresholds[index] {
            return (index + 1) as u32;
        }
    }
    0
}

fn actual_position(state: &EngineState, symbol: &str) -> Decimal {
    state
        .positions
        .get(symbol)
        .map(|p| p.total_quantity)
        .unwrap_or(Decimal::ZERO)
}

/// Target size for a grid level. In value mode the reference price is the
/// latest segment's buy price; without one, fixed sizing is the fallback.
fn target_position(
    state: &EngineState,
    symbol: &str,
    grid: u32,
    config: &SymbolConfig,
) -> Decimal {
    if grid == 0 {
        return Decimal::ZERO;
    }
    let effective_grid = grid.min(config.grid_config.max_segments);
    match config.quantity_config.quantity_mode {
        QuantityMode::Fixed => {
            Decimal::from(effective_grid) * config.quantity_config.base_quantity
        }
        QuantityMode::Value => {
            let current_price = state
                .positions
                .get(symbol)
                .and_then(|p| p.segments.iter().max_by_key(|s| s.segment_id))
                .map(|s| s.open_price_buy)
                .unwrap_or(Decimal::ZERO);
            if current_price <= Decimal::ZERO {
                return Decimal::from(effective_grid) * config.quantity_config.base_quantity;
            }
            let quantity_per_grid = config.quantity_config.target_value_usdc / current_price;
            Decimal::from(effective_grid) * quantity_per_grid
        }
    }
}

/// Close-side target from the normalized spread: climbing opens up to the
/// highest satisfied open threshold; falling holds until the level below
/// gives way ("open one level up, close one level down" hysteresis).
fn target_position_by_spread(
    state: &EngineState,
    symbol: &str,
    spread_pct: Decimal,
    config: &SymbolConfig,
) -> Decimal {
    let max_segments = config.grid_config.max_segments;
    if max_segments == 0 {
        return Decimal::ZERO;
    }
    let single_grid_qty = config.quantity_config.base_quantity;
    if single_grid_qty <= quantity_epsilon() {
        return Decimal::ZERO;
    }
    let (open_thresholds, close_thresholds) = build_grid_thresholds(config);
    if open_thresholds.is_empty() {
        return Decimal::ZERO;
    }

    let actual = actual_position(state, symbol);
    let current_segments = if actual > quantity_epsilon() {
        (actual / single_grid_qty).ceil().to_u32().unwrap_or(0)
    } else {
        0
    };

    let open_segments = count_segments_by_threshold(spread_pct, &open_thresholds);
    let keep_segments =
        count_segments_by_threshold(spread_pct, &close_thresholds).min(current_segments);

    let target_segments = if open_segments > current_segments {
        open_segments
    } else {
        keep_segments
    }
    .min(max_segments);

    Decimal::from(target_segments) * single_grid_qty
}

/// Close-channel persistence threshold for the current position size.
fn close_persistence_threshold(actual: Decimal, config: &SymbolConfig) -> Decimal {
    let base = config.quantity_config.base_quantity;
    if base <= quantity_epsilon() {
        return config.grid_config.initial_spread_threshold / Decimal::TEN;
    }
    let segments = (actual / base).ceil().to_u32().unwrap_or(1);
    let segments = segments.clamp(1, config.grid_config.max_segments);
    let (_, close_thresholds) = build_grid_thresholds(config);
    if close_thresholds.is_empty() {
        return Decimal::ZERO;
    }
    let index = ((segments - 1) as usize).min(close_thresholds.len() - 1);
    close_thresholds[index]
}

/// Split one delta into this cycle's order, merging carried shortfall.
/// Below min_order_size the whole need is carried and zero is returned.
fn order_quantity(
    state: &mut EngineState,
    symbol: &str,
    delta: Decimal,
    config: &SymbolConfig,
    carry: Decimal,
) -> Decimal {
    let abs_delta = delta.abs();
    let raw_needed = abs_delta + carry;

    let base_order = split_quantity_core(abs_delta, config);
    let mut order_qty = (base_order + carry).min(raw_needed);

    order_qty = order_qty.round_dp_with_strategy(
        config.quantity_config.quantity_precision,
        RoundingStrategy::ToZero,
    );

    let min_order = config.quantity_config.min_order_size;
    if min_order > Decimal::ZERO && order_qty < min_order - quantity_epsilon() {
        state
            .pending_open_shortfall
            .insert(symbol.to_string(), raw_needed);
        info!("⏸️ [{symbol}] 本次所需 {raw_needed} 低于最小下单量 {min_order}，累积到下一次开仓");
        return Decimal::ZERO;
    }

    state
        .pending_open_shortfall
        .insert(symbol.to_string(), Decimal::ZERO);
    order_qty
}

fn split_quantity_core(available: Decimal, config: &SymbolConfig) -> Decimal {
    if available <= quantity_epsilon() {
        return Decimal::ZERO;
    }
    if let Some(split_size) = config.grid_config.split_order_size {
        if split_size > Decimal::ZERO {
            return if split_size >= config.quantity_config.base_quantity {
                available
            } else {
                split_size.min(available)
            };
        }
    }
    let partial_ratio = config.grid_config.segment_partial_order_ratio;
    let min_qty = config.grid_config.min_partial_order_quantity;
    if partial_ratio >= Decimal::ONE {
        available
    } else if min_qty > Decimal::ZERO {
        min_qty.min(available)
    } else {
        (available * partial_ratio).min(available)
    }
}

fn build_segment(
    segment_id: u64,
    target_quantity: Decimal,
    actual_quantity: Decimal,
    spread: &SpreadData,
    funding: Option<&FundingRateData>,
    fill: &OpenFill,
    now: chrono::DateTime<Utc>,
) -> PositionSegment {
    PositionSegment {
        segment_id,
        target_quantity,
        open_quantity: actual_quantity,
        open_spread_pct: spread.spread_pct,
        open_time: now,
        open_price_buy: fill.entry_price_buy.unwrap_or(spread.price_buy),
        open_price_sell: fill.entry_price_sell.unwrap_or(spread.price_sell),
        open_funding_rate_buy: funding.map(|f| f.funding_rate_buy).unwrap_or(Decimal::ZERO),
        open_funding_rate_sell: funding
            .map(|f| f.funding_rate_sell)
            .unwrap_or(Decimal::ZERO),
        buy_order_id: fill.buy_order_id.clone(),
        sell_order_id: fill.sell_order_id.clone(),
        is_closed: false,
        close_time: None,
        close_spread_pct: None,
        close_price_buy: None,
        close_price_sell: None,
    }
}

/// FIFO consume across non-closed segments; a drained segment gets its
/// close stamps from the reported closing spread.
fn apply_close_to_position(
    position: &mut SegmentedPosition,
    quantity: Decimal,
    spread: &SpreadData,
) -> Vec<u64> {
    let mut remaining = quantity;
    let mut closed_segments = Vec::new();
    let now = Utc::now();

    for segment in position.segments.iter_mut() {
        if segment.is_closed || segment.open_quantity <= quantity_epsilon() {
            continue;
        }
        if remaining <= quantity_epsilon() {
            break;
        }
        let close_this = remaining.min(segment.open_quantity);
        segment.open_quantity -= close_this;
        remaining -= close_this;
        if segment.open_quantity <= quantity_epsilon() {
            segment.open_quantity = Decimal::ZERO;
            segment.is_closed = true;
            segment.close_time = Some(now);
            segment.close_spread_pct = Some(spread.spread_pct);
            segment.close_price_buy = Some(spread.price_buy);
            segment.close_price_sell = Some(spread.price_sell);
            closed_segments.push(segment.segment_id);
        }
    }

    position.total_quantity -= quantity;
    if position.total_quantity < Decimal::ZERO {
        position.total_quantity = Decimal::ZERO;
    }
    position.avg_open_spread_pct = position.calculate_avg_spread();
    position.last_update_time = now;
    if position.total_quantity <= quantity_epsilon() {
        position.total_quantity = Decimal::ZERO;
        position.is_open = false;
    }

    closed_segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const CONFIG: &str = r#"
        [default_config.grid_config]
        initial_spread_threshold = 0.05
        grid_step = 0.03
        max_segments = 3
        t0_close_ratio = 0.4
        spread_persistence_seconds = 1
        strict_persistence_check = true

        [default_config.quantity_config]
        base_quantity = 0.001
        quantity_mode = "fixed"
        target_value_usdc = 100.0
        quantity_precision = 5

        [default_config.risk_config]
        max_position_value = 500.0
        max_loss_percent = 2.0

        [symbol_configs.WAIT-USDC-PERP.grid_config]
        spread_persistence_seconds = 3

        [symbol_configs.SCALP-USDC-PERP.grid_config]
        scalping_enabled = true
        scalping_trigger_segment = 2
        scalping_profit_threshold = 0.05

        [symbol_configs.MINI-USDC-PERP.quantity_config]
        min_order_size = 0.0008

        [symbol_configs.LADDER-USDC-PERP.grid_config]
        initial_spread_threshold = 0.06
        grid_step = 0.14
        max_segments = 5
        t0_close_ratio = 0.1
    "#;

    fn engine() -> Arc<DecisionEngine> {
        let config = Arc::new(ConfigManager::from_toml_str(CONFIG).unwrap());
        DecisionEngine::new(config)
    }

    fn spread(symbol: &str, buy: &str, sell: &str, pct: Decimal) -> SpreadData {
        let price_buy = dec!(100);
        let price_sell = price_buy + price_buy * pct / Decimal::ONE_HUNDRED;
        SpreadData {
            symbol: symbol.to_string(),
            exchange_buy: buy.to_string(),
            exchange_sell: sell.to_string(),
            price_buy,
            price_sell,
            size_buy: dec!(5),
            size_sell: dec!(5),
            spread_abs: price_sell - price_buy,
            spread_pct: pct,
            buy_symbol: symbol.to_string(),
            sell_symbol: symbol.to_string(),
        }
    }

    fn open(engine: &DecisionEngine, symbol: &str, qty: Decimal, pct: Decimal) {
        let s = spread(symbol, "lighter", "paradex", pct);
        engine.record_open(symbol, qty, &s, None, OpenFill::default());
    }

    #[test]
    fn grid_index_is_floor_based_and_uncapped() {
        let config = ConfigManager::from_toml_str(CONFIG).unwrap();
        let cfg = config.get_config("X");
        assert_eq!(calculate_current_grid(&cfg, dec!(0.04)), 0);
        assert_eq!(calculate_current_grid(&cfg, dec!(0.05)), 1);
        assert_eq!(calculate_current_grid(&cfg, dec!(0.0799)), 1);
        assert_eq!(calculate_current_grid(&cfg, dec!(0.08)), 2);
        assert_eq!(calculate_current_grid(&cfg, dec!(0.11)), 3);
        // Uncapped past max_segments; sizing clamps later.
        assert_eq!(calculate_current_grid(&cfg, dec!(0.20)), 6);
    }

    #[test]
    fn threshold_ladders_are_strictly_monotonic() {
        let config = ConfigManager::from_toml_str(CONFIG).unwrap();
        let cfg = config.get_config("LADDER-USDC-PERP");
        let (open, close) = build_grid_thresholds(&cfg);
        assert_eq!(open[0], dec!(0.06));
        assert_eq!(open[1], dec!(0.20));
        assert_eq!(close[0], dec!(0.006));
        assert_eq!(close[1], dec!(0.06));
        for window in open.windows(2) {
            assert!(window[0] < window[1]);
        }
        for window in close.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn first_open_on_t1_with_strict_persistence() {
        let engine = engine();
        let symbol = "WAIT-USDC-PERP";
        let s = spread(symbol, "lighter", "paradex", dec!(0.06));

        // Sustained for 3 s: passes on the tick where elapsed ≥ 3 s.
        assert!(engine.should_open_at(symbol, &s, None, 0.0).is_none());
        assert!(engine.should_open_at(symbol, &s, None, 1.0).is_none());
        assert!(engine.should_open_at(symbol, &s, None, 2.0).is_none());
        let qty = engine.should_open_at(symbol, &s, None, 3.0).unwrap();
        assert_eq!(qty, dec!(0.001));

        // A non-qualifying tick resets the window.
        let weak = spread(symbol, "lighter", "paradex", dec!(0.01));
        assert!(engine.should_open_at(symbol, &weak, None, 3.5).is_none());
        assert!(engine.should_open_at(symbol, &s, None, 4.0).is_none());
        assert!(engine.should_open_at(symbol, &s, None, 6.9).is_none());
        assert!(engine.should_open_at(symbol, &s, None, 7.0).is_some());
    }

    #[test]
    fn open_then_close_round_trip_clears_memory() {
        let engine = engine();
        let symbol = "BTC-USDC-PERP";
        open(&engine, symbol, dec!(0.001), dec!(0.06));

        let position = engine.get_position(symbol).unwrap();
        assert_eq!(position.total_quantity, dec!(0.001));
        let pair_key = build_pair_key(symbol, "lighter", "paradex", symbol, symbol);
        assert_eq!(engine.open_direction(&pair_key), Some(1));

        // Closing view has reversed legs; relative spread 0.01 < T0=0.02
        // collapses the target to zero.
        let closing = spread(symbol, "paradex", "lighter", dec!(-0.01));
        let signal = engine.should_close(symbol, &closing, None).unwrap();
        assert_eq!(signal.quantity, dec!(0.001));
        assert!(signal.reason.contains("网格平仓"));

        engine.record_close(symbol, signal.quantity, &closing, &signal.reason);
        assert!(engine.get_position(symbol).is_none());
        assert_eq!(engine.open_direction(&pair_key), None);
        assert!(!engine.has_open_positions());
    }

    #[test]
    fn grid_climb_then_fifo_partial_close() {
        let engine = engine();
        let symbol = "BTC-USDC-PERP";
        open(&engine, symbol, dec!(0.001), dec!(0.06));

        // Spread climbs to T3: target 0.003, delta 0.002 in one split.
        let climb = spread(symbol, "lighter", "paradex", dec!(0.115));
        let qty = engine.should_open(symbol, &climb, None).unwrap();
        assert_eq!(qty, dec!(0.002));
        engine.record_open(symbol, qty, &climb, None, OpenFill::default());
        assert_eq!(engine.get_position(symbol).unwrap().total_quantity, dec!(0.003));
        assert_eq!(engine.current_segments(symbol), 3);

        // Falling to 0.07 keeps two segments (close ladder hysteresis:
        // 0.07 ≥ close_threshold[2]=0.05, < close_threshold[3]=0.08).
        let closing = spread(symbol, "paradex", "lighter", dec!(-0.07));
        let signal = engine.should_close(symbol, &closing, None).unwrap();
        assert_eq!(signal.quantity, dec!(0.001));
        engine.record_close(symbol, signal.quantity, &closing, &signal.reason);

        // FIFO consumed the first segment; the T3 segment is intact.
        let position = engine.get_position(symbol).unwrap();
        assert_eq!(position.total_quantity, dec!(0.002));
        let open_ids: Vec<u64> = position.open_segments().map(|s| s.segment_id).collect();
        assert_eq!(open_ids, vec![2]);
        assert!(position.segments[0].is_closed);
        assert!(position.segments[0].close_spread_pct.is_some());
    }

    #[test]
    fn reverse_open_is_refused_and_latched_once() {
        let engine = engine();
        let symbol = "BTC-USDC-PERP";
        open(&engine, symbol, dec!(0.001), dec!(0.06));

        // Best opening direction flipped to paradex→lighter on the same
        // venue pair: refuse and latch the close fast-path.
        let reversed = spread(symbol, "paradex", "lighter", dec!(0.06));
        assert!(engine.should_open(symbol, &reversed, None).is_none());
        assert!(engine.take_reverse_open_detected());
        // Consumed exactly once.
        assert!(!engine.take_reverse_open_detected());
    }

    #[test]
    fn opposite_sign_against_memory_is_refused() {
        let engine = engine();
        let symbol = "BTC-USDC-PERP";
        // The fill reported a negative spread, so the memory sign is −1.
        let negative_fill = spread(symbol, "lighter", "paradex", dec!(-0.06));
        engine.record_open(symbol, dec!(0.001), &negative_fill, None, OpenFill::default());
        let pair_key = build_pair_key(symbol, "lighter", "paradex", symbol, symbol);
        assert_eq!(engine.open_direction(&pair_key), Some(-1));

        // A positive spread on the same pair contradicts the memory:
        // wait for the close instead of stacking on.
        let positive = spread(symbol, "lighter", "paradex", dec!(0.06));
        assert!(engine.should_open(symbol, &positive, None).is_none());
        assert!(!engine.take_reverse_open_detected());
    }

    #[test]
    fn different_venue_pairs_may_coexist() {
        let engine = engine();
        let symbol = "BTC-USDC-PERP";
        open(&engine, symbol, dec!(0.001), dec!(0.06));

        // A different venue pair for the same symbol is one-to-many
        // arbitrage, not a reverse signal.
        let other_pair = spread(symbol, "edgex", "backpack", dec!(0.115));
        assert!(engine.should_open(symbol, &other_pair, None).is_some());
        assert!(!engine.take_reverse_open_detected());
    }

    #[test]
    fn shortfall_carry_accumulates_and_clears() {
        let engine = engine();
        let symbol = "MINI-USDC-PERP";

        // Need 0.0005 < min_order_size 0.0008: carried, nothing ordered.
        open(&engine, symbol, dec!(0.0005), dec!(0.06));
        engine.report_open_shortfall(symbol, dec!(0.001), dec!(0.0005));
        assert_eq!(engine.pending_shortfall(symbol), dec!(0.0005));

        // Next climb merges the carry: target 0.002, actual 0.0005,
        // carry 0.0005 → delta 0.001, order = 0.001 + carry ≤ needed.
        let climb = spread(symbol, "lighter", "paradex", dec!(0.08));
        let qty = engine.should_open(symbol, &climb, None).unwrap();
        assert!(qty >= dec!(0.0008));
        assert_eq!(engine.pending_shortfall(symbol), Decimal::ZERO);
        // Conservation: order + remaining shortfall ≤ delta + carry.
        assert!(qty <= dec!(0.0015) + quantity_epsilon());
    }

    #[test]
    fn order_quantity_below_minimum_returns_zero_and_carries() {
        let engine = engine();
        let config = engine.config.get_config("MINI-USDC-PERP");
        let mut state = EngineState::default();
        let qty = order_quantity(
            &mut state,
            "MINI-USDC-PERP",
            dec!(0.0005),
            &config,
            Decimal::ZERO,
        );
        assert_eq!(qty, Decimal::ZERO);
        assert_eq!(
            state.pending_open_shortfall.get("MINI-USDC-PERP"),
            Some(&dec!(0.0005))
        );
    }

    #[test]
    fn order_quantity_quantizes_down() {
        let engine = engine();
        let config = engine.config.get_config("BTC-USDC-PERP");
        let mut state = EngineState::default();
        let qty = order_quantity(
            &mut state,
            "BTC-USDC-PERP",
            dec!(0.0012349),
            &config,
            Decimal::ZERO,
        );
        assert_eq!(qty, dec!(0.00123));
    }

    #[test]
    fn scalping_activates_on_trigger_and_takes_profit() {
        let engine = engine();
        let symbol = "SCALP-USDC-PERP";

        // Climb straight to grid 2 (trigger): scalping activates on the
        // qualifying open check.
        let climb = spread(symbol, "lighter", "paradex", dec!(0.09));
        let qty = engine.should_open(symbol, &climb, None).unwrap();
        assert_eq!(qty, dec!(0.002));
        assert!(engine.is_scalping_active(symbol));
        engine.record_open(symbol, qty, &climb, None, OpenFill::default());

        // Closing tick at 0.03%: profit = 0.09 − 0.03 ≥ 0.05 and the
        // grid-2 target is below actual → scalping take-profit.
        let closing = spread(symbol, "paradex", "lighter", dec!(0.03));
        let signal = engine.should_close(symbol, &closing, None).unwrap();
        assert!(signal.reason.contains("剥头皮止盈"));
        engine.record_close(symbol, signal.quantity, &closing, &signal.reason);

        // Full retirement drops the scalping state.
        if engine.get_position(symbol).is_none() {
            assert!(!engine.is_scalping_active(symbol));
        }
    }

    #[test]
    fn filled_quantity_overrides_requested_in_record_open() {
        let engine = engine();
        let symbol = "BTC-USDC-PERP";
        let s = spread(symbol, "lighter", "paradex", dec!(0.06));
        engine.record_open(
            symbol,
            dec!(0.002),
            &s,
            None,
            OpenFill {
                filled_quantity: Some(dec!(0.0015)),
                ..OpenFill::default()
            },
        );
        let position = engine.get_position(symbol).unwrap();
        assert_eq!(position.total_quantity, dec!(0.0015));
        assert_eq!(position.segments[0].target_quantity, dec!(0.002));
        assert_eq!(position.segments[0].open_quantity, dec!(0.0015));
    }

    #[test]
    fn zero_filled_open_books_nothing() {
        let engine = engine();
        let symbol = "BTC-USDC-PERP";
        let s = spread(symbol, "lighter", "paradex", dec!(0.06));
        // An emergency-closed execution reports success_quantity 0; the
        // caller records nothing.
        engine.record_open(symbol, Decimal::ZERO, &s, None, OpenFill::default());
        assert!(engine.get_position(symbol).is_none());
    }

    #[test]
    fn total_matches_sum_of_open_segments() {
        let engine = engine();
        let symbol = "BTC-USDC-PERP";
        open(&engine, symbol, dec!(0.001), dec!(0.06));
        open(&engine, symbol, dec!(0.002), dec!(0.09));
        let closing = spread(symbol, "paradex", "lighter", dec!(-0.07));
        engine.record_close(symbol, dec!(0.0015), &closing, "test");

        let position = engine.get_position(symbol).unwrap();
        let sum: Decimal = position.open_segments().map(|s| s.open_quantity).sum();
        assert!((position.total_quantity - sum).abs() <= quantity_epsilon());
    }

    #[test]
    fn close_persistence_threshold_follows_position_size() {
        let engine = engine();
        let config = engine.config.get_config("LADDER-USDC-PERP");
        // One segment: T0 = 0.06 * 0.1.
        assert_eq!(close_persistence_threshold(dec!(0.001), &config), dec!(0.006));
        // Two segments: close at T1.
        assert_eq!(close_persistence_threshold(dec!(0.002), &config), dec!(0.06));
    }
}
