//! Per-pair spread pipeline: fresh books in, directional signals out.
//!
//! With an open position the opening and closing views are rebuilt
//! strictly from the memorized direction, so a later tick can never
//! cross-route into an incompatible venue pair. Without a position the
//! best positive direction wins and the closing view is derived from it.
//!
//! The pipeline returns typed signals; all gating and execution stays
//! with the orchestrator, which also consumes the missing-orderbook
//! diagnostics for stream self-healing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::info;

use crate::config::{MultiLegPairSpec, TradingPairSpec};
use crate::data::DataProcessor;
use crate::logging::{LogLevel, ThrottledLogger};
use crate::models::{FundingRateData, SegmentedPosition, SpreadData};

use super::SpreadCalculator;

const MISSING_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Signals for one pair tick: the opening direction to evaluate and the
/// matching closing view.
#[derive(Debug, Clone)]
pub struct PairSignals {
    pub opening: SpreadData,
    pub closing: SpreadData,
    pub has_position: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegState {
    HasOrderbook,
    NoMessages,
    Stale,
    Unknown,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MissingLegDiagnostics {
    pub symbol_key: String,
    pub base_symbol: String,
    pub exchange_a: String,
    pub exchange_b: String,
    pub missing_legs: Vec<String>,
    pub missing_duration_seconds: f64,
    pub state_a: LegState,
    pub state_b: LegState,
    pub age_a_seconds: Option<f64>,
    pub age_b_seconds: Option<f64>,
}

struct MissingContext {
    base_symbol: String,
    exchange_a: String,
    exchange_b: String,
}

pub struct SpreadPipeline {
    processor: Arc<DataProcessor>,
    calculator: SpreadCalculator,
    data_freshness_seconds: f64,
    throttle: ThrottledLogger,
    missing_since: Mutex<HashMap<String, Instant>>,
    missing_context: Mutex<HashMap<String, MissingContext>>,
}

impl SpreadPipeline {
    pub fn new(processor: Arc<DataProcessor>, data_freshness_seconds: f64) -> Self {
        Self {
            processor,
            calculator: SpreadCalculator::new(),
            data_freshness_seconds,
            throttle: ThrottledLogger::new(),
            missing_since: Mutex::new(HashMap::new()),
            missing_context: Mutex::new(HashMap::new()),
        }
    }

    pub fn calculator(&self) -> &SpreadCalculator {
        &self.calculator
    }

    /// One tick of a two-venue pair. `position` is the decision engine's
    /// current pair position (if any); it pins the direction.
    pub fn process_trading_pair(
        &self,
        pair: &TradingPairSpec,
        position: Option<&SegmentedPosition>,
    ) -> Option<PairSignals> {
        let symbol_key = pair.trading_pair_id.to_uppercase();
        let base_symbol = pair.normalized_symbol();
        let exchange_a = pair.normalized_exchange_a();
        let exchange_b = pair.normalized_exchange_b();

        let book_a =
            self.processor
                .get_orderbook(&exchange_a, &base_symbol, self.data_freshness_seconds);
        let book_b =
            self.processor
                .get_orderbook(&exchange_b, &base_symbol, self.data_freshness_seconds);
        if book_a.is_none() || book_b.is_none() {
            self.note_missing_pair(
                &symbol_key,
                &base_symbol,
                &exchange_a,
                &exchange_b,
                book_a.is_none(),
                book_b.is_none(),
            );
            return None;
        }
        self.clear_missing_pair(&symbol_key);

        let mut books = HashMap::new();
        books.insert(exchange_a.clone(), book_a.unwrap());
        books.insert(exchange_b.clone(), book_b.unwrap());

        let has_position = position
            .map(|p| p.total_quantity > crate::models::quantity_epsilon())
            .unwrap_or(false);

        if has_position {
            let (opening, closing) = self.spreads_from_position(&symbol_key, position.unwrap())?;
            return Some(PairSignals {
                opening,
                closing,
                has_position: true,
            });
        }

        let spreads = self
            .calculator
            .spreads_multi_exchange_directions(&base_symbol, &books);
        if spreads.is_empty() {
            return None;
        }

        let filtered: Vec<SpreadData> = if pair.allow_reverse {
            spreads
        } else {
            spreads
                .into_iter()
                .filter(|s| {
                    s.exchange_buy.eq_ignore_ascii_case(&exchange_a)
                        && s.exchange_sell.eq_ignore_ascii_case(&exchange_b)
                })
                .collect()
        };
        if filtered.is_empty() {
            return None;
        }

        let opening = pick_opening(filtered)?;
        // Pair signals carry the pair_id so positions key off the pair.
        let mut opening = opening;
        opening.symbol = symbol_key.clone();

        if let Some(min_spread) = pair.min_spread_pct {
            if opening.spread_pct < min_spread {
                return None;
            }
        }

        let closing = match self.calculator.closing_spread_from_orderbooks(&opening, &books) {
            Some(mut closing) => {
                closing.symbol = symbol_key.clone();
                closing
            }
            None => {
                self.throttle.log(
                    &format!("{symbol_key}:no_closing_view"),
                    &format!("⚠️ [价差] {symbol_key}: 无法生成平仓视角价差（缺少真实盘口），跳过本轮"),
                    LogLevel::Warn,
                    Duration::from_secs(60),
                );
                return None;
            }
        };

        Some(PairSignals {
            opening,
            closing,
            has_position: false,
        })
    }

    /// One tick of a multi-leg basket.
    pub fn process_multi_leg_pair(
        &self,
        pair: &MultiLegPairSpec,
        position: Option<&SegmentedPosition>,
    ) -> Option<PairSignals> {
        let pair_id = pair.pair_id.to_uppercase();
        let has_position = position
            .map(|p| p.total_quantity > crate::models::quantity_epsilon())
            .unwrap_or(false);

        if has_position {
            let (opening, closing) = self.spreads_from_position(&pair_id, position.unwrap())?;
            return Some(PairSignals {
                opening,
                closing,
                has_position: true,
            });
        }

        let mut books = HashMap::new();
        for leg in [&pair.leg_primary, &pair.leg_secondary] {
            let venue = leg.normalized_exchange();
            let symbol = leg.normalized_symbol();
            if let Some(book) =
                self.processor
                    .get_orderbook(&venue, &symbol, self.data_freshness_seconds)
            {
                books.insert((venue, symbol), book);
            }
        }

        let spreads = self.calculator.multi_leg_spread(
            &pair_id,
            &pair.leg_primary.normalized_exchange(),
            &pair.leg_primary.normalized_symbol(),
            &pair.leg_secondary.normalized_exchange(),
            &pair.leg_secondary.normalized_symbol(),
            &books,
            pair.allow_reverse,
        );
        let opening = pick_opening(spreads)?;

        if let Some(min_spread) = pair.min_spread_pct {
            if opening.spread_pct < min_spread {
                return None;
            }
        }

        let closing = self.calculator.multi_leg_closing_spread(&opening, &books)?;
        Some(PairSignals {
            opening,
            closing,
            has_position: false,
        })
    }

    /// Rebuild the opening and closing views from a memorized position.
    /// `None` when either memorized leg lacks a fresh two-sided book.
    pub fn spreads_from_position(
        &self,
        symbol_key: &str,
        position: &SegmentedPosition,
    ) -> Option<(SpreadData, SpreadData)> {
        if position.exchange_buy.is_empty() || position.exchange_sell.is_empty() {
            self.throttle.log(
                &format!("{symbol_key}:memory_missing_venues"),
                &format!("⚠️ [价差] {symbol_key}: 持仓缺少记忆的交易所信息"),
                LogLevel::Warn,
                Duration::from_secs(60),
            );
            return None;
        }
        let buy_symbol = position.buy_symbol.to_uppercase();
        let sell_symbol = position.sell_symbol.to_uppercase();

        let buy_leg = self.processor.get_orderbook(
            &position.exchange_buy,
            &buy_symbol,
            self.data_freshness_seconds,
        );
        let sell_leg = self.processor.get_orderbook(
            &position.exchange_sell,
            &sell_symbol,
            self.data_freshness_seconds,
        );
        let (Some(buy_leg), Some(sell_leg)) = (buy_leg, sell_leg) else {
            self.throttle.log(
                &format!("{symbol_key}:memory_orderbook_missing"),
                &format!(
                    "⚠️ [价差] {symbol_key}: 记忆方向缺少实时盘口（{}/{}）",
                    position.exchange_buy, position.exchange_sell
                ),
                LogLevel::Warn,
                Duration::from_secs(60),
            );
            return None;
        };

        let (Some(buy_ask), Some(buy_bid), Some(sell_ask), Some(sell_bid)) = (
            buy_leg.best_ask(),
            buy_leg.best_bid(),
            sell_leg.best_ask(),
            sell_leg.best_bid(),
        ) else {
            self.throttle.log(
                &format!("{symbol_key}:memory_orderbook_incomplete"),
                &format!("⚠️ [价差] {symbol_key}: 记忆方向盘口不完整，暂不执行"),
                LogLevel::Warn,
                Duration::from_secs(60),
            );
            return None;
        };

        let opening = SpreadData::from_legs(
            symbol_key,
            &position.exchange_buy,
            &buy_symbol,
            buy_ask,
            &position.exchange_sell,
            &sell_symbol,
            sell_bid,
        );
        // The close trades the other way: buy back where we sold, sell
        // where we bought, priced at the current opposing touches.
        let closing = SpreadData::from_legs(
            symbol_key,
            &position.exchange_sell,
            &sell_symbol,
            sell_ask,
            &position.exchange_buy,
            &buy_symbol,
            buy_bid,
        );
        Some((opening, closing))
    }

    pub fn funding_for(
        &self,
        symbol: &str,
        exchange_buy: &str,
        exchange_sell: &str,
    ) -> Option<FundingRateData> {
        let rates = self.processor.latest_funding_rates();
        let by_venue = rates.get(&symbol.to_uppercase())?;
        let funding_buy = by_venue.get(exchange_buy).copied().unwrap_or(Decimal::ZERO);
        let funding_sell = by_venue
            .get(exchange_sell)
            .copied()
            .unwrap_or(Decimal::ZERO);
        Some(FundingRateData::from_rates(
            exchange_buy,
            exchange_sell,
            funding_buy,
            funding_sell,
        ))
    }

    fn note_missing_pair(
        &self,
        symbol_key: &str,
        base_symbol: &str,
        exchange_a: &str,
        exchange_b: &str,
        missing_a: bool,
        missing_b: bool,
    ) {
        self.missing_context.lock().insert(
            symbol_key.to_string(),
            MissingContext {
                base_symbol: base_symbol.to_string(),
                exchange_a: exchange_a.to_string(),
                exchange_b: exchange_b.to_string(),
            },
        );
        let since = {
            let mut missing = self.missing_since.lock();
            *missing
                .entry(symbol_key.to_string())
                .or_insert_with(Instant::now)
        };

        let mut missing_legs = Vec::new();
        if missing_a {
            missing_legs.push(exchange_a.to_string());
        }
        if missing_b {
            missing_legs.push(exchange_b.to_string());
        }
        self.throttle.log(
            &format!("{symbol_key}:missing_orderbook"),
            &format!(
                "⚠️ [价差] {symbol_key}: 盘口数据缺失，缺失腿={}，连续缺失={:.1}s，freshness={:.1}s，跳过本轮",
                missing_legs.join(","),
                since.elapsed().as_secs_f64(),
                self.data_freshness_seconds,
            ),
            LogLevel::Warn,
            MISSING_LOG_INTERVAL,
        );
    }

    fn clear_missing_pair(&self, symbol_key: &str) {
        let since = self.missing_since.lock().remove(symbol_key);
        self.missing_context.lock().remove(symbol_key);
        if let Some(since) = since {
            info!(
                "✅ [价差] {symbol_key}: 盘口数据恢复，连续缺失结束 (持续 {:.1}s)",
                since.elapsed().as_secs_f64()
            );
            self.throttle.clear_prefix(&format!("{symbol_key}:"));
        }
    }

    /// Missing-orderbook diagnostics, keyed by trading_pair_id. Feeds the
    /// orchestrator's stream self-heal; never changes trading logic.
    pub fn missing_orderbook_diagnostics(&self) -> HashMap<String, MissingLegDiagnostics> {
        let now = Utc::now();
        let mut diagnostics = HashMap::new();
        let missing = self.missing_since.lock();
        let contexts = self.missing_context.lock();

        for (symbol_key, since) in missing.iter() {
            let Some(context) = contexts.get(symbol_key) else {
                continue;
            };
            let (state_a, age_a) = self.leg_state(&context.exchange_a, &context.base_symbol, now);
            let (state_b, age_b) = self.leg_state(&context.exchange_b, &context.base_symbol, now);

            let mut missing_legs = Vec::new();
            if state_a != LegState::HasOrderbook {
                missing_legs.push(context.exchange_a.clone());
            }
            if state_b != LegState::HasOrderbook {
                missing_legs.push(context.exchange_b.clone());
            }

            diagnostics.insert(
                symbol_key.clone(),
                MissingLegDiagnostics {
                    symbol_key: symbol_key.clone(),
                    base_symbol: context.base_symbol.clone(),
                    exchange_a: context.exchange_a.clone(),
                    exchange_b: context.exchange_b.clone(),
                    missing_legs,
                    missing_duration_seconds: since.elapsed().as_secs_f64(),
                    state_a,
                    state_b,
                    age_a_seconds: age_a,
                    age_b_seconds: age_b,
                },
            );
        }
        diagnostics
    }

    fn leg_state(
        &self,
        venue: &str,
        symbol: &str,
        now: chrono::DateTime<Utc>,
    ) -> (LegState, Option<f64>) {
        let has_book = self
            .processor
            .get_orderbook(venue, symbol, self.data_freshness_seconds)
            .is_some();
        let last_received = self
            .processor
            .get_last_orderbook_received_timestamp(venue, symbol);
        let age = last_received.map(|ts| (now - ts).num_milliseconds() as f64 / 1000.0);
        let state = if has_book {
            LegState::HasOrderbook
        } else {
            match age {
                None => LegState::NoMessages,
                Some(age) if age > self.data_freshness_seconds => LegState::Stale,
                Some(_) => LegState::Unknown,
            }
        };
        (state, age)
    }
}

fn pick_opening(spreads: Vec<SpreadData>) -> Option<SpreadData> {
    if spreads.is_empty() {
        return None;
    }
    let positive = spreads
        .iter()
        .filter(|s| s.spread_pct > Decimal::ZERO)
        .max_by(|a, b| a.spread_pct.cmp(&b.spread_pct))
        .cloned();
    positive.or_else(|| {
        spreads
            .into_iter()
            .max_by(|a, b| a.spread_pct.cmp(&b.spread_pct))
    })
}
