//! Pre-trade gates: price stability, per-leg book spread, touch
//! liquidity, market hours and the dual-limit no-fill backoff.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveTime, TimeZone, Utc};
use chrono_tz::Asia::Shanghai;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::config::SymbolConfig;
use crate::data::DataProcessor;
use crate::models::SpreadData;

/// Cool-off window after a dual-limit order pair expired without fills.
const DUAL_LIMIT_BACKOFF: Duration = Duration::from_secs(30);

/// Rolling touch samples per symbol; an open/close only fires when the
/// recent window moved less than the configured deviation.
#[derive(Default)]
pub struct PriceStabilityTracker {
    samples: Mutex<HashMap<String, VecDeque<(Instant, Decimal, Decimal)>>>,
}

impl PriceStabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, symbol: &str, spread: &SpreadData) {
        let mut samples = self.samples.lock();
        let window = samples.entry(symbol.to_uppercase()).or_default();
        window.push_back((Instant::now(), spread.price_buy, spread.price_sell));
        while window.len() > 600 {
            window.pop_front();
        }
    }

    pub fn reset(&self, symbol: &str) {
        self.samples.lock().remove(&symbol.to_uppercase());
    }

    /// True when both legs' touches stayed within the deviation budget
    /// over the configured window. Unconfigured symbols always pass; a
    /// window with fewer than two samples has nothing to compare.
    pub fn passes(&self, symbol: &str, config: &SymbolConfig) -> bool {
        let (Some(window_seconds), Some(threshold_pct)) = (
            config.grid_config.price_stability_window_seconds,
            config.grid_config.price_stability_threshold_pct,
        ) else {
            return true;
        };

        let mut samples = self.samples.lock();
        let Some(window) = samples.get_mut(&symbol.to_uppercase()) else {
            return true;
        };
        let horizon = Duration::from_secs_f64(window_seconds.max(0.0));
        while let Some((ts, _, _)) = window.front() {
            if ts.elapsed() > horizon {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() < 2 {
            return true;
        }

        for leg in 0..2 {
            let prices = window.iter().map(|(_, buy, sell)| match leg {
                0 => *buy,
                _ => *sell,
            });
            let mut min = Decimal::MAX;
            let mut max = Decimal::MIN;
            for price in prices {
                min = min.min(price);
                max = max.max(price);
            }
            if min <= Decimal::ZERO {
                return false;
            }
            let deviation_pct = (max - min) / min * Decimal::ONE_HUNDRED;
            if deviation_pct > threshold_pct {
                return false;
            }
        }
        true
    }
}

/// Per-symbol cool-off after a `dual_limit_no_fill` execution outcome.
#[derive(Default)]
pub struct DualLimitBackoff {
    until: Mutex<HashMap<String, Instant>>,
}

impl DualLimitBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, symbol: &str) {
        self.until
            .lock()
            .insert(symbol.to_uppercase(), Instant::now() + DUAL_LIMIT_BACKOFF);
    }

    pub fn clear(&self, symbol: &str) {
        self.until.lock().remove(&symbol.to_uppercase());
    }

    pub fn should_skip(&self, symbol: &str) -> bool {
        let mut until = self.until.lock();
        match until.get(&symbol.to_uppercase()) {
            Some(deadline) if Instant::now() < *deadline => true,
            Some(_) => {
                until.remove(&symbol.to_uppercase());
                false
            }
            None => false,
        }
    }
}

/// Weekend gating for instruments tracking international gold: closed
/// from Saturday 05:59 China time until Monday 07:00:05.
pub fn is_symbol_market_open(symbol: &str, base_symbol: Option<&str>) -> bool {
    let check_symbol = base_symbol.unwrap_or(symbol).to_uppercase();
    if !check_symbol.contains("XAU") {
        return true;
    }
    market_open_at(Shanghai.from_utc_datetime(&Utc::now().naive_utc()))
}

fn market_open_at(now: chrono::DateTime<chrono_tz::Tz>) -> bool {
    let weekday = now.weekday().num_days_from_monday(); // Mon=0 .. Sun=6
    let time = now.time();
    let sat_cutoff = NaiveTime::from_hms_opt(5, 59, 0).unwrap();
    let mon_cutoff = NaiveTime::from_hms_opt(7, 0, 5).unwrap();

    if weekday == 5 && time >= sat_cutoff {
        return false;
    }
    if weekday == 6 {
        return false;
    }
    if weekday == 0 && time < mon_cutoff {
        return false;
    }
    true
}

/// A leg's own bid-ask spread in percent; `None` when the fresh book is
/// unavailable or degenerate.
pub fn local_orderbook_spread_pct(
    processor: &Arc<DataProcessor>,
    venue: &str,
    symbol: &str,
    max_age_seconds: f64,
) -> Option<Decimal> {
    let book = processor.get_orderbook(venue, symbol, max_age_seconds)?;
    let ask = book.best_ask()?.price;
    let bid = book.best_bid()?.price;
    if ask <= Decimal::ZERO || bid <= Decimal::ZERO {
        return None;
    }
    let spread = ask - bid;
    if spread <= Decimal::ZERO {
        return Some(Decimal::ZERO);
    }
    Some(spread / ask * Decimal::ONE_HUNDRED)
}

#[derive(Debug, Clone)]
pub struct LiquidityLeg {
    pub venue: String,
    pub symbol: String,
    pub quantity: Decimal,
    pub is_buy: bool,
    pub description: &'static str,
}

/// The touch on each leg must carry at least
/// `max(min_orderbook_quantity, order quantity)`.
pub fn verify_orderbook_liquidity(
    processor: &Arc<DataProcessor>,
    legs: &[LiquidityLeg],
    min_orderbook_quantity: Option<Decimal>,
    max_age_seconds: f64,
) -> Result<(), String> {
    for leg in legs {
        let Some(book) = processor.get_orderbook(&leg.venue, &leg.symbol, max_age_seconds) else {
            return Err(format!("{} {}/{} 无盘口数据", leg.description, leg.venue, leg.symbol));
        };
        let touch = if leg.is_buy {
            book.best_ask()
        } else {
            book.best_bid()
        };
        let Some(touch) = touch else {
            return Err(format!("{} {}/{} 盘口单边", leg.description, leg.venue, leg.symbol));
        };
        let required = min_orderbook_quantity
            .unwrap_or(Decimal::ZERO)
            .max(leg.quantity);
        if touch.size < required {
            return Err(format!(
                "{} {}/{} 对手盘 {} < 需求 {required}",
                leg.description, leg.venue, leg.symbol, touch.size
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigManager;
    use crate::models::{OrderBookLevel, SpreadData};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn spread(buy: Decimal, sell: Decimal) -> SpreadData {
        SpreadData {
            symbol: "S".to_string(),
            exchange_buy: "a".to_string(),
            exchange_sell: "b".to_string(),
            price_buy: buy,
            price_sell: sell,
            size_buy: dec!(1),
            size_sell: dec!(1),
            spread_abs: sell - buy,
            spread_pct: Decimal::ZERO,
            buy_symbol: "S".to_string(),
            sell_symbol: "S".to_string(),
        }
    }

    fn config_with_stability() -> SymbolConfig {
        const RAW: &str = r#"
            [default_config.grid_config]
            initial_spread_threshold = 0.05
            grid_step = 0.03
            max_segments = 3
            t0_close_ratio = 0.4
            price_stability_window_seconds = 60.0
            price_stability_threshold_pct = 0.01

            [default_config.quantity_config]
            base_quantity = 0.001
            quantity_mode = "fixed"

            [default_config.risk_config]
            max_position_value = 500.0
            max_loss_percent = 2.0
        "#;
        ConfigManager::from_toml_str(RAW).unwrap().get_config("S")
    }

    #[test]
    fn stability_blocks_when_touch_moves_too_much() {
        let tracker = PriceStabilityTracker::new();
        let config = config_with_stability();

        tracker.record("S", &spread(dec!(100.00), dec!(100.05)));
        tracker.record("S", &spread(dec!(100.005), dec!(100.055)));
        assert!(tracker.passes("S", &config));

        // 0.1% jump against a 0.01% budget.
        tracker.record("S", &spread(dec!(100.10), dec!(100.15)));
        assert!(!tracker.passes("S", &config));

        tracker.reset("S");
        assert!(tracker.passes("S", &config));
    }

    #[test]
    fn dual_limit_backoff_expires() {
        let backoff = DualLimitBackoff::new();
        assert!(!backoff.should_skip("S"));
        backoff.schedule("S");
        assert!(backoff.should_skip("S"));
        backoff.clear("S");
        assert!(!backoff.should_skip("S"));
    }

    #[test]
    fn gold_weekend_gating_in_china_time() {
        let at = |y: i32, m: u32, d: u32, h: u32, min: u32, s: u32| {
            Shanghai
                .from_local_datetime(
                    &NaiveDate::from_ymd_opt(y, m, d)
                        .unwrap()
                        .and_hms_opt(h, min, s)
                        .unwrap(),
                )
                .unwrap()
        };
        // Friday afternoon: open.
        assert!(market_open_at(at(2025, 7, 25, 15, 0, 0)));
        // Saturday 05:58: still open; 06:10 closed.
        assert!(market_open_at(at(2025, 7, 26, 5, 58, 0)));
        assert!(!market_open_at(at(2025, 7, 26, 6, 10, 0)));
        // Sunday: closed all day.
        assert!(!market_open_at(at(2025, 7, 27, 12, 0, 0)));
        // Monday 06:59 closed, 07:01 open.
        assert!(!market_open_at(at(2025, 7, 28, 6, 59, 0)));
        assert!(market_open_at(at(2025, 7, 28, 7, 1, 0)));
    }

    #[test]
    fn non_gold_symbols_ignore_market_hours() {
        assert!(is_symbol_market_open("BTC-USDC-PERP", None));
        // The base symbol decides, not the pair id.
        assert!(is_symbol_market_open("LIGHTER_EDGEX_GOLD", Some("BTC-USDC-PERP")));
    }

    #[test]
    fn liquidity_gate_requires_touch_size() {
        use crate::data::{BoundedQueue, OrderBookEnvelope};
        let queue = BoundedQueue::new(16);
        let processor = DataProcessor::new(queue.clone(), BoundedQueue::new(16));
        let now = Utc::now();
        queue.push(OrderBookEnvelope {
            venue: "lighter".to_string(),
            symbol: "S".to_string(),
            book: crate::models::OrderBookSnapshot {
                symbol: "S".to_string(),
                venue: "lighter".to_string(),
                bids: vec![OrderBookLevel::new(dec!(99.9), dec!(0.5))],
                asks: vec![OrderBookLevel::new(dec!(100.0), dec!(2.0))],
                exchange_timestamp: Some(now),
                received_timestamp: None,
                processed_timestamp: None,
            },
            exchange_timestamp: Some(now),
            received_at: now,
        });
        processor.drain_orderbooks();

        let buy_leg = LiquidityLeg {
            venue: "lighter".to_string(),
            symbol: "S".to_string(),
            quantity: dec!(1.0),
            is_buy: true,
            description: "开仓买入腿",
        };
        assert!(verify_orderbook_liquidity(&processor, &[buy_leg.clone()], None, 3.0).is_ok());

        let sell_leg = LiquidityLeg {
            is_buy: false,
            description: "开仓卖出腿",
            ..buy_leg
        };
        // Bid has only 0.5 against a 1.0 requirement.
        assert!(verify_orderbook_liquidity(&processor, &[sell_leg], None, 3.0).is_err());
    }
}
