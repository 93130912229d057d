//! Core market-data and position entities shared across the engine.
//!
//! Every price, size and threshold is a `rust_decimal::Decimal`; binary
//! floats never enter accounting paths. A single epsilon constant is used
//! for all "near zero" quantity comparisons.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Shared epsilon for quantity/price accounting comparisons (1e-8).
pub fn quantity_epsilon() -> Decimal {
    Decimal::new(1, 8)
}

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl OrderBookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Venue order book snapshot with the full timestamp chain
/// (exchange → received → processed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    /// Neutral symbol (`BASE-QUOTE-KIND`).
    pub symbol: String,
    pub venue: String,
    /// Descending by price.
    pub bids: Vec<OrderBookLevel>,
    /// Ascending by price.
    pub asks: Vec<OrderBookLevel>,
    pub exchange_timestamp: Option<DateTime<Utc>>,
    pub received_timestamp: Option<DateTime<Utc>>,
    pub processed_timestamp: Option<DateTime<Utc>>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<&OrderBookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&OrderBookLevel> {
        self.asks.first()
    }

    /// Both sides present with positive prices.
    pub fn has_both_sides(&self) -> bool {
        matches!(
            (self.best_bid(), self.best_ask()),
            (Some(b), Some(a)) if b.price > Decimal::ZERO && a.price > Decimal::ZERO
        )
    }
}

/// Ticker snapshot; `funding_rate` is per funding interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: String,
    pub venue: String,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
    pub funding_rate: Option<Decimal>,
    pub next_funding_time: Option<DateTime<Utc>>,
    pub received_timestamp: Option<DateTime<Utc>>,
}

/// Directional spread: buy at `exchange_buy`'s ask, sell at
/// `exchange_sell`'s bid. Positive `spread_pct` means the direction is
/// profitable before fees. Ephemeral, recomputed every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadData {
    /// Neutral symbol, or the pair_id for multi-leg spreads.
    pub symbol: String,
    pub exchange_buy: String,
    pub exchange_sell: String,
    /// Ask on the buy leg.
    pub price_buy: Decimal,
    /// Bid on the sell leg.
    pub price_sell: Decimal,
    pub size_buy: Decimal,
    pub size_sell: Decimal,
    pub spread_abs: Decimal,
    /// `(price_sell - price_buy) / price_buy * 100`.
    pub spread_pct: Decimal,
    pub buy_symbol: String,
    pub sell_symbol: String,
}

impl SpreadData {
    pub fn from_legs(
        symbol: &str,
        exchange_buy: &str,
        buy_symbol: &str,
        buy_ask: &OrderBookLevel,
        exchange_sell: &str,
        sell_symbol: &str,
        sell_bid: &OrderBookLevel,
    ) -> Self {
        let spread_abs = sell_bid.price - buy_ask.price;
        let spread_pct = if buy_ask.price > Decimal::ZERO {
            spread_abs / buy_ask.price * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        Self {
            symbol: symbol.to_string(),
            exchange_buy: exchange_buy.to_string(),
            exchange_sell: exchange_sell.to_string(),
            price_buy: buy_ask.price,
            price_sell: sell_bid.price,
            size_buy: buy_ask.size,
            size_sell: sell_bid.size,
            spread_abs,
            spread_pct,
            buy_symbol: buy_symbol.to_string(),
            sell_symbol: sell_symbol.to_string(),
        }
    }
}

/// Funding context for a directional spread. Annualized difference
/// assumes 3 funding intervals per day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRateData {
    pub exchange_buy: String,
    pub exchange_sell: String,
    pub funding_rate_buy: Decimal,
    pub funding_rate_sell: Decimal,
    pub funding_rate_diff: Decimal,
    pub funding_rate_diff_annual: Decimal,
    pub is_favorable_for_position: bool,
}

impl FundingRateData {
    pub fn from_rates(
        exchange_buy: &str,
        exchange_sell: &str,
        funding_buy: Decimal,
        funding_sell: Decimal,
    ) -> Self {
        let diff = (funding_sell - funding_buy).abs();
        Self {
            exchange_buy: exchange_buy.to_string(),
            exchange_sell: exchange_sell.to_string(),
            funding_rate_buy: funding_buy,
            funding_rate_sell: funding_sell,
            funding_rate_diff: diff,
            funding_rate_diff_annual: diff * Decimal::from(365 * 3),
            is_favorable_for_position: funding_sell > funding_buy,
        }
    }
}

/// Stable key for one opening direction between two venues:
/// `{SYMBOL}:{buy_venue}->{sell_venue}:{BUY_SYMBOL}->{SELL_SYMBOL}`.
pub fn build_pair_key(
    symbol: &str,
    exchange_buy: &str,
    exchange_sell: &str,
    buy_symbol: &str,
    sell_symbol: &str,
) -> String {
    format!(
        "{}:{}->{}:{}->{}",
        symbol.to_uppercase(),
        exchange_buy.to_lowercase(),
        exchange_sell.to_lowercase(),
        buy_symbol.to_uppercase(),
        sell_symbol.to_uppercase(),
    )
}

/// One recorded increment of a pair position, created per fill batch.
/// Segments serve FIFO accounting; the decision algorithm itself is
/// total-driven and never picks individual segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSegment {
    pub segment_id: u64,
    pub target_quantity: Decimal,
    /// Remaining open quantity; `is_closed` once it reaches zero.
    pub open_quantity: Decimal,
    pub open_spread_pct: Decimal,
    pub open_time: DateTime<Utc>,
    pub open_price_buy: Decimal,
    pub open_price_sell: Decimal,
    pub open_funding_rate_buy: Decimal,
    pub open_funding_rate_sell: Decimal,
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
    pub is_closed: bool,
    pub close_time: Option<DateTime<Utc>>,
    pub close_spread_pct: Option<Decimal>,
    pub close_price_buy: Option<Decimal>,
    pub close_price_sell: Option<Decimal>,
}

/// Aggregated pair position with ordered segments. The buy/sell venues do
/// not change while the position is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentedPosition {
    pub symbol: String,
    pub exchange_buy: String,
    pub exchange_sell: String,
    pub buy_symbol: String,
    pub sell_symbol: String,
    pub segments: Vec<PositionSegment>,
    pub total_quantity: Decimal,
    pub avg_open_spread_pct: Decimal,
    pub create_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub is_open: bool,
    pub pair_key: Option<String>,
}

impl SegmentedPosition {
    pub fn new(
        symbol: &str,
        exchange_buy: &str,
        exchange_sell: &str,
        buy_symbol: &str,
        sell_symbol: &str,
        initial_spread_pct: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            symbol: symbol.to_string(),
            exchange_buy: exchange_buy.to_string(),
            exchange_sell: exchange_sell.to_string(),
            buy_symbol: buy_symbol.to_string(),
            sell_symbol: sell_symbol.to_string(),
            segments: Vec::new(),
            total_quantity: Decimal::ZERO,
            avg_open_spread_pct: initial_spread_pct,
            create_time: now,
            last_update_time: now,
            is_open: true,
            pair_key: None,
        }
    }

    pub fn next_segment_id(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.segment_id)
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn open_segments(&self) -> impl Iterator<Item = &PositionSegment> {
        self.segments
            .iter()
            .filter(|s| !s.is_closed && s.open_quantity > quantity_epsilon())
    }

    /// Size-weighted average open spread over still-open segments.
    pub fn calculate_avg_spread(&self) -> Decimal {
        let mut total = Decimal::ZERO;
        let mut weighted = Decimal::ZERO;
        for segment in self.open_segments() {
            total += segment.open_quantity;
            weighted += segment.open_spread_pct * segment.open_quantity;
        }
        if total > quantity_epsilon() {
            weighted / total
        } else {
            self.avg_open_spread_pct
        }
    }

    /// Size-weighted average open prices (buy leg, sell leg) over open
    /// segments; `None` while no segment remains open.
    pub fn weighted_open_prices(&self) -> Option<(Decimal, Decimal)> {
        let mut total = Decimal::ZERO;
        let mut buy = Decimal::ZERO;
        let mut sell = Decimal::ZERO;
        for segment in self.open_segments() {
            total += segment.open_quantity;
            buy += segment.open_price_buy * segment.open_quantity;
            sell += segment.open_price_sell * segment.open_quantity;
        }
        if total > quantity_epsilon() {
            Some((buy / total, sell / total))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Exchange order as reported by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderData {
    pub order_id: String,
    pub client_id: Option<String>,
    pub symbol: String,
    pub venue: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub filled: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceData {
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

/// Net venue position as reported through REST/WS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionData {
    pub symbol: String,
    /// Absolute size; direction carried by `side`.
    pub size: Decimal,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PositionData {
    /// Signed size: long positive, short negative.
    pub fn signed_size(&self) -> Decimal {
        match self.side {
            PositionSide::Long => self.size.abs(),
            PositionSide::Short => -self.size.abs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn seg(id: u64, qty: Decimal, spread: Decimal, buy: Decimal, sell: Decimal) -> PositionSegment {
        PositionSegment {
            segment_id: id,
            target_quantity: qty,
            open_quantity: qty,
            open_spread_pct: spread,
            open_time: Utc::now(),
            open_price_buy: buy,
            open_price_sell: sell,
            open_funding_rate_buy: Decimal::ZERO,
            open_funding_rate_sell: Decimal::ZERO,
            buy_order_id: None,
            sell_order_id: None,
            is_closed: false,
            close_time: None,
            close_spread_pct: None,
            close_price_buy: None,
            close_price_sell: None,
        }
    }

    #[test]
    fn pair_key_is_case_normalized() {
        let key = build_pair_key("btc-usdc-perp", "Lighter", "PARADEX", "btc", "BTC-usd-perp");
        assert_eq!(key, "BTC-USDC-PERP:lighter->paradex:BTC->BTC-USD-PERP");
    }

    #[test]
    fn spread_from_legs_matches_sign_convention() {
        let ask = OrderBookLevel::new(dec!(100), dec!(1));
        let bid = OrderBookLevel::new(dec!(100.06), dec!(2));
        let spread = SpreadData::from_legs("BTC-USDC-PERP", "a", "BTC", &ask, "b", "BTC", &bid);
        assert_eq!(spread.spread_abs, dec!(0.06));
        assert_eq!(spread.spread_pct, dec!(0.06));
        assert!(spread.spread_pct > Decimal::ZERO);
    }

    #[test]
    fn avg_spread_is_size_weighted() {
        let mut position = SegmentedPosition::new("S", "a", "b", "S", "S", dec!(0.05));
        position
            .segments
            .push(seg(1, dec!(0.001), dec!(0.05), dec!(100), dec!(100.05)));
        position
            .segments
            .push(seg(2, dec!(0.003), dec!(0.09), dec!(100), dec!(100.09)));
        position.total_quantity = dec!(0.004);
        assert_eq!(position.calculate_avg_spread(), dec!(0.08));
    }

    #[test]
    fn closed_segments_excluded_from_weighting() {
        let mut position = SegmentedPosition::new("S", "a", "b", "S", "S", dec!(0.05));
        let mut first = seg(1, dec!(0.001), dec!(0.05), dec!(100), dec!(100.05));
        first.is_closed = true;
        first.open_quantity = Decimal::ZERO;
        position.segments.push(first);
        position
            .segments
            .push(seg(2, dec!(0.002), dec!(0.09), dec!(100), dec!(100.09)));
        position.total_quantity = dec!(0.002);
        assert_eq!(position.calculate_avg_spread(), dec!(0.09));
        assert_eq!(position.next_segment_id(), 3);
    }

    #[test]
    fn funding_data_annualizes_diff() {
        let funding = FundingRateData::from_rates("a", "b", dec!(0.0001), dec!(0.0003));
        assert_eq!(funding.funding_rate_diff, dec!(0.0002));
        assert_eq!(funding.funding_rate_diff_annual, dec!(0.2190));
        assert!(funding.is_favorable_for_position);
    }
}
