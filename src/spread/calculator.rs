//! Directional spread math over venue order books.
//!
//! Sign convention: `spread_pct > 0` means "buy at exchange_buy's ask,
//! sell at exchange_sell's bid" is profitable before fees. All directions
//! are returned, including negative ones, so callers can pick the max and
//! the reverse-open detector still sees contradicting signals.

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{OrderBookSnapshot, SpreadData};

#[derive(Debug, Default, Clone)]
pub struct SpreadCalculator;

impl SpreadCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Enumerate every ordered (buy venue, sell venue) pair for one
    /// symbol. Venues with a one-sided book are skipped.
    pub fn spreads_multi_exchange_directions(
        &self,
        symbol: &str,
        books: &HashMap<String, Arc<OrderBookSnapshot>>,
    ) -> Vec<SpreadData> {
        let mut spreads = Vec::new();
        for (buy_venue, buy_book) in books {
            let Some(buy_ask) = buy_book.best_ask() else {
                continue;
            };
            for (sell_venue, sell_book) in books {
                if buy_venue == sell_venue {
                    continue;
                }
                let Some(sell_bid) = sell_book.best_bid() else {
                    continue;
                };
                spreads.push(SpreadData::from_legs(
                    symbol, buy_venue, symbol, buy_ask, sell_venue, symbol, sell_bid,
                ));
            }
        }
        spreads
    }

    /// Closing view of `opening`: buy back at the prior sell venue's ask,
    /// sell out at the prior buy venue's bid. `None` when either leg's
    /// book is absent or one-sided.
    pub fn closing_spread_from_orderbooks(
        &self,
        opening: &SpreadData,
        books: &HashMap<String, Arc<OrderBookSnapshot>>,
    ) -> Option<SpreadData> {
        let buy_back_book = books.get(&opening.exchange_sell)?;
        let sell_out_book = books.get(&opening.exchange_buy)?;
        let buy_back_ask = buy_back_book.best_ask()?;
        let sell_out_bid = sell_out_book.best_bid()?;
        Some(SpreadData::from_legs(
            &opening.symbol,
            &opening.exchange_sell,
            &opening.sell_symbol,
            buy_back_ask,
            &opening.exchange_buy,
            &opening.buy_symbol,
            sell_out_bid,
        ))
    }

    /// Cross-pair (two leg symbols) spread. The returned SpreadData carry
    /// the pair_id as their symbol; legs keep their own venue symbols.
    #[allow(clippy::too_many_arguments)]
    pub fn multi_leg_spread(
        &self,
        pair_id: &str,
        leg_primary_exchange: &str,
        leg_primary_symbol: &str,
        leg_secondary_exchange: &str,
        leg_secondary_symbol: &str,
        books: &HashMap<(String, String), Arc<OrderBookSnapshot>>,
        allow_reverse: bool,
    ) -> Vec<SpreadData> {
        let primary_key = (
            leg_primary_exchange.to_string(),
            leg_primary_symbol.to_string(),
        );
        let secondary_key = (
            leg_secondary_exchange.to_string(),
            leg_secondary_symbol.to_string(),
        );
        let (Some(primary), Some(secondary)) = (books.get(&primary_key), books.get(&secondary_key))
        else {
            return Vec::new();
        };

        let mut spreads = Vec::new();
        if let (Some(ask), Some(bid)) = (primary.best_ask(), secondary.best_bid()) {
            spreads.push(SpreadData::from_legs(
                pair_id,
                leg_primary_exchange,
                leg_primary_symbol,
                ask,
                leg_secondary_exchange,
                leg_secondary_symbol,
                bid,
            ));
        }
        if allow_reverse {
            if let (Some(ask), Some(bid)) = (secondary.best_ask(), primary.best_bid()) {
                spreads.push(SpreadData::from_legs(
                    pair_id,
                    leg_secondary_exchange,
                    leg_secondary_symbol,
                    ask,
                    leg_primary_exchange,
                    leg_primary_symbol,
                    bid,
                ));
            }
        }
        spreads
    }

    /// Closing construction for a multi-leg opening direction.
    pub fn multi_leg_closing_spread(
        &self,
        opening: &SpreadData,
        books: &HashMap<(String, String), Arc<OrderBookSnapshot>>,
    ) -> Option<SpreadData> {
        let buy_back_key = (opening.exchange_sell.clone(), opening.sell_symbol.clone());
        let sell_out_key = (opening.exchange_buy.clone(), opening.buy_symbol.clone());
        let buy_back_ask = books.get(&buy_back_key)?.best_ask()?.to_owned();
        let sell_out_bid = books.get(&sell_out_key)?.best_bid()?.to_owned();
        Some(SpreadData::from_legs(
            &opening.symbol,
            &opening.exchange_sell,
            &opening.sell_symbol,
            &buy_back_ask,
            &opening.exchange_buy,
            &opening.buy_symbol,
            &sell_out_bid,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderBookLevel;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn book(venue: &str, bid: Decimal, ask: Decimal) -> Arc<OrderBookSnapshot> {
        Arc::new(OrderBookSnapshot {
            symbol: "BTC-USDC-PERP".to_string(),
            venue: venue.to_string(),
            bids: vec![OrderBookLevel::new(bid, dec!(1))],
            asks: vec![OrderBookLevel::new(ask, dec!(1))],
            exchange_timestamp: Some(Utc::now()),
            received_timestamp: Some(Utc::now()),
            processed_timestamp: None,
        })
    }

    fn two_venue_books() -> HashMap<String, Arc<OrderBookSnapshot>> {
        let mut books = HashMap::new();
        books.insert("lighter".to_string(), book("lighter", dec!(99.98), dec!(100.00)));
        books.insert("paradex".to_string(), book("paradex", dec!(100.08), dec!(100.10)));
        books
    }

    #[test]
    fn enumerates_both_directions() {
        let calculator = SpreadCalculator::new();
        let spreads =
            calculator.spreads_multi_exchange_directions("BTC-USDC-PERP", &two_venue_books());
        assert_eq!(spreads.len(), 2);

        let forward = spreads
            .iter()
            .find(|s| s.exchange_buy == "lighter")
            .unwrap();
        // Buy lighter@100.00 ask, sell paradex@100.08 bid.
        assert_eq!(forward.spread_abs, dec!(0.08));
        assert_eq!(forward.spread_pct, dec!(0.08));

        let reverse = spreads
            .iter()
            .find(|s| s.exchange_buy == "paradex")
            .unwrap();
        assert!(reverse.spread_pct < Decimal::ZERO);
    }

    #[test]
    fn closing_spread_inverts_the_legs() {
        let calculator = SpreadCalculator::new();
        let books = two_venue_books();
        let spreads = calculator.spreads_multi_exchange_directions("BTC-USDC-PERP", &books);
        let opening = spreads
            .iter()
            .max_by(|a, b| a.spread_pct.cmp(&b.spread_pct))
            .unwrap();

        let closing = calculator
            .closing_spread_from_orderbooks(opening, &books)
            .unwrap();
        assert_eq!(closing.exchange_buy, opening.exchange_sell);
        assert_eq!(closing.exchange_sell, opening.exchange_buy);
        // Buy back at paradex ask (100.10), sell out at lighter bid (99.98).
        assert_eq!(closing.price_buy, dec!(100.10));
        assert_eq!(closing.price_sell, dec!(99.98));
        assert!(closing.spread_pct < Decimal::ZERO);
    }

    #[test]
    fn closing_spread_requires_both_books() {
        let calculator = SpreadCalculator::new();
        let books = two_venue_books();
        let spreads = calculator.spreads_multi_exchange_directions("BTC-USDC-PERP", &books);
        let opening = &spreads[0];
        let mut partial = HashMap::new();
        partial.insert(
            opening.exchange_buy.clone(),
            books.get(&opening.exchange_buy).unwrap().clone(),
        );
        assert!(calculator
            .closing_spread_from_orderbooks(opening, &partial)
            .is_none());
    }

    #[test]
    fn multi_leg_uses_pair_id_as_symbol() {
        let calculator = SpreadCalculator::new();
        let mut books = HashMap::new();
        books.insert(
            ("lighter".to_string(), "XAU-USDC-PERP".to_string()),
            book("lighter", dec!(2000.0), dec!(2000.2)),
        );
        books.insert(
            ("lighter".to_string(), "PAXG-USDC-PERP".to_string()),
            book("lighter", dec!(2001.4), dec!(2001.6)),
        );

        let spreads = calculator.multi_leg_spread(
            "LIGHTER_PAXG_XAU",
            "lighter",
            "XAU-USDC-PERP",
            "lighter",
            "PAXG-USDC-PERP",
            &books,
            true,
        );
        assert_eq!(spreads.len(), 2);
        assert!(spreads.iter().all(|s| s.symbol == "LIGHTER_PAXG_XAU"));

        let best = spreads
            .iter()
            .max_by(|a, b| a.spread_pct.cmp(&b.spread_pct))
            .unwrap();
        assert_eq!(best.buy_symbol, "XAU-USDC-PERP");
        assert_eq!(best.sell_symbol, "PAXG-USDC-PERP");

        let closing = calculator.multi_leg_closing_spread(best, &books).unwrap();
        assert_eq!(closing.buy_symbol, "PAXG-USDC-PERP");
        assert_eq!(closing.sell_symbol, "XAU-USDC-PERP");
        assert_eq!(closing.symbol, "LIGHTER_PAXG_XAU");
    }
}
