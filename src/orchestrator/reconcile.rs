//! Decision-vs-exchange position reconciliation.
//!
//! Both sides are reduced to (venue, normalized base token) → signed net
//! size and compared under the accounting epsilon. A mismatch is logged
//! with a delta breakdown and left for manual intervention — the audit
//! never auto-corrects. Multi-leg baskets legitimately produce a pair of
//! exactly offsetting same-venue sizes on two different tokens; that
//! shape is treated as balanced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::decision::DecisionEngine;
use crate::exchanges::ExchangeAdapter;
use crate::models::quantity_epsilon;

const AUDIT_LOG_INTERVAL: Duration = Duration::from_secs(120);

type NetPositions = HashMap<(String, String), Decimal>;

/// Strip venue/quote decoration: `PAXG-USD-PERP`, `PAXG` and
/// `PAXG/USD:PERP` all normalize to `PAXG`.
pub fn normalize_symbol_for_comparison(symbol: &str) -> String {
    const SUFFIX_WHITELIST: &[&str] = &["USD", "USDC", "USDT", "PERP", "SPOT", "FUTURES"];
    let upper = symbol.to_uppercase();
    let tokens: Vec<&str> = upper
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return upper;
    }
    for token in &tokens {
        if !SUFFIX_WHITELIST.contains(token) {
            return token.to_string();
        }
    }
    tokens[0].to_string()
}

/// Decision-engine side: every non-zero pair position contributes
/// +size on its buy leg and −size on its sell leg.
pub fn collect_decision_net_positions(engine: &DecisionEngine) -> NetPositions {
    let mut totals: NetPositions = HashMap::new();
    let epsilon = quantity_epsilon();

    let pair_positions = engine.pair_positions_snapshot();
    if !pair_positions.is_empty() {
        for (_, position) in &pair_positions {
            if position.total_quantity <= epsilon {
                continue;
            }
            accumulate(
                &mut totals,
                &position.exchange_buy,
                &position.buy_symbol,
                position.total_quantity,
            );
            accumulate(
                &mut totals,
                &position.exchange_sell,
                &position.sell_symbol,
                -position.total_quantity,
            );
        }
    } else {
        for position in engine.positions_snapshot() {
            if position.total_quantity <= epsilon {
                continue;
            }
            accumulate(
                &mut totals,
                &position.exchange_buy,
                &position.buy_symbol,
                position.total_quantity,
            );
            accumulate(
                &mut totals,
                &position.exchange_sell,
                &position.sell_symbol,
                -position.total_quantity,
            );
        }
    }

    totals.retain(|_, qty| qty.abs() > epsilon);
    totals
}

/// Exchange side, read from the adapter position caches.
pub fn collect_exchange_net_positions(
    adapters: &HashMap<String, Arc<dyn ExchangeAdapter>>,
) -> NetPositions {
    let mut totals: NetPositions = HashMap::new();
    for (venue, adapter) in adapters {
        for (symbol, cached) in adapter.position_cache() {
            accumulate(&mut totals, venue, &symbol, cached.signed_size());
        }
    }
    totals.retain(|_, qty| qty.abs() > quantity_epsilon());
    totals
}

fn accumulate(totals: &mut NetPositions, venue: &str, symbol: &str, qty: Decimal) {
    if venue.is_empty() || symbol.is_empty() {
        return;
    }
    let key = (
        venue.to_lowercase(),
        normalize_symbol_for_comparison(symbol),
    );
    *totals.entry(key).or_insert(Decimal::ZERO) += qty;
}

fn deltas(left: &NetPositions, right: &NetPositions) -> Vec<((String, String), Decimal)> {
    let epsilon = quantity_epsilon();
    let mut keys: Vec<(String, String)> = left.keys().chain(right.keys()).cloned().collect();
    keys.sort();
    keys.dedup();

    let mut out = Vec::new();
    for key in keys {
        let delta = right.get(&key).copied().unwrap_or(Decimal::ZERO)
            - left.get(&key).copied().unwrap_or(Decimal::ZERO);
        if delta.abs() > epsilon {
            out.push((key, delta));
        }
    }
    out
}

/// Consistency check with the multi-leg special case: leftover deltas
/// that pairwise offset on the same venue across two different tokens
/// cancel each other out.
pub fn position_maps_consistent(left: &NetPositions, right: &NetPositions) -> bool {
    let mut remaining = deltas(left, right);
    let epsilon = quantity_epsilon();

    let mut index = 0;
    while index < remaining.len() {
        let mut matched = None;
        for other in (index + 1)..remaining.len() {
            let ((venue_a, token_a), delta_a) = &remaining[index];
            let ((venue_b, token_b), delta_b) = &remaining[other];
            if venue_a == venue_b && token_a != token_b && (*delta_a + *delta_b).abs() <= epsilon {
                matched = Some(other);
                break;
            }
        }
        match matched {
            Some(other) => {
                remaining.remove(other);
                remaining.remove(index);
            }
            None => index += 1,
        }
    }

    remaining.is_empty()
}

pub fn format_position_map(map: &NetPositions) -> String {
    if map.is_empty() {
        return "-".to_string();
    }
    let mut keys: Vec<&(String, String)> = map.keys().collect();
    keys.sort();
    keys.iter()
        .map(|key| format!("{}/{}:{:+.4}", key.0, key.1, map[*key]))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_position_deltas(left: &NetPositions, right: &NetPositions) -> String {
    let rows = deltas(left, right);
    if rows.is_empty() {
        return "-".to_string();
    }
    rows.iter()
        .map(|((venue, token), delta)| {
            let decision = left
                .get(&(venue.clone(), token.clone()))
                .copied()
                .unwrap_or(Decimal::ZERO);
            let exchange = right
                .get(&(venue.clone(), token.clone()))
                .copied()
                .unwrap_or(Decimal::ZERO);
            format!("{venue}/{token}:决策={decision:+.4} 交易所={exchange:+.4} 差={delta:+.4}")
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Runs the audit and logs only on state change (or every 120 s while
/// inconsistent) to keep the log usable.
#[derive(Default)]
pub struct PositionAuditor {
    last_snapshot: Mutex<HashMap<String, (String, Instant)>>,
}

impl PositionAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit(
        &self,
        audit_key: &str,
        engine: &DecisionEngine,
        adapters: &HashMap<String, Arc<dyn ExchangeAdapter>>,
    ) -> bool {
        let decision = collect_decision_net_positions(engine);
        let exchange = collect_exchange_net_positions(adapters);
        if decision.is_empty() && exchange.is_empty() {
            return true;
        }
        let consistent = position_maps_consistent(&decision, &exchange);
        let snapshot = format!(
            "{}|{}|{consistent}",
            format_position_map(&decision),
            format_position_map(&exchange)
        );

        {
            let mut last = self.last_snapshot.lock();
            if let Some((previous, logged_at)) = last.get(audit_key) {
                if consistent && *previous == snapshot && logged_at.elapsed() < AUDIT_LOG_INTERVAL
                {
                    return consistent;
                }
            }
            last.insert(audit_key.to_string(), (snapshot, Instant::now()));
        }

        if consistent {
            info!(
                "✅ 一致 [持仓校验] {audit_key} | 决策: {} | 交易所: {}",
                format_position_map(&decision),
                format_position_map(&exchange)
            );
        } else {
            warn!(
                "⚠️ 不一致 [持仓校验] {audit_key} | 决策: {} | 交易所: {} | 差异: {}",
                format_position_map(&decision),
                format_position_map(&exchange),
                format_position_deltas(&decision, &exchange)
            );
        }
        consistent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn map(entries: &[(&str, &str, Decimal)]) -> NetPositions {
        let mut out = NetPositions::new();
        for (venue, token, qty) in entries {
            out.insert((venue.to_string(), token.to_string()), *qty);
        }
        out
    }

    #[test]
    fn normalization_strips_quote_and_kind() {
        assert_eq!(normalize_symbol_for_comparison("PAXG-USD-PERP"), "PAXG");
        assert_eq!(normalize_symbol_for_comparison("PAXG"), "PAXG");
        assert_eq!(normalize_symbol_for_comparison("BTC/USDC:PERP"), "BTC");
        assert_eq!(normalize_symbol_for_comparison("btc_usdc_perp"), "BTC");
        // Pure-suffix names fall back to the first token.
        assert_eq!(normalize_symbol_for_comparison("USDC"), "USDC");
    }

    #[test]
    fn matching_maps_are_consistent() {
        let decision = map(&[
            ("lighter", "BTC", dec!(0.003)),
            ("paradex", "BTC", dec!(-0.003)),
        ]);
        let exchange = map(&[
            ("lighter", "BTC", dec!(0.003)),
            ("paradex", "BTC", dec!(-0.003)),
        ]);
        assert!(position_maps_consistent(&decision, &exchange));
    }

    #[test]
    fn size_mismatch_is_flagged() {
        let decision = map(&[("lighter", "BTC", dec!(0.003))]);
        let exchange = map(&[("lighter", "BTC", dec!(0.002))]);
        assert!(!position_maps_consistent(&decision, &exchange));
        let formatted = format_position_deltas(&decision, &exchange);
        assert!(formatted.contains("lighter/BTC"));
    }

    #[test]
    fn offsetting_same_venue_tokens_are_balanced() {
        // A multi-leg basket books XAU long / PAXG short on one venue;
        // the engine knows it as one pair, the venue as two tokens.
        let decision = map(&[]);
        let exchange = map(&[
            ("lighter", "XAU", dec!(0.043)),
            ("lighter", "PAXG", dec!(-0.043)),
        ]);
        assert!(position_maps_consistent(&decision, &exchange));
    }

    #[test]
    fn offsetting_pair_on_different_venues_is_not_balanced() {
        let decision = map(&[]);
        let exchange = map(&[
            ("lighter", "XAU", dec!(0.043)),
            ("edgex", "PAXG", dec!(-0.043)),
        ]);
        assert!(!position_maps_consistent(&decision, &exchange));
    }
}
