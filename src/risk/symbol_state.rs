//! Per-symbol manual intervention states.
//!
//! A symbol enters `Waiting` after e.g. an order-submission failure that
//! needs operator attention. While waiting, actions that target the same
//! grid level are blocked; a different level (the market moved on) is
//! allowed through.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolState {
    Idle,
    Waiting { reason: String, grid_level: u32 },
}

#[derive(Default)]
pub struct SymbolStateManager {
    states: RwLock<HashMap<String, SymbolState>>,
}

impl SymbolStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_waiting(&self, symbol: &str, reason: &str, grid_level: u32) {
        warn!("⏸️ [状态] {symbol} 进入等待状态: {reason} (T{grid_level})");
        self.states.write().insert(
            symbol.to_uppercase(),
            SymbolState::Waiting {
                reason: reason.to_string(),
                grid_level,
            },
        );
    }

    pub fn clear(&self, symbol: &str) {
        if self
            .states
            .write()
            .insert(symbol.to_uppercase(), SymbolState::Idle)
            .is_some()
        {
            info!("▶️ [状态] {symbol} 等待状态解除");
        }
    }

    pub fn get(&self, symbol: &str) -> SymbolState {
        self.states
            .read()
            .get(&symbol.to_uppercase())
            .cloned()
            .unwrap_or(SymbolState::Idle)
    }

    /// Blocks when a waiting state targets the same grid level.
    /// Returns the blocking reason and the waited level.
    pub fn should_block(&self, symbol: &str, grid_level: u32) -> Option<(String, u32)> {
        match self.get(symbol) {
            SymbolState::Waiting {
                reason,
                grid_level: waiting_level,
            } if waiting_level == grid_level => Some((reason, waiting_level)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_only_matching_grid_level() {
        let manager = SymbolStateManager::new();
        manager.set_waiting("BTC-USDC-PERP", "下单失败待人工确认", 2);

        assert!(manager.should_block("BTC-USDC-PERP", 2).is_some());
        // The market moved to a different level: not blocked.
        assert!(manager.should_block("BTC-USDC-PERP", 3).is_none());
        assert!(manager.should_block("ETH-USDC-PERP", 2).is_none());

        manager.clear("BTC-USDC-PERP");
        assert!(manager.should_block("BTC-USDC-PERP", 2).is_none());
        assert_eq!(manager.get("BTC-USDC-PERP"), SymbolState::Idle);
    }
}
