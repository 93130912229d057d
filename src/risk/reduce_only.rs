//! Reduce-only guard and its recovery probe.
//!
//! Some venues impose reduce-only windows per pair. While a pair is
//! flagged, opens (and optionally closes) are blocked. A background
//! probe fires on integer-minute boundaries: a minimum-size reduce-only
//! order is submitted and cancelled on ack; a successful ack proves the
//! window has lifted and clears the flag.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ConfigManager;
use crate::exchanges::{ExchangeAdapter, OrderRequest};
use crate::models::OrderSide;

#[derive(Default)]
pub struct ReduceOnlyGuard {
    blocked_pairs: RwLock<HashSet<String>>,
    closing_blocked_pairs: RwLock<HashSet<String>>,
}

impl ReduceOnlyGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Blocks both opens and closes for the pair.
    pub fn block_pair(&self, symbol: &str) {
        if self.blocked_pairs.write().insert(symbol.to_uppercase()) {
            warn!("⏸️ [reduce-only] {symbol} 进入 reduce-only 限制");
        }
    }

    /// Blocks only closes (a closing-side venue restriction).
    pub fn block_pair_closing(&self, symbol: &str) {
        if self
            .closing_blocked_pairs
            .write()
            .insert(symbol.to_uppercase())
        {
            warn!("⏸️ [reduce-only] {symbol} 平仓受限");
        }
    }

    pub fn clear_pair(&self, symbol: &str) {
        let key = symbol.to_uppercase();
        let cleared = self.blocked_pairs.write().remove(&key);
        let cleared_closing = self.closing_blocked_pairs.write().remove(&key);
        if cleared || cleared_closing {
            info!("✅ [reduce-only] {symbol} 限制解除");
        }
    }

    pub fn is_pair_blocked(&self, symbol: &str) -> bool {
        self.blocked_pairs.read().contains(&symbol.to_uppercase())
    }

    pub fn is_pair_closing_blocked(&self, symbol: &str) -> bool {
        self.closing_blocked_pairs
            .read()
            .contains(&symbol.to_uppercase())
    }

    pub fn blocked_pairs(&self) -> Vec<String> {
        self.blocked_pairs.read().iter().cloned().collect()
    }
}

/// Integer-minute probe that detects reduce-only recovery.
pub struct ReduceOnlyProbeService {
    guard: Arc<ReduceOnlyGuard>,
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    config: Arc<ConfigManager>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReduceOnlyProbeService {
    pub fn new(
        guard: Arc<ReduceOnlyGuard>,
        adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
        config: Arc<ConfigManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            guard,
            adapters,
            config,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = self.clone();
        let task = tokio::spawn(async move {
            let mut last_probe_minute: Option<u32> = None;
            while service.running.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let now = Utc::now();
                let minute = now.minute();
                // Fire once per wall-clock minute, just past the boundary.
                if now.second() >= 5 || last_probe_minute == Some(minute) {
                    continue;
                }
                last_probe_minute = Some(minute);
                service.probe_blocked_pairs().await;
            }
        });
        *self.task.lock() = Some(task);
        info!("✅ [reduce-only] 整点探针已启动");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Probe every blocked pair once; clears the guard on the first
    /// venue that accepts a reduce-only order again.
    pub async fn probe_blocked_pairs(&self) {
        for symbol in self.guard.blocked_pairs() {
            if self.probe_pair(&symbol).await {
                self.guard.clear_pair(&symbol);
            }
        }
    }

    async fn probe_pair(&self, symbol: &str) -> bool {
        let quantity_config = self.config.get_config(symbol).quantity_config;
        for (venue, adapter) in &self.adapters {
            let probe_qty = quantity_config
                .min_exchange_order_qty
                .get(venue)
                .copied()
                .unwrap_or(quantity_config.base_quantity)
                .max(Decimal::new(1, 6));
            let mut request = OrderRequest::market(symbol, OrderSide::Sell, probe_qty);
            request.reduce_only = true;
            match adapter.create_order(request).await {
                Ok(order) => {
                    // Ack is the signal; the probe itself must not rest.
                    let _ = adapter.cancel_order(symbol, &order.order_id).await;
                    info!("✅ [reduce-only] {symbol}@{venue} 探针成功，限制解除");
                    return true;
                }
                Err(err) => {
                    warn!("⏳ [reduce-only] {symbol}@{venue} 探针仍被拒: {err}");
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::{SimExchange, SymbolConverter};
    use rust_decimal_macros::dec;

    const CONFIG: &str = r#"
        [default_config.grid_config]
        initial_spread_threshold = 0.05
        grid_step = 0.03
        max_segments = 3
        t0_close_ratio = 0.4

        [default_config.quantity_config]
        base_quantity = 0.001
        quantity_mode = "fixed"

        [default_config.risk_config]
        max_position_value = 500.0
        max_loss_percent = 2.0
    "#;

    #[test]
    fn guard_distinguishes_open_and_close_blocks() {
        let guard = ReduceOnlyGuard::new();
        guard.block_pair("BTC-USDC-PERP");
        guard.block_pair_closing("ETH-USDC-PERP");

        assert!(guard.is_pair_blocked("btc-usdc-perp"));
        assert!(!guard.is_pair_closing_blocked("BTC-USDC-PERP"));
        assert!(guard.is_pair_closing_blocked("ETH-USDC-PERP"));
        assert!(!guard.is_pair_blocked("ETH-USDC-PERP"));

        guard.clear_pair("BTC-USDC-PERP");
        assert!(!guard.is_pair_blocked("BTC-USDC-PERP"));
    }

    #[tokio::test]
    async fn probe_clears_guard_when_venue_accepts_again() {
        let converter = Arc::new(SymbolConverter::new());
        let venue = SimExchange::new("lighter", converter.clone());
        venue.connect().await.unwrap();
        venue.push_orderbook("BTC-USDC-PERP", (dec!(99.9), dec!(5)), (dec!(100.0), dec!(5)));

        let guard = ReduceOnlyGuard::new();
        guard.block_pair("BTC-USDC-PERP");

        let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert("lighter".to_string(), venue.clone());
        let config = Arc::new(ConfigManager::from_toml_str(CONFIG).unwrap());
        let service = ReduceOnlyProbeService::new(guard.clone(), adapters, config);

        // Venue still rejects reduce-only: the flag stays.
        venue.set_reject_reduce_only(true);
        service.probe_blocked_pairs().await;
        assert!(guard.is_pair_blocked("BTC-USDC-PERP"));

        // Window lifted: the probe ack clears the flag.
        venue.set_reject_reduce_only(false);
        service.probe_blocked_pairs().await;
        assert!(!guard.is_pair_blocked("BTC-USDC-PERP"));
    }
}
