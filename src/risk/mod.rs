//! Risk regime: global balance floors, per-venue error backoff,
//! reduce-only windows and per-symbol manual states.

pub mod backoff;
pub mod reduce_only;
pub mod symbol_state;

pub use backoff::ErrorBackoffController;
pub use reduce_only::{ReduceOnlyGuard, ReduceOnlyProbeService};
pub use symbol_state::{SymbolState, SymbolStateManager};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::RiskControlSettings;
use crate::exchanges::ExchangeAdapter;

/// Snapshot of the global risk state consulted by the main loop.
#[derive(Debug, Clone, Default)]
pub struct RiskStatus {
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub network_failure: bool,
    pub exchange_maintenance: HashSet<String>,
    pub low_balance_exchanges: HashSet<String>,
    pub critical_balance_exchanges: HashSet<String>,
    pub daily_trade_count: HashMap<NaiveDate, u32>,
}

#[derive(Default)]
struct RiskState {
    network_failure: bool,
    network_failure_reason: Option<String>,
    exchange_maintenance: HashSet<String>,
    low_balance_exchanges: HashSet<String>,
    critical_balance_exchanges: HashSet<String>,
    daily_trade_count: HashMap<NaiveDate, u32>,
}

/// Background balance sweeps plus the pause/emergency-close latches.
/// USDC-equivalent balances are summed per venue; warning pauses opens,
/// critical additionally requests a blanket emergency close that the
/// orchestrator consumes.
pub struct GlobalRiskController {
    settings: RiskControlSettings,
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    state: Mutex<RiskState>,
    emergency_close_requested: AtomicBool,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

const STABLE_ASSETS: &[&str] = &["USDC", "USDT", "USD", "DUSD"];

impl GlobalRiskController {
    pub fn new(
        settings: RiskControlSettings,
        adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            adapters,
            state: Mutex::new(RiskState::default()),
            emergency_close_requested: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let controller = self.clone();
        let interval_secs = self.settings.check_interval_secs.max(1);
        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            while controller.running.load(Ordering::Relaxed) {
                ticker.tick().await;
                controller.check_all_balances().await;
            }
        });
        *self.task.lock() = Some(task);
        info!("✅ [风控] 全局风险控制器已启动 (余额巡检 {}s)", interval_secs);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        info!("🛑 [风控] 全局风险控制器已停止");
    }

    /// One sweep over every venue's USDC-equivalent balance.
    pub async fn check_all_balances(&self) {
        for (venue, adapter) in &self.adapters {
            match adapter.get_balances().await {
                Ok(balances) => {
                    let total: Decimal = balances
                        .iter()
                        .filter(|b| STABLE_ASSETS.contains(&b.asset.to_uppercase().as_str()))
                        .map(|b| b.total)
                        .sum();
                    self.apply_balance(venue, total);
                }
                Err(err) => {
                    warn!("⚠️ [风控] {venue} 余额查询失败: {err}");
                }
            }
        }
    }

    fn apply_balance(&self, venue: &str, total: Decimal) {
        let mut state = self.state.lock();
        let was_critical = state.critical_balance_exchanges.contains(venue);
        let was_low = state.low_balance_exchanges.contains(venue);

        if total < self.settings.min_balance_close_position {
            state.low_balance_exchanges.insert(venue.to_string());
            if state.critical_balance_exchanges.insert(venue.to_string()) {
                error!(
                    "🚨 [风控] {venue} 余额 {total} 低于紧急平仓线 {}，触发紧急平仓",
                    self.settings.min_balance_close_position
                );
                self.emergency_close_requested.store(true, Ordering::SeqCst);
            }
        } else if total < self.settings.min_balance_warning {
            state.critical_balance_exchanges.remove(venue);
            if state.low_balance_exchanges.insert(venue.to_string()) {
                warn!(
                    "⚠️ [风控] {venue} 余额 {total} 低于警戒线 {}，暂停开仓",
                    self.settings.min_balance_warning
                );
            }
        } else {
            state.critical_balance_exchanges.remove(venue);
            state.low_balance_exchanges.remove(venue);
            if was_critical || was_low {
                info!("✅ [风控] {venue} 余额恢复 ({total})");
            }
        }
    }

    pub fn mark_network_failure(&self, reason: &str) {
        let mut state = self.state.lock();
        if !state.network_failure {
            warn!("🚨 [风控] 网络故障标记: {reason}");
        }
        state.network_failure = true;
        state.network_failure_reason = Some(reason.to_string());
    }

    pub fn mark_network_recovered(&self) {
        let mut state = self.state.lock();
        if state.network_failure {
            info!("✅ [风控] 网络恢复");
        }
        state.network_failure = false;
        state.network_failure_reason = None;
    }

    pub fn mark_exchange_maintenance(&self, venue: &str) {
        let mut state = self.state.lock();
        if state.exchange_maintenance.insert(venue.to_string()) {
            warn!("🚧 [风控] {venue} 维护中，全局暂停");
        }
    }

    pub fn mark_exchange_recovered(&self, venue: &str) {
        let mut state = self.state.lock();
        if state.exchange_maintenance.remove(venue) {
            info!("✅ [风控] {venue} 维护结束");
        }
    }

    pub fn record_trade(&self) {
        let today = Utc::now().date_naive();
        let mut state = self.state.lock();
        *state.daily_trade_count.entry(today).or_insert(0) += 1;
    }

    /// (allowed, reject reason). Counters bucket by UTC date.
    pub fn check_daily_trade_limit(&self) -> (bool, Option<String>) {
        let Some(limit) = self.settings.max_daily_trades else {
            return (true, None);
        };
        let today = Utc::now().date_naive();
        let count = self
            .state
            .lock()
            .daily_trade_count
            .get(&today)
            .copied()
            .unwrap_or(0);
        if count >= limit {
            (false, Some(format!("当日交易次数 {count} 已达上限 {limit}")))
        } else {
            (true, None)
        }
    }

    pub fn get_risk_status(&self) -> RiskStatus {
        let state = self.state.lock();
        let mut reasons = Vec::new();
        if state.network_failure {
            reasons.push("网络故障".to_string());
        }
        if !state.exchange_maintenance.is_empty() {
            reasons.push(format!(
                "交易所维护: {}",
                join_sorted(&state.exchange_maintenance)
            ));
        }
        if !state.critical_balance_exchanges.is_empty() {
            reasons.push(format!(
                "余额紧急: {}",
                join_sorted(&state.critical_balance_exchanges)
            ));
        } else if !state.low_balance_exchanges.is_empty() {
            reasons.push(format!(
                "余额不足: {}",
                join_sorted(&state.low_balance_exchanges)
            ));
        }

        RiskStatus {
            is_paused: !reasons.is_empty(),
            pause_reason: (!reasons.is_empty()).then(|| reasons.join(" | ")),
            network_failure: state.network_failure,
            exchange_maintenance: state.exchange_maintenance.clone(),
            low_balance_exchanges: state.low_balance_exchanges.clone(),
            critical_balance_exchanges: state.critical_balance_exchanges.clone(),
            daily_trade_count: state.daily_trade_count.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.get_risk_status().is_paused
    }

    /// Consume the emergency-close latch (set on critical balance).
    pub fn take_emergency_close_request(&self) -> bool {
        self.emergency_close_requested.swap(false, Ordering::SeqCst)
    }
}

fn join_sorted(set: &HashSet<String>) -> String {
    let mut items: Vec<&str> = set.iter().map(String::as_str).collect();
    items.sort_unstable();
    items.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::{SimExchange, SymbolConverter};
    use rust_decimal_macros::dec;

    fn controller_with(venue: &Arc<SimExchange>) -> Arc<GlobalRiskController> {
        let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert("lighter".to_string(), venue.clone());
        GlobalRiskController::new(
            RiskControlSettings {
                min_balance_warning: dec!(100),
                min_balance_close_position: dec!(20),
                check_interval_secs: 60,
                max_daily_trades: Some(2),
            },
            adapters,
        )
    }

    #[tokio::test]
    async fn warning_balance_pauses_critical_requests_close() {
        let venue = SimExchange::new("lighter", Arc::new(SymbolConverter::new()));
        let controller = controller_with(&venue);

        venue.set_balance("USDC", dec!(50));
        controller.check_all_balances().await;
        let status = controller.get_risk_status();
        assert!(status.is_paused);
        assert!(status.low_balance_exchanges.contains("lighter"));
        assert!(!controller.take_emergency_close_request());

        venue.set_balance("USDC", dec!(5));
        controller.check_all_balances().await;
        let status = controller.get_risk_status();
        assert!(status.critical_balance_exchanges.contains("lighter"));
        assert!(controller.take_emergency_close_request());
        // Latch is consumed once.
        assert!(!controller.take_emergency_close_request());

        venue.set_balance("USDC", dec!(500));
        controller.check_all_balances().await;
        assert!(!controller.is_paused());
    }

    #[tokio::test]
    async fn daily_trade_limit_buckets_by_date() {
        let venue = SimExchange::new("lighter", Arc::new(SymbolConverter::new()));
        let controller = controller_with(&venue);
        assert!(controller.check_daily_trade_limit().0);
        controller.record_trade();
        controller.record_trade();
        let (allowed, reason) = controller.check_daily_trade_limit();
        assert!(!allowed);
        assert!(reason.is_some());
    }

    #[tokio::test]
    async fn maintenance_and_network_marks_pause() {
        let venue = SimExchange::new("lighter", Arc::new(SymbolConverter::new()));
        let controller = controller_with(&venue);

        controller.mark_exchange_maintenance("lighter");
        assert!(controller.is_paused());
        controller.mark_exchange_recovered("lighter");
        assert!(!controller.is_paused());

        controller.mark_network_failure("all venues unreachable");
        assert!(controller.get_risk_status().network_failure);
        controller.mark_network_recovered();
        assert!(!controller.is_paused());
    }
}
