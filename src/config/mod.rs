//! Per-symbol configuration for the segmented grid.
//!
//! A TOML file carries a `default_config` table plus per-symbol override
//! tables; overrides are merged over the default one sub-table deep
//! (grid / quantity / risk), matching how operators think about tuning a
//! single knob per market. Configuration errors fail fast at startup.
//!
//! `t0_close_ratio` is deliberately a required field: the first close
//! threshold is safety-critical and must not fall back to a silent
//! default.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Grid ladder and gate settings for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSettings {
    /// T1, in percent.
    pub initial_spread_threshold: Decimal,
    /// Δ between consecutive grid levels, in percent.
    pub grid_step: Decimal,
    pub max_segments: u32,
    /// T0 = T1 * t0_close_ratio. Required, no default.
    pub t0_close_ratio: Decimal,

    #[serde(default = "default_one")]
    pub segment_quantity_ratio: Decimal,
    #[serde(default = "default_one")]
    pub segment_partial_order_ratio: Decimal,
    #[serde(default)]
    pub min_partial_order_quantity: Decimal,
    #[serde(default)]
    pub split_order_size: Option<Decimal>,
    #[serde(default = "default_profit_per_segment")]
    pub profit_per_segment: Decimal,
    #[serde(default)]
    pub use_symmetric_close: bool,

    /// Legacy alias still present in older configs; the engine reads
    /// `scalping_profit_threshold`.
    #[serde(default)]
    pub scalp_profit_threshold: Decimal,
    #[serde(default)]
    pub scalping_enabled: bool,
    #[serde(default = "default_scalping_trigger")]
    pub scalping_trigger_segment: u32,
    #[serde(default = "default_scalping_profit")]
    pub scalping_profit_threshold: Decimal,

    #[serde(default = "default_persistence_seconds")]
    pub spread_persistence_seconds: f64,
    #[serde(default)]
    pub strict_persistence_check: bool,

    #[serde(default)]
    pub require_orderbook_liquidity: bool,
    #[serde(default)]
    pub min_orderbook_quantity: Option<Decimal>,
    #[serde(default)]
    pub slippage_tolerance: Option<Decimal>,
    #[serde(default)]
    pub price_stability_window_seconds: Option<f64>,
    #[serde(default)]
    pub price_stability_threshold_pct: Option<Decimal>,
    /// Absolute price increment applied to limit legs.
    #[serde(default)]
    pub limit_price_offset: Option<Decimal>,
    /// Per-leg bid-ask spread ceiling, in percent.
    #[serde(default)]
    pub max_local_orderbook_spread_pct: Option<Decimal>,
}

fn default_one() -> Decimal {
    Decimal::ONE
}

fn default_profit_per_segment() -> Decimal {
    Decimal::new(2, 2)
}

fn default_scalping_trigger() -> u32 {
    4
}

fn default_scalping_profit() -> Decimal {
    Decimal::new(5, 2)
}

fn default_persistence_seconds() -> f64 {
    3.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantityMode {
    Fixed,
    Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantitySettings {
    pub base_quantity: Decimal,
    pub quantity_mode: QuantityMode,
    #[serde(default)]
    pub target_value_usdc: Decimal,
    #[serde(default = "default_quantity_precision")]
    pub quantity_precision: u32,
    #[serde(default)]
    pub min_order_size: Decimal,
    /// Per-venue exchange minimum order quantity.
    #[serde(default)]
    pub min_exchange_order_qty: HashMap<String, Decimal>,
}

fn default_quantity_precision() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettings {
    pub max_position_value: Decimal,
    pub max_loss_percent: Decimal,
    #[serde(default = "default_true")]
    pub enable_funding_rate_risk: bool,
    #[serde(default = "default_funding_hours")]
    pub max_unfavorable_funding_hours: u32,
    #[serde(default = "default_funding_diff")]
    pub funding_rate_diff_threshold: Decimal,
}

fn default_true() -> bool {
    true
}

fn default_funding_hours() -> u32 {
    8
}

fn default_funding_diff() -> Decimal {
    Decimal::new(1, 2)
}

/// The merged configuration of a single symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    #[serde(skip, default)]
    pub symbol: String,
    pub grid_config: GridSettings,
    pub quantity_config: QuantitySettings,
    pub risk_config: RiskSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMode {
    /// No real orders when true; the executor books paper fills.
    #[serde(default = "default_true")]
    pub monitor_only: bool,
    #[serde(default = "default_freshness")]
    pub data_freshness_seconds: f64,
}

impl Default for SystemMode {
    fn default() -> Self {
        Self {
            monitor_only: true,
            data_freshness_seconds: default_freshness(),
        }
    }
}

fn default_freshness() -> f64 {
    3.0
}

/// Global balance floors for the risk controller (USDC-equivalent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskControlSettings {
    #[serde(default = "default_balance_warning")]
    pub min_balance_warning: Decimal,
    #[serde(default = "default_balance_critical")]
    pub min_balance_close_position: Decimal,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub max_daily_trades: Option<u32>,
}

impl Default for RiskControlSettings {
    fn default() -> Self {
        Self {
            min_balance_warning: default_balance_warning(),
            min_balance_close_position: default_balance_critical(),
            check_interval_secs: default_check_interval(),
            max_daily_trades: None,
        }
    }
}

fn default_balance_warning() -> Decimal {
    Decimal::from(100)
}

fn default_balance_critical() -> Decimal {
    Decimal::from(20)
}

fn default_check_interval() -> u64 {
    60
}

/// One configured two-venue arbitrage pair over a single symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPairSpec {
    pub trading_pair_id: String,
    pub symbol: String,
    pub exchange_a: String,
    pub exchange_b: String,
    #[serde(default = "default_true")]
    pub allow_reverse: bool,
    #[serde(default)]
    pub min_spread_pct: Option<Decimal>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TradingPairSpec {
    pub fn normalized_symbol(&self) -> String {
        self.symbol.to_uppercase()
    }

    pub fn normalized_exchange_a(&self) -> String {
        self.exchange_a.to_lowercase()
    }

    pub fn normalized_exchange_b(&self) -> String {
        self.exchange_b.to_lowercase()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegSpec {
    pub exchange: String,
    pub symbol: String,
}

impl LegSpec {
    pub fn normalized_exchange(&self) -> String {
        self.exchange.to_lowercase()
    }

    pub fn normalized_symbol(&self) -> String {
        self.symbol.to_uppercase()
    }
}

/// Cross-pair (two different symbols) arbitrage basket. The pair_id is
/// the identity everywhere downstream; it must not collide with a venue
/// symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiLegPairSpec {
    pub pair_id: String,
    #[serde(default)]
    pub description: String,
    pub leg_primary: LegSpec,
    pub leg_secondary: LegSpec,
    #[serde(default = "default_true")]
    pub allow_reverse: bool,
    #[serde(default)]
    pub min_spread_pct: Option<Decimal>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    system_mode: SystemMode,
    #[serde(default)]
    risk_control: RiskControlSettings,
    default_config: toml::Value,
    #[serde(default)]
    symbol_configs: HashMap<String, toml::Value>,
    #[serde(default)]
    trading_pairs: Vec<TradingPairSpec>,
    #[serde(default)]
    multi_leg_pairs: Vec<MultiLegPairSpec>,
    #[serde(default)]
    exchanges: Vec<String>,
}

/// Loads and serves merged per-symbol configuration. Aliases let a
/// trading_pair_id reuse its base symbol's table.
pub struct ConfigManager {
    system_mode: SystemMode,
    risk_control: RiskControlSettings,
    default_config: SymbolConfig,
    symbol_configs: HashMap<String, SymbolConfig>,
    aliases: RwLock<HashMap<String, String>>,
    trading_pairs: Vec<TradingPairSpec>,
    multi_leg_pairs: Vec<MultiLegPairSpec>,
    exchanges: Vec<String>,
}

impl ConfigManager {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let parsed: RawConfigFile =
            toml::from_str(raw).context("failed to parse arbitrage config")?;

        let default_config =
            build_symbol_config("__DEFAULT__", parsed.default_config.clone(), None)
                .context("invalid default_config")?;

        let mut symbol_configs = HashMap::new();
        for (symbol, value) in parsed.symbol_configs {
            let symbol_key = symbol.to_uppercase();
            if let Some(enabled) = value.get("enabled").and_then(|v| v.as_bool()) {
                if !enabled {
                    info!("⏸️ 跳过已禁用的交易对: {symbol_key}");
                    continue;
                }
            }
            let merged = build_symbol_config(
                &symbol_key,
                value,
                Some(&parsed.default_config),
            )
            .with_context(|| format!("invalid config for symbol {symbol_key}"))?;
            symbol_configs.insert(symbol_key, merged);
        }

        let trading_pairs: Vec<TradingPairSpec> = parsed
            .trading_pairs
            .into_iter()
            .filter(|p| p.enabled)
            .collect();
        let multi_leg_pairs: Vec<MultiLegPairSpec> = parsed
            .multi_leg_pairs
            .into_iter()
            .filter(|p| p.enabled)
            .collect();

        // A multi-leg pair_id doubles as a symbol downstream; collisions
        // with real venue symbols would corrupt the position ledger.
        for pair in &multi_leg_pairs {
            let id = pair.pair_id.to_uppercase();
            if symbol_configs.contains_key(&id)
                || trading_pairs.iter().any(|p| p.normalized_symbol() == id)
            {
                bail!("multi-leg pair_id {} collides with a configured symbol", pair.pair_id);
            }
        }

        let manager = Self {
            system_mode: parsed.system_mode,
            risk_control: parsed.risk_control,
            default_config,
            symbol_configs,
            aliases: RwLock::new(HashMap::new()),
            trading_pairs,
            multi_leg_pairs,
            exchanges: parsed.exchanges,
        };

        // Trading pair ids reuse the base symbol's table.
        for pair in &manager.trading_pairs {
            manager.register_alias(&pair.trading_pair_id, &pair.symbol);
        }

        info!(
            "✅ 配置加载完成: {} 个交易对有独立配置, {} 个套利对, {} 个多腿组合",
            manager.symbol_configs.len(),
            manager.trading_pairs.len(),
            manager.multi_leg_pairs.len(),
        );
        Ok(manager)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// Symbol table if present, alias target next, default last.
    pub fn get_config(&self, symbol: &str) -> SymbolConfig {
        let key = symbol.to_uppercase();
        if let Some(config) = self.symbol_configs.get(&key) {
            return config.clone();
        }
        if let Some(target) = self.aliases.read().get(&key).cloned() {
            return self.get_config(&target);
        }
        let mut config = self.default_config.clone();
        config.symbol = key;
        config
    }

    pub fn is_symbol_enabled(&self, symbol: &str) -> bool {
        let key = symbol.to_uppercase();
        if self.symbol_configs.contains_key(&key) {
            return true;
        }
        self.aliases
            .read()
            .get(&key)
            .map(|target| self.symbol_configs.contains_key(&target.to_uppercase()))
            .unwrap_or(false)
    }

    pub fn register_alias(&self, alias: &str, target: &str) {
        let alias_key = alias.to_uppercase();
        let target_key = target.to_uppercase();
        if alias_key == target_key {
            return;
        }
        self.aliases.write().insert(alias_key, target_key);
    }

    pub fn system_mode(&self) -> &SystemMode {
        &self.system_mode
    }

    pub fn risk_control(&self) -> &RiskControlSettings {
        &self.risk_control
    }

    pub fn trading_pairs(&self) -> &[TradingPairSpec] {
        &self.trading_pairs
    }

    pub fn multi_leg_pairs(&self) -> &[MultiLegPairSpec] {
        &self.multi_leg_pairs
    }

    pub fn exchanges(&self) -> &[String] {
        &self.exchanges
    }

    pub fn configured_symbols(&self) -> Vec<String> {
        self.symbol_configs.keys().cloned().collect()
    }

    /// Diagnostic ladder: grid level → (open threshold %, target quantity).
    pub fn grid_map(&self, symbol: &str) -> Vec<(u32, Decimal, Decimal)> {
        let config = self.get_config(symbol);
        let mut rows = Vec::new();
        for level in 1..=config.grid_config.max_segments {
            let threshold = config.grid_config.initial_spread_threshold
                + config.grid_config.grid_step * Decimal::from(level - 1);
            let target = Decimal::from(level) * config.quantity_config.base_quantity;
            rows.push((level, threshold, target));
        }
        rows
    }
}

/// Merge a symbol's override table over the default table (one sub-table
/// deep) and deserialize the result.
fn build_symbol_config(
    symbol: &str,
    overrides: toml::Value,
    default: Option<&toml::Value>,
) -> Result<SymbolConfig> {
    let merged = match default {
        Some(default) => merge_tables(default, &overrides),
        None => overrides,
    };
    let mut config: SymbolConfig = merged
        .try_into()
        .context("symbol table does not match the config schema")?;
    if config.grid_config.initial_spread_threshold <= Decimal::ZERO {
        bail!("initial_spread_threshold must be positive");
    }
    if config.grid_config.grid_step < Decimal::ZERO {
        bail!("grid_step must not be negative");
    }
    if config.grid_config.t0_close_ratio < Decimal::ZERO
        || config.grid_config.t0_close_ratio > Decimal::ONE
    {
        bail!("t0_close_ratio must be within [0, 1]");
    }
    config.symbol = symbol.to_string();
    Ok(config)
}

fn merge_tables(default: &toml::Value, overrides: &toml::Value) -> toml::Value {
    let mut merged = default.clone();
    if let (Some(base), Some(over)) = (merged.as_table_mut(), overrides.as_table()) {
        for (key, value) in over {
            if key == "enabled" {
                continue;
            }
            match (base.get_mut(key), value.as_table()) {
                (Some(existing), Some(sub)) if existing.is_table() => {
                    let table = existing.as_table_mut().unwrap();
                    for (sub_key, sub_value) in sub {
                        table.insert(sub_key.clone(), sub_value.clone());
                    }
                }
                _ => {
                    base.insert(key.clone(), value.clone());
                }
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) const SAMPLE: &str = r#"
        [system_mode]
        monitor_only = true
        data_freshness_seconds = 3.0

        [risk_control]
        min_balance_warning = 100
        min_balance_close_position = 20

        [default_config.grid_config]
        initial_spread_threshold = 0.05
        grid_step = 0.03
        max_segments = 3
        t0_close_ratio = 0.4
        spread_persistence_seconds = 3
        strict_persistence_check = true

        [default_config.quantity_config]
        base_quantity = 0.001
        quantity_mode = "fixed"
        target_value_usdc = 100.0
        quantity_precision = 5

        [default_config.risk_config]
        max_position_value = 500.0
        max_loss_percent = 2.0

        [symbol_configs.BTC-USDC-PERP.grid_config]
        initial_spread_threshold = 0.06
        grid_step = 0.14
        max_segments = 5

        [symbol_configs.DOGE-USDC-PERP]
        enabled = false

        [[trading_pairs]]
        trading_pair_id = "LIGHTER_PARADEX_BTC"
        symbol = "BTC-USDC-PERP"
        exchange_a = "lighter"
        exchange_b = "paradex"
    "#;

    #[test]
    fn merges_symbol_overrides_over_default() {
        let manager = ConfigManager::from_toml_str(SAMPLE).unwrap();
        let config = manager.get_config("BTC-USDC-PERP");
        assert_eq!(config.grid_config.initial_spread_threshold, dec!(0.06));
        assert_eq!(config.grid_config.grid_step, dec!(0.14));
        assert_eq!(config.grid_config.max_segments, 5);
        // Inherited from the default table.
        assert_eq!(config.grid_config.t0_close_ratio, dec!(0.4));
        assert_eq!(config.quantity_config.base_quantity, dec!(0.001));
        assert!(config.grid_config.strict_persistence_check);
    }

    #[test]
    fn disabled_symbols_are_skipped() {
        let manager = ConfigManager::from_toml_str(SAMPLE).unwrap();
        assert!(!manager.is_symbol_enabled("DOGE-USDC-PERP"));
        assert!(manager.is_symbol_enabled("BTC-USDC-PERP"));
    }

    #[test]
    fn trading_pair_id_aliases_to_base_symbol() {
        let manager = ConfigManager::from_toml_str(SAMPLE).unwrap();
        let config = manager.get_config("LIGHTER_PARADEX_BTC");
        assert_eq!(config.grid_config.grid_step, dec!(0.14));
        assert!(manager.is_symbol_enabled("LIGHTER_PARADEX_BTC"));
    }

    #[test]
    fn unknown_symbol_falls_back_to_default() {
        let manager = ConfigManager::from_toml_str(SAMPLE).unwrap();
        let config = manager.get_config("ETH-USDC-PERP");
        assert_eq!(config.grid_config.initial_spread_threshold, dec!(0.05));
        assert_eq!(config.symbol, "ETH-USDC-PERP");
    }

    #[test]
    fn missing_t0_close_ratio_is_rejected() {
        let raw = r#"
            [default_config.grid_config]
            initial_spread_threshold = 0.05
            grid_step = 0.03
            max_segments = 3

            [default_config.quantity_config]
            base_quantity = 0.001
            quantity_mode = "fixed"

            [default_config.risk_config]
            max_position_value = 500.0
            max_loss_percent = 2.0
        "#;
        assert!(ConfigManager::from_toml_str(raw).is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbitrage.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let manager = ConfigManager::load(&path).unwrap();
        assert!(manager.is_symbol_enabled("BTC-USDC-PERP"));
        assert_eq!(manager.trading_pairs().len(), 1);
        assert!(ConfigManager::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn grid_map_builds_ladder() {
        let manager = ConfigManager::from_toml_str(SAMPLE).unwrap();
        let rows = manager.grid_map("BTC-USDC-PERP");
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0], (1, dec!(0.06), dec!(0.001)));
        assert_eq!(rows[1], (2, dec!(0.20), dec!(0.002)));
    }
}
