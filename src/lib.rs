//! Segmented-grid cross-venue arbitrage engine.
//!
//! Ingests order books and funding rates from multiple perpetual venues,
//! detects cross-venue price discrepancies on a common basket of
//! symbols, and opens/closes paired positions in fixed quantity
//! increments arranged on a spread grid — under a holistic risk regime
//! (balance floors, reduce-only windows, concurrent-order locks,
//! liquidity pre-checks, price-stability debouncing, per-venue backoff).

pub mod config;
pub mod data;
pub mod decision;
pub mod exchanges;
pub mod execution;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod risk;
pub mod spread;

pub use config::ConfigManager;
pub use decision::DecisionEngine;
pub use exchanges::{ExchangeAdapter, SimExchange, SymbolConverter};
pub use execution::{ArbitrageExecutor, PaperExecutor};
pub use orchestrator::UnifiedOrchestrator;
