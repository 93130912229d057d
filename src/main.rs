//! gridarb — segmented-grid cross-venue arbitrage engine.
//!
//! The binary wires sim venues (concrete venue transports live outside
//! this crate) to the orchestrator and runs the control loop until
//! interrupted. Positions left open at shutdown are emergency-closed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridarb_backend::exchanges::ExchangeAdapter;
use gridarb_backend::{
    ConfigManager, PaperExecutor, SimExchange, SymbolConverter, UnifiedOrchestrator,
};

#[derive(Parser, Debug)]
#[command(name = "gridarb", about = "Segmented-grid cross-venue arbitrage engine")]
struct Args {
    /// Path to the arbitrage configuration file.
    #[arg(long, env = "GRIDARB_CONFIG", default_value = "config/arbitrage.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(
        ConfigManager::load(&args.config)
            .with_context(|| format!("loading config from {}", args.config.display()))?,
    );

    let converter = Arc::new(SymbolConverter::new());
    let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
    for venue in config.exchanges() {
        let adapter = SimExchange::new(venue, converter.clone());
        adapters.insert(adapter.venue().to_string(), adapter);
    }
    if adapters.is_empty() {
        anyhow::bail!("no exchanges configured");
    }

    let monitor_only = config.system_mode().monitor_only;
    if monitor_only {
        info!("🔍 监控模式：不会提交真实订单");
    }
    let executor = PaperExecutor::new(adapters.clone(), monitor_only);

    let orchestrator = UnifiedOrchestrator::new(config, converter, adapters, executor);
    orchestrator.start().await?;

    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("⚠️ 收到中断信号，正在退出...");

    if orchestrator.engine().has_open_positions() {
        warn!("⚠️ 退出时仍有持仓，执行紧急平仓");
        orchestrator
            .emergency_close_all_positions("系统退出紧急平仓")
            .await;
    }
    orchestrator.stop().await;
    Ok(())
}
