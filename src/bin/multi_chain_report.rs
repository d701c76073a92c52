use std::env;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, instrument};

use stable_yield_engine::aggregator::{AggregatorConfig, YieldAggregator};
use stable_yield_engine::cache::TtlCache;
use stable_yield_engine::config::Config;
use stable_yield_engine::logging;
use stable_yield_engine::optimizer::{MultiChainConfig, MultiChainOptimizer};
use stable_yield_engine::protocols::default_adapters;
use stable_yield_engine::rpc::RpcPool;
use stable_yield_engine::types::RiskLevel;

/// Parse an optional env var; unset means "use the optimizer default"
fn optional_env<T>(var: &str) -> eyre::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(var) {
        Ok(raw) => Ok(Some(raw.trim().parse()?)),
        Err(_) => Ok(None),
    }
}

#[instrument(name = "multi_chain_report_main")]
#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Initialize logging
    if let Err(e) = logging::init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        return Err(e.into());
    }

    let cfg = Config::load()?;
    let token = env::var("TOKEN").unwrap_or_else(|_| "USDC".to_string());
    let risk_level: RiskLevel = optional_env("RISK_LEVEL")?.unwrap_or(RiskLevel::Moderate);
    let position_usd: Option<Decimal> = optional_env("POSITION_USD")?;
    let hold_days: Option<u32> = optional_env("HOLD_DAYS")?;
    info!(%token, risk_level = risk_level.as_str(), ?position_usd, ?hold_days, "Configuration loaded and logging initialized");

    let cache = Arc::new(TtlCache::new(cfg.cache_ttl));
    let rpc = Arc::new(RpcPool::new(&cfg));
    let adapters = default_adapters(rpc.clone(), cache.clone(), &cfg)?;
    let aggregator = Arc::new(YieldAggregator::new(adapters, cache, AggregatorConfig::default()));
    let optimizer = MultiChainOptimizer::new(aggregator, rpc, MultiChainConfig::default());

    let report = optimizer
        .optimize_across_chains(&token, risk_level, position_usd, hold_days)
        .await?;
    info!(
        best_chain = %report.best_chain_name,
        net_apy = %report.net_apy,
        confidence = report.confidence,
        "Report ready"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
