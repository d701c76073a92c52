use std::env;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use stable_yield_engine::aggregator::{AggregatorConfig, YieldAggregator};
use stable_yield_engine::cache::TtlCache;
use stable_yield_engine::config::Config;
use stable_yield_engine::formatting::format_usd;
use stable_yield_engine::logging;
use stable_yield_engine::protocols::default_adapters;
use stable_yield_engine::rpc::RpcPool;
use stable_yield_engine::types::ETHEREUM;

#[instrument(name = "yield_scanner_main")]
#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Initialize logging
    if let Err(e) = logging::init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        return Err(e.into());
    }

    let cfg = Config::load()?;
    let token = env::var("TOKEN").unwrap_or_else(|_| "USDC".to_string());
    let chain_id: u64 = match env::var("CHAIN_ID") {
        Ok(raw) => raw.parse()?,
        Err(_) => ETHEREUM,
    };
    info!(%token, chain_id, "Configuration loaded and logging initialized");

    let cache = Arc::new(TtlCache::new(cfg.cache_ttl));
    let sweeper = cache.spawn_sweeper(cfg.cache_sweep_interval);
    let rpc = Arc::new(RpcPool::new(&cfg));
    let adapters = default_adapters(rpc, cache.clone(), &cfg)?;
    let aggregator = YieldAggregator::new(adapters, cache, AggregatorConfig::default());

    let (opportunities, metrics) = tokio::join!(
        aggregator.fetch_all_opportunities(&token, chain_id, None),
        aggregator.get_aggregated_metrics(chain_id),
    );

    for failure in opportunities.errors.iter() {
        warn!(protocol = %failure.protocol, err = %failure.error, "Protocol unavailable");
    }
    println!("{token} on chain {chain_id}: {} opportunities", opportunities.opportunities.len());
    for (rank, opp) in opportunities.opportunities.iter().enumerate() {
        println!(
            "{:>2}. {:<9} {:>6}%  TVL {:>18}  liquidity {:>18}",
            rank + 1,
            opp.protocol.as_str(),
            opp.supply_apy,
            format_usd(opp.tvl),
            format_usd(opp.liquidity),
        );
    }
    println!("APY spread: {}%", opportunities.apy_spread);

    println!(
        "\nChain {chain_id}: {}/{} protocols healthy, TVL {}, weighted APY {}%",
        metrics.healthy_protocol_count,
        metrics.total_protocol_count,
        format_usd(metrics.total_tvl_usd),
        metrics.weighted_avg_supply_apy,
    );
    if let Some(best) = metrics.best_protocol {
        println!("Best protocol: {} at {}%", best, metrics.best_supply_apy);
    }

    sweeper.shutdown().await;
    Ok(())
}
