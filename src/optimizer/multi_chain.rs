use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::prelude::*;
use rust_decimal::{Decimal, dec};
use tracing::{debug, info, instrument, warn};

use crate::aggregator::YieldAggregator;
use crate::error::{Result, YieldError};
use crate::formatting::{round_2dp, u256_to_decimal};
use crate::rpc::GasPriceSource;
use crate::types::{ARBITRUM, BASE, ETHEREUM, POLYGON, RiskLevel, SEPOLIA};

use super::strategies::clamp_confidence;
use super::strategies::gas_aware::protocol_gas_units;
use super::types::{
    ApyRange, ChainGasSummary, ChainOpportunity, ChainResult, MultiChainConfig, MultiChainResult,
    ProtocolAllocation,
};

pub const SUPPORTED_CHAINS: [u64; 5] = [ETHEREUM, BASE, ARBITRUM, POLYGON, SEPOLIA];

const GWEI_PER_ETH: Decimal = dec!(1000000000);

pub fn chain_name(chain_id: u64) -> &'static str {
    match chain_id {
        ETHEREUM => "Ethereum",
        BASE => "Base",
        ARBITRUM => "Arbitrum",
        POLYGON => "Polygon",
        SEPOLIA => "Sepolia",
        _ => "Unknown",
    }
}

/// USD price of the chain's gas token; testnet gas is worthless
pub fn native_price_usd(chain_id: u64) -> Decimal {
    match chain_id {
        ETHEREUM | BASE | ARBITRUM => dec!(3000),
        POLYGON => dec!(0.85),
        _ => Decimal::ZERO,
    }
}

pub fn target_apy(level: RiskLevel) -> ApyRange {
    match level {
        RiskLevel::Conservative => ApyRange { min: dec!(3), max: dec!(4) },
        RiskLevel::Moderate => ApyRange { min: dec!(4), max: dec!(5) },
        RiskLevel::Aggressive => ApyRange { min: dec!(5), max: dec!(6) },
    }
}

fn template(level: RiskLevel) -> [u32; 3] {
    match level {
        RiskLevel::Aggressive => [70, 25, 5],
        RiskLevel::Conservative => [55, 30, 15],
        RiskLevel::Moderate => [40, 35, 25],
    }
}

fn rationale(level: RiskLevel, slot: usize) -> &'static str {
    let lines: [&str; 3] = match level {
        RiskLevel::Conservative => [
            "Highest TVL - most established and stable protocol",
            "Secondary stable protocol for diversification",
            "Minimal allocation for yield enhancement",
        ],
        RiskLevel::Moderate => [
            "Best balance of yield and stability",
            "Secondary balanced opportunity",
            "Diversification across protocols",
        ],
        RiskLevel::Aggressive => [
            "Maximum yield - highest APY protocol",
            "Secondary high-yield opportunity",
            "Minimal diversification",
        ],
    };
    lines.get(slot).copied().unwrap_or("Additional allocation")
}

/// 0.4 * APY/maxAPY + 0.6 * TVL/maxTVL
fn balanced_score(opportunity: &ChainOpportunity, max_apy: Decimal, max_tvl: Decimal) -> Decimal {
    let apy_part = if max_apy > Decimal::ZERO { opportunity.supply_apy / max_apy } else { Decimal::ZERO };
    let tvl_part = if max_tvl > Decimal::ZERO { opportunity.tvl / max_tvl } else { Decimal::ZERO };
    apy_part * dec!(0.4) + tvl_part * dec!(0.6)
}

/// Whole-percent template for `slots` protocols; the rounding difference lands on slot 0
pub fn allocation_percentages(level: RiskLevel, slots: usize) -> Vec<Decimal> {
    let picked: Vec<Decimal> = template(level).iter().take(slots).map(|p| Decimal::from(*p)).collect();
    let total: Decimal = picked.iter().sum();
    if total.is_zero() || total == Decimal::ONE_HUNDRED {
        return picked;
    }
    let mut scaled: Vec<Decimal> = picked
        .iter()
        .map(|p| (p / total * Decimal::ONE_HUNDRED).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .collect();
    let diff = Decimal::ONE_HUNDRED - scaled.iter().sum::<Decimal>();
    scaled[0] += diff;
    scaled
}

/// Top three markets ordered by the risk level's preference, weighted by its template
pub fn dynamic_allocation(opportunities: &[ChainOpportunity], level: RiskLevel) -> Vec<ProtocolAllocation> {
    if opportunities.is_empty() {
        return Vec::new();
    }
    let mut sorted: Vec<&ChainOpportunity> = opportunities.iter().collect();
    match level {
        RiskLevel::Conservative => sorted.sort_by(|a, b| b.tvl.cmp(&a.tvl)),
        RiskLevel::Aggressive => sorted.sort_by(|a, b| b.supply_apy.cmp(&a.supply_apy)),
        RiskLevel::Moderate => {
            let max_apy = opportunities.iter().map(|o| o.supply_apy).max().unwrap_or_default();
            let max_tvl = opportunities.iter().map(|o| o.tvl).max().unwrap_or_default();
            sorted.sort_by(|a, b| balanced_score(b, max_apy, max_tvl).cmp(&balanced_score(a, max_apy, max_tvl)));
        }
    }

    let percentages = allocation_percentages(level, sorted.len());
    sorted
        .into_iter()
        .zip(percentages)
        .enumerate()
        .map(|(slot, (opportunity, percentage))| ProtocolAllocation {
            protocol: opportunity.protocol,
            percentage,
            expected_apy: opportunity.supply_apy,
            tvl: opportunity.tvl,
            rationale: rationale(level, slot).to_string(),
        })
        .collect()
}

/// Picks the chain with the best gas-adjusted yield and an allocation across its protocols
pub struct MultiChainOptimizer {
    aggregator: Arc<YieldAggregator>,
    gas: Arc<dyn GasPriceSource>,
    config: MultiChainConfig,
}

impl MultiChainOptimizer {
    pub fn new(aggregator: Arc<YieldAggregator>, gas: Arc<dyn GasPriceSource>, config: MultiChainConfig) -> Self {
        Self { aggregator, gas, config }
    }

    /// Every supported chain in parallel; chains that fail, time out or have
    /// nothing on offer are left out of the comparison
    #[instrument(skip(self))]
    pub async fn optimize_across_chains(
        &self,
        token: &str,
        risk_level: RiskLevel,
        position_usd: Option<Decimal>,
        hold_period_days: Option<u32>,
    ) -> Result<MultiChainResult> {
        let position_usd = position_usd.unwrap_or(self.config.default_position_usd);
        let hold_period_days = hold_period_days.unwrap_or(self.config.hold_period_days);
        if position_usd <= Decimal::ZERO {
            return Err(YieldError::Config(format!("position size must be positive, got {position_usd}")));
        }
        if hold_period_days == 0 {
            return Err(YieldError::Config("hold period must be at least one day".to_string()));
        }

        let branches = SUPPORTED_CHAINS.iter().map(|&chain_id| async move {
            let branch = self.chain_result(token, chain_id, risk_level, position_usd, hold_period_days);
            match tokio::time::timeout(self.config.fetch_timeout, branch).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!(chain_id, err = %e, "Chain dropped from comparison");
                    None
                }
                Err(_) => {
                    warn!(chain_id, timeout = ?self.config.fetch_timeout, "Chain timed out");
                    None
                }
            }
        });
        let mut results: Vec<ChainResult> = join_all(branches).await.into_iter().flatten().collect();

        let Some(best_index) = best_chain(&results) else {
            return Err(YieldError::NoOpportunities(format!(
                "No opportunities found for {token} on any supported chain"
            )));
        };
        for (index, result) in results.iter_mut().enumerate() {
            result.is_recommended = index == best_index;
        }
        let best = results[best_index].clone();

        let target = target_apy(risk_level);
        let confidence = chain_confidence(&best, target, position_usd);
        let gas_estimate = ChainGasSummary {
            gas_price_gwei: best.opportunities.first().map(|o| o.gas_price_gwei).unwrap_or_default(),
            deposit_usd: round_2dp(best.opportunities.iter().map(|o| o.deposit_gas_cost_usd).sum()),
            withdraw_usd: round_2dp(best.opportunities.iter().map(|o| o.withdraw_gas_cost_usd).sum()),
            total_usd: best.total_gas_cost_usd,
        };
        info!(
            token,
            best_chain = best.chain_id,
            net_apy = %best.net_apy,
            chains = results.len(),
            confidence,
            "Cross-chain optimization complete"
        );

        Ok(MultiChainResult {
            token: token.to_string(),
            risk_level,
            position_usd,
            hold_period_days,
            best_chain_id: best.chain_id,
            best_chain_name: best.chain_name.clone(),
            allocation: best.allocation.clone(),
            expected_blended_apy: best.blended_apy,
            target_apy_range: target,
            gas_estimate,
            net_apy: best.net_apy,
            all_chain_results: results,
            confidence,
            timestamp: Utc::now(),
        })
    }

    /// One chain's markets with gas attached, under the moderate profile
    pub async fn get_chain_opportunities(&self, token: &str, chain_id: u64) -> Vec<ChainOpportunity> {
        let result = self
            .chain_result(
                token,
                chain_id,
                RiskLevel::Moderate,
                self.config.default_position_usd,
                self.config.hold_period_days,
            )
            .await;
        match result {
            Ok(Some(chain)) => chain.opportunities,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(chain_id, err = %e, "Chain opportunities unavailable");
                Vec::new()
            }
        }
    }

    async fn chain_result(
        &self,
        token: &str,
        chain_id: u64,
        risk_level: RiskLevel,
        position_usd: Decimal,
        hold_period_days: u32,
    ) -> Result<Option<ChainResult>> {
        let (aggregated, gas_price) = tokio::join!(
            self.aggregator.fetch_all_opportunities(token, chain_id, None),
            self.gas.gas_price_or_fallback(chain_id),
        );
        if aggregated.opportunities.is_empty() {
            debug!(chain_id, token, "No opportunities on chain");
            return Ok(None);
        }

        let gas_price_gwei = u256_to_decimal(gas_price)? / GWEI_PER_ETH;
        let native_price = native_price_usd(chain_id);
        let name = chain_name(chain_id);

        let opportunities: Vec<ChainOpportunity> = aggregated
            .opportunities
            .iter()
            .map(|o| {
                let (withdraw_units, deposit_units) = protocol_gas_units(o.protocol);
                let deposit_eth = Decimal::from(deposit_units) * gas_price_gwei / GWEI_PER_ETH;
                let withdraw_eth = Decimal::from(withdraw_units) * gas_price_gwei / GWEI_PER_ETH;
                ChainOpportunity {
                    chain_id,
                    chain_name: name.to_string(),
                    protocol: o.protocol,
                    supply_apy: o.supply_apy,
                    tvl: o.tvl,
                    liquidity: o.liquidity,
                    gas_price_gwei,
                    deposit_gas_cost_usd: round_2dp(deposit_eth * native_price),
                    withdraw_gas_cost_usd: round_2dp(withdraw_eth * native_price),
                    total_gas_cost_usd: round_2dp((deposit_eth + withdraw_eth) * native_price),
                }
            })
            .collect();

        let eligible: Vec<ChainOpportunity> = opportunities
            .iter()
            .filter(|o| o.tvl >= self.config.min_protocol_tvl)
            .cloned()
            .collect();
        let allocation = dynamic_allocation(&eligible, risk_level);

        let blended_apy: Decimal = allocation.iter().map(|a| a.expected_apy * a.percentage / dec!(100)).sum();
        let total_gas: Decimal = allocation
            .iter()
            .filter_map(|a| {
                let opportunity = opportunities.iter().find(|o| o.protocol == a.protocol)?;
                Some(opportunity.total_gas_cost_usd * a.percentage / dec!(100))
            })
            .sum();

        // One-time round trip spread over the hold period, then annualized
        let annualized_gas = total_gas / Decimal::from(hold_period_days) * dec!(365);
        let gas_as_apy = annualized_gas / position_usd * dec!(100);
        let net_apy = (blended_apy - gas_as_apy).max(Decimal::ZERO);

        debug!(chain_id, %blended_apy, %total_gas, %net_apy, "Chain evaluated");
        Ok(Some(ChainResult {
            chain_id,
            chain_name: name.to_string(),
            opportunities,
            allocation,
            blended_apy: round_2dp(blended_apy),
            total_gas_cost_usd: round_2dp(total_gas),
            net_apy: round_2dp(net_apy),
            is_recommended: false,
        }))
    }
}

/// Highest net APY; the earliest chain wins ties
fn best_chain(results: &[ChainResult]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, result) in results.iter().enumerate() {
        if best.is_none_or(|b| result.net_apy > results[b].net_apy) {
            best = Some(index);
        }
    }
    best
}

fn chain_confidence(result: &ChainResult, target: ApyRange, position_usd: Decimal) -> u8 {
    let mut confidence = dec!(50);

    if result.net_apy >= target.min && result.net_apy <= target.max {
        confidence += dec!(20);
    } else if result.net_apy >= target.min * dec!(0.8) {
        confidence += dec!(10);
    }

    if !result.opportunities.is_empty() {
        let total_tvl: Decimal = result.opportunities.iter().map(|o| o.tvl).sum();
        let avg_tvl = total_tvl / Decimal::from(result.opportunities.len());
        if avg_tvl > dec!(1000000000) {
            confidence += dec!(15);
        } else if avg_tvl > dec!(100000000) {
            confidence += dec!(10);
        }
    }

    let gas_share = result.total_gas_cost_usd / position_usd * dec!(100);
    if gas_share < dec!(0.1) {
        confidence += dec!(10);
    } else if gas_share > dec!(1) {
        confidence -= dec!(10);
    }
    clamp_confidence(confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::mock::MockAdapter;
    use crate::types::Protocol;
    use proptest::prelude::*;

    fn chain_opportunity(protocol: Protocol, apy: Decimal, tvl: Decimal) -> ChainOpportunity {
        ChainOpportunity {
            chain_id: ETHEREUM,
            chain_name: "Ethereum".to_string(),
            protocol,
            supply_apy: apy,
            tvl,
            liquidity: tvl,
            gas_price_gwei: dec!(30),
            deposit_gas_cost_usd: Decimal::ZERO,
            withdraw_gas_cost_usd: Decimal::ZERO,
            total_gas_cost_usd: Decimal::ZERO,
        }
    }

    #[test]
    fn aggressive_concentrates_on_highest_apy() {
        let list = vec![
            chain_opportunity(Protocol::Aave, dec!(4), dec!(2000000000)),
            chain_opportunity(Protocol::Morpho, dec!(7), dec!(100000000)),
            chain_opportunity(Protocol::Compound, dec!(5), dec!(800000000)),
        ];
        let allocation = dynamic_allocation(&list, RiskLevel::Aggressive);
        let split: Vec<(Protocol, Decimal)> = allocation.iter().map(|a| (a.protocol, a.percentage)).collect();
        assert_eq!(
            split,
            vec![(Protocol::Morpho, dec!(70)), (Protocol::Compound, dec!(25)), (Protocol::Aave, dec!(5))]
        );
        assert_eq!(allocation[0].rationale, "Maximum yield - highest APY protocol");

        let conservative = dynamic_allocation(&list, RiskLevel::Conservative);
        assert_eq!(conservative[0].protocol, Protocol::Aave);
    }

    #[test]
    fn short_templates_renormalize_to_one_hundred() {
        assert_eq!(allocation_percentages(RiskLevel::Conservative, 2), vec![dec!(65), dec!(35)]);
        assert_eq!(allocation_percentages(RiskLevel::Moderate, 2), vec![dec!(53), dec!(47)]);
        assert_eq!(allocation_percentages(RiskLevel::Aggressive, 1), vec![dec!(100)]);
        assert!(allocation_percentages(RiskLevel::Moderate, 0).is_empty());
    }

    #[test]
    fn native_prices_and_names() {
        assert_eq!(native_price_usd(POLYGON), dec!(0.85));
        assert_eq!(native_price_usd(SEPOLIA), Decimal::ZERO);
        assert_eq!(chain_name(ARBITRUM), "Arbitrum");
    }

    proptest! {
        #[test]
        fn allocation_always_sums_to_one_hundred(
            level in prop_oneof![Just(RiskLevel::Conservative), Just(RiskLevel::Moderate), Just(RiskLevel::Aggressive)],
            markets in prop::collection::vec((1u32..2000, 1u64..3_000_000_000), 1..6),
        ) {
            let list: Vec<ChainOpportunity> = markets
                .iter()
                .enumerate()
                .map(|(i, (bp, tvl))| chain_opportunity(Protocol::ALL[i % 3], Decimal::new(*bp as i64, 2), Decimal::from(*tvl)))
                .collect();
            let allocation = dynamic_allocation(&list, level);
            prop_assert_eq!(allocation.len(), list.len().min(3));
            let total: Decimal = allocation.iter().map(|a| a.percentage).sum();
            prop_assert_eq!(total, dec!(100));
        }
    }

    struct FixedGas;

    #[async_trait::async_trait]
    impl GasPriceSource for FixedGas {
        async fn gas_price_or_fallback(&self, chain_id: u64) -> ethers::types::U256 {
            crate::rpc::fallback_gas_price(chain_id)
        }
    }

    fn optimizer(adapters: Vec<MockAdapter>) -> MultiChainOptimizer {
        let cache = Arc::new(crate::cache::TtlCache::default());
        let adapters: Vec<Arc<dyn crate::protocols::ProtocolAdapter>> = adapters
            .into_iter()
            .map(|m| Arc::new(m) as Arc<dyn crate::protocols::ProtocolAdapter>)
            .collect();
        let aggregator = Arc::new(YieldAggregator::new(adapters, cache, Default::default()));
        MultiChainOptimizer::new(aggregator, Arc::new(FixedGas), MultiChainConfig::default())
    }

    #[tokio::test]
    async fn cheap_gas_chain_wins_on_net_apy() {
        let opt = optimizer(vec![
            MockAdapter::new(Protocol::Aave).with_market("USDC", ETHEREUM, dec!(5), dec!(1000000000)),
            MockAdapter::new(Protocol::Compound).with_market("USDC", ETHEREUM, dec!(4), dec!(500000000)),
            MockAdapter::new(Protocol::Morpho).with_market("USDC", BASE, dec!(4.5), dec!(200000000)),
        ]);
        let result = opt.optimize_across_chains("USDC", RiskLevel::Moderate, None, None).await.unwrap();

        assert_eq!(result.best_chain_id, BASE);
        assert_eq!(result.net_apy, dec!(4.50));
        assert_eq!(result.confidence, 90);
        assert_eq!(result.all_chain_results.len(), 2);
        assert_eq!(result.all_chain_results.iter().filter(|c| c.is_recommended).count(), 1);

        let mainnet = result.all_chain_results.iter().find(|c| c.chain_id == ETHEREUM).unwrap();
        assert_eq!(mainnet.blended_apy, dec!(4.53));
        assert_eq!(mainnet.total_gas_cost_usd, dec!(36.27));
        assert_eq!(mainnet.net_apy, dec!(0.12));
        let split: Vec<Decimal> = mainnet.allocation.iter().map(|a| a.percentage).collect();
        assert_eq!(split, vec![dec!(53), dec!(47)]);
    }

    #[tokio::test]
    async fn no_chain_with_markets_is_an_error() {
        let opt = optimizer(vec![MockAdapter::new(Protocol::Aave).with_market("USDC", ETHEREUM, dec!(5), dec!(1))]);
        let err = opt.optimize_across_chains("DAI", RiskLevel::Aggressive, None, None).await.unwrap_err();
        assert_eq!(err.to_string(), "No opportunities found for DAI on any supported chain");

        let bad = opt.optimize_across_chains("USDC", RiskLevel::Aggressive, Some(Decimal::ZERO), None).await;
        assert!(matches!(bad, Err(YieldError::Config(_))));
    }

    #[tokio::test]
    async fn failing_chain_is_dropped_and_small_markets_get_no_allocation() {
        let opt = optimizer(vec![
            MockAdapter::new(Protocol::Aave).with_market("USDC", ARBITRUM, dec!(6), dec!(900000000)).failing("rpc down"),
            MockAdapter::new(Protocol::Compound).with_market("USDC", POLYGON, dec!(5), dec!(300000000)),
            MockAdapter::new(Protocol::Morpho).with_market("USDC", POLYGON, dec!(9), dec!(1000)),
        ]);
        let result = opt.optimize_across_chains("USDC", RiskLevel::Aggressive, None, None).await.unwrap();
        assert_eq!(result.best_chain_id, POLYGON);
        assert_eq!(result.all_chain_results.len(), 1);
        assert_eq!(result.all_chain_results[0].opportunities.len(), 2);
        assert_eq!(result.allocation.len(), 1);
        assert_eq!(result.allocation[0].protocol, Protocol::Compound);
        assert_eq!(result.allocation[0].percentage, dec!(100));

        let listed = opt.get_chain_opportunities("USDC", POLYGON).await;
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|o| o.gas_price_gwei == dec!(50)));
    }
}
