pub mod gas_aware;
pub mod highest_yield;
pub mod risk_adjusted;

use rust_decimal::Decimal;
use rust_decimal::prelude::*;

use crate::types::{RiskProfile, YieldOpportunity};

use super::types::{OptimizationInput, StrategyKind};

pub use gas_aware::GasAwareStrategy;
pub use highest_yield::HighestYieldStrategy;
pub use risk_adjusted::RiskAdjustedStrategy;

/// A ranking and rebalance policy over aggregator output
pub trait OptimizationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Best first, after allow/deny and TVL filtering
    fn rank_opportunities(&self, opportunities: &[YieldOpportunity], profile: &RiskProfile) -> Vec<YieldOpportunity>;

    fn should_rebalance(&self, input: &OptimizationInput<'_>) -> bool;

    /// 0..=100
    fn calculate_confidence(&self, input: &OptimizationInput<'_>, recommended: &YieldOpportunity) -> u8;
}

static HIGHEST_YIELD: HighestYieldStrategy = HighestYieldStrategy;
static RISK_ADJUSTED: RiskAdjustedStrategy = RiskAdjustedStrategy;
static GAS_AWARE: GasAwareStrategy = GasAwareStrategy;

impl StrategyKind {
    pub fn strategy(&self) -> &'static dyn OptimizationStrategy {
        match self {
            Self::HighestYield => &HIGHEST_YIELD,
            Self::RiskAdjusted => &RISK_ADJUSTED,
            Self::GasAware => &GAS_AWARE,
        }
    }
}

/// Allow/deny lists plus a TVL floor, order preserved
pub(crate) fn filter_for_profile(
    opportunities: &[YieldOpportunity],
    profile: &RiskProfile,
    min_tvl: Decimal,
) -> Vec<YieldOpportunity> {
    opportunities
        .iter()
        .filter(|o| profile.admits(o.protocol) && o.tvl >= min_tvl)
        .cloned()
        .collect()
}

pub(crate) fn sort_by_apy_desc(opportunities: &mut [YieldOpportunity]) {
    opportunities.sort_by(|a, b| b.supply_apy.cmp(&a.supply_apy));
}

/// The rebalance preamble every strategy shares.
///
/// `Err(decision)` short-circuits; `Ok((best, apy_delta))` hands the
/// contested case back to the strategy.
pub(crate) fn contested_best(
    input: &OptimizationInput<'_>,
    ranked: &[YieldOpportunity],
) -> std::result::Result<(YieldOpportunity, Decimal), bool> {
    if !input.rebalance_config.enabled {
        return Err(false);
    }
    let Some(current) = input.current_position else {
        return Err(!input.opportunities.is_empty());
    };
    let Some(best) = ranked.first() else {
        return Err(false);
    };
    if best.protocol == current.protocol {
        return Err(false);
    }
    Ok((best.clone(), best.supply_apy - current.apy))
}

pub(crate) fn clamp_confidence(confidence: Decimal) -> u8 {
    confidence
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
        .to_u8()
        .unwrap_or(0)
}
