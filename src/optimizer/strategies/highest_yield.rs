use rust_decimal::dec;

use crate::optimizer::types::{OptimizationInput, StrategyKind};
use crate::types::{RiskProfile, YieldOpportunity};

use super::{OptimizationStrategy, clamp_confidence, contested_best, filter_for_profile, sort_by_apy_desc};

/// Raw APY, nothing else
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestYieldStrategy;

impl OptimizationStrategy for HighestYieldStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HighestYield
    }

    fn rank_opportunities(&self, opportunities: &[YieldOpportunity], profile: &RiskProfile) -> Vec<YieldOpportunity> {
        let mut ranked = filter_for_profile(opportunities, profile, profile.min_protocol_tvl);
        sort_by_apy_desc(&mut ranked);
        ranked
    }

    fn should_rebalance(&self, input: &OptimizationInput<'_>) -> bool {
        let ranked = self.rank_opportunities(input.opportunities, input.risk_profile);
        match contested_best(input, &ranked) {
            Err(decision) => decision,
            Ok((_, apy_delta)) => apy_delta >= input.rebalance_config.min_apy_delta,
        }
    }

    fn calculate_confidence(&self, input: &OptimizationInput<'_>, recommended: &YieldOpportunity) -> u8 {
        let apy = recommended.supply_apy;
        let mut confidence = dec!(50);

        match input.current_position {
            // +20 per point of improvement, capped at 30
            Some(current) => confidence += ((apy - current.apy) * dec!(20)).min(dec!(30)),
            None => {
                if apy >= dec!(3) {
                    confidence += dec!(10);
                }
                if apy >= dec!(5) {
                    confidence += dec!(10);
                }
            }
        }

        if apy > dec!(20) {
            confidence -= dec!(20);
        } else if apy > dec!(15) {
            confidence -= dec!(10);
        }

        if recommended.tvl >= dec!(500000000) {
            confidence += dec!(10);
        }
        if recommended.tvl >= dec!(100000000) {
            confidence += dec!(5);
        }

        clamp_confidence(confidence)
    }
}
