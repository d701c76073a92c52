use rust_decimal::{Decimal, dec};

use crate::optimizer::types::{OptimizationInput, StrategyKind};
use crate::types::{Protocol, RiskLevel, RiskProfile, YieldOpportunity};

use super::{OptimizationStrategy, clamp_confidence, contested_best, filter_for_profile};

/// Conservative profiles never see APYs above this
const CONSERVATIVE_MAX_APY: Decimal = dec!(15);

struct Weights {
    apy: Decimal,
    tvl: Decimal,
    health: Decimal,
}

fn weights(level: RiskLevel) -> Weights {
    match level {
        RiskLevel::Conservative => Weights { apy: dec!(0.3), tvl: dec!(0.5), health: dec!(0.2) },
        RiskLevel::Moderate => Weights { apy: dec!(0.45), tvl: dec!(0.35), health: dec!(0.2) },
        RiskLevel::Aggressive => Weights { apy: dec!(0.6), tvl: dec!(0.2), health: dec!(0.2) },
    }
}

/// Static stand-in for audit history and track record, 0..=100
pub fn trust_score(protocol: Protocol) -> u8 {
    match protocol {
        Protocol::Aave => 95,
        Protocol::Compound => 90,
        Protocol::Morpho => 85,
    }
}

/// The configured floor, raised to the level's own minimum
pub fn level_min_tvl(profile: &RiskProfile) -> Decimal {
    let floor = match profile.level {
        RiskLevel::Conservative => dec!(200000000),
        RiskLevel::Moderate => dec!(50000000),
        RiskLevel::Aggressive => dec!(10000000),
    };
    profile.min_protocol_tvl.max(floor)
}

fn tvl_score(tvl: Decimal) -> Decimal {
    if tvl >= dec!(1000000000) {
        dec!(100)
    } else if tvl >= dec!(500000000) {
        dec!(75)
    } else if tvl >= dec!(100000000) {
        dec!(50)
    } else if tvl >= dec!(10000000) {
        dec!(25)
    } else {
        dec!(10)
    }
}

/// Weighted blend of APY (saturating at 20%), TVL tier and protocol trust
pub fn risk_score(protocol: Protocol, apy: Decimal, tvl: Decimal, level: RiskLevel) -> Decimal {
    let w = weights(level);
    let apy_score = (apy / dec!(20)).min(Decimal::ONE) * dec!(100);
    apy_score * w.apy + tvl_score(tvl) * w.tvl + Decimal::from(trust_score(protocol)) * w.health
}

/// APY weighed against TVL and protocol trust, keyed by risk level
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskAdjustedStrategy;

impl OptimizationStrategy for RiskAdjustedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RiskAdjusted
    }

    fn rank_opportunities(&self, opportunities: &[YieldOpportunity], profile: &RiskProfile) -> Vec<YieldOpportunity> {
        let mut ranked = filter_for_profile(opportunities, profile, level_min_tvl(profile));
        if profile.level == RiskLevel::Conservative {
            ranked.retain(|o| o.supply_apy <= CONSERVATIVE_MAX_APY);
        }
        let score = |o: &YieldOpportunity| risk_score(o.protocol, o.supply_apy, o.tvl, profile.level);
        ranked.sort_by(|a, b| score(b).cmp(&score(a)));
        ranked
    }

    fn should_rebalance(&self, input: &OptimizationInput<'_>) -> bool {
        let ranked = self.rank_opportunities(input.opportunities, input.risk_profile);
        let (best, apy_delta) = match contested_best(input, &ranked) {
            Err(decision) => return decision,
            Ok(contested) => contested,
        };
        let Some(current) = input.current_position else {
            return false;
        };

        let mut min_delta = input.rebalance_config.min_apy_delta;
        match input.risk_profile.level {
            RiskLevel::Conservative => min_delta = min_delta.max(dec!(1.5)),
            RiskLevel::Moderate => min_delta = min_delta.max(Decimal::ONE),
            RiskLevel::Aggressive => {}
        }
        if trust_score(best.protocol) < trust_score(current.protocol) {
            min_delta += dec!(0.5);
        }
        apy_delta >= min_delta
    }

    fn calculate_confidence(&self, input: &OptimizationInput<'_>, recommended: &YieldOpportunity) -> u8 {
        let level = input.risk_profile.level;
        let mut confidence = dec!(50);

        if let Some(current) = input.current_position {
            // TVL of the current market is unknown here
            let recommended_score = risk_score(recommended.protocol, recommended.supply_apy, recommended.tvl, level);
            let current_score = risk_score(current.protocol, current.apy, Decimal::ZERO, level);
            confidence += (recommended_score - current_score).min(dec!(25));
        }

        confidence += match trust_score(recommended.protocol) {
            90.. => dec!(15),
            80.. => dec!(10),
            _ => dec!(5),
        };

        if recommended.tvl >= dec!(500000000) {
            confidence += dec!(10);
        } else if recommended.tvl >= dec!(100000000) {
            confidence += dec!(5);
        }

        if level == RiskLevel::Conservative && recommended.supply_apy > dec!(10) {
            confidence -= dec!(15);
        }
        clamp_confidence(confidence)
    }
}
