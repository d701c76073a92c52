use rust_decimal::prelude::*;
use rust_decimal::{Decimal, dec};

use crate::formatting::{round_2dp, round_to};
use crate::optimizer::types::{GasEstimate, OptimizationInput, StrategyKind};
use crate::types::{Protocol, RiskProfile, YieldOpportunity};

use super::{OptimizationStrategy, clamp_confidence, contested_best, filter_for_profile, sort_by_apy_desc};

pub const DEFAULT_GAS_PRICE_GWEI: Decimal = dec!(30);
pub const DEFAULT_ETH_PRICE_USD: Decimal = dec!(3000);
pub const APPROVAL_GAS: u64 = 65_000;
/// Longest payback a switch may take
pub const MAX_BREAK_EVEN_DAYS: f64 = 90.0;

/// (withdraw, deposit) gas units
pub fn protocol_gas_units(protocol: Protocol) -> (u64, u64) {
    match protocol {
        Protocol::Aave => (200_000, 250_000),
        Protocol::Compound => (150_000, 200_000),
        Protocol::Morpho => (180_000, 220_000),
    }
}

/// Days of extra yield needed to pay `gas_cost_usd` back; infinite when there is no gain
pub fn break_even_days(apy_delta: Decimal, position_usd: Decimal, gas_cost_usd: Decimal) -> f64 {
    if apy_delta <= Decimal::ZERO || position_usd <= Decimal::ZERO {
        return f64::INFINITY;
    }
    let daily_gain = apy_delta / dec!(365) / dec!(100) * position_usd;
    if daily_gain <= Decimal::ZERO {
        return f64::INFINITY;
    }
    (gas_cost_usd / daily_gain).to_f64().unwrap_or(f64::INFINITY)
}

/// Extra yield over 30 days minus the cost of getting there
pub fn thirty_day_net_gain(apy_delta: Decimal, position_usd: Decimal, gas_cost_usd: Decimal) -> Decimal {
    apy_delta / dec!(100) * position_usd * dec!(30) / dec!(365) - gas_cost_usd
}

/// Same ranking as highest-yield; switching cost only matters for the decision
#[derive(Debug, Clone, Copy, Default)]
pub struct GasAwareStrategy;

impl GasAwareStrategy {
    /// Withdraw from `from`, approve, deposit into `to`
    pub fn estimate_gas_cost(
        &self,
        from: Protocol,
        to: Protocol,
        gas_price_gwei: Option<Decimal>,
        eth_price_usd: Option<Decimal>,
    ) -> GasEstimate {
        let gas_price_gwei = gas_price_gwei.unwrap_or(DEFAULT_GAS_PRICE_GWEI);
        let eth_price_usd = eth_price_usd.unwrap_or(DEFAULT_ETH_PRICE_USD);
        let (withdraw, _) = protocol_gas_units(from);
        let (_, deposit) = protocol_gas_units(to);
        let gas_units = withdraw + APPROVAL_GAS + deposit;

        let price_wei = (gas_price_gwei * dec!(1000000000)).floor();
        let cost_eth = Decimal::from(gas_units) * price_wei / dec!(1000000000000000000);
        GasEstimate {
            gas_units,
            gas_price_gwei,
            gas_cost_eth: round_to(cost_eth, 6),
            gas_cost_usd: round_2dp(cost_eth * eth_price_usd),
            estimated_time_minutes: 5,
        }
    }
}

impl OptimizationStrategy for GasAwareStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::GasAware
    }

    fn rank_opportunities(&self, opportunities: &[YieldOpportunity], profile: &RiskProfile) -> Vec<YieldOpportunity> {
        let mut ranked = filter_for_profile(opportunities, profile, profile.min_protocol_tvl);
        sort_by_apy_desc(&mut ranked);
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
        let config = input.rebalance_config;
        if apy_delta < config.min_apy_delta {
            return false;
        }

        let gas = self.estimate_gas_cost(current.protocol, best.protocol, input.gas_price_gwei, input.eth_price_usd);
        if gas.gas_cost_usd > config.max_gas_cost_usd {
            return false;
        }
        if break_even_days(apy_delta, current.value_usd, gas.gas_cost_usd) > MAX_BREAK_EVEN_DAYS {
            return false;
        }
        thirty_day_net_gain(apy_delta, current.value_usd, gas.gas_cost_usd) >= config.min_gain_threshold
    }

    fn calculate_confidence(&self, input: &OptimizationInput<'_>, recommended: &YieldOpportunity) -> u8 {
        let mut confidence = dec!(50);
        let Some(current) = input.current_position else {
            if recommended.supply_apy >= dec!(5) {
                confidence += dec!(20);
            } else if recommended.supply_apy >= dec!(3) {
                confidence += dec!(10);
            }
            return clamp_confidence(confidence);
        };

        let gas = self.estimate_gas_cost(
            current.protocol,
            recommended.protocol,
            input.gas_price_gwei,
            input.eth_price_usd,
        );
        let apy_delta = recommended.supply_apy - current.apy;
        let days = break_even_days(apy_delta, current.value_usd, gas.gas_cost_usd);

        confidence += if days <= 7.0 {
            dec!(30)
        } else if days <= 14.0 {
            dec!(20)
        } else if days <= 30.0 {
            dec!(10)
        } else if days <= 60.0 {
            Decimal::ZERO
        } else {
            dec!(-15)
        };

        // An empty position makes gas infinitely significant
        let gas_share = if current.value_usd > Decimal::ZERO {
            Some(gas.gas_cost_usd / current.value_usd * dec!(100))
        } else {
            None
        };
        confidence += match gas_share {
            Some(share) if share < dec!(0.1) => dec!(15),
            Some(share) if share < dec!(0.5) => dec!(10),
            Some(share) if share < dec!(1) => dec!(5),
            _ => dec!(-10),
        };

        if apy_delta >= dec!(2) {
            confidence += dec!(10);
        } else if apy_delta >= dec!(1) {
            confidence += dec!(5);
        }
        clamp_confidence(confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::mock::{opportunity, position};
    use crate::types::RebalanceConfig;

    #[test]
    fn round_trip_gas_uses_both_tables() {
        let estimate = GasAwareStrategy.estimate_gas_cost(Protocol::Aave, Protocol::Compound, None, None);
        // 200k + 65k + 200k at 30 gwei
        assert_eq!(estimate.gas_units, 465_000);
        assert_eq!(estimate.gas_cost_eth, dec!(0.01395));
        assert_eq!(estimate.gas_cost_usd, dec!(41.85));
        assert_eq!(estimate.estimated_time_minutes, 5);
    }

    #[test]
    fn break_even_is_infinite_without_gain() {
        assert!(break_even_days(Decimal::ZERO, dec!(1000), dec!(5)).is_infinite());
        assert!(break_even_days(dec!(-1), dec!(1000), dec!(5)).is_infinite());
        assert!(break_even_days(dec!(1), Decimal::ZERO, dec!(5)).is_infinite());
        let days = break_even_days(dec!(2), dec!(10000), dec!(30));
        assert!(days > 54.0 && days < 55.0);
    }

    #[test]
    fn expensive_or_slow_switches_are_rejected() {
        let list = vec![opportunity(Protocol::Compound, "USDC", 1, dec!(6), dec!(500000000))];
        let profile = RiskProfile::default();
        let config = RebalanceConfig::default();
        let small = position(Protocol::Aave, "USDC", 1, dec!(5000), dec!(4));
        let input = OptimizationInput {
            current_position: Some(&small),
            opportunities: &list,
            risk_profile: &profile,
            rebalance_config: &config,
            gas_price_gwei: Some(dec!(5)),
            eth_price_usd: None,
        };
        // ~$7 of gas; 30 days at 2pp on $5k is ~$8.2, net ~$1.2 below the $10 threshold
        assert!(!GasAwareStrategy.should_rebalance(&input));

        let large = position(Protocol::Aave, "USDC", 1, dec!(100000), dec!(4));
        assert!(GasAwareStrategy.should_rebalance(&OptimizationInput { current_position: Some(&large), ..input }));

        // 300 gwei puts the round trip well over $50
        assert!(!GasAwareStrategy.should_rebalance(&OptimizationInput {
            current_position: Some(&large),
            gas_price_gwei: Some(dec!(300)),
            ..input
        }));
    }

    #[test]
    fn confidence_tracks_payback_and_gas_share() {
        let list = vec![opportunity(Protocol::Compound, "USDC", 1, dec!(6), dec!(500000000))];
        let profile = RiskProfile::default();
        let config = RebalanceConfig::default();
        let whale = position(Protocol::Aave, "USDC", 1, dec!(1000000), dec!(4));
        let input = OptimizationInput {
            current_position: Some(&whale),
            opportunities: &list,
            risk_profile: &profile,
            rebalance_config: &config,
            gas_price_gwei: None,
            eth_price_usd: None,
        };
        // payback under a day (+30), gas far below 0.1% (+15), delta 2 (+10)
        assert_eq!(GasAwareStrategy.calculate_confidence(&input, &list[0]), 100);

        let fresh = OptimizationInput { current_position: None, ..input };
        assert_eq!(GasAwareStrategy.calculate_confidence(&fresh, &list[0]), 70);
    }
}
