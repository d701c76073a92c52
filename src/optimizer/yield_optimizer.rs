use std::sync::Arc;

use chrono::Utc;
use ethers::types::Address;
use rust_decimal::{Decimal, dec};
use tracing::{debug, info, instrument};

use crate::aggregator::YieldAggregator;
use crate::cache::{TtlCache, cache_key};
use crate::error::{Result, YieldError};
use crate::formatting::{estimated_gain, round_2dp, round_to};
use crate::types::{
    OptimizationAction, ProtocolPosition, RebalanceConfig, RiskLevel, RiskProfile, YieldOpportunity,
};

use super::strategies::gas_aware::{GasAwareStrategy, break_even_days, thirty_day_net_gain};
use super::strategies::OptimizationStrategy;
use super::types::{OptimizationInput, OptimizationResult, OptimizerConfig, PositionComparison, StrategyKind};

const CACHE_PREFIX: &str = "optimizer";
/// Gain figures keep a 30-day horizon
const GAIN_HORIZON_DAYS: u32 = 30;

/// One recommendation for one wallet, token and chain
pub struct YieldOptimizer {
    aggregator: Arc<YieldAggregator>,
    cache: Arc<TtlCache>,
    config: OptimizerConfig,
}

impl YieldOptimizer {
    pub fn new(aggregator: Arc<YieldAggregator>, cache: Arc<TtlCache>, config: OptimizerConfig) -> Self {
        Self { aggregator, cache, config }
    }

    pub fn aggregator(&self) -> &Arc<YieldAggregator> {
        &self.aggregator
    }

    /// Hold or rebalance for the wallet's current stake in `token`.
    ///
    /// Fails when no enabled protocol lists the token on the chain; an
    /// empty market is otherwise a `Hold` with a reason.
    #[instrument(skip(self, risk_profile))]
    pub async fn optimize_position(
        &self,
        wallet: Address,
        token: &str,
        chain_id: u64,
        risk_profile: Option<RiskProfile>,
        strategy: Option<StrategyKind>,
    ) -> Result<OptimizationResult> {
        let profile = risk_profile.unwrap_or_else(|| self.config.default_risk_profile.clone());
        profile.validate()?;
        let kind = strategy.unwrap_or(self.config.default_strategy);

        let key = cache_key(&[
            CACHE_PREFIX,
            "optimize",
            &format!("{wallet:?}"),
            token,
            &chain_id.to_string(),
            kind.as_str(),
            profile.level.as_str(),
        ]);
        if let Some(cached) = self.cache.get::<OptimizationResult>(&key).await {
            return Ok(cached);
        }

        if !self.aggregator.supports_token(token, chain_id) {
            return Err(YieldError::NoOpportunities(format!(
                "No enabled protocol supports {token} on chain {chain_id}"
            )));
        }

        let tokens = [token];
        let (positions, opportunities) = tokio::join!(
            self.aggregator.get_all_positions(wallet, chain_id, Some(&tokens[..])),
            self.aggregator.fetch_all_opportunities(token, chain_id, None),
        );
        let current = positions.positions.iter().find(|p| p.token.eq_ignore_ascii_case(token));

        let rebalance_config = profile
            .rebalance_config
            .clone()
            .unwrap_or_else(|| self.config.default_rebalance_config.clone());
        let input = OptimizationInput {
            current_position: current,
            opportunities: &opportunities.opportunities,
            risk_profile: &profile,
            rebalance_config: &rebalance_config,
            gas_price_gwei: None,
            eth_price_usd: None,
        };

        let result = build_result(kind.strategy(), &input);
        info!(
            %kind,
            action = ?result.action,
            recommended = ?result.recommended_protocol,
            confidence = result.confidence,
            "Position optimized"
        );
        self.cache.set(key, result.clone(), Some(self.config.cache_ttl)).await;
        Ok(result)
    }

    /// `position` against the best live opportunity; `None` when nothing is on offer
    pub async fn compare_position(
        &self,
        position: &ProtocolPosition,
        token: &str,
        chain_id: u64,
    ) -> Option<PositionComparison> {
        let result = self.aggregator.fetch_all_opportunities(token, chain_id, None).await;
        let best = result.best?;

        let apy_delta = best.supply_apy - position.apy;
        let apy_improvement_percent = if position.apy > Decimal::ZERO {
            round_to(apy_delta / position.apy * dec!(100), 1)
        } else {
            Decimal::ZERO
        };
        let annual = estimated_gain(position.value_usd, apy_delta, GAIN_HORIZON_DAYS);
        Some(PositionComparison {
            current_protocol: position.protocol,
            recommended_protocol: best.protocol,
            current_apy: position.apy,
            recommended_apy: best.supply_apy,
            apy_delta: round_2dp(apy_delta),
            apy_improvement_percent,
            estimated_annual_gain_usd: annual,
            estimated_monthly_gain_usd: round_2dp(annual / dec!(12)),
        })
    }

    /// Gas-aware verdict for a known position, always under the default profile
    #[instrument(skip(self, position, rebalance_config), fields(protocol = %position.protocol))]
    pub async fn get_rebalance_recommendation(
        &self,
        position: &ProtocolPosition,
        token: &str,
        chain_id: u64,
        rebalance_config: Option<RebalanceConfig>,
        gas_price_gwei: Option<Decimal>,
        eth_price_usd: Option<Decimal>,
    ) -> OptimizationResult {
        let rebalance_config = rebalance_config.unwrap_or_else(|| self.config.default_rebalance_config.clone());
        let profile = &self.config.default_risk_profile;
        let opportunities = self.aggregator.fetch_all_opportunities(token, chain_id, None).await;

        let input = OptimizationInput {
            current_position: Some(position),
            opportunities: &opportunities.opportunities,
            risk_profile: profile,
            rebalance_config: &rebalance_config,
            gas_price_gwei,
            eth_price_usd,
        };
        build_result(StrategyKind::GasAware.strategy(), &input)
    }

    pub fn is_rebalance_worth_it(
        &self,
        current_apy: Decimal,
        new_apy: Decimal,
        position_usd: Decimal,
        gas_cost_usd: Decimal,
        config: Option<&RebalanceConfig>,
    ) -> bool {
        let config = config.unwrap_or(&self.config.default_rebalance_config);
        is_rebalance_worth_it(current_apy, new_apy, position_usd, gas_cost_usd, config)
    }

    pub fn estimate_break_even_days(&self, apy_delta: Decimal, position_usd: Decimal, gas_cost_usd: Decimal) -> f64 {
        estimate_break_even_days(apy_delta, position_usd, gas_cost_usd)
    }

    pub async fn get_best_opportunity(&self, token: &str, chain_id: u64) -> Option<YieldOpportunity> {
        self.aggregator.get_best_opportunity(token, chain_id).await
    }

    pub fn available_strategies(&self) -> Vec<StrategyKind> {
        StrategyKind::ALL.to_vec()
    }

    pub async fn clear_cache(&self) {
        self.aggregator.clear_cache().await;
        for key in self.cache.keys() {
            if key.starts_with(CACHE_PREFIX) {
                self.cache.delete(&key).await;
            }
        }
    }
}

/// Switch only past the APY delta, under the gas ceiling and with
/// 30-day net gain above the threshold
pub fn is_rebalance_worth_it(
    current_apy: Decimal,
    new_apy: Decimal,
    position_usd: Decimal,
    gas_cost_usd: Decimal,
    config: &RebalanceConfig,
) -> bool {
    if !config.enabled {
        return false;
    }
    let apy_delta = new_apy - current_apy;
    if apy_delta < config.min_apy_delta || gas_cost_usd > config.max_gas_cost_usd {
        return false;
    }
    thirty_day_net_gain(apy_delta, position_usd, gas_cost_usd) >= config.min_gain_threshold
}

/// Whole days to pay back `gas_cost_usd`; `f64::INFINITY` without a gain
pub fn estimate_break_even_days(apy_delta: Decimal, position_usd: Decimal, gas_cost_usd: Decimal) -> f64 {
    break_even_days(apy_delta, position_usd, gas_cost_usd).ceil()
}

fn hold_reason(input: &OptimizationInput<'_>, recommended: Option<&YieldOpportunity>, apy_delta: Decimal) -> String {
    let min_delta = input.rebalance_config.min_apy_delta;
    match (input.current_position, recommended) {
        (None, _) => "No current position found".to_string(),
        (Some(_), None) => "No better opportunities available".to_string(),
        (Some(current), Some(best)) if current.protocol == best.protocol => "Already in the best protocol".to_string(),
        (Some(_), Some(_)) if apy_delta < min_delta => {
            format!("APY improvement ({apy_delta}%) below threshold ({min_delta}%)")
        }
        _ => "Rebalancing not recommended at this time".to_string(),
    }
}

fn warnings(profile: &RiskProfile, recommended: Option<&YieldOpportunity>) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Some(best) = recommended {
        if best.supply_apy > dec!(15) {
            warnings.push("High APY may indicate elevated risk".to_string());
        }
        if best.tvl < dec!(50000000) {
            warnings.push("Protocol has relatively low TVL".to_string());
        }
    }
    if profile.level == RiskLevel::Aggressive {
        warnings.push("Aggressive risk profile selected".to_string());
    }
    warnings
}

pub(crate) fn build_result(strategy: &dyn OptimizationStrategy, input: &OptimizationInput<'_>) -> OptimizationResult {
    let kind = strategy.kind();
    let ranked = strategy.rank_opportunities(input.opportunities, input.risk_profile);
    let action = if strategy.should_rebalance(input) {
        OptimizationAction::Rebalance
    } else {
        OptimizationAction::Hold
    };
    let recommended = ranked.first();
    let current = input.current_position;

    let (apy_delta, annual_gain) = match (current, recommended) {
        (Some(current), Some(best)) => {
            let delta = round_2dp(best.supply_apy - current.apy);
            (delta, estimated_gain(current.value_usd, delta, GAIN_HORIZON_DAYS))
        }
        _ => (Decimal::ZERO, Decimal::ZERO),
    };

    let reason = match (action, recommended) {
        (OptimizationAction::Rebalance, Some(best)) => {
            format!("Better yield available: {} offers {}% APY", best.protocol, best.supply_apy)
        }
        _ => hold_reason(input, recommended, apy_delta),
    };

    let (estimated_gas_cost, net_gain_after_gas) = match (kind, current, recommended) {
        (StrategyKind::GasAware, Some(current), Some(best)) => {
            let gas = GasAwareStrategy.estimate_gas_cost(
                current.protocol,
                best.protocol,
                input.gas_price_gwei,
                input.eth_price_usd,
            );
            (Some(gas.gas_cost_usd), Some(round_2dp(annual_gain - gas.gas_cost_usd)))
        }
        _ => (None, None),
    };

    let confidence = recommended.map(|best| strategy.calculate_confidence(input, best)).unwrap_or(0);
    debug!(%kind, ?action, %apy_delta, confidence, "Strategy evaluated");

    OptimizationResult {
        action,
        strategy: kind,
        current_protocol: current.map(|p| p.protocol),
        current_apy: current.map(|p| p.apy),
        recommended_protocol: recommended.map(|o| o.protocol),
        recommended_apy: recommended.map(|o| o.supply_apy),
        apy_delta,
        estimated_monthly_gain: round_2dp(annual_gain / dec!(12)),
        estimated_annual_gain: annual_gain,
        estimated_gas_cost,
        net_gain_after_gas,
        reason,
        warnings: warnings(input.risk_profile, recommended),
        confidence,
        ranked_opportunities: ranked.clone(),
        timestamp: Utc::now(),
    }
}
