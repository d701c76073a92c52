use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, YieldError};
use crate::types::{
    OptimizationAction, Protocol, ProtocolPosition, RebalanceConfig, RiskLevel, RiskProfile,
    YieldOpportunity,
};

pub const OPTIMIZER_CACHE_TTL: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    HighestYield,
    RiskAdjusted,
    GasAware,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [Self::HighestYield, Self::RiskAdjusted, Self::GasAware];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighestYield => "highest-yield",
            Self::RiskAdjusted => "risk-adjusted",
            Self::GasAware => "gas-aware",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = YieldError;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == value)
            .ok_or_else(|| YieldError::UnknownStrategy(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub default_strategy: StrategyKind,
    pub default_risk_profile: RiskProfile,
    pub default_rebalance_config: RebalanceConfig,
    pub cache_ttl: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::HighestYield,
            default_risk_profile: RiskProfile::default(),
            default_rebalance_config: RebalanceConfig::default(),
            cache_ttl: OPTIMIZER_CACHE_TTL,
        }
    }
}

/// Everything a strategy looks at when deciding
#[derive(Debug, Clone, Copy)]
pub struct OptimizationInput<'a> {
    pub current_position: Option<&'a ProtocolPosition>,
    pub opportunities: &'a [YieldOpportunity],
    pub risk_profile: &'a RiskProfile,
    pub rebalance_config: &'a RebalanceConfig,
    /// Falls back to 30 gwei
    pub gas_price_gwei: Option<Decimal>,
    /// Falls back to $3000
    pub eth_price_usd: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasEstimate {
    pub gas_units: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub gas_price_gwei: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub gas_cost_eth: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub gas_cost_usd: Decimal,
    pub estimated_time_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub action: OptimizationAction,
    pub strategy: StrategyKind,
    pub current_protocol: Option<Protocol>,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub current_apy: Option<Decimal>,
    pub recommended_protocol: Option<Protocol>,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub recommended_apy: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub apy_delta: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub estimated_monthly_gain: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub estimated_annual_gain: Decimal,
    /// Gas-aware strategy with a live position only
    #[serde(with = "rust_decimal::serde::str_option")]
    pub estimated_gas_cost: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub net_gain_after_gas: Option<Decimal>,
    pub reason: String,
    pub ranked_opportunities: Vec<YieldOpportunity>,
    /// 0..=100
    pub confidence: u8,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl OptimizationResult {
    pub fn should_rebalance(&self) -> bool {
        self.action == OptimizationAction::Rebalance
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionComparison {
    pub current_protocol: Protocol,
    pub recommended_protocol: Protocol,
    #[serde(with = "rust_decimal::serde::str")]
    pub current_apy: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub recommended_apy: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub apy_delta: Decimal,
    /// Relative improvement, 1 decimal
    #[serde(with = "rust_decimal::serde::str")]
    pub apy_improvement_percent: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub estimated_annual_gain_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub estimated_monthly_gain_usd: Decimal,
}

pub const DEFAULT_HOLD_PERIOD_DAYS: u32 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct MultiChainConfig {
    /// Amortization base when the caller gives no position size
    pub default_position_usd: Decimal,
    pub hold_period_days: u32,
    /// Markets below this never receive an allocation
    pub min_protocol_tvl: Decimal,
    pub fetch_timeout: Duration,
}

impl Default for MultiChainConfig {
    fn default() -> Self {
        Self {
            default_position_usd: Decimal::from(10_000),
            hold_period_days: DEFAULT_HOLD_PERIOD_DAYS,
            min_protocol_tvl: Decimal::from(10_000_000),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Target net APY band, percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApyRange {
    #[serde(with = "rust_decimal::serde::str")]
    pub min: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub max: Decimal,
}

/// One protocol's offer on one chain, with what it costs to get in and out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOpportunity {
    pub chain_id: u64,
    pub chain_name: String,
    pub protocol: Protocol,
    #[serde(with = "rust_decimal::serde::str")]
    pub supply_apy: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub tvl: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub gas_price_gwei: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub deposit_gas_cost_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub withdraw_gas_cost_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_gas_cost_usd: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolAllocation {
    pub protocol: Protocol,
    /// Whole percent; a set sums to 100
    #[serde(with = "rust_decimal::serde::str")]
    pub percentage: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub expected_apy: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub tvl: Decimal,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainResult {
    pub chain_id: u64,
    pub chain_name: String,
    pub opportunities: Vec<ChainOpportunity>,
    pub allocation: Vec<ProtocolAllocation>,
    #[serde(with = "rust_decimal::serde::str")]
    pub blended_apy: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_gas_cost_usd: Decimal,
    /// Blended APY less gas amortized over the hold period, floored at zero
    #[serde(with = "rust_decimal::serde::str")]
    pub net_apy: Decimal,
    pub is_recommended: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainGasSummary {
    #[serde(with = "rust_decimal::serde::str")]
    pub gas_price_gwei: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub deposit_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub withdraw_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_usd: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiChainResult {
    pub token: String,
    pub risk_level: RiskLevel,
    #[serde(with = "rust_decimal::serde::str")]
    pub position_usd: Decimal,
    pub hold_period_days: u32,
    pub best_chain_id: u64,
    pub best_chain_name: String,
    pub allocation: Vec<ProtocolAllocation>,
    #[serde(with = "rust_decimal::serde::str")]
    pub expected_blended_apy: Decimal,
    pub target_apy_range: ApyRange,
    pub gas_estimate: ChainGasSummary,
    #[serde(with = "rust_decimal::serde::str")]
    pub net_apy: Decimal,
    pub all_chain_results: Vec<ChainResult>,
    pub confidence: u8,
    pub timestamp: DateTime<Utc>,
}
