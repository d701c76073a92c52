use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Protocol, ProtocolMetrics, ProtocolPosition, YieldOpportunity};

pub const AGGREGATOR_CACHE_TTL: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub protocols: Vec<Protocol>,
    pub exclude_protocols: Vec<Protocol>,
    /// Applied to every result, cached or not
    pub min_tvl: Option<Decimal>,
    pub cache_ttl: Duration,
    pub include_unhealthy: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            protocols: Protocol::ALL.to_vec(),
            exclude_protocols: Vec::new(),
            min_tvl: None,
            cache_ttl: AGGREGATOR_CACHE_TTL,
            include_unhealthy: false,
        }
    }
}

impl AggregatorConfig {
    pub fn enables(&self, protocol: Protocol) -> bool {
        self.protocols.contains(&protocol) && !self.exclude_protocols.contains(&protocol)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Apy,
    Tvl,
    Liquidity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// Ad-hoc query narrowing; any filter bypasses the opportunity cache
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpportunityFilter {
    pub min_apy: Option<Decimal>,
    pub max_apy: Option<Decimal>,
    pub min_tvl: Option<Decimal>,
    pub protocols: Option<Vec<Protocol>>,
    pub exclude_protocols: Option<Vec<Protocol>>,
    pub sort_by: Option<SortBy>,
    pub sort_direction: Option<SortDirection>,
    pub limit: Option<usize>,
}

impl OpportunityFilter {
    pub fn only(protocols: &[Protocol]) -> Self {
        Self { protocols: Some(protocols.to_vec()), ..Self::default() }
    }

    pub fn admits(&self, opportunity: &YieldOpportunity) -> bool {
        if self.min_apy.is_some_and(|min| opportunity.supply_apy < min) {
            return false;
        }
        if self.max_apy.is_some_and(|max| opportunity.supply_apy > max) {
            return false;
        }
        if self.min_tvl.is_some_and(|min| opportunity.tvl < min) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolFailure {
    pub protocol: Protocol,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedOpportunities {
    pub opportunities: Vec<YieldOpportunity>,
    pub best: Option<YieldOpportunity>,
    pub worst: Option<YieldOpportunity>,
    #[serde(with = "rust_decimal::serde::str")]
    pub apy_spread: Decimal,
    pub successful_protocols: usize,
    pub failed_protocols: usize,
    pub errors: Vec<ProtocolFailure>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPositions {
    pub positions: Vec<ProtocolPosition>,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_value_usd: Decimal,
    /// Value-weighted
    #[serde(with = "rust_decimal::serde::str")]
    pub weighted_avg_apy: Decimal,
    pub best_position: Option<ProtocolPosition>,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_yield_earned: Decimal,
    pub protocol_count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub chain_id: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_tvl_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_available_liquidity_usd: Decimal,
    /// TVL-weighted
    #[serde(with = "rust_decimal::serde::str")]
    pub weighted_avg_supply_apy: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub best_supply_apy: Decimal,
    pub best_protocol: Option<Protocol>,
    pub healthy_protocol_count: usize,
    pub total_protocol_count: usize,
    pub protocol_metrics: Vec<ProtocolMetrics>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolComparison {
    pub winner: Protocol,
    pub protocol1: Option<YieldOpportunity>,
    pub protocol2: Option<YieldOpportunity>,
    #[serde(with = "rust_decimal::serde::str")]
    pub apy_difference: Decimal,
}
