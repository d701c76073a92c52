pub mod types;

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use ethers::types::Address;
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::cache::{TtlCache, cache_key};
use crate::formatting::round_2dp;
use crate::protocols::ProtocolAdapter;
use crate::types::{Protocol, ProtocolMetrics, ProtocolPosition, YieldOpportunity};

pub use types::*;

const DEFAULT_POSITION_TOKENS: [&str; 2] = ["USDC", "USDT"];
const CACHE_PREFIX: &str = "aggregator";

/// Fans one query out to every enabled protocol adapter.
///
/// Each adapter call is isolated: a failing protocol is reported in
/// `errors` and never aborts its siblings.
pub struct YieldAggregator {
    adapters: Vec<Arc<dyn ProtocolAdapter>>,
    cache: Arc<TtlCache>,
    config: AggregatorConfig,
}

impl YieldAggregator {
    /// Adapters for protocols the config disables are dropped here
    pub fn new(adapters: Vec<Arc<dyn ProtocolAdapter>>, cache: Arc<TtlCache>, config: AggregatorConfig) -> Self {
        let adapters = adapters.into_iter().filter(|a| config.enables(a.protocol())).collect();
        Self { adapters, cache, config }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn enabled_protocols(&self) -> Vec<Protocol> {
        self.adapters.iter().map(|a| a.protocol()).collect()
    }

    pub fn adapter(&self, protocol: Protocol) -> Option<&Arc<dyn ProtocolAdapter>> {
        self.adapters.iter().find(|a| a.protocol() == protocol)
    }

    /// True when at least one enabled protocol lists `token` on `chain_id`
    pub fn supports_token(&self, token: &str, chain_id: u64) -> bool {
        self.adapters.iter().any(|a| a.supports_token(token, chain_id))
    }

    /// Ranked opportunities for `token` on `chain_id`.
    ///
    /// Unfiltered results are cached per token and chain; any `filter` forces a refetch.
    #[instrument(skip(self, filter), fields(filtered = filter.is_some()))]
    pub async fn fetch_all_opportunities(
        &self,
        token: &str,
        chain_id: u64,
        filter: Option<&OpportunityFilter>,
    ) -> AggregatedOpportunities {
        let key = cache_key(&[CACHE_PREFIX, "opportunities", token, &chain_id.to_string()]);
        if filter.is_none() {
            if let Some(cached) = self.cache.get::<AggregatedOpportunities>(&key).await {
                return cached;
            }
        }

        let selected: Vec<&Arc<dyn ProtocolAdapter>> = self
            .adapters
            .iter()
            .filter(|a| {
                let protocol = a.protocol();
                let allowed = filter
                    .and_then(|f| f.protocols.as_ref())
                    .is_none_or(|only| only.contains(&protocol));
                let excluded = filter
                    .and_then(|f| f.exclude_protocols.as_ref())
                    .is_some_and(|ex| ex.contains(&protocol));
                allowed && !excluded
            })
            .collect();

        let results = join_all(selected.iter().map(|adapter| async move {
            if !adapter.supports_token(token, chain_id) {
                return Ok(None);
            }
            adapter.metrics(token, chain_id).await.map(Some)
        }))
        .await;

        let mut opportunities = Vec::new();
        let mut errors = Vec::new();
        let mut successful = 0;
        for (adapter, result) in selected.iter().zip(results) {
            match result {
                Ok(Some(opportunity)) => {
                    successful += 1;
                    opportunities.push(opportunity);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(protocol = %adapter.protocol(), token, chain_id, err = %e, "Protocol fetch failed");
                    errors.push(ProtocolFailure { protocol: adapter.protocol(), error: e.to_string() });
                }
            }
        }

        opportunities.retain(|o| self.config.min_tvl.is_none_or(|min| o.tvl >= min));
        if let Some(filter) = filter {
            opportunities.retain(|o| filter.admits(o));
        }

        let sort_by = filter.and_then(|f| f.sort_by).unwrap_or_default();
        let direction = filter.and_then(|f| f.sort_direction).unwrap_or_default();
        sort_opportunities(&mut opportunities, sort_by, direction);
        if let Some(limit) = filter.and_then(|f| f.limit) {
            opportunities.truncate(limit);
        }

        let best = opportunities.first().cloned();
        let worst = opportunities.last().cloned();
        let apy_spread = match (&best, &worst) {
            (Some(best), Some(worst)) => round_2dp(best.supply_apy - worst.supply_apy),
            _ => Decimal::ZERO,
        };

        let aggregated = AggregatedOpportunities {
            opportunities,
            best,
            worst,
            apy_spread,
            successful_protocols: successful,
            failed_protocols: errors.len(),
            errors,
            timestamp: Utc::now(),
        };
        debug!(
            found = aggregated.opportunities.len(),
            failed = aggregated.failed_protocols,
            "Opportunities aggregated"
        );

        if filter.is_none() {
            self.cache.set(key, aggregated.clone(), Some(self.config.cache_ttl)).await;
        }
        aggregated
    }

    pub async fn get_best_opportunity(&self, token: &str, chain_id: u64) -> Option<YieldOpportunity> {
        self.fetch_all_opportunities(token, chain_id, None).await.best
    }

    /// Every token's opportunities merged, APY descending
    pub async fn fetch_opportunities_for_tokens(&self, tokens: &[&str], chain_id: u64) -> Vec<YieldOpportunity> {
        let per_token = join_all(tokens.iter().map(|t| self.fetch_all_opportunities(t, chain_id, None))).await;
        let mut merged: Vec<YieldOpportunity> = per_token.into_iter().flat_map(|r| r.opportunities).collect();
        sort_opportunities(&mut merged, SortBy::Apy, SortDirection::Desc);
        merged
    }

    /// The wallet's holdings across every protocol x token pair; defaults to USDC and USDT
    #[instrument(skip(self))]
    pub async fn get_all_positions(
        &self,
        wallet: Address,
        chain_id: u64,
        tokens: Option<&[&str]>,
    ) -> AggregatedPositions {
        let tokens = tokens.unwrap_or(&DEFAULT_POSITION_TOKENS);
        let key = cache_key(&[
            CACHE_PREFIX,
            "positions",
            &format!("{wallet:?}"),
            &chain_id.to_string(),
            &tokens.join(","),
        ]);
        if let Some(cached) = self.cache.get::<AggregatedPositions>(&key).await {
            return cached;
        }

        let lookups = self.adapters.iter().flat_map(|adapter| {
            tokens.iter().map(move |token| async move {
                (adapter.protocol(), adapter.user_position(wallet, token, chain_id).await)
            })
        });
        let mut positions = Vec::new();
        for (protocol, result) in join_all(lookups).await {
            match result {
                Ok(Some(position)) => positions.push(position),
                Ok(None) => {}
                Err(e) => debug!(%protocol, chain_id, err = %e, "Position lookup failed"),
            }
        }

        let aggregated = summarize_positions(positions);
        self.cache.set(key, aggregated.clone(), Some(self.config.cache_ttl)).await;
        aggregated
    }

    /// Chain-wide view over every protocol's metrics
    #[instrument(skip(self))]
    pub async fn get_aggregated_metrics(&self, chain_id: u64) -> AggregatedMetrics {
        let key = cache_key(&[CACHE_PREFIX, "metrics", &chain_id.to_string()]);
        if let Some(cached) = self.cache.get::<AggregatedMetrics>(&key).await {
            return cached;
        }

        let results = join_all(self.adapters.iter().map(|a| a.protocol_metrics(chain_id))).await;
        let mut kept: Vec<ProtocolMetrics> = Vec::new();
        for (adapter, result) in self.adapters.iter().zip(results) {
            match result {
                Ok(metrics) if metrics.is_healthy || self.config.include_unhealthy => kept.push(metrics),
                Ok(_) => debug!(protocol = %adapter.protocol(), chain_id, "Dropping unhealthy protocol"),
                Err(e) => warn!(protocol = %adapter.protocol(), chain_id, err = %e, "Protocol metrics failed"),
            }
        }

        let aggregated = summarize_metrics(chain_id, kept, self.adapters.len());
        self.cache.set(key, aggregated.clone(), Some(self.config.cache_ttl)).await;
        aggregated
    }

    /// Head-to-head on supply APY; ties go to `p1`
    pub async fn compare_protocols(&self, token: &str, chain_id: u64, p1: Protocol, p2: Protocol) -> ProtocolComparison {
        let filter = OpportunityFilter::only(&[p1, p2]);
        let result = self.fetch_all_opportunities(token, chain_id, Some(&filter)).await;
        let find = |p: Protocol| result.opportunities.iter().find(|o| o.protocol == p).cloned();
        let (first, second) = (find(p1), find(p2));

        let (winner, apy_difference) = match (&first, &second) {
            (None, None) => (p1, Decimal::ZERO),
            (None, Some(o2)) => (p2, o2.supply_apy),
            (Some(o1), None) => (p1, o1.supply_apy),
            (Some(o1), Some(o2)) => {
                let winner = if o1.supply_apy >= o2.supply_apy { p1 } else { p2 };
                (winner, round_2dp((o1.supply_apy - o2.supply_apy).abs()))
            }
        };
        ProtocolComparison { winner, protocol1: first, protocol2: second, apy_difference }
    }

    /// Drop this aggregator's cached views; adapter entries in the shared cache stay
    pub async fn clear_cache(&self) {
        for key in self.cache.keys() {
            if key.starts_with(CACHE_PREFIX) {
                self.cache.delete(&key).await;
            }
        }
    }
}

fn sort_key(opportunity: &YieldOpportunity, sort_by: SortBy) -> Decimal {
    match sort_by {
        SortBy::Apy => opportunity.supply_apy,
        SortBy::Tvl => opportunity.tvl,
        SortBy::Liquidity => opportunity.liquidity,
    }
}

/// Stable, so equal keys keep adapter order
pub fn sort_opportunities(opportunities: &mut [YieldOpportunity], sort_by: SortBy, direction: SortDirection) {
    opportunities.sort_by(|a, b| {
        let ordering: Ordering = sort_key(a, sort_by).cmp(&sort_key(b, sort_by));
        match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });
}

fn summarize_positions(positions: Vec<ProtocolPosition>) -> AggregatedPositions {
    let total_value: Decimal = positions.iter().map(|p| p.value_usd).sum();
    let weighted_sum: Decimal = positions.iter().map(|p| p.apy * p.value_usd).sum();
    let earned: Decimal = positions.iter().filter_map(|p| p.earned_yield).sum();
    let weighted_avg_apy = if total_value.is_zero() { Decimal::ZERO } else { weighted_sum / total_value };

    let mut best_position: Option<&ProtocolPosition> = None;
    for position in &positions {
        if best_position.is_none_or(|best| position.apy > best.apy) {
            best_position = Some(position);
        }
    }
    let best_position = best_position.cloned();
    let protocol_count = positions.iter().map(|p| p.protocol).collect::<BTreeSet<_>>().len();

    AggregatedPositions {
        total_value_usd: round_2dp(total_value),
        weighted_avg_apy: round_2dp(weighted_avg_apy),
        best_position,
        total_yield_earned: round_2dp(earned),
        protocol_count,
        positions,
        timestamp: Utc::now(),
    }
}

fn summarize_metrics(chain_id: u64, protocol_metrics: Vec<ProtocolMetrics>, total_protocols: usize) -> AggregatedMetrics {
    let total_tvl: Decimal = protocol_metrics.iter().map(|m| m.tvl_usd).sum();
    let total_liquidity: Decimal = protocol_metrics.iter().map(|m| m.available_liquidity_usd).sum();
    let weighted_sum: Decimal = protocol_metrics.iter().map(|m| m.avg_supply_apy * m.tvl_usd).sum();
    let weighted_avg = if total_tvl.is_zero() { Decimal::ZERO } else { weighted_sum / total_tvl };

    let mut best_apy = Decimal::ZERO;
    let mut best_protocol = None;
    for metrics in &protocol_metrics {
        if metrics.avg_supply_apy > best_apy {
            best_apy = metrics.avg_supply_apy;
            best_protocol = Some(metrics.protocol);
        }
    }

    AggregatedMetrics {
        chain_id,
        total_tvl_usd: round_2dp(total_tvl),
        total_available_liquidity_usd: round_2dp(total_liquidity),
        weighted_avg_supply_apy: round_2dp(weighted_avg),
        best_supply_apy: round_2dp(best_apy),
        best_protocol,
        healthy_protocol_count: protocol_metrics.iter().filter(|m| m.is_healthy).count(),
        total_protocol_count: total_protocols,
        protocol_metrics,
        timestamp: Utc::now(),
    }
}
