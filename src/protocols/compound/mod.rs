pub mod constants;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ethers::abi::AbiEncode;
use ethers::prelude::*;
use rust_decimal::{Decimal, dec};
use tracing::{debug, instrument};

use crate::cache::{TtlCache, cache_key};
use crate::error::{Result, YieldError};
use crate::formatting::{format_amount, per_second_rate_to_apy, round_2dp, u256_to_decimal};
use crate::rpc::{RpcPool, retry_with_backoff};
use crate::types::{
    ApprovalStatus, OpportunityMetadata, Protocol, ProtocolMetrics, ProtocolPosition,
    TransactionRequest, YieldOpportunity,
};

use super::{
    DEFAULT_DEPOSIT_GAS, DEFAULT_WITHDRAWAL_GAS, ProtocolAdapter, estimate_gas_or, market_snapshot,
    parse_address, read_allowance, summarize_markets, unsupported_token,
};
use constants::{COMPOUND_CACHE_TTL, CometMarket, comet_market, markets};

abigen!(
    Comet,
    r#"[
        function getUtilization() external view returns (uint256)
        function getSupplyRate(uint256 utilization) external view returns (uint64)
        function getBorrowRate(uint256 utilization) external view returns (uint64)
        function totalSupply() external view returns (uint256)
        function totalBorrow() external view returns (uint256)
        function balanceOf(address account) external view returns (uint256)
        function supply(address asset, uint256 amount) external
        function withdraw(address asset, uint256 amount) external
    ]"#
);

/// Compound v3 (Comet) base-asset markets
pub struct CompoundAdapter {
    rpc: Arc<RpcPool>,
    cache: Arc<TtlCache>,
}

struct MarketState {
    total_supply: U256,
    total_borrow: U256,
    supply_rate: u64,
    borrow_rate: u64,
}

impl CompoundAdapter {
    pub fn new(rpc: Arc<RpcPool>, cache: Arc<TtlCache>) -> Self {
        Self { rpc, cache }
    }

    fn market(&self, token: &str, chain_id: u64) -> Result<(&'static CometMarket, Address, Address)> {
        let market = comet_market(token, chain_id).ok_or_else(|| unsupported_token(Protocol::Compound, token, chain_id))?;
        Ok((market, parse_address(market.base.address)?, parse_address(market.comet)?))
    }

    fn comet(&self, chain_id: u64, comet: Address) -> Result<Comet<Provider<Http>>> {
        Ok(Comet::new(comet, self.rpc.client(chain_id)?))
    }

    /// Supply rate depends on current utilization, so that is read first
    async fn supply_rate(&self, chain_id: u64, comet: Address) -> Result<u64> {
        let comet = self.comet(chain_id, comet)?;
        let comet = &comet;
        let retry = self.rpc.retry_policy();
        let utilization =
            retry_with_backoff(chain_id, retry, move || async move { comet.get_utilization().call().await }).await?;
        retry_with_backoff(chain_id, retry, move || async move {
            comet.get_supply_rate(utilization).call().await
        })
        .await
    }

    async fn market_state(&self, chain_id: u64, comet: Address) -> Result<MarketState> {
        let comet = self.comet(chain_id, comet)?;
        let comet = &comet;
        let retry = self.rpc.retry_policy();

        let (total_supply, total_borrow, utilization) = tokio::try_join!(
            retry_with_backoff(chain_id, retry, move || async move { comet.total_supply().call().await }),
            retry_with_backoff(chain_id, retry, move || async move { comet.total_borrow().call().await }),
            retry_with_backoff(chain_id, retry, move || async move { comet.get_utilization().call().await }),
        )?;
        let (supply_rate, borrow_rate) = tokio::try_join!(
            retry_with_backoff(chain_id, retry, move || async move {
                comet.get_supply_rate(utilization).call().await
            }),
            retry_with_backoff(chain_id, retry, move || async move {
                comet.get_borrow_rate(utilization).call().await
            }),
        )?;

        Ok(MarketState { total_supply, total_borrow, supply_rate, borrow_rate })
    }
}

/// Borrowed share of supply in percent, 2 decimals
fn utilization_percent(total_supply: U256, total_borrow: U256) -> Result<Decimal> {
    if total_supply.is_zero() {
        return Ok(Decimal::ZERO);
    }
    let supply = u256_to_decimal(total_supply)?;
    let borrow = u256_to_decimal(total_borrow)?;
    Ok(round_2dp(borrow * dec!(100) / supply))
}

#[async_trait]
impl ProtocolAdapter for CompoundAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Compound
    }

    fn supports_token(&self, token: &str, chain_id: u64) -> bool {
        comet_market(token, chain_id).is_some()
    }

    fn supported_tokens(&self, chain_id: u64) -> Vec<String> {
        markets(chain_id).iter().map(|m| m.base.symbol.to_string()).collect()
    }

    fn token_address(&self, token: &str, chain_id: u64) -> Result<Address> {
        self.market(token, chain_id).map(|(_, base, _)| base)
    }

    fn spender(&self, token: &str, chain_id: u64) -> Result<Address> {
        self.market(token, chain_id).map(|(_, _, comet)| comet)
    }

    #[instrument(skip(self))]
    async fn supply_apy(&self, token: &str, chain_id: u64) -> Result<Decimal> {
        let key = cache_key(&["compound", "supplyAPY", token, &chain_id.to_string()]);
        if let Some(apy) = self.cache.get::<Decimal>(&key).await {
            return Ok(apy);
        }

        let fetch = async {
            let (_, _, comet) = self.market(token, chain_id)?;
            let rate = self.supply_rate(chain_id, comet).await?;
            per_second_rate_to_apy(U256::from(rate))
        };
        let apy = fetch.await.map_err(|e| {
            e.in_protocol(Protocol::Compound, &format!("Failed to get supply APY for {token} on chain {chain_id}"))
        })?;

        self.cache.set(key, apy, Some(COMPOUND_CACHE_TTL)).await;
        Ok(apy)
    }

    async fn user_position(
        &self,
        wallet: Address,
        token: &str,
        chain_id: u64,
    ) -> Result<Option<ProtocolPosition>> {
        let fetch = async {
            let (market, base, comet) = self.market(token, chain_id)?;
            let comet = self.comet(chain_id, comet)?;
            let comet = &comet;
            // Comet balances accrue interest in place
            let balance = retry_with_backoff(chain_id, self.rpc.retry_policy(), move || async move {
                comet.balance_of(wallet).call().await
            })
            .await?;
            if balance.is_zero() {
                return Ok(None);
            }

            let apy = self.supply_apy(token, chain_id).await?;
            let amount_formatted = format_amount(balance, market.base.decimals, 6)?;
            Ok::<_, YieldError>(Some(ProtocolPosition {
                protocol: Protocol::Compound,
                token: market.base.symbol.to_string(),
                token_address: base,
                chain_id,
                amount: balance,
                amount_formatted,
                value_usd: amount_formatted,
                apy,
                earned_yield: None,
            }))
        };
        fetch.await.map_err(|e| {
            e.in_protocol(Protocol::Compound, &format!("Failed to get user position for {token} on chain {chain_id}"))
        })
    }

    #[instrument(skip(self))]
    async fn metrics(&self, token: &str, chain_id: u64) -> Result<YieldOpportunity> {
        let fetch = async {
            let (market, base, comet) = self.market(token, chain_id)?;
            let state = self.market_state(chain_id, comet).await?;
            let decimals = market.base.decimals;

            let supply_apy = per_second_rate_to_apy(U256::from(state.supply_rate))?;
            let borrow_apy = per_second_rate_to_apy(U256::from(state.borrow_rate))?;
            let tvl = format_amount(state.total_supply, decimals, 2)?;
            let liquidity = format_amount(state.total_supply.saturating_sub(state.total_borrow), decimals, 2)?;
            let utilization = utilization_percent(state.total_supply, state.total_borrow)?;
            debug!(token = market.base.symbol, chain_id, %supply_apy, %utilization, "Comet market read");

            Ok::<_, YieldError>(YieldOpportunity {
                protocol: Protocol::Compound,
                token: market.base.symbol.to_string(),
                token_address: base,
                chain_id,
                supply_apy,
                borrow_apy: Some(borrow_apy),
                tvl,
                liquidity,
                utilization: Some(utilization),
                timestamp: Utc::now(),
                metadata: Some(OpportunityMetadata::Compound {
                    comet_address: comet,
                    total_supply: state.total_supply,
                    total_borrow: state.total_borrow,
                }),
            })
        };
        fetch.await.map_err(|e| {
            e.in_protocol(Protocol::Compound, &format!("Failed to get metrics for {token} on chain {chain_id}"))
        })
    }

    /// Same summary as the other protocols, plus outstanding borrows
    async fn protocol_metrics(&self, chain_id: u64) -> Result<ProtocolMetrics> {
        let markets = market_snapshot(self, chain_id).await;
        let mut summary = summarize_markets(Protocol::Compound, chain_id, &markets);

        let mut borrows = Decimal::ZERO;
        for market in &markets {
            if let Some(OpportunityMetadata::Compound { total_borrow, .. }) = &market.metadata {
                borrows += format_amount(*total_borrow, 6, 2)?;
            }
        }
        summary.total_borrows_usd = Some(round_2dp(borrows));
        Ok(summary)
    }

    fn prepare_deposit(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        _on_behalf_of: Address,
    ) -> Result<TransactionRequest> {
        // Comet credits msg.sender
        let (_, asset, comet) = self.market(token, chain_id)?;
        let call = SupplyCall { asset, amount };
        Ok(TransactionRequest { to: comet, data: call.encode().into(), value: U256::zero(), chain_id })
    }

    fn prepare_withdrawal(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        _to: Address,
    ) -> Result<TransactionRequest> {
        let (_, asset, comet) = self.market(token, chain_id)?;
        let call = WithdrawCall { asset, amount };
        Ok(TransactionRequest { to: comet, data: call.encode().into(), value: U256::zero(), chain_id })
    }

    async fn check_approval(
        &self,
        token: &str,
        chain_id: u64,
        owner: Address,
        amount: U256,
    ) -> Result<ApprovalStatus> {
        let (_, asset, comet) = self.market(token, chain_id)?;
        let allowance = read_allowance(&self.rpc, chain_id, asset, owner, comet)
            .await
            .map_err(|e| e.in_protocol(Protocol::Compound, "Failed to read allowance"))?;
        Ok(ApprovalStatus::new(allowance, amount, comet))
    }

    async fn estimate_deposit_gas(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        from: Address,
    ) -> Result<U256> {
        let tx = self.prepare_deposit(token, chain_id, amount, from)?;
        Ok(estimate_gas_or(&self.rpc, &tx, from, DEFAULT_DEPOSIT_GAS).await)
    }

    async fn estimate_withdrawal_gas(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        from: Address,
    ) -> Result<U256> {
        let tx = self.prepare_withdrawal(token, chain_id, amount, from)?;
        Ok(estimate_gas_or(&self.rpc, &tx, from, DEFAULT_WITHDRAWAL_GAS).await)
    }
}
