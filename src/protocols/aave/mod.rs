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
use crate::formatting::{format_amount, ray_to_apy, round_2dp};
use crate::rpc::{RpcPool, retry_with_backoff};
use crate::types::{
    ApprovalStatus, OpportunityMetadata, Protocol, ProtocolPosition, TransactionRequest,
    YieldOpportunity,
};

use super::{
    DEFAULT_DEPOSIT_GAS, DEFAULT_WITHDRAWAL_GAS, ProtocolAdapter, TokenInfo, erc20_balance,
    erc20_total_supply, estimate_gas_or, parse_address, read_allowance, unsupported_token,
};
use constants::{AAVE_CACHE_TTL, pool_address, reserve, reserves};

abigen!(AavePool, "./abis/AavePool.json");

/// Share of TVL reported as withdrawable liquidity
const LIQUIDITY_SHARE: Decimal = dec!(0.8);

/// AAVE v3 lending pools
pub struct AaveAdapter {
    rpc: Arc<RpcPool>,
    cache: Arc<TtlCache>,
}

impl AaveAdapter {
    pub fn new(rpc: Arc<RpcPool>, cache: Arc<TtlCache>) -> Self {
        Self { rpc, cache }
    }

    fn market(&self, token: &str, chain_id: u64) -> Result<(&'static TokenInfo, Address, Address)> {
        let info = reserve(token, chain_id).ok_or_else(|| unsupported_token(Protocol::Aave, token, chain_id))?;
        let pool = pool_address(chain_id).ok_or_else(|| {
            YieldError::protocol(Protocol::Aave, format!("AAVE Pool not supported on chain {chain_id}"))
        })?;
        Ok((info, parse_address(info.address)?, parse_address(pool)?))
    }

    async fn reserve_data(&self, chain_id: u64, pool: Address, asset: Address) -> Result<ReserveData> {
        let pool = AavePool::new(pool, self.rpc.client(chain_id)?);
        let pool = &pool;
        retry_with_backoff(chain_id, self.rpc.retry_policy(), move || async move {
            pool.get_reserve_data(asset).call().await
        })
        .await
    }
}

#[async_trait]
impl ProtocolAdapter for AaveAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Aave
    }

    fn supports_token(&self, token: &str, chain_id: u64) -> bool {
        pool_address(chain_id).is_some() && reserve(token, chain_id).is_some()
    }

    fn supported_tokens(&self, chain_id: u64) -> Vec<String> {
        reserves(chain_id).iter().map(|r| r.symbol.to_string()).collect()
    }

    fn token_address(&self, token: &str, chain_id: u64) -> Result<Address> {
        self.market(token, chain_id).map(|(_, asset, _)| asset)
    }

    fn spender(&self, token: &str, chain_id: u64) -> Result<Address> {
        self.market(token, chain_id).map(|(_, _, pool)| pool)
    }

    #[instrument(skip(self))]
    async fn supply_apy(&self, token: &str, chain_id: u64) -> Result<Decimal> {
        let key = cache_key(&["aave", "supplyAPY", token, &chain_id.to_string()]);
        if let Some(apy) = self.cache.get::<Decimal>(&key).await {
            return Ok(apy);
        }

        let fetch = async {
            let (_, asset, pool) = self.market(token, chain_id)?;
            let data = self.reserve_data(chain_id, pool, asset).await?;
            ray_to_apy(U256::from(data.current_liquidity_rate))
        };
        let apy = fetch
            .await
            .map_err(|e| e.in_protocol(Protocol::Aave, &format!("Failed to get supply APY for {token} on chain {chain_id}")))?;

        self.cache.set(key, apy, Some(AAVE_CACHE_TTL)).await;
        Ok(apy)
    }

    async fn user_position(
        &self,
        wallet: Address,
        token: &str,
        chain_id: u64,
    ) -> Result<Option<ProtocolPosition>> {
        let fetch = async {
            let (info, asset, pool) = self.market(token, chain_id)?;
            let data = self.reserve_data(chain_id, pool, asset).await?;
            // aToken balance already includes accrued interest
            let balance = erc20_balance(&self.rpc, chain_id, data.a_token_address, wallet).await?;
            if balance.is_zero() {
                return Ok(None);
            }

            let apy = self.supply_apy(token, chain_id).await?;
            let amount_formatted = format_amount(balance, info.decimals, 6)?;
            Ok::<_, YieldError>(Some(ProtocolPosition {
                protocol: Protocol::Aave,
                token: info.symbol.to_string(),
                token_address: asset,
                chain_id,
                amount: balance,
                amount_formatted,
                value_usd: amount_formatted,
                apy,
                earned_yield: None,
            }))
        };
        fetch
            .await
            .map_err(|e| e.in_protocol(Protocol::Aave, &format!("Failed to get user position for {token} on chain {chain_id}")))
    }

    #[instrument(skip(self))]
    async fn metrics(&self, token: &str, chain_id: u64) -> Result<YieldOpportunity> {
        let fetch = async {
            let (info, asset, pool) = self.market(token, chain_id)?;
            let data = self.reserve_data(chain_id, pool, asset).await?;
            let supply_apy = ray_to_apy(U256::from(data.current_liquidity_rate))?;
            let borrow_apy = ray_to_apy(U256::from(data.current_variable_borrow_rate))?;

            let total_supply = erc20_total_supply(&self.rpc, chain_id, data.a_token_address).await?;
            let tvl = format_amount(total_supply, info.decimals, 2)?;
            debug!(token = info.symbol, chain_id, %supply_apy, %tvl, "AAVE reserve read");

            Ok::<_, YieldError>(YieldOpportunity {
                protocol: Protocol::Aave,
                token: info.symbol.to_string(),
                token_address: asset,
                chain_id,
                supply_apy,
                borrow_apy: Some(borrow_apy),
                tvl,
                liquidity: round_2dp(tvl * LIQUIDITY_SHARE),
                utilization: None,
                timestamp: Utc::now(),
                metadata: Some(OpportunityMetadata::Aave {
                    a_token_address: data.a_token_address,
                    liquidity_index: U256::from(data.liquidity_index),
                    last_update: data.last_update_timestamp,
                }),
            })
        };
        fetch
            .await
            .map_err(|e| e.in_protocol(Protocol::Aave, &format!("Failed to get metrics for {token} on chain {chain_id}")))
    }

    fn prepare_deposit(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        on_behalf_of: Address,
    ) -> Result<TransactionRequest> {
        let (_, asset, pool) = self.market(token, chain_id)?;
        let call = SupplyCall { asset, amount, on_behalf_of, referral_code: 0 };
        Ok(TransactionRequest { to: pool, data: call.encode().into(), value: U256::zero(), chain_id })
    }

    fn prepare_withdrawal(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        to: Address,
    ) -> Result<TransactionRequest> {
        let (_, asset, pool) = self.market(token, chain_id)?;
        let call = WithdrawCall { asset, amount, to };
        Ok(TransactionRequest { to: pool, data: call.encode().into(), value: U256::zero(), chain_id })
    }

    async fn check_approval(
        &self,
        token: &str,
        chain_id: u64,
        owner: Address,
        amount: U256,
    ) -> Result<ApprovalStatus> {
        let (_, asset, pool) = self.market(token, chain_id)?;
        let allowance = read_allowance(&self.rpc, chain_id, asset, owner, pool)
            .await
            .map_err(|e| e.in_protocol(Protocol::Aave, "Failed to read allowance"))?;
        Ok(ApprovalStatus::new(allowance, amount, pool))
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
