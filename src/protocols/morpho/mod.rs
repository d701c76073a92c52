pub mod api;
pub mod constants;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ethers::abi::AbiEncode;
use ethers::prelude::*;
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::cache::{TtlCache, cache_key};
use crate::config::Config;
use crate::error::{Result, YieldError};
use crate::formatting::format_amount;
use crate::rpc::{RpcPool, retry_with_backoff};
use crate::types::{
    ApprovalStatus, OpportunityMetadata, Protocol, ProtocolMetrics, ProtocolPosition,
    TransactionRequest, YieldOpportunity,
};

use super::{
    DEFAULT_DEPOSIT_GAS, DEFAULT_WITHDRAWAL_GAS, ProtocolAdapter, estimate_gas_or, market_snapshot,
    parse_address, read_allowance, summarize_markets, unsupported_token,
};
use api::MorphoApiClient;
use constants::{MORPHO_CACHE_TTL, VaultConfig, vault, vaults};

abigen!(
    MetaMorphoVault,
    r#"[
        function balanceOf(address account) external view returns (uint256)
        function convertToAssets(uint256 shares) external view returns (uint256)
        function totalAssets() external view returns (uint256)
        function deposit(uint256 assets, address receiver) external returns (uint256)
        function withdraw(uint256 assets, address receiver, address owner) external returns (uint256)
    ]"#
);

/// MetaMorpho ERC-4626 vaults; APY comes from the indexer, balances from chain
pub struct MorphoAdapter {
    rpc: Arc<RpcPool>,
    cache: Arc<TtlCache>,
    api: MorphoApiClient,
}

impl MorphoAdapter {
    pub fn new(rpc: Arc<RpcPool>, cache: Arc<TtlCache>, config: &Config) -> Result<Self> {
        let api = MorphoApiClient::new(config.morpho_api_url.clone(), config.rpc_timeout)?;
        Ok(Self::with_api(rpc, cache, api))
    }

    pub fn with_api(rpc: Arc<RpcPool>, cache: Arc<TtlCache>, api: MorphoApiClient) -> Self {
        Self { rpc, cache, api }
    }

    fn vault(&self, token: &str, chain_id: u64) -> Result<(&'static VaultConfig, Address, Address)> {
        let config = vault(token, chain_id).ok_or_else(|| unsupported_token(Protocol::Morpho, token, chain_id))?;
        Ok((config, parse_address(config.base.address)?, parse_address(config.vault)?))
    }

    fn contract(&self, chain_id: u64, vault: Address) -> Result<MetaMorphoVault<Provider<Http>>> {
        Ok(MetaMorphoVault::new(vault, self.rpc.client(chain_id)?))
    }

    async fn total_assets(&self, chain_id: u64, vault: Address) -> Result<U256> {
        let contract = self.contract(chain_id, vault)?;
        let contract = &contract;
        retry_with_backoff(chain_id, self.rpc.retry_policy(), move || async move {
            contract.total_assets().call().await
        })
        .await
    }
}

#[async_trait]
impl ProtocolAdapter for MorphoAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Morpho
    }

    fn supports_token(&self, token: &str, chain_id: u64) -> bool {
        vault(token, chain_id).is_some()
    }

    fn supported_tokens(&self, chain_id: u64) -> Vec<String> {
        vaults(chain_id).iter().map(|v| v.base.symbol.to_string()).collect()
    }

    fn token_address(&self, token: &str, chain_id: u64) -> Result<Address> {
        self.vault(token, chain_id).map(|(_, base, _)| base)
    }

    fn spender(&self, token: &str, chain_id: u64) -> Result<Address> {
        self.vault(token, chain_id).map(|(_, _, vault)| vault)
    }

    #[instrument(skip(self))]
    async fn supply_apy(&self, token: &str, chain_id: u64) -> Result<Decimal> {
        let key = cache_key(&["morpho", "supplyAPY", token, &chain_id.to_string()]);
        if let Some(apy) = self.cache.get::<Decimal>(&key).await {
            return Ok(apy);
        }

        let fetch = async {
            let (config, _, vault) = self.vault(token, chain_id)?;
            self.api.vault_apy(vault, chain_id, config.version).await
        };
        let apy = fetch.await.map_err(|e| {
            e.in_protocol(Protocol::Morpho, &format!("Failed to get supply APY for {token} on chain {chain_id}"))
        })?;

        self.cache.set(key, apy, Some(MORPHO_CACHE_TTL)).await;
        Ok(apy)
    }

    async fn user_position(
        &self,
        wallet: Address,
        token: &str,
        chain_id: u64,
    ) -> Result<Option<ProtocolPosition>> {
        let fetch = async {
            let (config, base, vault) = self.vault(token, chain_id)?;
            let contract = self.contract(chain_id, vault)?;
            let contract = &contract;
            let retry = self.rpc.retry_policy();

            let shares = retry_with_backoff(chain_id, retry, move || async move {
                contract.balance_of(wallet).call().await
            })
            .await?;
            if shares.is_zero() {
                return Ok(None);
            }
            let assets = retry_with_backoff(chain_id, retry, move || async move {
                contract.convert_to_assets(shares).call().await
            })
            .await?;

            let apy = self.supply_apy(token, chain_id).await?;
            let amount_formatted = format_amount(assets, config.base.decimals, 6)?;
            Ok::<_, YieldError>(Some(ProtocolPosition {
                protocol: Protocol::Morpho,
                token: config.base.symbol.to_string(),
                token_address: base,
                chain_id,
                amount: assets,
                amount_formatted,
                value_usd: amount_formatted,
                apy,
                earned_yield: None,
            }))
        };
        fetch.await.map_err(|e| {
            e.in_protocol(Protocol::Morpho, &format!("Failed to get user position for {token} on chain {chain_id}"))
        })
    }

    #[instrument(skip(self))]
    async fn metrics(&self, token: &str, chain_id: u64) -> Result<YieldOpportunity> {
        let fetch = async {
            let (config, base, vault) = self.vault(token, chain_id)?;
            let (supply_apy, total_assets) = tokio::try_join!(
                self.api.vault_apy(vault, chain_id, config.version),
                self.total_assets(chain_id, vault),
            )?;
            // Vaults manage liquidity internally, so all assets count as available
            let tvl = format_amount(total_assets, config.base.decimals, 2)?;
            debug!(vault = config.name, chain_id, %supply_apy, %tvl, "Morpho vault read");

            Ok::<_, YieldError>(YieldOpportunity {
                protocol: Protocol::Morpho,
                token: config.base.symbol.to_string(),
                token_address: base,
                chain_id,
                supply_apy,
                borrow_apy: Some(Decimal::ZERO),
                tvl,
                liquidity: tvl,
                utilization: Some(Decimal::ZERO),
                timestamp: Utc::now(),
                metadata: Some(OpportunityMetadata::Morpho {
                    vault_address: vault,
                    vault_name: config.name.to_string(),
                    total_assets,
                }),
            })
        };
        fetch.await.map_err(|e| {
            e.in_protocol(Protocol::Morpho, &format!("Failed to get metrics for {token} on chain {chain_id}"))
        })
    }

    /// Vaults are supply-only, so borrows are always zero
    async fn protocol_metrics(&self, chain_id: u64) -> Result<ProtocolMetrics> {
        let markets = market_snapshot(self, chain_id).await;
        let mut summary = summarize_markets(Protocol::Morpho, chain_id, &markets);
        summary.total_borrows_usd = Some(Decimal::ZERO);
        Ok(summary)
    }

    fn prepare_deposit(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        on_behalf_of: Address,
    ) -> Result<TransactionRequest> {
        let (_, _, vault) = self.vault(token, chain_id)?;
        let call = DepositCall { assets: amount, receiver: on_behalf_of };
        Ok(TransactionRequest { to: vault, data: call.encode().into(), value: U256::zero(), chain_id })
    }

    fn prepare_withdrawal(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        to: Address,
    ) -> Result<TransactionRequest> {
        let (_, _, vault) = self.vault(token, chain_id)?;
        let call = WithdrawCall { assets: amount, receiver: to, owner: to };
        Ok(TransactionRequest { to: vault, data: call.encode().into(), value: U256::zero(), chain_id })
    }

    async fn check_approval(
        &self,
        token: &str,
        chain_id: u64,
        owner: Address,
        amount: U256,
    ) -> Result<ApprovalStatus> {
        let (_, base, vault) = self.vault(token, chain_id)?;
        let allowance = read_allowance(&self.rpc, chain_id, base, owner, vault)
            .await
            .map_err(|e| e.in_protocol(Protocol::Morpho, "Failed to read allowance"))?;
        Ok(ApprovalStatus::new(allowance, amount, vault))
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
