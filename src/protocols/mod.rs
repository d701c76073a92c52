pub mod aave;
pub mod compound;
pub mod morpho;
#[cfg(test)]
pub(crate) mod mock;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::AbiEncode;
use ethers::middleware::SignerMiddleware;
use ethers::prelude::*;
use ethers::types::TransactionRequest as EthTransactionRequest;
use ethers::types::transaction::eip2718::TypedTransaction;
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::{Result, YieldError};
use crate::formatting::round_2dp;
use crate::rpc::{RpcPool, retry_with_backoff};
use crate::types::{
    ApprovalStatus, Protocol, ProtocolMetrics, ProtocolPosition, TransactionRequest, TxReceipt,
    TxStatus, YieldOpportunity,
};

pub use aave::AaveAdapter;
pub use compound::CompoundAdapter;
pub use morpho::MorphoAdapter;

abigen!(
    Erc20,
    r#"[
        function balanceOf(address owner) external view returns (uint256)
        function totalSupply() external view returns (uint256)
        function allowance(address owner, address spender) external view returns (uint256)
        function approve(address spender, uint256 amount) external returns (bool)
    ]"#
);

/// Externally built signing client; the engine never holds keys itself
pub type TxSigner = SignerMiddleware<Arc<Provider<Http>>, LocalWallet>;

pub const DEFAULT_DEPOSIT_GAS: u64 = 250_000;
pub const DEFAULT_WITHDRAWAL_GAS: u64 = 200_000;

/// A stablecoin market entry in a protocol's static tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    pub symbol: &'static str,
    pub address: &'static str,
    pub decimals: u32,
}

pub(crate) fn parse_address(raw: &str) -> Result<Address> {
    Address::from_str(raw).map_err(|e| YieldError::Conversion(format!("bad address {raw}: {e}")))
}

pub(crate) fn unsupported_token(protocol: Protocol, token: &str, chain_id: u64) -> YieldError {
    YieldError::protocol(protocol, format!("Token {token} not supported on chain {chain_id}"))
}

/// One lending protocol behind a uniform read / prepare / execute surface.
///
/// Adapters are multi-chain: every call names its chain. Data calls reject
/// tokens the protocol does not list instead of reporting a zero market.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn supports_token(&self, token: &str, chain_id: u64) -> bool;

    /// Canonical symbols listed on `chain_id`
    fn supported_tokens(&self, chain_id: u64) -> Vec<String>;

    /// Address of the underlying ERC20
    fn token_address(&self, token: &str, chain_id: u64) -> Result<Address>;

    /// Contract that pulls the token on deposit
    fn spender(&self, token: &str, chain_id: u64) -> Result<Address>;

    /// Supply APY in percent, 2 decimals
    async fn supply_apy(&self, token: &str, chain_id: u64) -> Result<Decimal>;

    /// `None` when the wallet holds nothing in this market
    async fn user_position(
        &self,
        wallet: Address,
        token: &str,
        chain_id: u64,
    ) -> Result<Option<ProtocolPosition>>;

    async fn metrics(&self, token: &str, chain_id: u64) -> Result<YieldOpportunity>;

    /// Every listed market queried concurrently; failed markets are skipped
    async fn protocol_metrics(&self, chain_id: u64) -> Result<ProtocolMetrics> {
        let markets = market_snapshot(self, chain_id).await;
        Ok(summarize_markets(self.protocol(), chain_id, &markets))
    }

    fn prepare_deposit(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        on_behalf_of: Address,
    ) -> Result<TransactionRequest>;

    fn prepare_withdrawal(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        to: Address,
    ) -> Result<TransactionRequest>;

    fn prepare_approval(
        &self,
        token: &str,
        chain_id: u64,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionRequest> {
        let token_address = self.token_address(token, chain_id)?;
        Ok(approval_request(token_address, spender, amount, chain_id))
    }

    async fn check_approval(
        &self,
        token: &str,
        chain_id: u64,
        owner: Address,
        amount: U256,
    ) -> Result<ApprovalStatus>;

    /// Falls back to 250k units when the node cannot estimate
    async fn estimate_deposit_gas(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        from: Address,
    ) -> Result<U256>;

    /// Falls back to 200k units when the node cannot estimate
    async fn estimate_withdrawal_gas(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        from: Address,
    ) -> Result<U256>;

    /// Approve the exact shortfall if needed, then deposit and wait for the receipt
    async fn execute_deposit(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        signer: Arc<TxSigner>,
    ) -> Result<TxReceipt> {
        let protocol = self.protocol();
        ensure_signer_chain(protocol, &signer, chain_id)?;
        let owner = signer.address();

        let approval = self.check_approval(token, chain_id, owner, amount).await?;
        if approval.needs_approval {
            info!(%protocol, token, chain_id, allowance = %approval.current_allowance, %amount, "Approving spender");
            let approve_tx = self.prepare_approval(token, chain_id, approval.spender, amount)?;
            let receipt = submit_transaction(protocol, &signer, &approve_tx).await?;
            if receipt.status == TxStatus::Reverted {
                return Err(YieldError::protocol(
                    protocol,
                    format!("Approval transaction {:?} reverted", receipt.hash),
                ));
            }
        }

        let deposit_tx = self.prepare_deposit(token, chain_id, amount, owner)?;
        submit_transaction(protocol, &signer, &deposit_tx).await
    }

    async fn execute_withdrawal(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        signer: Arc<TxSigner>,
    ) -> Result<TxReceipt> {
        let protocol = self.protocol();
        ensure_signer_chain(protocol, &signer, chain_id)?;
        let withdraw_tx = self.prepare_withdrawal(token, chain_id, amount, signer.address())?;
        submit_transaction(protocol, &signer, &withdraw_tx).await
    }
}

/// Adapters for every protocol, sharing one RPC pool and cache
pub fn default_adapters(
    rpc: Arc<RpcPool>,
    cache: Arc<TtlCache>,
    config: &Config,
) -> Result<Vec<Arc<dyn ProtocolAdapter>>> {
    let aave: Arc<dyn ProtocolAdapter> = Arc::new(AaveAdapter::new(rpc.clone(), cache.clone()));
    let compound: Arc<dyn ProtocolAdapter> = Arc::new(CompoundAdapter::new(rpc.clone(), cache.clone()));
    let morpho: Arc<dyn ProtocolAdapter> = Arc::new(MorphoAdapter::new(rpc, cache, config)?);
    Ok(vec![aave, compound, morpho])
}

/// ERC20 `approve(spender, amount)` intent
pub fn approval_request(
    token_address: Address,
    spender: Address,
    amount: U256,
    chain_id: u64,
) -> TransactionRequest {
    TransactionRequest {
        to: token_address,
        data: ApproveCall { spender, amount }.encode().into(),
        value: U256::zero(),
        chain_id,
    }
}

pub(crate) async fn read_allowance(
    rpc: &RpcPool,
    chain_id: u64,
    token_address: Address,
    owner: Address,
    spender: Address,
) -> Result<U256> {
    let erc20 = Erc20::new(token_address, rpc.client(chain_id)?);
    let erc20 = &erc20;
    retry_with_backoff(chain_id, rpc.retry_policy(), move || async move {
        erc20.allowance(owner, spender).call().await
    })
    .await
}

pub(crate) async fn erc20_balance(
    rpc: &RpcPool,
    chain_id: u64,
    token_address: Address,
    holder: Address,
) -> Result<U256> {
    let erc20 = Erc20::new(token_address, rpc.client(chain_id)?);
    let erc20 = &erc20;
    retry_with_backoff(chain_id, rpc.retry_policy(), move || async move {
        erc20.balance_of(holder).call().await
    })
    .await
}

pub(crate) async fn erc20_total_supply(rpc: &RpcPool, chain_id: u64, token_address: Address) -> Result<U256> {
    let erc20 = Erc20::new(token_address, rpc.client(chain_id)?);
    let erc20 = &erc20;
    retry_with_backoff(chain_id, rpc.retry_policy(), move || async move {
        erc20.total_supply().call().await
    })
    .await
}

/// Node gas estimate for `tx`, or `fallback` units if the node refuses
pub(crate) async fn estimate_gas_or(
    rpc: &RpcPool,
    tx: &TransactionRequest,
    from: Address,
    fallback: u64,
) -> U256 {
    let client = match rpc.client(tx.chain_id) {
        Ok(client) => client,
        Err(e) => {
            warn!(err = %e, chain_id = tx.chain_id, "No client for gas estimate, using fallback");
            return U256::from(fallback);
        }
    };
    let request: TypedTransaction = EthTransactionRequest::new()
        .from(from)
        .to(tx.to)
        .data(tx.data.clone())
        .value(tx.value)
        .into();
    match client.estimate_gas(&request, None).await {
        Ok(gas) => gas,
        Err(e) => {
            debug!(err = %e, to = ?tx.to, fallback, "Gas estimation failed, using fallback");
            U256::from(fallback)
        }
    }
}

fn ensure_signer_chain(protocol: Protocol, signer: &TxSigner, chain_id: u64) -> Result<()> {
    let signer_chain = signer.signer().chain_id();
    if signer_chain != chain_id {
        return Err(YieldError::protocol(
            protocol,
            format!("Signer is bound to chain {signer_chain}, not {chain_id}"),
        ));
    }
    Ok(())
}

/// Broadcast through the signer and block until the receipt is in
pub(crate) async fn submit_transaction(
    protocol: Protocol,
    signer: &TxSigner,
    tx: &TransactionRequest,
) -> Result<TxReceipt> {
    let selector = hex::encode(tx.data.get(..4).unwrap_or_default());
    debug!(%protocol, to = ?tx.to, selector, chain_id = tx.chain_id, "Submitting transaction");
    let request = EthTransactionRequest::new()
        .from(signer.address())
        .to(tx.to)
        .data(tx.data.clone())
        .value(tx.value);

    let pending = signer
        .send_transaction(request, None)
        .await
        .map_err(|e| YieldError::protocol(protocol, format!("Failed to send transaction: {e}")))?;
    let hash = *pending;
    debug!(%protocol, ?hash, "Transaction sent, awaiting receipt");

    let receipt = pending
        .await
        .map_err(|e| YieldError::protocol(protocol, format!("Failed waiting for {hash:?}: {e}")))?
        .ok_or_else(|| YieldError::protocol(protocol, format!("Transaction {hash:?} dropped from mempool")))?;

    let receipt = TxReceipt::from(receipt);
    if receipt.status == TxStatus::Reverted {
        warn!(%protocol, ?hash, "Transaction reverted");
    }
    Ok(receipt)
}

/// `metrics` for every listed token, concurrently; failures are logged and skipped
pub(crate) async fn market_snapshot<A>(adapter: &A, chain_id: u64) -> Vec<YieldOpportunity>
where
    A: ProtocolAdapter + ?Sized,
{
    let tokens = adapter.supported_tokens(chain_id);
    let results = join_all(tokens.iter().map(|token| adapter.metrics(token, chain_id))).await;
    results
        .into_iter()
        .zip(tokens.iter())
        .filter_map(|(result, token)| match result {
            Ok(market) => Some(market),
            Err(e) => {
                debug!(protocol = %adapter.protocol(), token = %token, chain_id, err = %e, "Market skipped");
                None
            }
        })
        .collect()
}

pub(crate) fn summarize_markets(
    protocol: Protocol,
    chain_id: u64,
    markets: &[YieldOpportunity],
) -> ProtocolMetrics {
    let tvl: Decimal = markets.iter().map(|m| m.tvl).sum();
    let liquidity: Decimal = markets.iter().map(|m| m.liquidity).sum();
    let avg_apy = if markets.is_empty() {
        Decimal::ZERO
    } else {
        markets.iter().map(|m| m.supply_apy).sum::<Decimal>() / Decimal::from(markets.len())
    };

    ProtocolMetrics {
        protocol,
        chain_id,
        tvl_usd: round_2dp(tvl),
        available_liquidity_usd: round_2dp(liquidity),
        avg_supply_apy: round_2dp(avg_apy),
        total_borrows_usd: None,
        is_healthy: !markets.is_empty(),
        last_updated: chrono::Utc::now(),
    }
}
