use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::U256;
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::{Config, RetryPolicy};
use crate::error::{Result, YieldError};
use crate::formatting::{format_amount, round_2dp};
use crate::types::{ARBITRUM, BASE, ETHEREUM, POLYGON};

const GWEI: u64 = 1_000_000_000;

/// Static gas prices used when a chain's endpoint cannot answer
pub fn fallback_gas_price(chain_id: u64) -> U256 {
    match chain_id {
        ETHEREUM => U256::from(30 * GWEI),
        BASE => U256::from(GWEI / 100),    // 0.01 gwei
        ARBITRUM => U256::from(GWEI / 10), // 0.1 gwei
        POLYGON => U256::from(50 * GWEI),
        _ => U256::from(30 * GWEI),
    }
}

/// Run `op` up to `max_retries + 1` times, sleeping `base_delay * 2^attempt` between tries
pub async fn retry_with_backoff<T, E, F, Fut>(chain_id: u64, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut last_error = String::from("Unknown error");
    for attempt in 0..=policy.max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = e.to_string();
                if attempt == policy.max_retries {
                    break;
                }
                let delay = policy.base_delay * 2u32.saturating_pow(attempt);
                debug!(chain_id, attempt, ?delay, err = %last_error, "RPC call failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(YieldError::rpc(
        chain_id,
        format!("Failed after {} retries: {}", policy.max_retries, last_error),
    ))
}

/// Where the multi-chain optimizer gets gas prices from
#[async_trait]
pub trait GasPriceSource: Send + Sync {
    /// Live gas price in wei, or the static fallback for the chain
    async fn gas_price_or_fallback(&self, chain_id: u64) -> U256;
}

/// One lazily created JSON-RPC provider per chain
pub struct RpcPool {
    endpoints: HashMap<u64, String>,
    clients: RwLock<HashMap<u64, Arc<Provider<Http>>>>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl RpcPool {
    pub fn new(config: &Config) -> Self {
        Self {
            endpoints: config.rpc_urls.clone(),
            clients: RwLock::new(HashMap::new()),
            timeout: config.rpc_timeout,
            retry: config.retry,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn supports_chain(&self, chain_id: u64) -> bool {
        self.endpoints.contains_key(&chain_id)
    }

    pub fn client(&self, chain_id: u64) -> Result<Arc<Provider<Http>>> {
        if let Some(client) = self
            .clients
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&chain_id)
        {
            return Ok(client.clone());
        }

        let endpoint = self
            .endpoints
            .get(&chain_id)
            .ok_or_else(|| YieldError::rpc(chain_id, format!("Unsupported chain ID: {chain_id}")))?;
        let url = Url::parse(endpoint)
            .map_err(|e| YieldError::rpc(chain_id, format!("Invalid RPC endpoint {endpoint}: {e}")))?;
        let http_client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| YieldError::rpc(chain_id, format!("Failed to build HTTP client: {e}")))?;
        let provider = Arc::new(Provider::new(Http::new_with_client(url, http_client)));

        let mut clients = self.clients.write().unwrap_or_else(|p| p.into_inner());
        // Another caller may have raced us here; keep whichever landed first
        let client = clients.entry(chain_id).or_insert(provider).clone();
        debug!(chain_id, "RPC client created");
        Ok(client)
    }

    pub async fn block_number(&self, chain_id: u64) -> Result<u64> {
        let client = self.client(chain_id)?;
        let client = &client;
        let block = retry_with_backoff(chain_id, self.retry, move || async move {
            client.get_block_number().await
        })
        .await?;
        Ok(block.as_u64())
    }

    pub async fn gas_price(&self, chain_id: u64) -> Result<U256> {
        let client = self.client(chain_id)?;
        let client = &client;
        retry_with_backoff(chain_id, self.retry, move || async move { client.get_gas_price().await }).await
    }

    /// USD cost of `gas_units` at the current gas price, 2 decimals
    pub async fn estimate_gas_cost_usd(
        &self,
        chain_id: u64,
        gas_units: U256,
        eth_price_usd: Decimal,
    ) -> Result<Decimal> {
        let gas_price = self.gas_price(chain_id).await?;
        let cost_eth = format_amount(gas_price.saturating_mul(gas_units), 18, 18)?;
        Ok(round_2dp(cost_eth * eth_price_usd))
    }

    #[instrument(skip(self))]
    pub async fn check_health(&self, chain_id: u64) -> bool {
        let client = match self.client(chain_id) {
            Ok(client) => client,
            Err(e) => {
                warn!(err = %e, "RPC health check failed");
                return false;
            }
        };
        match client.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                warn!(err = %e, "RPC health check failed");
                false
            }
        }
    }

    pub fn clear(&self) {
        self.clients.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl GasPriceSource for RpcPool {
    async fn gas_price_or_fallback(&self, chain_id: u64) -> U256 {
        match self.gas_price(chain_id).await {
            Ok(price) => price,
            Err(e) => {
                let fallback = fallback_gas_price(chain_id);
                warn!(chain_id, err = %e, fallback = %fallback, "Gas price lookup failed, using fallback");
                fallback
            }
        }
    }
}
