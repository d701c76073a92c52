use dotenvy::dotenv;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use rust_decimal::Decimal;
use rust_decimal::dec;

use crate::error::{Result, YieldError};
use crate::types::{ARBITRUM, BASE, ETHEREUM, POLYGON, SEPOLIA};

pub const MORPHO_API_URL: &str = "https://api.morpho.org/graphql";

/// Public endpoints used when no override is set in the environment
const DEFAULT_RPC_URLS: [(u64, &str, &str); 5] = [
    (ETHEREUM, "ETHEREUM_RPC_URL", "https://eth.llamarpc.com"),
    (POLYGON, "POLYGON_RPC_URL", "https://polygon-rpc.com"),
    (BASE, "BASE_RPC_URL", "https://mainnet.base.org"),
    (ARBITRUM, "ARBITRUM_RPC_URL", "https://arb1.arbitrum.io/rpc"),
    (SEPOLIA, "SEPOLIA_RPC_URL", "https://rpc.sepolia.org"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_urls: HashMap<u64, String>,
    pub morpho_api_url: String,
    pub rpc_timeout: Duration,
    pub retry: RetryPolicy,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub eth_price_usd: Decimal,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rpc_urls: DEFAULT_RPC_URLS
                .iter()
                .map(|(chain_id, _, url)| (*chain_id, url.to_string()))
                .collect(),
            morpho_api_url: MORPHO_API_URL.to_string(),
            rpc_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            cache_ttl: Duration::from_secs(5 * 60),
            cache_sweep_interval: Duration::from_secs(10 * 60),
            eth_price_usd: dec!(2000),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let defaults = Config::default();

        let rpc_urls = DEFAULT_RPC_URLS
            .iter()
            .map(|(chain_id, var, default)| {
                let url = env::var(var).unwrap_or_else(|_| default.to_string());
                (*chain_id, url)
            })
            .collect();

        Ok(Config {
            rpc_urls,
            morpho_api_url: env::var("MORPHO_API_URL").unwrap_or(defaults.morpho_api_url),
            rpc_timeout: Duration::from_secs(env_or("RPC_TIMEOUT_SECS", 30u64)?),
            retry: RetryPolicy {
                max_retries: env_or("RPC_MAX_RETRIES", 3u32)?,
                base_delay: Duration::from_millis(env_or("RPC_RETRY_DELAY_MS", 1000u64)?),
            },
            cache_ttl: Duration::from_secs(env_or("CACHE_TTL_SECS", 300u64)?),
            cache_sweep_interval: Duration::from_secs(env_or("CACHE_SWEEP_INTERVAL_SECS", 600u64)?),
            eth_price_usd: env_or("ETH_PRICE_USD", defaults.eth_price_usd)?,
        })
    }

    pub fn rpc_url(&self, chain_id: u64) -> Option<&str> {
        self.rpc_urls.get(&chain_id).map(String::as_str)
    }
}

/// Parse an env var, falling back to `default` when unset
fn env_or<T: FromStr>(var: &str, default: T) -> Result<T> {
    parse_or(var, env::var(var).ok(), default)
}

fn parse_or<T: FromStr>(var: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| YieldError::Config(format!("{var} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}
