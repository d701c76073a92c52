use std::sync::Arc;
use std::time::Duration;

use ethers::types::Address;
use governor::{DefaultDirectRateLimiter, Quota};
use nonzero_ext::*;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::error::{Result, YieldError};
use crate::formatting::fraction_to_percent;

use super::constants::ApiVersion;

struct MorphoRateLimiter {
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl reqwest_ratelimit::RateLimiter for MorphoRateLimiter {
    async fn acquire_permit(&self) {
        self.rate_limiter.until_ready().await;
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V1Data {
    vault_by_address: Option<V1Vault>,
}

#[derive(Debug, Deserialize)]
struct V1Vault {
    state: Option<V1State>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V1State {
    net_apy: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V2Data {
    vault_v2_by_address: Option<V2Vault>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V2Vault {
    avg_net_apy: Option<f64>,
}

/// Vault APY from the Morpho GraphQL indexer
#[derive(Debug, Clone)]
pub struct MorphoApiClient {
    http_client: ClientWithMiddleware,
    url: String,
}

impl MorphoApiClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let reqwest_client = reqwest_middleware::reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| YieldError::Config(format!("Failed to create Morpho HTTP client: {e}")))?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(500), Duration::from_millis(2000))
            .build_with_max_retries(3);

        let rate_limiter = MorphoRateLimiter {
            rate_limiter: Arc::new(DefaultDirectRateLimiter::direct(Quota::per_second(nonzero!(5u32)))),
        };

        let http_client = ClientBuilder::new(reqwest_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .with(reqwest_ratelimit::all(rate_limiter))
            .build();

        Ok(Self { http_client, url: url.into() })
    }

    /// Net APY in percent, routed to the query shape the vault answers to
    #[instrument(skip(self))]
    pub async fn vault_apy(&self, vault: Address, chain_id: u64, version: ApiVersion) -> Result<Decimal> {
        match version {
            ApiVersion::V1 => {
                let response = self.query::<V1Data>(v1_query(vault)).await?;
                parse_v1(response, vault)
            }
            ApiVersion::V2 => {
                let response = self.query::<V2Data>(v2_query(vault, chain_id)).await?;
                parse_v2(response, vault, chain_id)
            }
        }
    }

    async fn query<T>(&self, query: String) -> Result<GraphQlResponse<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .http_client
            .post(&self.url)
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| YieldError::Api(format!("Morpho API request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(YieldError::Api(format!("Morpho API request failed: {status}")));
        }

        let body = response
            .json::<GraphQlResponse<T>>()
            .await
            .map_err(|e| YieldError::Api(format!("Morpho API returned malformed JSON: {e}")))?;
        debug!(has_data = body.data.is_some(), "Morpho API response");
        Ok(body)
    }
}

fn v1_query(vault: Address) -> String {
    format!(r#"query {{ vaultByAddress(address: "{vault:?}") {{ state {{ netApy }} }} }}"#)
}

fn v2_query(vault: Address, chain_id: u64) -> String {
    format!(r#"query {{ vaultV2ByAddress(address: "{vault:?}", chainId: {chain_id}) {{ avgNetApy }} }}"#)
}

fn first_error<T>(response: &GraphQlResponse<T>) -> Option<YieldError> {
    response
        .errors
        .as_ref()
        .and_then(|errors| errors.first())
        .map(|e| YieldError::Api(format!("Morpho API error: {}", e.message)))
}

/// Missing APY reads as 0.00
fn apy_from_fraction(net_apy: Option<f64>) -> Decimal {
    net_apy.map(fraction_to_percent).unwrap_or(Decimal::ZERO)
}

fn parse_v1(response: GraphQlResponse<V1Data>, vault: Address) -> Result<Decimal> {
    if let Some(err) = first_error(&response) {
        return Err(err);
    }
    let state = response
        .data
        .and_then(|d| d.vault_by_address)
        .and_then(|v| v.state)
        .ok_or_else(|| YieldError::Api(format!("V1 Vault not found: {vault:?}")))?;
    Ok(apy_from_fraction(state.net_apy))
}

fn parse_v2(response: GraphQlResponse<V2Data>, vault: Address, chain_id: u64) -> Result<Decimal> {
    if let Some(err) = first_error(&response) {
        return Err(err);
    }
    let found = response
        .data
        .and_then(|d| d.vault_v2_by_address)
        .ok_or_else(|| YieldError::Api(format!("V2 Vault not found: {vault:?} on chain {chain_id}")))?;
    Ok(apy_from_fraction(found.avg_net_apy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::dec;

    fn vault() -> Address {
        Address::repeat_byte(0x61)
    }

    #[test]
    fn v1_net_apy_becomes_percent() {
        let body = r#"{"data":{"vaultByAddress":{"state":{"netApy":0.05251}}}}"#;
        let parsed = parse_v1(serde_json::from_str(body).unwrap(), vault()).unwrap();
        assert_eq!(parsed, dec!(5.25));
    }

    #[test]
    fn v2_null_apy_degrades_to_zero() {
        let body = r#"{"data":{"vaultV2ByAddress":{"avgNetApy":null}}}"#;
        let parsed = parse_v2(serde_json::from_str(body).unwrap(), vault(), 8453).unwrap();
        assert_eq!(parsed, Decimal::ZERO);
    }

    #[test]
    fn missing_vault_is_reported_per_version() {
        let v1 = parse_v1(serde_json::from_str(r#"{"data":{"vaultByAddress":null}}"#).unwrap(), vault());
        assert!(v1.unwrap_err().to_string().starts_with("V1 Vault not found"));

        let v2 = parse_v2(serde_json::from_str(r#"{"data":null}"#).unwrap(), vault(), 1);
        assert!(v2.unwrap_err().to_string().starts_with("V2 Vault not found"));
    }

    #[test]
    fn graphql_errors_win_over_data() {
        let body = r#"{"data":null,"errors":[{"message":"rate limited"},{"message":"other"}]}"#;
        let err = parse_v2(serde_json::from_str(body).unwrap(), vault(), 1).unwrap_err();
        assert_eq!(err.to_string(), "Morpho API error: rate limited");
    }

    #[test]
    fn queries_match_indexer_schema() {
        let v1 = v1_query(vault());
        assert!(v1.contains("vaultByAddress(address: \"0x6161"));
        assert!(v1.contains("state { netApy }"));
        let v2 = v2_query(vault(), 8453);
        assert!(v2.contains("chainId: 8453"));
        assert!(v2.contains("avgNetApy"));
    }

    #[tokio::test]
    async fn unreachable_indexer_is_an_api_error() {
        let client = MorphoApiClient::new("http://127.0.0.1:9/graphql", Duration::from_millis(200)).unwrap();
        let err = client.vault_apy(vault(), 1, ApiVersion::V1).await.unwrap_err();
        assert!(matches!(err, YieldError::Api(_)));
    }
}
