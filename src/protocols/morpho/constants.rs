use std::time::Duration;

use crate::protocols::TokenInfo;
use crate::types::{BASE, ETHEREUM};

pub const MORPHO_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Which indexer query shape a vault answers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultConfig {
    pub vault: &'static str,
    pub name: &'static str,
    pub version: ApiVersion,
    pub base: TokenInfo,
}

const ETHEREUM_VAULTS: &[VaultConfig] = &[
    VaultConfig {
        vault: "0xdd0f28e19C1780eb6396170735D45153D261490d",
        name: "Gauntlet USDC Prime",
        version: ApiVersion::V1,
        base: TokenInfo { symbol: "USDC", address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", decimals: 6 },
    },
    VaultConfig {
        vault: "0x1CE2354074C717a266aDADCD5e34104f233Da446",
        name: "Re7 USDT",
        version: ApiVersion::V2,
        base: TokenInfo { symbol: "USDT", address: "0xdAC17F958D2ee523a2206206994597C13D831ec7", decimals: 6 },
    },
];

const BASE_VAULTS: &[VaultConfig] = &[VaultConfig {
    vault: "0x618495ccC4e751178C4914b1E939C0fe0FB07b9b",
    name: "Base USDC Vault",
    version: ApiVersion::V2,
    base: TokenInfo { symbol: "USDC", address: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913", decimals: 6 },
}];

pub fn vaults(chain_id: u64) -> &'static [VaultConfig] {
    match chain_id {
        ETHEREUM => ETHEREUM_VAULTS,
        BASE => BASE_VAULTS,
        _ => &[],
    }
}

pub fn vault(token: &str, chain_id: u64) -> Option<&'static VaultConfig> {
    vaults(chain_id).iter().find(|v| v.base.symbol.eq_ignore_ascii_case(token))
}
