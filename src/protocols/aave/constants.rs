use std::time::Duration;

use crate::protocols::TokenInfo;
use crate::types::{ARBITRUM, BASE, ETHEREUM, POLYGON};

pub const AAVE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

const POOLS: [(u64, &str); 4] = [
    (ETHEREUM, "0x87870Bca3F3fD6335C3F4ce8392D69350B4fA4E2"),
    (POLYGON, "0x794a61358D6845594F94dc1DB02A252b5b4814aD"),
    (BASE, "0xA238Dd80C259a72e81d7e4664a9801593F98d1c5"),
    (ARBITRUM, "0x794a61358D6845594F94dc1DB02A252b5b4814aD"),
];

const ETHEREUM_RESERVES: &[TokenInfo] = &[
    TokenInfo { symbol: "USDC", address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", decimals: 6 },
    TokenInfo { symbol: "USDT", address: "0xdAC17F958D2ee523a2206206994597C13D831ec7", decimals: 6 },
];

const POLYGON_RESERVES: &[TokenInfo] = &[
    TokenInfo { symbol: "USDC", address: "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359", decimals: 6 },
    TokenInfo { symbol: "USDC.e", address: "0x2791Bca1f2de4661ed88a30c99a7a9449aa84174", decimals: 6 },
    TokenInfo { symbol: "USDT", address: "0xc2132D05D31c914a87C6611C10748AEb04B58e8F", decimals: 6 },
];

const BASE_RESERVES: &[TokenInfo] = &[
    TokenInfo { symbol: "USDC", address: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913", decimals: 6 },
    TokenInfo { symbol: "USDbC", address: "0xd9aAEc86B65D86f6A7B5B1b0c42FFA531710b6CA", decimals: 6 },
];

const ARBITRUM_RESERVES: &[TokenInfo] = &[
    TokenInfo { symbol: "USDC", address: "0xaf88d065e77c8cc2239327c5edb3a432268e5831", decimals: 6 },
    TokenInfo { symbol: "USDT", address: "0xFd086bC7CD5C481DCC9C85ebE478A1C0b69FCbb9", decimals: 6 },
];

pub fn pool_address(chain_id: u64) -> Option<&'static str> {
    POOLS.iter().find(|(id, _)| *id == chain_id).map(|(_, pool)| *pool)
}

pub fn reserves(chain_id: u64) -> &'static [TokenInfo] {
    match chain_id {
        ETHEREUM => ETHEREUM_RESERVES,
        POLYGON => POLYGON_RESERVES,
        BASE => BASE_RESERVES,
        ARBITRUM => ARBITRUM_RESERVES,
        _ => &[],
    }
}

/// Symbol lookup is case-insensitive; the table's spelling is canonical
pub fn reserve(token: &str, chain_id: u64) -> Option<&'static TokenInfo> {
    reserves(chain_id).iter().find(|r| r.symbol.eq_ignore_ascii_case(token))
}
