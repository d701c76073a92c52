use std::time::Duration;

use crate::protocols::TokenInfo;
use crate::types::{ARBITRUM, BASE, ETHEREUM, POLYGON, SEPOLIA};

pub const COMPOUND_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// One Comet deployment: a single base asset market
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CometMarket {
    pub comet: &'static str,
    pub base: TokenInfo,
}

const fn market(comet: &'static str, symbol: &'static str, address: &'static str) -> CometMarket {
    CometMarket { comet, base: TokenInfo { symbol, address, decimals: 6 } }
}

const ETHEREUM_MARKETS: &[CometMarket] = &[
    market("0xc3d688B66703497DAA19211EEdff47f25384cdc3", "USDC", "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
    market("0x3Afdc9BCA9213A35503b077a6072F3D0d5AB0840", "USDT", "0xdAC17F958D2ee523a2206206994597C13D831ec7"),
];

const POLYGON_MARKETS: &[CometMarket] = &[
    market("0xF25212E676D1F7F89Cd72fFEe66158f541246445", "USDC", "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359"),
    market("0xaeB318360f27748Acb200CE616E389A6C9409a07", "USDT", "0xc2132D05D31c914a87C6611C10748AEb04B58e8F"),
];

const BASE_MARKETS: &[CometMarket] = &[
    market("0xb125E6687d4313864e53df431d5425969c15Eb2F", "USDC", "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
    market("0x9c4ec768c28520B50860ea7a15bd7213a9fF58bf", "USDbC", "0xd9aAEc86B65D86f6A7B5B1b0c42FFA531710b6CA"),
];

const ARBITRUM_MARKETS: &[CometMarket] = &[
    market("0x9c4ec768c28520B50860ea7a15bd7213a9fF58bf", "USDC", "0xaf88d065e77c8cc2239327c5edb3a432268e5831"),
    market("0xA5EDBDD9646f8dFF606d7448e414884C7d905dCA", "USDC.e", "0xFF970A61A04b1cA14834A43f5dE4533eBDDB5CC8"),
    market("0xd98Be00b5D27fc98112BdE293e487f8D4cA57d07", "USDT", "0xFd086bC7CD5C481DCC9C85ebE478A1C0b69FCbb9"),
];

// Test USDC on Sepolia
const SEPOLIA_MARKETS: &[CometMarket] = &[
    market("0xAec1F48e02Cfb822Be958B68C7957156EB3F0b6e", "USDC", "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238"),
];

pub fn markets(chain_id: u64) -> &'static [CometMarket] {
    match chain_id {
        ETHEREUM => ETHEREUM_MARKETS,
        POLYGON => POLYGON_MARKETS,
        BASE => BASE_MARKETS,
        ARBITRUM => ARBITRUM_MARKETS,
        SEPOLIA => SEPOLIA_MARKETS,
        _ => &[],
    }
}

pub fn comet_market(token: &str, chain_id: u64) -> Option<&'static CometMarket> {
    markets(chain_id).iter().find(|m| m.base.symbol.eq_ignore_ascii_case(token))
}
