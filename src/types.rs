use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use rust_decimal::Decimal;
use rust_decimal::dec;
use serde::{Deserialize, Serialize};

use crate::error::{Result, YieldError};

pub const ETHEREUM: u64 = 1;
pub const POLYGON: u64 = 137;
pub const BASE: u64 = 8453;
pub const ARBITRUM: u64 = 42161;
pub const SEPOLIA: u64 = 11155111;

pub const SECONDS_PER_YEAR: u64 = 31_536_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Aave,
    Compound,
    Morpho,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Aave, Protocol::Compound, Protocol::Morpho];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aave => "aave",
            Self::Compound => "compound",
            Self::Morpho => "morpho",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = YieldError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "aave" => Ok(Self::Aave),
            "compound" => Ok(Self::Compound),
            "morpho" => Ok(Self::Morpho),
            other => Err(YieldError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Protocol-specific extras attached to an opportunity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum OpportunityMetadata {
    Aave {
        a_token_address: Address,
        liquidity_index: U256,
        last_update: u64,
    },
    Compound {
        comet_address: Address,
        total_supply: U256,
        total_borrow: U256,
    },
    Morpho {
        vault_address: Address,
        vault_name: String,
        total_assets: U256,
    },
}

/// One protocol's current offer for one token on one chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldOpportunity {
    pub protocol: Protocol,
    pub token: String,
    pub token_address: Address,
    pub chain_id: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub supply_apy: Decimal,    // percent, 2dp
    #[serde(with = "rust_decimal::serde::str_option")]
    pub borrow_apy: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub tvl: Decimal,           // USD
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidity: Decimal,     // USD
    #[serde(with = "rust_decimal::serde::str_option")]
    pub utilization: Option<Decimal>,
    pub timestamp: DateTime<Utc>, // fetch time
    pub metadata: Option<OpportunityMetadata>,
}

/// A wallet's current stake in one protocol/token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolPosition {
    pub protocol: Protocol,
    pub token: String,
    pub token_address: Address,
    pub chain_id: u64,
    pub amount: U256,            // base units
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_formatted: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub value_usd: Decimal,      // 1:1 peg for stablecoins
    #[serde(with = "rust_decimal::serde::str")]
    pub apy: Decimal,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub earned_yield: Option<Decimal>,
}

/// Protocol-wide health snapshot on a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMetrics {
    pub protocol: Protocol,
    pub chain_id: u64,
    #[serde(with = "rust_decimal::serde::str")]
    pub tvl_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub available_liquidity_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_supply_apy: Decimal,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub total_borrows_usd: Option<Decimal>,
    pub is_healthy: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = YieldError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "moderate" => Ok(Self::Moderate),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(YieldError::Config(format!("unknown risk level '{other}'"))),
        }
    }
}

/// Policy for when switching protocols is worth it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceConfig {
    #[serde(with = "rust_decimal::serde::str")]
    pub min_apy_delta: Decimal,      // percentage points
    #[serde(with = "rust_decimal::serde::str")]
    pub min_gain_threshold: Decimal, // USD over 30 days, net of gas
    #[serde(with = "rust_decimal::serde::str")]
    pub max_gas_cost_usd: Decimal,
    pub cooldown_hours: u32,
    pub enabled: bool,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            min_apy_delta: dec!(1.0),
            min_gain_threshold: dec!(10),
            max_gas_cost_usd: dec!(50),
            cooldown_hours: 24,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub level: RiskLevel,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_slippage: Decimal,
    pub preferred_protocols: Option<Vec<Protocol>>,
    pub excluded_protocols: Option<Vec<Protocol>>,
    #[serde(with = "rust_decimal::serde::str")]
    pub min_protocol_tvl: Decimal,
    pub rebalance_config: Option<RebalanceConfig>,
}

impl Default for RiskProfile {
    fn default() -> Self {
        Self {
            level: RiskLevel::Moderate,
            max_slippage: dec!(0.5),
            preferred_protocols: None,
            excluded_protocols: None,
            min_protocol_tvl: dec!(100000000),
            rebalance_config: None,
        }
    }
}

impl RiskProfile {
    pub fn with_level(level: RiskLevel) -> Self {
        Self { level, ..Self::default() }
    }

    /// Preferred and excluded lists must leave at least one protocol eligible
    pub fn validate(&self) -> Result<()> {
        if let Some(preferred) = self.preferred_protocols.as_ref().filter(|p| !p.is_empty()) {
            let excluded = self.excluded_protocols.as_deref().unwrap_or(&[]);
            if preferred.iter().all(|p| excluded.contains(p)) {
                return Err(YieldError::Config(
                    "preferred and excluded protocols leave no eligible protocol".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Shared allow/deny filter used by every ranking policy
    pub fn admits(&self, protocol: Protocol) -> bool {
        if let Some(preferred) = self.preferred_protocols.as_ref().filter(|p| !p.is_empty()) {
            if !preferred.contains(&protocol) {
                return false;
            }
        }
        if let Some(excluded) = &self.excluded_protocols {
            if excluded.contains(&protocol) {
                return false;
            }
        }
        true
    }
}

/// Unsigned transaction intent, handed to an external signer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub chain_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStatus {
    pub is_approved: bool,
    pub current_allowance: U256,
    pub required_amount: U256,
    pub needs_approval: bool,
    pub spender: Address,
}

impl ApprovalStatus {
    pub fn new(current_allowance: U256, required_amount: U256, spender: Address) -> Self {
        let is_approved = current_allowance >= required_amount;
        Self {
            is_approved,
            current_allowance,
            required_amount,
            needs_approval: !is_approved,
            spender,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub hash: H256,
    pub block_number: Option<u64>,
    pub status: TxStatus,
    pub gas_used: U256,
    pub effective_gas_price: Option<U256>,
    pub from: Address,
    pub to: Option<Address>,
    pub timestamp: DateTime<Utc>,
}

impl From<ethers::types::TransactionReceipt> for TxReceipt {
    fn from(receipt: ethers::types::TransactionReceipt) -> Self {
        let status = match receipt.status {
            Some(s) if s.as_u64() == 1 => TxStatus::Success,
            _ => TxStatus::Reverted,
        };
        Self {
            hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()),
            status,
            gas_used: receipt.gas_used.unwrap_or_default(),
            effective_gas_price: receipt.effective_gas_price,
            from: receipt.from,
            to: receipt.to,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationAction {
    Hold,
    Rebalance,
}
