use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ethers::types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, YieldError};
use crate::types::{Protocol, TxReceipt};

/// Gas assumed per protocol when a deposit cannot be estimated
pub const FALLBACK_BATCH_GAS: u64 = 250_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One protocol after another, in allocation order
    #[default]
    Sequential,
    /// All protocols at once; each branch fails on its own
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = YieldError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            other => Err(YieldError::Config(format!("unknown execution mode {other}"))),
        }
    }
}

/// Share of a batch routed to one protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationShare {
    pub protocol: Protocol,
    /// 0..=100
    #[serde(with = "rust_decimal::serde::str")]
    pub percentage: Decimal,
    /// Base units; required for withdrawals, derived for deposits
    pub amount: Option<U256>,
}

impl AllocationShare {
    pub fn new(protocol: Protocol, percentage: Decimal) -> Self {
        Self { protocol, percentage, amount: None }
    }

    pub fn with_amount(protocol: Protocol, amount: U256) -> Self {
        Self { protocol, percentage: Decimal::ZERO, amount: Some(amount) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchDepositRequest {
    pub token: String,
    pub chain_id: u64,
    /// Base units
    pub total_amount: U256,
    pub allocations: Vec<AllocationShare>,
    pub execution_mode: ExecutionMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchWithdrawalRequest {
    pub token: String,
    pub chain_id: u64,
    pub allocations: Vec<AllocationShare>,
    pub execution_mode: ExecutionMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolExecutionResult {
    pub protocol: Protocol,
    pub success: bool,
    pub receipt: Option<TxReceipt>,
    pub error: Option<String>,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExecutionResult {
    /// True only when every protocol succeeded
    pub overall_success: bool,
    pub results: Vec<ProtocolExecutionResult>,
    /// Sum over successful branches
    pub total_processed: U256,
    pub total_gas_used: U256,
    pub failed_protocols: Vec<Protocol>,
    /// Base units left unallocated by whole basis-point splitting
    pub remainder: U256,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchGasEstimate {
    pub total_gas: U256,
    pub per_protocol: HashMap<Protocol, U256>,
}
