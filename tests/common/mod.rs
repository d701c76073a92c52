#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use ethers::prelude::*;
use rust_decimal::{Decimal, dec};

use stable_yield_engine::error::{Result, YieldError};
use stable_yield_engine::protocols::{ProtocolAdapter, TxSigner, approval_request};
use stable_yield_engine::rpc::GasPriceSource;
use stable_yield_engine::types::{
    ApprovalStatus, Protocol, ProtocolPosition, TransactionRequest, TxReceipt, TxStatus, YieldOpportunity,
};

const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

/// Signer pointed at a dead endpoint; the static adapter never broadcasts
pub fn signer(chain_id: u64) -> Arc<TxSigner> {
    let provider = Provider::<Http>::try_from("http://127.0.0.1:9").unwrap();
    let wallet = TEST_KEY.parse::<LocalWallet>().unwrap().with_chain_id(chain_id);
    Arc::new(SignerMiddleware::new(Arc::new(provider), wallet))
}

/// Fixed markets and positions, keyed by (token, chain)
pub struct StaticAdapter {
    protocol: Protocol,
    markets: HashMap<(String, u64), YieldOpportunity>,
    positions: HashMap<(String, u64), ProtocolPosition>,
    broken: bool,
    pub deposits: Mutex<Vec<U256>>,
}

impl StaticAdapter {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            markets: HashMap::new(),
            positions: HashMap::new(),
            broken: false,
            deposits: Mutex::new(Vec::new()),
        }
    }

    pub fn market(mut self, token: &str, chain_id: u64, apy: Decimal, tvl: Decimal) -> Self {
        let market = YieldOpportunity {
            protocol: self.protocol,
            token: token.to_string(),
            token_address: Address::repeat_byte(0xaa),
            chain_id,
            supply_apy: apy,
            borrow_apy: None,
            tvl,
            liquidity: tvl * dec!(0.8),
            utilization: None,
            timestamp: Utc::now(),
            metadata: None,
        };
        self.markets.insert((token.to_string(), chain_id), market);
        self
    }

    pub fn position(mut self, token: &str, chain_id: u64, value: Decimal, apy: Decimal) -> Self {
        let held = ProtocolPosition {
            protocol: self.protocol,
            token: token.to_string(),
            token_address: Address::repeat_byte(0xaa),
            chain_id,
            amount: U256::zero(),
            amount_formatted: value,
            value_usd: value,
            apy,
            earned_yield: None,
        };
        self.positions.insert((token.to_string(), chain_id), held);
        self
    }

    /// Every read and write fails
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    fn check(&self, token: &str, chain_id: u64) -> Result<()> {
        if self.broken {
            return Err(YieldError::protocol(self.protocol, "node unreachable"));
        }
        if !self.supports_token(token, chain_id) {
            return Err(YieldError::protocol(self.protocol, format!("Token {token} not supported on chain {chain_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolAdapter for StaticAdapter {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn supports_token(&self, token: &str, chain_id: u64) -> bool {
        self.markets.contains_key(&(token.to_string(), chain_id))
    }

    fn supported_tokens(&self, chain_id: u64) -> Vec<String> {
        self.markets.keys().filter(|(_, c)| *c == chain_id).map(|(t, _)| t.clone()).collect()
    }

    fn token_address(&self, token: &str, chain_id: u64) -> Result<Address> {
        self.check(token, chain_id).map(|_| Address::repeat_byte(0xaa))
    }

    fn spender(&self, _token: &str, _chain_id: u64) -> Result<Address> {
        Ok(Address::repeat_byte(0xbb))
    }

    async fn supply_apy(&self, token: &str, chain_id: u64) -> Result<Decimal> {
        self.metrics(token, chain_id).await.map(|m| m.supply_apy)
    }

    async fn user_position(&self, _wallet: Address, token: &str, chain_id: u64) -> Result<Option<ProtocolPosition>> {
        if self.broken {
            return Err(YieldError::protocol(self.protocol, "node unreachable"));
        }
        Ok(self.positions.get(&(token.to_string(), chain_id)).cloned())
    }

    async fn metrics(&self, token: &str, chain_id: u64) -> Result<YieldOpportunity> {
        self.check(token, chain_id)?;
        Ok(self.markets[&(token.to_string(), chain_id)].clone())
    }

    fn prepare_deposit(&self, token: &str, chain_id: u64, amount: U256, _on_behalf_of: Address) -> Result<TransactionRequest> {
        let token_address = self.token_address(token, chain_id)?;
        Ok(approval_request(token_address, Address::repeat_byte(0xbb), amount, chain_id))
    }

    fn prepare_withdrawal(&self, token: &str, chain_id: u64, amount: U256, to: Address) -> Result<TransactionRequest> {
        let token_address = self.token_address(token, chain_id)?;
        Ok(approval_request(token_address, to, amount, chain_id))
    }

    async fn check_approval(&self, _token: &str, _chain_id: u64, _owner: Address, amount: U256) -> Result<ApprovalStatus> {
        Ok(ApprovalStatus::new(U256::MAX, amount, Address::repeat_byte(0xbb)))
    }

    async fn estimate_deposit_gas(&self, token: &str, chain_id: u64, _amount: U256, _from: Address) -> Result<U256> {
        self.check(token, chain_id)?;
        Ok(U256::from(180_000u64))
    }

    async fn estimate_withdrawal_gas(&self, token: &str, chain_id: u64, _amount: U256, _from: Address) -> Result<U256> {
        self.check(token, chain_id)?;
        Ok(U256::from(140_000u64))
    }

    async fn execute_deposit(&self, token: &str, chain_id: u64, amount: U256, signer: Arc<TxSigner>) -> Result<TxReceipt> {
        self.check(token, chain_id)?;
        self.deposits.lock().unwrap().push(amount);
        Ok(TxReceipt {
            hash: H256::repeat_byte(0x42),
            block_number: Some(1),
            status: TxStatus::Success,
            gas_used: U256::from(120_000u64),
            effective_gas_price: None,
            from: signer.address(),
            to: Some(Address::repeat_byte(0xbb)),
            timestamp: Utc::now(),
        })
    }

    async fn execute_withdrawal(&self, token: &str, chain_id: u64, _amount: U256, signer: Arc<TxSigner>) -> Result<TxReceipt> {
        self.check(token, chain_id)?;
        Ok(TxReceipt {
            hash: H256::repeat_byte(0x42),
            block_number: Some(1),
            status: TxStatus::Reverted,
            gas_used: U256::from(90_000u64),
            effective_gas_price: None,
            from: signer.address(),
            to: Some(Address::repeat_byte(0xbb)),
            timestamp: Utc::now(),
        })
    }
}

/// Each chain's fallback price, without a node
pub struct FallbackGas;

#[async_trait]
impl GasPriceSource for FallbackGas {
    async fn gas_price_or_fallback(&self, chain_id: u64) -> U256 {
        stable_yield_engine::rpc::fallback_gas_price(chain_id)
    }
}

pub fn dyn_adapters(adapters: &[Arc<StaticAdapter>]) -> Vec<Arc<dyn ProtocolAdapter>> {
    adapters.iter().map(|a| a.clone() as Arc<dyn ProtocolAdapter>).collect()
}
