//! In-memory adapter for exercising the fan-out layers without a node

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use ethers::prelude::*;
use rust_decimal::{Decimal, dec};

use crate::error::{Result, YieldError};
use crate::formatting::parse_amount;
use crate::types::{
    ApprovalStatus, Protocol, ProtocolPosition, TransactionRequest, TxReceipt, TxStatus,
    YieldOpportunity,
};

use super::{ProtocolAdapter, TxSigner, approval_request, unsupported_token};

pub(crate) const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

pub(crate) fn test_signer(chain_id: u64) -> Arc<TxSigner> {
    let provider = Provider::<Http>::try_from("http://127.0.0.1:9").unwrap();
    let wallet: LocalWallet = TEST_KEY.parse::<LocalWallet>().unwrap().with_chain_id(chain_id);
    Arc::new(SignerMiddleware::new(Arc::new(provider), wallet))
}

pub(crate) fn opportunity(
    protocol: Protocol,
    token: &str,
    chain_id: u64,
    apy: Decimal,
    tvl: Decimal,
) -> YieldOpportunity {
    YieldOpportunity {
        protocol,
        token: token.to_string(),
        token_address: Address::repeat_byte(0xee),
        chain_id,
        supply_apy: apy,
        borrow_apy: None,
        tvl,
        liquidity: tvl * dec!(0.8),
        utilization: None,
        timestamp: Utc::now(),
        metadata: None,
    }
}

pub(crate) fn position(protocol: Protocol, token: &str, chain_id: u64, value: Decimal, apy: Decimal) -> ProtocolPosition {
    ProtocolPosition {
        protocol,
        token: token.to_string(),
        token_address: Address::repeat_byte(0xee),
        chain_id,
        amount: parse_amount(&value.round_dp(6).to_string(), 6).unwrap(),
        amount_formatted: value,
        value_usd: value,
        apy,
        earned_yield: None,
    }
}

pub(crate) struct MockAdapter {
    protocol: Protocol,
    markets: HashMap<(String, u64), YieldOpportunity>,
    positions: HashMap<(String, u64), ProtocolPosition>,
    failure: Option<String>,
    execution_failure: Option<String>,
    gas: U256,
    metric_calls: AtomicUsize,
    executed: Mutex<Vec<(String, U256)>>,
}

impl MockAdapter {
    pub(crate) fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            markets: HashMap::new(),
            positions: HashMap::new(),
            failure: None,
            execution_failure: None,
            gas: U256::from(150_000u64),
            metric_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_market(mut self, token: &str, chain_id: u64, apy: Decimal, tvl: Decimal) -> Self {
        let market = opportunity(self.protocol, token, chain_id, apy, tvl);
        self.markets.insert((token.to_string(), chain_id), market);
        self
    }

    pub(crate) fn with_position(mut self, token: &str, chain_id: u64, value: Decimal, apy: Decimal) -> Self {
        let held = position(self.protocol, token, chain_id, value, apy);
        self.positions.insert((token.to_string(), chain_id), held);
        self
    }

    /// Every data call on a listed market fails with `message`
    pub(crate) fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub(crate) fn failing_execution(mut self, message: &str) -> Self {
        self.execution_failure = Some(message.to_string());
        self
    }

    pub(crate) fn metric_calls(&self) -> usize {
        self.metric_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn executed(&self) -> Vec<(String, U256)> {
        self.executed.lock().unwrap().clone()
    }

    fn check(&self, token: &str, chain_id: u64) -> Result<()> {
        if !self.supports_token(token, chain_id) {
            return Err(unsupported_token(self.protocol, token, chain_id));
        }
        match &self.failure {
            Some(message) => Err(YieldError::protocol(self.protocol, message.clone())),
            None => Ok(()),
        }
    }

    fn receipt(&self, from: Address) -> TxReceipt {
        TxReceipt {
            hash: H256::repeat_byte(self.executed.lock().unwrap().len() as u8),
            block_number: Some(1),
            status: TxStatus::Success,
            gas_used: self.gas,
            effective_gas_price: None,
            from,
            to: None,
            timestamp: Utc::now(),
        }
    }

    fn record(&self, token: &str, amount: U256, from: Address) -> Result<TxReceipt> {
        if let Some(message) = &self.execution_failure {
            return Err(YieldError::protocol(self.protocol, message.clone()));
        }
        self.executed.lock().unwrap().push((token.to_string(), amount));
        Ok(self.receipt(from))
    }
}

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn supports_token(&self, token: &str, chain_id: u64) -> bool {
        self.markets.contains_key(&(token.to_string(), chain_id))
    }

    fn supported_tokens(&self, chain_id: u64) -> Vec<String> {
        let mut tokens: Vec<String> =
            self.markets.keys().filter(|(_, c)| *c == chain_id).map(|(t, _)| t.clone()).collect();
        tokens.sort();
        tokens
    }

    fn token_address(&self, token: &str, chain_id: u64) -> Result<Address> {
        self.check(token, chain_id).map(|_| Address::repeat_byte(0xee))
    }

    fn spender(&self, _token: &str, _chain_id: u64) -> Result<Address> {
        Ok(Address::repeat_byte(0x5e))
    }

    async fn supply_apy(&self, token: &str, chain_id: u64) -> Result<Decimal> {
        self.metrics(token, chain_id).await.map(|m| m.supply_apy)
    }

    async fn user_position(
        &self,
        _wallet: Address,
        token: &str,
        chain_id: u64,
    ) -> Result<Option<ProtocolPosition>> {
        if let Some(message) = &self.failure {
            return Err(YieldError::protocol(self.protocol, message.clone()));
        }
        Ok(self.positions.get(&(token.to_string(), chain_id)).cloned())
    }

    async fn metrics(&self, token: &str, chain_id: u64) -> Result<YieldOpportunity> {
        self.metric_calls.fetch_add(1, Ordering::SeqCst);
        self.check(token, chain_id)?;
        self.markets
            .get(&(token.to_string(), chain_id))
            .cloned()
            .ok_or_else(|| unsupported_token(self.protocol, token, chain_id))
    }

    fn prepare_deposit(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        _on_behalf_of: Address,
    ) -> Result<TransactionRequest> {
        let token_address = self.token_address(token, chain_id)?;
        Ok(approval_request(token_address, Address::repeat_byte(0x5e), amount, chain_id))
    }

    fn prepare_withdrawal(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        to: Address,
    ) -> Result<TransactionRequest> {
        let token_address = self.token_address(token, chain_id)?;
        Ok(approval_request(token_address, to, amount, chain_id))
    }

    async fn check_approval(
        &self,
        _token: &str,
        _chain_id: u64,
        _owner: Address,
        amount: U256,
    ) -> Result<ApprovalStatus> {
        Ok(ApprovalStatus::new(U256::MAX, amount, Address::repeat_byte(0x5e)))
    }

    async fn estimate_deposit_gas(
        &self,
        token: &str,
        chain_id: u64,
        _amount: U256,
        _from: Address,
    ) -> Result<U256> {
        self.check(token, chain_id)?;
        Ok(self.gas)
    }

    async fn estimate_withdrawal_gas(
        &self,
        token: &str,
        chain_id: u64,
        _amount: U256,
        _from: Address,
    ) -> Result<U256> {
        self.check(token, chain_id)?;
        Ok(self.gas)
    }

    async fn execute_deposit(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        signer: Arc<TxSigner>,
    ) -> Result<TxReceipt> {
        self.check(token, chain_id)?;
        self.record(token, amount, signer.address())
    }

    async fn execute_withdrawal(
        &self,
        token: &str,
        chain_id: u64,
        amount: U256,
        signer: Arc<TxSigner>,
    ) -> Result<TxReceipt> {
        self.check(token, chain_id)?;
        self.record(token, amount, signer.address())
    }
}
