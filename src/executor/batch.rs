use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use ethers::types::{Address, U256};
use futures::future::join_all;
use rust_decimal::prelude::*;
use rust_decimal::{Decimal, dec};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, YieldError};
use crate::protocols::{ProtocolAdapter, TxSigner};
use crate::types::{Protocol, TxStatus};

use super::types::{
    AllocationShare, BatchDepositRequest, BatchExecutionResult, BatchGasEstimate, BatchWithdrawalRequest,
    ExecutionMode, FALLBACK_BATCH_GAS, ProtocolExecutionResult,
};

const PERCENT_TOLERANCE: Decimal = dec!(0.01);
const BASIS_POINTS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Deposit,
    Withdrawal,
}

/// Rejects any allocation set that does not add up to 100% (within 0.01)
pub fn validate_allocations(allocations: &[AllocationShare]) -> Result<()> {
    if let Some(negative) = allocations.iter().find(|a| a.percentage.is_sign_negative()) {
        return Err(YieldError::InvalidAllocation(format!(
            "Allocation for {} is negative: {}%",
            negative.protocol, negative.percentage
        )));
    }
    let total: Decimal = allocations.iter().map(|a| a.percentage).sum();
    if (total - Decimal::ONE_HUNDRED).abs() > PERCENT_TOLERANCE {
        return Err(YieldError::InvalidAllocation(format!(
            "Allocations must sum to 100%, got {}%",
            total.normalize()
        )));
    }
    total_basis_points(allocations)?;
    Ok(())
}

fn basis_points(percentage: Decimal) -> Result<u64> {
    (percentage * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .ok_or_else(|| YieldError::InvalidAllocation(format!("bad percentage {percentage}")))
}

/// Rounded shares may never claim more than the whole amount
fn total_basis_points(allocations: &[AllocationShare]) -> Result<u64> {
    let mut total = 0u64;
    for allocation in allocations {
        total = total.saturating_add(basis_points(allocation.percentage)?);
    }
    if total > BASIS_POINTS {
        return Err(YieldError::InvalidAllocation(format!(
            "Allocations round to {total} basis points, more than the {BASIS_POINTS} available"
        )));
    }
    Ok(total)
}

/// `total * round(pct * 100) / 10000` per share, in integer base units.
/// Returns the per-share amounts and whatever the floors left over.
pub fn split_amount(total: U256, allocations: &[AllocationShare]) -> Result<(Vec<U256>, U256)> {
    total_basis_points(allocations)?;
    let mut amounts = Vec::with_capacity(allocations.len());
    for allocation in allocations {
        let bps = U256::from(basis_points(allocation.percentage)?);
        let scaled = total
            .checked_mul(bps)
            .ok_or_else(|| YieldError::InvalidAllocation(format!("amount {total} overflows the split")))?;
        amounts.push(scaled / U256::from(BASIS_POINTS));
    }
    let allocated = amounts.iter().fold(U256::zero(), |acc, a| acc.saturating_add(*a));
    let remainder = total
        .checked_sub(allocated)
        .ok_or_else(|| YieldError::InvalidAllocation(format!("split of {total} allocates {allocated}")))?;
    Ok((amounts, remainder))
}

/// Turns an allocation into one deposit or withdrawal per protocol.
/// A failing protocol is reported in the result, never raised.
pub struct BatchExecutor {
    adapters: HashMap<Protocol, Arc<dyn ProtocolAdapter>>,
}

impl BatchExecutor {
    pub fn new(adapters: Vec<Arc<dyn ProtocolAdapter>>) -> Self {
        let adapters = adapters.into_iter().map(|a| (a.protocol(), a)).collect();
        Self { adapters }
    }

    fn adapter(&self, protocol: Protocol) -> Result<&Arc<dyn ProtocolAdapter>> {
        self.adapters
            .get(&protocol)
            .ok_or_else(|| YieldError::UnknownProtocol(format!("{protocol} has no registered adapter")))
    }

    #[instrument(skip(self, request, signer), fields(token = %request.token, chain_id = request.chain_id, mode = request.execution_mode.as_str()))]
    pub async fn execute_batch_deposit(
        &self,
        request: &BatchDepositRequest,
        signer: Arc<TxSigner>,
    ) -> Result<BatchExecutionResult> {
        validate_allocations(&request.allocations)?;
        let (amounts, remainder) = split_amount(request.total_amount, &request.allocations)?;
        if !remainder.is_zero() {
            debug!(%remainder, "Split leaves base units unallocated");
        }

        let legs: Vec<(Protocol, Option<U256>)> = request
            .allocations
            .iter()
            .zip(amounts)
            .map(|(a, amount)| (a.protocol, Some(amount)))
            .collect();
        let results = self
            .run(Direction::Deposit, &request.token, request.chain_id, &legs, request.execution_mode, signer)
            .await;
        Ok(summarize(results, remainder))
    }

    /// Every allocation must carry its own amount; one without fails alone
    #[instrument(skip(self, request, signer), fields(token = %request.token, chain_id = request.chain_id, mode = request.execution_mode.as_str()))]
    pub async fn execute_batch_withdrawal(
        &self,
        request: &BatchWithdrawalRequest,
        signer: Arc<TxSigner>,
    ) -> Result<BatchExecutionResult> {
        let legs: Vec<(Protocol, Option<U256>)> = request.allocations.iter().map(|a| (a.protocol, a.amount)).collect();
        let results = self
            .run(Direction::Withdrawal, &request.token, request.chain_id, &legs, request.execution_mode, signer)
            .await;
        Ok(summarize(results, U256::zero()))
    }

    pub async fn execute_protocol_deposit(
        &self,
        protocol: Protocol,
        token: &str,
        chain_id: u64,
        amount: U256,
        signer: Arc<TxSigner>,
    ) -> ProtocolExecutionResult {
        self.execute_leg(Direction::Deposit, protocol, token, chain_id, Some(amount), signer).await
    }

    pub async fn execute_protocol_withdrawal(
        &self,
        protocol: Protocol,
        token: &str,
        chain_id: u64,
        amount: U256,
        signer: Arc<TxSigner>,
    ) -> ProtocolExecutionResult {
        self.execute_leg(Direction::Withdrawal, protocol, token, chain_id, Some(amount), signer).await
    }

    /// Deposit gas per protocol; unestimable legs count as 250k
    pub async fn estimate_batch_gas(&self, request: &BatchDepositRequest, from: Address) -> Result<BatchGasEstimate> {
        let (amounts, _) = split_amount(request.total_amount, &request.allocations)?;
        let mut per_protocol = HashMap::new();
        let mut total_gas = U256::zero();

        for (allocation, amount) in request.allocations.iter().zip(amounts) {
            let estimate = match self.adapter(allocation.protocol) {
                Ok(adapter) => adapter.estimate_deposit_gas(&request.token, request.chain_id, amount, from).await,
                Err(e) => Err(e),
            };
            let gas = estimate.unwrap_or_else(|e| {
                debug!(protocol = %allocation.protocol, err = %e, "Using fallback batch gas");
                U256::from(FALLBACK_BATCH_GAS)
            });
            *per_protocol.entry(allocation.protocol).or_insert_with(U256::zero) += gas;
            total_gas += gas;
        }
        Ok(BatchGasEstimate { total_gas, per_protocol })
    }

    async fn run(
        &self,
        direction: Direction,
        token: &str,
        chain_id: u64,
        legs: &[(Protocol, Option<U256>)],
        mode: ExecutionMode,
        signer: Arc<TxSigner>,
    ) -> Vec<ProtocolExecutionResult> {
        match mode {
            ExecutionMode::Sequential => {
                let mut results = Vec::with_capacity(legs.len());
                for (protocol, amount) in legs {
                    results.push(self.execute_leg(direction, *protocol, token, chain_id, *amount, signer.clone()).await);
                }
                results
            }
            ExecutionMode::Parallel => {
                let branches = legs
                    .iter()
                    .map(|(protocol, amount)| self.execute_leg(direction, *protocol, token, chain_id, *amount, signer.clone()));
                join_all(branches).await
            }
        }
    }

    async fn execute_leg(
        &self,
        direction: Direction,
        protocol: Protocol,
        token: &str,
        chain_id: u64,
        amount: Option<U256>,
        signer: Arc<TxSigner>,
    ) -> ProtocolExecutionResult {
        let Some(amount) = amount else {
            let message = format!("Amount required for withdrawal from {protocol}");
            warn!(%protocol, "{message}");
            return ProtocolExecutionResult { protocol, success: false, receipt: None, error: Some(message), amount: U256::zero() };
        };

        let outcome = match self.adapter(protocol) {
            Ok(adapter) => match direction {
                Direction::Deposit => adapter.execute_deposit(token, chain_id, amount, signer).await,
                Direction::Withdrawal => adapter.execute_withdrawal(token, chain_id, amount, signer).await,
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(receipt) if receipt.status == TxStatus::Success => {
                info!(%protocol, %amount, tx = ?receipt.hash, ?direction, "Batch leg confirmed");
                ProtocolExecutionResult { protocol, success: true, receipt: Some(receipt), error: None, amount }
            }
            Ok(receipt) => {
                warn!(%protocol, tx = ?receipt.hash, ?direction, "Batch leg reverted");
                ProtocolExecutionResult {
                    protocol,
                    success: false,
                    receipt: Some(receipt),
                    error: Some("Transaction reverted".to_string()),
                    amount,
                }
            }
            Err(e) => {
                warn!(%protocol, err = %e, ?direction, "Batch leg failed");
                ProtocolExecutionResult { protocol, success: false, receipt: None, error: Some(e.to_string()), amount }
            }
        }
    }
}

fn summarize(results: Vec<ProtocolExecutionResult>, remainder: U256) -> BatchExecutionResult {
    let mut total_processed = U256::zero();
    let mut total_gas_used = U256::zero();
    let mut failed_protocols = Vec::new();
    for result in &results {
        if result.success {
            total_processed = total_processed.saturating_add(result.amount);
            if let Some(receipt) = &result.receipt {
                total_gas_used = total_gas_used.saturating_add(receipt.gas_used);
            }
        } else {
            failed_protocols.push(result.protocol);
        }
    }
    info!(
        processed = %total_processed,
        gas_used = %total_gas_used,
        failed = failed_protocols.len(),
        "Batch finished"
    );
    BatchExecutionResult {
        overall_success: failed_protocols.is_empty(),
        results,
        total_processed,
        total_gas_used,
        failed_protocols,
        remainder,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::mock::{MockAdapter, test_signer};
    use proptest::prelude::*;

    const USDC_1000: u64 = 1_000_000_000;

    fn shares(split: &[(Protocol, Decimal)]) -> Vec<AllocationShare> {
        split.iter().map(|(p, pct)| AllocationShare::new(*p, *pct)).collect()
    }

    fn deposit(split: &[(Protocol, Decimal)], total: u64, mode: ExecutionMode) -> BatchDepositRequest {
        BatchDepositRequest {
            token: "USDC".to_string(),
            chain_id: 1,
            total_amount: U256::from(total),
            allocations: shares(split),
            execution_mode: mode,
        }
    }

    fn markets() -> (Arc<MockAdapter>, Arc<MockAdapter>, Arc<MockAdapter>) {
        (
            Arc::new(MockAdapter::new(Protocol::Aave).with_market("USDC", 1, dec!(4), dec!(1000))),
            Arc::new(MockAdapter::new(Protocol::Compound).with_market("USDC", 1, dec!(4), dec!(1000))),
            Arc::new(MockAdapter::new(Protocol::Morpho).with_market("USDC", 1, dec!(4), dec!(1000))),
        )
    }

    fn executor(adapters: &[Arc<MockAdapter>]) -> BatchExecutor {
        BatchExecutor::new(adapters.iter().map(|m| m.clone() as Arc<dyn ProtocolAdapter>).collect())
    }

    #[test]
    fn exact_split_has_no_remainder() {
        let allocations = shares(&[
            (Protocol::Aave, dec!(50)),
            (Protocol::Compound, dec!(30)),
            (Protocol::Morpho, dec!(20)),
        ]);
        let (amounts, remainder) = split_amount(U256::from(USDC_1000), &allocations).unwrap();
        assert_eq!(amounts, vec![U256::from(500_000_000u64), U256::from(300_000_000u64), U256::from(200_000_000u64)]);
        assert!(remainder.is_zero());
    }

    #[test]
    fn uneven_split_reports_remainder() {
        let allocations = shares(&[
            (Protocol::Aave, dec!(33.33)),
            (Protocol::Compound, dec!(33.33)),
            (Protocol::Morpho, dec!(33.34)),
        ]);
        let (amounts, remainder) = split_amount(U256::from(100u64), &allocations).unwrap();
        assert_eq!(amounts, vec![U256::from(33u64); 3]);
        assert_eq!(remainder, U256::one());
    }

    #[test]
    fn off_by_more_than_tolerance_is_rejected() {
        let err = validate_allocations(&shares(&[(Protocol::Aave, dec!(60)), (Protocol::Compound, dec!(39))])).unwrap_err();
        assert_eq!(err.to_string(), "Allocations must sum to 100%, got 99%");
        assert!(validate_allocations(&shares(&[(Protocol::Aave, dec!(99.995)), (Protocol::Compound, dec!(0))])).is_ok());
        assert!(validate_allocations(&shares(&[(Protocol::Aave, dec!(110)), (Protocol::Compound, dec!(-10))])).is_err());
    }

    #[tokio::test]
    async fn rounding_past_the_whole_amount_is_rejected() {
        let over = shares(&[(Protocol::Aave, dec!(50.005)), (Protocol::Compound, dec!(50.005))]);
        let err = validate_allocations(&over).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Allocations round to 10002 basis points, more than the 10000 available"
        );
        assert!(matches!(split_amount(U256::from(USDC_1000), &over), Err(YieldError::InvalidAllocation(_))));

        let (aave, compound, _) = markets();
        let exec = executor(&[aave.clone(), compound.clone()]);
        let request = deposit(
            &[(Protocol::Aave, dec!(50.005)), (Protocol::Compound, dec!(50.005))],
            USDC_1000,
            ExecutionMode::Parallel,
        );
        assert!(exec.execute_batch_deposit(&request, test_signer(1)).await.is_err());
        assert!(exec.estimate_batch_gas(&request, Address::zero()).await.is_err());
        assert!(aave.executed().is_empty());
        assert!(compound.executed().is_empty());
    }

    #[tokio::test]
    async fn sequential_deposit_hits_every_protocol() {
        let (aave, compound, morpho) = markets();
        let exec = executor(&[aave.clone(), compound.clone(), morpho.clone()]);
        let request = deposit(
            &[(Protocol::Aave, dec!(50)), (Protocol::Compound, dec!(30)), (Protocol::Morpho, dec!(20))],
            USDC_1000,
            ExecutionMode::Sequential,
        );
        let result = exec.execute_batch_deposit(&request, test_signer(1)).await.unwrap();

        assert!(result.overall_success);
        assert_eq!(result.total_processed, U256::from(USDC_1000));
        assert_eq!(result.total_gas_used, U256::from(450_000u64));
        assert!(result.remainder.is_zero());
        assert_eq!(aave.executed(), vec![("USDC".to_string(), U256::from(500_000_000u64))]);
        assert_eq!(morpho.executed(), vec![("USDC".to_string(), U256::from(200_000_000u64))]);
    }

    #[tokio::test]
    async fn bad_allocation_fails_before_any_transaction() {
        let (aave, compound, _) = markets();
        let exec = executor(&[aave.clone(), compound.clone()]);
        let request = deposit(&[(Protocol::Aave, dec!(60)), (Protocol::Compound, dec!(30))], USDC_1000, ExecutionMode::Sequential);
        let err = exec.execute_batch_deposit(&request, test_signer(1)).await.unwrap_err();
        assert!(matches!(err, YieldError::InvalidAllocation(_)));
        assert!(aave.executed().is_empty());
        assert!(compound.executed().is_empty());
    }

    #[tokio::test]
    async fn parallel_failure_stays_isolated() {
        let aave = Arc::new(MockAdapter::new(Protocol::Aave).with_market("USDC", 1, dec!(4), dec!(1000)));
        let compound = Arc::new(
            MockAdapter::new(Protocol::Compound)
                .with_market("USDC", 1, dec!(4), dec!(1000))
                .failing_execution("nonce too low"),
        );
        let exec = executor(&[aave.clone(), compound]);
        let request = deposit(&[(Protocol::Aave, dec!(70)), (Protocol::Compound, dec!(30))], USDC_1000, ExecutionMode::Parallel);
        let result = exec.execute_batch_deposit(&request, test_signer(1)).await.unwrap();

        assert!(!result.overall_success);
        assert_eq!(result.failed_protocols, vec![Protocol::Compound]);
        assert_eq!(result.total_processed, U256::from(700_000_000u64));
        assert_eq!(result.results[1].error.as_deref(), Some("[compound] nonce too low"));
        assert_eq!(result.results[1].amount, U256::from(300_000_000u64));
        assert_eq!(aave.executed().len(), 1);
    }

    #[tokio::test]
    async fn withdrawal_without_amount_fails_only_that_leg() {
        let (aave, _, morpho) = markets();
        let exec = executor(&[aave.clone(), morpho]);
        let request = BatchWithdrawalRequest {
            token: "USDC".to_string(),
            chain_id: 1,
            allocations: vec![
                AllocationShare::with_amount(Protocol::Aave, U256::from(5_000_000u64)),
                AllocationShare::new(Protocol::Morpho, dec!(50)),
            ],
            execution_mode: ExecutionMode::Sequential,
        };
        let result = exec.execute_batch_withdrawal(&request, test_signer(1)).await.unwrap();

        assert_eq!(result.failed_protocols, vec![Protocol::Morpho]);
        assert_eq!(result.results[1].error.as_deref(), Some("Amount required for withdrawal from morpho"));
        assert_eq!(result.total_processed, U256::from(5_000_000u64));
        assert_eq!(aave.executed().len(), 1);
    }

    #[tokio::test]
    async fn unregistered_protocol_is_a_failed_leg() {
        let (aave, _, _) = markets();
        let exec = executor(&[aave]);
        let request = deposit(&[(Protocol::Aave, dec!(50)), (Protocol::Morpho, dec!(50))], USDC_1000, ExecutionMode::Sequential);
        let result = exec.execute_batch_deposit(&request, test_signer(1)).await.unwrap();
        assert_eq!(result.failed_protocols, vec![Protocol::Morpho]);
        assert!(result.results[1].error.as_deref().unwrap_or_default().contains("no registered adapter"));
    }

    #[tokio::test]
    async fn gas_estimate_falls_back_per_protocol() {
        let aave = Arc::new(MockAdapter::new(Protocol::Aave).with_market("USDC", 1, dec!(4), dec!(1000)));
        let compound = Arc::new(MockAdapter::new(Protocol::Compound).with_market("USDT", 1, dec!(4), dec!(1000)));
        let exec = executor(&[aave, compound]);
        let request = deposit(
            &[(Protocol::Aave, dec!(40)), (Protocol::Compound, dec!(40)), (Protocol::Morpho, dec!(20))],
            USDC_1000,
            ExecutionMode::Sequential,
        );
        let estimate = exec.estimate_batch_gas(&request, Address::repeat_byte(1)).await.unwrap();

        assert_eq!(estimate.per_protocol[&Protocol::Aave], U256::from(150_000u64));
        assert_eq!(estimate.per_protocol[&Protocol::Compound], U256::from(FALLBACK_BATCH_GAS));
        assert_eq!(estimate.per_protocol[&Protocol::Morpho], U256::from(FALLBACK_BATCH_GAS));
        assert_eq!(estimate.total_gas, U256::from(650_000u64));
    }

    proptest! {
        #[test]
        fn split_never_loses_or_invents_units(
            total in any::<u64>(),
            cut_a in 0u32..=10_000,
            cut_b in 0u32..=10_000,
        ) {
            let (low, high) = (cut_a.min(cut_b), cut_a.max(cut_b));
            let allocations = shares(&[
                (Protocol::Aave, Decimal::new(low as i64, 2)),
                (Protocol::Compound, Decimal::new((high - low) as i64, 2)),
                (Protocol::Morpho, Decimal::new((10_000 - high) as i64, 2)),
            ]);
            prop_assert!(validate_allocations(&allocations).is_ok());
            let (amounts, remainder) = split_amount(U256::from(total), &allocations).unwrap();
            let allocated = amounts.iter().fold(U256::zero(), |acc, a| acc + *a);
            prop_assert_eq!(allocated + remainder, U256::from(total));
            prop_assert!(remainder < U256::from(3u64));
        }

        #[test]
        fn accepted_split_never_exceeds_total(
            total in any::<u64>(),
            first in 0i64..=100_010,
            drift in -10i64..=10,
        ) {
            // Thousandth-of-a-percent shares that sit within the 0.01 tolerance
            let first = first.min(100_000 + drift);
            let allocations = shares(&[
                (Protocol::Aave, Decimal::new(first, 3)),
                (Protocol::Morpho, Decimal::new(100_000 + drift - first, 3)),
            ]);
            prop_assume!(validate_allocations(&allocations).is_ok());
            let (amounts, remainder) = split_amount(U256::from(total), &allocations).unwrap();
            let allocated = amounts.iter().fold(U256::zero(), |acc, a| acc + *a);
            prop_assert!(allocated <= U256::from(total));
            prop_assert_eq!(allocated + remainder, U256::from(total));
        }
    }
}
