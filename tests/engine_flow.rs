mod common;

use std::sync::Arc;

use ethers::types::{Address, U256};
use rust_decimal::dec;

use common::{FallbackGas, StaticAdapter, dyn_adapters, signer};
use stable_yield_engine::aggregator::{AggregatorConfig, YieldAggregator};
use stable_yield_engine::cache::TtlCache;
use stable_yield_engine::executor::{
    AllocationShare, BatchDepositRequest, BatchExecutor, BatchWithdrawalRequest, ExecutionMode,
};
use stable_yield_engine::optimizer::{
    MultiChainConfig, MultiChainOptimizer, OptimizerConfig, StrategyKind, YieldOptimizer,
};
use stable_yield_engine::types::{BASE, ETHEREUM, OptimizationAction, Protocol, RiskLevel};

fn wallet() -> Address {
    Address::repeat_byte(0x11)
}

fn aggregator(adapters: &[Arc<StaticAdapter>]) -> Arc<YieldAggregator> {
    let cache = Arc::new(TtlCache::default());
    Arc::new(YieldAggregator::new(dyn_adapters(adapters), cache, AggregatorConfig::default()))
}

fn optimizer(adapters: &[Arc<StaticAdapter>]) -> YieldOptimizer {
    let cache = Arc::new(TtlCache::default());
    YieldOptimizer::new(aggregator(adapters), cache, OptimizerConfig::default())
}

fn mainnet_markets() -> Vec<Arc<StaticAdapter>> {
    vec![
        Arc::new(
            StaticAdapter::new(Protocol::Aave)
                .market("USDC", ETHEREUM, dec!(4), dec!(1000000000))
                .position("USDC", ETHEREUM, dec!(50000), dec!(4)),
        ),
        Arc::new(StaticAdapter::new(Protocol::Compound).market("USDC", ETHEREUM, dec!(6), dec!(600000000))),
        Arc::new(StaticAdapter::new(Protocol::Morpho).market("USDC", ETHEREUM, dec!(5), dec!(300000000))),
    ]
}

#[tokio::test]
async fn held_position_is_moved_to_the_best_market() {
    let opt = optimizer(&mainnet_markets());
    let result = opt.optimize_position(wallet(), "USDC", ETHEREUM, None, None).await.unwrap();

    assert_eq!(result.action, OptimizationAction::Rebalance);
    assert_eq!(result.strategy, StrategyKind::HighestYield);
    assert_eq!(result.current_protocol, Some(Protocol::Aave));
    assert_eq!(result.recommended_protocol, Some(Protocol::Compound));
    assert_eq!(result.apy_delta, dec!(2));
    assert_eq!(result.estimated_annual_gain, dec!(82.19));
    assert_eq!(result.reason, "Better yield available: compound offers 6% APY");
    let ranked: Vec<Protocol> = result.ranked_opportunities.iter().map(|o| o.protocol).collect();
    assert_eq!(ranked, vec![Protocol::Compound, Protocol::Morpho, Protocol::Aave]);
    assert!(result.estimated_gas_cost.is_none());
}

#[tokio::test]
async fn gas_aware_run_prices_the_switch() {
    let opt = optimizer(&mainnet_markets());
    let result = opt
        .optimize_position(wallet(), "USDC", ETHEREUM, None, Some(StrategyKind::GasAware))
        .await
        .unwrap();

    assert!(result.should_rebalance());
    assert_eq!(result.estimated_gas_cost, Some(dec!(41.85)));
    assert_eq!(result.net_gain_after_gas, Some(dec!(40.34)));
}

#[tokio::test]
async fn broken_protocol_does_not_block_the_decision() {
    let adapters = vec![
        Arc::new(
            StaticAdapter::new(Protocol::Aave)
                .market("USDC", ETHEREUM, dec!(4), dec!(1000000000))
                .position("USDC", ETHEREUM, dec!(50000), dec!(4)),
        ),
        Arc::new(StaticAdapter::new(Protocol::Compound).market("USDC", ETHEREUM, dec!(6), dec!(600000000)).broken()),
        Arc::new(StaticAdapter::new(Protocol::Morpho).market("USDC", ETHEREUM, dec!(5), dec!(300000000))),
    ];
    let agg = aggregator(&adapters);
    let scan = agg.fetch_all_opportunities("USDC", ETHEREUM, None).await;
    assert_eq!(scan.successful_protocols, 2);
    assert_eq!(scan.failed_protocols, 1);
    assert_eq!(scan.errors[0].protocol, Protocol::Compound);

    let opt = optimizer(&adapters);
    let result = opt.optimize_position(wallet(), "USDC", ETHEREUM, None, None).await.unwrap();
    assert_eq!(result.recommended_protocol, Some(Protocol::Morpho));
    assert_eq!(result.apy_delta, dec!(1));
    assert_eq!(result.action, OptimizationAction::Rebalance);
}

#[tokio::test]
async fn cross_chain_allocation_executes_as_a_batch() {
    let aave = Arc::new(
        StaticAdapter::new(Protocol::Aave)
            .market("USDC", ETHEREUM, dec!(5), dec!(1000000000))
            .market("USDC", BASE, dec!(3.8), dec!(400000000)),
    );
    let compound = Arc::new(StaticAdapter::new(Protocol::Compound).market("USDC", ETHEREUM, dec!(4), dec!(500000000)));
    let morpho = Arc::new(StaticAdapter::new(Protocol::Morpho).market("USDC", BASE, dec!(4.5), dec!(200000000)));
    let adapters = vec![aave.clone(), compound, morpho.clone()];

    let planner = MultiChainOptimizer::new(aggregator(&adapters), Arc::new(FallbackGas), MultiChainConfig::default());
    let plan = planner
        .optimize_across_chains("USDC", RiskLevel::Moderate, None, None)
        .await
        .unwrap();

    assert_eq!(plan.best_chain_id, BASE);
    assert_eq!(plan.best_chain_name, "Base");
    assert_eq!(plan.net_apy, dec!(4.13));
    let split: Vec<(Protocol, _)> = plan.allocation.iter().map(|a| (a.protocol, a.percentage)).collect();
    assert_eq!(split, vec![(Protocol::Aave, dec!(53)), (Protocol::Morpho, dec!(47))]);

    let executor = BatchExecutor::new(dyn_adapters(&adapters));
    let request = BatchDepositRequest {
        token: "USDC".to_string(),
        chain_id: plan.best_chain_id,
        total_amount: U256::from(10_000_000_000u64),
        allocations: plan.allocation.iter().map(|a| AllocationShare::new(a.protocol, a.percentage)).collect(),
        execution_mode: ExecutionMode::Sequential,
    };

    let gas = executor.estimate_batch_gas(&request, wallet()).await.unwrap();
    assert_eq!(gas.total_gas, U256::from(360_000u64));

    let outcome = executor.execute_batch_deposit(&request, signer(BASE)).await.unwrap();
    assert!(outcome.overall_success);
    assert_eq!(outcome.total_processed, U256::from(10_000_000_000u64));
    assert_eq!(outcome.total_gas_used, U256::from(240_000u64));
    assert!(outcome.remainder.is_zero());
    assert_eq!(*aave.deposits.lock().unwrap(), vec![U256::from(5_300_000_000u64)]);
    assert_eq!(*morpho.deposits.lock().unwrap(), vec![U256::from(4_700_000_000u64)]);
}

#[tokio::test]
async fn reverted_withdrawals_are_reported_not_raised() {
    let adapters = mainnet_markets();
    let executor = BatchExecutor::new(dyn_adapters(&adapters));
    let request = BatchWithdrawalRequest {
        token: "USDC".to_string(),
        chain_id: ETHEREUM,
        allocations: vec![
            AllocationShare::with_amount(Protocol::Aave, U256::from(1_000_000u64)),
            AllocationShare::with_amount(Protocol::Compound, U256::from(2_000_000u64)),
        ],
        execution_mode: ExecutionMode::Parallel,
    };
    let outcome = executor.execute_batch_withdrawal(&request, signer(ETHEREUM)).await.unwrap();

    assert!(!outcome.overall_success);
    assert_eq!(outcome.failed_protocols, vec![Protocol::Aave, Protocol::Compound]);
    assert!(outcome.total_processed.is_zero());
    assert!(outcome.results.iter().all(|r| r.error.as_deref() == Some("Transaction reverted")));
}
