pub mod multi_chain;
pub mod strategies;
pub mod types;
pub mod yield_optimizer;

pub use multi_chain::MultiChainOptimizer;
pub use strategies::OptimizationStrategy;
pub use types::*;
pub use yield_optimizer::{YieldOptimizer, estimate_break_even_days, is_rebalance_worth_it};
