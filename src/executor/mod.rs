pub mod batch;
pub mod types;

pub use batch::{BatchExecutor, split_amount, validate_allocations};
pub use types::*;
