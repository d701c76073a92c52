pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod formatting;
pub mod logging;
pub mod optimizer;
pub mod protocols;
pub mod rpc;
pub mod types;

pub use error::{Result, YieldError};
