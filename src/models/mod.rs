//! Data models shared by every driver.
//!
//! This module re-exports all model types used throughout the crate.

pub mod stats;
pub mod transaction;
pub mod value;

// Re-export commonly used types
pub use stats::{AcquireMetrics, PoolStats};
pub use transaction::{AccessMode, IsolationLevel, TxOptions, TxState};
pub use value::{Record, Value};
