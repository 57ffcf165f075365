//! Unconfirmed transactions on their way into a block.

pub mod config;
pub mod error;
pub mod pool;
pub mod queue;
pub mod transaction;

pub use config::TxPoolConfig;
pub use error::{TransactionError, TxPoolError};
pub use pool::{QueueName, QueueSizes, TransactionPool, TransactionProcessor};
pub use queue::Queue;
pub use transaction::*;
