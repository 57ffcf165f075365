use serde::Deserialize;

use crate::error::TxPoolError;

pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Three hours.
pub const DEFAULT_TRANSACTION_TIMEOUT: u64 = 10_800;
/// Eight hours, for multisignature transactions still collecting signatures.
pub const DEFAULT_MULTISIG_TRANSACTION_TIMEOUT: u64 = 28_800;

/// Transaction pool configuration. Timeouts and intervals are in seconds.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TxPoolConfig {
    /// Maximum number of transactions handed to a stage at once.
    pub batch_size: usize,
    pub transaction_timeout: u64,
    pub multisig_transaction_timeout: u64,
    pub validate_interval: u64,
    pub verify_interval: u64,
    pub process_interval: u64,
    pub expire_interval: u64,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            multisig_transaction_timeout: DEFAULT_MULTISIG_TRANSACTION_TIMEOUT,
            validate_interval: 1,
            verify_interval: 1,
            process_interval: 1,
            expire_interval: 30,
        }
    }
}

impl TxPoolConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_timeouts(mut self, transaction_timeout: u64, multisig_transaction_timeout: u64) -> Self {
        self.transaction_timeout = transaction_timeout;
        self.multisig_transaction_timeout = multisig_transaction_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), TxPoolError> {
        if self.batch_size == 0 {
            return Err(TxPoolError::InvalidConfig(
                "batch_size must be greater than 0".to_owned(),
            ));
        }
        let intervals = [
            self.validate_interval,
            self.verify_interval,
            self.process_interval,
            self.expire_interval,
        ];
        if intervals.contains(&0) {
            return Err(TxPoolError::InvalidConfig(
                "job intervals must be greater than 0".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TxPoolConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.transaction_timeout, 10_800);
        assert_eq!(config.multisig_transaction_timeout, 28_800);
        assert!(config.validate().is_ok());
        assert!(config.with_batch_size(0).validate().is_err());
    }
}
