/// Why a single transaction was refused by a pipeline stage.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("Transaction {id}: {message}")]
pub struct TransactionError {
    pub id: String,
    pub message: String,
}

impl TransactionError {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TxPoolError {
    #[error("The {stage} stage failed: {message}")]
    Processor {
        stage: &'static str,
        message: String,
    },
    #[error("Invalid transaction pool config: {0}")]
    InvalidConfig(String),
}
