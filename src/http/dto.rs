//! DTO (Data Transfer Object) for HTTP requests and responses.

use serde::{Deserialize, Serialize};
use txpool::Transaction;

const DEFAULT_PROCESSABLE_LIMIT: usize = 25;

#[derive(Debug, Deserialize)]
pub struct TransactionsReq {
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Serialize)]
pub struct TransactionsResp {
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessableReq {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_PROCESSABLE_LIMIT
}

#[derive(Debug, Deserialize)]
pub struct RoundRollbackReq {
    pub delegates: Vec<String>,
}
