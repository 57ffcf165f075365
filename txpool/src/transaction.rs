use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{config::TxPoolConfig, error::TransactionError};

/// The protocol's transaction types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionKind {
    Transfer,
    SecondSignature,
    Delegate,
    Vote,
    Multisignature,
    Dapp,
    InTransfer,
    OutTransfer,
}

impl TransactionKind {
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Transfer => 0,
            Self::SecondSignature => 1,
            Self::Delegate => 2,
            Self::Vote => 3,
            Self::Multisignature => 4,
            Self::Dapp => 5,
            Self::InTransfer => 6,
            Self::OutTransfer => 7,
        }
    }

    /// Registrations an account may only hold once.
    pub fn contains_unique_data(&self) -> bool {
        matches!(
            self,
            Self::SecondSignature | Self::Delegate | Self::Multisignature | Self::Dapp
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MultisignatureStatus {
    #[default]
    Unknown,
    NonMultisignature,
    Pending,
    Ready,
    Fail,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub sender_id: String,
    #[serde(default)]
    pub recipient_id: String,
    /// Unix timestamp in seconds.
    pub received_at: u64,
    pub kind: TransactionKind,
    #[serde(default)]
    pub multisignature_status: MultisignatureStatus,
    /// Type specific content, opaque to the pool.
    #[serde(default)]
    pub asset: Value,
}

impl Transaction {
    pub fn new(
        id: impl Into<String>,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        kind: TransactionKind,
    ) -> Self {
        Self {
            id: id.into(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            received_at: unix_now(),
            kind,
            multisignature_status: MultisignatureStatus::Unknown,
            asset: Value::Null,
        }
    }

    pub fn with_received_at(mut self, received_at: u64) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn with_multisignature_status(mut self, status: MultisignatureStatus) -> Self {
        self.multisignature_status = status;
        self
    }

    /// Still collecting signatures, or just done collecting them.
    pub fn is_multisignature_in_progress(&self) -> bool {
        matches!(
            self.multisignature_status,
            MultisignatureStatus::Pending | MultisignatureStatus::Ready
        )
    }

    pub fn timeout(&self, config: &TxPoolConfig) -> u64 {
        if self.is_multisignature_in_progress() {
            config.multisig_transaction_timeout
        } else {
            config.transaction_timeout
        }
    }

    pub fn is_expired(&self, now: u64, config: &TxPoolConfig) -> bool {
        self.received_at.saturating_add(self.timeout(config)) < now
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (type {}, {} -> {})",
            self.id,
            self.kind.type_id(),
            self.sender_id,
            self.recipient_id
        )
    }
}

/// A block as far as the pool is concerned: the transactions it confirms.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(default)]
    pub height: u64,
    pub transactions: Vec<Transaction>,
}

/// What a pipeline stage reports for a batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessTransactionsResponse {
    pub valid_transactions: Vec<Transaction>,
    pub invalid_transactions: Vec<Transaction>,
    pub errors: Vec<TransactionError>,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
