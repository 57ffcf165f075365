use std::collections::HashSet;

use txpool::{
    MultisignatureStatus, ProcessTransactionsResponse, Transaction, TransactionError,
    TransactionKind, TransactionProcessor, TxPoolError,
};

/// Structural checks only: signatures and balances belong to the chain state, which this
/// node does not keep.
#[derive(Debug, Default)]
pub struct BasicProcessor;

impl BasicProcessor {
    fn check(
        transactions: &[Transaction],
        mut check: impl FnMut(&Transaction) -> Result<Transaction, String>,
    ) -> ProcessTransactionsResponse {
        let mut resp = ProcessTransactionsResponse::default();
        for tx in transactions {
            match check(tx) {
                Ok(tx) => resp.valid_transactions.push(tx),
                Err(message) => {
                    resp.errors.push(TransactionError::new(&tx.id, message));
                    resp.invalid_transactions.push(tx.clone());
                }
            }
        }
        resp
    }
}

impl TransactionProcessor for BasicProcessor {
    fn validate_transactions(
        &self,
        transactions: &[Transaction],
    ) -> Result<ProcessTransactionsResponse, TxPoolError> {
        Ok(Self::check(transactions, |tx| {
            if tx.sender_id.is_empty() {
                return Err("sender is missing".to_owned());
            }
            if tx.kind == TransactionKind::Transfer && tx.recipient_id.is_empty() {
                return Err("transfer without recipient".to_owned());
            }
            Ok(tx.clone())
        }))
    }

    fn verify_transactions(
        &self,
        transactions: &[Transaction],
    ) -> Result<ProcessTransactionsResponse, TxPoolError> {
        // One registration of each kind per sender and batch.
        let mut seen = HashSet::new();
        Ok(Self::check(transactions, |tx| {
            if tx.kind.contains_unique_data()
                && !seen.insert((tx.sender_id.clone(), tx.kind))
            {
                return Err(format!(
                    "sender {} already registers type {}",
                    tx.sender_id,
                    tx.kind.type_id()
                ));
            }
            Ok(tx.clone())
        }))
    }

    fn apply_transactions(
        &self,
        transactions: &[Transaction],
    ) -> Result<ProcessTransactionsResponse, TxPoolError> {
        Ok(Self::check(transactions, |tx| {
            let status = match (tx.kind, tx.multisignature_status) {
                (_, MultisignatureStatus::Fail) => {
                    return Err("multisignature verification failed".to_owned())
                }
                (TransactionKind::Multisignature, MultisignatureStatus::Unknown) => {
                    MultisignatureStatus::Pending
                }
                (_, MultisignatureStatus::Unknown) => MultisignatureStatus::NonMultisignature,
                (_, status) => status,
            };
            Ok(tx.clone().with_multisignature_status(status))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: &str, sender: &str, kind: TransactionKind) -> Transaction {
        Transaction::new(id, sender, "recipient", kind)
    }

    #[test]
    fn validation_requires_a_sender() {
        let resp = BasicProcessor
            .validate_transactions(&[
                tx("1", "alice", TransactionKind::Transfer),
                tx("2", "", TransactionKind::Transfer),
            ])
            .unwrap();

        assert_eq!(resp.valid_transactions.len(), 1);
        assert_eq!(resp.invalid_transactions[0].id, "2");
        assert_eq!(resp.errors[0].id, "2");
    }

    #[test]
    fn unique_registrations_per_sender() {
        let resp = BasicProcessor
            .verify_transactions(&[
                tx("1", "alice", TransactionKind::Delegate),
                tx("2", "alice", TransactionKind::Delegate),
                tx("3", "alice", TransactionKind::Transfer),
                tx("4", "alice", TransactionKind::Transfer),
            ])
            .unwrap();

        let valid: Vec<&str> = resp.valid_transactions.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(valid, vec!["1", "3", "4"]);
    }

    #[test]
    fn apply_sets_the_multisignature_status() {
        let resp = BasicProcessor
            .apply_transactions(&[
                tx("1", "alice", TransactionKind::Multisignature),
                tx("2", "alice", TransactionKind::Transfer),
                tx("3", "alice", TransactionKind::Transfer)
                    .with_multisignature_status(MultisignatureStatus::Fail),
            ])
            .unwrap();

        let statuses: Vec<MultisignatureStatus> = resp
            .valid_transactions
            .iter()
            .map(|t| t.multisignature_status)
            .collect();
        assert_eq!(
            statuses,
            vec![MultisignatureStatus::Pending, MultisignatureStatus::NonMultisignature]
        );
        assert_eq!(resp.invalid_transactions[0].id, "3");
    }
}
