//! The transaction pool: five queues forming a pipeline.
//!
//! ```text
//! received -> validated -> verified -> pending (multisignature still collecting)
//!                                   -> ready   (handed out for block forging)
//! ```
//!
//! Each stage takes a batch of the oldest transactions of its queue and hands it to the
//! `TransactionProcessor`. Valid transactions move on, invalid ones are dropped. Block events
//! send transactions whose account state changed back to `validated`.

use std::collections::HashSet;

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    config::TxPoolConfig,
    error::TxPoolError,
    queue::Queue,
    transaction::{Block, MultisignatureStatus, ProcessTransactionsResponse, Transaction},
};

/// Validation, verification and application of transactions against the chain state.
pub trait TransactionProcessor: Send + Sync {
    fn validate_transactions(
        &self,
        transactions: &[Transaction],
    ) -> Result<ProcessTransactionsResponse, TxPoolError>;

    fn verify_transactions(
        &self,
        transactions: &[Transaction],
    ) -> Result<ProcessTransactionsResponse, TxPoolError>;

    fn apply_transactions(
        &self,
        transactions: &[Transaction],
    ) -> Result<ProcessTransactionsResponse, TxPoolError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueName {
    Received,
    Validated,
    Verified,
    Pending,
    Ready,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Received,
        QueueName::Validated,
        QueueName::Verified,
        QueueName::Pending,
        QueueName::Ready,
    ];

    /// Queues holding transactions checked against the current chain state.
    pub const CHECKED: [QueueName; 3] = [QueueName::Verified, QueueName::Pending, QueueName::Ready];
}

#[derive(Debug, Default)]
struct Queues {
    received: Queue,
    validated: Queue,
    verified: Queue,
    pending: Queue,
    ready: Queue,
}

impl Queues {
    fn get(&self, name: QueueName) -> &Queue {
        match name {
            QueueName::Received => &self.received,
            QueueName::Validated => &self.validated,
            QueueName::Verified => &self.verified,
            QueueName::Pending => &self.pending,
            QueueName::Ready => &self.ready,
        }
    }

    fn get_mut(&mut self, name: QueueName) -> &mut Queue {
        match name {
            QueueName::Received => &mut self.received,
            QueueName::Validated => &mut self.validated,
            QueueName::Verified => &mut self.verified,
            QueueName::Pending => &mut self.pending,
            QueueName::Ready => &mut self.ready,
        }
    }

    /// Remove matching transactions from each of the named queues.
    fn remove_for<F>(&mut self, names: &[QueueName], mut predicate: F) -> Vec<Transaction>
    where
        F: FnMut(&Transaction) -> bool,
    {
        names
            .iter()
            .flat_map(|name| self.get_mut(*name).remove_for(&mut predicate))
            .collect()
    }
}

/// Number of transactions per queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueSizes {
    pub received: usize,
    pub validated: usize,
    pub verified: usize,
    pub pending: usize,
    pub ready: usize,
}

pub struct TransactionPool<P: TransactionProcessor> {
    config: TxPoolConfig,
    processor: P,
    queues: Queues,
}

impl<P: TransactionProcessor> TransactionPool<P> {
    pub fn new(config: TxPoolConfig, processor: P) -> Result<Self, TxPoolError> {
        config.validate()?;
        Ok(Self {
            config,
            processor,
            queues: Queues::default(),
        })
    }

    pub fn config(&self) -> &TxPoolConfig {
        &self.config
    }

    /// Queue unknown transactions for validation. Returns how many were accepted.
    pub fn add_transactions(&mut self, transactions: Vec<Transaction>) -> usize {
        self.add_new_transactions(transactions).len()
    }

    /// Like `add_transactions`, but returns the accepted transactions in batch order.
    pub fn add_new_transactions(&mut self, transactions: Vec<Transaction>) -> Vec<Transaction> {
        let mut seen = HashSet::new();
        let fresh: Vec<Transaction> = transactions
            .into_iter()
            .filter(|tx| !self.exists_in_transaction_pool(&tx.id) && seen.insert(tx.id.clone()))
            .collect();

        if !fresh.is_empty() {
            debug!("☕ Received {} new transactions", fresh.len());
        }
        self.queues.received.enqueue_many(fresh.clone());
        fresh
    }

    pub fn exists_in_transaction_pool(&self, id: &str) -> bool {
        QueueName::ALL
            .iter()
            .any(|name| self.queues.get(*name).exists(id))
    }

    /// Take up to `limit` of the oldest ready transactions.
    pub fn get_processable_transactions(&mut self, limit: usize) -> Vec<Transaction> {
        self.queues.ready.dequeue_oldest(limit)
    }

    /// Ready transactions, without taking them out of the pool.
    pub fn peek_processable_transactions(&self, limit: usize) -> Vec<Transaction> {
        self.queues.ready.peek_oldest(limit)
    }

    pub fn on_new_block(&mut self, block: &Block) {
        let ids: HashSet<&str> = block.transactions.iter().map(|tx| tx.id.as_str()).collect();
        let senders: HashSet<&str> = block
            .transactions
            .iter()
            .map(|tx| tx.sender_id.as_str())
            .collect();

        let confirmed = self
            .queues
            .remove_for(&QueueName::ALL, |tx| ids.contains(tx.id.as_str()));
        let affected = self
            .queues
            .remove_for(&QueueName::CHECKED, |tx| senders.contains(tx.sender_id.as_str()));

        info!(
            "📣 Block {} confirmed {} pooled transactions, {} sent back to validated",
            block.height,
            confirmed.len(),
            affected.len()
        );
        self.queues.validated.enqueue_many(affected);
    }

    pub fn on_delete_block(&mut self, block: &Block) {
        let recipients: HashSet<&str> = block
            .transactions
            .iter()
            .map(|tx| tx.recipient_id.as_str())
            .collect();
        let affected = self.queues.remove_for(&QueueName::CHECKED, |tx| {
            recipients.contains(tx.recipient_id.as_str())
        });
        self.queues.validated.enqueue_many(affected);

        // Copies received again while the block was confirmed give way to the block's own.
        let ids: HashSet<&str> = block.transactions.iter().map(|tx| tx.id.as_str()).collect();
        self.queues
            .remove_for(&QueueName::ALL, |tx| ids.contains(tx.id.as_str()));
        self.queues
            .verified
            .enqueue_many(block.transactions.clone());

        info!(
            "📣 Block {} deleted, {} transactions back in the pool",
            block.height,
            block.transactions.len()
        );
    }

    pub fn on_round_rollback(&mut self, delegates: &[String]) {
        let delegates: HashSet<&str> = delegates.iter().map(String::as_str).collect();
        let affected = self.queues.remove_for(&QueueName::CHECKED, |tx| {
            delegates.contains(tx.sender_id.as_str())
        });
        self.queues.validated.enqueue_many(affected);
    }

    /// Drop every transaction that outlived its timeout.
    pub fn expire_transactions(&mut self, now: u64) -> Vec<Transaction> {
        let config = &self.config;
        let expired = self
            .queues
            .remove_for(&QueueName::ALL, |tx| tx.is_expired(now, config));
        if !expired.is_empty() {
            info!("📣 Expired {} transactions", expired.len());
        }
        expired
    }

    pub fn validate_received_transactions(&mut self) -> Result<(), TxPoolError> {
        let batch = self.queues.received.dequeue_oldest(self.config.batch_size);
        if batch.is_empty() {
            return Ok(());
        }

        match self.processor.validate_transactions(&batch) {
            Ok(resp) => {
                let valid = accepted(&batch, resp);
                self.queues.validated.enqueue_many(valid);
                Ok(())
            }
            Err(err) => {
                self.queues.received.requeue(batch);
                Err(err)
            }
        }
    }

    pub fn verify_validated_transactions(&mut self) -> Result<(), TxPoolError> {
        let batch = self.queues.validated.dequeue_oldest(self.config.batch_size);
        if batch.is_empty() {
            return Ok(());
        }

        match self.processor.verify_transactions(&batch) {
            Ok(resp) => {
                let valid = accepted(&batch, resp);
                self.queues.verified.enqueue_many(valid);
                Ok(())
            }
            Err(err) => {
                self.queues.validated.requeue(batch);
                Err(err)
            }
        }
    }

    pub fn process_verified_transactions(&mut self) -> Result<(), TxPoolError> {
        let batch = self.queues.verified.dequeue_oldest(self.config.batch_size);
        if batch.is_empty() {
            return Ok(());
        }

        match self.processor.apply_transactions(&batch) {
            Ok(resp) => {
                let (pending, ready): (Vec<Transaction>, Vec<Transaction>) = accepted(&batch, resp)
                    .into_iter()
                    .partition(|tx| tx.multisignature_status == MultisignatureStatus::Pending);
                self.queues.pending.enqueue_many(pending);
                self.queues.ready.enqueue_many(ready);
                Ok(())
            }
            Err(err) => {
                self.queues.verified.requeue(batch);
                Err(err)
            }
        }
    }

    pub fn queue_sizes(&self) -> QueueSizes {
        QueueSizes {
            received: self.queues.received.len(),
            validated: self.queues.validated.len(),
            verified: self.queues.verified.len(),
            pending: self.queues.pending.len(),
            ready: self.queues.ready.len(),
        }
    }

    pub fn transactions(&self, name: QueueName) -> Vec<Transaction> {
        self.queues.get(name).transactions()
    }
}

/// The valid transactions of a stage response that really were part of the batch.
fn accepted(batch: &[Transaction], resp: ProcessTransactionsResponse) -> Vec<Transaction> {
    for err in &resp.errors {
        warn!("❌ {}", err);
    }
    if !resp.invalid_transactions.is_empty() {
        warn!(
            "❌ Dropped {} invalid transactions",
            resp.invalid_transactions.len()
        );
    }

    let ids: HashSet<&str> = batch.iter().map(|tx| tx.id.as_str()).collect();
    resp.valid_transactions
        .into_iter()
        .filter(|tx| ids.contains(tx.id.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::{error::TransactionError, transaction::TransactionKind};

    /// Accepts everything except transactions whose id starts with `bad`.
    #[derive(Default)]
    struct Processor {
        fail: AtomicBool,
    }

    impl Processor {
        fn split(&self, txs: &[Transaction]) -> Result<ProcessTransactionsResponse, TxPoolError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TxPoolError::Processor {
                    stage: "test",
                    message: "unavailable".to_owned(),
                });
            }
            let (invalid, valid): (Vec<_>, Vec<_>) =
                txs.iter().cloned().partition(|tx| tx.id.starts_with("bad"));
            let errors = invalid
                .iter()
                .map(|tx| TransactionError::new(&tx.id, "rejected"))
                .collect();
            Ok(ProcessTransactionsResponse {
                valid_transactions: valid,
                invalid_transactions: invalid,
                errors,
            })
        }
    }

    impl TransactionProcessor for Processor {
        fn validate_transactions(&self, txs: &[Transaction]) -> Result<ProcessTransactionsResponse, TxPoolError> {
            self.split(txs)
        }

        fn verify_transactions(&self, txs: &[Transaction]) -> Result<ProcessTransactionsResponse, TxPoolError> {
            self.split(txs)
        }

        fn apply_transactions(&self, txs: &[Transaction]) -> Result<ProcessTransactionsResponse, TxPoolError> {
            self.split(txs)
        }
    }

    fn tx(id: &str, sender: &str, recipient: &str) -> Transaction {
        Transaction::new(id, sender, recipient, TransactionKind::Transfer)
    }

    fn pool() -> TransactionPool<Processor> {
        TransactionPool::new(TxPoolConfig::default(), Processor::default()).unwrap()
    }

    fn run_pipeline(pool: &mut TransactionPool<Processor>) {
        pool.validate_received_transactions().unwrap();
        pool.verify_validated_transactions().unwrap();
        pool.process_verified_transactions().unwrap();
    }

    fn ids(txs: &[Transaction]) -> Vec<&str> {
        txs.iter().map(|tx| tx.id.as_str()).collect()
    }

    #[test]
    fn ingestion_is_idempotent() {
        let mut pool = pool();
        assert_eq!(pool.add_transactions(vec![tx("1", "a", "b"), tx("1", "a", "b")]), 1);
        assert_eq!(pool.add_transactions(vec![tx("1", "a", "b"), tx("2", "a", "b")]), 1);

        pool.validate_received_transactions().unwrap();
        assert_eq!(pool.add_transactions(vec![tx("1", "a", "b")]), 0);
        assert!(pool.exists_in_transaction_pool("1"));
        assert_eq!(pool.queue_sizes().validated, 2);
    }

    #[test]
    fn only_unknown_transactions_are_returned() {
        let mut pool = pool();
        pool.add_transactions(vec![tx("1", "a", "b")]);

        let added = pool.add_new_transactions(vec![
            tx("1", "a", "b"),
            tx("2", "a", "b"),
            tx("3", "a", "b"),
            tx("2", "a", "b"),
        ]);
        assert_eq!(ids(&added), vec!["2", "3"]);
        assert!(pool.add_new_transactions(vec![tx("3", "a", "b")]).is_empty());
    }

    #[test]
    fn invalid_transactions_are_dropped() {
        let mut pool = pool();
        pool.add_transactions(vec![tx("1", "a", "b"), tx("bad-2", "a", "b")]);
        run_pipeline(&mut pool);

        assert_eq!(
            pool.queue_sizes(),
            QueueSizes {
                ready: 1,
                ..Default::default()
            }
        );
        assert!(!pool.exists_in_transaction_pool("bad-2"));
    }

    #[test]
    fn pending_multisignature_waits_in_pending() {
        let mut pool = pool();
        pool.add_transactions(vec![
            tx("1", "a", "b").with_multisignature_status(MultisignatureStatus::Pending),
            tx("2", "a", "b").with_multisignature_status(MultisignatureStatus::Ready),
        ]);
        run_pipeline(&mut pool);

        assert_eq!(ids(&pool.transactions(QueueName::Pending)), vec!["1"]);
        assert_eq!(ids(&pool.transactions(QueueName::Ready)), vec!["2"]);
    }

    #[test]
    fn failing_stage_keeps_the_batch() {
        let mut pool = pool();
        pool.add_transactions(vec![tx("1", "a", "b"), tx("2", "a", "b")]);
        pool.processor.fail.store(true, Ordering::SeqCst);

        assert!(pool.validate_received_transactions().is_err());
        assert_eq!(ids(&pool.transactions(QueueName::Received)), vec!["1", "2"]);
    }

    #[test]
    fn batches_are_bounded() {
        let config = TxPoolConfig::default().with_batch_size(2);
        let mut pool = TransactionPool::new(config, Processor::default()).unwrap();
        pool.add_transactions((0..5).map(|i| tx(&i.to_string(), "a", "b")).collect());

        pool.validate_received_transactions().unwrap();
        assert_eq!(pool.queue_sizes().received, 3);
        assert_eq!(pool.queue_sizes().validated, 2);
    }

    #[test]
    fn new_block_confirms_and_resets_senders() {
        let mut pool = pool();
        pool.add_transactions(vec![
            tx("1", "alice", "bob"),
            tx("2", "alice", "carol"),
            tx("3", "dave", "bob"),
        ]);
        run_pipeline(&mut pool);
        pool.add_transactions(vec![tx("4", "alice", "erin")]);

        let block = Block {
            height: 10,
            transactions: vec![tx("1", "alice", "bob")],
        };
        pool.on_new_block(&block);

        assert!(!pool.exists_in_transaction_pool("1"));
        assert_eq!(ids(&pool.transactions(QueueName::Validated)), vec!["2"]);
        assert_eq!(ids(&pool.transactions(QueueName::Ready)), vec!["3"]);
        // Unchecked queues keep their transactions.
        assert_eq!(ids(&pool.transactions(QueueName::Received)), vec!["4"]);
    }

    #[test]
    fn deleted_block_goes_back_to_verified() {
        let mut pool = pool();
        pool.add_transactions(vec![tx("1", "dave", "bob"), tx("2", "erin", "frank")]);
        run_pipeline(&mut pool);
        pool.add_transactions(vec![tx("9", "alice", "bob")]);

        let block = Block {
            height: 10,
            transactions: vec![tx("9", "alice", "bob"), tx("8", "alice", "gina")],
        };
        pool.on_delete_block(&block);

        assert_eq!(ids(&pool.transactions(QueueName::Validated)), vec!["1"]);
        assert_eq!(ids(&pool.transactions(QueueName::Verified)), vec!["9", "8"]);
        assert_eq!(ids(&pool.transactions(QueueName::Ready)), vec!["2"]);
        assert!(pool.transactions(QueueName::Received).is_empty());
    }

    #[test]
    fn round_rollback_resets_delegates() {
        let mut pool = pool();
        pool.add_transactions(vec![tx("1", "delegate", "b"), tx("2", "other", "b")]);
        run_pipeline(&mut pool);

        pool.on_round_rollback(&["delegate".to_owned()]);
        assert_eq!(ids(&pool.transactions(QueueName::Validated)), vec!["1"]);
        assert_eq!(ids(&pool.transactions(QueueName::Ready)), vec!["2"]);
    }

    #[test]
    fn expiry_drops_old_transactions_everywhere() {
        let mut pool = pool();
        pool.add_transactions(vec![
            tx("old", "a", "b").with_received_at(0),
            tx("new", "a", "b").with_received_at(20_000),
        ]);
        pool.validate_received_transactions().unwrap();
        pool.add_transactions(vec![tx("old-received", "a", "b").with_received_at(0)]);

        let expired = pool.expire_transactions(20_000);
        let mut expired = ids(&expired);
        expired.sort();
        assert_eq!(expired, vec!["old", "old-received"]);
        assert_eq!(ids(&pool.transactions(QueueName::Validated)), vec!["new"]);
    }
}
