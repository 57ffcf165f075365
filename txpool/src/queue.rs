//! An ordered set of transactions.
//!
//! New transactions enter at the front, so the back holds the oldest ones. An id index sits
//! next to the sequence and always holds exactly the ids of the sequence.

use std::collections::{HashSet, VecDeque};

use crate::transaction::Transaction;

#[derive(Clone, Debug, Default)]
pub struct Queue {
    transactions: VecDeque<Transaction>,
    index: HashSet<String>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a batch at the front, keeping the batch order. Ids already queued are skipped.
    pub fn enqueue_many(&mut self, transactions: Vec<Transaction>) {
        let fresh: Vec<Transaction> = transactions
            .into_iter()
            .filter(|tx| self.index.insert(tx.id.clone()))
            .collect();

        for tx in fresh.into_iter().rev() {
            self.transactions.push_front(tx);
        }
    }

    pub fn enqueue_one(&mut self, transaction: Transaction) {
        self.enqueue_many(vec![transaction]);
    }

    /// Put a batch back at the oldest end, as if it had never been dequeued.
    pub fn requeue(&mut self, transactions: Vec<Transaction>) {
        for tx in transactions {
            if self.index.insert(tx.id.clone()) {
                self.transactions.push_back(tx);
            }
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Remove and return every transaction matching `predicate`. The rest keep their order.
    pub fn remove_for<F>(&mut self, mut predicate: F) -> Vec<Transaction>
    where
        F: FnMut(&Transaction) -> bool,
    {
        let (removed, kept): (VecDeque<Transaction>, VecDeque<Transaction>) =
            self.transactions.drain(..).partition(|tx| predicate(tx));

        self.transactions = kept;
        for tx in &removed {
            self.index.remove(&tx.id);
        }
        removed.into()
    }

    /// Remove the longest run at the oldest end for which `predicate` holds.
    ///
    /// Scanning stops at the first transaction that fails. The run is returned in queue order.
    pub fn dequeue_until<F>(&mut self, mut predicate: F) -> Vec<Transaction>
    where
        F: FnMut(&Transaction) -> bool,
    {
        let mut taken = Vec::new();
        while let Some(tx) = self.transactions.back() {
            if !predicate(tx) {
                break;
            }
            if let Some(tx) = self.transactions.pop_back() {
                self.index.remove(&tx.id);
                taken.push(tx);
            }
        }

        taken.reverse();
        taken
    }

    /// Dequeue at most `limit` of the oldest transactions.
    pub fn dequeue_oldest(&mut self, limit: usize) -> Vec<Transaction> {
        let mut count = 0;
        self.dequeue_until(|_| {
            count += 1;
            count <= limit
        })
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Snapshot in queue order, newest first.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.iter().cloned().collect()
    }

    pub fn peek_oldest(&self, limit: usize) -> Vec<Transaction> {
        self.transactions.iter().rev().take(limit).cloned().collect()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.index.len() == self.transactions.len()
            && self.transactions.iter().all(|tx| self.index.contains(&tx.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionKind;

    fn tx(id: &str) -> Transaction {
        Transaction::new(id, "sender", "recipient", TransactionKind::Transfer)
    }

    fn ids(txs: &[Transaction]) -> Vec<&str> {
        txs.iter().map(|tx| tx.id.as_str()).collect()
    }

    #[test]
    fn enqueued_transaction_can_be_removed_by_id() {
        let mut queue = Queue::new();
        queue.enqueue_many(vec![tx("1"), tx("2")]);
        let t = tx("3");

        queue.enqueue_one(t.clone());
        assert!(queue.is_consistent());
        assert!(queue.exists(&t.id));

        let removed = queue.remove_for(|x| x.id == t.id);
        assert_eq!(removed, vec![t.clone()]);
        assert!(!queue.exists(&t.id));
        assert!(queue.is_consistent());
        assert_eq!(ids(&queue.transactions()), vec!["1", "2"]);
    }

    #[test]
    fn batches_are_prepended_in_order() {
        let mut queue = Queue::new();
        queue.enqueue_many(vec![tx("1"), tx("2")]);
        queue.enqueue_many(vec![tx("3"), tx("4")]);
        queue.enqueue_one(tx("5"));

        assert_eq!(ids(&queue.transactions()), vec!["5", "3", "4", "1", "2"]);
        assert!(queue.exists("4"));
        assert!(!queue.exists("6"));
        assert!(queue.is_consistent());
    }

    #[test]
    fn duplicates_are_skipped() {
        let mut queue = Queue::new();
        queue.enqueue_many(vec![tx("1"), tx("1")]);
        queue.enqueue_one(tx("1"));
        assert_eq!(queue.len(), 1);
        assert!(queue.is_consistent());
    }

    #[test]
    fn remove_for_partitions() {
        let mut queue = Queue::new();
        queue.enqueue_many(vec![tx("1"), tx("2"), tx("3"), tx("4")]);

        let removed = queue.remove_for(|tx| tx.id == "2" || tx.id == "4");
        assert_eq!(ids(&removed), vec!["2", "4"]);
        assert_eq!(ids(&queue.transactions()), vec!["1", "3"]);
        assert!(!queue.exists("2"));
        assert!(queue.is_consistent());

        assert!(queue.remove_for(|_| false).is_empty());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn dequeue_until_stops_at_first_failure_from_the_tail() {
        let mut queue = Queue::new();
        queue.enqueue_many(vec![tx("a"), tx("b"), tx("c"), tx("d")]);

        let taken = queue.dequeue_until(|tx| tx.id != "b");
        assert_eq!(ids(&taken), vec!["c", "d"]);
        assert_eq!(ids(&queue.transactions()), vec!["a", "b"]);
        assert!(queue.is_consistent());

        // Nothing is taken if the oldest one fails.
        assert!(queue.dequeue_until(|tx| tx.id == "a").is_empty());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn dequeue_oldest_counts() {
        let mut queue = Queue::new();
        queue.enqueue_many((1..=5).map(|i| tx(&i.to_string())).collect());

        assert_eq!(ids(&queue.peek_oldest(2)), vec!["5", "4"]);
        assert_eq!(ids(&queue.dequeue_oldest(3)), vec!["3", "4", "5"]);
        assert_eq!(ids(&queue.transactions()), vec!["1", "2"]);
        assert_eq!(queue.dequeue_oldest(10).len(), 2);
        assert!(queue.is_empty());
        assert!(queue.dequeue_oldest(1).is_empty());
        assert!(queue.is_consistent());
    }

    #[test]
    fn requeue_restores_the_oldest_end() {
        let mut queue = Queue::new();
        queue.enqueue_many(vec![tx("1"), tx("2"), tx("3")]);
        let taken = queue.dequeue_oldest(2);
        queue.requeue(taken);
        assert_eq!(ids(&queue.transactions()), vec!["1", "2", "3"]);
        assert!(queue.is_consistent());
    }
}
