//! The entry point of the gossip node.

use std::{ops::Deref, sync::Arc};

use gossip_p2p::{NetworkStatus, NodeInfo, P2p, P2pMessagePacket};
use log::info;
use parking_lot::Mutex;
use serde_json::json;
use txpool::{Block, QueueSizes, Transaction, TransactionPool};

use crate::error::Error;

mod event_handler;
mod jobs;
mod processor;

pub use processor::*;

/// Message gossiping transactions to other nodes.
pub const EVENT_POST_TRANSACTIONS: &str = "postTransactions";
/// Request answered with the transactions ready to be forged.
pub const PROCEDURE_GET_TRANSACTIONS: &str = "getTransactions";

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(p2p: P2p, txpool: TransactionPool<BasicProcessor>) -> Self {
        let inner = NodeInner {
            p2p,
            txpool: Mutex::new(txpool),
        };

        Self {
            inner: Arc::new(inner),
        }
    }
}

// Implement `Deref` so that `Node` can be treated as `NodeInner`.
impl Deref for Node {
    type Target = NodeInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

pub struct NodeInner {
    p2p: P2p,
    txpool: Mutex<TransactionPool<BasicProcessor>>,
}

impl NodeInner {
    pub async fn start(&self) -> Result<(), Error> {
        self.p2p.start().await?;
        info!("📣 Node info: {:?}", self.p2p.node_info());
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), Error> {
        self.p2p.stop().await?;
        Ok(())
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.p2p.get_network_status()
    }

    pub fn txpool_status(&self) -> QueueSizes {
        self.txpool.lock().queue_sizes()
    }

    /// Add transactions submitted to this node and gossip the new ones.
    pub fn submit_transactions(&self, transactions: Vec<Transaction>) -> Result<usize, Error> {
        if let Some(tx) = transactions
            .iter()
            .find(|tx| tx.id.is_empty() || tx.sender_id.is_empty())
        {
            return Err(Error::InvalidTransaction(format!(
                "id and sender are required, got '{}' from '{}'",
                tx.id, tx.sender_id
            )));
        }

        let added = self.txpool.lock().add_new_transactions(transactions);
        if !added.is_empty() {
            let message =
                P2pMessagePacket::new(EVENT_POST_TRANSACTIONS, json!({ "transactions": added }));
            self.p2p.send(message);
        }
        Ok(added.len())
    }

    /// Add transactions gossiped by a peer.
    pub fn add_transactions(&self, transactions: Vec<Transaction>) -> usize {
        self.txpool.lock().add_transactions(transactions)
    }

    pub fn get_processable_transactions(&self, limit: usize) -> Vec<Transaction> {
        self.txpool.lock().get_processable_transactions(limit)
    }

    pub fn peek_processable_transactions(&self, limit: usize) -> Vec<Transaction> {
        self.txpool.lock().peek_processable_transactions(limit)
    }

    pub async fn on_new_block(&self, block: Block) {
        self.txpool.lock().on_new_block(&block);
        self.apply_height(block.height).await;
    }

    pub async fn on_delete_block(&self, block: Block) {
        self.txpool.lock().on_delete_block(&block);
        self.apply_height(block.height.saturating_sub(1)).await;
    }

    pub fn on_round_rollback(&self, delegates: &[String]) {
        self.txpool.lock().on_round_rollback(delegates);
    }

    async fn apply_height(&self, height: u64) {
        let node_info = NodeInfo {
            height,
            ..self.p2p.node_info()
        };
        self.p2p.apply_node_info(node_info).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        time::Duration,
    };

    use futures::StreamExt;
    use gossip_p2p::{P2pConfig, P2pEvent};
    use serde_json::Value;
    use tokio::time;
    use txpool::{TransactionKind, TxPoolConfig};

    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn config(seeds: Vec<SocketAddr>) -> P2pConfig {
        P2pConfig::new(NodeInfo::default())
            .with_host_address(LOCALHOST)
            .with_seed_peers(seeds)
    }

    fn transfer(id: &str) -> Transaction {
        Transaction::new(id, "alice", "bob", TransactionKind::Transfer)
    }

    fn gossiped_ids(data: &Value) -> Vec<String> {
        data["transactions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|tx| tx["id"].as_str().unwrap().to_owned())
            .collect()
    }

    #[tokio::test]
    async fn only_added_transactions_are_gossiped() {
        let (seed, mut seed_events) = gossip_p2p::new(config(vec![])).unwrap();
        seed.start().await.unwrap();
        let seed_addr = SocketAddr::new(LOCALHOST, seed.node_info().ws_port);

        let (p2p, _events) = gossip_p2p::new(config(vec![seed_addr])).unwrap();
        let txpool = TransactionPool::new(TxPoolConfig::default(), BasicProcessor).unwrap();
        let node = Node::new(p2p, txpool);
        node.start().await.unwrap();

        let added = node
            .submit_transactions(vec![transfer("1"), transfer("2"), transfer("1")])
            .unwrap();
        assert_eq!(added, 2);
        let added = node
            .submit_transactions(vec![transfer("2"), transfer("3")])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(node.submit_transactions(vec![transfer("3")]).unwrap(), 0);

        let mut gossiped = Vec::new();
        while gossiped.len() < 2 {
            let event = time::timeout(Duration::from_secs(5), seed_events.next())
                .await
                .unwrap()
                .unwrap();
            if let P2pEvent::MessageReceived { message, .. } = event {
                assert_eq!(message.event, EVENT_POST_TRANSACTIONS);
                gossiped.push(gossiped_ids(&message.data));
            }
        }
        assert_eq!(gossiped, vec![vec!["1", "2"], vec!["3"]]);

        // Nothing was sent for the batch with no new transaction.
        let extra = time::timeout(Duration::from_millis(300), async {
            loop {
                match seed_events.next().await {
                    Some(P2pEvent::MessageReceived { .. }) => return true,
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await;
        assert!(!matches!(extra, Ok(true)));

        node.stop().await.unwrap();
        seed.stop().await.unwrap();
    }
}
