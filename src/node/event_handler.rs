use futures::{Stream, StreamExt};
use gossip_p2p::{P2pEvent, P2pMessagePacket, P2pRequest};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::json;
use txpool::Transaction;

use super::{Node, EVENT_POST_TRANSACTIONS, PROCEDURE_GET_TRANSACTIONS};

/// Upper bound of transactions returned by `getTransactions`.
const MAX_SHARED_TRANSACTIONS: usize = 100;

#[derive(Debug, Deserialize)]
struct TransactionsPayload {
    transactions: Vec<Transaction>,
}

impl Node {
    /// Consume the p2p events until the stream ends.
    pub async fn handle_events(&self, mut events: impl Stream<Item = P2pEvent> + Unpin) {
        while let Some(event) = events.next().await {
            match event {
                P2pEvent::RequestReceived(request) => self.handle_request(request),
                P2pEvent::MessageReceived { message, .. } => self.handle_message(message),
                P2pEvent::NewInboundPeer(peer) => debug!("☕ New inbound peer: {}", peer.peer_id()),
                P2pEvent::NewPeer(peer) => debug!("☕ New peer: {}", peer.peer_id()),
                P2pEvent::ConnectOutbound(peer) => info!("📣 Connected to {}", peer.peer_id()),
                P2pEvent::ConnectAbortOutbound(peer) => {
                    warn!("❌ Failed to connect to {}", peer.peer_id())
                }
                P2pEvent::FailedToAddInboundPeer { remote, reason } => {
                    warn!("❌ Rejected inbound peer {}: {}", remote, reason)
                }
            }
        }
    }

    fn handle_request(&self, mut request: P2pRequest) {
        let procedure = request.procedure().to_owned();
        let result = match procedure.as_str() {
            PROCEDURE_GET_TRANSACTIONS => {
                let transactions = self.peek_processable_transactions(MAX_SHARED_TRANSACTIONS);
                info!("📣 << [P2P-OUT] {} transactions", transactions.len());
                request.respond(json!({ "transactions": transactions }))
            }
            _ => request.respond_error(format!("Unknown procedure: {procedure}")),
        };

        if let Err(err) = result {
            error!("❌ << [P2P-OUT] {}", err);
        }
    }

    fn handle_message(&self, message: P2pMessagePacket) {
        if message.event != EVENT_POST_TRANSACTIONS {
            debug!("☕ Ignoring message {}", message.event);
            return;
        }

        match serde_json::from_value::<TransactionsPayload>(message.data) {
            Ok(payload) => {
                let added = self.add_transactions(payload.transactions);
                info!("📣 Added {} gossiped transactions", added);
            }
            Err(err) => error!("❌ >> [P2P-IN] Invalid transactions: {}", err),
        }
    }
}
