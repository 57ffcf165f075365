//! Peer discovery: ask known peers for the peers they know.

use std::net::IpAddr;

use async_trait::async_trait;
use futures::future::join_all;
use itertools::Itertools;
use log::warn;

use crate::{
    error::P2pError,
    types::{PeerId, PeerInfo},
};

/// Anything that can hand us a peer list.
#[async_trait]
pub trait PeerListSource: Send + Sync {
    fn source_id(&self) -> PeerId;

    async fn fetch_peers(&self) -> Result<Vec<PeerInfo>, P2pError>;
}

#[derive(Clone, Debug, Default)]
pub struct DiscoveryOptions {
    pub blacklist: Vec<IpAddr>,
}

/// Query every source concurrently and merge the answers.
///
/// A failing source contributes nothing. The result holds at most one entry per `ip:port`
/// (first seen wins) and no blacklisted IP.
pub async fn discover_peers<S: PeerListSource>(
    sources: &[S],
    options: &DiscoveryOptions,
) -> Vec<PeerInfo> {
    let lists = join_all(sources.iter().map(|source| async move {
        match source.fetch_peers().await {
            Ok(peers) => peers,
            Err(err) => {
                warn!("❌ Failed to fetch peers from {}: {}", source.source_id(), err);
                vec![]
            }
        }
    }))
    .await;

    lists
        .into_iter()
        .flatten()
        .unique_by(PeerInfo::peer_id)
        .filter(|peer| !options.blacklist.contains(&peer.ip_address))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSource {
        id: &'static str,
        peers: Option<Vec<PeerInfo>>,
    }

    #[async_trait]
    impl PeerListSource for StaticSource {
        fn source_id(&self) -> PeerId {
            PeerId::from(self.id)
        }

        async fn fetch_peers(&self) -> Result<Vec<PeerInfo>, P2pError> {
            self.peers
                .clone()
                .ok_or_else(|| P2pError::transport(&self.source_id(), "unreachable"))
        }
    }

    fn peer(ip: &str, port: u16, height: u64) -> PeerInfo {
        PeerInfo::new(ip.parse().unwrap(), port, height)
    }

    #[tokio::test]
    async fn merges_and_deduplicates() {
        let sources = vec![
            StaticSource {
                id: "a",
                peers: Some(vec![peer("10.0.0.1", 5000, 1), peer("10.0.0.2", 5000, 1)]),
            },
            StaticSource {
                id: "b",
                peers: Some(vec![peer("10.0.0.2", 5000, 7), peer("10.0.0.2", 5001, 1)]),
            },
        ];

        let found = discover_peers(&sources, &DiscoveryOptions::default()).await;
        let ids: Vec<String> = found.iter().map(|p| p.peer_id().to_string()).collect();
        assert_eq!(ids, vec!["10.0.0.1:5000", "10.0.0.2:5000", "10.0.0.2:5001"]);
        // First seen wins.
        assert_eq!(found[1].height, 1);
    }

    #[tokio::test]
    async fn blacklisted_ips_are_dropped() {
        let sources = vec![StaticSource {
            id: "a",
            peers: Some(vec![peer("10.0.0.1", 5000, 1), peer("10.0.0.3", 5000, 1)]),
        }];
        let options = DiscoveryOptions {
            blacklist: vec!["10.0.0.3".parse().unwrap()],
        };

        let found = discover_peers(&sources, &options).await;
        assert_eq!(found, vec![peer("10.0.0.1", 5000, 1)]);
    }

    #[tokio::test]
    async fn failing_sources_contribute_nothing() {
        let sources = vec![
            StaticSource { id: "down", peers: None },
            StaticSource {
                id: "up",
                peers: Some(vec![peer("10.0.0.1", 5000, 1)]),
            },
        ];

        let found = discover_peers(&sources, &DiscoveryOptions::default()).await;
        assert_eq!(found, vec![peer("10.0.0.1", 5000, 1)]);

        let none: Vec<StaticSource> = vec![];
        assert!(discover_peers(&none, &DiscoveryOptions::default()).await.is_empty());
    }
}
