//! Picks the peers we talk to.
//!
//! Peers behind our last block height are dropped. The rest are bucketed by height and only
//! the ones close to the most populated bucket are kept, so that a handful of peers claiming
//! an unusual height cannot attract our requests.

use std::collections::HashMap;

use rand::Rng;

use crate::{error::P2pError, types::PeerInfo};

/// Width of a histogram bucket.
const AGGREGATION: u64 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectionParams {
    pub last_block_height: u64,
}

impl SelectionParams {
    pub fn new(last_block_height: u64) -> Self {
        Self { last_block_height }
    }
}

/// Select `count` good peers; `count == 0` returns every good peer.
pub fn select_peers(
    peers: &[PeerInfo],
    params: SelectionParams,
    count: usize,
) -> Result<Vec<PeerInfo>, P2pError> {
    select_peers_with_rng(peers, params, count, &mut rand::thread_rng())
}

pub fn select_peers_with_rng<R: Rng + ?Sized>(
    peers: &[PeerInfo],
    params: SelectionParams,
    count: usize,
    rng: &mut R,
) -> Result<Vec<PeerInfo>, P2pError> {
    let mut sorted: Vec<&PeerInfo> = peers
        .iter()
        .filter(|peer| peer.height >= params.last_block_height)
        .collect();

    if sorted.is_empty() {
        return match count {
            0 => Ok(vec![]),
            _ => Err(not_enough_peers(count, 0)),
        };
    }

    // Highest first, so that on equal counts the higher bucket wins.
    sorted.sort_by(|a, b| b.height.cmp(&a.height));

    let mut histogram: HashMap<u64, usize> = HashMap::new();
    let (mut best_height, mut best_count) = (0, 0);
    for peer in &sorted {
        let bucket = peer.height / AGGREGATION * AGGREGATION;
        let seen = histogram.entry(bucket).or_insert(0);
        *seen += 1;
        if *seen > best_count {
            best_count = *seen;
            best_height = bucket;
        }
    }

    let mut good_peers: Vec<PeerInfo> = sorted
        .into_iter()
        .filter(|peer| peer.height.abs_diff(best_height) < AGGREGATION + 1)
        .cloned()
        .collect();

    if count == 0 || count == good_peers.len() {
        return Ok(good_peers);
    }

    if count > good_peers.len() {
        return Err(not_enough_peers(count, good_peers.len()));
    }

    if count == 1 {
        let index = rng.gen_range(0..good_peers.len());
        return Ok(vec![good_peers.swap_remove(index)]);
    }

    let mut selected = Vec::with_capacity(count);
    for _ in 0..count {
        let index = rng.gen_range(0..good_peers.len());
        selected.push(good_peers.remove(index));
    }

    Ok(selected)
}

fn not_enough_peers(requested: usize, available: usize) -> P2pError {
    P2pError::NotEnoughPeers(format!(
        "Requested number of peers: '{requested}' is more than the available number of good peers: '{available}'"
    ))
}

/// Peers to dial. Every candidate is currently accepted.
pub fn select_for_connection(peers: Vec<PeerInfo>) -> Vec<PeerInfo> {
    peers
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, net::IpAddr};

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn peer(last_octet: u8, height: u64) -> PeerInfo {
        let ip: IpAddr = format!("12.12.12.{last_octet}").parse().unwrap();
        PeerInfo::new(ip, 5000, height)
    }

    fn peer_list() -> Vec<PeerInfo> {
        vec![
            peer(1, 545776),
            peer(2, 545777),
            peer(3, 545778),
            peer(4, 545779),
            peer(5, 545790),
        ]
    }

    fn params() -> SelectionParams {
        SelectionParams::new(545777)
    }

    #[test]
    fn returns_the_cluster_around_the_modal_height() {
        let selected = select_peers(&peer_list(), params(), 0).unwrap();

        // 545776 is behind, 545790 is too far from the 545778..545779 bucket.
        let heights: Vec<u64> = selected.iter().map(|p| p.height).collect();
        assert_eq!(heights, vec![545779, 545778, 545777]);
    }

    #[test]
    fn without_params_all_heights_are_candidates() {
        let selected = select_peers(&peer_list(), SelectionParams::default(), 0).unwrap();
        let heights: HashSet<u64> = selected.iter().map(|p| p.height).collect();
        assert_eq!(heights, HashSet::from([545776, 545777, 545778, 545779]));
    }

    #[test]
    fn empty_input_returns_empty_for_count_zero() {
        assert!(select_peers(&[], params(), 0).unwrap().is_empty());
    }

    #[test]
    fn empty_input_with_count_fails() {
        for count in 1..4 {
            assert!(matches!(
                select_peers(&[], params(), count),
                Err(P2pError::NotEnoughPeers(_))
            ));
        }
    }

    #[test]
    fn behind_peers_are_never_selected() {
        let behind: Vec<PeerInfo> = peer_list()
            .into_iter()
            .filter(|p| p.height < params().last_block_height)
            .collect();
        assert!(select_peers(&behind, params(), 0).unwrap().is_empty());
        assert!(select_peers(&behind, params(), 2).is_err());
    }

    #[test]
    fn count_equal_to_available_returns_all() {
        let all = select_peers(&peer_list(), SelectionParams::default(), 0).unwrap();
        let selected = select_peers(&peer_list(), SelectionParams::default(), all.len()).unwrap();

        let all: HashSet<_> = all.into_iter().collect();
        let selected: HashSet<_> = selected.into_iter().collect();
        assert_eq!(all, selected);
    }

    #[test]
    fn too_many_requested_peers_fails() {
        let err = select_peers(&peer_list(), params(), 4).unwrap_err();
        assert!(matches!(err, P2pError::NotEnoughPeers(_)));
        assert_eq!(
            err.to_string(),
            "Requested number of peers: '4' is more than the available number of good peers: '3'"
        );
    }

    #[test]
    fn single_pick_comes_from_the_cluster() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let selected =
                select_peers_with_rng(&peer_list(), params(), 1, &mut rng).unwrap();
            assert_eq!(selected.len(), 1);
            assert!([545777, 545778, 545779].contains(&selected[0].height));
        }
    }

    #[test]
    fn sampling_never_repeats_a_peer() {
        let peers: Vec<PeerInfo> = (1..=20).map(|i| peer(i, 100 + u64::from(i % 2))).collect();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..20 {
            let selected = select_peers_with_rng(&peers, SelectionParams::new(100), 5, &mut rng)
                .unwrap();
            let unique: HashSet<_> = selected.iter().collect();
            assert_eq!(selected.len(), 5);
            assert_eq!(unique.len(), 5);
        }
    }

    #[test]
    fn a_lying_peer_does_not_drag_selection() {
        let mut peers: Vec<PeerInfo> = (1..=5).map(|i| peer(i, 200)).collect();
        peers.push(peer(99, 1_000_000));

        let selected = select_peers(&peers, SelectionParams::new(150), 0).unwrap();
        assert_eq!(selected.len(), 5);
        assert!(selected.iter().all(|p| p.height == 200));
    }

    #[test]
    fn ties_prefer_the_higher_bucket() {
        let peers = vec![peer(1, 10), peer(2, 20)];
        let selected = select_peers(&peers, SelectionParams::default(), 0).unwrap();
        assert_eq!(selected, vec![peer(2, 20)]);
    }

    #[test]
    fn select_for_connection_is_a_pass_through() {
        assert_eq!(select_for_connection(peer_list()), peer_list());
    }
}
