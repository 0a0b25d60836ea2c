//! Overlay integration tests
//!
//! Zone partitioning under joins and leaves, greedy routing, membership
//! exclusivity and anycast deduplication.

use std::sync::Arc;

use eventcloud::config::EventCloudConfig;
use eventcloud::overlay::network::Network;
use eventcloud::overlay::peer::SemanticPeer;
use eventcloud::overlay::router::Hop;
use eventcloud::overlay::{Coordinate, Zone};
use eventcloud::parsing::SparqlDecomposer;
use eventcloud::pubsub::{NotificationType, Subscription};
use eventcloud::Error;

/// Deterministic xorshift generator, enough to scatter test coordinates.
struct Scatter(u64);

impl Scatter {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// A fully specified coordinate strictly inside the space.
    fn coordinate(&mut self) -> Coordinate {
        let elements: Vec<u64> = (0..4).map(|_| self.next() % u64::MAX).collect();
        Coordinate::from_elements(&elements)
    }
}

fn zones(network: &Network) -> Vec<Zone> {
    network.activated_peers().iter().filter_map(|peer| peer.zone()).collect()
}

/// Zones are pairwise disjoint and every sampled coordinate has exactly one owner.
fn assert_partition(network: &Network, samples: usize) {
    let zones = zones(network);
    for (i, a) in zones.iter().enumerate() {
        for b in &zones[i + 1..] {
            assert!(!a.intersects(b), "{} intersects {}", a, b);
        }
    }
    let mut scatter = Scatter(0x9E37_79B9_7F4A_7C15);
    for _ in 0..samples {
        let coordinate = scatter.coordinate();
        let owners = zones.iter().filter(|zone| zone.contains(&coordinate)).count();
        assert_eq!(owners, 1, "{:?} has {} owners", coordinate, owners);
    }
}

/// Every neighbor entry mirrors the current zone of the peer it names.
fn assert_neighbor_tables(network: &Network) {
    for peer in network.activated_peers() {
        for id in peer.neighbors() {
            let neighbor = network.peer(id).unwrap();
            assert!(neighbor.is_activated(), "{} lists departed {}", peer.id(), id);
            let entry = neighbor.neighbor_entry().unwrap();
            assert!(
                entry.zone.neighbors(&peer.zone().unwrap()).is_some(),
                "{} and {} are not adjacent",
                peer.id(),
                id
            );
        }
    }
}

fn walk(network: &Network, start: &Arc<SemanticPeer>, coordinate: &Coordinate) -> (Arc<SemanticPeer>, usize) {
    let mut current = Arc::clone(start);
    let mut hops = 0;
    loop {
        match current.next_hop(coordinate).unwrap() {
            Hop::Local => return (current, hops),
            Hop::Forward(next) => {
                current = network.peer(next).unwrap();
                hops += 1;
                assert!(hops <= network.len() * 4, "routing does not converge");
            }
        }
    }
}

#[test]
fn test_joins_partition_the_space() {
    let network = Network::bootstrap(EventCloudConfig::default(), 12).unwrap();

    assert_eq!(network.activated_peers().len(), 12);
    assert_partition(&network, 2000);
    assert_neighbor_tables(&network);
}

#[test]
fn test_leaves_keep_the_partition() {
    let network = Network::bootstrap(EventCloudConfig::default(), 10).unwrap();

    let mut left = 0;
    for peer in network.activated_peers().into_iter().step_by(2) {
        match peer.leave() {
            Ok(()) => {
                left += 1;
                assert!(!peer.is_activated());
            }
            Err(Error::NoMergeableNeighbor(_)) => {}
            Err(e) => panic!("unexpected leave failure: {}", e),
        }
        assert_partition(&network, 500);
        assert_neighbor_tables(&network);
    }

    assert!(left > 0);
    assert_eq!(network.activated_peers().len(), 10 - left);
}

#[test]
fn test_last_peer_cannot_leave() {
    let network = Network::bootstrap(EventCloudConfig::default(), 1).unwrap();
    let peer = network.random_peer().unwrap();

    assert!(matches!(peer.leave(), Err(Error::NoMergeableNeighbor(_))));
    assert!(peer.is_activated());
}

#[test]
fn test_routing_converges_from_every_peer() {
    let network = Network::bootstrap(EventCloudConfig::default(), 9).unwrap();
    let peers = network.activated_peers();
    let mut scatter = Scatter(42);

    for i in 0..1000 {
        let coordinate = scatter.coordinate();
        let start = &peers[i % peers.len()];
        let (owner, _) = walk(&network, start, &coordinate);
        assert!(owner.zone().unwrap().contains(&coordinate));
    }
}

#[test]
fn test_membership_operations_are_exclusive() {
    let network = Network::bootstrap(EventCloudConfig::default(), 2).unwrap();
    let landmark = network.random_peer().unwrap();

    let guard = landmark.try_begin_membership().unwrap();
    let joiner = network.create_peer().unwrap();
    assert!(matches!(joiner.join(&landmark), Err(Error::ConcurrentOverlayOperation(id)) if id == landmark.id()));
    assert!(matches!(landmark.leave(), Err(Error::ConcurrentOverlayOperation(_))));
    assert!(!joiner.is_activated());

    drop(guard);
    joiner.join(&landmark).unwrap();
    assert!(joiner.is_activated());
    assert_partition(&network, 500);
}

#[test]
fn test_join_twice_is_refused() {
    let network = Network::bootstrap(EventCloudConfig::default(), 2).unwrap();
    let peer = network.random_peer().unwrap();
    let landmark = network.activated_peers().into_iter().find(|p| p.id() != peer.id()).unwrap();

    assert!(matches!(peer.join(&landmark), Err(Error::AlreadyActivated(_))));
}

#[test]
fn test_anycast_reaches_each_peer_once() {
    let network = Network::bootstrap(EventCloudConfig::default(), 8).unwrap();
    let decomposer = SparqlDecomposer::new().unwrap();
    let subscription = Subscription::new(
        "SELECT ?s WHERE { GRAPH ?g { ?s ?p ?o } }",
        "proxy://nobody",
        NotificationType::Signal,
        &decomposer,
    )
    .unwrap();
    let id = subscription.id();

    let response = network.index_subscription(subscription).unwrap();
    assert_eq!(response.peers_reached, 8);

    network.settle(std::time::Duration::from_secs(5));
    for peer in network.activated_peers() {
        assert!(peer.has_subscription(id), "{} misses the subscription", peer.id());
        assert_eq!(peer.subscription_count(), 1);
    }
}

#[test]
fn test_anycast_reaches_only_satisfying_peers() {
    let network = Network::bootstrap(EventCloudConfig::default(), 8).unwrap();
    let decomposer = SparqlDecomposer::new().unwrap();
    let subscription = Subscription::new(
        "SELECT ?o WHERE { GRAPH <http://ex.org/g> { <http://ex.org/s> <http://ex.org/p> ?o } }",
        "proxy://nobody",
        NotificationType::Signal,
        &decomposer,
    )
    .unwrap();
    let constraints = subscription.constraints();
    let satisfying = network
        .activated_peers()
        .iter()
        .filter(|peer| peer.zone().unwrap().satisfies(&constraints))
        .count();

    let response = network.index_subscription(subscription).unwrap();
    assert!(satisfying >= 1);
    assert_eq!(response.peers_reached, satisfying);
}
