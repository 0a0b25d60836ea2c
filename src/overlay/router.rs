//! Greedy next-hop selection over a peer's neighbor table.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};

use crate::error::{Error, Result};
use crate::overlay::can_overlay::CanOverlay;
use crate::overlay::coordinate::{Constraints, Coordinate};
use crate::overlay::messages::RequestId;
use crate::overlay::zone::{Direction, Zone};
use crate::overlay::PeerId;
use rand::seq::IteratorRandom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    /// The current peer owns the target
    Local,
    Forward(PeerId),
}

/// Number of leading dimensions of `coordinate` that `zone` contains.
pub fn rank(zone: &Zone, coordinate: &Coordinate) -> usize {
    (0..zone.dimensions())
        .take_while(|&d| zone.contains_element(d, coordinate.element(d)) == Ordering::Equal)
        .count()
}

/// Next hop toward the peer owning `coordinate`.
///
/// The first dimension the zone does not cover decides the direction; among
/// the neighbors on that side which still cover the earlier dimensions, the
/// best-ranked one wins and ties are broken at random.
pub fn unicast_next_hop(overlay: &CanOverlay, coordinate: &Coordinate) -> Result<Hop> {
    let zone = overlay.zone().ok_or(Error::PeerNotActivated(overlay.id()))?;
    let Some((dimension, direction)) = (0..zone.dimensions()).find_map(|d| {
        match zone.contains_element(d, coordinate.element(d)) {
            Ordering::Less => Some((d, Direction::Inferior)),
            Ordering::Greater => Some((d, Direction::Superior)),
            Ordering::Equal => None,
        }
    }) else {
        return Ok(Hop::Local);
    };

    let candidates: Vec<(usize, PeerId)> = overlay
        .neighbors()
        .get(dimension, direction)
        .map(|entry| (rank(&entry.zone, coordinate), entry.peer))
        .filter(|(rank, _)| *rank >= dimension)
        .collect();
    let best = candidates.iter().map(|(rank, _)| *rank).max().ok_or_else(|| {
        Error::RoutingDeadEnd {
            peer: overlay.id(),
            reason: format!("no neighbor on dimension {} toward {:?}", dimension, direction),
        }
    })?;
    let next = candidates
        .into_iter()
        .filter(|(rank, _)| *rank == best)
        .map(|(_, peer)| peer)
        .choose(&mut rand::rng())
        .ok_or_else(|| Error::RoutingDeadEnd {
            peer: overlay.id(),
            reason: "no best-ranked neighbor".to_string(),
        })?;
    Ok(Hop::Forward(next))
}

/// Neighbors an anycast continues to from a peer whose zone satisfies
/// `constraints`: every neighbor that satisfies them too and was not visited.
pub fn anycast_targets(
    overlay: &CanOverlay,
    constraints: &Constraints,
    visited: &[PeerId],
) -> Vec<PeerId> {
    let mut targets: Vec<PeerId> = overlay
        .neighbors()
        .iter()
        .filter(|(_, _, entry)| entry.zone.satisfies(constraints) && !visited.contains(&entry.peer))
        .map(|(_, _, entry)| entry.peer)
        .collect();
    targets.sort();
    targets.dedup();
    targets
}

/// Bounded memory of the anycast requests a peer already processed.
#[derive(Debug)]
pub struct ReceivedRequests {
    capacity: usize,
    order: VecDeque<RequestId>,
    seen: HashSet<RequestId>,
}

impl ReceivedRequests {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), order: VecDeque::new(), seen: HashSet::new() }
    }

    /// Record `id`; false when it was already recorded.
    pub fn record(&mut self, id: RequestId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::coordinate::Interval;
    use crate::overlay::neighbor_table::NeighborEntry;

    const HALF: u64 = u64::MAX / 2;

    fn zone(lower: &[u64], upper: &[u64]) -> Zone {
        Zone::new(lower.to_vec(), upper.to_vec()).unwrap()
    }

    /// Peer 0 owns the left half of a 2-d space; the right half is split
    /// horizontally between peers 1 (bottom) and 2 (top).
    fn left_peer() -> CanOverlay {
        let mut overlay = CanOverlay::new(PeerId(0), 2);
        overlay.assign_zone(zone(&[0, 0], &[HALF, u64::MAX]), Vec::new());
        overlay.refresh_neighbors(&[
            NeighborEntry::new(PeerId(1), zone(&[HALF, 0], &[u64::MAX, HALF])),
            NeighborEntry::new(PeerId(2), zone(&[HALF, HALF], &[u64::MAX, u64::MAX])),
        ]);
        overlay
    }

    #[test]
    fn test_local_when_owned() {
        let coordinate = Coordinate::from_elements(&[5, 5]);
        assert_eq!(unicast_next_hop(&left_peer(), &coordinate).unwrap(), Hop::Local);
    }

    #[test]
    fn test_forward_prefers_best_rank() {
        let coordinate = Coordinate::from_elements(&[HALF + 10, HALF + 10]);
        assert_eq!(unicast_next_hop(&left_peer(), &coordinate).unwrap(), Hop::Forward(PeerId(2)));

        let coordinate = Coordinate::from_elements(&[HALF + 10, 3]);
        assert_eq!(unicast_next_hop(&left_peer(), &coordinate).unwrap(), Hop::Forward(PeerId(1)));
    }

    #[test]
    fn test_ties_are_spread_over_equally_ranked_neighbors() {
        let quarter = u64::MAX / 4;
        let mut overlay = CanOverlay::new(PeerId(0), 2);
        overlay.assign_zone(zone(&[0, 0], &[HALF, quarter]), Vec::new());
        overlay.refresh_neighbors(&[
            NeighborEntry::new(PeerId(1), zone(&[HALF, 0], &[u64::MAX, quarter / 2])),
            NeighborEntry::new(PeerId(2), zone(&[HALF, quarter / 2], &[u64::MAX, quarter])),
        ]);
        // neither neighbor covers the second element
        let coordinate = Coordinate::from_elements(&[HALF + 10, u64::MAX - 10]);

        let mut chosen = HashSet::new();
        for _ in 0..64 {
            match unicast_next_hop(&overlay, &coordinate).unwrap() {
                Hop::Forward(peer) => {
                    chosen.insert(peer);
                }
                Hop::Local => panic!("coordinate is not owned"),
            }
        }
        assert_eq!(chosen, HashSet::from([PeerId(1), PeerId(2)]));
    }

    #[test]
    fn test_dead_end_without_neighbors() {
        let mut overlay = CanOverlay::new(PeerId(0), 2);
        overlay.assign_zone(zone(&[0, 0], &[HALF, u64::MAX]), Vec::new());
        let coordinate = Coordinate::from_elements(&[HALF + 1, 0]);
        assert!(matches!(
            unicast_next_hop(&overlay, &coordinate),
            Err(Error::RoutingDeadEnd { peer: PeerId(0), .. })
        ));
    }

    #[test]
    fn test_anycast_targets_skip_visited_and_unsatisfying() {
        let overlay = left_peer();
        let all = Constraints::unconstrained(2);
        assert_eq!(anycast_targets(&overlay, &all, &[]), vec![PeerId(1), PeerId(2)]);
        assert_eq!(anycast_targets(&overlay, &all, &[PeerId(1)]), vec![PeerId(2)]);

        let top = Constraints::new(vec![None, Some(Interval::at_least(HALF + 1))]);
        assert_eq!(anycast_targets(&overlay, &top, &[]), vec![PeerId(2)]);
    }

    #[test]
    fn test_received_requests_forget_oldest() {
        let mut received = ReceivedRequests::new(2);
        let id = |sequence| RequestId { origin: PeerId(0), sequence };
        assert!(received.record(id(1)));
        assert!(!received.record(id(1)));
        assert!(received.record(id(2)));
        assert!(received.record(id(3)));
        assert_eq!(received.len(), 2);
        assert!(received.record(id(1)));
    }
}
