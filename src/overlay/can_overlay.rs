//! Overlay state of one peer: its zone, neighbors and split history.
//!
//! This type is pure bookkeeping. Message exchanges between peers during join
//! and leave are driven by [`crate::overlay::peer::SemanticPeer`].

use serde::{Deserialize, Serialize};

use crate::overlay::neighbor_table::{NeighborEntry, NeighborTable};
use crate::overlay::zone::{Direction, Zone, ZoneError};
use crate::overlay::PeerId;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    NotActivated,
    Activated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitEntry {
    pub dimension: usize,
    pub direction: Direction,
}

/// What a landmark hands to a joining peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinIntroduction {
    pub zone: Zone,
    pub split_history: Vec<SplitEntry>,
    pub neighbors: Vec<NeighborEntry>,
}

#[derive(Debug)]
pub struct CanOverlay {
    id: PeerId,
    dimensions: usize,
    state: PeerState,
    zone: Option<Zone>,
    neighbors: NeighborTable,
    split_history: Vec<SplitEntry>,
}

impl CanOverlay {
    pub fn new(id: PeerId, dimensions: usize) -> Self {
        Self {
            id,
            dimensions,
            state: PeerState::NotActivated,
            zone: None,
            neighbors: NeighborTable::new(dimensions),
            split_history: Vec::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_activated(&self) -> bool {
        self.state == PeerState::Activated
    }

    pub fn zone(&self) -> Option<&Zone> {
        self.zone.as_ref()
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn split_history(&self) -> &[SplitEntry] {
        &self.split_history
    }

    /// First peer of a network: owns the whole space.
    pub fn create(&mut self) {
        self.zone = Some(Zone::full(self.dimensions));
        self.split_history.clear();
        self.neighbors.clear();
        self.state = PeerState::Activated;
    }

    /// Splits rotate over the dimensions.
    pub fn next_split_dimension(&self) -> usize {
        self.split_history.last().map_or(0, |entry| (entry.dimension + 1) % self.dimensions)
    }

    /// Landmark side of a join: split the zone, keep a random half and describe
    /// the other half for the joiner. The landmark's own neighbor table is
    /// refreshed against its previous neighbors and the joiner.
    pub fn split_for(&mut self, joiner: PeerId) -> Result<JoinIntroduction, ZoneError> {
        let zone = self.zone.clone().ok_or_else(|| ZoneError::InvalidSplit {
            dimension: 0,
            reason: format!("peer {} owns no zone", self.id),
        })?;
        let dimension = self.next_split_dimension();
        let (lower, upper) = zone.split(dimension)?;
        let kept = if rand::rng().random_bool(0.5) { Direction::Inferior } else { Direction::Superior };
        let (own, given) = match kept {
            Direction::Inferior => (lower, upper),
            Direction::Superior => (upper, lower),
        };

        let mut joiner_history = self.split_history.clone();
        joiner_history.push(SplitEntry { dimension, direction: kept.opposite() });
        self.split_history.push(SplitEntry { dimension, direction: kept });
        self.zone = Some(own.clone());

        let mut neighbors: Vec<NeighborEntry> =
            self.neighbors.iter().map(|(_, _, entry)| entry.clone()).collect();
        let mut candidates = neighbors.clone();
        candidates.push(NeighborEntry::new(joiner, given.clone()));
        self.refresh_neighbors(&candidates);

        neighbors.push(NeighborEntry::new(self.id, own));
        Ok(JoinIntroduction { zone: given, split_history: joiner_history, neighbors })
    }

    /// Joiner side of a join.
    pub fn welcome(&mut self, introduction: JoinIntroduction) {
        self.zone = Some(introduction.zone);
        self.split_history = introduction.split_history;
        self.neighbors.clear();
        self.refresh_neighbors(&introduction.neighbors);
        self.state = PeerState::Activated;
    }

    /// Replace the zone after a merge or a takeover.
    pub fn assign_zone(&mut self, zone: Zone, split_history: Vec<SplitEntry>) {
        self.zone = Some(zone);
        self.split_history = split_history;
    }

    /// Clear everything; the peer may join again later.
    pub fn deactivate(&mut self) {
        self.zone = None;
        self.neighbors.clear();
        self.split_history.clear();
        self.state = PeerState::NotActivated;
    }

    /// Re-evaluate a set of peers against the current zone: neighbors are
    /// inserted or updated, peers that no longer touch the zone are dropped.
    /// Peers outside `candidates` are left alone.
    pub fn refresh_neighbors(&mut self, candidates: &[NeighborEntry]) {
        let Some(zone) = self.zone.clone() else {
            return;
        };
        for candidate in candidates.iter().filter(|c| c.peer != self.id) {
            match zone.neighbors(&candidate.zone) {
                Some(dimension) => {
                    let direction =
                        zone.abuts(&candidate.zone, dimension).unwrap_or(Direction::Superior);
                    self.neighbors.add(dimension, direction, candidate.clone());
                }
                None => {
                    self.neighbors.remove(candidate.peer);
                }
            }
        }
    }

    pub fn remove_neighbor(&mut self, peer: PeerId) -> bool {
        self.neighbors.remove(peer).is_some()
    }

    /// Neighbors whose union with this zone is again a zone.
    pub fn mergeable_neighbors(&self) -> Vec<&NeighborEntry> {
        let Some(zone) = self.zone.as_ref() else {
            return Vec::new();
        };
        self.neighbors
            .iter()
            .map(|(_, _, entry)| entry)
            .filter(|entry| zone.mergeable(&entry.zone).is_some())
            .collect()
    }

    pub fn mergeable_neighbor(&self) -> Option<&NeighborEntry> {
        self.mergeable_neighbors().into_iter().next()
    }

    /// Split history of a zone absorbing this one through a merge on `dimension`.
    pub fn history_after_merge(history: &[SplitEntry], dimension: usize) -> Vec<SplitEntry> {
        let mut history = history.to_vec();
        if history.last().map_or(false, |entry| entry.dimension == dimension) {
            history.pop();
        }
        history
    }
}
