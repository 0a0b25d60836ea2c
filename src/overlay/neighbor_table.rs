//! Per-peer table of neighbors indexed by dimension and direction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::overlay::zone::{Direction, Zone};
use crate::overlay::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub peer: PeerId,
    pub zone: Zone,
}

impl NeighborEntry {
    pub fn new(peer: PeerId, zone: Zone) -> Self {
        Self { peer, zone }
    }
}

#[derive(Debug, Clone)]
pub struct NeighborTable {
    entries: Vec<[BTreeMap<PeerId, NeighborEntry>; 2]>,
}

impl NeighborTable {
    pub fn new(dimensions: usize) -> Self {
        Self { entries: (0..dimensions).map(|_| [BTreeMap::new(), BTreeMap::new()]).collect() }
    }

    /// Insert or replace the entry for a peer; a peer sits in one slot only.
    pub fn add(&mut self, dimension: usize, direction: Direction, entry: NeighborEntry) {
        self.remove(entry.peer);
        self.entries[dimension][direction.index()].insert(entry.peer, entry);
    }

    pub fn remove(&mut self, peer: PeerId) -> Option<NeighborEntry> {
        self.entries.iter_mut().flat_map(|slots| slots.iter_mut()).find_map(|map| map.remove(&peer))
    }

    pub fn get(&self, dimension: usize, direction: Direction) -> impl Iterator<Item = &NeighborEntry> {
        self.entries[dimension][direction.index()].values()
    }

    pub fn find(&self, peer: PeerId) -> Option<(usize, Direction, &NeighborEntry)> {
        self.iter().find(|(_, _, entry)| entry.peer == peer)
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.find(peer).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Direction, &NeighborEntry)> {
        self.entries.iter().enumerate().flat_map(|(dim, slots)| {
            slots[0]
                .values()
                .map(move |e| (dim, Direction::Inferior, e))
                .chain(slots[1].values().map(move |e| (dim, Direction::Superior, e)))
        })
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.iter().map(|(_, _, entry)| entry.peer).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flat_map(|slots| slots.iter()).map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        for slots in &mut self.entries {
            slots[0].clear();
            slots[1].clear();
        }
    }
}
