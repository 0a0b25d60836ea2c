//! Content-addressable overlay
//!
//! The overlay partitions a `d`-dimensional space into zones, one per
//! activated peer. Requests are routed greedily from zone to zone:
//!
//! - **Unicast** reaches the single peer whose zone contains a coordinate
//! - **Anycast** reaches every peer whose zone satisfies a constraint set
//!
//! Peers and the in-process [`network::Network`] that connects them live here
//! too; membership (join and leave) keeps the partition invariant.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod can_overlay;
pub mod coordinate;
pub mod messages;
pub mod neighbor_table;
pub mod network;
pub mod peer;
pub mod router;
pub mod zone;

pub use coordinate::{Constraints, Coordinate, Element, Interval};
pub use zone::{Direction, Zone};

/// Identifier of a peer within its network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

