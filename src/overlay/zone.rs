//! Axis-aligned zones of the coordinate space.
//!
//! A zone is closed on its lower bound and open on its upper bound in every
//! dimension. The whole space of `d` dimensions is `[0, u64::MAX)^d`; peers
//! partition it by splitting zones on join and merging them on leave.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

use crate::overlay::coordinate::{Constraints, Coordinate, Element, Interval};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZoneError {
    #[error("expected {expected} dimensions, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("empty range on dimension {0}")]
    EmptyRange(usize),
    #[error("cannot split dimension {dimension}: {reason}")]
    InvalidSplit { dimension: usize, reason: String },
    #[error("zones {0} and {1} cannot be merged")]
    NotMergeable(String, String),
}

/// Side of a zone along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Inferior,
    Superior,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::Inferior => 0,
            Direction::Superior => 1,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Inferior => Direction::Superior,
            Direction::Superior => Direction::Inferior,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Zone {
    lower: Vec<Element>,
    upper: Vec<Element>,
}

impl Zone {
    /// The entire coordinate space.
    pub fn full(dimensions: usize) -> Self {
        Self { lower: vec![0; dimensions], upper: vec![Element::MAX; dimensions] }
    }

    pub fn new(lower: Vec<Element>, upper: Vec<Element>) -> Result<Self, ZoneError> {
        if lower.len() != upper.len() {
            return Err(ZoneError::DimensionMismatch { expected: lower.len(), found: upper.len() });
        }
        if let Some(dim) = (0..lower.len()).find(|&d| lower[d] >= upper[d]) {
            return Err(ZoneError::EmptyRange(dim));
        }
        Ok(Self { lower, upper })
    }

    pub fn dimensions(&self) -> usize {
        self.lower.len()
    }

    pub fn lower(&self, dimension: usize) -> Element {
        self.lower[dimension]
    }

    pub fn upper(&self, dimension: usize) -> Element {
        self.upper[dimension]
    }

    /// Position of `element` relative to this zone on one axis: `Less` when
    /// below, `Greater` when above. A missing element always matches.
    pub fn contains_element(&self, dimension: usize, element: Option<Element>) -> Ordering {
        match element {
            None => Ordering::Equal,
            Some(value) if value < self.lower[dimension] => Ordering::Less,
            Some(value) if value >= self.upper[dimension] => Ordering::Greater,
            Some(_) => Ordering::Equal,
        }
    }

    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        (0..self.dimensions())
            .all(|d| self.contains_element(d, coordinate.element(d)) == Ordering::Equal)
    }

    /// Whether the interval on `dimension` intersects this zone's range.
    pub fn validates(&self, dimension: usize, interval: &Interval) -> bool {
        self.lower[dimension] < interval.upper && interval.lower < self.upper[dimension]
    }

    /// Every constrained dimension is validated.
    pub fn satisfies(&self, constraints: &Constraints) -> bool {
        (0..self.dimensions())
            .all(|d| constraints.interval(d).map_or(true, |interval| self.validates(d, interval)))
    }

    /// Split at the middle of the range on `dimension`, returning the lower and
    /// upper halves.
    pub fn split(&self, dimension: usize) -> Result<(Zone, Zone), ZoneError> {
        let lo = self.lower[dimension];
        let hi = self.upper[dimension];
        self.split_at(dimension, lo + (hi - lo) / 2)
    }

    pub fn split_at(&self, dimension: usize, at: Element) -> Result<(Zone, Zone), ZoneError> {
        if dimension >= self.dimensions() {
            return Err(ZoneError::InvalidSplit {
                dimension,
                reason: format!("zone has {} dimensions", self.dimensions()),
            });
        }
        if at <= self.lower[dimension] || at >= self.upper[dimension] {
            return Err(ZoneError::InvalidSplit {
                dimension,
                reason: format!(
                    "{} is not strictly inside [{}, {})",
                    at, self.lower[dimension], self.upper[dimension]
                ),
            });
        }

        let mut lower_half = self.clone();
        lower_half.upper[dimension] = at;
        let mut upper_half = self.clone();
        upper_half.lower[dimension] = at;
        Ok((lower_half, upper_half))
    }

    /// Ranges on `dimension` intersect.
    pub fn overlaps(&self, other: &Zone, dimension: usize) -> bool {
        self.lower[dimension] < other.upper[dimension] && other.lower[dimension] < self.upper[dimension]
    }

    /// Side on which `other` touches this zone along `dimension`, if it does.
    pub fn abuts(&self, other: &Zone, dimension: usize) -> Option<Direction> {
        if self.upper[dimension] == other.lower[dimension] {
            Some(Direction::Superior)
        } else if self.lower[dimension] == other.upper[dimension] {
            Some(Direction::Inferior)
        } else {
            None
        }
    }

    /// The dimension on which two zones neighbor, if they do: they overlap on
    /// every other dimension and abut on this one.
    pub fn neighbors(&self, other: &Zone) -> Option<usize> {
        if self.dimensions() != other.dimensions() {
            return None;
        }
        let mut abutting = None;
        for dim in 0..self.dimensions() {
            if self.overlaps(other, dim) {
                continue;
            }
            if abutting.is_some() || self.abuts(other, dim).is_none() {
                return None;
            }
            abutting = Some(dim);
        }
        abutting
    }

    /// The dimension along which the union with `other` is again a zone.
    pub fn mergeable(&self, other: &Zone) -> Option<usize> {
        let dim = self.neighbors(other)?;
        (0..self.dimensions())
            .filter(|&d| d != dim)
            .all(|d| self.lower[d] == other.lower[d] && self.upper[d] == other.upper[d])
            .then_some(dim)
    }

    pub fn merge(&self, other: &Zone) -> Result<Zone, ZoneError> {
        let dim = self
            .mergeable(other)
            .ok_or_else(|| ZoneError::NotMergeable(self.to_string(), other.to_string()))?;
        let mut merged = self.clone();
        merged.lower[dim] = self.lower[dim].min(other.lower[dim]);
        merged.upper[dim] = self.upper[dim].max(other.upper[dim]);
        Ok(merged)
    }

    /// Intersection is non-empty.
    pub fn intersects(&self, other: &Zone) -> bool {
        (0..self.dimensions()).all(|d| self.overlaps(other, d))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges: Vec<String> = (0..self.dimensions())
            .map(|d| format!("[{:#x}, {:#x})", self.lower[d], self.upper[d]))
            .collect();
        write!(f, "{}", ranges.join(" x "))
    }
}
