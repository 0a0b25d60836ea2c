//! Points and constraint sets in the coordinate space.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::encoding::element_value;
use crate::core::{Node, Quadruple};

/// One axis value. The top value is reserved as the exclusive upper bound.
pub type Element = u64;

/// Number of dimensions of the semantic space: graph, subject, predicate, object.
pub const SEMANTIC_DIMENSIONS: usize = 4;

/// Map an RDF term onto one axis.
pub fn semantic_element(node: &Node) -> Element {
    element_value(node).min(Element::MAX - 1)
}

/// A point of the space; a missing element matches any value on its axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate(Vec<Option<Element>>);

impl Coordinate {
    pub fn new(elements: Vec<Option<Element>>) -> Self {
        Self(elements)
    }

    pub fn from_elements(elements: &[Element]) -> Self {
        Self(elements.iter().copied().map(Some).collect())
    }

    /// Projection of a fact on the semantic space. The base graph is used, not
    /// the meta graph.
    pub fn of_quadruple(quadruple: &Quadruple) -> Self {
        Self(quadruple.components().iter().map(|node| Some(semantic_element(node))).collect())
    }

    pub fn element(&self, dimension: usize) -> Option<Element> {
        self.0.get(dimension).copied().flatten()
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|e| e.map_or_else(|| "*".to_string(), |v| format!("{:#x}", v)))
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Closed-open range on one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub lower: Element,
    pub upper: Element,
}

impl Interval {
    pub fn new(lower: Element, upper: Element) -> Self {
        Self { lower, upper }
    }

    /// The interval holding exactly one value.
    pub fn exact(value: Element) -> Self {
        Self { lower: value, upper: value.saturating_add(1) }
    }

    pub fn at_least(value: Element) -> Self {
        Self { lower: value, upper: Element::MAX }
    }
}

/// Per-dimension constraints of an anycast request. A zone satisfies the set
/// when it intersects every constrained interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraints(Vec<Option<Interval>>);

impl Constraints {
    pub fn new(intervals: Vec<Option<Interval>>) -> Self {
        Self(intervals)
    }

    pub fn unconstrained(dimensions: usize) -> Self {
        Self(vec![None; dimensions])
    }

    pub fn interval(&self, dimension: usize) -> Option<&Interval> {
        self.0.get(dimension).and_then(Option::as_ref)
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    /// The point greedy routing heads to while no zone on the path satisfies
    /// the constraints: the lower corner of the constrained region.
    pub fn key(&self) -> Coordinate {
        Coordinate(self.0.iter().map(|i| i.map(|interval| interval.lower)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadruple_projection_uses_base_graph() {
        let q = Quadruple::new(
            Node::iri("http://ex.org/g1"),
            Node::iri("http://ex.org/s"),
            Node::iri("http://ex.org/p"),
            Node::literal("o"),
        );
        let stamped = q.clone().with_publication_time(99);
        assert_eq!(Coordinate::of_quadruple(&q), Coordinate::of_quadruple(&stamped));
        assert_eq!(
            Coordinate::of_quadruple(&q).element(0),
            Some(semantic_element(&Node::literal("g1")))
        );
    }

    #[test]
    fn test_constraints_key() {
        let constraints = Constraints::new(vec![None, Some(Interval::exact(7))]);
        assert_eq!(constraints.key(), Coordinate::new(vec![None, Some(7)]));
        assert_eq!(constraints.interval(0), None);
        assert_eq!(constraints.interval(5), None);
    }
}
