//! Transactional quad-store interface consumed by peers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::encoding::parse_meta_graph;
use crate::core::{Node, Quadruple};
use crate::error::Result;
use crate::overlay::coordinate::{semantic_element, Constraints, Interval};
use crate::parsing::continuous_query::AtomicQuery;

/// Graphs reserved for peer bookkeeping (subscriptions, partial solutions).
pub const SYSTEM_GRAPH_PREFIX: &str = "urn:eventcloud:";

pub fn is_system_graph(graph: &Node) -> bool {
    graph.as_str().starts_with(SYSTEM_GRAPH_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    Write,
}

/// One row of a SELECT result.
pub type Bindings = Vec<HashMap<String, Node>>;

/// A quadruple pattern; `None` matches anything. The graph is compared as a
/// prefix of the stored (meta) graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuadruplePattern {
    pub graph: Option<Node>,
    pub subject: Option<Node>,
    pub predicate: Option<Node>,
    pub object: Option<Node>,
    /// Also return quadruples of system graphs
    pub include_system: bool,
}

impl QuadruplePattern {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new(
        graph: Option<Node>,
        subject: Option<Node>,
        predicate: Option<Node>,
        object: Option<Node>,
    ) -> Self {
        Self { graph, subject, predicate, object, include_system: false }
    }

    /// Pattern over bookkeeping quadruples of one system graph.
    pub fn system(graph: Node) -> Self {
        Self { graph: Some(graph), include_system: true, ..Self::default() }
    }

    pub fn with_subject(mut self, subject: Node) -> Self {
        self.subject = Some(subject);
        self
    }

    /// Pattern whose only constant is the graph.
    pub fn graph(graph: Node) -> Self {
        Self { graph: Some(graph), ..Self::default() }
    }

    /// Anycast constraints reaching every zone that may hold a match. A meta
    /// graph constrains the axis of its base graph.
    pub fn constraints(&self) -> Constraints {
        let graph = self.graph.as_ref().map(|graph| match parse_meta_graph(graph.as_str()) {
            Some((base, _, _)) => Node::Iri(base),
            None => graph.clone(),
        });
        Constraints::new(
            [graph.as_ref(), self.subject.as_ref(), self.predicate.as_ref(), self.object.as_ref()]
                .into_iter()
                .map(|node| node.map(|node| Interval::exact(semantic_element(node))))
                .collect(),
        )
    }

    pub fn matches(&self, quadruple: &Quadruple) -> bool {
        if !self.include_system && is_system_graph(quadruple.graph()) {
            return false;
        }
        let graph_ok = self
            .graph
            .as_ref()
            .map_or(true, |g| quadruple.meta_graph().as_str().starts_with(g.as_str()));
        graph_ok
            && self.subject.as_ref().map_or(true, |s| s == quadruple.subject())
            && self.predicate.as_ref().map_or(true, |p| p == quadruple.predicate())
            && self.object.as_ref().map_or(true, |o| o == quadruple.object())
    }
}

/// Store pattern of the facts an atomic query may match.
impl From<&AtomicQuery> for QuadruplePattern {
    fn from(query: &AtomicQuery) -> Self {
        let [graph, subject, predicate, object] =
            query.components().map(|term| term.as_constant().cloned());
        Self::new(graph, subject, predicate, object)
    }
}

/// Entry point of a quad-store: hands out short-lived transactions.
pub trait QuadStore: Send + Sync {
    fn begin(&self, mode: AccessMode) -> Result<Box<dyn Transaction + '_>>;
}

/// A store transaction. Writes become visible on `commit`; dropping an
/// uncommitted transaction discards them.
pub trait Transaction {
    fn mode(&self) -> AccessMode;

    /// Committed quadruples matching `pattern`.
    fn find(&self, pattern: &QuadruplePattern) -> Result<Vec<Quadruple>>;

    fn add(&mut self, quadruple: &Quadruple) -> Result<()>;

    fn delete(&mut self, quadruple: &Quadruple) -> Result<()>;

    /// Run a SPARQL SELECT against the committed state.
    fn execute_select(&self, query: &str) -> Result<Bindings>;

    fn commit(&mut self) -> Result<()>;

    fn abort(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::continuous_query::TermPattern;

    #[test]
    fn test_pattern_skips_system_graphs_unless_asked() {
        let record = Quadruple::new(
            Node::iri("urn:eventcloud:subscriptions"),
            Node::iri("urn:eventcloud:subscription:1"),
            Node::iri("urn:eventcloud:originalId"),
            Node::iri("urn:eventcloud:subscription:1"),
        );
        assert!(!QuadruplePattern::any().matches(&record));
        assert!(QuadruplePattern::system(Node::iri("urn:eventcloud:subscriptions")).matches(&record));
    }

    #[test]
    fn test_meta_graph_constrains_the_base_graph_axis() {
        let fact = Quadruple::new(
            Node::iri("http://ex.org/g"),
            Node::iri("http://ex.org/s"),
            Node::iri("http://ex.org/p"),
            Node::literal("o"),
        )
        .with_publication_time(7);

        let by_meta = QuadruplePattern::graph(fact.meta_graph()).constraints();
        let by_base = QuadruplePattern::graph(Node::iri("http://ex.org/g")).constraints();
        assert_eq!(by_meta, by_base);
        assert_eq!(by_meta.interval(0), Some(&Interval::exact(semantic_element(fact.graph()))));
        assert!(by_meta.interval(1).is_none());
        assert!(QuadruplePattern::graph(fact.meta_graph()).matches(&fact));
    }

    #[test]
    fn test_pattern_keeps_constants_only() {
        let query = AtomicQuery::new(
            TermPattern::Constant(Node::iri("http://ex.org/g")),
            TermPattern::variable("s"),
            TermPattern::Constant(Node::iri("http://ex.org/p")),
            TermPattern::variable("o"),
        );
        let pattern = QuadruplePattern::from(&query);
        assert_eq!(pattern.graph, Some(Node::iri("http://ex.org/g")));
        assert_eq!(pattern.subject, None);
        assert_eq!(pattern.predicate, Some(Node::iri("http://ex.org/p")));
        assert_eq!(pattern.object, None);
        assert!(!pattern.include_system);
    }
}
