//! Core data structures and types for the EventCloud publish/subscribe engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// An RDF term as handled by the engine: an IRI or the lexical form of a literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Node {
    Iri(String),
    Literal(String),
}

impl Node {
    pub fn iri(value: impl Into<String>) -> Self {
        Node::Iri(value.into())
    }

    pub fn literal(value: impl Into<String>) -> Self {
        Node::Literal(value.into())
    }

    /// The raw value, without angle brackets or quotes.
    pub fn as_str(&self) -> &str {
        match self {
            Node::Iri(value) | Node::Literal(value) => value,
        }
    }

    pub fn is_iri(&self) -> bool {
        matches!(self, Node::Iri(_))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Iri(value) => write!(f, "<{}>", value),
            Node::Literal(value) => {
                write!(f, "\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
            }
        }
    }
}

/// A published fact: (graph, subject, predicate, object) plus its provenance.
///
/// The publication time and source are folded into the meta graph when the
/// quadruple is stored, so that a fact read back from a peer's store still
/// knows when and by whom it was published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Quadruple {
    graph: Node,
    subject: Node,
    predicate: Node,
    object: Node,
    publication_time: Option<u64>,
    publication_source: Option<String>,
}

impl Quadruple {
    pub fn new(graph: Node, subject: Node, predicate: Node, object: Node) -> Self {
        Self {
            graph,
            subject,
            predicate,
            object,
            publication_time: None,
            publication_source: None,
        }
    }

    pub fn with_publication_time(mut self, time: u64) -> Self {
        self.publication_time = Some(time);
        self
    }

    pub fn with_publication_source(mut self, source: impl Into<String>) -> Self {
        self.publication_source = Some(source.into());
        self
    }

    /// Sets the publication time to now unless one is already present.
    pub fn stamp(&mut self) {
        if self.publication_time.is_none() {
            self.publication_time = Some(now_millis());
        }
    }

    pub fn graph(&self) -> &Node {
        &self.graph
    }

    pub fn subject(&self) -> &Node {
        &self.subject
    }

    pub fn predicate(&self) -> &Node {
        &self.predicate
    }

    pub fn object(&self) -> &Node {
        &self.object
    }

    pub fn publication_time(&self) -> Option<u64> {
        self.publication_time
    }

    pub fn publication_source(&self) -> Option<&str> {
        self.publication_source.as_deref()
    }

    /// Components in coordinate order: graph, subject, predicate, object.
    pub fn components(&self) -> [&Node; 4] {
        [&self.graph, &self.subject, &self.predicate, &self.object]
    }

    /// The graph identifier under which this fact is stored.
    ///
    /// Quadruples without a publication time (system records) keep their graph.
    pub fn meta_graph(&self) -> Node {
        match self.publication_time {
            Some(time) => Node::Iri(encoding::meta_graph_value(
                self.graph.as_str(),
                time,
                self.publication_source.as_deref(),
            )),
            None => self.graph.clone(),
        }
    }

    /// Rebuilds a quadruple from a stored graph, recovering provenance when the
    /// graph is a meta graph.
    pub fn from_stored(graph: Node, subject: Node, predicate: Node, object: Node) -> Self {
        match encoding::parse_meta_graph(graph.as_str()) {
            Some((base, time, source)) => Self {
                graph: Node::Iri(base),
                subject,
                predicate,
                object,
                publication_time: Some(time),
                publication_source: source,
            },
            None => Self::new(graph, subject, predicate, object),
        }
    }

    /// SHA-256 over the meta graph and components, hex encoded.
    pub fn hash_value(&self) -> String {
        encoding::hash_quadruple(self)
    }
}

impl fmt::Display for Quadruple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {} .", self.subject, self.predicate, self.object, self.meta_graph())
    }
}

/// A set of quadruples published as one unit. All quadruples share one graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Quadruple>", into = "Vec<Quadruple>")]
pub struct CompoundEvent {
    quadruples: Vec<Quadruple>,
}

impl CompoundEvent {
    pub fn new(quadruples: Vec<Quadruple>) -> Result<Self> {
        let first = quadruples
            .first()
            .ok_or_else(|| Error::InvalidCompoundEvent("no quadruple".to_string()))?;
        if let Some(other) = quadruples.iter().find(|q| q.graph() != first.graph()) {
            return Err(Error::InvalidCompoundEvent(format!(
                "graph {} differs from {}",
                other.graph(),
                first.graph()
            )));
        }
        Ok(Self { quadruples })
    }

    pub fn graph(&self) -> &Node {
        // non-empty by construction
        self.quadruples[0].graph()
    }

    pub fn quadruples(&self) -> &[Quadruple] {
        &self.quadruples
    }

    pub fn len(&self) -> usize {
        self.quadruples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quadruples.is_empty()
    }

    /// Stamps every quadruple with the same publication time and source.
    pub fn stamp(&mut self, time: u64, source: Option<&str>) {
        for quadruple in &mut self.quadruples {
            quadruple.publication_time = Some(time);
            if let Some(source) = source {
                quadruple.publication_source = Some(source.to_string());
            }
        }
    }

    pub fn meta_graph(&self) -> Node {
        self.quadruples[0].meta_graph()
    }
}

impl TryFrom<Vec<Quadruple>> for CompoundEvent {
    type Error = Error;

    fn try_from(quadruples: Vec<Quadruple>) -> Result<Self> {
        Self::new(quadruples)
    }
}

impl From<CompoundEvent> for Vec<Quadruple> {
    fn from(event: CompoundEvent) -> Self {
        event.quadruples
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

pub mod encoding;
