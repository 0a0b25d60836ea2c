//! Oxigraph-backed quad-store used by every peer.
//!
//! Writes are buffered in the transaction and applied on commit inside one
//! oxigraph transaction: either every staged write lands or none does.
//! Reads always see the last committed state.
//!
//! # Example
//!
//! ```ignore
//! use eventcloud::querying::oxigraph_adapter::OxigraphDatastore;
//! use eventcloud::querying::query_processing::{AccessMode, QuadStore, QuadruplePattern};
//!
//! let datastore = OxigraphDatastore::new()?;
//! let mut txn = datastore.begin(AccessMode::Write)?;
//! txn.add(&quadruple)?;
//! txn.commit()?;
//!
//! let txn = datastore.begin(AccessMode::ReadOnly)?;
//! let facts = txn.find(&QuadruplePattern::any())?;
//! ```

use crate::core::{Node, Quadruple};
use crate::error::Result;
use crate::querying::query_processing::{
    AccessMode, Bindings, QuadStore, QuadruplePattern, Transaction,
};
use oxigraph::model::{GraphName, Literal, NamedNode, Quad, Term};
use oxigraph::sparql::{QueryResults, SparqlEvaluator};
use oxigraph::store::Store;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug)]
pub struct OxigraphError(String);

impl OxigraphError {
    pub fn new(message: impl Into<String>) -> Self {
        OxigraphError(message.into())
    }
}

impl fmt::Display for OxigraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oxigraph error: {}", self.0)
    }
}

impl std::error::Error for OxigraphError {}

impl From<oxigraph::store::StorageError> for OxigraphError {
    fn from(err: oxigraph::store::StorageError) -> Self {
        OxigraphError(err.to_string())
    }
}

impl From<oxigraph::sparql::QueryEvaluationError> for OxigraphError {
    fn from(err: oxigraph::sparql::QueryEvaluationError) -> Self {
        OxigraphError(err.to_string())
    }
}

pub struct OxigraphDatastore {
    store: Store,
}

impl OxigraphDatastore {
    /// In-memory store.
    pub fn new() -> std::result::Result<Self, OxigraphError> {
        Ok(Self { store: Store::new()? })
    }

    /// Number of stored quads, system records included.
    pub fn len(&self) -> std::result::Result<usize, OxigraphError> {
        Ok(self.store.len()?)
    }

    pub fn is_empty(&self) -> std::result::Result<bool, OxigraphError> {
        Ok(self.len()? == 0)
    }
}

impl QuadStore for OxigraphDatastore {
    fn begin(&self, mode: AccessMode) -> Result<Box<dyn Transaction + '_>> {
        Ok(Box::new(OxigraphTransaction {
            datastore: self,
            mode,
            added: Vec::new(),
            removed: Vec::new(),
        }))
    }
}

pub struct OxigraphTransaction<'a> {
    datastore: &'a OxigraphDatastore,
    mode: AccessMode,
    added: Vec<Quadruple>,
    removed: Vec<Quadruple>,
}

impl OxigraphTransaction<'_> {
    fn ensure_writable(&self) -> std::result::Result<(), OxigraphError> {
        match self.mode {
            AccessMode::Write => Ok(()),
            AccessMode::ReadOnly => Err(OxigraphError::new("write on a read-only transaction")),
        }
    }
}

impl Transaction for OxigraphTransaction<'_> {
    fn mode(&self) -> AccessMode {
        self.mode
    }

    fn find(&self, pattern: &QuadruplePattern) -> Result<Vec<Quadruple>> {
        // stored subjects and predicates are always IRIs
        let (Ok(subject), Ok(predicate)) = (
            pattern.subject.as_ref().map(|s| iri_of(s, "subject")).transpose(),
            pattern.predicate.as_ref().map(|p| iri_of(p, "predicate")).transpose(),
        ) else {
            return Ok(Vec::new());
        };
        let object = pattern.object.as_ref().map(to_term);

        // graphs are matched by prefix, so they are filtered here
        let mut matches = Vec::new();
        for quad in self.datastore.store.quads_for_pattern(
            subject.as_ref().map(|s| s.as_ref().into()),
            predicate.as_ref().map(NamedNode::as_ref),
            object.as_ref().map(Term::as_ref),
            None,
        ) {
            let quad = quad.map_err(OxigraphError::from)?;
            let quadruple = from_quad(&quad);
            if pattern.matches(&quadruple) {
                matches.push(quadruple);
            }
        }
        Ok(matches)
    }

    fn add(&mut self, quadruple: &Quadruple) -> Result<()> {
        self.ensure_writable()?;
        self.added.push(quadruple.clone());
        Ok(())
    }

    fn delete(&mut self, quadruple: &Quadruple) -> Result<()> {
        self.ensure_writable()?;
        self.removed.push(quadruple.clone());
        Ok(())
    }

    fn execute_select(&self, query: &str) -> Result<Bindings> {
        let evaluator = SparqlEvaluator::new();
        let parsed_query =
            evaluator.parse_query(query).map_err(|e| OxigraphError(e.to_string()))?;
        let results =
            parsed_query.on_store(&self.datastore.store).execute().map_err(OxigraphError::from)?;

        let mut bindings_list = Vec::new();
        if let QueryResults::Solutions(solutions) = results {
            for solution in solutions {
                let solution = solution.map_err(OxigraphError::from)?;
                let mut binding = HashMap::new();
                for (var, term) in solution.iter() {
                    binding.insert(var.as_str().to_string(), term_to_node(term));
                }
                bindings_list.push(binding);
            }
        }
        Ok(bindings_list)
    }

    fn commit(&mut self) -> Result<()> {
        if self.added.is_empty() && self.removed.is_empty() {
            return Ok(());
        }
        let removed = std::mem::take(&mut self.removed);
        let added = std::mem::take(&mut self.added);
        let mut transaction =
            self.datastore.store.start_transaction().map_err(OxigraphError::from)?;
        // an early return drops the oxigraph transaction, which rolls it back
        for quadruple in &removed {
            let quad = to_quad(quadruple)?;
            transaction.remove(quad.as_ref());
        }
        for quadruple in &added {
            let quad = to_quad(quadruple)?;
            transaction.insert(quad.as_ref());
        }
        transaction.commit().map_err(OxigraphError::from)?;
        Ok(())
    }

    fn abort(&mut self) {
        self.added.clear();
        self.removed.clear();
    }
}

impl Drop for OxigraphTransaction<'_> {
    fn drop(&mut self) {
        let pending = self.added.len() + self.removed.len();
        if pending > 0 {
            tracing::trace!(pending, "transaction ended without commit, writes discarded");
        }
    }
}

fn to_quad(quadruple: &Quadruple) -> std::result::Result<Quad, OxigraphError> {
    let subject = iri_of(quadruple.subject(), "subject")?;
    let predicate = iri_of(quadruple.predicate(), "predicate")?;
    let object = to_term(quadruple.object());
    let graph = GraphName::NamedNode(iri_of(&quadruple.meta_graph(), "graph")?);
    Ok(Quad::new(subject, predicate, object, graph))
}

fn to_term(node: &Node) -> Term {
    match node {
        Node::Iri(value) => Term::NamedNode(NamedNode::new_unchecked(value.as_str())),
        Node::Literal(value) => Term::Literal(Literal::new_simple_literal(value.as_str())),
    }
}

fn iri_of(node: &Node, position: &str) -> std::result::Result<NamedNode, OxigraphError> {
    match node {
        Node::Iri(value) => Ok(NamedNode::new_unchecked(value.as_str())),
        Node::Literal(value) => {
            Err(OxigraphError(format!("literal \"{}\" cannot be used as {}", value, position)))
        }
    }
}

fn from_quad(quad: &Quad) -> Quadruple {
    let graph = match &quad.graph_name {
        GraphName::NamedNode(node) => Node::iri(node.as_str()),
        other => Node::iri(other.to_string()),
    };
    let subject = quad.subject.to_string();
    let subject = subject.strip_prefix('<').and_then(|s| s.strip_suffix('>')).unwrap_or(&subject);
    Quadruple::from_stored(
        graph,
        Node::iri(subject),
        Node::iri(quad.predicate.as_str()),
        term_to_node(&quad.object),
    )
}

fn term_to_node(term: &Term) -> Node {
    match term {
        Term::NamedNode(node) => Node::iri(node.as_str()),
        Term::Literal(literal) => Node::literal(literal.value()),
        other => Node::literal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iri(value: &str) -> Node {
        Node::iri(format!("http://ex.org/{}", value))
    }

    fn fact(object: Node) -> Quadruple {
        Quadruple::new(iri("g1"), iri("s"), iri("p"), object)
            .with_publication_time(42)
            .with_publication_source("alice")
    }

    #[test]
    fn test_writes_visible_after_commit_only() {
        let datastore = OxigraphDatastore::new().unwrap();
        let mut txn = datastore.begin(AccessMode::Write).unwrap();
        txn.add(&fact(Node::literal("v"))).unwrap();
        assert!(txn.find(&QuadruplePattern::any()).unwrap().is_empty());
        txn.commit().unwrap();
        drop(txn);

        let read = datastore.begin(AccessMode::ReadOnly).unwrap();
        let found = read.find(&QuadruplePattern::any()).unwrap();
        assert_eq!(found, vec![fact(Node::literal("v"))]);
    }

    #[test]
    fn test_dropped_transaction_discards_writes() {
        let datastore = OxigraphDatastore::new().unwrap();
        {
            let mut txn = datastore.begin(AccessMode::Write).unwrap();
            txn.add(&fact(iri("o"))).unwrap();
        }
        assert!(datastore.is_empty().unwrap());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let datastore = OxigraphDatastore::new().unwrap();
        let mut txn = datastore.begin(AccessMode::ReadOnly).unwrap();
        assert!(txn.add(&fact(iri("o"))).is_err());
    }

    #[test]
    fn test_graph_pattern_is_a_prefix() {
        let datastore = OxigraphDatastore::new().unwrap();
        let mut txn = datastore.begin(AccessMode::Write).unwrap();
        txn.add(&fact(iri("o"))).unwrap();
        txn.commit().unwrap();

        let pattern = QuadruplePattern::new(Some(iri("g1")), None, Some(iri("p")), None);
        assert_eq!(txn.find(&pattern).unwrap().len(), 1);
        let other = QuadruplePattern::new(Some(iri("g2")), None, None, None);
        assert!(txn.find(&other).unwrap().is_empty());
    }

    #[test]
    fn test_failed_commit_applies_nothing() {
        let datastore = OxigraphDatastore::new().unwrap();
        let mut txn = datastore.begin(AccessMode::Write).unwrap();
        txn.add(&fact(iri("o"))).unwrap();
        txn.commit().unwrap();

        txn.delete(&fact(iri("o"))).unwrap();
        txn.add(&fact(iri("o2"))).unwrap();
        // a literal subject cannot be stored
        txn.add(&Quadruple::new(iri("g1"), Node::literal("s"), iri("p"), iri("o3"))).unwrap();
        assert!(txn.commit().is_err());

        let found = txn.find(&QuadruplePattern::any()).unwrap();
        assert_eq!(found, vec![fact(iri("o"))]);
        assert_eq!(datastore.len().unwrap(), 1);
    }

    #[test]
    fn test_find_by_subject_and_object() {
        let datastore = OxigraphDatastore::new().unwrap();
        let mut txn = datastore.begin(AccessMode::Write).unwrap();
        txn.add(&fact(iri("o1"))).unwrap();
        txn.add(&fact(Node::literal("o1"))).unwrap();
        txn.add(&Quadruple::new(iri("g1"), iri("t"), iri("p"), iri("o1"))).unwrap();
        txn.commit().unwrap();

        let by_subject = QuadruplePattern::new(None, Some(iri("s")), None, None);
        assert_eq!(txn.find(&by_subject).unwrap().len(), 2);

        let by_object = QuadruplePattern::new(None, None, None, Some(iri("o1")));
        assert_eq!(txn.find(&by_object).unwrap().len(), 2);

        let literal = QuadruplePattern::new(None, Some(iri("s")), None, Some(Node::literal("o1")));
        assert_eq!(txn.find(&literal).unwrap(), vec![fact(Node::literal("o1"))]);

        let literal_subject = QuadruplePattern::new(None, Some(Node::literal("s")), None, None);
        assert!(txn.find(&literal_subject).unwrap().is_empty());
    }

    #[test]
    fn test_delete_and_select() {
        let datastore = OxigraphDatastore::new().unwrap();
        let mut txn = datastore.begin(AccessMode::Write).unwrap();
        txn.add(&fact(iri("o1"))).unwrap();
        txn.add(&fact(iri("o2"))).unwrap();
        txn.commit().unwrap();

        let rows = txn
            .execute_select("SELECT ?o WHERE { GRAPH ?g { <http://ex.org/s> ?p ?o } }")
            .unwrap();
        assert_eq!(rows.len(), 2);

        txn.delete(&fact(iri("o1"))).unwrap();
        txn.commit().unwrap();
        let rows = txn
            .execute_select("SELECT ?o WHERE { GRAPH ?g { <http://ex.org/s> ?p ?o } }")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("o"), Some(&iri("o2")));
    }
}
