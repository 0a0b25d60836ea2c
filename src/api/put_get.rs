//! Synchronous access to the facts stored on the overlay: add, delete and
//! look up quadruples, answer one-shot SELECT queries, and rebuild the
//! compound event behind a solution.
//!
//! Facts added here are stored without being matched against continuous
//! queries.

use std::collections::HashSet;
use std::sync::Arc;

use crate::api::event_cloud::{Solution, SETTLE_TIMEOUT};
use crate::core::{CompoundEvent, Node, Quadruple};
use crate::error::Result;
use crate::overlay::network::Network;
use crate::querying::oxigraph_adapter::OxigraphDatastore;
use crate::querying::query_processing::{AccessMode, Bindings, QuadStore, QuadruplePattern};

pub struct PutGetProxy {
    network: Arc<Network>,
}

impl PutGetProxy {
    pub fn new(network: Arc<Network>) -> Self {
        Self { network }
    }

    pub fn add(&self, quadruple: Quadruple) -> Result<()> {
        self.network.add(quadruple)?;
        Ok(())
    }

    pub fn add_all(&self, quadruples: impl IntoIterator<Item = Quadruple>) -> Result<()> {
        for quadruple in quadruples {
            self.add(quadruple)?;
        }
        Ok(())
    }

    /// Delete one fact. Returns whether it was stored.
    pub fn delete(&self, quadruple: Quadruple) -> Result<bool> {
        Ok(self.network.delete(quadruple)?.removed > 0)
    }

    /// Delete every fact matching `pattern` and return them.
    pub fn delete_matching(&self, pattern: QuadruplePattern) -> Result<Vec<Quadruple>> {
        let response = self.network.delete_matching(pattern)?;
        tracing::debug!(removed = response.removed, peers = response.peers_reached, "facts deleted");
        Ok(response.quadruples)
    }

    pub fn find(&self, pattern: QuadruplePattern) -> Result<Vec<Quadruple>> {
        Ok(self.network.find(pattern)?.quadruples)
    }

    pub fn contains(&self, quadruple: &Quadruple) -> Result<bool> {
        let pattern = QuadruplePattern::new(
            Some(quadruple.meta_graph()),
            Some(quadruple.subject().clone()),
            Some(quadruple.predicate().clone()),
            Some(quadruple.object().clone()),
        );
        Ok(self.find(pattern)?.iter().any(|fact| fact == quadruple))
    }

    pub fn count(&self, pattern: QuadruplePattern) -> Result<usize> {
        Ok(self.find(pattern)?.len())
    }

    /// Answer a SELECT query over the facts stored so far.
    ///
    /// Each triple pattern is looked up on the overlay; the query then runs
    /// on a local store holding those facts under their base graph.
    pub fn execute_select(&self, query: &str) -> Result<Bindings> {
        let atomic_queries = self.network.decomposer().decompose(query)?;
        let local = OxigraphDatastore::new()?;
        let mut txn = local.begin(AccessMode::Write)?;
        let mut loaded = HashSet::new();
        for atomic_query in &atomic_queries {
            for fact in self.find(QuadruplePattern::from(atomic_query))? {
                let fact = Quadruple::new(
                    fact.graph().clone(),
                    fact.subject().clone(),
                    fact.predicate().clone(),
                    fact.object().clone(),
                );
                if loaded.insert(fact.hash_value()) {
                    txn.add(&fact)?;
                }
            }
        }
        txn.commit()?;
        tracing::debug!(patterns = atomic_queries.len(), facts = loaded.len(), "select facts loaded");
        txn.execute_select(query)
    }

    /// Fetch every fact published under the meta graph of `solution`.
    ///
    /// Facts may still be in flight when the solution arrives, so retrieval
    /// repeats until a round brings nothing new.
    pub fn reconstruct_compound_event(&self, solution: &Solution) -> Result<CompoundEvent> {
        self.reconstruct(&solution.meta_graph)
    }

    pub fn reconstruct(&self, meta_graph: &Node) -> Result<CompoundEvent> {
        let mut facts: Vec<Quadruple> = Vec::new();
        let mut known: Vec<String> = Vec::new();
        loop {
            self.network.settle(SETTLE_TIMEOUT);
            let retrieved = self.network.reconstruct(meta_graph.clone(), known.clone())?.quadruples;
            let mut fresh = 0;
            for fact in retrieved {
                let hash = fact.hash_value();
                if !known.contains(&hash) {
                    known.push(hash);
                    facts.push(fact);
                    fresh += 1;
                }
            }
            if fresh == 0 {
                break;
            }
        }
        tracing::debug!(meta_graph = %meta_graph, facts = facts.len(), "compound event reconstructed");
        CompoundEvent::new(facts)
    }
}
