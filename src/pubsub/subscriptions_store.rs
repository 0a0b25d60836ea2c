//! Subscriptions indexed on a peer.
//!
//! The in-memory index is what matching reads. Every indexed subscription is
//! also written to the peer's quad-store under [`SUBSCRIPTIONS_GRAPH`] so that
//! unsubscribe can find a whole chain with one SELECT.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::core::encoding::{from_json, to_json};
use crate::core::{Node, Quadruple};
use crate::error::Result;
use crate::pubsub::matching::Binding;
use crate::pubsub::subscription::{Subscription, SubscriptionId};
use crate::querying::query_processing::{QuadruplePattern, Transaction};

pub const SUBSCRIPTIONS_GRAPH: &str = "urn:eventcloud:subscriptions";
pub const ORIGINAL_ID_PREDICATE: &str = "urn:eventcloud:originalId";
pub const SERIALIZED_VALUE_PREDICATE: &str = "urn:eventcloud:serializedValue";

/// Prefix of the graphs holding the facts matched by rewritten subscriptions.
pub const STUB_GRAPH_PREFIX: &str = "urn:eventcloud:stub:";
pub const MATCHED_QUADRUPLE_PREDICATE: &str = "urn:eventcloud:matchedQuadruple";

pub fn stub_graph(quadruple_hash: &str) -> Node {
    Node::iri(format!("{}{}", STUB_GRAPH_PREFIX, quadruple_hash))
}

/// What a peer keeps after rewriting a subscription: the fact it matched and
/// the values that fact gave to the result variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StubPart {
    pub fact: Quadruple,
    pub binding: Binding,
}

/// Record of the part left by `subscription_id` for its matched fact.
pub fn stub_record(subscription_id: SubscriptionId, part: &StubPart) -> Result<Quadruple> {
    Ok(Quadruple::new(
        stub_graph(&part.fact.hash_value()),
        Node::iri(subscription_id.iri()),
        Node::iri(MATCHED_QUADRUPLE_PREDICATE),
        Node::literal(to_json(part)?),
    ))
}

/// The part kept for this pair, if any.
pub fn find_stub_part(
    txn: &(dyn Transaction + '_),
    subscription_id: SubscriptionId,
    quadruple_hash: &str,
) -> Result<Option<StubPart>> {
    let pattern = QuadruplePattern::system(stub_graph(quadruple_hash))
        .with_subject(Node::iri(subscription_id.iri()));
    match txn.find(&pattern)?.first() {
        Some(record) => Ok(Some(from_json(record.object().as_str())?)),
        None => Ok(None),
    }
}

#[derive(Default)]
pub struct SubscriptionsStore {
    index: RwLock<HashMap<SubscriptionId, Subscription>>,
}

impl SubscriptionsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quads persisting `subscription`.
    pub fn records(subscription: &Subscription) -> Result<Vec<Quadruple>> {
        let graph = Node::iri(SUBSCRIPTIONS_GRAPH);
        let subject = Node::iri(subscription.id().iri());
        Ok(vec![
            Quadruple::new(
                graph.clone(),
                subject.clone(),
                Node::iri(ORIGINAL_ID_PREDICATE),
                Node::iri(subscription.original_id().iri()),
            ),
            Quadruple::new(
                graph,
                subject,
                Node::iri(SERIALIZED_VALUE_PREDICATE),
                Node::literal(to_json(subscription)?),
            ),
        ])
    }

    pub fn cache(&self, subscription: Subscription) {
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscription.id(), subscription);
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        self.index.read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.index.read().unwrap_or_else(PoisonError::into_inner).contains_key(&id)
    }

    /// Snapshot ordered by id.
    pub fn all(&self) -> Vec<Subscription> {
        let mut all: Vec<Subscription> =
            self.index.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        all.sort_by_key(Subscription::id);
        all
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn uncache(&self, id: SubscriptionId) -> Option<Subscription> {
        self.index.write().unwrap_or_else(PoisonError::into_inner).remove(&id)
    }

    /// Ids of the stored subscriptions derived from `original_id`, the original
    /// itself included.
    pub fn find_by_original(
        txn: &(dyn Transaction + '_),
        original_id: SubscriptionId,
    ) -> Result<Vec<SubscriptionId>> {
        let query = format!(
            "SELECT ?sub WHERE {{ GRAPH <{}> {{ ?sub <{}> <{}> }} }}",
            SUBSCRIPTIONS_GRAPH,
            ORIGINAL_ID_PREDICATE,
            original_id.iri()
        );
        let mut ids: Vec<SubscriptionId> = txn
            .execute_select(&query)?
            .iter()
            .filter_map(|row| row.get("sub"))
            .filter_map(|node| SubscriptionId::from_iri(node.as_str()))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Delete the persisted records of `id` in `txn` and drop it from the
    /// index. Stub records are kept. Returns whether anything was removed.
    pub fn forget(&self, txn: &mut (dyn Transaction + '_), id: SubscriptionId) -> Result<bool> {
        let records = txn.find(
            &QuadruplePattern::system(Node::iri(SUBSCRIPTIONS_GRAPH))
                .with_subject(Node::iri(id.iri())),
        )?;
        for record in &records {
            txn.delete(record)?;
        }
        let cached = self.uncache(id).is_some();
        Ok(cached || !records.is_empty())
    }

    /// Like [`forget`](Self::forget), stub records included.
    pub fn remove(&self, txn: &mut (dyn Transaction + '_), id: SubscriptionId) -> Result<bool> {
        let stubs = txn.find(
            &QuadruplePattern::system(Node::iri(STUB_GRAPH_PREFIX)).with_subject(Node::iri(id.iri())),
        )?;
        for record in &stubs {
            txn.delete(record)?;
        }
        Ok(self.forget(txn, id)? || !stubs.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::sparql_decomposer::SparqlDecomposer;
    use crate::pubsub::subscription::NotificationType;
    use crate::querying::oxigraph_adapter::OxigraphDatastore;
    use crate::querying::query_processing::{AccessMode, QuadStore};

    fn subscription() -> Subscription {
        let decomposer = SparqlDecomposer::new().unwrap();
        Subscription::new(
            "SELECT ?x WHERE { GRAPH ?g { ?x <http://ex.org/p> ?y . ?y <http://ex.org/q> ?z } }",
            "proxy://1",
            NotificationType::Binding,
            &decomposer,
        )
        .unwrap()
    }

    #[test]
    fn test_records_are_found_by_original_id() {
        let datastore = OxigraphDatastore::new().unwrap();
        let store = SubscriptionsStore::new();
        let sub = subscription();

        let mut txn = datastore.begin(AccessMode::Write).unwrap();
        for record in SubscriptionsStore::records(&sub).unwrap() {
            txn.add(&record).unwrap();
        }
        txn.commit().unwrap();
        store.cache(sub.clone());

        let ids = SubscriptionsStore::find_by_original(txn.as_ref(), sub.original_id()).unwrap();
        assert_eq!(ids, vec![sub.id()]);

        assert!(store.remove(txn.as_mut(), sub.id()).unwrap());
        txn.commit().unwrap();
        assert!(store.is_empty());
        assert!(SubscriptionsStore::find_by_original(txn.as_ref(), sub.original_id())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_stub_record_round_trip() {
        let datastore = OxigraphDatastore::new().unwrap();
        let fact = Quadruple::new(
            Node::iri("http://ex.org/g"),
            Node::iri("http://ex.org/s"),
            Node::iri("http://ex.org/p"),
            Node::literal("v"),
        )
        .with_publication_time(3);
        let id = SubscriptionId(17);
        let mut binding = Binding::new();
        binding.insert("s", Node::iri("http://ex.org/s"));
        let part = StubPart { fact: fact.clone(), binding };

        let mut txn = datastore.begin(AccessMode::Write).unwrap();
        txn.add(&stub_record(id, &part).unwrap()).unwrap();
        txn.commit().unwrap();

        let found = find_stub_part(txn.as_ref(), id, &fact.hash_value()).unwrap();
        assert_eq!(found, Some(part));
        assert_eq!(find_stub_part(txn.as_ref(), SubscriptionId(18), &fact.hash_value()).unwrap(), None);

        let store = SubscriptionsStore::new();
        assert!(store.remove(txn.as_mut(), id).unwrap());
        txn.commit().unwrap();
        assert_eq!(find_stub_part(txn.as_ref(), id, &fact.hash_value()).unwrap(), None);
        // stub records never show up as facts
        assert!(txn.find(&QuadruplePattern::any()).unwrap().is_empty());
    }
}
