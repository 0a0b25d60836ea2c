//! Ephemeral subscriptions: one subscriber asking for every fact published
//! under one meta graph, the ones already stored and the ones still to come.
//!
//! They are never rewritten and never matched against continuous queries. A
//! peer keeps one record per (meta graph, subscription) in
//! [`EPHEMERAL_GRAPH`] and pushes the facts of that meta graph as they are
//! committed.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::{Node, Quadruple};
use crate::error::Result;
use crate::overlay::coordinate::Constraints;
use crate::overlay::PeerId;
use crate::pubsub::notification::{Notification, NotificationId};
use crate::pubsub::subscription::SubscriptionId;
use crate::querying::query_processing::{QuadruplePattern, Transaction};

pub const EPHEMERAL_GRAPH: &str = "urn:eventcloud:ephemeral";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralSubscription {
    pub meta_graph: Node,
    pub id: SubscriptionId,
    pub subscriber: String,
}

impl EphemeralSubscription {
    pub fn new(meta_graph: Node, id: SubscriptionId, subscriber: impl Into<String>) -> Self {
        Self { meta_graph, id, subscriber: subscriber.into() }
    }

    /// Stored form: the meta graph as subject, the subscription as predicate.
    pub fn record(&self) -> Quadruple {
        Quadruple::new(
            Node::iri(EPHEMERAL_GRAPH),
            self.meta_graph.clone(),
            Node::iri(self.id.iri()),
            Node::iri(self.subscriber.as_str()),
        )
    }

    pub fn from_record(record: &Quadruple) -> Option<Self> {
        let id = SubscriptionId::from_iri(record.predicate().as_str())?;
        Some(Self::new(record.subject().clone(), id, record.object().as_str()))
    }

    /// Ephemeral subscriptions waiting for facts of `meta_graph`.
    pub fn find_for(txn: &(dyn Transaction + '_), meta_graph: &Node) -> Result<Vec<Self>> {
        let pattern = QuadruplePattern::system(Node::iri(EPHEMERAL_GRAPH)).with_subject(meta_graph.clone());
        Ok(txn.find(&pattern)?.iter().filter_map(Self::from_record).collect())
    }

    pub fn all(txn: &(dyn Transaction + '_)) -> Result<Vec<Self>> {
        let pattern = QuadruplePattern::system(Node::iri(EPHEMERAL_GRAPH));
        Ok(txn.find(&pattern)?.iter().filter_map(Self::from_record).collect())
    }

    /// Zones holding facts of the meta graph satisfy these.
    pub fn constraints(&self) -> Constraints {
        QuadruplePattern::graph(self.meta_graph.clone()).constraints()
    }

    /// Records of subscription `id`, whatever their meta graph.
    pub fn records_of(txn: &(dyn Transaction + '_), id: SubscriptionId) -> Result<Vec<Quadruple>> {
        let mut pattern = QuadruplePattern::system(Node::iri(EPHEMERAL_GRAPH));
        pattern.predicate = Some(Node::iri(id.iri()));
        txn.find(&pattern)
    }

    /// The facts of `quadruples` pushed in one notification. They all belong
    /// to this subscription's meta graph.
    pub fn notification(&self, source: PeerId, quadruples: Vec<Quadruple>) -> Option<Notification> {
        let first = quadruples.first()?;
        Some(Notification::CompoundEvent {
            id: NotificationId { original_id: self.id, terminal_id: self.id, quadruple_hash: first.hash_value() },
            source,
            meta_graph: self.meta_graph.clone(),
            quadruples,
            expected_parts: 1,
        })
    }
}

/// Facts a peer already pushed to each ephemeral subscription, so that a fact
/// seen both by the indexing request and by the flush that stored it is sent
/// once.
#[derive(Default)]
pub struct EphemeralDeliveries {
    sent: Mutex<HashSet<(SubscriptionId, String)>>,
}

impl EphemeralDeliveries {
    pub fn new() -> Self {
        Self::default()
    }

    fn sent(&self) -> MutexGuard<'_, HashSet<(SubscriptionId, String)>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The facts of `quadruples` not sent to `id` yet, now marked as sent.
    pub fn unsent(&self, id: SubscriptionId, quadruples: Vec<Quadruple>) -> Vec<Quadruple> {
        let mut sent = self.sent();
        quadruples.into_iter().filter(|fact| sent.insert((id, fact.hash_value()))).collect()
    }

    pub fn forget(&self, id: SubscriptionId) {
        self.sent().retain(|(sent_to, _)| *sent_to != id);
    }
}
