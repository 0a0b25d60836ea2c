//! Subscriptions and their identity lineage.
//!
//! A subscription is created once per continuous query and then rewritten as
//! facts satisfy its leading pattern. Every rewrite yields a new value with a
//! fresh `id`; `parent_id` points to the value it was derived from and
//! `original_id` stays the same along the whole chain.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::core::now_millis;
use crate::overlay::coordinate::Constraints;
use crate::overlay::PeerId;
use crate::parsing::continuous_query::AtomicQuery;
use crate::parsing::sparql_decomposer::{Decomposer, DecompositionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    /// Unique within the process; the sequence starts at the process start time
    /// so ids of successive runs do not collide in persisted stores.
    pub fn generate() -> Self {
        static SEED: OnceLock<u64> = OnceLock::new();
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);
        let seed = *SEED.get_or_init(|| now_millis() << 16);
        SubscriptionId(seed.wrapping_add(SEQUENCE.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn iri(&self) -> String {
        format!("urn:eventcloud:subscription:{}", self.0)
    }

    pub fn from_iri(iri: &str) -> Option<Self> {
        iri.strip_prefix("urn:eventcloud:subscription:")?.parse().ok().map(SubscriptionId)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the subscriber receives on a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    /// Only the fact that a match occurred
    Signal,
    /// Values of the result variables
    Binding,
    /// Every fact that took part in the match
    CompoundEvent,
}

/// A peer that matched an earlier pattern of the chain and keeps the
/// corresponding partial solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stub {
    pub peer: PeerId,
    pub subscription_id: SubscriptionId,
    pub quadruple_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsubscription {
    pub index: usize,
    pub atomic_query: AtomicQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    original_id: SubscriptionId,
    parent_id: Option<SubscriptionId>,
    id: SubscriptionId,
    query: String,
    subscriber: String,
    destination: Option<String>,
    kind: NotificationType,
    creation_time: u64,
    indexation_time: Option<u64>,
    stubs: Vec<Stub>,
    sub_subscriptions: Vec<Subsubscription>,
    result_vars: Vec<String>,
}

impl Subscription {
    /// Decompose `query` and build a fresh subscription.
    pub fn new(
        query: &str,
        subscriber: impl Into<String>,
        kind: NotificationType,
        decomposer: &dyn Decomposer,
    ) -> Result<Self, DecompositionError> {
        let parsed = decomposer.parse(query)?;
        let id = SubscriptionId::generate();
        Ok(Self {
            original_id: id,
            parent_id: None,
            id,
            query: query.to_string(),
            subscriber: subscriber.into(),
            destination: None,
            kind,
            creation_time: now_millis(),
            indexation_time: None,
            stubs: Vec::new(),
            sub_subscriptions: index_atomic_queries(parsed.atomic_queries()),
            result_vars: parsed.result_vars,
        })
    }

    /// The value derived from `parent` by a rewrite to `query`.
    pub(crate) fn derived(
        parent: &Subscription,
        query: String,
        decomposer: &dyn Decomposer,
    ) -> Result<Self, DecompositionError> {
        let atomic_queries = decomposer.decompose(&query)?;
        Ok(Self {
            original_id: parent.original_id,
            parent_id: Some(parent.id),
            id: SubscriptionId::generate(),
            query,
            subscriber: parent.subscriber.clone(),
            destination: parent.destination.clone(),
            kind: parent.kind,
            creation_time: parent.creation_time,
            indexation_time: parent.indexation_time,
            stubs: parent.stubs.clone(),
            sub_subscriptions: index_atomic_queries(atomic_queries),
            result_vars: parent.result_vars.clone(),
        })
    }

    /// Identity of the subscriber used by delivery filters.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set once: later calls keep the first value.
    pub fn set_indexation_time(&mut self, time: u64) {
        if self.indexation_time.is_none() {
            self.indexation_time = Some(time);
        }
    }

    pub(crate) fn add_stub(&mut self, stub: Stub) {
        self.stubs.push(stub);
    }

    pub fn original_id(&self) -> SubscriptionId {
        self.original_id
    }

    pub fn parent_id(&self) -> Option<SubscriptionId> {
        self.parent_id
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn kind(&self) -> NotificationType {
        self.kind
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn indexation_time(&self) -> Option<u64> {
        self.indexation_time
    }

    pub fn stubs(&self) -> &[Stub] {
        &self.stubs
    }

    pub fn sub_subscriptions(&self) -> &[Subsubscription] {
        &self.sub_subscriptions
    }

    pub fn result_vars(&self) -> &[String] {
        &self.result_vars
    }

    /// The leading pattern, the only one indexed and matched.
    pub fn first(&self) -> &AtomicQuery {
        // decomposition never yields an empty chain
        &self.sub_subscriptions[0].atomic_query
    }

    pub fn is_terminal(&self) -> bool {
        self.sub_subscriptions.len() == 1
    }

    /// Where the subscription has to be indexed.
    pub fn constraints(&self) -> Constraints {
        self.first().constraints()
    }
}

fn index_atomic_queries(atomic_queries: Vec<AtomicQuery>) -> Vec<Subsubscription> {
    atomic_queries
        .into_iter()
        .enumerate()
        .map(|(index, atomic_query)| Subsubscription { index, atomic_query })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::sparql_decomposer::SparqlDecomposer;

    #[test]
    fn test_new_subscription_is_its_own_origin() {
        let decomposer = SparqlDecomposer::new().unwrap();
        let mut sub = Subscription::new(
            "SELECT ?g WHERE { GRAPH ?g { ?s <http://ex.org/p> ?o . ?o <http://ex.org/q> ?x } }",
            "proxy://1",
            NotificationType::Binding,
            &decomposer,
        )
        .unwrap();

        assert_eq!(sub.id(), sub.original_id());
        assert_eq!(sub.parent_id(), None);
        assert_eq!(sub.sub_subscriptions().len(), 2);
        assert_eq!(sub.result_vars(), ["g".to_string()]);
        assert!(!sub.is_terminal());

        sub.set_indexation_time(10);
        sub.set_indexation_time(20);
        assert_eq!(sub.indexation_time(), Some(10));
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = SubscriptionId::generate();
        let b = SubscriptionId::generate();
        assert_ne!(a, b);
        assert_eq!(SubscriptionId::from_iri(&a.iri()), Some(a));
    }

    #[test]
    fn test_malformed_query_is_rejected() {
        let decomposer = SparqlDecomposer::new().unwrap();
        let err = Subscription::new("SELECT nothing", "proxy://1", NotificationType::Signal, &decomposer);
        assert!(err.is_err());
    }
}
