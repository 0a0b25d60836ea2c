//! Matching of facts against atomic queries and subscription chains.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{CompoundEvent, Node, Quadruple};
use crate::parsing::continuous_query::{AtomicQuery, TermPattern};
use crate::pubsub::rewriter::SubscriptionRewriter;
use crate::pubsub::subscription::Subscription;

/// Variable values of a (partial) solution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding(BTreeMap<String, Node>);

impl Binding {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, var: &str) -> Option<&Node> {
        self.0.get(var)
    }

    pub fn insert(&mut self, var: impl Into<String>, value: Node) {
        self.0.insert(var.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &BTreeMap<String, Node> {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.0.iter()
    }

    /// Add every entry of `other`, keeping existing values.
    pub fn merge(&mut self, other: &Binding) {
        for (var, value) in &other.0 {
            self.0.entry(var.clone()).or_insert_with(|| value.clone());
        }
    }

    /// Entries whose variable is in `vars`.
    pub fn project(&self, vars: &[String]) -> Binding {
        Binding(self.0.iter().filter(|(k, _)| vars.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Test a fact against one atomic query.
///
/// Constants must equal the fact's components, except the graph constant which
/// only has to prefix the fact's meta graph. A graph variable binds the base
/// graph. A variable used twice must bind the same value.
pub fn match_atomic(fact: &Quadruple, query: &AtomicQuery) -> Option<Binding> {
    let mut binding = Binding::new();

    match &query.graph {
        TermPattern::Constant(graph) => {
            if !fact.meta_graph().as_str().starts_with(graph.as_str()) {
                return None;
            }
        }
        TermPattern::Variable(name) => binding.insert(name.clone(), fact.graph().clone()),
    }

    let pairs = [
        (&query.subject, fact.subject()),
        (&query.predicate, fact.predicate()),
        (&query.object, fact.object()),
    ];
    for (pattern, value) in pairs {
        match pattern {
            TermPattern::Constant(constant) if constant != value => return None,
            TermPattern::Constant(_) => {}
            TermPattern::Variable(name) => match binding.get(name) {
                Some(bound) if bound != value => return None,
                Some(_) => {}
                None => binding.insert(name.clone(), value.clone()),
            },
        }
    }
    Some(binding)
}

/// Match a whole subscription chain against one compound event.
///
/// Every remaining pattern must be satisfied by a distinct fact of the event;
/// later patterns see the values bound by earlier ones. Returns the collected
/// binding and the index of the fact that satisfied the leading pattern.
pub fn match_event(
    event: &CompoundEvent,
    subscription: &Subscription,
    rewriter: &SubscriptionRewriter,
) -> Option<(Binding, usize)> {
    let mut remaining: Vec<(usize, &Quadruple)> = event.quadruples().iter().enumerate().collect();
    let mut current = subscription.clone();
    let mut binding = Binding::new();
    let mut first_index = None;

    loop {
        let (position, index, partial) = remaining
            .iter()
            .enumerate()
            .find_map(|(pos, (idx, fact))| match_atomic(fact, current.first()).map(|b| (pos, *idx, b)))?;
        first_index.get_or_insert(index);
        binding.merge(&partial);
        let (_, fact) = remaining.remove(position);

        if current.is_terminal() {
            return first_index.map(|first| (binding, first));
        }
        current = rewriter.rewrite(&current, fact).ok()?;
    }
}

/// The fact was published before this subscription was indexed.
pub fn is_stale(fact: &Quadruple, subscription: &Subscription) -> bool {
    fact.publication_time().unwrap_or(0) < subscription.indexation_time().unwrap_or(0)
}

/// Values of `fact` for the result variables that `query` mentions.
pub fn filter_binding(fact: &Quadruple, result_vars: &[String], query: &AtomicQuery) -> Binding {
    match_atomic(fact, query).map(|b| b.project(result_vars)).unwrap_or_default()
}
