//! Commit and matching of a flushed buffer on a semantic peer.
//!
//! Matching a buffer gives the same notifications as matching its items one
//! flush at a time: an item only meets the items that arrived before it,
//! whether those are in the store already or earlier in the same buffer.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use crate::config::MatchingAlgorithm;
use crate::core::{now_millis, CompoundEvent, Node, Quadruple};
use crate::delayers::buffer::{Buffer, BufferedItem};
use crate::delayers::delayer::BufferOperator;
use crate::error::Result;
use crate::overlay::messages::{Request, Routing};
use crate::overlay::peer::SemanticPeer;
use crate::pubsub::ephemeral::EphemeralSubscription;
use crate::pubsub::matching::{filter_binding, is_stale, match_atomic, match_event, Binding};
use crate::pubsub::notification::{Notification, NotificationId};
use crate::pubsub::subscription::{NotificationType, Stub, Subscription, SubscriptionId};
use crate::pubsub::subscriptions_store::{stub_record, StubPart, SubscriptionsStore};
use crate::querying::query_processing::{AccessMode, QuadStore, QuadruplePattern};

/// What matching decided; carried out once every read is done.
enum Action {
    /// The last pattern matched
    Notify { subscription: Subscription, fact: Quadruple, binding: Binding },
    /// An earlier pattern matched: index the rewritten subscription
    Rewrite { subscription: Subscription, fact: Quadruple },
    /// A compound event satisfied the whole chain
    NotifyEvent { subscription: Subscription, event: CompoundEvent, binding: Binding },
}

pub struct PublishSubscribeOperator {
    peer: Weak<SemanticPeer>,
}

impl PublishSubscribeOperator {
    pub fn new(peer: Weak<SemanticPeer>) -> Self {
        Self { peer }
    }

    fn match_fact_by_fact(&self, peer: &SemanticPeer, buffer: &Buffer) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        let buffered_subscriptions: HashMap<SubscriptionId, usize> =
            buffer.subscriptions().map(|(position, s)| (s.id(), position)).collect();
        let mut buffered_facts: HashMap<&Quadruple, usize> = HashMap::new();
        for (position, fact) in buffer.stored_quadruples() {
            buffered_facts.entry(fact).or_insert(position);
        }

        let subscriptions = peer.subscriptions.all();
        for (position, fact) in buffer.stored_quadruples() {
            for subscription in &subscriptions {
                let later = buffered_subscriptions
                    .get(&subscription.id())
                    .map_or(false, |&at| at > position);
                if !later {
                    match_fact(peer, subscription, fact, &mut actions);
                }
            }
        }

        if buffered_subscriptions.is_empty() {
            return Ok(actions);
        }
        let txn = peer.datastore.begin(AccessMode::ReadOnly)?;
        for (position, subscription) in buffer.subscriptions() {
            for fact in txn.find(&QuadruplePattern::from(subscription.first()))? {
                let later = buffered_facts.get(&fact).map_or(false, |&at| at > position);
                if !later {
                    match_fact(peer, subscription, &fact, &mut actions);
                }
            }
        }
        Ok(actions)
    }

    /// Events are matched as a whole on the peer of each of their facts; only
    /// the peer holding the fact that satisfied the leading pattern answers.
    fn match_compound_events(&self, peer: &SemanticPeer, buffer: &Buffer) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        let buffered_subscriptions: HashMap<SubscriptionId, usize> =
            buffer.subscriptions().map(|(position, s)| (s.id(), position)).collect();
        let subscriptions = peer.subscriptions.all();

        for (position, item) in buffer.iter() {
            let (event, indexed) = match item {
                BufferedItem::CompoundEvent { event, indexed } => (event.clone(), *indexed),
                BufferedItem::Quadruple(fact) => (CompoundEvent::new(vec![fact.clone()])?, 0),
                BufferedItem::Subscription(_) => continue,
            };
            let Some(indexed_fact) = event.quadruples().get(indexed) else {
                tracing::warn!(peer = %peer.id(), indexed, size = event.len(), "indexed fact outside the event");
                continue;
            };

            for subscription in &subscriptions {
                let later = buffered_subscriptions
                    .get(&subscription.id())
                    .map_or(false, |&at| at > position);
                if later {
                    continue;
                }
                if is_stale(indexed_fact, subscription) {
                    tracing::trace!(peer = %peer.id(), subscription = %subscription.id(), "stale event ignored");
                    continue;
                }
                if let Some((binding, first)) = match_event(&event, subscription, &peer.rewriter) {
                    if first == indexed {
                        actions.push(Action::NotifyEvent {
                            subscription: subscription.clone(),
                            event: event.clone(),
                            binding,
                        });
                    }
                }
            }
        }
        Ok(actions)
    }

    fn execute(&self, peer: &Arc<SemanticPeer>, action: Action) {
        match action {
            Action::Notify { subscription, fact, binding } => notify(peer, &subscription, &fact, binding),
            Action::Rewrite { subscription, fact } => {
                if let Err(e) = rewrite(peer, &subscription, &fact) {
                    tracing::warn!(
                        peer = %peer.id(),
                        subscription = %subscription.id(),
                        error = %e,
                        "rewrite failed"
                    );
                }
            }
            Action::NotifyEvent { subscription, event, binding } => {
                notify_event(peer, &subscription, &event, binding);
            }
        }
    }
}

impl BufferOperator for PublishSubscribeOperator {
    fn commit(&self, buffer: &Buffer) -> Result<()> {
        let Some(peer) = self.peer.upgrade() else {
            return Ok(());
        };
        let now = now_millis();
        let mut txn = peer.datastore.begin(AccessMode::Write)?;
        let mut indexed = Vec::new();

        for (_, item) in buffer.iter() {
            match item {
                BufferedItem::Subscription(subscription) => {
                    let mut subscription = subscription.clone();
                    subscription.set_indexation_time(now);
                    for record in SubscriptionsStore::records(&subscription)? {
                        txn.add(&record)?;
                    }
                    indexed.push(subscription);
                }
                other => {
                    if let Some(fact) = other.stored_quadruple() {
                        txn.add(fact)?;
                    }
                }
            }
        }
        txn.commit()?;

        tracing::trace!(peer = %peer.id(), items = buffer.len(), subscriptions = indexed.len(), "buffer committed");
        for subscription in indexed {
            peer.subscriptions.cache(subscription);
        }
        Ok(())
    }

    fn trigger_matching(&self, buffer: &Buffer) {
        let Some(peer) = self.peer.upgrade() else {
            return;
        };
        let actions = match peer.config.matching_algorithm {
            MatchingAlgorithm::FactByFact => self.match_fact_by_fact(&peer, buffer),
            MatchingAlgorithm::CompoundEvent => self.match_compound_events(&peer, buffer),
        };
        match actions {
            Ok(actions) => {
                for action in actions {
                    self.execute(&peer, action);
                }
            }
            Err(e) => tracing::error!(peer = %peer.id(), error = %e, "matching aborted"),
        }
        if let Err(e) = self.push_ephemeral(&peer, buffer) {
            tracing::error!(peer = %peer.id(), error = %e, "ephemeral push aborted");
        }
    }
}

impl PublishSubscribeOperator {
    /// Push the committed facts to the ephemeral subscriptions of their meta graph.
    fn push_ephemeral(&self, peer: &SemanticPeer, buffer: &Buffer) -> Result<()> {
        let mut by_meta_graph: BTreeMap<Node, Vec<Quadruple>> = BTreeMap::new();
        for (_, fact) in buffer.stored_quadruples() {
            by_meta_graph.entry(fact.meta_graph()).or_default().push(fact.clone());
        }
        if by_meta_graph.is_empty() {
            return Ok(());
        }
        let txn = peer.datastore.begin(AccessMode::ReadOnly)?;
        for (meta_graph, facts) in by_meta_graph {
            for ephemeral in EphemeralSubscription::find_for(txn.as_ref(), &meta_graph)? {
                peer.push_ephemeral(&ephemeral, facts.clone());
            }
        }
        Ok(())
    }
}

fn match_fact(peer: &SemanticPeer, subscription: &Subscription, fact: &Quadruple, actions: &mut Vec<Action>) {
    let Some(binding) = match_atomic(fact, subscription.first()) else {
        return;
    };
    if is_stale(fact, subscription) {
        tracing::trace!(
            peer = %peer.id(),
            subscription = %subscription.id(),
            published = ?fact.publication_time(),
            indexed = ?subscription.indexation_time(),
            "stale match discarded"
        );
        return;
    }
    if subscription.is_terminal() {
        actions.push(Action::Notify { subscription: subscription.clone(), fact: fact.clone(), binding });
    } else {
        actions.push(Action::Rewrite { subscription: subscription.clone(), fact: fact.clone() });
    }
}

fn allowed(peer: &SemanticPeer, fact: &Quadruple, subscription: &Subscription) -> bool {
    let allowed = peer.delivery_filter().map_or(true, |filter| filter.allow(fact, subscription));
    if !allowed {
        tracing::debug!(peer = %peer.id(), subscription = %subscription.id(), "notification filtered out");
    }
    allowed
}

fn send(peer: &Arc<SemanticPeer>, subscription: &Subscription, notification: Notification) {
    let delivering = Arc::clone(peer);
    let subscriber = subscription.subscriber().to_string();
    let original_id = subscription.original_id();
    peer.spawn(move || delivering.deliver_notification(&subscriber, original_id, notification));
}

fn notify(peer: &Arc<SemanticPeer>, subscription: &Subscription, fact: &Quadruple, binding: Binding) {
    if !allowed(peer, fact, subscription) {
        return;
    }
    let id = NotificationId {
        original_id: subscription.original_id(),
        terminal_id: subscription.id(),
        quadruple_hash: fact.hash_value(),
    };
    let expected_parts = 1 + subscription.stubs().len();
    let source = peer.id();
    let meta_graph = fact.meta_graph();
    let notification = match subscription.kind() {
        NotificationType::Signal => Notification::Signal { id: id.clone(), source, meta_graph },
        NotificationType::Binding => Notification::Binding {
            id: id.clone(),
            source,
            meta_graph,
            binding: binding.project(subscription.result_vars()),
            expected_parts,
        },
        NotificationType::CompoundEvent => Notification::CompoundEvent {
            id: id.clone(),
            source,
            meta_graph,
            quadruples: vec![fact.clone()],
            expected_parts,
        },
    };
    tracing::debug!(
        peer = %peer.id(),
        subscription = %subscription.id(),
        notification = %id,
        expected_parts,
        "terminal match"
    );
    send(peer, subscription, notification);

    for stub in subscription.stubs() {
        peer.route(
            Routing::Direct(stub.peer),
            Request::RetrieveSubSolution {
                notification_id: id.clone(),
                subscription_id: stub.subscription_id,
                quadruple_hash: stub.quadruple_hash.clone(),
                expected_parts,
                subscriber: subscription.subscriber().to_string(),
                kind: subscription.kind(),
            },
        );
    }
}

/// Keep this peer's part of the solution, then index the shorter
/// subscription wherever its new leading pattern lives.
fn rewrite(peer: &Arc<SemanticPeer>, subscription: &Subscription, fact: &Quadruple) -> Result<()> {
    let mut derived = peer.rewriter.rewrite(subscription, fact)?;

    if subscription.kind() != NotificationType::Signal {
        let part = StubPart {
            fact: fact.clone(),
            binding: filter_binding(fact, subscription.result_vars(), subscription.first()),
        };
        let mut txn = peer.datastore.begin(AccessMode::Write)?;
        txn.add(&stub_record(subscription.id(), &part)?)?;
        txn.commit()?;
        derived.add_stub(Stub {
            peer: peer.id(),
            subscription_id: subscription.id(),
            quadruple_hash: fact.hash_value(),
        });
    }

    tracing::debug!(
        peer = %peer.id(),
        subscription = %subscription.id(),
        rewritten = %derived.id(),
        remaining = derived.sub_subscriptions().len(),
        "subscription rewritten"
    );
    peer.route(Routing::Anycast(derived.constraints()), Request::IndexSubscription(derived));
    Ok(())
}

fn notify_event(
    peer: &Arc<SemanticPeer>,
    subscription: &Subscription,
    event: &CompoundEvent,
    binding: Binding,
) {
    // events are non-empty by construction
    let first = &event.quadruples()[0];
    if !allowed(peer, first, subscription) {
        return;
    }
    let id = NotificationId {
        original_id: subscription.original_id(),
        terminal_id: subscription.id(),
        quadruple_hash: first.hash_value(),
    };
    let source = peer.id();
    let meta_graph = event.meta_graph();
    let notification = match subscription.kind() {
        NotificationType::Signal => Notification::Signal { id, source, meta_graph },
        NotificationType::Binding => Notification::Binding {
            id,
            source,
            meta_graph,
            binding: binding.project(subscription.result_vars()),
            expected_parts: 1,
        },
        NotificationType::CompoundEvent => Notification::CompoundEvent {
            id,
            source,
            meta_graph,
            quadruples: event.quadruples().to_vec(),
            expected_parts: 1,
        },
    };
    send(peer, subscription, notification);
}
