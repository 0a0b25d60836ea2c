//! A peer of the semantic overlay.
//!
//! Each peer owns one zone of the coordinate space together with the facts
//! and subscriptions that fall into it. Requests arrive through
//! [`SemanticPeer::receive`]; anything that writes to the peer goes through
//! its delayer, so commits and matching happen in batches.
//!
//! Two worker pools run beside the caller's thread:
//!
//! - the **handler** pool runs the local part of an anycast while the
//!   caller forwards it to the neighbors
//! - the **dispatch** pool carries fire-and-forget work: rewritten
//!   subscriptions, notifications, sub-solution retrieval
//!
//! Handler jobs never wait on anything, so an anycast waiting for its own
//! handler job cannot deadlock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;

use crate::config::EventCloudConfig;
use crate::core::{Node, Quadruple};
use crate::delayers::buffer::BufferedItem;
use crate::delayers::delayer::{BufferOperator, Delayer};
use crate::delayers::operator::PublishSubscribeOperator;
use crate::error::{Error, Result};
use crate::execution::{ResponseCollector, WorkerPool};
use crate::overlay::can_overlay::{CanOverlay, SplitEntry};
use crate::overlay::coordinate::{Constraints, Coordinate};
use crate::overlay::messages::{Envelope, Request, RequestId, Response, Routing};
use crate::overlay::neighbor_table::NeighborEntry;
use crate::overlay::network::Network;
use crate::overlay::router::{self, Hop, ReceivedRequests};
use crate::overlay::zone::{Zone, ZoneError};
use crate::overlay::PeerId;
use crate::parsing::sparql_decomposer::Decomposer;
use crate::pubsub::delivery::{DeliveryOutcome, NotificationDelivery};
use crate::pubsub::ephemeral::{EphemeralDeliveries, EphemeralSubscription};
use crate::pubsub::notification::{DeliveryFilter, EndpointResolver, Notification, NotificationId};
use crate::pubsub::subscription::{NotificationType, Subscription, SubscriptionId};
use crate::pubsub::subscriptions_store::{find_stub_part, SubscriptionsStore};
use crate::pubsub::SubscriptionRewriter;
use crate::querying::oxigraph_adapter::OxigraphDatastore;
use crate::querying::query_processing::{AccessMode, QuadStore, QuadruplePattern, Transaction};

/// Longest time an anycast waits for the branches it started.
pub const ANYCAST_TIMEOUT: Duration = Duration::from_secs(30);

/// Held while a join or leave involves the peer.
pub struct MembershipGuard<'a> {
    peer: &'a SemanticPeer,
}

impl Drop for MembershipGuard<'_> {
    fn drop(&mut self) {
        self.peer.membership_busy.store(false, Ordering::SeqCst);
    }
}

/// Facts and subscriptions moving with a zone.
#[derive(Debug, Default)]
pub struct Handover {
    pub facts: Vec<Quadruple>,
    pub subscriptions: Vec<Subscription>,
    pub ephemerals: Vec<EphemeralSubscription>,
}

pub struct SemanticPeer {
    id: PeerId,
    this: Weak<SemanticPeer>,
    network: Weak<Network>,
    pub(crate) config: Arc<EventCloudConfig>,
    overlay: RwLock<CanOverlay>,
    membership_busy: AtomicBool,
    pub(crate) datastore: OxigraphDatastore,
    pub(crate) subscriptions: SubscriptionsStore,
    delayer: Delayer,
    pub(crate) rewriter: SubscriptionRewriter,
    delivery: NotificationDelivery,
    ephemeral: EphemeralDeliveries,
    filter: RwLock<Option<Arc<dyn DeliveryFilter>>>,
    received: Mutex<ReceivedRequests>,
    collector: ResponseCollector,
    handler_pool: WorkerPool,
    dispatch_pool: WorkerPool,
    sequence: AtomicU64,
}

impl SemanticPeer {
    /// A peer that is not activated yet: it must [`create`](Self::create) a
    /// network or [`join`](Self::join) one before it can route.
    pub fn new(
        id: PeerId,
        network: Weak<Network>,
        config: Arc<EventCloudConfig>,
        decomposer: Arc<dyn Decomposer>,
    ) -> Result<Arc<Self>> {
        let handler_pool = WorkerPool::new(format!("handler-{}", id), config.handler_pool_size)?;
        let dispatch_pool = WorkerPool::new(format!("dispatch-{}", id), config.dispatch_pool_size)?;
        let datastore = OxigraphDatastore::new()?;
        let resolver: Weak<dyn EndpointResolver> = network.clone();
        let delivery = NotificationDelivery::new(
            id,
            resolver,
            config.subscriber_registry(),
            config.subscriber_max_failures,
        );

        Ok(Arc::new_cyclic(|this: &Weak<SemanticPeer>| {
            let operator: Arc<dyn BufferOperator> =
                Arc::new(PublishSubscribeOperator::new(this.clone()));
            SemanticPeer {
                id,
                this: this.clone(),
                network,
                overlay: RwLock::new(CanOverlay::new(id, config.dimensions)),
                membership_busy: AtomicBool::new(false),
                datastore,
                subscriptions: SubscriptionsStore::new(),
                delayer: Delayer::new(id, &config, operator),
                rewriter: SubscriptionRewriter::new(decomposer),
                delivery,
                ephemeral: EphemeralDeliveries::new(),
                filter: RwLock::new(None),
                received: Mutex::new(ReceivedRequests::new(config.received_requests_capacity)),
                collector: ResponseCollector::new(),
                handler_pool,
                dispatch_pool,
                sequence: AtomicU64::new(0),
                config,
            }
        }))
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    fn overlay(&self) -> RwLockReadGuard<'_, CanOverlay> {
        self.overlay.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn overlay_mut(&self) -> RwLockWriteGuard<'_, CanOverlay> {
        self.overlay.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn received(&self) -> MutexGuard<'_, ReceivedRequests> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn network(&self) -> Result<Arc<Network>> {
        self.network.upgrade().ok_or_else(|| Error::RoutingDeadEnd {
            peer: self.id,
            reason: "the network is shut down".to_string(),
        })
    }

    pub fn zone(&self) -> Option<Zone> {
        self.overlay().zone().cloned()
    }

    pub fn is_activated(&self) -> bool {
        self.overlay().is_activated()
    }

    pub fn split_history(&self) -> Vec<SplitEntry> {
        self.overlay().split_history().to_vec()
    }

    pub fn neighbors(&self) -> Vec<PeerId> {
        self.overlay().neighbors().peers()
    }

    /// This peer as seen by its neighbors.
    pub fn neighbor_entry(&self) -> Option<NeighborEntry> {
        self.zone().map(|zone| NeighborEntry::new(self.id, zone))
    }

    /// Next hop from this peer toward `coordinate`.
    pub fn next_hop(&self, coordinate: &Coordinate) -> Result<Hop> {
        router::unicast_next_hop(&self.overlay(), coordinate)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.all()
    }

    pub fn has_subscription(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains(id)
    }

    /// Committed facts, bookkeeping records excluded.
    pub fn facts(&self) -> Result<Vec<Quadruple>> {
        let txn = self.datastore.begin(AccessMode::ReadOnly)?;
        txn.find(&QuadruplePattern::any())
    }

    /// Items waiting in the delayer.
    pub fn pending(&self) -> usize {
        self.delayer.pending()
    }

    /// Commit and match whatever is buffered. Returns the number of items.
    pub fn flush(&self) -> usize {
        self.delayer.flush()
    }

    /// Nothing buffered and no job queued or running.
    pub fn is_idle(&self) -> bool {
        self.delayer.pending() == 0 && self.handler_pool.is_idle() && self.dispatch_pool.is_idle()
    }

    pub fn set_delivery_filter(&self, filter: Option<Arc<dyn DeliveryFilter>>) {
        *self.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
    }

    pub(crate) fn delivery_filter(&self) -> Option<Arc<dyn DeliveryFilter>> {
        self.filter.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Failed deliveries counted for a subscription chain.
    pub fn delivery_failures(&self, original_id: SubscriptionId) -> u32 {
        self.delivery.failures(original_id)
    }

    /// Reserve the peer for a join or leave.
    pub fn try_begin_membership(&self) -> Result<MembershipGuard<'_>> {
        self.membership_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::ConcurrentOverlayOperation(self.id))?;
        Ok(MembershipGuard { peer: self })
    }

    fn next_request_id(&self) -> RequestId {
        RequestId { origin: self.id, sequence: self.sequence.fetch_add(1, Ordering::Relaxed) }
    }

    /// Entry point of every envelope reaching this peer.
    pub fn receive(&self, envelope: Envelope) -> Result<Response> {
        if !self.is_activated() {
            return Err(Error::PeerNotActivated(self.id));
        }
        if envelope.hops() > self.config.max_routing_hops {
            tracing::error!(
                peer = %self.id,
                request = %envelope.id,
                hops = envelope.hops(),
                "hop limit exceeded, request dropped"
            );
            return Err(Error::RoutingDeadEnd {
                peer: self.id,
                reason: format!("more than {} hops", self.config.max_routing_hops),
            });
        }

        match envelope.routing.clone() {
            Routing::Direct(target) if target == self.id => self.handle_locally(&envelope),
            Routing::Direct(target) => self.forward(target, &envelope),
            Routing::Unicast(coordinate) => match self.next_hop(&coordinate)? {
                Hop::Local => self.handle_locally(&envelope),
                Hop::Forward(next) => self.forward(next, &envelope),
            },
            Routing::Anycast(constraints) => self.receive_anycast(&envelope, &constraints),
        }
    }

    fn forward(&self, next: PeerId, envelope: &Envelope) -> Result<Response> {
        tracing::trace!(peer = %self.id, request = %envelope.id, next = %next, "forwarding");
        self.network()?.send(next, &envelope.forwarded_by(self.id))
    }

    fn receive_anycast(&self, envelope: &Envelope, constraints: &Constraints) -> Result<Response> {
        let satisfied = self.zone().map_or(false, |zone| zone.satisfies(constraints));
        if !satisfied {
            // the peer owning the constraint key always satisfies them
            if let Hop::Forward(next) = self.next_hop(&constraints.key())? {
                return self.forward(next, envelope);
            }
        }

        if !self.received().record(envelope.id) {
            tracing::trace!(peer = %self.id, request = %envelope.id, "duplicate anycast ignored");
            return Ok(Response::default());
        }

        let mut visited = envelope.routing_list.clone();
        visited.push(self.id);
        let targets = router::anycast_targets(&self.overlay(), constraints, &visited);
        self.collector.register(envelope.id, targets.len() + 1);

        match self.this.upgrade() {
            Some(peer) => {
                let local = envelope.clone();
                let accepted = self.handler_pool.execute(move || {
                    let response = peer.handle_locally(&local).unwrap_or_else(|e| {
                        tracing::warn!(peer = %peer.id, request = %local.id, error = %e, "local handling failed");
                        Response::default()
                    });
                    peer.collector.deliver(local.id, &response);
                });
                if !accepted {
                    self.collector.deliver(envelope.id, &Response::default());
                }
            }
            None => self.collector.deliver(envelope.id, &Response::default()),
        }

        let forwarded = envelope.forwarded_by(self.id);
        let network = self.network()?;
        for target in targets {
            let response = network.send(target, &forwarded).unwrap_or_else(|e| {
                tracing::warn!(peer = %self.id, request = %envelope.id, target = %target, error = %e, "anycast branch failed");
                Response::default()
            });
            self.collector.deliver(envelope.id, &response);
        }

        let (response, complete) = self.collector.wait(envelope.id, ANYCAST_TIMEOUT);
        if !complete {
            tracing::warn!(peer = %self.id, request = %envelope.id, "anycast timed out before every branch answered");
        }
        Ok(response)
    }

    fn handle_locally(&self, envelope: &Envelope) -> Result<Response> {
        let hops = envelope.hops();
        tracing::trace!(peer = %self.id, request = %envelope.id, kind = envelope.request.kind(), hops, "handling");

        match &envelope.request {
            Request::PublishQuadruple(quadruple) => {
                self.delayer.receive(BufferedItem::Quadruple(quadruple.clone()));
            }
            Request::PublishCompoundEvent { event, indexed } => {
                self.delayer.receive(BufferedItem::CompoundEvent { event: event.clone(), indexed: *indexed });
            }
            Request::IndexSubscription(subscription) => {
                self.delayer.receive(BufferedItem::Subscription(subscription.clone()));
            }
            Request::Unsubscribe { original_id } => {
                let removed = self.remove_subscriptions(*original_id)?;
                return Ok(Response { removed, ..Response::handled(hops) });
            }
            Request::RetrieveSubSolution {
                notification_id,
                subscription_id,
                quadruple_hash,
                expected_parts,
                subscriber,
                kind,
            } => {
                self.deliver_sub_solution(
                    notification_id,
                    *subscription_id,
                    quadruple_hash,
                    *expected_parts,
                    subscriber,
                    *kind,
                )?;
            }
            Request::AddQuadruple(quadruple) => {
                let mut txn = self.datastore.begin(AccessMode::Write)?;
                txn.add(quadruple)?;
                txn.commit()?;
            }
            Request::DeleteQuadruple(quadruple) => {
                let pattern = QuadruplePattern::new(
                    Some(quadruple.meta_graph()),
                    Some(quadruple.subject().clone()),
                    Some(quadruple.predicate().clone()),
                    Some(quadruple.object().clone()),
                );
                let removed = self.delete_facts(&pattern, |fact| fact == quadruple)?;
                let count = removed.len();
                return Ok(Response { removed: count, ..Response::with_quadruples(hops, removed) });
            }
            Request::DeleteQuadruples(pattern) => {
                let removed = self.delete_facts(pattern, |_| true)?;
                let count = removed.len();
                return Ok(Response { removed: count, ..Response::with_quadruples(hops, removed) });
            }
            Request::FindQuadruples(pattern) => {
                let txn = self.datastore.begin(AccessMode::ReadOnly)?;
                return Ok(Response::with_quadruples(hops, txn.find(pattern)?));
            }
            Request::ReconstructCompoundEvent { meta_graph, known } => {
                let facts: Vec<Quadruple> = {
                    let txn = self.datastore.begin(AccessMode::ReadOnly)?;
                    facts_of_meta_graph(txn.as_ref(), meta_graph)?
                }
                .into_iter()
                .filter(|fact| !known.contains(&fact.hash_value()))
                .collect();
                tracing::debug!(peer = %self.id, meta_graph = %meta_graph, retrieved = facts.len(), "event facts retrieved");
                return Ok(Response::with_quadruples(hops, facts));
            }
            Request::IndexEphemeralSubscription { meta_graph, subscription_id, subscriber } => {
                self.index_ephemeral(EphemeralSubscription::new(
                    meta_graph.clone(),
                    *subscription_id,
                    subscriber.clone(),
                ))?;
            }
        }
        Ok(Response::handled(hops))
    }

    /// Delete the committed facts matching `pattern` that `keep` accepts.
    /// Buffered facts are committed first.
    fn delete_facts<F>(&self, pattern: &QuadruplePattern, keep: F) -> Result<Vec<Quadruple>>
    where
        F: Fn(&Quadruple) -> bool,
    {
        self.delayer.flush();
        let mut txn = self.datastore.begin(AccessMode::Write)?;
        let facts: Vec<Quadruple> = txn.find(pattern)?.into_iter().filter(|fact| keep(fact)).collect();
        for fact in &facts {
            txn.delete(fact)?;
        }
        txn.commit()?;
        if !facts.is_empty() {
            tracing::debug!(peer = %self.id, removed = facts.len(), "facts deleted");
        }
        Ok(facts)
    }

    /// Record an ephemeral subscription, then push the facts of its meta graph
    /// stored so far. A repeated request is ignored.
    fn index_ephemeral(&self, ephemeral: EphemeralSubscription) -> Result<()> {
        self.delayer.flush();
        let facts = {
            let mut txn = self.datastore.begin(AccessMode::Write)?;
            let known = EphemeralSubscription::find_for(txn.as_ref(), &ephemeral.meta_graph)?;
            if known.iter().any(|other| other.id == ephemeral.id) {
                return Ok(());
            }
            txn.add(&ephemeral.record())?;
            txn.commit()?;
            facts_of_meta_graph(txn.as_ref(), &ephemeral.meta_graph)?
        };
        tracing::debug!(
            peer = %self.id,
            subscription = %ephemeral.id,
            meta_graph = %ephemeral.meta_graph,
            stored = facts.len(),
            "ephemeral subscription indexed"
        );
        self.push_ephemeral(&ephemeral, facts);
        Ok(())
    }

    /// Send the facts of `facts` that `ephemeral` has not received yet.
    pub(crate) fn push_ephemeral(&self, ephemeral: &EphemeralSubscription, facts: Vec<Quadruple>) {
        let facts = self.ephemeral.unsent(ephemeral.id, facts);
        let Some(notification) = ephemeral.notification(self.id, facts) else {
            return;
        };
        let Some(peer) = self.this.upgrade() else {
            return;
        };
        let subscriber = ephemeral.subscriber.clone();
        let id = ephemeral.id;
        self.spawn(move || peer.deliver_notification(&subscriber, id, notification));
    }

    /// Drop every subscription of the chain `original_id`. Buffered items are
    /// committed first so that nothing indexed earlier survives.
    fn remove_subscriptions(&self, original_id: SubscriptionId) -> Result<usize> {
        self.delayer.flush();

        let mut txn = self.datastore.begin(AccessMode::Write)?;
        let mut ids = SubscriptionsStore::find_by_original(txn.as_ref(), original_id)?;
        ids.extend(
            self.subscriptions
                .all()
                .iter()
                .filter(|subscription| subscription.original_id() == original_id)
                .map(Subscription::id),
        );
        ids.sort();
        ids.dedup();

        let mut removed = 0;
        for id in ids {
            if self.subscriptions.remove(txn.as_mut(), id)? {
                removed += 1;
            }
        }
        for record in EphemeralSubscription::records_of(txn.as_ref(), original_id)? {
            txn.delete(&record)?;
            removed += 1;
        }
        txn.commit()?;
        self.ephemeral.forget(original_id);

        if removed > 0 {
            tracing::info!(peer = %self.id, subscription = %original_id, removed, "subscriptions removed");
        }
        Ok(removed)
    }

    fn deliver_sub_solution(
        &self,
        notification_id: &NotificationId,
        subscription_id: SubscriptionId,
        quadruple_hash: &str,
        expected_parts: usize,
        subscriber: &str,
        kind: NotificationType,
    ) -> Result<()> {
        let part = {
            let txn = self.datastore.begin(AccessMode::ReadOnly)?;
            find_stub_part(txn.as_ref(), subscription_id, quadruple_hash)?
        };
        let Some(part) = part else {
            tracing::warn!(
                peer = %self.id,
                subscription = %subscription_id,
                notification = %notification_id,
                "no partial solution stored"
            );
            return Ok(());
        };

        let meta_graph = part.fact.meta_graph();
        let notification = match kind {
            NotificationType::CompoundEvent => Notification::CompoundEvent {
                id: notification_id.clone(),
                source: self.id,
                meta_graph,
                quadruples: vec![part.fact],
                expected_parts,
            },
            NotificationType::Binding | NotificationType::Signal => Notification::Binding {
                id: notification_id.clone(),
                source: self.id,
                meta_graph,
                binding: part.binding,
                expected_parts,
            },
        };
        self.deliver_notification(subscriber, notification_id.original_id, notification);
        Ok(())
    }

    /// Push a notification; once the subscriber is given up on, the whole
    /// chain is unsubscribed everywhere.
    pub(crate) fn deliver_notification(
        &self,
        subscriber: &str,
        original_id: SubscriptionId,
        notification: Notification,
    ) {
        if let DeliveryOutcome::GaveUp { error } =
            self.delivery.deliver(subscriber, original_id, notification)
        {
            tracing::warn!(
                peer = %self.id,
                subscription = %original_id,
                subscriber,
                error = %error,
                "subscriber unreachable, removing its subscription"
            );
            self.route(
                Routing::Anycast(Constraints::unconstrained(self.config.dimensions)),
                Request::Unsubscribe { original_id },
            );
        }
    }

    /// Send a request from this peer and wait for its response.
    pub fn dispatch(&self, routing: Routing, request: Request) -> Result<Response> {
        let envelope = Envelope::new(self.next_request_id(), routing, request);
        tracing::trace!(peer = %self.id, request = %envelope.id, kind = envelope.request.kind(), "dispatching");
        self.receive(envelope)
    }

    /// Fire-and-forget [`dispatch`](Self::dispatch) on the dispatch pool.
    pub fn route(&self, routing: Routing, request: Request) {
        let Some(peer) = self.this.upgrade() else {
            return;
        };
        let kind = request.kind();
        let accepted = self.dispatch_pool.execute(move || {
            if let Err(e) = peer.dispatch(routing, request) {
                tracing::warn!(peer = %peer.id, kind, error = %e, "routed request failed");
            }
        });
        if !accepted {
            tracing::warn!(peer = %self.id, kind, "dispatch pool is shut down, request dropped");
        }
    }

    /// Run `job` on the dispatch pool.
    pub(crate) fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.dispatch_pool.execute(job) {
            tracing::warn!(peer = %self.id, "dispatch pool is shut down, job dropped");
        }
    }

    /// Become the first peer of a network, owning the whole space.
    pub fn create(&self) -> Result<()> {
        let _guard = self.try_begin_membership()?;
        if self.is_activated() {
            return Err(Error::AlreadyActivated(self.id));
        }
        self.overlay_mut().create();
        tracing::info!(peer = %self.id, "network created");
        Ok(())
    }

    /// Join the network through `landmark`, which hands over half its zone.
    pub fn join(&self, landmark: &SemanticPeer) -> Result<()> {
        let _own = self.try_begin_membership()?;
        let _landmark = landmark.try_begin_membership()?;
        if self.is_activated() {
            return Err(Error::AlreadyActivated(self.id));
        }
        if !landmark.is_activated() {
            return Err(Error::PeerNotActivated(landmark.id));
        }
        let network = self.network()?;

        let previous = landmark.neighbors();
        let introduction = landmark.overlay_mut().split_for(self.id)?;
        let given = introduction.zone.clone();
        self.overlay_mut().welcome(introduction);

        landmark.delayer.flush();
        let handover = landmark.hand_over_for_join(&given)?;
        let (facts, subscriptions) = (handover.facts.len(), handover.subscriptions.len());
        self.import(handover)?;

        network.refresh_neighborhood(&[landmark.id, self.id], &previous, None);
        tracing::info!(
            peer = %self.id,
            landmark = %landmark.id,
            zone = %given,
            facts,
            subscriptions,
            "joined"
        );
        Ok(())
    }

    /// Leave the network. The zone is merged into a neighbor, or taken over
    /// by a neighbor whose own zone merges into another peer.
    pub fn leave(&self) -> Result<()> {
        let _guard = self.try_begin_membership()?;
        let zone = self.zone().ok_or(Error::PeerNotActivated(self.id))?;
        let network = self.network()?;
        self.delayer.flush();

        let previous = self.neighbors();
        let mergeable = self.overlay().mergeable_neighbor().map(|entry| entry.peer);
        if let Some(heir) = mergeable {
            let heir = network.peer(heir)?;
            let _heir = heir.try_begin_membership()?;
            heir.absorb(&zone)?;
            heir.import(self.hand_over_all()?)?;
            self.overlay_mut().deactivate();

            network.refresh_neighborhood(&[heir.id], &previous, Some(self.id));
            tracing::info!(peer = %self.id, heir = %heir.id, zone = %zone, "left, zone merged");
            return Ok(());
        }

        let Some((substitute, partner)) = self.takeover_pair(&network) else {
            tracing::warn!(peer = %self.id, "leave rejected, no neighbor can take the zone");
            return Err(Error::NoMergeableNeighbor(self.id));
        };
        let _substitute = substitute.try_begin_membership()?;
        let _partner = partner.try_begin_membership()?;
        let substitute_zone = substitute.zone().ok_or(Error::PeerNotActivated(substitute.id))?;
        substitute.delayer.flush();

        let mut extra = previous;
        extra.extend(substitute.neighbors());
        let history = self.split_history();

        partner.absorb(&substitute_zone)?;
        partner.import(substitute.hand_over_all()?)?;
        substitute.overlay_mut().assign_zone(zone.clone(), history);
        substitute.import(self.hand_over_all()?)?;
        self.overlay_mut().deactivate();

        network.refresh_neighborhood(&[substitute.id, partner.id], &extra, Some(self.id));
        tracing::info!(
            peer = %self.id,
            substitute = %substitute.id,
            partner = %partner.id,
            zone = %zone,
            "left, zone taken over"
        );
        Ok(())
    }

    /// A neighbor that can hand its own zone to one of its neighbors (other
    /// than this peer) and take this peer's zone instead.
    fn takeover_pair(&self, network: &Network) -> Option<(Arc<SemanticPeer>, Arc<SemanticPeer>)> {
        self.neighbors().into_iter().find_map(|candidate| {
            let substitute = network.peer(candidate).ok()?;
            let partner = substitute
                .overlay()
                .mergeable_neighbors()
                .into_iter()
                .map(|entry| entry.peer)
                .find(|&peer| peer != self.id)?;
            let partner = network.peer(partner).ok()?;
            Some((substitute, partner))
        })
    }

    /// Grow the zone by a zone it is mergeable with.
    fn absorb(&self, zone: &Zone) -> Result<()> {
        let mut overlay = self.overlay_mut();
        let own = overlay.zone().cloned().ok_or(Error::PeerNotActivated(self.id))?;
        let dimension = own
            .mergeable(zone)
            .ok_or_else(|| ZoneError::NotMergeable(own.to_string(), zone.to_string()))?;
        let merged = own.merge(zone)?;
        let history = CanOverlay::history_after_merge(overlay.split_history(), dimension);
        overlay.assign_zone(merged, history);
        Ok(())
    }

    /// Give away the facts of `given` and the subscriptions it must index.
    /// Subscriptions this peer's zone still satisfies are kept as well.
    fn hand_over_for_join(&self, given: &Zone) -> Result<Handover> {
        let own = self.zone();
        let mut txn = self.datastore.begin(AccessMode::Write)?;

        let facts: Vec<Quadruple> = txn
            .find(&QuadruplePattern::any())?
            .into_iter()
            .filter(|fact| given.contains(&Coordinate::of_quadruple(fact)))
            .collect();
        for fact in &facts {
            txn.delete(fact)?;
        }

        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .all()
            .into_iter()
            .filter(|subscription| given.satisfies(&subscription.constraints()))
            .collect();
        for subscription in &subscriptions {
            let kept = own.as_ref().map_or(false, |zone| zone.satisfies(&subscription.constraints()));
            if !kept {
                self.subscriptions.forget(txn.as_mut(), subscription.id())?;
            }
        }

        let ephemerals: Vec<EphemeralSubscription> = EphemeralSubscription::all(txn.as_ref())?
            .into_iter()
            .filter(|ephemeral| given.satisfies(&ephemeral.constraints()))
            .collect();
        for ephemeral in &ephemerals {
            let kept = own.as_ref().map_or(false, |zone| zone.satisfies(&ephemeral.constraints()));
            if !kept {
                txn.delete(&ephemeral.record())?;
            }
        }

        txn.commit()?;
        Ok(Handover { facts, subscriptions, ephemerals })
    }

    /// Give away everything; used when the zone leaves this peer.
    fn hand_over_all(&self) -> Result<Handover> {
        let mut txn = self.datastore.begin(AccessMode::Write)?;
        let facts = txn.find(&QuadruplePattern::any())?;
        for fact in &facts {
            txn.delete(fact)?;
        }
        let subscriptions = self.subscriptions.all();
        for subscription in &subscriptions {
            self.subscriptions.forget(txn.as_mut(), subscription.id())?;
        }
        let ephemerals = EphemeralSubscription::all(txn.as_ref())?;
        for ephemeral in &ephemerals {
            txn.delete(&ephemeral.record())?;
        }
        txn.commit()?;
        Ok(Handover { facts, subscriptions, ephemerals })
    }

    fn import(&self, handover: Handover) -> Result<()> {
        let mut txn = self.datastore.begin(AccessMode::Write)?;
        for fact in &handover.facts {
            txn.add(fact)?;
        }
        for subscription in &handover.subscriptions {
            for record in SubscriptionsStore::records(subscription)? {
                txn.add(&record)?;
            }
        }
        for ephemeral in &handover.ephemerals {
            txn.add(&ephemeral.record())?;
        }
        txn.commit()?;

        tracing::debug!(
            peer = %self.id,
            facts = handover.facts.len(),
            subscriptions = handover.subscriptions.len(),
            ephemerals = handover.ephemerals.len(),
            "handover imported"
        );
        for subscription in handover.subscriptions {
            self.subscriptions.cache(subscription);
        }
        Ok(())
    }

    /// Drop `departed` and re-evaluate the given peers as neighbors.
    pub(crate) fn refresh_neighbors(&self, entries: &[NeighborEntry], departed: Option<PeerId>) {
        let mut overlay = self.overlay_mut();
        if let Some(departed) = departed {
            overlay.remove_neighbor(departed);
        }
        overlay.refresh_neighbors(entries);
    }

    /// Flush what is buffered and stop the pools.
    pub fn shutdown(&self) {
        self.delayer.close();
        self.handler_pool.shutdown();
        self.dispatch_pool.shutdown();
        tracing::debug!(peer = %self.id, "peer shut down");
    }
}

/// Committed facts stored under exactly `meta_graph`.
pub(crate) fn facts_of_meta_graph(txn: &(dyn Transaction + '_), meta_graph: &Node) -> Result<Vec<Quadruple>> {
    Ok(txn
        .find(&QuadruplePattern::graph(meta_graph.clone()))?
        .into_iter()
        .filter(|fact| fact.meta_graph() == *meta_graph)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_guard_is_exclusive() {
        let network = Network::new(EventCloudConfig::default()).unwrap();
        let peer = network.create_peer().unwrap();

        let guard = peer.try_begin_membership().unwrap();
        assert!(matches!(peer.try_begin_membership(), Err(Error::ConcurrentOverlayOperation(_))));
        drop(guard);
        assert!(peer.try_begin_membership().is_ok());
    }

    #[test]
    fn test_unactivated_peer_refuses_requests() {
        let network = Network::new(EventCloudConfig::default()).unwrap();
        let peer = network.create_peer().unwrap();
        let result = peer.dispatch(
            Routing::Direct(peer.id()),
            Request::Unsubscribe { original_id: SubscriptionId(1) },
        );
        assert!(matches!(result, Err(Error::PeerNotActivated(_))));
    }

    #[test]
    fn test_join_then_leave_restores_the_full_zone() {
        let network = Network::new(EventCloudConfig::default()).unwrap();
        let first = network.create_peer().unwrap();
        first.create().unwrap();
        let second = network.create_peer().unwrap();
        second.join(&first).unwrap();

        assert!(matches!(second.join(&first), Err(Error::AlreadyActivated(_))));
        assert_eq!(first.neighbors(), vec![second.id()]);

        second.leave().unwrap();
        assert!(!second.is_activated());
        assert_eq!(first.zone(), Some(Zone::full(4)));
        assert!(first.neighbors().is_empty());
    }
}
