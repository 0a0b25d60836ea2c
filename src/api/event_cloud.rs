//! The EventCloud facade: publish facts and events, subscribe with
//! continuous SPARQL queries, receive assembled solutions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::{EventCloudConfig, MatchingAlgorithm};
use crate::core::{now_millis, CompoundEvent, Node, Quadruple};
use crate::api::put_get::PutGetProxy;
use crate::error::{Error, Result};
use crate::overlay::network::Network;
use crate::querying::query_processing::QuadruplePattern;
use crate::pubsub::matching::Binding;
use crate::pubsub::notification::{DeliveryError, Notification, NotificationId, SubscriberEndpoint};
use crate::pubsub::subscription::{NotificationType, Subscription, SubscriptionId};

/// How long [`EventCloud::flush`] waits for the network to go quiet.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_PROXY: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq)]
pub enum SolutionPayload {
    Signal,
    Binding(Binding),
    Quadruples(Vec<Quadruple>),
}

/// A complete solution of a continuous query.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub subscription_id: SubscriptionId,
    pub notification_id: NotificationId,
    pub meta_graph: Node,
    pub payload: SolutionPayload,
}

impl Solution {
    pub fn binding(&self) -> Option<&Binding> {
        match &self.payload {
            SolutionPayload::Binding(binding) => Some(binding),
            _ => None,
        }
    }

    pub fn quadruples(&self) -> &[Quadruple] {
        match &self.payload {
            SolutionPayload::Quadruples(quadruples) => quadruples,
            _ => &[],
        }
    }
}

struct PartialSolution {
    received: usize,
    meta_graph: Node,
    payload: SolutionPayload,
}

impl PartialSolution {
    fn absorb(&mut self, notification: Notification) {
        self.received += 1;
        match (&mut self.payload, notification) {
            (SolutionPayload::Binding(binding), Notification::Binding { binding: part, .. }) => {
                binding.merge(&part);
            }
            (SolutionPayload::Quadruples(quadruples), Notification::CompoundEvent { quadruples: part, .. }) => {
                quadruples.extend(part);
            }
            _ => {}
        }
    }
}

fn payload_of(notification: &Notification) -> SolutionPayload {
    match notification {
        Notification::Signal { .. } => SolutionPayload::Signal,
        Notification::Binding { .. } => SolutionPayload::Binding(Binding::new()),
        Notification::CompoundEvent { .. } => SolutionPayload::Quadruples(Vec::new()),
    }
}

/// Subscriber endpoint of a facade. Parts sharing a notification id are
/// merged and released as one [`Solution`] once all of them arrived.
pub struct SubscribeProxy {
    address: String,
    senders: Mutex<HashMap<SubscriptionId, Sender<Solution>>>,
    partials: Mutex<HashMap<NotificationId, PartialSolution>>,
}

impl SubscribeProxy {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            senders: Mutex::new(HashMap::new()),
            partials: Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn senders(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Sender<Solution>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: SubscriptionId, sender: Sender<Solution>) {
        self.senders().insert(id, sender);
    }

    fn unregister(&self, id: SubscriptionId) {
        self.senders().remove(&id);
        self.partials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|notification, _| notification.original_id != id);
    }

    /// Parts received so far that do not form a solution yet.
    pub fn pending_parts(&self) -> usize {
        self.partials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|partial| partial.received)
            .sum()
    }

    fn assemble(&self, notification: Notification) -> Option<Solution> {
        let id = notification.id().clone();
        let expected = notification.expected_parts();
        let mut partials = self.partials.lock().unwrap_or_else(PoisonError::into_inner);
        let partial = partials.entry(id.clone()).or_insert_with(|| PartialSolution {
            received: 0,
            meta_graph: notification.meta_graph().clone(),
            payload: payload_of(&notification),
        });
        partial.absorb(notification);
        if partial.received < expected {
            tracing::trace!(notification = %id, received = partial.received, expected, "partial solution");
            return None;
        }
        let partial = partials.remove(&id)?;
        Some(Solution {
            subscription_id: id.original_id,
            notification_id: id,
            meta_graph: partial.meta_graph,
            payload: partial.payload,
        })
    }

    fn unreachable(&self, reason: String) -> DeliveryError {
        DeliveryError::Unreachable { address: self.address.clone(), reason }
    }
}

impl SubscriberEndpoint for SubscribeProxy {
    fn receive(&self, notification: Notification) -> std::result::Result<(), DeliveryError> {
        let original_id = notification.id().original_id;
        let sender = self
            .senders()
            .get(&original_id)
            .cloned()
            .ok_or_else(|| self.unreachable(format!("no subscription {}", original_id)))?;

        let Some(solution) = self.assemble(notification) else {
            return Ok(());
        };
        if sender.send(solution).is_err() {
            self.unregister(original_id);
            return Err(self.unreachable(format!("handle of subscription {} was dropped", original_id)));
        }
        Ok(())
    }
}

/// Receiving side of one subscription.
pub struct SubscriptionHandle {
    subscription_id: SubscriptionId,
    receiver: Receiver<Solution>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Block until the next solution. `None` once the subscription is gone.
    pub fn receive(&self) -> Option<Solution> {
        self.receiver.recv().ok()
    }

    pub fn try_receive(&self) -> Option<Solution> {
        self.receiver.try_recv().ok()
    }

    pub fn receive_timeout(&self, timeout: Duration) -> Option<Solution> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Everything received so far.
    pub fn drain(&self) -> Vec<Solution> {
        self.receiver.try_iter().collect()
    }
}

/// Entry point of the library.
///
/// A facade registers its own subscriber endpoint on the network; several
/// facades may share one network through [`EventCloud::with_network`].
pub struct EventCloud {
    network: Arc<Network>,
    proxy: Arc<SubscribeProxy>,
    originals: Mutex<HashMap<SubscriptionId, Subscription>>,
    ephemerals: Mutex<HashMap<SubscriptionId, Node>>,
}

impl EventCloud {
    /// Bootstrap a network of `peers` peers and a facade on top of it.
    pub fn new(config: EventCloudConfig, peers: usize) -> Result<Self> {
        Ok(Self::with_network(Network::bootstrap(config, peers)?))
    }

    pub fn with_network(network: Arc<Network>) -> Self {
        let address = format!("proxy://{}", NEXT_PROXY.fetch_add(1, Ordering::Relaxed));
        let proxy = Arc::new(SubscribeProxy::new(address));
        let endpoint: Arc<dyn SubscriberEndpoint> = proxy.clone();
        network.register_endpoint(proxy.address(), &endpoint);
        Self {
            network,
            proxy,
            originals: Mutex::new(HashMap::new()),
            ephemerals: Mutex::new(HashMap::new()),
        }
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn proxy(&self) -> &SubscribeProxy {
        &self.proxy
    }

    fn originals(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Subscription>> {
        self.originals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ephemerals(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Node>> {
        self.ephemerals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Synchronous access to the stored facts.
    pub fn put_get(&self) -> PutGetProxy {
        PutGetProxy::new(Arc::clone(&self.network))
    }

    /// Publish one fact, stamped with the current time unless it has one.
    pub fn publish(&self, mut quadruple: Quadruple) -> Result<()> {
        quadruple.stamp();
        self.network.publish(quadruple)?;
        Ok(())
    }

    /// Publish every fact of `event` with one publication time.
    pub fn publish_compound_event(&self, mut event: CompoundEvent) -> Result<()> {
        event.stamp(now_millis(), None);
        match self.network.config().matching_algorithm {
            MatchingAlgorithm::FactByFact => {
                for quadruple in event.quadruples() {
                    self.network.publish(quadruple.clone())?;
                }
            }
            MatchingAlgorithm::CompoundEvent => {
                for indexed in 0..event.len() {
                    self.network.publish_compound_event(event.clone(), indexed)?;
                }
            }
        }
        Ok(())
    }

    pub fn subscribe(&self, query: &str, kind: NotificationType) -> Result<SubscriptionHandle> {
        self.subscribe_with_destination(query, kind, None)
    }

    /// Subscribe on behalf of `destination`, the identity delivery filters
    /// judge notifications against.
    pub fn subscribe_with_destination(
        &self,
        query: &str,
        kind: NotificationType,
        destination: Option<&str>,
    ) -> Result<SubscriptionHandle> {
        let mut subscription =
            Subscription::new(query, self.proxy.address(), kind, self.network.decomposer().as_ref())?;
        if let Some(destination) = destination {
            subscription = subscription.with_destination(destination);
        }
        subscription.set_indexation_time(now_millis());
        let id = subscription.id();

        let (sender, receiver) = mpsc::channel();
        self.proxy.register(id, sender);
        self.originals().insert(id, subscription.clone());

        match self.network.index_subscription(subscription) {
            Ok(response) => {
                tracing::info!(subscription = %id, peers = response.peers_reached, "subscribed");
                Ok(SubscriptionHandle { subscription_id: id, receiver })
            }
            Err(e) => {
                self.proxy.unregister(id);
                self.originals().remove(&id);
                Err(e)
            }
        }
    }

    /// Receive every fact published under `meta_graph`, those already stored
    /// first. Each solution carries the facts one peer pushed at once.
    pub fn subscribe_ephemeral(&self, meta_graph: Node) -> Result<SubscriptionHandle> {
        let id = SubscriptionId::generate();
        let (sender, receiver) = mpsc::channel();
        self.proxy.register(id, sender);
        self.ephemerals().insert(id, meta_graph.clone());

        match self.network.index_ephemeral_subscription(meta_graph.clone(), id, self.proxy.address()) {
            Ok(response) => {
                tracing::info!(subscription = %id, meta_graph = %meta_graph, peers = response.peers_reached, "ephemeral subscription indexed");
                Ok(SubscriptionHandle { subscription_id: id, receiver })
            }
            Err(e) => {
                self.proxy.unregister(id);
                self.ephemerals().remove(&id);
                Err(e)
            }
        }
    }

    /// Remove a subscription and everything derived from it. Returns the
    /// number of subscriptions removed across the network.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<usize> {
        if let Some(meta_graph) = self.ephemerals().remove(&id) {
            self.proxy.unregister(id);
            let constraints = QuadruplePattern::graph(meta_graph).constraints();
            let removed = self.network.unsubscribe(id, constraints)?.removed;
            tracing::info!(subscription = %id, removed, "ephemeral subscription removed");
            return Ok(removed);
        }
        let original = self.originals().remove(&id).ok_or(Error::SubscriptionNotFound(id))?;
        self.proxy.unregister(id);

        let mut reached = HashSet::new();
        let mut removed = 0;
        for sub_subscription in original.sub_subscriptions() {
            let constraints = sub_subscription.atomic_query.constraints();
            if reached.insert(constraints.clone()) {
                removed += self.network.unsubscribe(id, constraints)?.removed;
            }
        }
        tracing::info!(subscription = %id, removed, "unsubscribed");
        Ok(removed)
    }

    /// Wait until every buffered item is matched and every notification is
    /// delivered. Returns false if the network is still busy after
    /// [`SETTLE_TIMEOUT`].
    pub fn flush(&self) -> bool {
        self.network.settle(SETTLE_TIMEOUT)
    }
}

impl Drop for EventCloud {
    fn drop(&mut self) {
        self.network.unregister_endpoint(self.proxy.address());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::PeerId;

    fn part(hash: &str, var: &str, expected_parts: usize) -> Notification {
        let mut binding = Binding::new();
        binding.insert(var, Node::literal(var));
        Notification::Binding {
            id: NotificationId {
                original_id: SubscriptionId(1),
                terminal_id: SubscriptionId(3),
                quadruple_hash: hash.to_string(),
            },
            source: PeerId(0),
            meta_graph: Node::iri("http://ex.org/g"),
            binding,
            expected_parts,
        }
    }

    #[test]
    fn test_proxy_merges_parts() {
        let proxy = SubscribeProxy::new("proxy://test");
        let (sender, receiver) = mpsc::channel();
        proxy.register(SubscriptionId(1), sender);

        proxy.receive(part("aa", "x", 2)).unwrap();
        assert!(receiver.try_recv().is_err());
        assert_eq!(proxy.pending_parts(), 1);
        proxy.receive(part("aa", "y", 2)).unwrap();

        let solution = receiver.try_recv().unwrap();
        let binding = solution.binding().unwrap();
        assert_eq!(binding.len(), 2);
        assert_eq!(proxy.pending_parts(), 0);
    }

    #[test]
    fn test_proxy_reports_dropped_handle() {
        let proxy = SubscribeProxy::new("proxy://test");
        let (sender, receiver) = mpsc::channel();
        proxy.register(SubscriptionId(1), sender);
        drop(receiver);

        assert!(matches!(proxy.receive(part("aa", "x", 1)), Err(DeliveryError::Unreachable { .. })));
        // unregistered after the first failure
        assert!(matches!(proxy.receive(part("bb", "x", 1)), Err(DeliveryError::Unreachable { .. })));
    }
}
