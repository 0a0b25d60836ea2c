//! In-process network of semantic peers.
//!
//! The network owns every peer and plays the transport between them: each
//! hop is encoded and decoded with the wire codec before the next peer sees
//! it. It also resolves subscriber addresses to the endpoints registered on
//! it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::EventCloudConfig;
use crate::core::encoding::{decode_message, encode_message};
use crate::core::{CompoundEvent, Node, Quadruple};
use crate::error::{Error, Result};
use crate::overlay::coordinate::{Constraints, Coordinate};
use crate::overlay::messages::{Envelope, Request, Response, Routing};
use crate::overlay::neighbor_table::NeighborEntry;
use crate::overlay::peer::SemanticPeer;
use crate::overlay::PeerId;
use crate::parsing::sparql_decomposer::{Decomposer, SparqlDecomposer};
use crate::pubsub::notification::{DeliveryFilter, EndpointResolver, SubscriberEndpoint};
use crate::pubsub::subscription::{Subscription, SubscriptionId};
use crate::querying::query_processing::QuadruplePattern;
use rand::seq::IteratorRandom;

const SETTLE_POLL: Duration = Duration::from_millis(5);

pub struct Network {
    this: Weak<Network>,
    config: Arc<EventCloudConfig>,
    decomposer: Arc<dyn Decomposer>,
    peers: RwLock<BTreeMap<PeerId, Arc<SemanticPeer>>>,
    endpoints: RwLock<HashMap<String, Weak<dyn SubscriberEndpoint>>>,
    next_id: AtomicU64,
}

impl Network {
    /// An empty network.
    pub fn new(config: EventCloudConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let decomposer: Arc<dyn Decomposer> =
            Arc::new(SparqlDecomposer::new().map_err(|e| Error::Config(e.to_string()))?);
        Ok(Arc::new_cyclic(|this| Network {
            this: this.clone(),
            config: Arc::new(config),
            decomposer,
            peers: RwLock::new(BTreeMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }))
    }

    /// A network of `peers` activated peers: the first one creates the
    /// network, each other one joins through a random activated peer.
    pub fn bootstrap(config: EventCloudConfig, peers: usize) -> Result<Arc<Self>> {
        let network = Self::new(config)?;
        network.create_peer()?.create()?;
        for _ in 1..peers.max(1) {
            let landmark = network.random_peer()?;
            let joiner = network.create_peer()?;
            joiner.join(&landmark)?;
        }
        tracing::info!(peers = network.len(), "network bootstrapped");
        Ok(network)
    }

    pub fn config(&self) -> &EventCloudConfig {
        &self.config
    }

    pub fn decomposer(&self) -> &Arc<dyn Decomposer> {
        &self.decomposer
    }

    /// Register a new, not yet activated peer.
    pub fn create_peer(&self) -> Result<Arc<SemanticPeer>> {
        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let peer = SemanticPeer::new(
            id,
            self.this.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.decomposer),
        )?;
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&peer));
        tracing::debug!(peer = %id, "peer created");
        Ok(peer)
    }

    pub fn peer(&self, id: PeerId) -> Result<Arc<SemanticPeer>> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(Error::PeerNotFound(id))
    }

    /// Every registered peer, ordered by id.
    pub fn peers(&self) -> Vec<Arc<SemanticPeer>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    pub fn activated_peers(&self) -> Vec<Arc<SemanticPeer>> {
        self.peers().into_iter().filter(|peer| peer.is_activated()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A random activated peer, used as entry point.
    pub fn random_peer(&self) -> Result<Arc<SemanticPeer>> {
        self.activated_peers()
            .into_iter()
            .choose(&mut rand::rng())
            .ok_or_else(|| Error::Config("the network has no activated peer".to_string()))
    }

    /// One hop: the envelope crosses the wire codec, then reaches `to`.
    pub fn send(&self, to: PeerId, envelope: &Envelope) -> Result<Response> {
        let bytes = encode_message(envelope)?;
        let received: Envelope = decode_message(&bytes)?;
        tracing::trace!(to = %to, request = %received.id, bytes = bytes.len(), "hop");
        self.peer(to)?.receive(received)
    }

    pub fn publish(&self, quadruple: Quadruple) -> Result<Response> {
        let coordinate = Coordinate::of_quadruple(&quadruple);
        self.random_peer()?
            .dispatch(Routing::Unicast(coordinate), Request::PublishQuadruple(quadruple))
    }

    /// Route `event` to the peer of its `indexed`-th quadruple.
    pub fn publish_compound_event(&self, event: CompoundEvent, indexed: usize) -> Result<Response> {
        let fact = event.quadruples().get(indexed).ok_or_else(|| {
            Error::InvalidCompoundEvent(format!("no quadruple at index {}", indexed))
        })?;
        let coordinate = Coordinate::of_quadruple(fact);
        self.random_peer()?
            .dispatch(Routing::Unicast(coordinate), Request::PublishCompoundEvent { event, indexed })
    }

    /// Index `subscription` on every peer its leading pattern may match on.
    pub fn index_subscription(&self, subscription: Subscription) -> Result<Response> {
        let constraints = subscription.constraints();
        self.random_peer()?
            .dispatch(Routing::Anycast(constraints), Request::IndexSubscription(subscription))
    }

    pub fn unsubscribe(&self, original_id: SubscriptionId, constraints: Constraints) -> Result<Response> {
        self.random_peer()?
            .dispatch(Routing::Anycast(constraints), Request::Unsubscribe { original_id })
    }

    /// Store `quadruple` on its peer without matching it.
    pub fn add(&self, quadruple: Quadruple) -> Result<Response> {
        let coordinate = Coordinate::of_quadruple(&quadruple);
        self.random_peer()?.dispatch(Routing::Unicast(coordinate), Request::AddQuadruple(quadruple))
    }

    pub fn delete(&self, quadruple: Quadruple) -> Result<Response> {
        let coordinate = Coordinate::of_quadruple(&quadruple);
        self.random_peer()?.dispatch(Routing::Unicast(coordinate), Request::DeleteQuadruple(quadruple))
    }

    pub fn delete_matching(&self, pattern: QuadruplePattern) -> Result<Response> {
        let constraints = pattern.constraints();
        self.random_peer()?.dispatch(Routing::Anycast(constraints), Request::DeleteQuadruples(pattern))
    }

    pub fn find(&self, pattern: QuadruplePattern) -> Result<Response> {
        let constraints = pattern.constraints();
        self.random_peer()?.dispatch(Routing::Anycast(constraints), Request::FindQuadruples(pattern))
    }

    /// Facts stored under `meta_graph` whose hash is not in `known`.
    pub fn reconstruct(&self, meta_graph: Node, known: Vec<String>) -> Result<Response> {
        let constraints = QuadruplePattern::graph(meta_graph.clone()).constraints();
        self.random_peer()?.dispatch(
            Routing::Anycast(constraints),
            Request::ReconstructCompoundEvent { meta_graph, known },
        )
    }

    pub fn index_ephemeral_subscription(
        &self,
        meta_graph: Node,
        subscription_id: SubscriptionId,
        subscriber: &str,
    ) -> Result<Response> {
        let constraints = QuadruplePattern::graph(meta_graph.clone()).constraints();
        self.random_peer()?.dispatch(
            Routing::Anycast(constraints),
            Request::IndexEphemeralSubscription { meta_graph, subscription_id, subscriber: subscriber.to_string() },
        )
    }

    pub fn register_endpoint(&self, address: &str, endpoint: &Arc<dyn SubscriberEndpoint>) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string(), Arc::downgrade(endpoint));
    }

    pub fn unregister_endpoint(&self, address: &str) {
        self.endpoints.write().unwrap_or_else(PoisonError::into_inner).remove(address);
    }

    pub fn set_delivery_filter(&self, filter: Option<Arc<dyn DeliveryFilter>>) {
        for peer in self.peers() {
            peer.set_delivery_filter(filter.clone());
        }
    }

    /// Recompute neighbor tables after the zones of `affected` changed.
    ///
    /// Every affected peer, every peer in `extra` and every current neighbor
    /// of an affected peer is re-evaluated against the fresh zones of all of
    /// them. `departed` is dropped from every table.
    pub fn refresh_neighborhood(&self, affected: &[PeerId], extra: &[PeerId], departed: Option<PeerId>) {
        let mut ids: BTreeSet<PeerId> = affected.iter().chain(extra).copied().collect();
        for id in affected {
            if let Ok(peer) = self.peer(*id) {
                ids.extend(peer.neighbors());
            }
        }
        if let Some(departed) = departed {
            ids.remove(&departed);
        }

        let peers: Vec<Arc<SemanticPeer>> = ids.iter().filter_map(|id| self.peer(*id).ok()).collect();
        let entries: Vec<NeighborEntry> = peers.iter().filter_map(|peer| peer.neighbor_entry()).collect();
        for peer in &peers {
            peer.refresh_neighbors(&entries, departed);
        }
        tracing::debug!(peers = peers.len(), "neighborhood refreshed");
    }

    /// Flush every peer until nothing is buffered or running anywhere for
    /// two passes in a row. Returns false on timeout.
    pub fn settle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut clean_passes = 0;
        while Instant::now() < deadline {
            let peers = self.peers();
            let flushed: usize = peers.iter().map(|peer| peer.flush()).sum();
            if flushed == 0 && peers.iter().all(|peer| peer.is_idle()) {
                clean_passes += 1;
                if clean_passes >= 2 {
                    return true;
                }
            } else {
                clean_passes = 0;
            }
            thread::sleep(SETTLE_POLL);
        }
        tracing::warn!(timeout_ms = timeout.as_millis() as u64, "network did not settle");
        false
    }

    pub fn shutdown(&self) {
        for peer in self.peers() {
            peer.shutdown();
        }
        tracing::info!("network shut down");
    }
}

impl EndpointResolver for Network {
    fn resolve(&self, address: &str) -> Option<Arc<dyn SubscriberEndpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::zone::Zone;

    #[test]
    fn test_bootstrap_partitions_the_space() {
        let network = Network::bootstrap(EventCloudConfig::default(), 6).unwrap();
        let zones: Vec<Zone> = network.activated_peers().iter().filter_map(|p| p.zone()).collect();
        assert_eq!(zones.len(), 6);
        for (i, a) in zones.iter().enumerate() {
            for b in &zones[i + 1..] {
                assert!(!a.intersects(b));
            }
        }
    }

    #[test]
    fn test_unknown_peer() {
        let network = Network::new(EventCloudConfig::default()).unwrap();
        assert!(matches!(network.peer(PeerId(9)), Err(Error::PeerNotFound(PeerId(9)))));
        assert!(network.random_peer().is_err());
    }
}
