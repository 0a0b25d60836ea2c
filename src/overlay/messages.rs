//! Requests exchanged between peers and the envelope that carries them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::{CompoundEvent, Node, Quadruple};
use crate::overlay::coordinate::{Constraints, Coordinate};
use crate::overlay::PeerId;
use crate::pubsub::notification::NotificationId;
use crate::pubsub::subscription::{NotificationType, Subscription, SubscriptionId};
use crate::querying::query_processing::QuadruplePattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub origin: PeerId,
    pub sequence: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.sequence)
    }
}

/// How an envelope travels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Routing {
    /// To the single peer whose zone contains the coordinate
    Unicast(Coordinate),
    /// To every peer whose zone satisfies the constraints
    Anycast(Constraints),
    /// Straight to a known peer
    Direct(PeerId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    PublishQuadruple(Quadruple),
    /// A compound event routed by its `indexed`-th quadruple
    PublishCompoundEvent { event: CompoundEvent, indexed: usize },
    IndexSubscription(Subscription),
    /// Remove every subscription of the chain started by `original_id`
    Unsubscribe { original_id: SubscriptionId },
    /// Ask a stub peer to deliver its part of a solution
    RetrieveSubSolution {
        notification_id: NotificationId,
        subscription_id: SubscriptionId,
        quadruple_hash: String,
        expected_parts: usize,
        subscriber: String,
        kind: NotificationType,
    },
    /// Store a fact without matching it
    AddQuadruple(Quadruple),
    DeleteQuadruple(Quadruple),
    /// Remove the facts matching a pattern; answered with the removed facts
    DeleteQuadruples(QuadruplePattern),
    FindQuadruples(QuadruplePattern),
    /// Facts stored under exactly `meta_graph` whose hash is not in `known`
    ReconstructCompoundEvent { meta_graph: Node, known: Vec<String> },
    /// Push the facts of `meta_graph`, stored and to come, to `subscriber`
    IndexEphemeralSubscription {
        meta_graph: Node,
        subscription_id: SubscriptionId,
        subscriber: String,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::PublishQuadruple(_) => "publish-quadruple",
            Request::PublishCompoundEvent { .. } => "publish-compound-event",
            Request::IndexSubscription(_) => "index-subscription",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::RetrieveSubSolution { .. } => "retrieve-sub-solution",
            Request::AddQuadruple(_) => "add-quadruple",
            Request::DeleteQuadruple(_) => "delete-quadruple",
            Request::DeleteQuadruples(_) => "delete-quadruples",
            Request::FindQuadruples(_) => "find-quadruples",
            Request::ReconstructCompoundEvent { .. } => "reconstruct-compound-event",
            Request::IndexEphemeralSubscription { .. } => "index-ephemeral-subscription",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: RequestId,
    pub routing: Routing,
    pub request: Request,
    /// Peers visited so far, in order
    pub routing_list: Vec<PeerId>,
}

impl Envelope {
    pub fn new(id: RequestId, routing: Routing, request: Request) -> Self {
        Self { id, routing, request, routing_list: Vec::new() }
    }

    pub fn hops(&self) -> usize {
        self.routing_list.len()
    }

    pub fn visited(&self, peer: PeerId) -> bool {
        self.routing_list.contains(&peer)
    }

    /// Copy continuing from `via`.
    pub fn forwarded_by(&self, via: PeerId) -> Self {
        let mut next = self.clone();
        next.routing_list.push(via);
        next
    }
}

/// Outcome of a request, merged along the anycast tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Peers that handled the request locally
    pub peers_reached: usize,
    /// Longest path taken
    pub hops: usize,
    /// Subscriptions or facts removed
    pub removed: usize,
    /// Facts gathered by a put/get request
    pub quadruples: Vec<Quadruple>,
}

impl Response {
    pub fn handled(hops: usize) -> Self {
        Self { peers_reached: 1, hops, ..Self::default() }
    }

    pub fn with_quadruples(hops: usize, quadruples: Vec<Quadruple>) -> Self {
        Self { quadruples, ..Self::handled(hops) }
    }

    pub fn merge(&mut self, other: &Response) {
        self.peers_reached += other.peers_reached;
        self.hops = self.hops.max(other.hops);
        self.removed += other.removed;
        self.quadruples.extend(other.quadruples.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::encoding::{decode_message, encode_message};

    #[test]
    fn test_envelope_survives_the_wire() {
        let quadruple = Quadruple::new(
            Node::iri("http://ex.org/g"),
            Node::iri("http://ex.org/s"),
            Node::iri("http://ex.org/p"),
            Node::literal("o"),
        )
        .with_publication_time(7);
        let envelope = Envelope::new(
            RequestId { origin: PeerId(1), sequence: 3 },
            Routing::Unicast(Coordinate::of_quadruple(&quadruple)),
            Request::PublishQuadruple(quadruple),
        )
        .forwarded_by(PeerId(1));

        let bytes = encode_message(&envelope).unwrap();
        let decoded: Envelope = decode_message(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.hops(), 1);
        assert!(decoded.visited(PeerId(1)));
    }

    #[test]
    fn test_response_merge() {
        let fact = Quadruple::new(
            Node::iri("http://ex.org/g"),
            Node::iri("http://ex.org/s"),
            Node::iri("http://ex.org/p"),
            Node::literal("o"),
        );
        let mut total = Response::handled(2);
        total.merge(&Response { peers_reached: 2, hops: 5, removed: 3, quadruples: vec![fact.clone()] });
        assert_eq!(
            total,
            Response { peers_reached: 3, hops: 5, removed: 3, quadruples: vec![fact] }
        );
    }
}
