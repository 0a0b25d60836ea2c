//! Notifications pushed to subscribers and the endpoint seam they cross.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::core::{Node, Quadruple};
use crate::overlay::PeerId;
use crate::pubsub::matching::Binding;
use crate::pubsub::subscription::{Subscription, SubscriptionId};

/// Identifies one terminal match. Notifications sharing an id are
/// complementary parts of the same solution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId {
    pub original_id: SubscriptionId,
    pub terminal_id: SubscriptionId,
    pub quadruple_hash: String,
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.quadruple_hash.get(..12).unwrap_or(&self.quadruple_hash);
        write!(f, "{}/{}/{}", self.original_id, self.terminal_id, short)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    Signal {
        id: NotificationId,
        source: PeerId,
        meta_graph: Node,
    },
    Binding {
        id: NotificationId,
        source: PeerId,
        meta_graph: Node,
        binding: Binding,
        expected_parts: usize,
    },
    CompoundEvent {
        id: NotificationId,
        source: PeerId,
        meta_graph: Node,
        quadruples: Vec<Quadruple>,
        expected_parts: usize,
    },
}

impl Notification {
    pub fn id(&self) -> &NotificationId {
        match self {
            Notification::Signal { id, .. }
            | Notification::Binding { id, .. }
            | Notification::CompoundEvent { id, .. } => id,
        }
    }

    pub fn source(&self) -> PeerId {
        match self {
            Notification::Signal { source, .. }
            | Notification::Binding { source, .. }
            | Notification::CompoundEvent { source, .. } => *source,
        }
    }

    pub fn meta_graph(&self) -> &Node {
        match self {
            Notification::Signal { meta_graph, .. }
            | Notification::Binding { meta_graph, .. }
            | Notification::CompoundEvent { meta_graph, .. } => meta_graph,
        }
    }

    /// Number of parts making up the full solution.
    pub fn expected_parts(&self) -> usize {
        match self {
            Notification::Signal { .. } => 1,
            Notification::Binding { expected_parts, .. }
            | Notification::CompoundEvent { expected_parts, .. } => *expected_parts,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("no subscriber endpoint under {0}")]
    NotFound(String),
    #[error("subscriber {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },
}

/// The receiving side of notifications.
pub trait SubscriberEndpoint: Send + Sync {
    fn receive(&self, notification: Notification) -> Result<(), DeliveryError>;
}

/// Resolves subscriber addresses to live endpoints.
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, address: &str) -> Option<Arc<dyn SubscriberEndpoint>>;
}

/// Gate applied before a terminal notification leaves the peer.
pub trait DeliveryFilter: Send + Sync {
    fn allow(&self, fact: &Quadruple, subscription: &Subscription) -> bool;
}

/// Strength of the relationship between a publisher and a subscriber, in `[0, 1]`.
pub trait RelationshipStrength: Send + Sync {
    fn strength(&self, source: Option<&str>, destination: Option<&str>) -> f64;
}

/// Lets a notification through when the relationship between the fact's
/// publisher and the subscription's destination reaches a threshold.
pub struct ThresholdFilter {
    threshold: f64,
    strengths: Arc<dyn RelationshipStrength>,
}

impl ThresholdFilter {
    pub fn new(threshold: f64, strengths: Arc<dyn RelationshipStrength>) -> Self {
        Self { threshold, strengths }
    }
}

impl DeliveryFilter for ThresholdFilter {
    fn allow(&self, fact: &Quadruple, subscription: &Subscription) -> bool {
        let strength =
            self.strengths.strength(fact.publication_source(), subscription.destination());
        tracing::debug!(
            source = ?fact.publication_source(),
            destination = ?subscription.destination(),
            threshold = self.threshold,
            strength,
            "relationship strength checked"
        );
        strength >= self.threshold
    }
}
