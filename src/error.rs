//! Error types and result definitions

use thiserror::Error;

use crate::core::encoding::CodecError;
use crate::overlay::zone::ZoneError;
use crate::overlay::PeerId;
use crate::parsing::sparql_decomposer::DecompositionError;
use crate::pubsub::notification::DeliveryError;
use crate::pubsub::subscription::SubscriptionId;
use crate::querying::oxigraph_adapter::OxigraphError;

/// Result type alias for EventCloud operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for EventCloud
#[derive(Error, Debug)]
pub enum Error {
    /// A quad-store transaction failed (find, add, delete or commit)
    #[error("Storage transaction error: {0}")]
    Storage(#[from] OxigraphError),

    /// The continuous query text could not be decomposed
    #[error("Decomposition error: {0}")]
    Decomposition(#[from] DecompositionError),

    /// A join or leave was attempted while another one is in flight
    #[error("Concurrent overlay operation on peer {0}")]
    ConcurrentOverlayOperation(PeerId),

    /// No neighbor qualifies to forward a request
    #[error("Routing dead end at peer {peer}: {reason}")]
    RoutingDeadEnd { peer: PeerId, reason: String },

    /// The subscriber endpoint could not be reached
    #[error("Subscriber unreachable: {0}")]
    SubscriberUnreachable(#[from] DeliveryError),

    /// Invalid zone geometry
    #[error("Zone error: {0}")]
    Zone(#[from] ZoneError),

    /// Wire or JSON encoding failure
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The peer is unknown to the network
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// The operation requires an activated peer
    #[error("Peer {0} is not activated")]
    PeerNotActivated(PeerId),

    /// A join was attempted by a peer that already owns a zone
    #[error("Peer {0} is already activated")]
    AlreadyActivated(PeerId),

    /// The subscription is unknown to this facade
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    /// The leaving peer has no neighbor able to absorb its zone
    #[error("Peer {0} has no mergeable neighbor")]
    NoMergeableNeighbor(PeerId),

    /// The subscription cannot undergo the requested operation
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// A compound event is empty or mixes graphs
    #[error("Invalid compound event: {0}")]
    InvalidCompoundEvent(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
