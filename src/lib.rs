//! # EventCloud
//!
//! EventCloud is a distributed publish/subscribe engine for RDF quadruples.
//!
//! Quadruples and continuous SPARQL subscriptions are placed on the peers of a
//! four-dimensional content-addressable overlay (graph, subject, predicate,
//! object). A subscription is decomposed into a chain of atomic patterns; the
//! peer owning the first pattern matches incoming facts, rewrites the
//! subscription with the bound values and forwards the shorter query to the peer
//! owning the next pattern. The last peer in the chain notifies the subscriber.
//!
//! ## Features
//!
//! - Zone-partitioned overlay with unicast and anycast routing
//! - Incremental matching of subscriptions through rewriting
//! - Buffered commit and matching per peer (delayers)
//! - Signal, binding and compound event notifications
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventcloud::api::event_cloud::EventCloud;
//! use eventcloud::config::EventCloudConfig;
//! use eventcloud::core::{Node, Quadruple};
//! use eventcloud::pubsub::subscription::NotificationType;
//!
//! fn example() -> eventcloud::Result<()> {
//!     let cloud = EventCloud::new(EventCloudConfig::default(), 4)?;
//!     let handle = cloud.subscribe(
//!         "SELECT ?g WHERE { GRAPH ?g { <http://ex.org/s> <http://ex.org/p> ?o } }",
//!         NotificationType::Binding,
//!     )?;
//!     cloud.publish(Quadruple::new(
//!         Node::iri("http://ex.org/g1"),
//!         Node::iri("http://ex.org/s"),
//!         Node::iri("http://ex.org/p"),
//!         Node::literal("42"),
//!     ))?;
//!     println!("{:?}", handle.receive());
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::new_without_default)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

/// Public facade: publish, subscribe, unsubscribe
pub mod api;

/// Configuration structures and loading
pub mod config;

/// Core data structures and types
pub mod core;

/// Buffered commit and matching
pub mod delayers;

pub mod error;

/// Worker pools and response fan-in
pub mod execution;

/// Content-addressable overlay: zones, routing, peers
pub mod overlay;

/// Module for parsing continuous queries and N-Quads input
pub mod parsing;

/// Subscriptions, rewriting, matching and notifications
pub mod pubsub;

/// Quad-store abstraction and the Oxigraph implementation
pub mod querying;

/// Subscriber endpoint registry
pub mod registry;

// Re-export commonly used types
pub use error::{Error, Result};
