//! Peer-local storage: the transactional quad-store seam and its Oxigraph backend.

pub mod oxigraph_adapter;
pub mod query_processing;

pub use oxigraph_adapter::{OxigraphDatastore, OxigraphError};
pub use query_processing::{AccessMode, QuadStore, QuadruplePattern, Transaction};
