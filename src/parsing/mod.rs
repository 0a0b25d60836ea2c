//! Parsing of continuous queries and N-Quads input

pub mod continuous_query;
pub mod rdf_parser;
pub mod sparql_decomposer;

pub use continuous_query::{AtomicQuery, ContinuousQuery, TermPattern, TriplePattern};
pub use sparql_decomposer::{Decomposer, DecompositionError, SparqlDecomposer};
