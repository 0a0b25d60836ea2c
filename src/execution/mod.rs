//! Execution Module
//!
//! Threads that run peer work off the caller's stack.
//!
//! # Components
//!
//! - **WorkerPool** - Named worker threads fed through a channel; each peer owns
//!   one for local request handling and one for outgoing dispatch
//! - **ResponseCollector** - Merges the responses of an anycast fan-out

pub mod response_collector;
pub mod worker_pool;

pub use response_collector::ResponseCollector;
pub use worker_pool::WorkerPool;
