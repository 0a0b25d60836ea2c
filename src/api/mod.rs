//! Public facade of the engine.

pub mod event_cloud;
pub mod put_get;

pub use event_cloud::{EventCloud, Solution, SolutionPayload, SubscribeProxy, SubscriptionHandle};
pub use put_get::PutGetProxy;
