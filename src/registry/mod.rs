//! Cache of subscriber endpoints resolved by address.

pub mod subscriber_registry;

pub use subscriber_registry::{SubscriberRegistry, SubscriberRegistryConfig};
