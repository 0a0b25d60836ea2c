use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, PoisonError, RwLock, Weak},
    time::{Duration, Instant},
};

use crate::pubsub::notification::SubscriberEndpoint;

pub type EndpointAddress = String;

#[derive(Debug, Clone)]
pub struct SubscriberRegistryConfig {
    /// Maximum number of endpoints kept
    pub capacity: usize,
    /// Age after which an entry is looked up again
    pub ttl: Duration,
}

impl Default for SubscriberRegistryConfig {
    fn default() -> Self {
        Self { capacity: 1000, ttl: Duration::from_secs(300) }
    }
}

struct CachedEndpoint {
    endpoint: Weak<dyn SubscriberEndpoint>,
    cached_at: Instant,
}

#[derive(Default)]
struct Entries {
    by_address: HashMap<EndpointAddress, CachedEndpoint>,
    insertion_order: VecDeque<EndpointAddress>,
}

/// Cache of resolved subscriber endpoints, bounded in size and age.
///
/// Entries hold weak references: an endpoint dropped by its owner disappears
/// from the cache on the next lookup.
pub struct SubscriberRegistry {
    entries: RwLock<Entries>,
    config: SubscriberRegistryConfig,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::with_config(SubscriberRegistryConfig::default())
    }

    pub fn with_config(config: SubscriberRegistryConfig) -> Self {
        SubscriberRegistry { entries: RwLock::new(Entries::default()), config }
    }

    /// A live, fresh endpoint for `address`, if cached.
    pub fn get(&self, address: &str) -> Option<Arc<dyn SubscriberEndpoint>> {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            let cached = entries.by_address.get(address)?;
            if cached.cached_at.elapsed() <= self.config.ttl {
                if let Some(endpoint) = cached.endpoint.upgrade() {
                    return Some(endpoint);
                }
            }
        }
        self.invalidate(address);
        None
    }

    pub fn insert(&self, address: &str, endpoint: &Arc<dyn SubscriberEndpoint>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.by_address.contains_key(address) {
            while entries.by_address.len() >= self.config.capacity.max(1) {
                match entries.insertion_order.pop_front() {
                    Some(oldest) => {
                        entries.by_address.remove(&oldest);
                    }
                    None => break,
                }
            }
            entries.insertion_order.push_back(address.to_string());
        }
        entries.by_address.insert(
            address.to_string(),
            CachedEndpoint { endpoint: Arc::downgrade(endpoint), cached_at: Instant::now() },
        );
    }

    pub fn invalidate(&self, address: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.by_address.remove(address).is_some() {
            entries.insertion_order.retain(|a| a != address);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::notification::{DeliveryError, Notification};

    struct Sink;

    impl SubscriberEndpoint for Sink {
        fn receive(&self, _notification: Notification) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn sink() -> Arc<dyn SubscriberEndpoint> {
        Arc::new(Sink)
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let registry = SubscriberRegistry::with_config(SubscriberRegistryConfig {
            capacity: 2,
            ttl: Duration::from_secs(60),
        });
        let (a, b, c) = (sink(), sink(), sink());
        registry.insert("a", &a);
        registry.insert("b", &b);
        registry.insert("c", &c);

        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_none());
        assert!(registry.get("c").is_some());
    }

    #[test]
    fn test_dropped_endpoint_is_a_miss() {
        let registry = SubscriberRegistry::new();
        let endpoint = sink();
        registry.insert("a", &endpoint);
        assert!(registry.get("a").is_some());

        drop(endpoint);
        assert!(registry.get("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let registry = SubscriberRegistry::with_config(SubscriberRegistryConfig {
            capacity: 10,
            ttl: Duration::ZERO,
        });
        let endpoint = sink();
        registry.insert("a", &endpoint);
        std::thread::sleep(Duration::from_millis(2));
        assert!(registry.get("a").is_none());
    }
}
