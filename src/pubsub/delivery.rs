//! Pushes notifications to subscriber endpoints and counts failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::overlay::PeerId;
use crate::pubsub::notification::{DeliveryError, EndpointResolver, Notification, SubscriberEndpoint};
use crate::pubsub::subscription::SubscriptionId;
use crate::registry::subscriber_registry::{SubscriberRegistry, SubscriberRegistryConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Failed; `failures` consecutive failures so far
    Failed { failures: u32, error: DeliveryError },
    /// The failure ceiling was reached: the subscription must be dropped
    GaveUp { error: DeliveryError },
}

pub struct NotificationDelivery {
    peer: PeerId,
    registry: SubscriberRegistry,
    resolver: Weak<dyn EndpointResolver>,
    failures: Mutex<HashMap<SubscriptionId, u32>>,
    max_failures: u32,
}

impl NotificationDelivery {
    pub fn new(
        peer: PeerId,
        resolver: Weak<dyn EndpointResolver>,
        registry: SubscriberRegistryConfig,
        max_failures: u32,
    ) -> Self {
        Self {
            peer,
            registry: SubscriberRegistry::with_config(registry),
            resolver,
            failures: Mutex::new(HashMap::new()),
            max_failures: max_failures.max(1),
        }
    }

    fn resolve(&self, address: &str) -> Result<Arc<dyn SubscriberEndpoint>, DeliveryError> {
        if let Some(endpoint) = self.registry.get(address) {
            return Ok(endpoint);
        }
        let endpoint = self
            .resolver
            .upgrade()
            .and_then(|resolver| resolver.resolve(address))
            .ok_or_else(|| DeliveryError::NotFound(address.to_string()))?;
        self.registry.insert(address, &endpoint);
        Ok(endpoint)
    }

    /// Deliver one notification of the chain `original_id` to `address`.
    pub fn deliver(
        &self,
        address: &str,
        original_id: SubscriptionId,
        notification: Notification,
    ) -> DeliveryOutcome {
        let notification_id = notification.id().clone();
        let result = self.resolve(address).and_then(|endpoint| endpoint.receive(notification));
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);

        match result {
            Ok(()) => {
                failures.remove(&original_id);
                tracing::debug!(peer = %self.peer, notification = %notification_id, "notification delivered");
                DeliveryOutcome::Delivered
            }
            Err(error) => {
                self.registry.invalidate(address);
                let count = failures.entry(original_id).or_insert(0);
                *count += 1;
                let count = *count;
                tracing::warn!(
                    peer = %self.peer,
                    subscription = %original_id,
                    failures = count,
                    error = %error,
                    "notification delivery failed"
                );
                if count >= self.max_failures {
                    failures.remove(&original_id);
                    DeliveryOutcome::GaveUp { error }
                } else {
                    DeliveryOutcome::Failed { failures: count, error }
                }
            }
        }
    }

    pub fn failures(&self, original_id: SubscriptionId) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&original_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Node;
    use crate::pubsub::notification::NotificationId;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flaky {
        up: AtomicBool,
    }

    impl SubscriberEndpoint for Flaky {
        fn receive(&self, _notification: Notification) -> Result<(), DeliveryError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(DeliveryError::Unreachable { address: "flaky".into(), reason: "down".into() })
            }
        }
    }

    struct Single(Arc<Flaky>);

    impl EndpointResolver for Single {
        fn resolve(&self, address: &str) -> Option<Arc<dyn SubscriberEndpoint>> {
            (address == "flaky").then(|| Arc::clone(&self.0) as Arc<dyn SubscriberEndpoint>)
        }
    }

    fn signal() -> Notification {
        Notification::Signal {
            id: NotificationId {
                original_id: SubscriptionId(1),
                terminal_id: SubscriptionId(1),
                quadruple_hash: "00".into(),
            },
            source: PeerId(0),
            meta_graph: Node::iri("http://ex.org/g"),
        }
    }

    #[test]
    fn test_gives_up_after_consecutive_failures() {
        let endpoint = Arc::new(Flaky { up: AtomicBool::new(false) });
        let resolver: Arc<dyn EndpointResolver> = Arc::new(Single(Arc::clone(&endpoint)));
        let delivery = NotificationDelivery::new(
            PeerId(0),
            Arc::downgrade(&resolver),
            SubscriberRegistryConfig::default(),
            3,
        );
        let id = SubscriptionId(1);

        assert!(matches!(delivery.deliver("flaky", id, signal()), DeliveryOutcome::Failed { failures: 1, .. }));
        endpoint.up.store(true, Ordering::SeqCst);
        assert_eq!(delivery.deliver("flaky", id, signal()), DeliveryOutcome::Delivered);
        assert_eq!(delivery.failures(id), 0);

        endpoint.up.store(false, Ordering::SeqCst);
        delivery.deliver("flaky", id, signal());
        delivery.deliver("flaky", id, signal());
        assert!(matches!(delivery.deliver("flaky", id, signal()), DeliveryOutcome::GaveUp { .. }));
        assert_eq!(delivery.failures(id), 0);
    }

    #[test]
    fn test_unknown_address_is_a_failure() {
        let resolver: Arc<dyn EndpointResolver> =
            Arc::new(Single(Arc::new(Flaky { up: AtomicBool::new(true) })));
        let delivery = NotificationDelivery::new(
            PeerId(0),
            Arc::downgrade(&resolver),
            SubscriberRegistryConfig::default(),
            1,
        );
        assert!(matches!(
            delivery.deliver("nobody", SubscriptionId(1), signal()),
            DeliveryOutcome::GaveUp { error: DeliveryError::NotFound(_) }
        ));
    }
}
