//! Configuration of an EventCloud network and its peers.
//!
//! Every field has a default, so a TOML document only needs the keys it
//! overrides:
//!
//! ```toml
//! matching_algorithm = "compound-event"
//! subscriber_max_failures = 5
//!
//! [quadruples]
//! buffer_size = 256
//! flush_interval_ms = 50
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::overlay::coordinate::SEMANTIC_DIMENSIONS;
use crate::registry::subscriber_registry::SubscriberRegistryConfig;

/// Buffering thresholds of one operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayerSettings {
    /// Items buffered before a flush is forced
    pub buffer_size: usize,
    /// Maximum time an item waits in the buffer
    pub flush_interval_ms: u64,
}

impl DelayerSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for DelayerSettings {
    fn default() -> Self {
        Self { buffer_size: 64, flush_interval_ms: 100 }
    }
}

/// How compound events are matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchingAlgorithm {
    /// Events are split into facts, subscriptions are rewritten fact by fact
    #[default]
    FactByFact,
    /// Events are matched as a unit on the peers of their facts
    CompoundEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventCloudConfig {
    pub dimensions: usize,
    pub quadruples: DelayerSettings,
    pub subscriptions: DelayerSettings,
    pub compound_events: DelayerSettings,
    pub matching_algorithm: MatchingAlgorithm,
    /// Consecutive delivery failures before a subscription is dropped
    pub subscriber_max_failures: u32,
    pub subscriber_cache_capacity: usize,
    pub subscriber_cache_ttl_ms: u64,
    pub handler_pool_size: usize,
    pub dispatch_pool_size: usize,
    pub max_routing_hops: usize,
    /// Anycast request ids remembered per peer for deduplication
    pub received_requests_capacity: usize,
    /// Threshold of the relationship-strength delivery filter
    pub social_filter_threshold: f64,
}

impl Default for EventCloudConfig {
    fn default() -> Self {
        Self {
            dimensions: SEMANTIC_DIMENSIONS,
            quadruples: DelayerSettings::default(),
            subscriptions: DelayerSettings::default(),
            compound_events: DelayerSettings::default(),
            matching_algorithm: MatchingAlgorithm::default(),
            subscriber_max_failures: 3,
            subscriber_cache_capacity: 1000,
            subscriber_cache_ttl_ms: 300_000,
            handler_pool_size: 2,
            dispatch_pool_size: 4,
            max_routing_hops: 1024,
            received_requests_capacity: 10_000,
            social_filter_threshold: 0.5,
        }
    }
}

impl EventCloudConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions != SEMANTIC_DIMENSIONS {
            return Err(Error::Config(format!(
                "quadruples map to {} dimensions, got {}",
                SEMANTIC_DIMENSIONS, self.dimensions
            )));
        }
        for (name, settings) in [
            ("quadruples", &self.quadruples),
            ("subscriptions", &self.subscriptions),
            ("compound_events", &self.compound_events),
        ] {
            if settings.buffer_size == 0 {
                return Err(Error::Config(format!("{}.buffer_size must be positive", name)));
            }
            if settings.flush_interval_ms == 0 {
                return Err(Error::Config(format!("{}.flush_interval_ms must be positive", name)));
            }
        }
        if self.subscriber_max_failures == 0 {
            return Err(Error::Config("subscriber_max_failures must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.social_filter_threshold) {
            return Err(Error::Config(format!(
                "social_filter_threshold {} is outside [0, 1]",
                self.social_filter_threshold
            )));
        }
        Ok(())
    }

    pub fn subscriber_registry(&self) -> SubscriberRegistryConfig {
        SubscriberRegistryConfig {
            capacity: self.subscriber_cache_capacity,
            ttl: Duration::from_millis(self.subscriber_cache_ttl_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EventCloudConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_other_dimension_counts() {
        let config = EventCloudConfig { dimensions: 3, ..EventCloudConfig::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            EventCloudConfig::from_toml_str("matching_algorithm = \"unknown\""),
            Err(Error::Config(_))
        ));
    }
}
