//! Delivery settings.
//!
//! The crate does not read the environment or files itself. Applications
//! deserialize a [`DeliveryConfig`] from whatever source they use (durations
//! are integer milliseconds) or build one with the `with_*` setters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by the publisher, the retry policy and the consumer loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Redeliveries allowed after the first attempt, unless the producer
    /// overrides it per message.
    pub max_attempts: u32,
    /// Upper bound of envelopes processed concurrently by one consumer loop.
    pub prefetch: usize,
    #[serde(with = "millis")]
    pub publish_confirm_timeout: Duration,
    #[serde(with = "millis")]
    pub handler_timeout: Duration,
    #[serde(with = "millis")]
    pub backoff_base: Duration,
    #[serde(with = "millis")]
    pub backoff_cap: Duration,
    /// How long in-flight handlers may keep running after shutdown is requested.
    #[serde(with = "millis")]
    pub shutdown_grace: Duration,
    /// Pause before subscribing again after the delivery stream broke.
    #[serde(with = "millis")]
    pub resubscribe_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            prefetch: 10,
            publish_confirm_timeout: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            resubscribe_delay: Duration::from_secs(1),
        }
    }
}

impl DeliveryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_publish_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.publish_confirm_timeout = timeout;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set the exponential backoff base and its cap.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
