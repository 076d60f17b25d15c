//! Session configuration.
//!
//! [`SessionConfig`] gathers the timing and capacity knobs used by transport
//! workers and the dispatcher. Values are validated once, when the builder
//! finishes; loading them from files or the environment is left to the host
//! application.

use std::time::Duration;

use thiserror::Error;

use crate::frame::DEFAULT_BUFFER_CAPACITY;

/// Default delay between transport polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Default wait for an outbound frame before the write loop checks for
/// shutdown again.
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(50);
/// Default number of retries for a transiently failing write.
pub const DEFAULT_WRITE_RETRIES: u32 = 3;
/// Default capacity of the shared inbound frame queue.
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;
/// Default capacity of each transport's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 128;
/// Default capacity of the raw frame passthrough channel.
pub const DEFAULT_PASSTHROUGH_CAPACITY: usize = 64;
/// Default age after which a cached property is requested again.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(1);
/// Default silence after which a module counts as disconnected.
pub const DEFAULT_MODULE_TIMEOUT: Duration = Duration::from_secs(2);
/// Default period of the dispatcher's maintenance tick.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(250);

/// Errors returned by [`SessionConfigBuilder::build`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A queue or buffer capacity was zero.
    #[error("{name} must be greater than zero")]
    ZeroCapacity {
        /// Setting that was rejected.
        name: &'static str,
    },
    /// A duration was zero.
    #[error("{name} must be a non-zero duration")]
    ZeroDuration {
        /// Setting that was rejected.
        name: &'static str,
    },
    /// The expected module count was zero.
    #[error("expected module count must be at least one")]
    NoExpectedModules,
}

/// Validated settings for a [`Session`](crate::session::Session).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    poll_interval: Duration,
    dequeue_timeout: Duration,
    write_retries: u32,
    buffer_capacity: usize,
    inbound_capacity: usize,
    outbound_capacity: usize,
    passthrough_capacity: usize,
    freshness_window: Duration,
    module_timeout: Duration,
    maintenance_interval: Duration,
    expected_modules: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            write_retries: DEFAULT_WRITE_RETRIES,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            passthrough_capacity: DEFAULT_PASSTHROUGH_CAPACITY,
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            module_timeout: DEFAULT_MODULE_TIMEOUT,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            expected_modules: None,
        }
    }
}

impl SessionConfig {
    /// Start from the defaults.
    #[must_use]
    pub fn builder() -> SessionConfigBuilder { SessionConfigBuilder::default() }

    /// Delay between transport polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration { self.poll_interval }

    /// Outbound dequeue timeout.
    #[must_use]
    pub fn dequeue_timeout(&self) -> Duration { self.dequeue_timeout }

    /// Retries for transient write failures.
    #[must_use]
    pub fn write_retries(&self) -> u32 { self.write_retries }

    /// Frame buffer capacity per transport.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize { self.buffer_capacity }

    /// Shared inbound queue capacity.
    #[must_use]
    pub fn inbound_capacity(&self) -> usize { self.inbound_capacity }

    /// Per-transport outbound queue capacity.
    #[must_use]
    pub fn outbound_capacity(&self) -> usize { self.outbound_capacity }

    /// Passthrough channel capacity.
    #[must_use]
    pub fn passthrough_capacity(&self) -> usize { self.passthrough_capacity }

    /// Age after which a cached property is stale.
    #[must_use]
    pub fn freshness_window(&self) -> Duration { self.freshness_window }

    /// Silence after which a module is disconnected.
    #[must_use]
    pub fn module_timeout(&self) -> Duration { self.module_timeout }

    /// Maintenance tick period.
    #[must_use]
    pub fn maintenance_interval(&self) -> Duration { self.maintenance_interval }

    /// Module count the topology must reach to be complete.
    #[must_use]
    pub fn expected_modules(&self) -> Option<usize> { self.expected_modules }
}

/// Builder for [`SessionConfig`].
///
/// ```
/// use std::time::Duration;
///
/// use modilink::config::SessionConfig;
///
/// let config = SessionConfig::builder()
///     .freshness_window(Duration::from_millis(500))
///     .expected_modules(Some(4))
///     .build()
///     .expect("valid config");
/// assert_eq!(config.expected_modules(), Some(4));
/// ```
#[derive(Clone, Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

macro_rules! setter {
    ($(#[$doc:meta])* $name:ident: $ty:ty) => {
        $(#[$doc])*
        #[must_use]
        pub fn $name(mut self, value: $ty) -> Self {
            self.config.$name = value;
            self
        }
    };
}

impl SessionConfigBuilder {
    setter!(
        /// Set the delay between transport polls.
        poll_interval: Duration
    );
    setter!(
        /// Set how long the write loop waits for an outbound frame.
        dequeue_timeout: Duration
    );
    setter!(
        /// Set how often a transiently failing write is retried.
        write_retries: u32
    );
    setter!(
        /// Set the frame buffer capacity in bytes.
        buffer_capacity: usize
    );
    setter!(
        /// Set the shared inbound queue capacity.
        inbound_capacity: usize
    );
    setter!(
        /// Set each transport's outbound queue capacity.
        outbound_capacity: usize
    );
    setter!(
        /// Set the passthrough channel capacity.
        passthrough_capacity: usize
    );
    setter!(
        /// Set the age after which cached properties are requested again.
        freshness_window: Duration
    );
    setter!(
        /// Set the silence after which a module counts as disconnected.
        module_timeout: Duration
    );
    setter!(
        /// Set the maintenance tick period.
        maintenance_interval: Duration
    );
    setter!(
        /// Set the module count required for a complete topology.
        expected_modules: Option<usize>
    );

    /// Validate and produce the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any capacity or duration is zero, or if the
    /// expected module count is `Some(0)`.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let c = self.config;
        for (name, capacity) in [
            ("buffer_capacity", c.buffer_capacity),
            ("inbound_capacity", c.inbound_capacity),
            ("outbound_capacity", c.outbound_capacity),
            ("passthrough_capacity", c.passthrough_capacity),
        ] {
            if capacity == 0 {
                return Err(ConfigError::ZeroCapacity { name });
            }
        }
        for (name, duration) in [
            ("poll_interval", c.poll_interval),
            ("dequeue_timeout", c.dequeue_timeout),
            ("freshness_window", c.freshness_window),
            ("module_timeout", c.module_timeout),
            ("maintenance_interval", c.maintenance_interval),
        ] {
            if duration.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }
        if c.expected_modules == Some(0) {
            return Err(ConfigError::NoExpectedModules);
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::builder().build().expect("defaults");
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.buffer_capacity(), 2_500_000);
        assert_eq!(config.freshness_window(), Duration::from_secs(1));
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.expected_modules(), None);
    }

    #[rstest]
    #[case::buffer(SessionConfig::builder().buffer_capacity(0), ConfigError::ZeroCapacity { name: "buffer_capacity" })]
    #[case::outbound(SessionConfig::builder().outbound_capacity(0), ConfigError::ZeroCapacity { name: "outbound_capacity" })]
    #[case::poll(SessionConfig::builder().poll_interval(Duration::ZERO), ConfigError::ZeroDuration { name: "poll_interval" })]
    #[case::window(SessionConfig::builder().freshness_window(Duration::ZERO), ConfigError::ZeroDuration { name: "freshness_window" })]
    #[case::expected(SessionConfig::builder().expected_modules(Some(0)), ConfigError::NoExpectedModules)]
    fn invalid_values_are_rejected(#[case] builder: SessionConfigBuilder, #[case] expected: ConfigError) {
        assert_eq!(builder.build(), Err(expected));
    }

    #[test]
    fn zero_retries_are_allowed() {
        let config = SessionConfig::builder()
            .write_retries(0)
            .build()
            .expect("no retries is valid");
        assert_eq!(config.write_retries(), 0);
    }
}
