use crate::{Error, Result};
use std::time::Duration;

const DEFAULT_SUBSCRIPTIONS_PER_CONNECTION: usize = 5;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_INTERVAL: u64 = 1_000;
const DEFAULT_ACK_TIMEOUT: u64 = 3_000;

/// Configuration options for a [`PubSubMultiplexer`](crate::PubSubMultiplexer)
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Maximum number of channels and patterns hosted by a single pub/sub
    /// connection.
    ///
    /// When every connection of a shard is full, the next subscription
    /// triggers the creation of a new connection.
    ///
    /// The default is 5
    pub subscriptions_per_connection: usize,
    /// Maximum number of connect retries for a user-initiated subscription.
    ///
    /// Reattachment after a topology change is not bounded by this value.
    ///
    /// The default is 3
    pub retry_attempts: u32,
    /// Deadline of a single connect attempt and the delay applied before the
    /// next one.
    ///
    /// The default is 1 second
    pub retry_interval: Duration,
    /// Time to wait for a subscribe or unsubscribe acknowledgement before the
    /// watchdog fires.
    ///
    /// The default is 3 seconds
    pub timeout: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            subscriptions_per_connection: DEFAULT_SUBSCRIPTIONS_PER_CONNECTION,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL),
            timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT),
        }
    }
}

impl PubSubConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.subscriptions_per_connection == 0 {
            return Err(Error::Config(
                "subscriptions_per_connection must be > 0".to_owned(),
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(Error::Config("retry_interval must be > 0".to_owned()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be > 0".to_owned()));
        }
        Ok(())
    }
}
