//! Transport seam for building connections to discovered nodes

use crate::ConnectionError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options applied to every connection a pool creates.
///
/// A `None` timeout means the transport waits indefinitely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Timeout for establishing a connection
    pub connect_timeout: Option<Duration>,
    /// Timeout for a single call attempt
    pub call_timeout: Option<Duration>,
    /// Number of retries after a failed call
    pub max_retries: u32,
    /// Delay before the first retry; doubles with every further retry
    pub retry_backoff: Duration,
    /// Protocol identifier understood by the transport
    pub protocol: String,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            call_timeout: None,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            protocol: "h2".to_string(),
        }
    }
}

/// Builds connection handles bound to a single node address.
///
/// Construction must not block on network I/O for longer than the configured
/// connect timeout.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Handle handed out to callers; clones refer to the same connection
    type Connection: Clone + Send + Sync + 'static;

    /// Create a connection for `address`
    fn connect(
        &self,
        address: &str,
        options: &ChannelOptions,
    ) -> Result<Self::Connection, ConnectionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ChannelOptions::default();
        assert_eq!(options.connect_timeout, None);
        assert_eq!(options.call_timeout, None);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.retry_backoff, Duration::from_millis(100));
        assert_eq!(options.protocol, "h2");
    }
}
