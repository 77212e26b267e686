use std::time::Duration;

use distobj_common::transport::DEFAULT_MAX_FRAME_SIZE;

/// Per-connection configuration.
///
/// # Fields
///
/// - `reply_timeout`: How long a request waits for its reply before failing
///   with `ConnectionLost`
/// - `max_message_size`: Largest envelope this side will send
///
/// # Default Configuration
///
/// - `reply_timeout`: 30 seconds
/// - `max_message_size`: 100 MB
///
/// # Example
///
/// ```rust
/// use distobj_connection::ConnectionConfig;
/// use std::time::Duration;
///
/// let config = ConnectionConfig::default().with_reply_timeout(Duration::from_secs(5));
/// assert_eq!(config.reply_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum time to wait for a reply
    pub reply_timeout: Duration,
    /// Largest envelope accepted for sending, in bytes
    pub max_message_size: usize,
}

impl ConnectionConfig {
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(30),
            max_message_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
