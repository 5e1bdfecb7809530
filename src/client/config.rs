use std::time::Duration;

use super::error::ClientError;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256_000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the broker.
    pub endpoint: String,
    /// Upper bound on waiting for any single response.
    pub send_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Rejects an empty endpoint and fills zero values with defaults.
    pub fn validate(mut self) -> Result<Self, ClientError> {
        if self.endpoint.trim().is_empty() {
            return Err(ClientError::InvalidConfig("endpoint must be set".into()));
        }
        if self.send_timeout.is_zero() {
            self.send_timeout = DEFAULT_SEND_TIMEOUT;
        }
        if self.max_frame_bytes == 0 {
            self.max_frame_bytes = DEFAULT_MAX_FRAME_BYTES;
        }
        Ok(self)
    }
}
