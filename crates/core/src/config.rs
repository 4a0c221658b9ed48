use std::time::Duration;

/// Client-side session settings.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// WebSocket URL of the relay gateway, e.g. `ws://localhost:3000/realtime`.
    pub gateway_url: String,
    /// Upper bound on the whole connect sequence: socket open plus the
    /// gateway's `session.connected` acknowledgment.
    pub connect_timeout: Duration,
    /// Upper bound on opening the socket alone.
    pub transport_timeout: Duration,
    /// How many `session.initialize` frames are sent during one handshake
    /// before an upstream failure is treated as fatal.
    pub initialize_attempts: u32,
}

impl SessionConfig {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            connect_timeout: Duration::from_secs(15),
            transport_timeout: Duration::from_secs(10),
            initialize_attempts: 3,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = timeout;
        self
    }

    pub fn with_initialize_attempts(mut self, attempts: u32) -> Self {
        self.initialize_attempts = attempts.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_builders() {
        let config = SessionConfig::new("ws://localhost:3000/realtime");
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.transport_timeout, Duration::from_secs(10));
        assert_eq!(config.initialize_attempts, 3);

        let config = config
            .with_connect_timeout(Duration::from_millis(500))
            .with_initialize_attempts(0);
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.initialize_attempts, 1);
    }
}
