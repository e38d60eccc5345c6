/// Seconds a command waits for its reply unless reconfigured.
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// QoS passed through to every publish.
    pub qos: u8,
    pub response_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            qos: 0,
            response_timeout_secs: DEFAULT_RESPONSE_TIMEOUT_SECS,
        }
    }
}

impl SessionConfig {
    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_response_timeout_secs(mut self, secs: u64) -> Self {
        self.response_timeout_secs = secs;
        self
    }
}

/// Whether a session drives its transport's `serve`/`close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOwnership {
    Owned,
    /// Supplied by the caller and possibly shared with other consumers.
    Shared,
}
