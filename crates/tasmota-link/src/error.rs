use std::time::Duration;

use thiserror::Error;
use transport_bus::BusError;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum LinkError {
    /// A presence subscription could not be established during start.
    #[error("presence subscription on {filter} failed: {source}")]
    Setup {
        filter: String,
        #[source]
        source: BusError,
    },
    /// No reply arrived in time. A failed command publish is kept as context.
    #[error("operation not completed in {} seconds", timeout.as_secs())]
    Timeout {
        timeout: Duration,
        publish_error: Option<BusError>,
    },
    #[error("session closed while waiting on {topic}")]
    Cancelled { topic: String },
    #[error(transparent)]
    Transport(#[from] BusError),
    #[error("malformed response on {topic}: {reason}")]
    MalformedResponse { topic: String, reason: String },
    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
}

impl LinkError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LinkError::Cancelled { .. })
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
