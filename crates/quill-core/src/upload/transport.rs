//! Delivery of event batches to the ingestion boundary.
//!
//! A [`Transport`] acknowledges a batch only once it is durably stored.
//! Everything else, including a 4xx, is reported as an error and the
//! uploader keeps the batch queued.

use std::time::Duration;

use crate::event::EventBatch;
use crate::store::{EventStore, StoreError};

/// Why a batch was not acknowledged.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("server rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("server error (status {status})")]
    Server { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("local store failed: {0}")]
    Store(#[from] StoreError),
}

impl TransportError {
    /// A 4xx response. Retrying will not help without intervention.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Sends event batches.
pub trait Transport {
    /// Upload a batch, returning `Ok` only once it is durably stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch was not acknowledged; the caller keeps
    /// it queued and retries.
    fn send_batch(&mut self, batch: &EventBatch) -> Result<(), TransportError>;

    /// Fire-and-forget delivery used while the page is unloading.
    ///
    /// Returns whether the request was handed off, not whether it was stored.
    fn send_beacon(&mut self, batch: &EventBatch) -> bool;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_batch(&mut self, batch: &EventBatch) -> Result<(), TransportError> {
        (**self).send_batch(batch)
    }

    fn send_beacon(&mut self, batch: &EventBatch) -> bool {
        (**self).send_beacon(batch)
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// `POST {base}/events` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
    beacon_agent: ureq::Agent,
    events_url: String,
}

impl HttpTransport {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const BEACON_TIMEOUT: Duration = Duration::from_secs(2);

    /// Create a transport for a server rooted at `base_url`.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, Self::DEFAULT_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(timeout)
                .user_agent("quill-recorder")
                .build(),
            beacon_agent: ureq::AgentBuilder::new()
                .timeout(Self::BEACON_TIMEOUT)
                .user_agent("quill-recorder")
                .build(),
            events_url: format!("{}/events", base_url.trim_end_matches('/')),
        }
    }

    #[must_use]
    pub fn events_url(&self) -> &str {
        &self.events_url
    }
}

impl Transport for HttpTransport {
    fn send_batch(&mut self, batch: &EventBatch) -> Result<(), TransportError> {
        let body = serde_json::to_value(batch)?;
        match self.agent.post(&self.events_url).send_json(body) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, response)) if status < 500 => {
                let body = response.into_string().unwrap_or_default();
                Err(TransportError::Rejected { status, body })
            }
            Err(ureq::Error::Status(status, _)) => Err(TransportError::Server { status }),
            Err(ureq::Error::Transport(err)) => Err(TransportError::Network(err.to_string())),
        }
    }

    fn send_beacon(&mut self, batch: &EventBatch) -> bool {
        let Ok(body) = serde_json::to_value(batch) else {
            return false;
        };
        match self.beacon_agent.post(&self.events_url).send_json(body) {
            Ok(_) | Err(ureq::Error::Status(..)) => true,
            Err(ureq::Error::Transport(err)) => {
                tracing::debug!(error = %err, "beacon not delivered");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Ingests straight into a local [`EventStore`].
#[derive(Debug)]
pub struct StoreTransport<'a> {
    store: &'a EventStore,
}

impl<'a> StoreTransport<'a> {
    #[must_use]
    pub const fn new(store: &'a EventStore) -> Self {
        Self { store }
    }
}

impl Transport for StoreTransport<'_> {
    fn send_batch(&mut self, batch: &EventBatch) -> Result<(), TransportError> {
        self.store.ingest(batch)?;
        Ok(())
    }

    fn send_beacon(&mut self, batch: &EventBatch) -> bool {
        self.store.ingest(batch).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_url_strips_trailing_slash() {
        let t = HttpTransport::new("http://127.0.0.1:8787/");
        assert_eq!(t.events_url(), "http://127.0.0.1:8787/events");
    }

    #[test]
    fn only_rejections_are_client_errors() {
        let rejected = TransportError::Rejected {
            status: 422,
            body: String::new(),
        };
        assert!(rejected.is_client_error());
        assert!(!TransportError::Server { status: 503 }.is_client_error());
        assert!(!TransportError::Network("refused".into()).is_client_error());
    }

    #[test]
    fn unreachable_server_is_a_network_error() {
        let mut t = HttpTransport::with_timeout("http://127.0.0.1:9", Duration::from_millis(200));
        let batch = EventBatch {
            attempt_id: 1,
            events: Vec::new(),
        };
        let err = t.send_batch(&batch).unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
        assert!(!t.send_beacon(&batch));
    }
}
