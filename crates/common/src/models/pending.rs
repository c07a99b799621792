use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::protocol::ResponsePayload;

/// A relayed request waiting for its `Response` message
#[derive(Debug)]
pub struct PendingRequest {
    tx: oneshot::Sender<ResponsePayload>,
    created_at: Instant,
}

impl PendingRequest {
    /// Get the age of the request
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Correlates tunnel responses with the requests waiting for them
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: DashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request id and get the receiver its response will arrive on
    pub fn register(&self, id: &str) -> oneshot::Receiver<ResponsePayload> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(
            id.to_string(),
            PendingRequest {
                tx,
                created_at: Instant::now(),
            },
        );
        rx
    }

    /// Deliver a response; returns false when nobody is waiting any more
    pub fn complete(&self, id: &str, payload: ResponsePayload) -> bool {
        match self.inner.remove(id) {
            Some((_, pending)) => {
                debug!("Completing request {} after {:?}", id, pending.age());
                pending.tx.send(payload).is_ok()
            }
            None => false,
        }
    }

    pub fn cancel(&self, id: &str) {
        self.inner.remove(id);
    }

    /// Await a registered response, dropping the registration on timeout
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<ResponsePayload>,
        timeout: Duration,
    ) -> Result<ResponsePayload> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => {
                self.cancel(id);
                Err(BrokerError::ConnectionError(
                    "Tunnel closed before response".to_string(),
                ))
            }
            Err(_) => {
                self.cancel(id);
                Err(BrokerError::UpstreamTimeout { buffered_bytes: 0 })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
