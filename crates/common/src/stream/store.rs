use bytes::Bytes;
use dashmap::DashMap;
use futures_util::Stream;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::framing::StreamHead;
use super::handler::StreamResponseHandler;
use crate::constants::{STREAM_BUFFER_CHUNKS, STREAM_CHECK_PERIOD_SECS, STREAM_TTL_SECS};
use crate::error::BrokerError;

pub type BodyItem = Result<Bytes, BrokerError>;

/// State of one in-flight streamed response
#[derive(Debug)]
pub(crate) struct StreamRecord {
    pub(crate) head_tx: Mutex<Option<oneshot::Sender<StreamHead>>>,
    pub(crate) body_tx: mpsc::Sender<BodyItem>,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) broker_app_client_id: Option<String>,
    created_at: Instant,
}

/// Destination side of a stream: the head, then body chunks until the sender closes
#[derive(Debug)]
pub struct StreamReceiver {
    pub head: oneshot::Receiver<StreamHead>,
    pub body: mpsc::Receiver<BodyItem>,
}

impl StreamReceiver {
    /// Body chunks as a `Stream`, ending when the stream finishes or aborts
    pub fn into_body_stream(body: mpsc::Receiver<BodyItem>) -> impl Stream<Item = BodyItem> {
        futures_util::stream::unfold(body, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }
}

/// TTL-expiring store of streamed responses keyed by streaming id
#[derive(Debug)]
pub struct StreamStore {
    records: DashMap<String, Arc<StreamRecord>>,
    ttl: Duration,
}

impl Default for StreamStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(STREAM_TTL_SECS))
    }
}

impl StreamStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    /// Create a record for `streaming_id` and return the destination side
    pub fn begin(
        &self,
        streaming_id: &str,
        broker_app_client_id: Option<String>,
    ) -> StreamReceiver {
        let (head_tx, head) = oneshot::channel();
        let (body_tx, body) = mpsc::channel(STREAM_BUFFER_CHUNKS);

        let record = StreamRecord {
            head_tx: Mutex::new(Some(head_tx)),
            body_tx,
            bytes_written: AtomicU64::new(0),
            broker_app_client_id,
            created_at: Instant::now(),
        };
        self.records
            .insert(streaming_id.to_string(), Arc::new(record));
        debug!(streaming_id = %streaming_id, "Stream registered");

        StreamReceiver { head, body }
    }

    /// Writer for a live stream; expired records are treated as absent
    pub fn handler(&self, streaming_id: &str) -> Option<StreamResponseHandler<'_>> {
        let record = self.records.get(streaming_id)?.value().clone();
        if record.created_at.elapsed() > self.ttl {
            self.records.remove(streaming_id);
            debug!(streaming_id = %streaming_id, "Stream expired");
            return None;
        }
        Some(StreamResponseHandler::new(streaming_id, record, self))
    }

    pub fn contains(&self, streaming_id: &str) -> bool {
        self.records
            .get(streaming_id)
            .is_some_and(|r| r.created_at.elapsed() <= self.ttl)
    }

    pub(crate) fn remove(&self, streaming_id: &str) {
        self.records.remove(streaming_id);
    }

    /// Drop expired records, returning how many were removed
    pub fn sweep(&self) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.created_at.elapsed() <= self.ttl);
        before - self.records.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(STREAM_CHECK_PERIOD_SECS));
            loop {
                interval.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    debug!("Swept {} expired streams", removed);
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
