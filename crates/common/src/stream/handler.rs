use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

use super::framing::{DecodeEvent, FrameDecoder, StreamHead};
use super::store::{StreamRecord, StreamStore};
use crate::error::{BrokerError, Result};
use crate::utils::decode_body;

/// Writer side of one streamed response
///
/// Obtained from [`StreamStore::handler`]. `finish` and `abort` remove the record.
pub struct StreamResponseHandler<'a> {
    streaming_id: String,
    record: Arc<StreamRecord>,
    store: &'a StreamStore,
}

impl<'a> StreamResponseHandler<'a> {
    pub(crate) fn new(streaming_id: &str, record: Arc<StreamRecord>, store: &'a StreamStore) -> Self {
        Self {
            streaming_id: streaming_id.to_string(),
            record,
            store,
        }
    }

    pub fn streaming_id(&self) -> &str {
        &self.streaming_id
    }

    pub fn broker_app_client_id(&self) -> Option<&str> {
        self.record.broker_app_client_id.as_deref()
    }

    pub fn bytes_written(&self) -> u64 {
        self.record.bytes_written.load(Ordering::Relaxed)
    }

    /// Deliver status and headers; only the first call has an effect
    pub async fn write_head(&self, head: StreamHead) -> bool {
        let Some(tx) = self.record.head_tx.lock().await.take() else {
            warn!(streaming_id = %self.streaming_id, "Stream head already written");
            return false;
        };
        tx.send(head).is_ok()
    }

    /// Queue a body chunk, waiting for capacity in the bounded sink
    pub async fn write_chunk(&self, chunk: Bytes) -> Result<()> {
        let len = chunk.len() as u64;
        self.record
            .body_tx
            .send(Ok(chunk))
            .await
            .map_err(|_| BrokerError::ConnectionError("destination closed the stream".to_string()))?;
        self.record.bytes_written.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Close the stream normally and return the number of body bytes written
    pub fn finish(self) -> u64 {
        self.store.remove(&self.streaming_id);
        let bytes = self.bytes_written();
        info!(streaming_id = %self.streaming_id, bytes, "Streamed response finished");
        bytes
    }

    /// Close the stream with an error visible to the destination
    pub async fn abort(self, error: BrokerError) {
        self.store.remove(&self.streaming_id);
        warn!(streaming_id = %self.streaming_id, "Aborting stream: {}", error);
        let _ = self.record.body_tx.send(Err(error)).await;
    }

    /// Drain a framed body into this stream, finishing or aborting it
    pub async fn consume<S, E>(self, mut body: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let mut decoder = FrameDecoder::new();

        while let Some(next) = body.next().await {
            let events = match next {
                Ok(bytes) => decoder.push(&bytes),
                Err(e) => Err(BrokerError::ConnectionError(format!("stream error: {}", e))),
            };
            let events = match events {
                Ok(events) => events,
                Err(e) => {
                    let message = e.to_string();
                    self.abort(e).await;
                    return Err(BrokerError::ConnectionError(message));
                }
            };

            for event in events {
                let written = match event {
                    DecodeEvent::Head(head) => {
                        self.write_head(head).await;
                        Ok(())
                    }
                    DecodeEvent::Body(chunk) => self.write_chunk(chunk).await,
                };
                if let Err(e) = written {
                    let message = e.to_string();
                    self.abort(e).await;
                    return Err(BrokerError::ConnectionError(message));
                }
            }
        }

        if !decoder.head_received() {
            let e = BrokerError::InvalidMessage("stream ended before head".to_string());
            let message = e.to_string();
            self.abort(e).await;
            return Err(BrokerError::InvalidMessage(message));
        }

        Ok(self.finish())
    }
}

/// Feed a legacy in-band `chunk` message into the store
///
/// Chunks for unknown or expired streams are dropped. A chunk carrying `error` aborts the stream.
pub async fn handle_legacy_chunk(
    store: &StreamStore,
    streaming_id: &str,
    data: &str,
    finished: bool,
    head: Option<StreamHead>,
    error: Option<String>,
) -> Result<()> {
    let Some(handler) = store.handler(streaming_id) else {
        warn!(streaming_id = %streaming_id, "Trying to write into a closed stream");
        return Ok(());
    };

    if let Some(head) = head {
        handler.write_head(head).await;
    }

    if let Some(error) = error {
        handler.abort(BrokerError::DownstreamUnavailable(error)).await;
        return Ok(());
    }

    let bytes = decode_body(data)?;
    if !bytes.is_empty() {
        handler.write_chunk(Bytes::from(bytes)).await?;
    }

    if finished {
        handler.finish();
    }
    Ok(())
}
