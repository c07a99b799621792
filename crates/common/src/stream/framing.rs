use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::utils::Headers;

const PREFIX_LEN: usize = 4;

/// Status line and headers sent ahead of a streamed body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamHead {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
}

impl StreamHead {
    pub fn new(status: u16, headers: Headers) -> Self {
        Self { status, headers }
    }
}

/// Encode a head as a 4-byte little-endian length followed by its JSON
pub fn encode_head(head: &StreamHead) -> Result<Bytes> {
    let json = serde_json::to_vec(head)?;
    let len = u32::try_from(json.len())
        .map_err(|_| BrokerError::InvalidMessage("stream head too large".to_string()))?;

    let mut buf = BytesMut::with_capacity(PREFIX_LEN + json.len());
    buf.put_u32_le(len);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    Head(StreamHead),
    Body(Bytes),
}

#[derive(Debug)]
enum State {
    Prefix,
    Head(usize),
    Body,
}

/// Incremental reader for a framed stream
///
/// The length prefix and the head may arrive split across any number of pushes.
/// Bytes following the head in the same push are emitted as body.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    buf: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Prefix,
            buf: BytesMut::new(),
        }
    }

    pub fn head_received(&self) -> bool {
        matches!(self.state, State::Body)
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<DecodeEvent>> {
        let mut events = Vec::new();

        if let State::Body = self.state {
            if !chunk.is_empty() {
                events.push(DecodeEvent::Body(Bytes::copy_from_slice(chunk)));
            }
            return Ok(events);
        }

        self.buf.extend_from_slice(chunk);

        if let State::Prefix = self.state {
            if self.buf.len() < PREFIX_LEN {
                return Ok(events);
            }
            let len = self.buf.get_u32_le() as usize;
            self.state = State::Head(len);
        }

        if let State::Head(len) = self.state {
            if self.buf.len() < len {
                return Ok(events);
            }
            let head_bytes = self.buf.split_to(len);
            let head: StreamHead = serde_json::from_slice(&head_bytes)
                .map_err(|e| BrokerError::InvalidMessage(format!("bad stream head: {}", e)))?;
            events.push(DecodeEvent::Head(head));
            self.state = State::Body;

            if !self.buf.is_empty() {
                events.push(DecodeEvent::Body(self.buf.split().freeze()));
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(body: &[u8]) -> (StreamHead, Vec<u8>) {
        let mut headers = Headers::new();
        headers.insert("content-type", "application/json");
        let head = StreamHead::new(201, headers);

        let mut bytes = encode_head(&head).unwrap().to_vec();
        bytes.extend_from_slice(body);
        (head, bytes)
    }

    fn decode_split(bytes: &[u8], cuts: &[usize]) -> (Vec<StreamHead>, Vec<u8>) {
        let mut decoder = FrameDecoder::new();
        let mut heads = Vec::new();
        let mut body = Vec::new();

        let mut start = 0;
        for cut in cuts.iter().copied().chain(std::iter::once(bytes.len())) {
            for event in decoder.push(&bytes[start..cut]).unwrap() {
                match event {
                    DecodeEvent::Head(h) => heads.push(h),
                    DecodeEvent::Body(b) => body.extend_from_slice(&b),
                }
            }
            start = cut;
        }
        (heads, body)
    }

    #[test]
    fn test_prefix_is_little_endian() {
        let head = StreamHead::new(200, Headers::new());
        let encoded = encode_head(&head).unwrap();
        let json_len = encoded.len() - 4;
        assert_eq!(&encoded[..4], &(json_len as u32).to_le_bytes());
    }

    #[test]
    fn test_reassembly_at_every_split_point() {
        let (head, bytes) = framed(b"{\"ok\":true}");

        for cut in 0..=bytes.len() {
            let (heads, body) = decode_split(&bytes, &[cut]);
            assert_eq!(heads, vec![head.clone()], "cut at {}", cut);
            assert_eq!(body, b"{\"ok\":true}", "cut at {}", cut);
        }
    }

    #[test]
    fn test_byte_by_byte() {
        let (head, bytes) = framed(b"abc");
        let cuts: Vec<usize> = (1..bytes.len()).collect();
        let (heads, body) = decode_split(&bytes, &cuts);
        assert_eq!(heads, vec![head]);
        assert_eq!(body, b"abc");
    }

    #[test]
    fn test_malformed_head() {
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{{{");
        assert!(FrameDecoder::new().push(&bytes).is_err());
    }
}
