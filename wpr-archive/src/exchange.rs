use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::Signature;

/// Timing captured while fetching a response from the origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timing {
    /// Time between sending the request and receiving the response head.
    pub server_delay: Duration,
    /// Delay before each body chunk after the first, relative to the previous one.
    pub chunk_delays: Vec<Duration>,
}

/// A response as it was captured from the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedResponse {
    pub status: u16,
    /// Header names and raw values in arrival order, duplicates kept.
    pub headers: Vec<(String, Bytes)>,
    /// Body chunks in the order they were received.
    pub chunks: Vec<Bytes>,
    pub timing: Timing,
}

impl RecordedResponse {
    pub fn new(status: u16) -> Self {
        Self { status, headers: Vec::new(), chunks: Vec::new(), timing: Timing::default() }
    }

    /// Appends a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Appends a body chunk.
    pub fn with_chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.chunks.push(chunk.into());
        self
    }

    /// Returns the first value of the header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v)
    }

    /// Returns the first value of the header `name` as a string, if it is valid UTF-8.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Total body length in bytes.
    pub fn body_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Returns the body as one contiguous buffer.
    pub fn body(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut buf = BytesMut::with_capacity(self.body_len());
                for chunk in chunks {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    /// Returns a copy of this response with `body` as its only chunk. The `content-length`
    /// header is set to the new length and `transfer-encoding` is removed, so the declared
    /// size always matches what is sent. The server delay is kept; chunk delays are dropped.
    pub fn with_body(&self, body: Bytes) -> Self {
        let mut headers: Vec<(String, Bytes)> = self
            .headers
            .iter()
            .filter(|(n, _)| {
                !n.eq_ignore_ascii_case("content-length") &&
                    !n.eq_ignore_ascii_case("transfer-encoding")
            })
            .cloned()
            .collect();

        headers.push(("content-length".to_string(), Bytes::from(body.len().to_string())));

        Self {
            status: self.status,
            headers,
            chunks: if body.is_empty() { Vec::new() } else { vec![body] },
            timing: Timing { server_delay: self.timing.server_delay, chunk_delays: Vec::new() },
        }
    }

    /// Approximate in-memory size, used for the archive size limit.
    pub(crate) fn size_hint(&self) -> usize {
        let headers: usize = self.headers.iter().map(|(n, v)| n.len() + v.len()).sum();
        headers + self.body_len()
    }
}

/// One recorded request/response pair. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub signature: Signature,
    pub response: RecordedResponse,
    /// UNIX timestamp in microseconds at which the exchange was captured.
    pub recorded_at: u64,
}

impl Exchange {
    pub fn new(signature: Signature, response: RecordedResponse) -> Self {
        Self { signature, response, recorded_at: wpr_common::unix_micros() }
    }

    pub(crate) fn size_hint(&self) -> usize {
        self.signature.body.len() + self.response.size_hint()
    }
}
