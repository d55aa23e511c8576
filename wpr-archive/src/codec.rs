//! The archive file format.
//!
//! ```text
//! magic    : [u8; 4]  "WPRA"
//! version  : u16
//! count    : u32
//! record*  : u32 length, then the record
//! ```
//!
//! All integers are big-endian. Strings and byte fields are `u32` length-prefixed, durations
//! are microseconds as `u64`. A file either decodes completely or not at all.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{ArchiveError, Exchange, RecordedResponse, Result, Scheme, Signature, Timing};

pub const MAGIC: &[u8; 4] = b"WPRA";
pub const VERSION: u16 = 1;

/// Encodes the exchanges into a complete archive file.
pub fn encode<'a>(exchanges: impl ExactSizeIterator<Item = &'a Exchange>) -> Bytes {
    let mut dst = BytesMut::with_capacity(1024);

    dst.put_slice(MAGIC);
    dst.put_u16(VERSION);
    dst.put_u32(exchanges.len() as u32);

    let mut record = BytesMut::new();
    for exchange in exchanges {
        record.clear();
        encode_exchange(exchange, &mut record);

        dst.reserve(4 + record.len());
        dst.put_u32(record.len() as u32);
        dst.put_slice(&record);
    }

    dst.freeze()
}

/// Decodes a complete archive file.
pub fn decode(src: Bytes) -> Result<Vec<Exchange>> {
    let mut reader = Reader(src);

    if reader.take(MAGIC.len())?[..] != MAGIC[..] {
        return Err(ArchiveError::Corrupt("bad magic"));
    }

    let version = reader.u16()?;
    if version != VERSION {
        return Err(ArchiveError::UnsupportedVersion { found: version, expected: VERSION });
    }

    let count = reader.u32()? as usize;
    // Every record needs at least its length prefix.
    if count > reader.0.remaining() / 4 {
        return Err(ArchiveError::Corrupt("record count exceeds file size"));
    }

    let mut exchanges = Vec::with_capacity(count);
    for _ in 0..count {
        let record = reader.bytes()?;
        let mut record = Reader(record);
        exchanges.push(decode_exchange(&mut record)?);

        if record.0.has_remaining() {
            return Err(ArchiveError::Corrupt("trailing bytes in record"));
        }
    }

    if reader.0.has_remaining() {
        return Err(ArchiveError::Corrupt("trailing bytes after last record"));
    }

    Ok(exchanges)
}

fn encode_exchange(exchange: &Exchange, dst: &mut BytesMut) {
    let sig = &exchange.signature;
    put_str(dst, &sig.method);
    dst.put_u8(sig.scheme.to_u8());
    put_str(dst, &sig.host);
    put_str(dst, &sig.path);
    match &sig.query {
        Some(query) => {
            dst.put_u8(1);
            put_str(dst, query);
        }
        None => dst.put_u8(0),
    }
    dst.put_u32(sig.headers.len() as u32);
    for (name, value) in &sig.headers {
        put_str(dst, name);
        put_str(dst, value);
    }
    put_bytes(dst, &sig.body);

    dst.put_u64(exchange.recorded_at);

    let response = &exchange.response;
    dst.put_u16(response.status);
    dst.put_u32(response.headers.len() as u32);
    for (name, value) in &response.headers {
        put_str(dst, name);
        put_bytes(dst, value);
    }
    dst.put_u32(response.chunks.len() as u32);
    for chunk in &response.chunks {
        put_bytes(dst, chunk);
    }

    dst.put_u64(wpr_common::duration_micros(response.timing.server_delay));
    dst.put_u32(response.timing.chunk_delays.len() as u32);
    for delay in &response.timing.chunk_delays {
        dst.put_u64(wpr_common::duration_micros(*delay));
    }
}

fn decode_exchange(src: &mut Reader) -> Result<Exchange> {
    let method = src.string()?;
    let scheme = Scheme::from_u8(src.u8()?).ok_or(ArchiveError::Corrupt("unknown scheme"))?;
    let host = src.string()?;
    let path = src.string()?;
    let query = match src.u8()? {
        0 => None,
        1 => Some(src.string()?),
        _ => return Err(ArchiveError::Corrupt("bad query flag")),
    };
    let header_count = src.u32()?;
    let mut headers = std::collections::BTreeMap::new();
    for _ in 0..header_count {
        let name = src.string()?;
        let value = src.string()?;
        headers.insert(name, value);
    }
    let body = src.bytes()?;

    let signature = Signature { method, scheme, host, path, query, headers, body };

    let recorded_at = src.u64()?;

    let status = src.u16()?;
    let header_count = src.u32()?;
    let mut response_headers = Vec::new();
    for _ in 0..header_count {
        let name = src.string()?;
        let value = src.bytes()?;
        response_headers.push((name, value));
    }
    let chunk_count = src.u32()?;
    let mut chunks = Vec::new();
    for _ in 0..chunk_count {
        chunks.push(src.bytes()?);
    }

    let server_delay = Duration::from_micros(src.u64()?);
    let delay_count = src.u32()?;
    let mut chunk_delays = Vec::new();
    for _ in 0..delay_count {
        chunk_delays.push(Duration::from_micros(src.u64()?));
    }

    Ok(Exchange {
        signature,
        response: RecordedResponse {
            status,
            headers: response_headers,
            chunks,
            timing: Timing { server_delay, chunk_delays },
        },
        recorded_at,
    })
}

fn put_str(dst: &mut BytesMut, value: &str) {
    put_bytes(dst, value.as_bytes());
}

fn put_bytes(dst: &mut BytesMut, value: &[u8]) {
    dst.reserve(4 + value.len());
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

/// Bounds-checked reads over the archive buffer.
struct Reader(Bytes);

impl Reader {
    fn ensure(&self, len: usize) -> Result<()> {
        if self.0.remaining() < len {
            return Err(ArchiveError::Corrupt("truncated archive"));
        }

        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        Ok(self.0.split_to(len))
    }

    fn u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.0.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.0.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.0.get_u32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.0.get_u64())
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ArchiveError::Corrupt("invalid utf-8"))
    }
}
