use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderBlockError {
    #[error("header block truncated")]
    Truncated,
    #[error("header name is not valid UTF-8")]
    InvalidName,
    #[error("trailing bytes after header block")]
    Trailing,
}

/// An ordered list of header fields, the payload of a `HEADERS` frame.
///
/// Request heads carry the pseudo fields `:method`, `:scheme`, `:authority` and `:path`,
/// response heads carry `:status`. Layout: `u16` field count, then per field a `u16`
/// length-prefixed name and a `u32` length-prefixed value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    fields: Vec<(String, Bytes)>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field. Names are stored lower-cased.
    pub fn push(&mut self, name: &str, value: impl Into<Bytes>) {
        self.fields.push((name.to_ascii_lowercase(), value.into()));
    }

    /// Builder variant of [`HeaderBlock::push`].
    pub fn with(mut self, name: &str, value: impl Into<Bytes>) -> Self {
        self.push(name, value);
        self
    }

    /// Returns the first value of `name`.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.fields.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v)
    }

    /// Returns the first value of `name` as a string, if it is valid UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Iterates over the regular (non-pseudo) fields.
    pub fn regular(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.fields.iter().filter(|(n, _)| !n.starts_with(':')).map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let size: usize = self.fields.iter().map(|(n, v)| 6 + n.len() + v.len()).sum();
        let mut dst = BytesMut::with_capacity(2 + size);

        // Header names and field counts are bounded well below u16::MAX by the HTTP parsers.
        dst.put_u16(self.fields.len() as u16);
        for (name, value) in &self.fields {
            dst.put_u16(name.len() as u16);
            dst.put_slice(name.as_bytes());
            dst.put_u32(value.len() as u32);
            dst.put_slice(value);
        }

        dst.freeze()
    }

    pub fn decode(mut src: Bytes) -> Result<Self, HeaderBlockError> {
        let count = read_u16(&mut src)?;
        let mut fields = Vec::with_capacity(count.min(64) as usize);

        for _ in 0..count {
            let len = read_u16(&mut src)? as usize;
            let name = take(&mut src, len)?;
            let name = String::from_utf8(name.to_vec()).map_err(|_| HeaderBlockError::InvalidName)?;

            let len = read_u32(&mut src)? as usize;
            let value = take(&mut src, len)?;

            fields.push((name, value));
        }

        if src.has_remaining() {
            return Err(HeaderBlockError::Trailing);
        }

        Ok(Self { fields })
    }
}

fn read_u16(src: &mut Bytes) -> Result<u16, HeaderBlockError> {
    if src.remaining() < 2 {
        return Err(HeaderBlockError::Truncated);
    }
    Ok(src.get_u16())
}

fn read_u32(src: &mut Bytes) -> Result<u32, HeaderBlockError> {
    if src.remaining() < 4 {
        return Err(HeaderBlockError::Truncated);
    }
    Ok(src.get_u32())
}

fn take(src: &mut Bytes, len: usize) -> Result<Bytes, HeaderBlockError> {
    if src.remaining() < len {
        return Err(HeaderBlockError::Truncated);
    }
    Ok(src.split_to(len))
}
