use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use wpr_common::constants::MiB;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_SIZE: u32 = 16 * MiB;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Invalid frame kind: {0}")]
    Kind(u8),
    #[error("Frame too large: {0} bytes")]
    TooLarge(u32),
}

/// Frame flags.
pub mod flags {
    /// The sender will send no more frames on this stream.
    pub const END_STREAM: u8 = 0x01;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    /// Carries an encoded [`crate::HeaderBlock`].
    Headers = 0x01,
    /// Carries body bytes.
    Data = 0x02,
    /// Aborts the stream. The payload is a UTF-8 reason.
    Reset = 0x03,
}

impl TryFrom<u8> for Kind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Headers),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::Reset),
            other => Err(Error::Kind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: Header,
    /// The frame payload.
    payload: Bytes,
}

impl Frame {
    /// Creates a new frame. Payloads above [`MAX_FRAME_SIZE`] are rejected by the encoder.
    pub fn new(stream_id: u32, kind: Kind, flags: u8, payload: Bytes) -> Self {
        Self {
            header: Header {
                stream_id,
                kind,
                flags,
                size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            },
            payload,
        }
    }

    pub fn headers(stream_id: u32, block: Bytes, end_stream: bool) -> Self {
        Self::new(stream_id, Kind::Headers, end_flag(end_stream), block)
    }

    pub fn data(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        Self::new(stream_id, Kind::Data, end_flag(end_stream), data)
    }

    pub fn reset(stream_id: u32, reason: &str) -> Self {
        let reason = Bytes::copy_from_slice(reason.as_bytes());
        Self::new(stream_id, Kind::Reset, flags::END_STREAM, reason)
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    #[inline]
    pub fn kind(&self) -> Kind {
        self.header.kind
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    #[inline]
    pub fn is_end_stream(&self) -> bool {
        self.header.flags & flags::END_STREAM != 0
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

const fn end_flag(end_stream: bool) -> u8 {
    if end_stream {
        flags::END_STREAM
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    stream_id: u32,
    kind: Kind,
    flags: u8,
    /// The size of the payload.
    size: u32,
}

impl Header {
    /// Returns the length of the header in bytes.
    #[inline]
    const fn len() -> usize {
        10
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Header,
    Payload(Header),
}

#[derive(Debug, Default)]
pub struct Codec {
    /// The current state of the decoder.
    state: State,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Header => {
                    if src.len() < Header::len() {
                        return Ok(None);
                    }

                    let stream_id = src.get_u32();
                    let kind = Kind::try_from(src.get_u8())?;
                    let flags = src.get_u8();
                    let size = src.get_u32();

                    if size > MAX_FRAME_SIZE {
                        return Err(Error::TooLarge(size));
                    }

                    src.reserve(size as usize);
                    self.state = State::Payload(Header { stream_id, kind, flags, size });
                }
                State::Payload(header) => {
                    if src.len() < header.size as usize {
                        return Ok(None);
                    }

                    let payload = src.split_to(header.size as usize).freeze();

                    self.state = State::Header;
                    return Ok(Some(Frame { header, payload }));
                }
            }
        }
    }
}

impl Encoder<Frame> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.header.size > MAX_FRAME_SIZE {
            return Err(Error::TooLarge(item.header.size));
        }

        dst.reserve(Header::len() + item.payload.len());

        dst.put_u32(item.header.stream_id);
        dst.put_u8(item.header.kind as u8);
        dst.put_u8(item.header.flags);
        dst.put_u32(item.header.size);
        dst.put(item.payload);

        Ok(())
    }
}
