//! Wire formats for the multiplexed replay protocol.
//!
//! Many request/response exchanges share one connection. Each exchange is a stream identified
//! by the `stream_id` chosen by the client: the client sends a [`Kind::Headers`] frame carrying
//! the request head, optional [`Kind::Data`] frames, and sets [`flags::END_STREAM`] on the last
//! one. The server answers on the same stream id the same way, or with a [`Kind::Reset`] frame.

mod block;
pub mod mux;

pub use block::{HeaderBlock, HeaderBlockError};
pub use mux::{flags, Codec, Error, Frame, Kind, MAX_FRAME_SIZE};
