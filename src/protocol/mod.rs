//! Wire framing shared by client and worker connections.
//!
//! Every message is a `JobBox` frame: a 4-byte big-endian body length, a
//! 1-byte command, then exactly `length` bytes of opaque body.
//!
//! - [`unpack`] inspects a byte buffer and reports whether a complete frame
//!   is available, how many bytes it used, or that the stream is corrupt.
//! - [`pack`] is its inverse.
//! - [`JobBoxCodec`] adapts both to `tokio_util::codec` for framed streams.

pub mod codec;
pub mod frame;

pub use codec::JobBoxCodec;
pub use frame::{
    pack, pack_into, unpack, Command, Frame, Unpacked, DEFAULT_MAX_FRAME_LEN, HEADER_LEN,
};
