use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProxyError, Result};

/// Length prefix (4 bytes) plus command byte.
pub const HEADER_LEN: usize = 5;

/// Default ceiling on a frame body; anything larger is treated as a
/// desynchronized stream.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Proxy to worker (and client to proxy): run this job
    Task = 1,
    /// Worker to proxy (and proxy to client): job result
    TaskDone = 2,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Command::Task),
            2 => Ok(Command::TaskDone),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Task => write!(f, "TASK"),
            Command::TaskDone => write!(f, "TASK_DONE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command, body: impl Into<Bytes>) -> Self {
        Self {
            command,
            body: body.into(),
        }
    }

    pub fn task(body: impl Into<Bytes>) -> Self {
        Self::new(Command::Task, body)
    }

    pub fn task_done(body: impl Into<Bytes>) -> Self {
        Self::new(Command::TaskDone, body)
    }

    /// Size of this frame on the wire
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }
}

/// Outcome of a single [`unpack`] attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unpacked {
    /// Not enough bytes for a full frame yet; nothing was consumed.
    NeedMore,
    /// A complete frame, plus the exact number of bytes it occupied.
    Frame { frame: Frame, consumed: usize },
    /// The header is implausible. The caller must discard its buffer.
    Corrupt(String),
}

/// Try to decode one frame from the front of `buf`.
///
/// The header is validated as soon as it is available, so a strict prefix
/// of a well-formed frame always yields [`Unpacked::NeedMore`].
pub fn unpack(buf: &[u8], max_frame_len: usize) -> Unpacked {
    if buf.len() < HEADER_LEN {
        return Unpacked::NeedMore;
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_frame_len {
        return Unpacked::Corrupt(format!(
            "declared body length {} exceeds limit {}",
            len, max_frame_len
        ));
    }

    let command = match Command::try_from(buf[4]) {
        Ok(command) => command,
        Err(byte) => return Unpacked::Corrupt(format!("unknown command byte {:#04x}", byte)),
    };

    let total = HEADER_LEN + len;
    if buf.len() < total {
        return Unpacked::NeedMore;
    }

    Unpacked::Frame {
        frame: Frame {
            command,
            body: Bytes::copy_from_slice(&buf[HEADER_LEN..total]),
        },
        consumed: total,
    }
}

/// Append the wire encoding of `frame` to `dst`.
pub fn pack_into(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(frame.body.len()).map_err(|_| ProxyError::FrameTooLarge {
        len: frame.body.len(),
        max: u32::MAX as usize,
    })?;

    dst.reserve(frame.encoded_len());
    dst.put_u32(len);
    dst.put_u8(frame.command as u8);
    dst.extend_from_slice(&frame.body);
    Ok(())
}

/// Encode `frame` into a standalone buffer.
pub fn pack(frame: &Frame) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    pack_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian_length_then_command() {
        let packed = pack(&Frame::task(&b"abc"[..])).unwrap();
        assert_eq!(&packed[..], &[0, 0, 0, 3, 1, b'a', b'b', b'c']);
    }

    #[test]
    fn empty_body_round_trips() {
        let frame = Frame::task_done(Bytes::new());
        let packed = pack(&frame).unwrap();
        assert_eq!(packed.len(), HEADER_LEN);
        assert_eq!(
            unpack(&packed, DEFAULT_MAX_FRAME_LEN),
            Unpacked::Frame {
                frame,
                consumed: HEADER_LEN
            }
        );
    }

    #[test]
    fn short_header_needs_more() {
        assert_eq!(unpack(&[], DEFAULT_MAX_FRAME_LEN), Unpacked::NeedMore);
        assert_eq!(unpack(&[0, 0, 0, 1], DEFAULT_MAX_FRAME_LEN), Unpacked::NeedMore);
    }

    #[test]
    fn oversized_length_is_corrupt() {
        let buf = [0xff, 0xff, 0xff, 0xff, 1];
        assert!(matches!(unpack(&buf, 1024), Unpacked::Corrupt(_)));
    }

    #[test]
    fn unknown_command_is_corrupt() {
        let buf = [0, 0, 0, 0, 9];
        assert!(matches!(
            unpack(&buf, DEFAULT_MAX_FRAME_LEN),
            Unpacked::Corrupt(_)
        ));
    }

    #[test]
    fn only_first_frame_is_consumed() {
        let mut buf = BytesMut::new();
        pack_into(&Frame::task(&b"one"[..]), &mut buf).unwrap();
        pack_into(&Frame::task_done(&b"two"[..]), &mut buf).unwrap();

        match unpack(&buf, DEFAULT_MAX_FRAME_LEN) {
            Unpacked::Frame { frame, consumed } => {
                assert_eq!(frame, Frame::task(&b"one"[..]));
                assert_eq!(consumed, HEADER_LEN + 3);
            }
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn command_display() {
        assert_eq!(Command::Task.to_string(), "TASK");
        assert_eq!(Command::TaskDone.to_string(), "TASK_DONE");
        assert_eq!(Command::try_from(3), Err(3));
    }
}
