use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProxyError;
use crate::protocol::frame::{pack_into, unpack, Frame, Unpacked, DEFAULT_MAX_FRAME_LEN};
use crate::stats::StatCounter;

/// `tokio_util` codec over [`unpack`]/[`pack_into`].
///
/// A corrupt header discards everything buffered so far and decoding
/// resumes with whatever arrives next; the stream itself stays open.
#[derive(Debug, Clone)]
pub struct JobBoxCodec {
    max_frame_len: usize,
    stats: Option<Arc<StatCounter>>,
}

impl Default for JobBoxCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl JobBoxCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            stats: None,
        }
    }

    /// Count discarded buffers in `stats`.
    pub fn with_stats(mut self, stats: Arc<StatCounter>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Decoder for JobBoxCodec {
    type Item = Frame;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProxyError> {
        match unpack(&src[..], self.max_frame_len) {
            Unpacked::NeedMore => Ok(None),
            Unpacked::Frame { frame, consumed } => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            Unpacked::Corrupt(reason) => {
                tracing::warn!(
                    discarded = src.len(),
                    reason = %reason,
                    "Corrupt frame header, discarding buffer"
                );
                src.clear();
                if let Some(stats) = &self.stats {
                    stats.record_corrupt_frame();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for JobBoxCodec {
    type Error = ProxyError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProxyError> {
        if frame.body.len() > self.max_frame_len {
            return Err(ProxyError::FrameTooLarge {
                len: frame.body.len(),
                max: self.max_frame_len,
            });
        }
        pack_into(&frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn decodes_frames_split_across_reads() {
        let mut codec = JobBoxCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(Frame::task(&b"hello"[..]), &mut wire).unwrap();

        let mut buf = BytesMut::new();
        buf.put_slice(&wire[..3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.put_slice(&wire[3..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::task(&b"hello"[..]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn corrupt_header_clears_buffer_and_counts() {
        let stats = Arc::new(StatCounter::new());
        let mut codec = JobBoxCodec::new(8).with_stats(stats.clone());
        let mut buf = BytesMut::from(&[0u8, 0, 1, 0, 1, 7, 7, 7][..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
        assert_eq!(stats.snapshot().corrupt_frames, 1);

        // The stream keeps going once a clean frame arrives
        codec.encode(Frame::task_done(&b"ok"[..]), &mut buf).unwrap();
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::task_done(&b"ok"[..]))
        );
    }

    #[test]
    fn encode_rejects_oversized_body() {
        let mut codec = JobBoxCodec::new(2);
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Frame::task(&b"too long"[..]), &mut dst)
            .unwrap_err();
        assert!(matches!(err, ProxyError::FrameTooLarge { len: 8, max: 2 }));
        assert!(dst.is_empty());
    }
}
