//! Wire format tests through the public `protocol` API.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use jobbox_proxy::protocol::{
    pack, pack_into, unpack, Command, Frame, JobBoxCodec, Unpacked, DEFAULT_MAX_FRAME_LEN,
    HEADER_LEN,
};
use jobbox_proxy::stats::StatCounter;

fn sample_frames() -> Vec<Frame> {
    vec![
        Frame::task(Bytes::new()),
        Frame::task_done(&b"x"[..]),
        Frame::task(vec![0u8; 1024]),
        Frame::task_done((0..=255u8).collect::<Vec<_>>()),
        Frame::task(vec![0xab; 70_000]),
    ]
}

fn encode_all(frames: &[Frame]) -> BytesMut {
    let mut buf = BytesMut::new();
    for frame in frames {
        pack_into(frame, &mut buf).unwrap();
    }
    buf
}

#[test]
fn test_pack_layout() {
    let bytes = pack(&Frame::task_done(&b"abc"[..])).unwrap();
    assert_eq!(&bytes[..], &[0, 0, 0, 3, 2, b'a', b'b', b'c']);
}

#[test]
fn test_unpack_recovers_every_frame() {
    for frame in sample_frames() {
        let bytes = pack(&frame).unwrap();
        match unpack(&bytes, DEFAULT_MAX_FRAME_LEN) {
            Unpacked::Frame { frame: got, consumed } => {
                assert_eq!(got, frame);
                assert_eq!(consumed, HEADER_LEN + frame.body.len());
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }
}

#[test]
fn test_every_strict_prefix_needs_more() {
    let bytes = pack(&Frame::task((0..64u8).collect::<Vec<_>>())).unwrap();
    for cut in 0..bytes.len() {
        assert_eq!(
            unpack(&bytes[..cut], DEFAULT_MAX_FRAME_LEN),
            Unpacked::NeedMore,
            "prefix of {} bytes",
            cut
        );
    }
}

#[test]
fn test_unpack_consumes_only_first_frame() {
    let frames = sample_frames();
    let buf = encode_all(&frames);

    let mut offset = 0;
    let mut decoded = Vec::new();
    while offset < buf.len() {
        match unpack(&buf[offset..], DEFAULT_MAX_FRAME_LEN) {
            Unpacked::Frame { frame, consumed } => {
                decoded.push(frame);
                offset += consumed;
            }
            other => panic!("unexpected {:?} at offset {}", other, offset),
        }
    }
    assert_eq!(decoded, frames);
}

#[test]
fn test_oversized_length_is_corrupt_before_body_arrives() {
    let mut header = BytesMut::new();
    header.put_u32(1025);
    header.put_u8(Command::Task as u8);
    assert!(matches!(unpack(&header, 1024), Unpacked::Corrupt(_)));
}

#[test]
fn test_unknown_command_is_corrupt() {
    for byte in [0u8, 3, 0x7f, 0xff] {
        let buf = [0, 0, 0, 0, byte];
        assert!(
            matches!(unpack(&buf, DEFAULT_MAX_FRAME_LEN), Unpacked::Corrupt(_)),
            "command byte {:#04x}",
            byte
        );
    }
}

#[tokio::test]
async fn test_framed_read_handles_arbitrary_chunking() {
    let frames = sample_frames();
    let wire = encode_all(&frames).freeze();

    for chunk_size in [1usize, 3, 5, 7, 4096] {
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        let data = wire.clone();
        let writer = tokio::spawn(async move {
            for chunk in data.chunks(chunk_size) {
                tx.write_all(chunk).await.unwrap();
            }
        });

        let mut reader = FramedRead::new(rx, JobBoxCodec::default());
        let mut decoded = Vec::new();
        while let Some(frame) = reader.next().await {
            decoded.push(frame.unwrap());
        }
        writer.await.unwrap();
        assert_eq!(decoded, frames, "chunk size {}", chunk_size);
    }
}

#[tokio::test]
async fn test_framed_read_resynchronizes_after_corruption() {
    let stats = std::sync::Arc::new(StatCounter::new());
    let (mut tx, rx) = tokio::io::duplex(1024);

    let mut reader = FramedRead::new(rx, JobBoxCodec::new(1024).with_stats(stats.clone()));

    tx.write_all(&pack(&Frame::task(&b"one"[..])).unwrap())
        .await
        .unwrap();
    assert_eq!(
        reader.next().await.unwrap().unwrap(),
        Frame::task(&b"one"[..])
    );

    // Garbage header; the reader discards it and waits for fresh input
    tx.write_all(&[0xff, 0xff, 0xff, 0xff, 0x01]).await.unwrap();
    let idle = tokio::time::timeout(std::time::Duration::from_millis(50), reader.next()).await;
    assert!(idle.is_err(), "corrupt header must not yield a frame");

    tx.write_all(&pack(&Frame::task_done(&b"two"[..])).unwrap())
        .await
        .unwrap();
    drop(tx);

    let rest: Vec<Frame> = reader.map(|f| f.unwrap()).collect().await;
    assert_eq!(rest, vec![Frame::task_done(&b"two"[..])]);
    assert_eq!(stats.snapshot().corrupt_frames, 1);
}
