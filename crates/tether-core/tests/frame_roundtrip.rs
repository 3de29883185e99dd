//! Integration tests for the tether-core frame codec.
//!
//! These exercise the public API the way `tether-net` uses it: frames are
//! encoded, concatenated into a byte stream, delivered in arbitrary chunk
//! sizes and decoded back.

use tether_core::{
    decode_frame, encode_message, Frame, FrameError, Opcode,
};

/// Encodes a frame, decodes it, and checks that every byte was consumed.
fn roundtrip(frame: &Frame) -> Frame {
    let bytes = frame.encode().expect("encode must succeed");
    let (decoded, consumed) = decode_frame(&bytes, true).expect("decode must succeed");
    assert_eq!(consumed, bytes.len(), "all bytes must be consumed");
    decoded.to_frame()
}

/// Feeds `stream` to the decoder `chunk` bytes at a time, buffering like a
/// socket reader would, and returns every decoded frame.
fn decode_in_chunks(stream: &[u8], chunk: usize) -> Vec<Frame> {
    let mut buffer = Vec::new();
    let mut frames = Vec::new();
    for piece in stream.chunks(chunk) {
        buffer.extend_from_slice(piece);
        loop {
            match decode_frame(&buffer, true) {
                Ok((frame, consumed)) => {
                    frames.push(frame.to_frame());
                    buffer.drain(..consumed);
                }
                Err(e) if e.is_incomplete() => break,
                Err(e) => panic!("unexpected decode error: {e}"),
            }
        }
    }
    assert!(buffer.is_empty(), "no trailing bytes may remain");
    frames
}

#[test]
fn test_roundtrip_preserves_flags_key_and_payload() {
    let cases = [
        Frame::new(Opcode::Text, "hello"),
        Frame::new(Opcode::Binary, vec![0u8; 200]).with_masking_key(Some([9, 8, 7, 6])),
        Frame::new(Opcode::Binary, vec![0xFF; 70_000]).with_fin(false),
        Frame::new(Opcode::Continuation, Vec::<u8>::new()),
        Frame::new(Opcode::Ping, "ping").with_masking_key(Some([1, 1, 1, 1])),
        Frame::new(Opcode::Close, vec![0x03, 0xE8]),
    ];

    for frame in &cases {
        assert_eq!(&roundtrip(frame), frame);
    }
}

#[test]
fn test_roundtrip_keeps_rsv_bits_in_lenient_mode() {
    let mut frame = Frame::new(Opcode::Binary, "x");
    frame.rsv2 = true;
    let bytes = frame.encode().unwrap();

    assert!(matches!(decode_frame(&bytes, true), Err(FrameError::HeaderIncorrect(_))));
    let (decoded, _) = decode_frame(&bytes, false).unwrap();
    assert_eq!(decoded.to_frame(), frame);
}

#[test]
fn test_fragmented_message_reassembles_exactly() {
    let payload: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();

    let frames = encode_message(Opcode::Binary, &payload, 700, true).unwrap();
    assert!(frames.len() > 1);

    let decoded: Vec<Frame> = frames
        .iter()
        .map(|bytes| decode_frame(bytes, true).unwrap().0.to_frame())
        .collect();

    assert_eq!(decoded[0].opcode, Opcode::Binary);
    assert!(decoded[1..].iter().all(|f| f.opcode == Opcode::Continuation));
    assert!(decoded[..decoded.len() - 1].iter().all(|f| !f.fin));
    assert!(decoded.last().unwrap().fin);
    assert!(decoded.iter().all(|f| f.masking_key.is_some()));

    let joined: Vec<u8> = decoded.into_iter().flat_map(|f| f.payload).collect();
    assert_eq!(joined, payload);
}

#[test]
fn test_decoding_is_independent_of_chunking() {
    let mut stream = Vec::new();
    for frame in encode_message(Opcode::Text, "a fragmented text message".as_bytes(), 10, true).unwrap() {
        stream.extend(frame);
    }
    stream.extend(Frame::new(Opcode::Ping, "p").encode().unwrap());
    stream.extend(Frame::new(Opcode::Binary, vec![3u8; 400]).encode().unwrap());

    let reference = decode_in_chunks(&stream, stream.len());
    for chunk in [1, 2, 3, 7, 64] {
        assert_eq!(decode_in_chunks(&stream, chunk), reference, "chunk size {chunk}");
    }
}

#[test]
fn test_incomplete_input_consumes_nothing() {
    let bytes = Frame::new(Opcode::Binary, vec![1u8; 300]).encode().unwrap();

    for cut in 0..bytes.len() {
        let err = decode_frame(&bytes[..cut], true).unwrap_err();
        assert!(err.is_incomplete(), "cut at {cut}: {err}");
        let needed = err.needed().unwrap() as usize;
        assert!(cut + needed <= bytes.len());
    }
}
