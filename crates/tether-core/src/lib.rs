//! # tether-core
//!
//! Pure protocol code for tether: the WebSocket (RFC 6455) frame codec,
//! payload masking, close-frame payloads and the HTTP/1.1 opening handshake.
//!
//! Nothing in this crate touches a socket.  Every function works on byte
//! slices so that `tether-net` (blocking endpoints, multiplexer) and the test
//! suites can share exactly the same encoding rules.
//!
//! # Architecture overview
//!
//! - **`protocol::frame`** – decode one frame from a byte buffer (returning how
//!   many more bytes are needed when the buffer is short), encode a frame or a
//!   byte range of its payload, and split a message into size-bounded
//!   fragments.
//! - **`protocol::mask`** – the 32-bit XOR masking applied to client payloads,
//!   resumable at any byte offset.
//! - **`protocol::close`** – status code + UTF-8 reason carried by Close frames.
//! - **`protocol::handshake`** – `Sec-WebSocket-Key` / `Sec-WebSocket-Accept`
//!   computation, request/response header blocks and `ws://` URLs.

pub mod protocol;

pub use protocol::close::{CloseCode, CloseReason};
pub use protocol::frame::{
    decode_frame, encode_fragments, encode_message, Frame, FrameError, FrameRef, Opcode,
};
pub use protocol::handshake::{
    compute_acceptance_key, generate_websocket_key, HandshakeError, HandshakeRequest,
    HandshakeResponse, HeaderMap, WsUrl, RESUMED_HEADER, SESSION_HEADER,
};
pub use protocol::mask::{apply_masking_key, generate_masking_key};
