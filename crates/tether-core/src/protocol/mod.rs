//! WebSocket protocol module: frame codec, masking, close payloads and handshake.

pub mod close;
pub mod frame;
pub mod handshake;
pub mod mask;

pub use close::{CloseCode, CloseReason};
pub use frame::{decode_frame, encode_fragments, encode_message, Frame, FrameError, FrameRef, Opcode};
pub use handshake::{compute_acceptance_key, generate_websocket_key, HandshakeError};
pub use mask::{apply_masking_key, generate_masking_key};
