//! Stateless codec for WebSocket frames (RFC 6455 §5.2).
//!
//! Wire format:
//! ```text
//! [FIN:1][RSV1:1][RSV2:1][RSV3:1][opcode:4][MASK:1][len7:7]
//! [len16:16 if len7 == 126 | len64:64 if len7 == 127]
//! [masking key:32 if MASK]
//! [payload:len]
//! ```
//! All multi-byte integers are big-endian.
//!
//! Decoding never copies: [`decode_frame`] returns a [`FrameRef`] whose
//! payload borrows from the input buffer and is still masked.  When the buffer
//! is too short it reports how many more bytes are required and consumes
//! nothing, so callers can simply append more input and call again.

use std::ops::Range;

use thiserror::Error;

use crate::protocol::mask::{apply_masking_key, generate_masking_key};

/// Largest payload a control frame (Close, Ping, Pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

const BASE_HEADER_LEN: usize = 2;
const MASKING_KEY_LEN: usize = 4;

/// Errors produced while decoding or encoding frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ends inside the frame header.
    #[error("incomplete frame header: {needed} more bytes required")]
    NeedMoreHeaderBytes { needed: usize },

    /// The header is complete but the payload is not.
    #[error("incomplete frame payload: {needed} more bytes required")]
    NeedMorePayloadBytes { needed: u64 },

    /// The header violates the framing rules; the connection cannot continue.
    #[error("incorrect frame header: {0}")]
    HeaderIncorrect(&'static str),

    /// The caller asked for something the framing rules cannot express.
    #[error("invalid frame parameter: {0}")]
    InvalidParameter(&'static str),

    /// A Close frame payload is not a valid status code + UTF-8 reason.
    #[error("invalid close payload: {0}")]
    InvalidClosePayload(&'static str),
}

impl FrameError {
    /// Returns `true` for the two "need more bytes" outcomes, which are not
    /// failures: the caller should read more input and retry.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            Self::NeedMoreHeaderBytes { .. } | Self::NeedMorePayloadBytes { .. }
        )
    }

    /// Number of additional bytes required, when the error is an incomplete-input
    /// outcome.
    pub fn needed(&self) -> Option<u64> {
        match self {
            Self::NeedMoreHeaderBytes { needed } => Some(*needed as u64),
            Self::NeedMorePayloadBytes { needed } => Some(*needed),
            _ => None,
        }
    }
}

/// Frame opcodes defined by RFC 6455.  Reserved values are rejected on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Converts the low nibble of the first header byte into an opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Control opcodes have the high bit of the nibble set.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

// ── Owned frame (encoding side) ───────────────────────────────────────────────

/// A frame with an owned, unmasked payload.
///
/// When `masking_key` is set, [`Frame::encode`] masks the payload on the wire;
/// the struct itself always holds plain bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub masking_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A final, unmasked frame with no reserved bits.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masking_key: None,
            payload: payload.into(),
        }
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn with_masking_key(mut self, key: Option<[u8; 4]>) -> Self {
        self.masking_key = key;
        self
    }

    /// Encodes the whole frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidParameter`] for control frames that are
    /// fragmented or carry more than [`MAX_CONTROL_PAYLOAD`] bytes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tether_core::{decode_frame, Frame, Opcode};
    ///
    /// let frame = Frame::new(Opcode::Text, "Hello").with_masking_key(Some([1, 2, 3, 4]));
    /// let bytes = frame.encode().unwrap();
    /// let (decoded, consumed) = decode_frame(&bytes, true).unwrap();
    /// assert_eq!(consumed, bytes.len());
    /// assert_eq!(decoded.to_frame(), frame);
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        self.encode_range(0..self.payload.len())
    }

    /// Encodes a frame carrying only `payload[range]`, with this frame's flags,
    /// opcode and masking key.  The header declares the length of the range.
    pub fn encode_range(&self, range: Range<usize>) -> Result<Vec<u8>, FrameError> {
        let chunk = self
            .payload
            .get(range)
            .ok_or(FrameError::InvalidParameter("payload range out of bounds"))?;
        let mut out = Vec::with_capacity(header_len(chunk.len(), self.masking_key.is_some()) + chunk.len());
        write_frame(
            &mut out,
            self.fin,
            [self.rsv1, self.rsv2, self.rsv3],
            self.opcode,
            self.masking_key,
            chunk,
        )?;
        Ok(out)
    }
}

// ── Borrowed frame (decoding side) ────────────────────────────────────────────

/// A decoded frame borrowing its payload from the input buffer.
///
/// `payload` is exactly what was on the wire: if `masking_key` is set, the
/// bytes are still masked.  Use [`FrameRef::unmasked_payload`] to get plain
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub masking_key: Option<[u8; 4]>,
    pub payload: &'a [u8],
}

impl FrameRef<'_> {
    /// Copies the payload out of the buffer and removes the masking.
    pub fn unmasked_payload(&self) -> Vec<u8> {
        let mut data = self.payload.to_vec();
        if let Some(key) = self.masking_key {
            apply_masking_key(&mut data, key, 0);
        }
        data
    }

    pub fn to_frame(&self) -> Frame {
        Frame {
            fin: self.fin,
            rsv1: self.rsv1,
            rsv2: self.rsv2,
            rsv3: self.rsv3,
            opcode: self.opcode,
            masking_key: self.masking_key,
            payload: self.unmasked_payload(),
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes it occupies (header + payload).
/// With `strict` set, length fields that are not minimally encoded and RSV
/// bits (no extensions are ever negotiated) are rejected.
///
/// # Errors
///
/// - [`FrameError::NeedMoreHeaderBytes`] / [`FrameError::NeedMorePayloadBytes`]
///   when `bytes` holds only part of a frame; nothing is consumed.
/// - [`FrameError::HeaderIncorrect`] for reserved opcodes, fragmented or
///   oversized control frames, and invalid length encodings.
pub fn decode_frame(bytes: &[u8], strict: bool) -> Result<(FrameRef<'_>, usize), FrameError> {
    if bytes.len() < BASE_HEADER_LEN {
        return Err(FrameError::NeedMoreHeaderBytes {
            needed: BASE_HEADER_LEN - bytes.len(),
        });
    }

    let first = bytes[0];
    let second = bytes[1];
    let fin = first & 0x80 != 0;
    let rsv1 = first & 0x40 != 0;
    let rsv2 = first & 0x20 != 0;
    let rsv3 = first & 0x10 != 0;
    let opcode = Opcode::from_u8(first & 0x0F).ok_or(FrameError::HeaderIncorrect("reserved opcode"))?;

    if strict && (rsv1 || rsv2 || rsv3) {
        return Err(FrameError::HeaderIncorrect(
            "reserved bits set without a negotiated extension",
        ));
    }

    let masked = second & 0x80 != 0;
    let len7 = second & 0x7F;
    let extended_len = match len7 {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let header_len = BASE_HEADER_LEN + extended_len + if masked { MASKING_KEY_LEN } else { 0 };
    if bytes.len() < header_len {
        return Err(FrameError::NeedMoreHeaderBytes {
            needed: header_len - bytes.len(),
        });
    }

    let payload_len: u64 = match len7 {
        126 => {
            let len = u64::from(u16::from_be_bytes([bytes[2], bytes[3]]));
            if strict && len <= MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::HeaderIncorrect("non-minimal 16-bit payload length"));
            }
            len
        }
        127 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(FrameError::HeaderIncorrect(
                    "64-bit payload length has the most significant bit set",
                ));
            }
            if strict && len <= u64::from(u16::MAX) {
                return Err(FrameError::HeaderIncorrect("non-minimal 64-bit payload length"));
            }
            len
        }
        short => u64::from(short),
    };

    if opcode.is_control() {
        if !fin {
            return Err(FrameError::HeaderIncorrect("fragmented control frame"));
        }
        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::HeaderIncorrect("control frame payload exceeds 125 bytes"));
        }
    }

    let masking_key = masked.then(|| {
        let at = BASE_HEADER_LEN + extended_len;
        [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]
    });

    let available = (bytes.len() - header_len) as u64;
    if available < payload_len {
        return Err(FrameError::NeedMorePayloadBytes {
            needed: payload_len - available,
        });
    }

    // payload_len <= available, so it fits in usize.
    let end = header_len + payload_len as usize;
    let frame = FrameRef {
        fin,
        rsv1,
        rsv2,
        rsv3,
        opcode,
        masking_key,
        payload: &bytes[header_len..end],
    };
    Ok((frame, end))
}

/// Size of the header needed for a payload of `payload_len` bytes.
pub fn header_len(payload_len: usize, masked: bool) -> usize {
    let extended = if payload_len <= MAX_CONTROL_PAYLOAD {
        0
    } else if payload_len <= usize::from(u16::MAX) {
        2
    } else {
        8
    };
    BASE_HEADER_LEN + extended + if masked { MASKING_KEY_LEN } else { 0 }
}

/// Largest payload that fits in one frame of at most `max_frame_size` bytes
/// on the wire, accounting for the length encoding and the masking key.
///
/// # Errors
///
/// Returns [`FrameError::InvalidParameter`] when `max_frame_size` cannot hold
/// even a one-byte payload.
pub fn max_payload_per_frame(max_frame_size: usize, masked: bool) -> Result<usize, FrameError> {
    let key = if masked { MASKING_KEY_LEN } else { 0 };
    let short = max_frame_size
        .checked_sub(BASE_HEADER_LEN + key)
        .filter(|len| *len > 0)
        .ok_or(FrameError::InvalidParameter("maximum frame size cannot carry any payload"))?;
    if short <= MAX_CONTROL_PAYLOAD {
        return Ok(short);
    }
    let medium = max_frame_size - (BASE_HEADER_LEN + 2 + key);
    if medium <= usize::from(u16::MAX) {
        return Ok(medium.max(MAX_CONTROL_PAYLOAD));
    }
    Ok((max_frame_size - (BASE_HEADER_LEN + 8 + key)).max(usize::from(u16::MAX)))
}

/// Splits `payload` into frames no larger than `max_frame_size` bytes.
///
/// The first frame carries `opcode`; every following frame is a
/// continuation.  FIN is set only on the last frame, and only when
/// `is_final` is true (streamed messages pass `false` for all but their last
/// chunk).  With `mask` set, every frame gets a fresh random masking key.
///
/// # Errors
///
/// Returns [`FrameError::InvalidParameter`] when `max_frame_size` is too small,
/// or when a control payload does not fit in a single final frame.
pub fn encode_fragments(
    opcode: Opcode,
    payload: &[u8],
    max_frame_size: usize,
    mask: bool,
    is_final: bool,
) -> Result<Vec<Vec<u8>>, FrameError> {
    let chunk_size = max_payload_per_frame(max_frame_size, mask)?;

    if opcode.is_control() {
        if !is_final {
            return Err(FrameError::InvalidParameter("control frames cannot be fragmented"));
        }
        if payload.len() > chunk_size.min(MAX_CONTROL_PAYLOAD) {
            return Err(FrameError::InvalidParameter(
                "control payload does not fit in a single frame",
            ));
        }
    }

    if payload.is_empty() {
        let mut out = Vec::with_capacity(header_len(0, mask));
        write_frame(&mut out, is_final, [false; 3], opcode, mask.then(generate_masking_key), &[])?;
        return Ok(vec![out]);
    }

    let count = payload.len().div_ceil(chunk_size);
    let mut frames = Vec::with_capacity(count);
    for (index, chunk) in payload.chunks(chunk_size).enumerate() {
        let frame_opcode = if index == 0 { opcode } else { Opcode::Continuation };
        let fin = is_final && index + 1 == count;
        let mut out = Vec::with_capacity(header_len(chunk.len(), mask) + chunk.len());
        write_frame(
            &mut out,
            fin,
            [false; 3],
            frame_opcode,
            mask.then(generate_masking_key),
            chunk,
        )?;
        frames.push(out);
    }
    Ok(frames)
}

/// Encodes a complete message, fragmenting it as needed.
///
/// Equivalent to [`encode_fragments`] with `is_final = true`.
pub fn encode_message(
    opcode: Opcode,
    payload: &[u8],
    max_frame_size: usize,
    mask: bool,
) -> Result<Vec<Vec<u8>>, FrameError> {
    encode_fragments(opcode, payload, max_frame_size, mask, true)
}

// ── Internal helpers ──────────────────────────────────────────────────────────

fn write_frame(
    out: &mut Vec<u8>,
    fin: bool,
    rsv: [bool; 3],
    opcode: Opcode,
    masking_key: Option<[u8; 4]>,
    payload: &[u8],
) -> Result<(), FrameError> {
    if opcode.is_control() {
        if !fin {
            return Err(FrameError::InvalidParameter("control frames cannot be fragmented"));
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::InvalidParameter("control frame payload exceeds 125 bytes"));
        }
    }

    let mut first = opcode as u8;
    if fin {
        first |= 0x80;
    }
    if rsv[0] {
        first |= 0x40;
    }
    if rsv[1] {
        first |= 0x20;
    }
    if rsv[2] {
        first |= 0x10;
    }
    out.push(first);

    let mask_bit = if masking_key.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len <= MAX_CONTROL_PAYLOAD {
        out.push(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match masking_key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_masking_key(&mut out[start..], key, 0);
        }
        None => out.extend_from_slice(payload),
    }
    Ok(())
}
