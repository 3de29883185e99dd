//! Close frame payloads (RFC 6455 §5.5.1, §7.4).
//!
//! A Close payload is either empty, or a 2-byte big-endian status code
//! followed by an optional UTF-8 reason.  A single-byte payload is invalid.

use std::fmt;

use crate::protocol::frame::{FrameError, MAX_CONTROL_PAYLOAD};

/// Longest reason text that still fits in a control frame next to the code.
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// A close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: Self = Self(1000);
    pub const GOING_AWAY: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    pub const INVALID_PAYLOAD: Self = Self(1007);
    pub const POLICY_VIOLATION: Self = Self(1008);
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    pub const MANDATORY_EXTENSION: Self = Self(1010);
    pub const INTERNAL_ERROR: Self = Self(1011);

    /// Whether the code may appear in a Close frame on the wire.
    ///
    /// 1005, 1006 and 1015 are reserved for local reporting only; codes below
    /// 1000 and the unassigned 1016–2999 range are never valid.
    pub fn is_sendable(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status code plus human-readable reason carried by a Close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parses an unmasked Close payload.
    ///
    /// Returns `Ok(None)` for an empty payload (no status given).
    ///
    /// # Errors
    ///
    /// [`FrameError::InvalidClosePayload`] for a 1-byte payload, a code that may
    /// not be sent, or a reason that is not UTF-8.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, FrameError> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(FrameError::InvalidClosePayload("close payload of one byte")),
            _ => {
                let code = CloseCode(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_sendable() {
                    return Err(FrameError::InvalidClosePayload("close code not allowed on the wire"));
                }
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| FrameError::InvalidClosePayload("close reason is not UTF-8"))?;
                Ok(Some(Self::new(code, reason)))
            }
        }
    }

    /// Encodes the payload for a Close frame.
    ///
    /// # Errors
    ///
    /// [`FrameError::InvalidClosePayload`] when the code may not be sent or the
    /// reason exceeds [`MAX_CLOSE_REASON`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if !self.code.is_sendable() {
            return Err(FrameError::InvalidClosePayload("close code not allowed on the wire"));
        }
        if self.reason.len() > MAX_CLOSE_REASON {
            return Err(FrameError::InvalidClosePayload("close reason longer than 123 bytes"));
        }
        let mut out = Vec::with_capacity(2 + self.reason.len());
        out.extend_from_slice(&self.code.0.to_be_bytes());
        out.extend_from_slice(self.reason.as_bytes());
        Ok(out)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}
