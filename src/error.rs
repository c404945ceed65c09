//! Error handling.

use crate::protocol::frame::coding::Data;
use http::StatusCode;
use std::{borrow::Cow, io, str};
use thiserror::Error;

/// Result type of all session operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible WebSocket errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Input-output error. These are generally unrecoverable and the
    /// session is terminated.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Buffer capacity exhausted.
    #[error("Space limit exceeded: {0}")]
    Capacity(#[from] CapacityError),
    /// Protocol violation. The session recovers into a close handshake
    /// with close code 1002.
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Payload violation: invalid UTF-8 in a text message or a close
    /// reason. Recovered into a close handshake with close code 1007.
    #[error("UTF-8 encoding error: {0}")]
    Utf8(Cow<'static, str>),
    /// The opening handshake was rejected. Carries the HTTP status to
    /// answer with before the TCP connection is dropped.
    #[error("HTTP handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    /// Internal session error. Closes the connection with close code 1011.
    #[error("Internal session error: {0}")]
    Internal(Cow<'static, str>),
    /// Recoverable session error. Logged, the frame parser is reset and
    /// processing continues.
    #[error("Recoverable session error: {0}")]
    Soft(Cow<'static, str>),
    /// Unrecoverable session error. The TCP connection is dropped without
    /// a close handshake.
    #[error("Fatal session error: {0}")]
    Fatal(Cow<'static, str>),
    /// Attack attempt detected during the opening handshake.
    #[error("Attack attempt detected")]
    AttackAttempt,
}

impl From<str::Utf8Error> for Error {
    fn from(_: str::Utf8Error) -> Self {
        Error::Utf8("invalid byte sequence".into())
    }
}

/// Indicates the specific type/cause of a protocol error.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProtocolError {
    /// Reserved bits in frame header are non-zero.
    #[error("Reserved bits are non-zero")]
    NonZeroReservedBits,
    /// Encountered an invalid opcode.
    #[error("Encountered invalid opcode: {0}")]
    InvalidOpcode(u8),
    /// Control frames must not be fragmented.
    #[error("Fragmented control frame")]
    FragmentedControlFrame,
    /// Control frames must have a payload of 125 bytes or less.
    #[error("Control frame too big (payload must be 125 bytes or less)")]
    ControlFrameTooBig,
    /// The server must close the connection when an unmasked frame is received.
    #[error("Received an unmasked frame from client")]
    UnmaskedFrameFromClient,
    /// The client must close the connection when a masked frame is received.
    #[error("Received a masked frame from server")]
    MaskedFrameFromServer,
    /// The most significant bit of a 64-bit payload length must be zero.
    #[error("Invalid payload length (high bit set)")]
    InvalidPayloadLength,
    /// The payload for the closing frame is invalid.
    #[error("Invalid close sequence")]
    InvalidCloseSequence,
    /// Received a continue frame despite there being nothing to continue.
    #[error("Continue frame but nothing to continue")]
    UnexpectedContinueFrame,
    /// Received data while waiting for more fragments.
    #[error("While waiting for more fragments received: {0}")]
    ExpectedFragment(Data),
    /// Connection closed without performing the closing handshake.
    #[error("Connection reset without closing handshake")]
    ResetWithoutClosingHandshake,
}

/// Indicates the specific type/cause of a capacity error.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum CapacityError {
    /// Message is bigger than the maximum allowed size.
    #[error("Message too long: {size} > {max_size}")]
    MessageTooLong {
        /// The size of the message.
        size: usize,
        /// The maximum allowed message size.
        max_size: usize,
    },
    /// Frame is bigger than the maximum allowed size.
    #[error("Frame too long: {size} > {max_size}")]
    FrameTooLong {
        /// The size of the frame payload.
        size: usize,
        /// The maximum allowed frame payload size.
        max_size: usize,
    },
}

/// The opening handshake was rejected with an HTTP error status.
///
/// Codes below 400 would turn a rejection into a success; they are coerced
/// to 500 on construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}")]
pub struct HandshakeError {
    /// The HTTP status to reply with (always >= 400).
    pub code: StatusCode,
    /// Optional reason overriding the canonical reason phrase.
    pub reason: Option<Cow<'static, str>>,
}

impl HandshakeError {
    /// Create a handshake rejection from a status code and a reason.
    pub fn new(code: u16, reason: impl Into<Cow<'static, str>>) -> Self {
        Self { code: coerce_error_status(code), reason: Some(reason.into()) }
    }

    /// Create a handshake rejection carrying only a status code.
    pub fn from_code(code: u16) -> Self {
        Self { code: coerce_error_status(code), reason: None }
    }

    /// The reason phrase to put on the status line, falling back to the
    /// canonical phrase for the code.
    pub fn reason_phrase(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => self.code.canonical_reason().unwrap_or(""),
        }
    }
}

fn coerce_error_status(code: u16) -> StatusCode {
    match StatusCode::from_u16(code) {
        Ok(status) if status.as_u16() >= 400 => status,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_error_coerces_success_codes() {
        assert_eq!(HandshakeError::from_code(200).code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(HandshakeError::from_code(404).code, StatusCode::NOT_FOUND);
        assert_eq!(HandshakeError::from_code(9999).code, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn handshake_error_reason_fallback() {
        assert_eq!(HandshakeError::from_code(400).reason_phrase(), "Bad Request");
        assert_eq!(HandshakeError::new(403, "go away").reason_phrase(), "go away");
    }
}
